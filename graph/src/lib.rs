//! ONNX graph plumbing for end-to-end detection export: a protobuf model,
//! a node builder, structural validation, rewriting passes and a bridge to
//! the tract runtime.
#[macro_use]
extern crate log;

pub mod builder;
pub mod checker;
pub mod passes;
pub mod pb;
pub mod pb_helpers;
pub mod runtime;

pub use builder::GraphBuilder;
pub use checker::check_model;

pub type TractResult<T> = anyhow::Result<T>;

/// IR version matching an ONNX default-domain opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        _ => 9,
    }
}

pub mod prelude {
    pub use crate::TractResult;
    pub use crate::builder::GraphBuilder;
    pub use crate::pb::tensor_proto::DataType;
    pub use crate::pb::*;
    pub use crate::pb_helpers::*;
}
