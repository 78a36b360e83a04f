//! Graph-to-graph transformations over ONNX protobuf graphs.
pub mod cleanup;
pub mod eval_mode;
pub mod fuse;
pub mod half;
pub mod simplify;
pub mod split;

pub use cleanup::{CleanupStats, cleanup};
pub use eval_mode::to_eval_mode;
pub use fuse::fuse_conv_bn;
pub use half::to_half;
pub use simplify::{SimplifyStats, simplify};
pub use split::{split_as_slices, static_split_sizes};
