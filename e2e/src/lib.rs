//! End-to-end ONNX export of detection and segmentation checkpoints.
//!
//! A checkpoint is adapted to a canonical output contract, optionally
//! extended with NMS and mask decoding, then persisted, verified and
//! post-processed. The entry point is [`export::run`].
#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_new;

pub mod adapter;
pub mod compose;
pub mod config;
pub mod export;
pub mod metadata;
pub mod step;
pub mod weights;

pub use tract_e2e_graph::TractResult;

pub mod prelude {
    pub use crate::TractResult;
    pub use crate::adapter::{CanonicalOutputs, HeadFlags, ModelAdapter};
    pub use crate::compose::{E2eOutputs, End2End, MaskHead, NmsBackend};
    pub use crate::config::{Device, ExportConfig, RoiAlignType};
    pub use crate::export::{ExportedArtifact, Exporter, Stage};
    pub use crate::step::{StepArtifact, StepOutcome, run_step};
}
