//! Export and inference
//!
//! Versioned serving artifacts and batch scoring with a restored model.

pub mod export;
pub mod inference;

pub use export::{ModelExporter, ServableModel, ServingSignature};
pub use inference::{InferenceResult, InferenceRunner};
