//! Data ingestion
//!
//! Record decoders for the supported file formats and the batched dataset stream.

pub mod dataset;
pub mod decoder;

pub use dataset::{DatasetPipeline, DatasetStream, TabularBatch, TabularBatcher};
pub use decoder::{decoder_for, decoder_for_config, Decoder, Record};
