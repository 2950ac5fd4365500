pub mod convert;
pub mod precision;
pub mod selection;

pub use checkpoint_io::{CheckpointFormat, StateDict, Value};
pub use convert::{convert, run, Conversion, ConvertOptions};
pub use precision::Precision;
pub use selection::{select, Selection, SelectionEvent, SelectionMode};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] checkpoint_io::Error),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("Unknown precision: {0} (expected one of full, fp32, half, fp16, bf16)")]
    UnknownPrecision(String),
    #[error("Cannot cast {kind} entry {key} to {precision}: only tensors are converted")]
    NotATensor {
        key: String,
        kind: &'static str,
        precision: Precision,
    },
    #[error("Unknown convert type: {0} (expected one of full, ema-only, prune, no-ema)")]
    UnknownSelectionMode(String),
}
