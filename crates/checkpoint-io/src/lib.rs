pub mod dtype;
pub mod pickle;
pub mod pth;
pub mod safetensors;
mod state_dict;
pub mod unpickle;

use std::path::Path;

pub use state_dict::{StateDict, Value};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("Safetensors error: {0}")]
    SafeTensor(#[from] ::safetensors::SafeTensorError),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Pickle error: {0}")]
    Pickle(String),
    #[error("Tensor \"{name}\" has unsupported dtype {dtype}")]
    UnsupportedDType { name: String, dtype: String },
    #[error("Tensor \"{name}\" reads past the end of its storage ({storage_bytes} bytes)")]
    TensorOutOfBounds { name: String, storage_bytes: usize },
}

/// On-disk container a state dict is read from or written to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// PyTorch zip archive, state dict wrapped under `"state_dict"` on write.
    Pth,
    /// Flat safetensors archive.
    Safetensors,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext == "safetensors" => CheckpointFormat::Safetensors,
            _ => CheckpointFormat::Pth,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            CheckpointFormat::Pth => "ckpt",
            CheckpointFormat::Safetensors => "safetensors",
        }
    }
}

/// Loads a state dict onto the CPU, picking the reader from the file extension.
pub fn load(path: &Path) -> Result<StateDict, Error> {
    let format = CheckpointFormat::from_path(path);
    log::info!("Loading {:?} checkpoint from {}", format, path.display());
    let state_dict = match format {
        CheckpointFormat::Safetensors => safetensors::load_safetensors(path)?,
        CheckpointFormat::Pth => pth::load_pth(path)?,
    };
    log::info!("Loaded {} entries ({} tensors)", state_dict.len(), state_dict.tensors().count());
    Ok(state_dict)
}

pub fn save(path: &Path, state_dict: &StateDict, format: CheckpointFormat) -> Result<(), Error> {
    log::info!("Writing {} entries to {}", state_dict.len(), path.display());
    match format {
        CheckpointFormat::Safetensors => safetensors::save_safetensors(path, state_dict),
        CheckpointFormat::Pth => pth::save_pth(path, state_dict, true),
    }
}
