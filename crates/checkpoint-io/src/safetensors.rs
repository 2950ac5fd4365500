use std::borrow::Cow;
use std::fs::File;
use std::path::Path;
use memmap2::Mmap;
use ::safetensors::{Dtype, SafeTensors, View};
use crate::dtype::{tensor_from_safetensors, to_raw_encoding, to_safetensors};
use crate::{Error, StateDict};

/// Reads every tensor of a safetensors file onto the CPU, ordered by name.
pub fn load_safetensors(path: &Path) -> Result<StateDict, Error> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    let st = SafeTensors::deserialize(&mmap)?;
    let mut names = st.names();
    names.sort();
    let mut state_dict = StateDict::new();
    for name in names {
        let view = st.tensor(name)?;
        state_dict.insert(name.clone(), tensor_from_safetensors(name, &view)?);
    }
    Ok(state_dict)
}

struct RawTensor {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl View for RawTensor {
    fn dtype(&self) -> Dtype {
        self.dtype
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// Writes the tensor entries of `state_dict`. safetensors has no place for
/// plain values, so those are left out with a warning.
pub fn save_safetensors(path: &Path, state_dict: &StateDict) -> Result<(), Error> {
    let mut entries = Vec::with_capacity(state_dict.len());
    for (name, value) in state_dict.iter() {
        let Some(tensor) = value.as_tensor() else {
            log::warn!("Not writing {} entry {} to safetensors", value.kind(), name);
            continue;
        };
        entries.push((
            name.to_string(),
            RawTensor {
                dtype: to_safetensors(name, tensor.dtype())?,
                shape: tensor.dims().to_vec(),
                data: to_raw_encoding(name, tensor)?,
            },
        ));
    }
    ::safetensors::serialize_to_file(entries, &None, path)?;
    Ok(())
}
