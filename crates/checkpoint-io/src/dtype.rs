use candle_core::{DType, Device, Tensor};
use crate::Error;

fn unsupported(name: &str, dtype: impl std::fmt::Debug) -> Error {
    Error::UnsupportedDType {
        name: name.to_string(),
        dtype: format!("{dtype:?}"),
    }
}

/// Element type of a tensor as it is laid out on disk, before it is mapped
/// onto a candle dtype.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoredDType {
    F64,
    F32,
    BF16,
    F16,
    I64,
    I32,
    I16,
    I8,
    U64,
    U32,
    U16,
    U8,
    Bool,
}

impl StoredDType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            StoredDType::F64 | StoredDType::I64 | StoredDType::U64 => 8,
            StoredDType::F32 | StoredDType::I32 | StoredDType::U32 => 4,
            StoredDType::BF16 | StoredDType::F16 | StoredDType::I16 | StoredDType::U16 => 2,
            StoredDType::I8 | StoredDType::U8 | StoredDType::Bool => 1,
        }
    }

    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        Some(match dtype {
            safetensors::Dtype::F64 => StoredDType::F64,
            safetensors::Dtype::F32 => StoredDType::F32,
            safetensors::Dtype::BF16 => StoredDType::BF16,
            safetensors::Dtype::F16 => StoredDType::F16,
            safetensors::Dtype::I64 => StoredDType::I64,
            safetensors::Dtype::I32 => StoredDType::I32,
            safetensors::Dtype::I16 => StoredDType::I16,
            safetensors::Dtype::I8 => StoredDType::I8,
            safetensors::Dtype::U64 => StoredDType::U64,
            safetensors::Dtype::U32 => StoredDType::U32,
            safetensors::Dtype::U16 => StoredDType::U16,
            safetensors::Dtype::U8 => StoredDType::U8,
            safetensors::Dtype::BOOL => StoredDType::Bool,
            _ => return None,
        })
    }

    /// Maps a `torch.<X>Storage` class name.
    pub fn from_torch_storage(class: &str) -> Option<Self> {
        Some(match class {
            "DoubleStorage" => StoredDType::F64,
            "FloatStorage" => StoredDType::F32,
            "BFloat16Storage" => StoredDType::BF16,
            "HalfStorage" => StoredDType::F16,
            "LongStorage" => StoredDType::I64,
            "IntStorage" => StoredDType::I32,
            "ShortStorage" => StoredDType::I16,
            "CharStorage" => StoredDType::I8,
            "ByteStorage" => StoredDType::U8,
            "BoolStorage" => StoredDType::Bool,
            _ => return None,
        })
    }
}

pub fn to_safetensors(name: &str, dtype: DType) -> Result<safetensors::Dtype, Error> {
    match dtype {
        DType::F64 => Ok(safetensors::Dtype::F64),
        DType::F32 => Ok(safetensors::Dtype::F32),
        DType::BF16 => Ok(safetensors::Dtype::BF16),
        DType::F16 => Ok(safetensors::Dtype::F16),
        DType::I64 => Ok(safetensors::Dtype::I64),
        DType::U32 => Ok(safetensors::Dtype::U32),
        DType::U8 => Ok(safetensors::Dtype::U8),
        #[allow(unreachable_patterns)]
        _ => Err(unsupported(name, dtype)),
    }
}

/// Storage class `torch.save` records for tensors of this dtype.
pub fn torch_storage_class(name: &str, dtype: DType) -> Result<&'static str, Error> {
    match dtype {
        DType::F64 => Ok("DoubleStorage"),
        DType::F32 => Ok("FloatStorage"),
        DType::BF16 => Ok("BFloat16Storage"),
        DType::F16 => Ok("HalfStorage"),
        DType::I64 => Ok("LongStorage"),
        DType::U8 => Ok("ByteStorage"),
        _ => Err(unsupported(name, dtype)),
    }
}

fn widen<const N: usize, T>(data: &[u8], from_le: impl Fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|x| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(x);
            from_le(bytes)
        })
        .collect()
}

/// Builds a CPU tensor from contiguous little-endian element data.
///
/// Signed integer types candle has no representation for, and u16, are
/// widened to i64. u64 is widened to f64. Bools are read as u8.
pub fn tensor_from_raw(name: &str, dtype: StoredDType, shape: &[usize], data: &[u8]) -> Result<Tensor, Error> {
    let device = Device::Cpu;
    let native = match dtype {
        StoredDType::F64 => Some(DType::F64),
        StoredDType::F32 => Some(DType::F32),
        StoredDType::BF16 => Some(DType::BF16),
        StoredDType::F16 => Some(DType::F16),
        StoredDType::I64 => Some(DType::I64),
        StoredDType::U32 => Some(DType::U32),
        StoredDType::U8 | StoredDType::Bool => Some(DType::U8),
        _ => None,
    };
    if let Some(native) = native {
        return Ok(Tensor::from_raw_buffer(data, native, shape, &device)?);
    }
    log::debug!("Widening {} from {:?}", name, dtype);
    let tensor = match dtype {
        StoredDType::I8 => Tensor::from_vec(widen(data, |x: [u8; 1]| i8::from_le_bytes(x) as i64), shape, &device)?,
        StoredDType::I16 => Tensor::from_vec(widen(data, |x: [u8; 2]| i16::from_le_bytes(x) as i64), shape, &device)?,
        StoredDType::U16 => Tensor::from_vec(widen(data, |x: [u8; 2]| u16::from_le_bytes(x) as i64), shape, &device)?,
        StoredDType::I32 => Tensor::from_vec(widen(data, |x: [u8; 4]| i32::from_le_bytes(x) as i64), shape, &device)?,
        StoredDType::U64 => Tensor::from_vec(widen(data, |x: [u8; 8]| u64::from_le_bytes(x) as f64), shape, &device)?,
        other => return Err(unsupported(name, other)),
    };
    Ok(tensor)
}

/// Builds a CPU tensor from a safetensors view.
pub fn tensor_from_safetensors(name: &str, view: &safetensors::tensor::TensorView) -> Result<Tensor, Error> {
    let dtype = StoredDType::from_safetensors(view.dtype()).ok_or_else(|| unsupported(name, view.dtype()))?;
    tensor_from_raw(name, dtype, view.shape(), view.data())
}

/// Contiguous little-endian encoding of the tensor's elements.
pub fn to_raw_encoding(name: &str, tensor: &Tensor) -> Result<Vec<u8>, Error> {
    let flat = tensor.flatten_all()?;
    Ok(match tensor.dtype() {
        DType::F64 => flat.to_vec1::<f64>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::F32 => flat.to_vec1::<f32>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::BF16 => flat.to_vec1::<half::bf16>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::F16 => flat.to_vec1::<half::f16>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::I64 => flat.to_vec1::<i64>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::U32 => flat.to_vec1::<u32>()?.iter().flat_map(|x| x.to_le_bytes()).collect(),
        DType::U8 => flat.to_vec1::<u8>()?,
        #[allow(unreachable_patterns)]
        other => return Err(unsupported(name, other)),
    })
}
