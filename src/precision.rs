use std::str::FromStr;
use candle_core::{DType, Tensor};
use checkpoint_io::Value;
use crate::Error;

/// Precision selector as given on the command line. `Full`/`Fp32` and
/// `Half`/`Fp16` cast identically but are kept apart because the selector
/// is echoed into the output file name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumString, strum_macros::EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Precision {
    Full,
    Fp32,
    Half,
    Fp16,
    Bf16,
}

pub type Converter = fn(&Tensor) -> candle_core::Result<Tensor>;

fn conv_full(t: &Tensor) -> candle_core::Result<Tensor> {
    t.to_dtype(DType::F32)
}

fn conv_fp16(t: &Tensor) -> candle_core::Result<Tensor> {
    t.to_dtype(DType::F16)
}

fn conv_bf16(t: &Tensor) -> candle_core::Result<Tensor> {
    t.to_dtype(DType::BF16)
}

impl Precision {
    /// Dispatch from selector to cast function.
    pub fn converter(&self) -> Converter {
        match self {
            Precision::Full | Precision::Fp32 => conv_full,
            Precision::Half | Precision::Fp16 => conv_fp16,
            Precision::Bf16 => conv_bf16,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Precision::Full | Precision::Fp32 => DType::F32,
            Precision::Half | Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }

    /// Whether values that are not tensors are passed through unchanged.
    /// The f32 cast has no such exception.
    pub fn passes_non_tensors(&self) -> bool {
        !matches!(self, Precision::Full | Precision::Fp32)
    }

    /// Casts the value stored under `key`.
    pub fn convert(&self, key: &str, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Tensor(t) => Ok(Value::Tensor((self.converter())(t)?)),
            other if self.passes_non_tensors() => Ok(other.clone()),
            other => Err(Error::NotATensor {
                key: key.to_string(),
                kind: other.kind(),
                precision: *self,
            }),
        }
    }

    /// Looks a selector up in the dispatch table.
    pub fn parse(selector: &str) -> Result<Self, Error> {
        Precision::from_str(selector).map_err(|_| Error::UnknownPrecision(selector.to_string()))
    }
}
