use std::path::{Path, PathBuf};
use checkpoint_io::{CheckpointFormat, StateDict};
use crate::precision::Precision;
use crate::selection::{select, SelectionEvent, SelectionMode};
use crate::Error;

#[derive(Clone, Debug, PartialEq)]
pub struct ConvertOptions {
    pub input: PathBuf,
    pub precision: Precision,
    pub mode: SelectionMode,
    /// Container the result is written as. The input format is always
    /// detected from the input's extension.
    pub format: CheckpointFormat,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            input: PathBuf::from("model.ckpt"),
            precision: Precision::Fp32,
            mode: SelectionMode::Full,
            format: CheckpointFormat::Pth,
        }
    }
}

impl ConvertOptions {
    /// `{stem}-{mode}-{precision}.{ext}`, next to the input file. An input
    /// without an extension keeps its whole name as the stem.
    pub fn output_path(&self) -> PathBuf {
        let stem = self
            .input
            .file_stem()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_name = format!("{}-{}-{}.{}", stem, self.mode, self.precision, self.format.extension());
        self.input.with_file_name(file_name)
    }
}

pub struct Conversion {
    pub state_dict: StateDict,
    pub events: Vec<SelectionEvent>,
}

/// Selects the entries `options.mode` keeps and casts each to `options.precision`.
pub fn convert(state_dict: &StateDict, options: &ConvertOptions) -> Result<Conversion, Error> {
    let selection = select(state_dict, options.mode);
    let mut out = StateDict::new();
    for (key, value) in selection.entries {
        match value.as_tensor() {
            Some(t) => log::debug!("{}: {:?} -> {:?}", key, t.dtype(), options.precision.dtype()),
            None => log::debug!("{}: {} value", key, value.kind()),
        }
        out.insert(key, options.precision.convert(key, value)?);
    }
    Ok(Conversion {
        state_dict: out,
        events: selection.events,
    })
}

/// Loads `options.input`, converts it and writes the result, returning the output path.
pub fn run(options: &ConvertOptions) -> Result<PathBuf, Error> {
    let state_dict = checkpoint_io::load(&options.input)?;
    let converted = convert(&state_dict, options)?;
    drop(state_dict);
    for event in &converted.events {
        println!("{event}");
    }

    let output = options.output_path();
    println!("convert ok, saving model");
    save(&output, &converted.state_dict, options.format)?;
    println!("convert finish.");
    Ok(output)
}

fn save(path: &Path, state_dict: &StateDict, format: CheckpointFormat) -> Result<(), Error> {
    checkpoint_io::save(path, state_dict, format)?;
    log::info!("Saved {} as {:?}", path.display(), format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use checkpoint_io::Value;

    fn options(mode: SelectionMode, precision: Precision) -> ConvertOptions {
        ConvertOptions {
            mode,
            precision,
            ..Default::default()
        }
    }

    fn ema_checkpoint() -> StateDict {
        let device = Device::Cpu;
        [
            ("model.w", Tensor::new(&[1.0f32, 2.0], &device).unwrap()),
            ("model_ema.w", Tensor::new(&[3.0f32, 4.0], &device).unwrap()),
            ("model_ema.num_updates", Tensor::new(7i64, &device).unwrap()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn output_name_includes_mode_and_precision() {
        let mut opts = options(SelectionMode::EmaOnly, Precision::Half);
        opts.input = PathBuf::from("/models/sd-v1.5.ckpt");
        assert_eq!(opts.output_path(), PathBuf::from("/models/sd-v1.5-ema-only-half.ckpt"));

        opts.format = CheckpointFormat::Safetensors;
        opts.precision = Precision::Bf16;
        opts.mode = SelectionMode::Prune;
        assert_eq!(opts.output_path(), PathBuf::from("/models/sd-v1.5-prune-bf16.safetensors"));

        opts.input = PathBuf::from("weights.safetensors");
        opts.mode = SelectionMode::NoEma;
        opts.precision = Precision::Full;
        assert_eq!(opts.output_path(), PathBuf::from("weights-no-ema-full.safetensors"));

        opts.input = PathBuf::from("dir/model");
        opts.format = CheckpointFormat::Pth;
        assert_eq!(opts.output_path(), PathBuf::from("dir/model-no-ema-full.ckpt"));
    }

    #[test]
    fn ema_only_fp16_example() {
        let conversion = convert(&ema_checkpoint(), &options(SelectionMode::EmaOnly, Precision::Fp16)).unwrap();
        let out = &conversion.state_dict;
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["model.w", "model_ema.num_updates"]);
        let w = out.tensor("model.w").unwrap();
        assert_eq!(w.dtype(), DType::F16);
        assert_eq!(w.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
        let n = out.tensor("model_ema.num_updates").unwrap();
        assert_eq!(n.dtype(), DType::F16);
        assert_eq!(n.to_dtype(DType::F32).unwrap().to_scalar::<f32>().unwrap(), 7.0);
        assert_eq!(conversion.events.len(), 3);
    }

    #[test]
    fn no_ema_fp32_example() {
        let conversion = convert(&ema_checkpoint(), &options(SelectionMode::NoEma, Precision::Fp32)).unwrap();
        let out = &conversion.state_dict;
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["model.w"]);
        assert_eq!(out.tensor("model.w").unwrap().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert!(conversion.events.is_empty());
    }

    #[test]
    fn full_casts_every_entry() {
        let input = ema_checkpoint();
        let out = convert(&input, &options(SelectionMode::Full, Precision::Bf16)).unwrap().state_dict;
        assert_eq!(out.keys().collect::<Vec<_>>(), input.keys().collect::<Vec<_>>());
        assert!(out.tensors().all(|(_, t)| t.dtype() == DType::BF16));
    }

    #[test]
    fn plain_values_survive_half_precision() {
        let mut input = ema_checkpoint();
        input.insert("global_step", Value::Int(1200));
        let out = convert(&input, &options(SelectionMode::Full, Precision::Fp16)).unwrap().state_dict;
        assert_eq!(out.keys().collect::<Vec<_>>(), input.keys().collect::<Vec<_>>());
        assert!(matches!(out.get("global_step"), Some(Value::Int(1200))));
    }

    #[test]
    fn plain_values_fail_the_f32_cast() {
        let mut input = ema_checkpoint();
        input.insert("global_step", Value::Int(1200));
        let err = convert(&input, &options(SelectionMode::Full, Precision::Full)).err().unwrap();
        assert!(matches!(err, Error::NotATensor { ref key, .. } if key == "global_step"));
        let out = convert(&input, &options(SelectionMode::NoEma, Precision::Fp32));
        assert!(out.is_err());
    }
}
