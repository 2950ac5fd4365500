use std::ffi::OsString;
use std::path::PathBuf;
use clap::Parser;
use ckpt_convert::{CheckpointFormat, ConvertOptions, Precision, SelectionMode};

#[derive(Parser, Debug)]
#[command(about = "Convert a checkpoint's precision and keep full, EMA-only or non-EMA weights")]
struct Cli {
    /// Path to model
    #[arg(short = 'f', long = "file", default_value = "model.ckpt")]
    file: PathBuf,
    /// Precision fp32(full)/fp16(half)/bf16
    #[arg(short = 'p', long = "precision", default_value = "fp32", value_parser = Precision::parse)]
    precision: Precision,
    /// Convert type full/ema-only(prune)/no-ema
    #[arg(short = 't', long = "type", default_value = "full", value_parser = SelectionMode::parse)]
    mode: SelectionMode,
    /// Write the result in safetensors format (also accepted as -st)
    #[arg(long = "safe-tensors")]
    safe_tensors: bool,
}

impl From<Cli> for ConvertOptions {
    fn from(cli: Cli) -> Self {
        ConvertOptions {
            input: cli.file,
            precision: cli.precision,
            mode: cli.mode,
            format: if cli.safe_tensors {
                CheckpointFormat::Safetensors
            } else {
                CheckpointFormat::Pth
            },
        }
    }
}

/// clap only knows single-character short flags, so the two-character `-st`
/// is rewritten to its long form before parsing.
fn normalize_args(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter()
        .map(|arg| if arg.as_os_str() == "-st" { OsString::from("--safe-tensors") } else { arg })
        .collect()
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    let options = ConvertOptions::from(cli);
    let output = ckpt_convert::run(&options)?;
    log::info!("Wrote {}", output.display());
    Ok(())
}
