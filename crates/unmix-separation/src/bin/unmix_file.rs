//! unmix-file - separate an audio file on disk
//!
//! ## Usage
//!
//! ```text
//! unmix-file <input> [--stems vocals,instrumental] [--config path] [--out dir] [--flac]
//! ```
//!
//! Writes `{name}_(Vocals).wav`, `{name}_(Instrumental).wav`, ... next to
//! the input, or into `--out`. Set RUST_LOG=debug for per-chunk output.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use unmix_core::codec::{OutputContainer, OutputFormat};
use unmix_separation::{
    default_config_path, load_config, JobProgress, JobResponse, ProgressCallback, SeparationRequest,
    SeparationService, StemSet,
};

struct Args {
    input: PathBuf,
    stems: StemSet,
    config: PathBuf,
    out_dir: Option<PathBuf>,
    flac: bool,
}

fn usage() -> &'static str {
    "usage: unmix-file <input> [--stems vocals,instrumental,drums,bass] [--config path] [--out dir] [--flac]"
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut input = None;
    let mut stems = StemSet::vocal_split();
    let mut config = default_config_path();
    let mut out_dir = None;
    let mut flac = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stems" => {
                let list = args.next().context("--stems needs a value")?;
                let names: Vec<&str> = list.split(',').filter(|s| !s.trim().is_empty()).collect();
                stems = StemSet::parse(&names)?;
            }
            "--config" => config = PathBuf::from(args.next().context("--config needs a path")?),
            "--out" => out_dir = Some(PathBuf::from(args.next().context("--out needs a directory")?)),
            "--flac" => flac = true,
            "-h" | "--help" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown option {}\n{}", other, usage()),
            other => {
                if input.replace(PathBuf::from(other)).is_some() {
                    bail!("only one input file is supported\n{}", usage());
                }
            }
        }
    }

    Ok(Args {
        input: input.with_context(|| usage().to_string())?,
        stems,
        config,
        out_dir,
        flac,
    })
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;

    let mut config = load_config(&args.config);
    if args.flac {
        config.output = OutputFormat {
            container: OutputContainer::Flac,
            ..config.output
        };
    }

    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let filename = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .context("input path has no file name")?
        .to_string();

    let service = SeparationService::with_config(config).context("Failed to start separation service")?;
    log::info!("Using {}", service.backend_info());
    let extension = service.config().output.container.extension();

    let progress: ProgressCallback = Arc::new(|p: JobProgress| {
        log::info!("[{}] {:>3.0}% {}", p.status, p.progress * 100.0, p.message);
    });

    let request = SeparationRequest::new(bytes, filename, args.stems);
    match service.run(request, Some(progress)) {
        JobResponse::Success { stems, .. } => {
            let out_dir = match &args.out_dir {
                Some(dir) => dir.clone(),
                None => args.input.parent().map(Path::to_path_buf).unwrap_or_default(),
            };
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {}", out_dir.display()))?;

            let stem_name = args
                .input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            for (stem, data) in stems {
                let path = out_dir.join(format!("{}_({}).{}", stem_name, stem.display_name(), extension));
                std::fs::write(&path, &data)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("{}", path.display());
            }
            Ok(())
        }
        JobResponse::Failure {
            error_kind, message, ..
        } => bail!("separation failed ({}): {}", error_kind, message),
    }
}
