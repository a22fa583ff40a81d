use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceswap_core::{Config, ExecutionDevice, FaceSwapExecutor, LazySwapper, ModelInitializer};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "faceswap", about = "Face swap CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Swap the first face of SOURCE onto every face of TARGET
    Swap {
        /// Image whose faces get replaced
        #[arg(short, long)]
        target: PathBuf,
        /// Image providing the identity
        #[arg(short, long)]
        source: PathBuf,
        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Download the swapper weights
    FetchModel {
        #[arg(long)]
        url: Option<String>,
        /// Destination file (defaults to the configured swapper model path)
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Download even if the file already exists
        #[arg(long)]
        force: bool,
    },
    /// Report which configured model files are present
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Swap { target, source, output_dir } => {
            if let Some(dir) = output_dir {
                config.output_dir = dir;
                config.validate()?;
            }
            let (analysis, _) = ModelInitializer::new(&config).initialize_model()?;
            let swapper = LazySwapper::new(&config.swapper_model_path, ExecutionDevice::from_ctx_id(config.ctx_id));
            let mut executor = FaceSwapExecutor::new(config, analysis, swapper);

            let artifact = executor.swap_files(&target, &source)?;
            println!("{}", artifact.result_image_path.display());
        }
        Commands::FetchModel { url, dest, force } => {
            let url = url.unwrap_or_else(|| config.swapper_url.clone());
            let dest = dest.unwrap_or_else(|| config.swapper_model_path.clone());
            if dest.exists() && !force {
                println!("{} already exists (use --force to download again)", dest.display());
                return Ok(());
            }
            let bytes = download(&url, &dest).await?;
            println!("downloaded {bytes} bytes to {}", dest.display());
        }
        Commands::Check => {
            let models = [
                ("detector", config.detector_model_path()),
                ("recognizer", config.recognizer_model_path()),
                ("swapper", config.swapper_model_path.clone()),
            ];
            let report: Vec<_> = models
                .iter()
                .map(|(role, path)| {
                    serde_json::json!({
                        "model": role,
                        "path": path.display().to_string(),
                        "present": path.exists(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);

            let missing: Vec<_> = models.iter().filter(|(_, p)| !p.exists()).map(|(r, _)| *r).collect();
            if !missing.is_empty() {
                bail!("missing models: {}", missing.join(", "));
            }
        }
    }

    Ok(())
}

/// Stream `url` into `<dest>.part`, check it is an inswapper model, then
/// rename onto `dest`.
async fn download(url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    tracing::info!(url, dest = %dest.display(), "downloading swapper model");
    let mut response = reqwest::get(url).await?.error_for_status()?;
    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.trim_start().starts_with("text/html"));
    if is_html {
        bail!("{url} returned an HTML page instead of the model (interstitial or login page?)");
    }

    let part = part_path(dest);
    let mut file = tokio::fs::File::create(&part)
        .await
        .with_context(|| format!("failed to create {}", part.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    if written == 0 {
        let _ = tokio::fs::remove_file(&part).await;
        bail!("empty response from {url}");
    }
    if let Err(e) = faceswap_core::emap::load_emap(&part) {
        let _ = tokio::fs::remove_file(&part).await;
        bail!("downloaded file is not an inswapper model: {e}");
    }

    tokio::fs::rename(&part, dest)
        .await
        .with_context(|| format!("failed to move download into {}", dest.display()))?;
    tracing::info!(bytes = written, "swapper model downloaded");
    Ok(written)
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
