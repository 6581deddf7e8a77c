use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::imageops::FilterType;
use tracing::{debug, info};

use crate::slots::SlotError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No screenshot command configured for this platform")]
    NoCommand,
    #[error("Failed to run {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("{program} exited with {status}")]
    Failed { program: String, status: std::process::ExitStatus },
    #[error("Failed to read captured image: {0}")]
    Read(#[from] std::io::Error),
    #[error("Invalid image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error("Screenshot task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Produces one screenshot as encoded image bytes.
#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Shells out to a platform screenshot tool. `{path}` in the arguments is
/// replaced with a temporary output file.
pub struct CommandCapturer {
    command: Vec<String>,
    scratch_dir: PathBuf,
}

impl CommandCapturer {
    pub fn new(command: Option<Vec<String>>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command
                .filter(|c| !c.is_empty())
                .unwrap_or_else(platform_command),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

fn platform_command() -> Vec<String> {
    let args: &[&str] = if cfg!(target_os = "macos") {
        &["screencapture", "-x", "-t", "png", "{path}"]
    } else if cfg!(target_os = "linux") {
        &["grim", "{path}"]
    } else {
        &[]
    };
    args.iter().map(|a| a.to_string()).collect()
}

#[async_trait]
impl ScreenCapturer for CommandCapturer {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(CaptureError::NoCommand);
        };

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let output = self.scratch_dir.join(format!(
            "capture-{}.png",
            chrono::Local::now().timestamp_millis()
        ));
        let output_str = output.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{path}", &output_str))
            .collect();

        let result = run_capture(program, &args, &output).await;
        if let Err(e) = tokio::fs::remove_file(&output).await {
            debug!("Could not delete {}: {e}", output.display());
        }
        result
    }
}

async fn run_capture(program: &str, args: &[String], output: &Path) -> Result<Vec<u8>, CaptureError> {
    debug!("Running {program} {}", args.join(" "));
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .map_err(|source| CaptureError::Spawn {
            program: program.to_string(),
            source,
        })?;
    if !status.success() {
        return Err(CaptureError::Failed {
            program: program.to_string(),
            status,
        });
    }
    Ok(tokio::fs::read(output).await?)
}

/// Decode any supported image, downscale it to `max_width` and re-encode
/// as PNG.
pub fn normalize(bytes: &[u8], max_width: u32) -> Result<Vec<u8>, CaptureError> {
    let mut img = image::load_from_memory(bytes)?;
    let (width, height) = (img.width(), img.height());

    if max_width > 0 && width > max_width {
        let new_height = ((height as f64 * max_width as f64 / width as f64) as u32).max(1);
        img = img.resize_exact(max_width, new_height, FilterType::Triangle);
        info!("Downscaled screenshot {width}x{height} -> {max_width}x{new_height}");
    }

    let mut png_buf = Cursor::new(Vec::new());
    img.write_to(&mut png_buf, image::ImageFormat::Png)?;
    Ok(png_buf.into_inner())
}
