use anyhow::{bail, Context, Result};
use camstream::hal::mock::SimulatedCamera;
use camstream::hal::CameraHandle;
use camstream::{PipelineConfig, PipelineCoordinator};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "camstream")]
#[command(about = "Stream frames from several cameras to per-camera directories")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record from simulated cameras until the frames run out or Ctrl-C
    Record {
        /// JSON pipeline config; command line options override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Camera and its save directory, as ID=DIR (repeatable)
        #[arg(long = "camera", value_parser = parse_camera)]
        cameras: Vec<(String, PathBuf)>,

        /// Frames per camera, 0 for unbounded
        #[arg(short, long, default_value = "100")]
        frames: u64,

        /// Trigger rate of every simulated camera
        #[arg(long, default_value = "30")]
        fps: f64,

        #[arg(long, default_value = "65536")]
        payload_bytes: usize,

        /// Number of save workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Frame channel capacity, 0 for direct hand-off
        #[arg(long)]
        capacity: Option<usize>,

        #[arg(long)]
        drain_timeout_ms: Option<u64>,

        /// Write the final report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// CSV file with one camera,frame_id,timestamp_us row per frame
        #[arg(long)]
        frame_log: Option<PathBuf>,
    },

    /// Load and validate a pipeline config
    CheckConfig { file: PathBuf },
}

fn parse_camera(value: &str) -> Result<(String, PathBuf), String> {
    let (id, dir) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=DIR, got '{}'", value))?;
    if id.is_empty() || dir.is_empty() {
        return Err(format!("expected ID=DIR, got '{}'", value));
    }
    Ok((id.to_string(), PathBuf::from(dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level, e.g. RUST_LOG=camstream=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { file } => check_config(file),
        Commands::Record {
            config,
            cameras,
            frames,
            fps,
            payload_bytes,
            workers,
            capacity,
            drain_timeout_ms,
            report,
            frame_log,
        } => {
            let mut pipeline_config = match config {
                Some(path) => PipelineConfig::load(&path)?,
                None => PipelineConfig::default(),
            };
            for (id, dir) in cameras {
                pipeline_config.save_dirs.insert(id, dir);
            }
            if let Some(workers) = workers {
                pipeline_config.workers = workers;
            }
            if let Some(capacity) = capacity {
                pipeline_config.channel_capacity = capacity;
            }
            if drain_timeout_ms.is_some() {
                pipeline_config.drain_timeout_ms = drain_timeout_ms;
            }
            if report.is_some() {
                pipeline_config.report_path = report;
            }
            if frame_log.is_some() {
                pipeline_config.frame_log = frame_log;
            }

            record(pipeline_config, frames, fps, payload_bytes).await
        }
    }
}

fn check_config(file: PathBuf) -> Result<()> {
    let config = PipelineConfig::load(&file)?;
    config
        .validate()
        .with_context(|| format!("{:?} is not a usable pipeline config", file))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Time between two simulated triggers at `fps` frames per second.
fn trigger_interval(fps: f64) -> Result<Duration> {
    if fps.is_nan() || fps <= 0.0 {
        bail!("--fps must be positive");
    }
    Duration::try_from_secs_f64(1.0 / fps)
        .with_context(|| format!("--fps {} gives an unusable frame interval", fps))
}

async fn record(config: PipelineConfig, frames: u64, fps: f64, payload_bytes: usize) -> Result<()> {
    let interval = trigger_interval(fps)?;
    if config.save_dirs.is_empty() {
        bail!("no cameras: pass --camera ID=DIR or a config with save_dirs");
    }

    let cameras: Vec<Box<dyn CameraHandle>> = config
        .save_dirs
        .cameras()
        .map(|id| {
            let camera = SimulatedCamera::new(id.clone())
                .with_interval(interval)
                .with_payload_bytes(payload_bytes);
            let camera = if frames > 0 {
                camera.with_frames(frames)
            } else {
                camera
            };
            Box::new(camera) as Box<dyn CameraHandle>
        })
        .collect();

    let mut coordinator = PipelineCoordinator::new(config, cameras);
    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, draining");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });

    let report = coordinator
        .run()
        .await
        .context("Recording failed")?;

    println!("{}", report);
    if report.lost() > 0 {
        warn!(lost = report.lost(), "some frames were not saved");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_interval() {
        assert_eq!(trigger_interval(4.0).unwrap(), Duration::from_millis(250));
        assert!(trigger_interval(0.0).is_err());
        assert!(trigger_interval(-1.0).is_err());
        assert!(trigger_interval(f64::NAN).is_err());
        // 1/fps overflows Duration
        assert!(trigger_interval(1e-300).is_err());
    }

    #[test]
    fn test_parse_camera() {
        assert_eq!(
            parse_camera("camA=/data/a").unwrap(),
            ("camA".to_string(), PathBuf::from("/data/a"))
        );
        assert!(parse_camera("camA").is_err());
        assert!(parse_camera("=/data/a").is_err());
    }
}
