use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{DescriptorOracle, EnrollmentStore, FileStore};
use facegate_hw::{CaptureDevice, SyntheticDevice, VideoSurface};
use facegate_session::{Config, MessageClass, Phase, Session, SessionStatus};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate on-device face login CLI")]
struct Cli {
    /// Use the built-in synthetic camera instead of a V4L2 device
    #[arg(long, global = true)]
    synthetic: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll your face as the reference for this profile
    Enroll,
    /// Verify your face against the enrolled reference
    Verify,
    /// Show enrollment status
    Status,
    /// Remove the enrollment
    Reset,
    /// Write the enrolled reference image to a file
    Reference {
        /// Output path (PNG)
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Clone, Copy)]
enum Action {
    Enroll,
    Verify,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    let store = Arc::new(FileStore::new(&config.data_dir, &config.profile));
    tracing::debug!(store = %store.path().display(), "using enrollment store");

    match cli.command {
        Commands::Enroll => run_action(&config, store, cli.synthetic, Action::Enroll).await,
        Commands::Verify => run_action(&config, store, cli.synthetic, Action::Verify).await,
        Commands::Status => print_status(&config, &store),
        Commands::Reset => {
            // Reset never acquires the camera.
            let session = build_session(&config, store, Arc::new(SyntheticDevice::default()));
            let status = session.reset()?;
            Ok(report(&status))
        }
        Commands::Reference { output } => {
            let record = store.load().context("no face is enrolled")?;
            let png = facegate_hw::frame::data_url_bytes(&record.reference_image)
                .context("stored reference image is unreadable")?;
            std::fs::write(&output, png)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Reference image written to {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Devices => {
            list_devices();
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_session(
    config: &Config,
    store: Arc<FileStore>,
    device: Arc<dyn CaptureDevice>,
) -> Session {
    Session::new(
        device,
        store,
        Arc::new(DescriptorOracle::new(config.match_threshold)),
        Arc::new(VideoSurface::new()),
        config.timeouts(),
    )
}

async fn run_action(
    config: &Config,
    store: Arc<FileStore>,
    synthetic: bool,
    action: Action,
) -> Result<ExitCode> {
    let device: Arc<dyn CaptureDevice> = if synthetic {
        Arc::new(SyntheticDevice::default())
    } else {
        camera_device(config)?
    };
    let session = build_session(config, store, device);

    let mut events = session.subscribe();
    let progress = tokio::spawn(async move {
        while events.changed().await.is_ok() {
            let status = events.borrow_and_update().clone();
            if status.phase.message_class() == MessageClass::Progress {
                println!("{}", status.message);
            }
        }
    });

    let result = tokio::select! {
        result = drive(&session, action, config) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    // Dropping the session closes the event channel and ends the printer.
    drop(session);
    let _ = progress.await;

    match result {
        Some(status) => Ok(report(&status?)),
        None => {
            tracing::info!("interrupted; session abandoned");
            Ok(ExitCode::from(130))
        }
    }
}

/// Prepare the session, wait for video, then run the action.
async fn drive(session: &Session, action: Action, config: &Config) -> Result<SessionStatus> {
    if matches!(action, Action::Verify) && session.enrollment().is_none() {
        return Ok(session.authenticate().await?);
    }

    let status = session.prepare().await?;
    if status.phase != Phase::CameraReady {
        return Ok(status);
    }

    let surface = session.surface();
    let wait = config.timeouts().capture;
    if tokio::time::timeout(wait, surface.ready()).await.is_err() {
        bail!("camera delivered no video within {wait:?}");
    }

    Ok(match action {
        Action::Enroll => session.enroll().await?,
        Action::Verify => session.authenticate().await?,
    })
}

fn report(status: &SessionStatus) -> ExitCode {
    println!("{}", status.message);
    if let Some(outcome) = status.outcome() {
        println!("confidence: {:.3}", outcome.confidence);
    }
    match status.phase.message_class() {
        MessageClass::Success => ExitCode::SUCCESS,
        MessageClass::Progress if status.phase == Phase::Idle => ExitCode::SUCCESS,
        MessageClass::Denial => ExitCode::from(1),
        MessageClass::Error | MessageClass::Progress => ExitCode::from(2),
    }
}

fn print_status(config: &Config, store: &FileStore) -> Result<ExitCode> {
    let record = store.load();
    let status = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "profile": config.profile,
        "store": store.path().display().to_string(),
        "camera": config.camera_device,
        "match_threshold": config.match_threshold,
        "enrolled": record.is_some(),
        "created_at": record.map(|r| r.created_at),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "v4l2")]
fn camera_device(config: &Config) -> Result<Arc<dyn CaptureDevice>> {
    Ok(Arc::new(facegate_hw::V4l2Device::new(
        config.camera_device.clone(),
        config.warmup_frames,
    )))
}

#[cfg(not(feature = "v4l2"))]
fn camera_device(_config: &Config) -> Result<Arc<dyn CaptureDevice>> {
    bail!("built without V4L2 support; rebuild with `--features v4l2` or pass --synthetic")
}

#[cfg(feature = "v4l2")]
fn list_devices() {
    let devices = facegate_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}\t{}\t{} ({})", d.path, d.name, d.driver, d.bus);
    }
}

#[cfg(not(feature = "v4l2"))]
fn list_devices() {
    println!("Built without V4L2 support; rebuild with `--features v4l2`");
}
