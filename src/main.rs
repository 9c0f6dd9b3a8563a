use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use opendmx_rs::device::list_devices;
use opendmx_rs::protocol::{PID, VID};
use opendmx_rs::{Controller, DeviceSelector, EngineConfig, FtdiTransport, ingest};

type DmxController = Controller<FtdiTransport>;

/// Stream 513-byte DMX frames from stdin to an Enttec Open DMX USB interface.
///
/// SIGINT, SIGQUIT and SIGTERM stop output and exit. SIGUSR1 reconnects to
/// the device.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial number of the interface to drive, or `any` for the first one
    /// found. Without it, attached interfaces are listed and the program exits.
    device: Option<String>,
    /// Optional path to a file to write logs to, in addition to stderr.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    // stdout is reserved for the device listing.
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_thread_names(true);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file, &cli.verbose)?;

    let Some(device) = cli.device else {
        return print_devices();
    };

    let selector: DeviceSelector = device.parse()?;
    info!(device = %selector, "Starting DMX output");
    let controller = Arc::new(Controller::new(FtdiTransport::default(), EngineConfig::new(selector)));

    let (done_tx, done_rx) = oneshot::channel();
    let ingest_controller = Arc::clone(&controller);
    thread::Builder::new()
        .name("dmx-ingest".to_string())
        .spawn(move || {
            let stdin = std::io::stdin().lock();
            if let Err(e) = ingest::run(stdin, &ingest_controller) {
                error!("Stdin read: {}", e);
                std::process::abort();
            }
            let _ = done_tx.send(());
        })
        .context("Failed to spawn ingestion thread")?;

    wait_for_shutdown(controller, done_rx).await?;

    info!("Exiting");
    Ok(())
}

fn print_devices() -> Result<()> {
    let devices = list_devices(VID, PID).context("Failed to list USB devices")?;
    for device in devices {
        println!(
            "Vendor : '{}'\nName : '{}'\nSerial : '{}'",
            device.manufacturer.as_deref().unwrap_or(""),
            device.product.as_deref().unwrap_or(""),
            device.serial.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Stop output and mark the process as exiting.
async fn graceful_stop(controller: &Arc<DmxController>) -> Result<()> {
    controller.request_process_exit();
    let controller = Arc::clone(controller);
    tokio::task::spawn_blocking(move || controller.stop())
        .await
        .context("Engine stop task failed")
}

async fn restart(controller: &Arc<DmxController>) -> Result<()> {
    let controller = Arc::clone(controller);
    tokio::task::spawn_blocking(move || controller.restart())
        .await
        .context("Engine restart task failed")?
        .context("Failed to restart engine")
}

#[cfg(unix)]
async fn wait_for_shutdown(controller: Arc<DmxController>, mut done: oneshot::Receiver<()>) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut reset = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            // Ingestion already stopped the engine, unless a restart raced it.
            _ = &mut done => return graceful_stop(&controller).await,
            _ = interrupt.recv() => break,
            _ = quit.recv() => break,
            _ = terminate.recv() => break,
            _ = reset.recv() => {
                info!("SIGUSR1 received, reconnecting");
                restart(&controller).await?;
            }
        }
    }

    info!("Stop signal received, shutting down gracefully.");
    graceful_stop(&controller).await
}

#[cfg(not(unix))]
async fn wait_for_shutdown(controller: Arc<DmxController>, done: oneshot::Receiver<()>) -> Result<()> {
    tokio::select! {
        _ = done => graceful_stop(&controller).await,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down gracefully.");
            graceful_stop(&controller).await
        }
    }
}
