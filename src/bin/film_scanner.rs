/// Film scanner web controller
///
/// Run with: cargo run --bin film_scanner -- [--simulate] [--port 5000]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gethostname::gethostname;
use log::{info, warn};

use film_scanner::arduino_connection::{ArduinoConnection, Transport};
use film_scanner::camera::{CaptureDevice, Gphoto2Camera};
use film_scanner::config_loader::{self, ScannerSettings};
use film_scanner::scan_journal::ScanJournal;
use film_scanner::scanner_state::StateStore;
use film_scanner::simulated::SimulatedRig;
use film_scanner::web;
use film_scanner::workflow::{ControllerParts, ScannerController};

#[derive(Parser, Debug)]
#[command(name = "film_scanner", about = "Web controller for the film scanning rig")]
struct Args {
    /// Path to film_scanner.yaml
    #[arg(long)]
    config: Option<PathBuf>,
    /// HTTP port (overrides WEB_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Bind address (overrides WEB_BIND)
    #[arg(long)]
    bind: Option<String>,
    /// Use the in-process transport and camera
    #[arg(long)]
    simulate: bool,
    /// Do not connect to the Arduino at startup
    #[arg(long)]
    no_autoconnect: bool,
    #[arg(long)]
    debug: bool,
}

fn build_devices(settings: &ScannerSettings) -> (Box<dyn Transport>, Box<dyn CaptureDevice>) {
    if settings.simulate {
        info!(target: "film_scanner", "Simulation mode: no hardware will be touched");
        let rig = SimulatedRig::new();
        return (
            Box::new(rig.transport(settings.fine_step, settings.coarse_step)),
            Box::new(rig.camera()),
        );
    }
    let transport = ArduinoConnection::new(
        settings.ard_port.clone(),
        settings.ard_baud,
        Duration::from_millis(settings.ard_reset_delay_ms),
        Duration::from_millis(settings.ard_command_timeout_ms),
        settings.fine_step,
        settings.coarse_step,
    );
    let camera = Gphoto2Camera::new(
        settings.gphoto2_path.clone(),
        Duration::from_secs(settings.capture_timeout_s),
        Duration::from_secs(settings.preview_timeout_s),
        Duration::from_secs(settings.camera_check_interval_s),
        settings.kill_gphoto2,
    );
    (Box::new(transport), Box::new(camera))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(if args.debug { "debug" } else { "info" }))
        .format_timestamp_millis()
        .init();

    let hostname = gethostname().to_string_lossy().to_string();
    let config_path = args.config.clone().unwrap_or_else(config_loader::default_config_path);
    let mut settings = config_loader::load_scanner_settings(&config_path, &hostname)?;
    if args.simulate {
        settings.simulate = true;
    }
    if let Some(port) = args.port {
        settings.web_port = port;
    }
    if let Some(bind) = args.bind.clone() {
        settings.web_bind = bind;
    }
    info!(target: "film_scanner", "Host {}: scans under {:?}", hostname, settings.scan_root);

    let (transport, camera) = build_devices(&settings);
    let controller = Arc::new(ScannerController::restore(ControllerParts {
        transport,
        camera,
        store: StateStore::new(settings.scan_root.clone()),
        journal: ScanJournal::new(),
        fine_step: settings.fine_step,
        coarse_step: settings.coarse_step,
        default_advance: settings.default_advance,
    }));

    if !args.no_autoconnect {
        let c = Arc::clone(&controller);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = c.connect_arduino() {
                warn!(target: "film_scanner", "Arduino not connected at startup: {} - use Connect Arduino", e);
            }
        });
    }

    web::serve(controller, &settings.web_bind, settings.web_port).await
}
