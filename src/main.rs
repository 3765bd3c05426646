//! eglfs-kms binary entry point
//!
//! Brings the KMS backend up, prints the screens it would drive, and gives
//! the displays back. Useful for checking a configuration on a new board.

use std::path::PathBuf;

use clap::Parser;
use eglfs_kms::backend::kms::card::Card;
use eglfs_kms::backend::kms::outputs::CursorTopology;
use eglfs_kms::backend::kms::screen::{Geometry, KmsScreen};
use eglfs_kms::backend::kms::types::{ConnectorId, CrtcId, PowerState, Subpixel};
use eglfs_kms::{Config, DeviceIntegration, KmsIntegration};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eglfs-kms")]
#[command(about = "Resolve KMS outputs and modes for full-screen EGL")]
struct Cli {
    /// JSON configuration, else $EGLFS_KMS_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,
    /// DRM device node, overrides the configuration
    #[arg(long)]
    device: Option<PathBuf>,
    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ScreenSummary {
    name: String,
    connector: ConnectorId,
    crtc: CrtcId,
    mode: String,
    mode_count: usize,
    geometry: Geometry,
    physical_size_mm: (f64, f64),
    logical_dpi: (f64, f64),
    refresh_rate: u32,
    subpixel: Subpixel,
    power_state: PowerState,
    primary: bool,
}

impl<C: Card> From<&KmsScreen<C>> for ScreenSummary {
    fn from(screen: &KmsScreen<C>) -> Self {
        Self {
            name: screen.name().to_owned(),
            connector: screen.connector(),
            crtc: screen.crtc(),
            mode: screen.mode().to_string(),
            mode_count: screen.output().modes.len(),
            geometry: screen.geometry(),
            physical_size_mm: screen.physical_size_mm(),
            logical_dpi: screen.logical_dpi(),
            refresh_rate: screen.refresh_rate(),
            subpixel: screen.subpixel(),
            power_state: screen.power_state(),
            primary: screen.is_primary(),
        }
    }
}

#[derive(Serialize)]
struct Summary {
    device: Option<PathBuf>,
    topology: CursorTopology,
    screens: Vec<ScreenSummary>,
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(device) = cli.device {
        config.device = Some(device);
    }

    let mut kms: KmsIntegration = KmsIntegration::new(config);
    kms.platform_init()?;
    kms.screen_init()?;

    let summary = Summary {
        device: kms.device().map(|d| d.path().to_owned()),
        topology: kms.topology(),
        screens: kms.screens().iter().map(ScreenSummary::from).collect(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        if let Some(device) = &summary.device {
            println!("{}", device.display());
        }
        for screen in &summary.screens {
            let g = screen.geometry;
            println!(
                "{}: {} at {},{} ({}x{} mm){}",
                screen.name,
                screen.mode,
                g.x,
                g.y,
                screen.physical_size_mm.0.round(),
                screen.physical_size_mm.1.round(),
                if screen.primary { " primary" } else { "" },
            );
        }
    }

    kms.platform_destroy();
    info!("Released DRM device");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}
