use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::command::manager::BleManager;
use crate::config::io::ConfigIO;
use crate::config::types::{Config, RadioKind};
use crate::error::{AppRunError, BleError};
use crate::events::types::Event;
use crate::radio::{AdapterState, Radio};
use crate::radio::btle::BtleplugRadio;
use crate::radio::simulated::SimulatedRadio;

#[derive(Parser, Debug)]
#[command(name = "ble-manager", version, about = "Scan for and connect to Bluetooth LE peripherals")]
pub struct Args {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Use simulated peripherals instead of the bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Scan and print each discovered device as a JSON line
    Scan {
        /// 0 scans until interrupted
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,

        /// Only report peripherals advertising this service UUID (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,

        #[arg(long)]
        allow_duplicates: bool,
    },
    /// Scan until a device shows up, connect, and hold the connection until interrupted
    Connect {
        id: String,

        #[arg(long, default_value_t = 5.0)]
        scan_seconds: f64,
    },
    /// Write the default config file
    InitConfig,
}

impl Args {
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info }
    }
}

fn event_stream(manager: &BleManager) -> UnboundedReceiver<Event> {
    let (tx, rx) = unbounded::<Event>();
    manager.subscribe(move |event| {
        let _ = tx.unbounded_send(event.clone());
    });
    rx
}

async fn scan(manager: &BleManager, services: Vec<String>, seconds: f64, allow_duplicates: bool) -> Result<(), AppRunError> {
    let mut events = event_stream(manager);
    manager.start_scan(&services[..], seconds, allow_duplicates).await?;

    'mainloop: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping scan");
                manager.stop_scan().await?;
                break 'mainloop;
            },
            event = events.next() => match event {
                None => break 'mainloop,
                Some(Event::DeviceDiscovered { device }) => match serde_json::to_string(&device) {
                    Ok(line) => println!("{}", line),
                    Err(err) => warn!("Failed to encode device {}: {}", device.id, err),
                },
                Some(Event::ScanStateChanged { scanning: false, .. }) => break 'mainloop,
                Some(Event::AdapterStateChanged { state: AdapterState::PoweredOff }) => {
                    warn!("Bluetooth is switched off, nothing will be found until it is back on");
                },
                Some(_) => {},
            },
        }
    }

    Ok(())
}

async fn connect(manager: &BleManager, id: String, scan_seconds: f64) -> Result<(), AppRunError> {
    let mut events = event_stream(manager);

    if manager.device(&id).is_err() {
        manager.start_scan::<String>(&[], scan_seconds, false).await?;

        'scanloop: loop {
            match events.next().await {
                Some(Event::DeviceDiscovered { device }) if device.id == id => break 'scanloop,
                Some(Event::ScanStateChanged { scanning: false, .. }) | None => break 'scanloop,
                Some(_) => {},
            }
        }

        match manager.stop_scan().await {
            Ok(()) | Err(BleError::NotScanning) => {},
            Err(err) => return Err(err.into()),
        }
    }

    manager.connect(&id).await?;
    let device = manager.device(&id)?;
    info!("Connected to {} ({})", device.display_name(), device.id);

    'mainloop: loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break 'mainloop;
            },
            event = events.next() => match event {
                Some(Event::DeviceDisconnected { id: gone }) if gone == id => {
                    warn!("Device {} went away", id);
                    return Ok(());
                },
                None => break 'mainloop,
                Some(_) => {},
            },
        }
    }

    match manager.disconnect(&id).await {
        Ok(()) | Err(BleError::NotConnected { .. }) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn open_radio(kind: RadioKind, cancel: CancellationToken) -> Result<Arc<dyn Radio>, AppRunError> {
    info!("Using {} radio", kind);

    let radio: Arc<dyn Radio> = match kind {
        RadioKind::Btleplug => Arc::new(BtleplugRadio::new(cancel).await?),
        RadioKind::Simulated => Arc::new(SimulatedRadio::with_default_roster()),
    };
    Ok(radio)
}

pub async fn run_cli(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new(args.config.clone())?;

    if let CliCommand::InitConfig = args.command {
        config_io.save(&Config::default()).await?;
        println!("{}", config_io.path().to_string_lossy());
        return Ok(());
    }

    let config = config_io.read().await?;
    let kind = if args.simulate { RadioKind::Simulated } else { config.radio };

    let cancel = CancellationToken::new();
    let radio = open_radio(kind, cancel.child_token()).await?;
    let (manager, handle) = BleManager::new(radio, config, cancel.clone());

    let result = match args.command {
        CliCommand::Scan { seconds, services, allow_duplicates } => scan(&manager, services, seconds, allow_duplicates).await,
        CliCommand::Connect { id, scan_seconds } => connect(&manager, id, scan_seconds).await,
        CliCommand::InitConfig => Ok(()),
    };

    manager.shutdown();
    if let Err(err) = handle.await {
        warn!("BLE engine task failed: {}", err);
    }
    cancel.cancel();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scan_options() {
        let args = Args::parse_from(["ble-manager", "--simulate", "scan", "--seconds", "2", "--service", "180f", "--allow-duplicates"]);
        assert!(args.simulate);
        match args.command {
            CliCommand::Scan { seconds, services, allow_duplicates } => {
                assert_eq!(seconds, 2.0);
                assert_eq!(services, vec![String::from("180f")]);
                assert!(allow_duplicates);
            },
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn verbose_raises_log_level() {
        let args = Args::parse_from(["ble-manager", "connect", "AA:BB", "-v"]);
        assert_eq!(args.log_level(), log::LevelFilter::Debug);
    }
}
