use clap::Parser;
use log::{error, info};
use ble_manager::{init_logging, run};
use ble_manager::cli::Args;
use ble_manager::error::{AppRunError, RadioError};

fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(args.log_level());
    info!(concat!("BLE Manager ", env!("CARGO_PKG_VERSION")));

    match run(args) {
        Err(AppRunError::Radio { source: RadioError::PermissionDenied }) => {
            error!("Bluetooth access was denied. Grant this program bluetooth permission and try again.");
            Err(AppRunError::Radio { source: RadioError::PermissionDenied })
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
