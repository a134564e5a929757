use std::env;
use crate::cli::{run_cli, Args};
use crate::error::AppRunError;

pub mod cli;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod radio;
pub mod scan;

pub use crate::command::manager::BleManager;
pub use crate::device::types::{ConnectionState, Device, DeviceFilter};
pub use crate::error::{BleError, RadioError};
pub use crate::events::dispatcher::SubscriptionToken;
pub use crate::events::types::{Event, ScanStateReason};
pub use crate::radio::AdapterState;

pub fn init_logging(level: log::LevelFilter) {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");
}

pub fn run(args: Args) -> Result<(), AppRunError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_cli(args))
}
