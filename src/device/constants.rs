/**
 * How long (milliseconds) a connection handshake may take before the attempt fails.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) tearing down a connection may take. The device is considered
 * disconnected once this passes, whether or not the radio confirmed.
 */
pub const DISCONNECT_DEADLINE: u64 = 5_000;

/**
 * Name reported for peripherals that do not advertise a local name.
 */
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";
