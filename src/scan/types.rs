use std::collections::HashSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::types::Reply;
use crate::device::types::Advertisement;
use crate::error::BleError;

/**
 * 16 bit service ids are offsets into this base UUID (0000xxxx-0000-1000-8000-00805f9b34fb).
 */
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Accepts a full UUID or a 16 bit assigned number such as `180f`.
fn parse_service(id: &str) -> Result<Uuid, BleError> {
    let trimmed = id.trim();

    if trimmed.len() == 4 {
        if let Ok(short) = u16::from_str_radix(trimmed, 16) {
            return Ok(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96)));
        }
    }

    Uuid::parse_str(trimmed).map_err(|err| BleError::InvalidArgument(format!("invalid service id {:?}: {}", id, err)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub services: Vec<Uuid>,
}

impl ScanFilter {
    pub fn parse<S: AsRef<str>>(service_ids: &[S]) -> Result<Self, BleError> {
        let services = service_ids
            .iter()
            .map(|id| parse_service(id.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ScanFilter { services })
    }

    /// An empty filter matches every advertisement.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        self.services.is_empty() || advertisement.services.iter().any(|service| self.services.contains(service))
    }
}

/// What the scan controller decided about one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    NoSession,
    Filtered,
    /// Seen before in this session with duplicates disallowed: update the registry quietly.
    Repeat,
    Report,
}

pub struct ScanSession {
    pub generation: u64,
    pub filter: ScanFilter,
    pub allow_duplicates: bool,
    pub deadline: Option<Instant>,
    pub(crate) seen: HashSet<String>,
    pub(crate) cancel: CancellationToken,
    /// The start request, answered once the radio confirms.
    pub(crate) pending_reply: Option<Reply<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_service_ids_expand_to_the_base_uuid() {
        let filter = ScanFilter::parse(&["180f", "0000180a-0000-1000-8000-00805f9b34fb"]).unwrap();
        assert_eq!(filter.services[0].to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
        assert_eq!(filter.services[1].to_string(), "0000180a-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn malformed_service_ids_are_rejected() {
        assert!(matches!(ScanFilter::parse(&["battery"]), Err(BleError::InvalidArgument(_))));
        assert!(matches!(ScanFilter::parse(&["18z0"]), Err(BleError::InvalidArgument(_))));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let advertisement = Advertisement { id: String::from("A"), name: None, rssi: None, services: vec![] };
        assert!(ScanFilter::default().matches(&advertisement));
        assert!(!ScanFilter::parse(&["180f"]).unwrap().matches(&advertisement));
    }
}
