use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::device::types::Advertisement;
use crate::error::BleError;
use crate::scan::types::{ScanFilter, ScanSession, Sighting};

/// Owns the single optional scan session.
pub struct ScanController {
    session: Option<ScanSession>,
    next_generation: u64,
}

impl ScanController {
    pub fn new() -> Self {
        ScanController { session: None, next_generation: 1 }
    }

    pub fn is_scanning(&self) -> bool {
        self.session.is_some()
    }

    pub(crate) fn session_mut(&mut self, generation: u64) -> Option<&mut ScanSession> {
        self.session.as_mut().filter(|session| session.generation == generation)
    }

    pub fn start(&mut self, filter: ScanFilter, allow_duplicates: bool, timeout: Option<Duration>) -> Result<&mut ScanSession, BleError> {
        if self.session.is_some() {
            return Err(BleError::AlreadyScanning);
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let session = ScanSession {
            generation,
            filter,
            allow_duplicates,
            // a timeout past the clock's range never fires
            deadline: timeout.and_then(|timeout| Instant::now().checked_add(timeout)),
            seen: HashSet::new(),
            cancel: CancellationToken::new(),
            pending_reply: None,
        };

        Ok(self.session.insert(session))
    }

    /// Take the active session. Its timer is cancelled.
    pub fn stop(&mut self) -> Result<ScanSession, BleError> {
        let session = self.session.take().ok_or(BleError::NotScanning)?;
        session.cancel.cancel();
        Ok(session)
    }

    /// Take the session only if it is still the one identified by `generation`; a stale
    /// timer or radio callback must not end a newer scan.
    pub fn end(&mut self, generation: u64) -> Option<ScanSession> {
        if self.session.as_ref()?.generation != generation {
            return None;
        }
        self.stop().ok()
    }

    pub fn observe(&mut self, advertisement: &Advertisement) -> Sighting {
        let Some(session) = self.session.as_mut() else {
            return Sighting::NoSession;
        };

        if !session.filter.matches(advertisement) {
            return Sighting::Filtered;
        }

        let first_sighting = session.seen.insert(advertisement.id.clone());
        if first_sighting || session.allow_duplicates {
            Sighting::Report
        } else {
            Sighting::Repeat
        }
    }

    /// Let a forgotten device be reported again within the current session.
    pub fn forget(&mut self, id: &str) {
        if let Some(session) = self.session.as_mut() {
            session.seen.remove(id);
        }
    }
}

impl Default for ScanController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn advertisement(id: &str, services: Vec<Uuid>) -> Advertisement {
        Advertisement { id: id.to_string(), name: None, rssi: Some(-60), services }
    }

    #[test]
    fn only_one_session_at_a_time() {
        let mut controller = ScanController::new();
        controller.start(ScanFilter::default(), false, None).unwrap();
        assert!(matches!(controller.start(ScanFilter::default(), false, None), Err(BleError::AlreadyScanning)));
        assert!(controller.is_scanning());
    }

    #[test]
    fn stopping_twice_fails_the_second_time() {
        let mut controller = ScanController::new();
        controller.start(ScanFilter::default(), false, None).unwrap();
        assert!(controller.stop().is_ok());
        assert!(matches!(controller.stop(), Err(BleError::NotScanning)));
        assert!(!controller.is_scanning());
    }

    #[test]
    fn stop_cancels_the_session_timer() {
        let mut controller = ScanController::new();
        let cancel = controller.start(ScanFilter::default(), false, None).unwrap().cancel.clone();
        controller.stop().unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_follows_timeout() {
        let mut controller = ScanController::new();
        let before = Instant::now();
        let session = controller.start(ScanFilter::default(), false, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(session.deadline, Some(before + Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_deadline_is_left_open() {
        let mut controller = ScanController::new();
        let session = controller.start(ScanFilter::default(), false, Some(Duration::MAX)).unwrap();
        assert_eq!(session.deadline, None);
    }

    #[test]
    fn stale_generation_does_not_end_a_newer_scan() {
        let mut controller = ScanController::new();
        let first = controller.start(ScanFilter::default(), false, None).unwrap().generation;
        controller.stop().unwrap();
        let second = controller.start(ScanFilter::default(), false, None).unwrap().generation;

        assert!(controller.end(first).is_none());
        assert!(controller.is_scanning());
        assert_eq!(controller.end(second).map(|session| session.generation), Some(second));
    }

    #[test]
    fn duplicates_are_reported_once_unless_allowed() {
        let mut controller = ScanController::new();
        controller.start(ScanFilter::default(), false, None).unwrap();
        let seen = advertisement("A", vec![]);
        assert_eq!(controller.observe(&seen), Sighting::Report);
        assert_eq!(controller.observe(&seen), Sighting::Repeat);
        assert_eq!(controller.observe(&advertisement("B", vec![])), Sighting::Report);

        controller.stop().unwrap();
        controller.start(ScanFilter::default(), true, None).unwrap();
        assert_eq!(controller.observe(&seen), Sighting::Report);
        assert_eq!(controller.observe(&seen), Sighting::Report);
    }

    #[test]
    fn new_session_forgets_previous_sightings() {
        let mut controller = ScanController::new();
        let seen = advertisement("A", vec![]);
        controller.start(ScanFilter::default(), false, None).unwrap();
        controller.observe(&seen);
        controller.stop().unwrap();

        controller.start(ScanFilter::default(), false, None).unwrap();
        assert_eq!(controller.observe(&seen), Sighting::Report);
    }

    #[test]
    fn service_filter_is_applied() {
        let wanted = Uuid::from_u128(0xfeed);
        let mut controller = ScanController::new();
        controller.start(ScanFilter { services: vec![wanted] }, false, None).unwrap();

        assert_eq!(controller.observe(&advertisement("A", vec![Uuid::from_u128(1)])), Sighting::Filtered);
        assert_eq!(controller.observe(&advertisement("B", vec![Uuid::from_u128(1), wanted])), Sighting::Report);
    }

    #[test]
    fn advertisements_without_session_are_ignored() {
        let mut controller = ScanController::new();
        assert_eq!(controller.observe(&advertisement("A", vec![])), Sighting::NoSession);
    }

    #[test]
    fn filter_parsing_rejects_garbage() {
        assert!(ScanFilter::parse(&["not-a-uuid"]).is_err());
        let filter = ScanFilter::parse(&["0000180f-0000-1000-8000-00805f9b34fb"]).unwrap();
        assert_eq!(filter.services, vec![Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb)]);
    }
}
