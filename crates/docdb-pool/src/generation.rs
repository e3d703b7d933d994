//! Generation tracking for lazy invalidation.
//!
//! A clear bumps a counter instead of visiting connections. Every connection
//! remembers the generation it was created under and is stale once that no
//! longer matches the current generation of its scope.
//!
//! The generation of a service is the global counter plus the service's own
//! counter, so a global clear invalidates every service and a service clear
//! only that service. Both counters only grow, so the sum does too.

use hashbrown::HashMap;

use crate::address::ServiceId;

/// Epoch counters for the global scope and every known service.
#[derive(Debug, Default)]
pub(crate) struct GenerationTracker {
    global: u32,
    services: HashMap<ServiceId, u32>,
}

impl GenerationTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Global generation, independent of any service.
    pub(crate) fn global(&self) -> u32 {
        self.global
    }

    /// Current generation of a scope.
    pub(crate) fn current(&self, service_id: Option<&ServiceId>) -> u32 {
        match service_id {
            Some(id) => self
                .global
                .wrapping_add(self.services.get(id).copied().unwrap_or(0)),
            None => self.global,
        }
    }

    /// Check whether a connection created at `generation` is still current.
    pub(crate) fn is_current(&self, service_id: Option<&ServiceId>, generation: u32) -> bool {
        self.current(service_id) == generation
    }

    /// Bump the generation of a scope and return the new value.
    pub(crate) fn bump(&mut self, service_id: Option<&ServiceId>) -> u32 {
        match service_id {
            Some(id) => {
                *self.services.entry(*id).or_insert(0) += 1;
            }
            None => self.global += 1,
        }
        self.current(service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(n: u8) -> ServiceId {
        ServiceId::from_bytes([n; 12])
    }

    #[test]
    fn test_starts_at_zero() {
        let tracker = GenerationTracker::new();
        assert_eq!(tracker.current(None), 0);
        assert_eq!(tracker.current(Some(&service(1))), 0);
    }

    #[test]
    fn test_service_bump_is_scoped() {
        let mut tracker = GenerationTracker::new();
        assert_eq!(tracker.bump(Some(&service(1))), 1);
        assert_eq!(tracker.current(Some(&service(1))), 1);
        assert_eq!(tracker.current(Some(&service(2))), 0);
        assert_eq!(tracker.current(None), 0);
    }

    #[test]
    fn test_global_bump_invalidates_services() {
        let mut tracker = GenerationTracker::new();
        tracker.bump(Some(&service(1)));
        let before = tracker.current(Some(&service(1)));

        assert_eq!(tracker.bump(None), 1);
        assert!(!tracker.is_current(Some(&service(1)), before));
        assert!(!tracker.is_current(Some(&service(2)), 0));
        assert!(tracker.is_current(Some(&service(1)), 2));
    }
}
