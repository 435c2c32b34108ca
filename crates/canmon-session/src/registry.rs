//! Channel handle pool
//!
//! The registry is the single owner of the "which handles are taken" set.
//! Allocation scans the 16-slot pool in ascending order, so the lowest free
//! handle always wins.

use std::collections::BTreeSet;

use canmon_core::{ChannelHandle, CHANNEL_COUNT};
use parking_lot::Mutex;
use tracing::debug;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("All {} channel handles are in use", CHANNEL_COUNT)]
    Exhausted,
}

/// Fixed pool of channel handles plus the set currently assigned
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    assigned: Mutex<BTreeSet<ChannelHandle>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free handle
    pub fn allocate(&self) -> Result<ChannelHandle, RegistryError> {
        self.allocate_preferred(None)
    }

    /// Take `preferred` when it is free, otherwise the lowest free handle
    pub fn allocate_preferred(
        &self,
        preferred: Option<ChannelHandle>,
    ) -> Result<ChannelHandle, RegistryError> {
        let mut assigned = self.assigned.lock();

        let handle = preferred
            .filter(|h| !assigned.contains(h))
            .or_else(|| ChannelHandle::all().find(|h| !assigned.contains(h)))
            .ok_or(RegistryError::Exhausted)?;

        assigned.insert(handle);
        debug!(%handle, in_use = assigned.len(), "Channel handle allocated");
        Ok(handle)
    }

    /// Take exactly `handle`; `false` if it is already assigned
    pub fn claim(&self, handle: ChannelHandle) -> bool {
        let mut assigned = self.assigned.lock();
        let claimed = assigned.insert(handle);
        if claimed {
            debug!(%handle, in_use = assigned.len(), "Channel handle claimed");
        }
        claimed
    }

    /// Return `handle` to the pool. Releasing a free handle is a no-op;
    /// the return value tells whether anything changed.
    pub fn release(&self, handle: ChannelHandle) -> bool {
        let mut assigned = self.assigned.lock();
        let released = assigned.remove(&handle);
        if released {
            debug!(%handle, in_use = assigned.len(), "Channel handle released");
        }
        released
    }

    pub fn is_assigned(&self, handle: ChannelHandle) -> bool {
        self.assigned.lock().contains(&handle)
    }

    /// Snapshot of the assigned handles, ascending
    pub fn assigned(&self) -> Vec<ChannelHandle> {
        self.assigned.lock().iter().copied().collect()
    }

    /// Number of handles still free
    pub fn available(&self) -> usize {
        CHANNEL_COUNT as usize - self.assigned.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(n: u8) -> ChannelHandle {
        ChannelHandle::new(n).unwrap()
    }

    #[test]
    fn test_allocates_lowest_free() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.allocate().unwrap(), h(1));
        assert_eq!(registry.allocate().unwrap(), h(2));
        assert_eq!(registry.allocate().unwrap(), h(3));

        registry.release(h(2));
        assert_eq!(registry.allocate().unwrap(), h(2));
        assert_eq!(registry.allocate().unwrap(), h(4));
    }

    #[test]
    fn test_never_hands_out_assigned_handle() {
        let registry = ChannelRegistry::new();
        let mut seen = BTreeSet::new();
        for _ in 0..CHANNEL_COUNT {
            let handle = registry.allocate().unwrap();
            assert!(seen.insert(handle), "handle {} handed out twice", handle);
        }
        assert_eq!(registry.available(), 0);
    }

    #[test]
    fn test_exhausted_leaves_pool_untouched() {
        let registry = ChannelRegistry::new();
        for _ in 0..CHANNEL_COUNT {
            registry.allocate().unwrap();
        }
        let before = registry.assigned();
        assert_eq!(registry.allocate(), Err(RegistryError::Exhausted));
        assert_eq!(
            registry.allocate_preferred(Some(h(5))),
            Err(RegistryError::Exhausted)
        );
        assert_eq!(registry.assigned(), before);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = ChannelRegistry::new();
        let handle = registry.allocate().unwrap();

        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        // Never allocated
        assert!(!registry.release(h(9)));

        assert!(registry.assigned().is_empty());
        assert_eq!(registry.available(), CHANNEL_COUNT as usize);
    }

    #[test]
    fn test_preferred_handle() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.allocate_preferred(Some(h(7))).unwrap(), h(7));
        // Taken: falls back to the lowest free handle
        assert_eq!(registry.allocate_preferred(Some(h(7))).unwrap(), h(1));
        assert!(registry.is_assigned(h(7)));
        assert_eq!(registry.assigned(), vec![h(1), h(7)]);
    }

    #[test]
    fn test_claim_exact_handle() {
        let registry = ChannelRegistry::new();
        assert!(registry.claim(h(4)));
        assert!(!registry.claim(h(4)));
        assert_eq!(registry.assigned(), vec![h(4)]);

        // Lowest free scan skips the claimed handle
        for n in 1..=4 {
            let expected = if n < 4 { h(n) } else { h(5) };
            assert_eq!(registry.allocate().unwrap(), expected);
        }
    }
}
