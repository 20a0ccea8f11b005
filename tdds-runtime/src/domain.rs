//! Domain registry: participant identities per domain.

use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use tdds_kernel::error::{DdsError, Result};

/// One registered participant identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantId {
    pub domain_id: u32,
    pub participant_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    domain_id: u32,
    participant_id: u32,
}

/// Registry of active participants. The lock is reentrant: discovery
/// callbacks running under it may re-enter registry queries.
pub struct DomainRegistry {
    inner: ReentrantMutex<RefCell<Vec<Slot>>>,
    max_domains: usize,
}

impl DomainRegistry {
    pub fn new(max_domains: usize) -> DomainRegistry {
        DomainRegistry {
            inner: ReentrantMutex::new(RefCell::new(Vec::new())),
            max_domains,
        }
    }

    /// Register a participant in `domain_id`, allocating the lowest
    /// free participant id.
    pub fn register(&self, domain_id: u32) -> Result<ParticipantId> {
        let guard = self.inner.lock();
        let mut slots = guard.borrow_mut();
        let distinct = {
            let mut seen: Vec<u32> = slots.iter().map(|s| s.domain_id).collect();
            seen.sort_unstable();
            seen.dedup();
            seen
        };
        if !distinct.contains(&domain_id) && distinct.len() >= self.max_domains {
            return Err(DdsError::out_of_resources("domain limit reached"));
        }
        let mut pid = 0;
        while slots
            .iter()
            .any(|s| s.domain_id == domain_id && s.participant_id == pid)
        {
            pid += 1;
        }
        slots.push(Slot {
            domain_id,
            participant_id: pid,
        });
        Ok(ParticipantId {
            domain_id,
            participant_id: pid,
        })
    }

    pub fn unregister(&self, id: ParticipantId) {
        let guard = self.inner.lock();
        guard
            .borrow_mut()
            .retain(|s| !(s.domain_id == id.domain_id && s.participant_id == id.participant_id));
    }

    pub fn participant_count(&self, domain_id: u32) -> usize {
        let guard = self.inner.lock();
        let n = guard
            .borrow()
            .iter()
            .filter(|s| s.domain_id == domain_id)
            .count();
        n
    }
}
