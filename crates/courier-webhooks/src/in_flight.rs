//! Per-event mutual exclusion within one process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_core::EventId;

/// Set of event ids currently owned by someone.
///
/// [`try_claim`](Self::try_claim) hands out at most one [`InFlightClaim`] per
/// id; dropping the claim releases the id.
#[derive(Debug, Clone, Default)]
pub struct InFlightRegistry {
    ids: Arc<Mutex<HashSet<EventId>>>,
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, HashSet<EventId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `id`, or `None` if it is already claimed.
    #[must_use]
    pub fn try_claim(&self, id: EventId) -> Option<InFlightClaim> {
        if self.ids().insert(id) {
            Some(InFlightClaim {
                registry: self.clone(),
                id,
            })
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, id: EventId) -> bool {
        self.ids().contains(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one event id. Released on drop, including on panic unwind.
#[derive(Debug)]
pub struct InFlightClaim {
    registry: InFlightRegistry,
    id: EventId,
}

impl InFlightClaim {
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.registry.ids().remove(&self.id);
    }
}
