//! Tracks which devices currently have an in-flight toast.
//!
//! The tracker is the single owner of the busy set. Every mutation happens
//! under one narrow lock, held only for the map operation itself and never
//! across I/O; the write worker observes revocation through an atomic flag
//! on its lease without touching the lock at all.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

use crate::device::Descriptor;
use crate::error::AlreadyBusy;

#[derive(Debug, Default)]
struct LeaseState {
    revoked: AtomicBool,
}

#[derive(Debug, Default)]
struct TrackerInner {
    busy: Mutex<HashMap<Descriptor, Arc<LeaseState>>>,
}

impl TrackerInner {
    /// Removes the entry for `descriptor`. When `only_if` is given, the
    /// entry is only removed if it still belongs to that exact lease, so a
    /// stale guard can never disturb a newer lease on the same descriptor.
    fn release(&self, descriptor: &Descriptor, only_if: Option<&Arc<LeaseState>>) {
        let mut busy = self.busy.lock().unwrap();
        if let Some(current) = busy.get(descriptor) {
            if only_if.is_none_or(|state| Arc::ptr_eq(current, state)) {
                busy.remove(descriptor);
            }
        }
    }
}

/// The registry of devices currently being toasted.
///
/// Cheap to clone; all clones share one busy set. A device with an active
/// [`Lease`] is unselectable until the lease is released or the device
/// disappears from a refresh.
#[derive(Clone, Debug, Default)]
pub struct ToastTracker {
    inner: Arc<TrackerInner>,
}

impl ToastTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `descriptor` busy and returns the lease the session must hold
    /// for its whole duration.
    ///
    /// # Errors
    ///
    /// Fails with [`AlreadyBusy`] if the descriptor is already leased; no
    /// state changes in that case.
    pub fn begin_toast(&self, descriptor: &Descriptor) -> Result<Lease, AlreadyBusy> {
        let mut busy = self.inner.busy.lock().unwrap();
        match busy.entry(descriptor.clone()) {
            Entry::Occupied(_) => Err(AlreadyBusy(descriptor.clone())),
            Entry::Vacant(slot) => {
                let state = Arc::new(LeaseState::default());
                slot.insert(Arc::clone(&state));
                Ok(Lease {
                    descriptor: descriptor.clone(),
                    state,
                    tracker: Arc::downgrade(&self.inner),
                })
            }
        }
    }

    /// Releases `descriptor` regardless of who holds it.
    ///
    /// Idempotent: releasing a descriptor with no active lease is a no-op,
    /// never an error. This covers the race where the device vanished and
    /// the refresh cycle already cleared it.
    pub fn end_toast(&self, descriptor: &Descriptor) {
        self.inner.release(descriptor, None);
    }

    pub fn is_busy(&self, descriptor: &Descriptor) -> bool {
        self.inner.busy.lock().unwrap().contains_key(descriptor)
    }

    /// Force-releases the leases of devices that a refresh reported as
    /// removed. Each owning session observes the revocation at its next
    /// chunk boundary and terminates with `DeviceLost`.
    pub fn revoke_removed(&self, removed: &BTreeSet<Descriptor>) {
        let mut revoked = Vec::new();
        {
            let mut busy = self.inner.busy.lock().unwrap();
            for descriptor in removed {
                if let Some(state) = busy.remove(descriptor) {
                    state.revoked.store(true, Ordering::SeqCst);
                    revoked.push(descriptor.clone());
                }
            }
        }
        for descriptor in revoked {
            warn!(%descriptor, "leased device removed; session will fail with DeviceLost");
        }
    }
}

/// Exclusive hold a toasting session has on a device.
///
/// Dropping the lease releases the device. A lease can outlive its map
/// entry: if the tracker force-revoked it, or `end_toast` already cleared
/// the descriptor, the drop is a no-op and a newer lease on the same
/// descriptor stays untouched.
#[derive(Debug)]
pub struct Lease {
    descriptor: Descriptor,
    state: Arc<LeaseState>,
    tracker: Weak<TrackerInner>,
}

impl Lease {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// True once the tracker force-revoked this lease because the device
    /// disappeared. Read without taking the tracker lock, so the write
    /// worker can poll it between chunks.
    pub fn is_revoked(&self) -> bool {
        self.state.revoked.load(Ordering::SeqCst)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.release(&self.descriptor, Some(&self.state));
        }
    }
}
