//! The drive inventory: which devices are attached, which of them host the
//! running OS, and what changed between two refreshes.
//!
//! Refresh cycles must be serialized by the caller (drive them from one
//! loop); the inventory itself is single-owner mutable state and the only
//! cross-thread effect of a refresh is lease revocation through the
//! [`ToastTracker`].

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::device::{Descriptor, DeviceRecord};
use crate::tracker::ToastTracker;

/// The set of device names that host the running OS.
///
/// Classified exactly once, from the first snapshot at process start, and
/// never mutated afterwards: a drive attached at startup (including the
/// one running the OS) is permanently excluded from write targets, even if
/// the same physical identity later reappears after a real removal and
/// reinsertion. This is a deliberate coarse policy, not mount-point
/// detection; it must not be silently tightened.
#[derive(Clone, Debug, Default)]
pub struct SystemDrives {
    names: HashSet<String>,
}

impl SystemDrives {
    /// Captures every device name in the startup snapshot as a system
    /// drive.
    pub fn classify(snapshot: &[DeviceRecord]) -> Self {
        let mut names = HashSet::new();
        for record in snapshot {
            info!(device = %record.path.display(), "detected system drive");
            names.insert(record.name.clone());
        }
        Self { names }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// What changed between the previous inventory and a new snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub added: BTreeSet<Descriptor>,
    pub removed: BTreeSet<Descriptor>,
    pub unchanged: BTreeSet<Descriptor>,
}

impl DiffResult {
    /// True when the snapshot rendered to exactly the previous descriptor
    /// set.
    pub fn no_change(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Debug)]
struct InventoryEntry {
    record: DeviceRecord,
    descriptor: Descriptor,
}

/// The current set of toastable devices.
///
/// Entries are keyed internally by kernel name; the descriptor is a
/// derived display value, regenerated from the record on every refresh.
/// Diff output is still expressed in descriptors, so a device whose
/// rendered attributes change between polls (a re-read size string, say)
/// surfaces as one `removed` plus one `added`, never as an in-place
/// update.
#[derive(Debug, Default)]
pub struct DriveInventory {
    system: SystemDrives,
    entries: HashMap<String, InventoryEntry>,
}

impl DriveInventory {
    pub fn new(system: SystemDrives) -> Self {
        Self {
            system,
            entries: HashMap::new(),
        }
    }

    /// Runs one refresh cycle: filters the snapshot against the
    /// system-drive set, reconciles it with the previous entries, and
    /// force-revokes leases for descriptors that vanished.
    pub fn refresh(&mut self, snapshot: Vec<DeviceRecord>, tracker: &ToastTracker) -> DiffResult {
        let mut next: HashMap<String, InventoryEntry> = HashMap::new();
        for record in snapshot {
            if self.system.contains(&record.name) {
                continue;
            }
            let descriptor = record.descriptor();
            next.insert(record.name.clone(), InventoryEntry { record, descriptor });
        }

        let previous: BTreeSet<Descriptor> =
            self.entries.values().map(|e| e.descriptor.clone()).collect();
        let current: BTreeSet<Descriptor> =
            next.values().map(|e| e.descriptor.clone()).collect();

        // Identical descriptor sets mean identical records (the descriptor
        // embeds the whole rendered identity), so the previous entries can
        // be kept as-is.
        if previous == current {
            debug!("no changes");
            return DiffResult {
                unchanged: current,
                ..DiffResult::default()
            };
        }

        let added: BTreeSet<Descriptor> = current.difference(&previous).cloned().collect();
        let removed: BTreeSet<Descriptor> = previous.difference(&current).cloned().collect();
        let unchanged: BTreeSet<Descriptor> = current.intersection(&previous).cloned().collect();

        info!(
            added = added.len(),
            removed = removed.len(),
            "drives list changed"
        );

        tracker.revoke_removed(&removed);
        self.entries = next;

        DiffResult {
            added,
            removed,
            unchanged,
        }
    }

    /// Looks up the record behind a currently-listed descriptor.
    pub fn record_for(&self, descriptor: &Descriptor) -> Option<&DeviceRecord> {
        self.entries
            .values()
            .find(|e| &e.descriptor == descriptor)
            .map(|e| &e.record)
    }

    /// The current descriptors in display order.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        let mut all: Vec<Descriptor> =
            self.entries.values().map(|e| e.descriptor.clone()).collect();
        all.sort();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn system_drives(&self) -> &SystemDrives {
        &self.system
    }
}
