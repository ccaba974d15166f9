//! The core, UI-agnostic library for the `toastr` flash drive toasting utility.
//!
//! `toastr-core` is designed to be used as a library by any front-end, whether
//! it's a command-line interface (like `toastr`) or a graphical user interface.
//! It handles the complexities of device inventory, system drive protection,
//! hotplug-aware diffing, and verified image writing.
//!
//! The library is structured into several key modules:
//! - [`device`]: Device records and the descriptor strings that identify them.
//! - [`lsblk`]: Block device snapshots taken through the system's `lsblk`.
//! - [`inventory`]: The system drive classifier and the inventory diff engine.
//! - [`tracker`]: The toasting state tracker that leases devices to writers.
//! - [`mod@write`]: The image write engine.
//! - [`hotplug`]: Refresh triggers, from hotplug notifications or a poll timer.
//! - [`error`]: The error taxonomy shared by all of the above.
//!
//! The primary entry point for a toasting operation is [`write::start`], which
//! runs the session on its own worker thread and reports progress over a
//! channel, allowing the calling application to display progress in any way it
//! chooses.
//!
//! ## Example: Toasting the First Free Drive
//!
//! ```rust,no_run
//! use toastr_core::inventory::{DriveInventory, SystemDrives};
//! use toastr_core::tracker::ToastTracker;
//! use toastr_core::write::{self, WriteEvent, WriteOptions, WriteRequest};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Every drive attached right now is treated as a system drive;
//!     // only drives plugged in later may be toasted.
//!     let startup = toastr_core::lsblk::take_snapshot()?;
//!     let tracker = ToastTracker::new();
//!     let mut inventory = DriveInventory::new(SystemDrives::classify(&startup));
//!
//!     // ... later, after the user plugged in a flash drive:
//!     inventory.refresh(toastr_core::lsblk::take_snapshot()?, &tracker);
//!     let descriptor = inventory
//!         .descriptors()
//!         .into_iter()
//!         .find(|d| !tracker.is_busy(d))
//!         .expect("no toastable drives attached");
//!     let device = inventory
//!         .record_for(&descriptor)
//!         .expect("descriptor was just listed")
//!         .path
//!         .clone();
//!
//!     let lease = tracker.begin_toast(&descriptor)?;
//!     let handle = write::start(
//!         WriteRequest { image: "ubuntu-24.04.img.xz".into(), device },
//!         lease,
//!         WriteOptions::default(),
//!     );
//!
//!     for event in handle.events().iter() {
//!         match event {
//!             WriteEvent::Progress { bytes_written, total_bytes } => {
//!                 println!("{bytes_written}/{total_bytes} bytes");
//!             }
//!             WriteEvent::Done(result) => {
//!                 result?;
//!                 println!("toasted!");
//!             }
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod error;
pub mod hotplug;
pub mod inventory;
pub mod lsblk;
pub mod tracker;
pub mod write;
