use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;
use toastr_core::device::{Descriptor, DeviceRecord};
use toastr_core::error::ToastError;
use toastr_core::hotplug::{Poller, RefreshTrigger};
use toastr_core::inventory::{DiffResult, DriveInventory, SystemDrives};
use toastr_core::lsblk;
use toastr_core::tracker::ToastTracker;
use toastr_core::write::{self, WriteEvent, WriteOptions, WriteRequest};
use tracing::warn;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

mod catalog;

#[derive(Parser)]
#[command(name = "toastr")]
#[command(about = "A safe, hotplug-aware flash drive toaster", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Toast an image onto a flash drive plugged in after startup
    Toast {
        /// Image file to write (.img/.iso, optionally .gz/.xz/.zst compressed)
        #[arg(required_unless_present = "catalog", conflicts_with = "catalog")]
        image: Option<PathBuf>,

        /// Pick the image from a JSON catalog instead
        #[arg(long, value_name = "FILE")]
        catalog: Option<PathBuf>,

        /// Skip write verification
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Seconds between device rescans
        #[arg(long, default_value_t = 2, value_name = "SECS")]
        interval: u64,

        /// Wait for this target (descriptor or device path) instead of prompting
        #[arg(long, value_name = "DEVICE")]
        device: Option<String>,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Watch the drive inventory and report changes
    Watch {
        /// Seconds between device rescans
        #[arg(long, default_value_t = 2, value_name = "SECS")]
        interval: u64,
    },
    /// List currently attached block devices
    List,
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// By disabling it, we can have a cleaner exit when the user cancels the
/// operation. The original terminal state is restored when this struct is
/// dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            if let Ok(original_termios) = Termios::from_fd(fd) {
                let mut new_termios = original_termios;
                // Disable printing of control characters.
                new_termios.c_lflag &= !ECHOCTL;

                if tcsetattr(fd, TCSANOW, &new_termios).is_ok() {
                    Self {
                        original_termios: Some(original_termios),
                    }
                } else {
                    Self {
                        original_termios: None,
                    }
                }
            } else {
                Self {
                    original_termios: None,
                }
            }
        }
        #[cfg(not(unix))]
        {
            // This is a no-op on non-Unix platforms.
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            // Restore the original terminal settings.
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// One refresh cycle against a fresh snapshot. Query failures keep the
/// previous inventory and are retried on the next trigger.
fn refresh_once(inventory: &mut DriveInventory, tracker: &ToastTracker) -> Option<DiffResult> {
    match lsblk::take_snapshot() {
        Ok(snapshot) => Some(inventory.refresh(snapshot, tracker)),
        Err(error) => {
            warn!(%error, "device scan failed, keeping the previous inventory");
            None
        }
    }
}

/// Blocks briefly for the next refresh trigger and, on one, runs a
/// refresh cycle. The short timeout keeps Ctrl-C responsive.
fn wait_for_trigger(
    triggers: &mpsc::Receiver<RefreshTrigger>,
    inventory: &mut DriveInventory,
    tracker: &ToastTracker,
) -> Result<()> {
    match triggers.recv_timeout(Duration::from_millis(200)) {
        Ok(_trigger) => {
            refresh_once(inventory, tracker);
            Ok(())
        }
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(()),
        Err(mpsc::RecvTimeoutError::Disconnected) => bail!("device watcher stopped"),
    }
}

/// Matches `wanted` against a free descriptor, either by the full
/// descriptor string or by the device node path.
fn find_target(
    free: &[Descriptor],
    inventory: &DriveInventory,
    wanted: &str,
) -> Option<Descriptor> {
    free.iter()
        .find(|descriptor| {
            descriptor.as_str() == wanted
                || inventory
                    .record_for(descriptor)
                    .is_some_and(|record| record.path == Path::new(wanted))
        })
        .cloned()
}

/// Waits until a toastable drive is available, then resolves the target:
/// the `--device` override if given, an interactive choice otherwise.
fn select_target(
    running: &AtomicBool,
    triggers: &mpsc::Receiver<RefreshTrigger>,
    inventory: &mut DriveInventory,
    tracker: &ToastTracker,
    wanted: Option<&str>,
) -> Result<(Descriptor, DeviceRecord)> {
    let mut announced_wait = false;
    let mut announced_device = false;

    loop {
        if !running.load(Ordering::SeqCst) {
            bail!("cancelled before a target was selected");
        }

        let free: Vec<Descriptor> = inventory
            .descriptors()
            .into_iter()
            .filter(|descriptor| !tracker.is_busy(descriptor))
            .collect();

        if let Some(wanted) = wanted {
            if let Some(choice) = find_target(&free, inventory, wanted) {
                if let Some(record) = inventory.record_for(&choice).cloned() {
                    return Ok((choice, record));
                }
            }
            if !announced_device {
                println!(
                    "Waiting for {} to be plugged in (Ctrl-C to abort)...",
                    style(wanted).cyan()
                );
                announced_device = true;
            }
            wait_for_trigger(triggers, inventory, tracker)?;
            continue;
        }

        if free.is_empty() {
            if !announced_wait {
                println!("Plug in the flash drive to toast (Ctrl-C to abort)...");
                announced_wait = true;
            }
            wait_for_trigger(triggers, inventory, tracker)?;
            continue;
        }

        let mut items: Vec<String> = free
            .iter()
            .map(|descriptor| descriptor.to_string())
            .collect();
        items.push("(rescan)".to_string());

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Select the flash drive to TOAST")
            .items(&items)
            .default(0)
            .interact()?;

        if selection == free.len() {
            refresh_once(inventory, tracker);
            continue;
        }

        let choice = free[selection].clone();
        match inventory.record_for(&choice).cloned() {
            Some(record) => return Ok((choice, record)),
            None => {
                // The drive vanished while the menu was open.
                println!("{choice} is gone, rescanning.");
                refresh_once(inventory, tracker);
            }
        }
    }
}

/// Lets the user pick an image out of the catalog file.
fn pick_from_catalog(path: &Path) -> Result<PathBuf> {
    let entries = catalog::load(path)?;
    if entries.is_empty() {
        bail!("image catalog {} is empty", path.display());
    }

    let items: Vec<String> = entries
        .iter()
        .map(|entry| {
            if entry.description.is_empty() {
                entry.name.clone()
            } else {
                format!("{} ({})", entry.name, entry.description)
            }
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the image to toast")
        .items(&items)
        .default(0)
        .interact()?;

    Ok(entries[selection].image.clone())
}

fn run_toast(
    running: Arc<AtomicBool>,
    image: Option<PathBuf>,
    catalog_path: Option<PathBuf>,
    no_verify: bool,
    interval: Duration,
    wanted: Option<String>,
    yes: bool,
) -> Result<()> {
    let image = match catalog_path {
        Some(path) => pick_from_catalog(&path)?,
        None => image.ok_or_else(|| anyhow!("an image file or --catalog is required"))?,
    };

    let startup = lsblk::take_snapshot().context("initial device scan failed")?;
    let tracker = ToastTracker::new();
    let mut inventory = DriveInventory::new(SystemDrives::classify(&startup));
    println!(
        "{} drive(s) present at startup are protected and will never be offered as targets.",
        inventory.system_drives().len()
    );

    let (trigger_tx, triggers) = mpsc::channel();
    let _poller = Poller::spawn(interval, trigger_tx);

    let (descriptor, record) =
        select_target(&running, &triggers, &mut inventory, &tracker, wanted.as_deref())?;

    println!();
    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        descriptor
    );
    println!("  Device: {}", style(record.path.display()).cyan());
    println!("  Image:  {}", style(image.display()).cyan());
    println!("  A failed or cancelled toast leaves the drive partially written; there is no undo.");
    println!();

    if !yes && !confirm_operation("Are you sure you want to proceed?")? {
        println!("Toast cancelled.");
        return Ok(());
    }

    println!();

    let lease = tracker.begin_toast(&descriptor)?;
    let handle = write::start(
        WriteRequest {
            image: image.clone(),
            device: record.path.clone(),
        },
        lease,
        WriteOptions {
            verify: !no_verify,
            ..WriteOptions::default()
        },
    );

    // The staging spinner only shows for compressed sources; raw images
    // reach their first progress event almost immediately.
    let is_compressed = image.extension().and_then(|e| e.to_str()).is_some_and(|e| {
        matches!(e.to_lowercase().as_str(), "gz" | "gzip" | "xz" | "zst" | "zstd")
    });

    let prepare_pb = if is_compressed {
        let pb = ProgressBar::new_spinner();
        pb.set_prefix("Preparing");
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] {spinner} {msg}")
                .unwrap(),
        );
        pb.set_message("decompressing image...");
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    } else {
        ProgressBar::hidden()
    };

    let write_pb = ProgressBar::new(0);

    let mut staged = false;
    let mut last_written = 0u64;
    let mut cancel_requested = false;

    let outcome = loop {
        if !running.load(Ordering::SeqCst) && !cancel_requested {
            handle.cancel();
            cancel_requested = true;
            write_pb.println("Cancelling at the next chunk boundary...");
        }

        match handle.events().recv_timeout(Duration::from_millis(100)) {
            Ok(WriteEvent::Progress {
                bytes_written,
                total_bytes,
            }) => {
                if !staged {
                    if is_compressed {
                        prepare_pb.finish_with_message("Image staged.");
                    }
                    write_pb.set_length(total_bytes);
                    write_pb.set_prefix("Toasting");
                    write_pb.set_style(
                        ProgressStyle::default_bar()
                            .template(
                                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                            )
                            .unwrap()
                            .progress_chars("■ "),
                    );
                    staged = true;
                }
                write_pb.set_position(bytes_written);
                last_written = bytes_written;
            }
            Ok(WriteEvent::Done(result)) => break result,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                write_pb.finish_and_clear();
                bail!("write worker stopped without reporting a result");
            }
        }

        // Keep the inventory fresh while toasting so a yanked target is
        // noticed and the session ends with a device-lost failure.
        let mut rescan = false;
        while triggers.try_recv().is_ok() {
            rescan = true;
        }
        if rescan {
            refresh_once(&mut inventory, &tracker);
        }
    };

    match outcome {
        Ok(bytes) => {
            if no_verify {
                write_pb.finish_with_message("Toast complete (verification skipped).");
            } else {
                write_pb.finish_with_message("Toast complete.");
            }
            println!(
                "\n✨ Successfully toasted {} onto {} ({bytes} bytes).",
                style(image.display()).cyan(),
                style(record.path.display()).cyan()
            );
            Ok(())
        }
        Err(error) => {
            prepare_pb.finish_and_clear();
            write_pb.finish_and_clear();
            if last_written > 0
                && matches!(
                    error,
                    ToastError::Write { .. } | ToastError::Cancelled | ToastError::DeviceLost
                )
            {
                println!(
                    "{} {} holds a partial image that cannot be rolled back; re-toast it or reformat it before use.",
                    style("WARNING:").red().bold(),
                    style(record.path.display()).cyan()
                );
            }
            Err(error.into())
        }
    }
}

fn run_watch(running: Arc<AtomicBool>, interval: Duration) -> Result<()> {
    let startup = lsblk::take_snapshot().context("initial device scan failed")?;
    let tracker = ToastTracker::new();
    let mut inventory = DriveInventory::new(SystemDrives::classify(&startup));

    let (trigger_tx, triggers) = mpsc::channel();
    let _poller = Poller::spawn(interval, trigger_tx);

    println!(
        "Watching for drive changes ({} system drives protected). Ctrl-C to stop.",
        inventory.system_drives().len()
    );

    while running.load(Ordering::SeqCst) {
        match triggers.recv_timeout(Duration::from_millis(200)) {
            Ok(_trigger) => {
                let Some(diff) = refresh_once(&mut inventory, &tracker) else {
                    continue;
                };
                for descriptor in &diff.added {
                    println!("{} {descriptor}", style("+").green().bold());
                }
                for descriptor in &diff.removed {
                    println!("{} {descriptor}", style("-").red().bold());
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

fn run_list() -> Result<()> {
    let snapshot = lsblk::take_snapshot()?;
    if snapshot.is_empty() {
        println!("No block devices reported.");
        return Ok(());
    }

    println!("Found {} attached block devices:", snapshot.len());
    println!(
        "\n  {:<12} {:<10} {:<25} {}",
        "DEVICE", "VENDOR", "MODEL", "SIZE"
    );
    println!("  {:-<12} {:-<10} {:-<25} {:-<10}", "", "", "", "");
    for record in &snapshot {
        let vendor = if record.vendor.is_empty() {
            "-"
        } else {
            record.vendor.as_str()
        };
        let model = if record.model.is_empty() {
            "-"
        } else {
            record.model.as_str()
        };
        println!(
            "  {:<12} {:<10} {:<25} {}",
            record.path.display(),
            vendor,
            model,
            record.size
        );
    }
    println!("\nDrives attached when a toast starts are protected; plug the target in afterwards.");

    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Set up the Ctrl+C handler to toggle the `running` flag.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Toast {
            image,
            catalog,
            no_verify,
            interval,
            device,
            yes,
        } => run_toast(
            running,
            image,
            catalog,
            no_verify,
            Duration::from_secs(interval.max(1)),
            device,
            yes,
        ),
        Commands::Watch { interval } => run_watch(running, Duration::from_secs(interval.max(1))),
        Commands::List => run_list(),
    }
}
