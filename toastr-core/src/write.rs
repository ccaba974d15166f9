//! The image write engine: streams a source image onto a target device.
//!
//! One session runs on its own worker thread and moves through three
//! stages: opening (source staging, target open with a one-shot
//! privilege-escalation retry, capacity preflight), writing (fixed-size
//! chunks, one progress event per chunk) and an optional verification
//! pass. The handle's channel delivers progress events in order followed
//! by exactly one terminal event. Cancellation and lease revocation are
//! observed cooperatively between chunks, so a stop takes at most one
//! chunk's write time.
//!
//! A failed or cancelled session leaves whatever bytes already reached
//! the device in place: there is no safe way to unwrite a raw block
//! device experiencing a partial image.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use flate2::read::GzDecoder;
use nix::ioctl_read;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, info, warn};
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::ToastError;
use crate::tracker::Lease;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// How the engine obtains a writable handle to the target device.
///
/// The seam exists so front-ends can bring their own privilege story and
/// tests can toast into plain files. [`SystemOpener`] is the default.
pub trait TargetOpener: Send + Sync {
    /// Opens the device node for writing.
    fn open(&self, device: &Path) -> io::Result<File>;

    /// One-shot privilege escalation, invoked after `open` failed with a
    /// permission error. The engine retries `open` exactly once after
    /// this returns successfully.
    fn escalate(&self, device: &Path) -> io::Result<()>;
}

/// Opens the device node with `O_SYNC` and escalates by granting the
/// invoking user access to it through `pkexec setfacl`, a single
/// auditable helper invocation.
pub struct SystemOpener;

impl TargetOpener for SystemOpener {
    fn open(&self, device: &Path) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(device)
    }

    fn escalate(&self, device: &Path) -> io::Result<()> {
        let grant = format!("u:{}:rw", nix::unistd::Uid::current());
        let status = Command::new("pkexec")
            .args(["setfacl", "-m", &grant])
            .arg(device)
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("pkexec setfacl exited with {status}"),
            ))
        }
    }
}

/// The frozen identity of one toasting session: which image goes onto
/// which device node. Captured when the user commits to the write.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    /// Source image; `.gz`, `.xz` and `.zst` sources are decompressed
    /// while the session opens.
    pub image: PathBuf,
    /// Device node to write to, from the inventory record of the leased
    /// descriptor.
    pub device: PathBuf,
}

/// Session tunables. `Default` is the production setup: verification on,
/// 1 MiB chunks, [`SystemOpener`].
pub struct WriteOptions {
    pub verify: bool,
    /// Copy granularity; one progress event fires per chunk, so this
    /// bounds both progress latency and cancellation latency. Zero is
    /// treated as one byte.
    pub chunk_size: usize,
    pub opener: Arc<dyn TargetOpener>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            verify: true,
            chunk_size: BUFFER_SIZE,
            opener: Arc::new(SystemOpener),
        }
    }
}

/// What a session reports over its event channel.
#[derive(Debug)]
pub enum WriteEvent {
    /// Another chunk reached the device. `bytes_written` never decreases
    /// within a session; the first event carries `bytes_written == 0`
    /// and announces the session total.
    Progress { bytes_written: u64, total_bytes: u64 },
    /// The terminal event: the final byte count on success, the typed
    /// failure otherwise. Sent exactly once, after the device lease has
    /// been released.
    Done(Result<u64, ToastError>),
}

/// The caller's side of a running session.
///
/// Dropping the handle detaches the session: the write keeps running and
/// the lease is still released when it finishes.
pub struct WriteHandle {
    events: Receiver<WriteEvent>,
    cancel: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl WriteHandle {
    /// The session's event stream: FIFO, loss-free, ending with exactly
    /// one [`WriteEvent::Done`].
    pub fn events(&self) -> &Receiver<WriteEvent> {
        &self.events
    }

    /// Requests cancellation; the worker stops at the next chunk
    /// boundary and reports [`ToastError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Blocks until the terminal event, discarding progress events, and
    /// joins the worker.
    pub fn wait(self) -> Result<u64, ToastError> {
        let result = loop {
            match self.events.recv() {
                Ok(WriteEvent::Progress { .. }) => continue,
                Ok(WriteEvent::Done(result)) => break result,
                Err(_) => {
                    break Err(ToastError::Write {
                        bytes_written: 0,
                        source: io::Error::other("write worker exited without a terminal event"),
                    });
                }
            }
        };
        let _ = self.worker.join();
        result
    }
}

/// Starts a toasting session on its own worker thread.
///
/// The worker owns `lease` for the whole session, so every terminal path
/// frees the device. The terminal event is sent only after that release:
/// a consumer observing [`WriteEvent::Done`] may immediately lease the
/// same descriptor again.
pub fn start(request: WriteRequest, lease: Lease, mut options: WriteOptions) -> WriteHandle {
    // chunk_size == 0 would stall the copy loop forever.
    options.chunk_size = options.chunk_size.max(1);

    let (events_tx, events) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_flag = Arc::clone(&cancel);

    let worker = thread::spawn(move || {
        let descriptor = lease.descriptor().clone();
        info!(%descriptor, image = %request.image.display(), "toasting session started");

        let result = run_session(&request, &lease, &options, &cancel_flag, &events_tx);
        match &result {
            Ok(bytes) => info!(%descriptor, bytes, "toasting session succeeded"),
            Err(error) => warn!(%descriptor, %error, "toasting session failed"),
        }

        // Free the device before the terminal event becomes visible.
        drop(lease);
        let _ = events_tx.send(WriteEvent::Done(result));
    });

    WriteHandle {
        events,
        cancel,
        worker,
    }
}

fn run_session(
    request: &WriteRequest,
    lease: &Lease,
    options: &WriteOptions,
    cancel: &AtomicBool,
    events: &Sender<WriteEvent>,
) -> Result<u64, ToastError> {
    if lease.is_revoked() {
        return Err(ToastError::DeviceLost);
    }

    // Opening: resolve the source to raw bytes with a known size before
    // the target is ever touched.
    let image = stage_source(&request.image, cancel)?;
    let mut source = File::open(image.path()).map_err(prep_err)?;
    let total_bytes = source.metadata().map_err(prep_err)?.len();

    if cancel.load(Ordering::SeqCst) {
        return Err(ToastError::Cancelled);
    }
    if lease.is_revoked() {
        return Err(ToastError::DeviceLost);
    }

    let mut target = open_target(options.opener.as_ref(), &request.device)?;

    if let Some(capacity) = device_capacity(&target) {
        if total_bytes > capacity {
            return Err(prep_err(io::Error::other(format!(
                "image is {total_bytes} bytes but {} holds only {capacity}",
                request.device.display()
            ))));
        }
    }

    // Writing: fixed-size chunks, one progress event per chunk. The
    // leading event publishes the session total before any byte moves.
    let _ = events.send(WriteEvent::Progress {
        bytes_written: 0,
        total_bytes,
    });

    let mut buffer = vec![0u8; options.chunk_size];
    let mut written: u64 = 0;
    while written < total_bytes {
        if cancel.load(Ordering::SeqCst) {
            return Err(ToastError::Cancelled);
        }
        if lease.is_revoked() {
            return Err(ToastError::DeviceLost);
        }

        let chunk = std::cmp::min(options.chunk_size as u64, total_bytes - written) as usize;
        source
            .read_exact(&mut buffer[..chunk])
            .map_err(|source| ToastError::Write {
                bytes_written: written,
                source,
            })?;
        target
            .write_all(&buffer[..chunk])
            .map_err(|source| ToastError::Write {
                bytes_written: written,
                source,
            })?;

        written += chunk as u64;
        let _ = events.send(WriteEvent::Progress {
            bytes_written: written,
            total_bytes,
        });
    }

    target.sync_all().map_err(|source| ToastError::Write {
        bytes_written: written,
        source,
    })?;

    // Both handles close here; the verification pass reopens its own.
    drop(target);
    drop(source);

    if options.verify {
        verify(
            image.path(),
            &request.device,
            total_bytes,
            options.chunk_size,
            cancel,
            lease,
        )?;
    }

    Ok(written)
}

/// I/O failures before the first byte moves surface as a write error at
/// offset zero.
fn prep_err(source: io::Error) -> ToastError {
    ToastError::Write {
        bytes_written: 0,
        source,
    }
}

/// A source image resolved to raw bytes on disk.
///
/// Compressed sources are streamed into a temp file that is deleted when
/// the session ends; raw sources are used in place.
struct StagedImage {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl StagedImage {
    fn path(&self) -> &Path {
        &self.path
    }
}

/// Stages `image` for writing, decompressing `.gz`/`.xz`/`.zst` sources.
///
/// A missing source reports [`ToastError::SourceNotFound`]; this runs
/// before the target opener is ever invoked.
fn stage_source(image: &Path, cancel: &AtomicBool) -> Result<StagedImage, ToastError> {
    let ext = image
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let input = File::open(image).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ToastError::SourceNotFound(image.to_path_buf())
        } else {
            prep_err(source)
        }
    })?;

    let mut reader: Box<dyn Read> = match ext.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(BufReader::new(input))),
        "xz" => Box::new(XzDecoder::new(BufReader::new(input))),
        "zst" | "zstd" => Box::new(ZstdDecoder::new(BufReader::new(input)).map_err(prep_err)?),
        // Not a compressed source: toast it as-is.
        _ => {
            return Ok(StagedImage {
                path: image.to_path_buf(),
                _temp: None,
            });
        }
    };

    debug!(image = %image.display(), "decompressing source image");
    let mut staged = NamedTempFile::new().map_err(prep_err)?;
    {
        let mut writer = BufWriter::new(&mut staged);
        let mut buffer = [0u8; 8192];
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(ToastError::Cancelled);
            }
            let n = reader.read(&mut buffer).map_err(prep_err)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).map_err(prep_err)?;
        }
        writer.flush().map_err(prep_err)?;
    }

    let temp_path = staged.into_temp_path();
    Ok(StagedImage {
        path: temp_path.to_path_buf(),
        _temp: Some(temp_path),
    })
}

/// Opens the target, giving the escalation helper exactly one shot at
/// fixing a permission failure.
fn open_target(opener: &dyn TargetOpener, device: &Path) -> Result<File, ToastError> {
    match opener.open(device) {
        Ok(target) => Ok(target),
        Err(source) if source.kind() == io::ErrorKind::PermissionDenied => {
            info!(device = %device.display(), "permission denied, invoking the escalation helper");
            if let Err(source) = opener.escalate(device) {
                return Err(ToastError::PermissionDenied {
                    path: device.to_path_buf(),
                    source,
                });
            }
            opener
                .open(device)
                .map_err(|source| ToastError::PermissionDenied {
                    path: device.to_path_buf(),
                    source,
                })
        }
        Err(source) => Err(prep_err(source)),
    }
}

/// Size in bytes of the block device behind `target`, if it is one.
///
/// Regular files (the engine happily toasts into one, tests rely on it)
/// fail the ioctl and skip the capacity preflight.
fn device_capacity(target: &File) -> Option<u64> {
    let mut size: u64 = 0;
    match unsafe { blkgetsize64(target.as_raw_fd(), &mut size) } {
        Ok(_) if size > 0 => Some(size),
        _ => None,
    }
}

/// Reads the image and the device back and compares SHA-256 digests.
///
/// Emits no progress events; verification is observable only through the
/// terminal result and the logs.
fn verify(
    image: &Path,
    device: &Path,
    total_bytes: u64,
    chunk_size: usize,
    cancel: &AtomicBool,
    lease: &Lease,
) -> Result<(), ToastError> {
    debug!(device = %device.display(), "verifying written image");

    let verify_err = |source| ToastError::Write {
        bytes_written: total_bytes,
        source,
    };
    let mut source = File::open(image).map_err(verify_err)?;
    let mut target = File::open(device).map_err(verify_err)?;

    let mut source_hash = Sha256::new();
    let mut target_hash = Sha256::new();
    let mut source_buf = vec![0u8; chunk_size];
    let mut target_buf = vec![0u8; chunk_size];

    let mut remaining = total_bytes;
    while remaining > 0 {
        if cancel.load(Ordering::SeqCst) {
            return Err(ToastError::Cancelled);
        }
        if lease.is_revoked() {
            return Err(ToastError::DeviceLost);
        }

        let chunk = std::cmp::min(chunk_size as u64, remaining) as usize;
        source
            .read_exact(&mut source_buf[..chunk])
            .map_err(verify_err)?;
        target
            .read_exact(&mut target_buf[..chunk])
            .map_err(verify_err)?;
        source_hash.update(&source_buf[..chunk]);
        target_hash.update(&target_buf[..chunk]);
        remaining -= chunk as u64;
    }

    if source_hash.finalize() != target_hash.finalize() {
        return Err(ToastError::VerifyMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::device::Descriptor;
    use crate::tracker::{Lease, ToastTracker};

    /// Opens whatever path it is handed, creating it if needed.
    struct PathOpener {
        opens: AtomicUsize,
    }

    impl PathOpener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl TargetOpener for PathOpener {
        fn open(&self, device: &Path) -> io::Result<File> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            OpenOptions::new().write(true).create(true).open(device)
        }

        fn escalate(&self, _device: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    /// Denies the first open; whether the post-escalation retry succeeds
    /// is configurable.
    struct FussyOpener {
        opens: AtomicUsize,
        escalations: AtomicUsize,
        grant_access: bool,
    }

    impl TargetOpener for FussyOpener {
        fn open(&self, device: &Path) -> io::Result<File> {
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 || !self.grant_access {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "device node is root-owned",
                ));
            }
            OpenOptions::new().write(true).create(true).open(device)
        }

        fn escalate(&self, _device: &Path) -> io::Result<()> {
            self.escalations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Parks `open` until the test releases the gate, so cancellation
    /// and revocation land deterministically before the first chunk.
    struct GatedOpener {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl TargetOpener for GatedOpener {
        fn open(&self, device: &Path) -> io::Result<File> {
            let _ = self.gate.lock().unwrap().recv();
            OpenOptions::new().write(true).create(true).open(device)
        }

        fn escalate(&self, _device: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    fn lease_for(tracker: &ToastTracker) -> Lease {
        tracker
            .begin_toast(&Descriptor::from("Generic Flash, 16 GiB (/dev/sdz)"))
            .unwrap()
    }

    fn options(opener: Arc<dyn TargetOpener>, verify: bool, chunk_size: usize) -> WriteOptions {
        WriteOptions {
            verify,
            chunk_size,
            opener,
        }
    }

    #[test]
    fn missing_source_fails_before_the_target_opener_runs() {
        let tracker = ToastTracker::new();
        let opener = PathOpener::new();

        let handle = start(
            WriteRequest {
                image: PathBuf::from("/nonexistent/distro.img"),
                device: PathBuf::from("/dev/sdz"),
            },
            lease_for(&tracker),
            options(opener.clone(), true, 1024),
        );

        let err = handle.wait().unwrap_err();
        assert!(
            matches!(err, ToastError::SourceNotFound(path) if path == Path::new("/nonexistent/distro.img"))
        );
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn copies_the_image_and_reports_monotonic_progress() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        let target = dir.path().join("target.bin");
        let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&image, &payload).unwrap();

        let tracker = ToastTracker::new();
        let opener = PathOpener::new();
        let handle = start(
            WriteRequest {
                image,
                device: target.clone(),
            },
            lease_for(&tracker),
            options(opener.clone(), true, 1024),
        );

        let mut progress = Vec::new();
        let mut outcome = None;
        for event in handle.events().iter() {
            match event {
                WriteEvent::Progress {
                    bytes_written,
                    total_bytes,
                } => {
                    assert_eq!(total_bytes, payload.len() as u64);
                    progress.push(bytes_written);
                }
                WriteEvent::Done(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }

        assert_eq!(progress.first().copied(), Some(0));
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last().copied(), Some(payload.len() as u64));
        assert_eq!(outcome.unwrap().unwrap(), payload.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_chunk_size_still_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        let target = dir.path().join("target.bin");
        let payload = vec![7u8; 512];
        std::fs::write(&image, &payload).unwrap();

        let tracker = ToastTracker::new();
        let handle = start(
            WriteRequest {
                image,
                device: target.clone(),
            },
            lease_for(&tracker),
            options(PathOpener::new(), false, 0),
        );

        assert_eq!(handle.wait().unwrap(), 512);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn escalates_once_and_retries_the_open() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        std::fs::write(&image, vec![7u8; 2048]).unwrap();

        let tracker = ToastTracker::new();
        let opener = Arc::new(FussyOpener {
            opens: AtomicUsize::new(0),
            escalations: AtomicUsize::new(0),
            grant_access: true,
        });

        let handle = start(
            WriteRequest {
                image,
                device: dir.path().join("target.bin"),
            },
            lease_for(&tracker),
            options(opener.clone(), false, 1024),
        );

        assert_eq!(handle.wait().unwrap(), 2048);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.escalations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_permission_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        std::fs::write(&image, vec![7u8; 2048]).unwrap();

        let tracker = ToastTracker::new();
        let opener = Arc::new(FussyOpener {
            opens: AtomicUsize::new(0),
            escalations: AtomicUsize::new(0),
            grant_access: false,
        });

        let handle = start(
            WriteRequest {
                image,
                device: PathBuf::from("/dev/sdz"),
            },
            lease_for(&tracker),
            options(opener.clone(), false, 1024),
        );

        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ToastError::PermissionDenied { .. }));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.escalations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn io_failure_mid_copy_is_terminal_and_counts_bytes() {
        // A read-only handle makes the very first chunk write fail.
        struct ReadOnlyOpener;
        impl TargetOpener for ReadOnlyOpener {
            fn open(&self, device: &Path) -> io::Result<File> {
                File::open(device)
            }
            fn escalate(&self, _device: &Path) -> io::Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        let target = dir.path().join("target.bin");
        std::fs::write(&image, vec![7u8; 4096]).unwrap();
        std::fs::write(&target, b"").unwrap();

        let tracker = ToastTracker::new();
        let handle = start(
            WriteRequest {
                image,
                device: target,
            },
            lease_for(&tracker),
            options(Arc::new(ReadOnlyOpener), false, 1024),
        );

        let err = handle.wait().unwrap_err();
        assert!(matches!(
            err,
            ToastError::Write {
                bytes_written: 0,
                ..
            }
        ));
    }

    #[test]
    fn cancellation_lands_at_the_next_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        std::fs::write(&image, vec![7u8; 64 * 1024]).unwrap();

        let (gate_tx, gate_rx) = mpsc::channel();
        let tracker = ToastTracker::new();
        let handle = start(
            WriteRequest {
                image,
                device: dir.path().join("target.bin"),
            },
            lease_for(&tracker),
            options(
                Arc::new(GatedOpener {
                    gate: Mutex::new(gate_rx),
                }),
                false,
                1024,
            ),
        );

        handle.cancel();
        let _ = gate_tx.send(());

        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ToastError::Cancelled));
    }

    #[test]
    fn cancellation_during_decompression_never_opens_the_target() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img.gz");

        // Zeros compress to almost nothing, so the fixture stays small
        // while the decompressed stream is long enough that the cancel
        // lands mid-staging.
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let zeros = vec![0u8; 1024 * 1024];
        for _ in 0..256 {
            encoder.write_all(&zeros).unwrap();
        }
        std::fs::write(&image, encoder.finish().unwrap()).unwrap();

        let tracker = ToastTracker::new();
        let opener = PathOpener::new();
        let handle = start(
            WriteRequest {
                image,
                device: dir.path().join("target.bin"),
            },
            lease_for(&tracker),
            options(opener.clone(), true, 1024),
        );
        handle.cancel();

        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ToastError::Cancelled));
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn revoked_lease_surfaces_as_device_lost() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        std::fs::write(&image, vec![7u8; 64 * 1024]).unwrap();

        let descriptor = Descriptor::from("Generic Flash, 16 GiB (/dev/sdz)");
        let tracker = ToastTracker::new();
        let lease = tracker.begin_toast(&descriptor).unwrap();

        let (gate_tx, gate_rx) = mpsc::channel();
        let handle = start(
            WriteRequest {
                image,
                device: dir.path().join("target.bin"),
            },
            lease,
            options(
                Arc::new(GatedOpener {
                    gate: Mutex::new(gate_rx),
                }),
                false,
                1024,
            ),
        );

        tracker.revoke_removed(&std::collections::BTreeSet::from([descriptor.clone()]));
        let _ = gate_tx.send(());

        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ToastError::DeviceLost));
        assert!(!tracker.is_busy(&descriptor));
    }

    #[test]
    fn compressed_source_totals_the_decompressed_length() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img.gz");
        let target = dir.path().join("target.bin");
        let payload: Vec<u8> = (0..48 * 1024).map(|i| (i % 199) as u8).collect();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        std::fs::write(&image, encoder.finish().unwrap()).unwrap();

        let tracker = ToastTracker::new();
        let handle = start(
            WriteRequest {
                image,
                device: target.clone(),
            },
            lease_for(&tracker),
            options(PathOpener::new(), true, 4096),
        );

        let mut total_seen = None;
        let mut outcome = None;
        for event in handle.events().iter() {
            match event {
                WriteEvent::Progress { total_bytes, .. } => total_seen = Some(total_bytes),
                WriteEvent::Done(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }

        assert_eq!(total_seen, Some(payload.len() as u64));
        assert_eq!(outcome.unwrap().unwrap(), payload.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn verification_mismatch_is_terminal() {
        // Writes land in a decoy file while verification reads back the
        // (different) bytes at the request's device path.
        struct DecoyOpener {
            decoy: PathBuf,
        }
        impl TargetOpener for DecoyOpener {
            fn open(&self, _device: &Path) -> io::Result<File> {
                OpenOptions::new().write(true).create(true).open(&self.decoy)
            }
            fn escalate(&self, _device: &Path) -> io::Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        let device = dir.path().join("device.bin");
        std::fs::write(&image, vec![0xAAu8; 8192]).unwrap();
        std::fs::write(&device, vec![0x55u8; 8192]).unwrap();

        let tracker = ToastTracker::new();
        let handle = start(
            WriteRequest { image, device },
            lease_for(&tracker),
            options(
                Arc::new(DecoyOpener {
                    decoy: dir.path().join("decoy.bin"),
                }),
                true,
                1024,
            ),
        );

        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ToastError::VerifyMismatch));
    }

    #[test]
    fn lease_is_released_before_the_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("distro.img");
        std::fs::write(&image, vec![7u8; 1024]).unwrap();

        let descriptor = Descriptor::from("Generic Flash, 16 GiB (/dev/sdz)");
        let tracker = ToastTracker::new();
        let lease = tracker.begin_toast(&descriptor).unwrap();

        let handle = start(
            WriteRequest {
                image,
                device: dir.path().join("target.bin"),
            },
            lease,
            options(PathOpener::new(), false, 1024),
        );

        loop {
            match handle.events().recv().unwrap() {
                WriteEvent::Progress { .. } => continue,
                WriteEvent::Done(result) => {
                    result.unwrap();
                    break;
                }
            }
        }
        assert!(!tracker.is_busy(&descriptor));
        assert!(tracker.begin_toast(&descriptor).is_ok());
    }
}
