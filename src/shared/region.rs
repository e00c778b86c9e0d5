//! File-backed shared mapping with a process-shared mutex.
//!
//! The producer creates the backing file (normally under `/dev/shm`) and
//! initialises the mutex; the consumer attaches with `SharedState::open`.
//! Everything except the magic word is read and written only while the
//! mutex is held.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::{size_of, MaybeUninit};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{GazeTarget, TargetSink};
use crate::error::SharedStateError;

const MAGIC: u64 = 0x4559_4543_4154_4348; // "EYECATCH"
const LAYOUT_VERSION: u32 = 1;

/// Maximum size of the serialized config block.
pub const CONFIG_CAPACITY: usize = 4096;

#[repr(C)]
struct Layout {
    magic: AtomicU64,
    version: u32,
    layout_size: u32,
    mutex: libc::pthread_mutex_t,
    target: GazeTarget,
    sequence: u64,
    config_len: u32,
    config: [u8; CONFIG_CAPACITY],
}

/// Target plus the number of publishes that produced it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot {
    pub target: GazeTarget,
    pub sequence: u64,
}

/// Handle to the shared block. Cheap to share between threads.
pub struct SharedState {
    layout: NonNull<Layout>,
    path: PathBuf,
}

// All access to the mapping goes through the process-shared mutex.
unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    /// Create a fresh block at `path`, replacing any previous one.
    ///
    /// Consumers attached to a previous block keep their old mapping and
    /// must re-attach.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SharedStateError> {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("replaced stale shared state at {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(path, e)),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.set_len(size_of::<Layout>() as u64)
            .map_err(|e| io_error(path, e))?;

        let layout = map(&file, path)?;
        let state = Self {
            layout,
            path: path.to_path_buf(),
        };

        // The file was just created, so the block is zeroed and private to us
        // until the magic word is published.
        let raw = state.layout.as_ptr();
        unsafe {
            init_mutex(addr_of_mut!((*raw).mutex)).map_err(SharedStateError::Lock)?;
            (*raw).version = LAYOUT_VERSION;
            (*raw).layout_size = size_of::<Layout>() as u32;
            (*raw).magic.store(MAGIC, Ordering::Release);
        }
        log::info!(
            "shared state created at {} ({} bytes)",
            path.display(),
            size_of::<Layout>()
        );
        Ok(state)
    }

    /// Attach to a block created by another process.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SharedStateError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        let len = file.metadata().map_err(|e| io_error(path, e))?.len();
        if len < size_of::<Layout>() as u64 {
            return Err(SharedStateError::Layout {
                path: path.to_path_buf(),
            });
        }

        let state = Self {
            layout: map(&file, path)?,
            path: path.to_path_buf(),
        };
        let raw = state.layout.as_ptr();
        let compatible = unsafe {
            (*raw).magic.load(Ordering::Acquire) == MAGIC
                && (*raw).version == LAYOUT_VERSION
                && (*raw).layout_size == size_of::<Layout>() as u32
        };
        if !compatible {
            return Err(SharedStateError::Layout {
                path: path.to_path_buf(),
            });
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the gaze target.
    pub fn publish(&self, target: GazeTarget) -> Result<(), SharedStateError> {
        let guard = self.lock()?;
        let raw = guard.raw();
        unsafe {
            (*raw).target = target;
            (*raw).sequence = (*raw).sequence.wrapping_add(1);
        }
        Ok(())
    }

    /// Read the current target and publish count as one consistent pair.
    pub fn snapshot(&self) -> Result<Snapshot, SharedStateError> {
        let guard = self.lock()?;
        let raw = guard.raw();
        Ok(unsafe {
            Snapshot {
                target: (*raw).target,
                sequence: (*raw).sequence,
            }
        })
    }

    pub fn read_target(&self) -> Result<GazeTarget, SharedStateError> {
        Ok(self.snapshot()?.target)
    }

    /// Store `value` as the config block (JSON encoded).
    pub fn write_config<T: Serialize>(&self, value: &T) -> Result<(), SharedStateError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_config_bytes(&bytes)
    }

    pub fn write_config_bytes(&self, bytes: &[u8]) -> Result<(), SharedStateError> {
        if bytes.len() > CONFIG_CAPACITY {
            return Err(SharedStateError::ConfigTooLarge {
                len: bytes.len(),
                capacity: CONFIG_CAPACITY,
            });
        }
        let guard = self.lock()?;
        let raw = guard.raw();
        unsafe {
            let dst = addr_of_mut!((*raw).config).cast::<u8>();
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            (*raw).config_len = bytes.len() as u32;
        }
        Ok(())
    }

    /// Decode the config block; `None` when nothing was written yet.
    pub fn read_config<T: DeserializeOwned>(&self) -> Result<Option<T>, SharedStateError> {
        let bytes = self.config_bytes()?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn config_bytes(&self) -> Result<Vec<u8>, SharedStateError> {
        let guard = self.lock()?;
        let raw = guard.raw();
        let bytes = unsafe {
            let len = ((*raw).config_len as usize).min(CONFIG_CAPACITY);
            let src = addr_of_mut!((*raw).config).cast::<u8>();
            std::slice::from_raw_parts(src, len).to_vec()
        };
        Ok(bytes)
    }

    fn lock(&self) -> Result<Guard<'_>, SharedStateError> {
        let mutex = self.mutex();
        let rc = unsafe { libc::pthread_mutex_lock(mutex) };
        match rc {
            0 => {}
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                // A peer died inside the critical section; keep its data
                // and make the mutex usable again.
                log::warn!("shared state lock owner died; recovering");
                let rc = unsafe { libc::pthread_mutex_consistent(mutex) };
                if rc != 0 {
                    return Err(SharedStateError::Lock(io::Error::from_raw_os_error(rc)));
                }
            }
            err => return Err(SharedStateError::Lock(io::Error::from_raw_os_error(err))),
        }
        Ok(Guard { state: self })
    }

    fn mutex(&self) -> *mut libc::pthread_mutex_t {
        unsafe { addr_of_mut!((*self.layout.as_ptr()).mutex) }
    }
}

impl TargetSink for SharedState {
    fn publish(&self, target: GazeTarget) -> Result<(), SharedStateError> {
        SharedState::publish(self, target)
    }
}

impl Drop for SharedState {
    fn drop(&mut self) {
        // The mutex is left alone: the peer process may still be using it.
        unsafe {
            libc::munmap(self.layout.as_ptr().cast(), size_of::<Layout>());
        }
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

struct Guard<'a> {
    state: &'a SharedState,
}

impl Guard<'_> {
    fn raw(&self) -> *mut Layout {
        self.state.layout.as_ptr()
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.state.mutex());
        }
    }
}

fn map(file: &File, path: &Path) -> Result<NonNull<Layout>, SharedStateError> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size_of::<Layout>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io_error(path, io::Error::last_os_error()));
    }
    NonNull::new(addr.cast::<Layout>()).ok_or_else(|| SharedStateError::Layout {
        path: path.to_path_buf(),
    })
}

unsafe fn init_mutex(mutex: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
    let result = configure_and_init(mutex, attr.as_mut_ptr());
    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
    result
}

unsafe fn configure_and_init(
    mutex: *mut libc::pthread_mutex_t,
    attr: *mut libc::pthread_mutexattr_t,
) -> io::Result<()> {
    check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))?;
    #[cfg(target_os = "linux")]
    check(libc::pthread_mutexattr_setrobust(
        attr,
        libc::PTHREAD_MUTEX_ROBUST,
    ))?;
    check(libc::pthread_mutex_init(mutex, attr))
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

fn io_error(path: &Path, source: io::Error) -> SharedStateError {
    SharedStateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn consumer_mapping_sees_producer_writes() -> Result<(), SharedStateError> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gaze");
        let producer = SharedState::create(&path)?;
        let consumer = SharedState::open(&path)?;

        assert_eq!(consumer.read_target()?, GazeTarget::default());
        producer.publish(GazeTarget::new(0.25, 1.5))?;
        let snap = consumer.snapshot()?;
        assert_eq!(snap.target, GazeTarget::new(0.25, 1.5));
        assert_eq!(snap.sequence, 1);
        Ok(())
    }

    #[test]
    fn open_rejects_foreign_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; size_of::<Layout>()]).expect("write junk");
        assert!(matches!(
            SharedState::open(&path),
            Err(SharedStateError::Layout { .. })
        ));

        std::fs::write(&path, b"short").expect("write short");
        assert!(matches!(
            SharedState::open(&path),
            Err(SharedStateError::Layout { .. })
        ));

        assert!(matches!(
            SharedState::open(dir.path().join("missing")),
            Err(SharedStateError::Io { .. })
        ));
    }

    #[test]
    fn config_block_round_trips_and_is_bounded() -> Result<(), SharedStateError> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gaze");
        let producer = SharedState::create(&path)?;
        let consumer = SharedState::open(&path)?;

        assert_eq!(consumer.read_config::<serde_json::Value>()?, None);

        let cfg = serde_json::json!({"blink_interval_s": 4.0, "pupil": "round"});
        consumer.write_config(&cfg)?;
        assert_eq!(producer.read_config::<serde_json::Value>()?, Some(cfg));

        let oversized = vec![b'x'; CONFIG_CAPACITY + 1];
        assert!(matches!(
            producer.write_config_bytes(&oversized),
            Err(SharedStateError::ConfigTooLarge { .. })
        ));
        Ok(())
    }

    #[test]
    fn recreate_replaces_previous_block() -> Result<(), SharedStateError> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gaze");
        let first = SharedState::create(&path)?;
        first.publish(GazeTarget::new(0.9, 0.9))?;
        drop(first);

        let second = SharedState::create(&path)?;
        assert_eq!(second.snapshot()?.sequence, 0);
        assert_eq!(SharedState::open(&path)?.read_target()?, GazeTarget::default());
        Ok(())
    }

    #[test]
    fn readers_never_observe_a_torn_pair() -> Result<(), SharedStateError> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("gaze");
        let producer = Arc::new(SharedState::create(&path)?);
        let done = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..3 {
            let consumer = SharedState::open(&path)?;
            let done = Arc::clone(&done);
            readers.push(thread::spawn(move || -> Result<u64, SharedStateError> {
                let mut last_seq = 0;
                let mut reads = 0;
                while !done.load(Ordering::Acquire) {
                    let snap = consumer.snapshot()?;
                    assert_eq!(snap.target.x, snap.target.y, "torn read");
                    assert!(snap.sequence >= last_seq, "sequence went backwards");
                    last_seq = snap.sequence;
                    reads += 1;
                }
                Ok(reads)
            }));
        }

        let writer = {
            let producer = Arc::clone(&producer);
            thread::spawn(move || -> Result<(), SharedStateError> {
                for k in 0..20_000u32 {
                    let v = k as f32;
                    producer.publish(GazeTarget::new(v, v))?;
                }
                Ok(())
            })
        };
        writer.join().expect("writer thread")?;
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().expect("reader thread")?;
        }

        let snap = producer.snapshot()?;
        assert_eq!(snap.sequence, 20_000);
        assert_eq!(snap.target, GazeTarget::new(19_999.0, 19_999.0));
        Ok(())
    }
}
