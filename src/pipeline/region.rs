//! Named shared memory region backing one render session
//!
//! Layout: a fixed [`HEADER_SIZE`] byte header holding atomics shared by both
//! sides of the worker boundary, followed by the frame area used by
//! [`SharedFrameBuffer`](super::SharedFrameBuffer).
//!
//! ```text
//! 0               64                                   64 + capacity
//! +---------------+-------------------------------------+
//! | RegionHeader  | frame bytes (one frame at a time)   |
//! +---------------+-------------------------------------+
//! ```

use std::collections::HashSet;
use std::ffi::CString;
use std::io::{self, Error, ErrorKind};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use log::{debug, info};

use super::error::FailureKind;

/// Bytes reserved in front of the frame area.
pub const HEADER_SIZE: usize = 64;

const REGION_MAGIC: u32 = 0x5047_5331; // "PGS1"

/// Shared header at offset 0 of every region.
#[repr(C)]
pub(crate) struct RegionHeader {
    magic: AtomicU32,
    status: AtomicU32,
    failure: AtomicU32,
    failed_page: AtomicU32,
    remaining: AtomicU32,
    skipped: AtomicU32,
    pub(crate) focus: AtomicU64,
    frame_capacity: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= HEADER_SIZE);

const NO_PAGE: u32 = u32::MAX;

/// Lifecycle of the worker as seen through the region header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Finished,
    Interrupted,
    Failed,
}

impl SessionStatus {
    const fn code(self) -> u32 {
        match self {
            Self::Running => 0,
            Self::Finished => 1,
            Self::Interrupted => 2,
            Self::Failed => 3,
        }
    }

    const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Finished,
            2 => Self::Interrupted,
            3 => Self::Failed,
            _ => Self::Running,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What the worker leaves behind in the header when it exits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitRecord {
    pub status: SessionStatus,
    pub failure: Option<FailureKind>,
    pub failed_page: Option<u32>,
    /// Pages still in the pending set at exit
    pub remaining: u32,
    /// Pages dropped by the skip-page render policy
    pub skipped: u32,
}

impl ExitRecord {
    #[must_use]
    pub const fn running() -> Self {
        Self {
            status: SessionStatus::Running,
            failure: None,
            failed_page: None,
            remaining: 0,
            skipped: 0,
        }
    }
}

/// A POSIX shared memory object mapped into this process.
///
/// The creating side owns the name and unlinks it on drop; the opening side
/// only unmaps.
pub struct SharedRegion {
    name: String,
    ptr: *mut u8,
    size: usize,
    fd: libc::c_int,
    owner: bool,
}

// SAFETY: the mapping is owned exclusively by this value. Header fields are
// atomics; the frame area is only touched under the ack handshake.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a fresh region with room for `frame_capacity` frame bytes.
    pub fn create(name: &str, frame_capacity: usize) -> io::Result<Self> {
        let c_name = c_name(name)?;
        let size = HEADER_SIZE
            .checked_add(frame_capacity)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "frame capacity too large"))?;

        // Unlink any stale region left by a crashed run first
        unsafe {
            libc::shm_unlink(c_name.as_ptr());
        }

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(err);
        }

        let ptr = match map(fd, size) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(err);
            }
        };

        let region = Self {
            name: name.to_string(),
            ptr,
            size,
            fd,
            owner: true,
        };

        let header = region.header();
        header.focus.store(0, Ordering::Relaxed);
        header.failed_page.store(NO_PAGE, Ordering::Relaxed);
        header
            .frame_capacity
            .store(frame_capacity as u64, Ordering::Relaxed);
        header.status.store(SessionStatus::Running.code(), Ordering::Relaxed);
        header.magic.store(REGION_MAGIC, Ordering::Release);

        live_regions()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(region.name.clone());

        let capacity_mb = frame_capacity as f64 / (1024.0 * 1024.0);
        info!("region {name} created: {capacity_mb:.1} MB frame area");

        Ok(region)
    }

    /// Maps an existing region created by another process or thread.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = c_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }

        let size = stat.st_size as usize;
        if size < HEADER_SIZE {
            unsafe {
                libc::close(fd);
            }
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("region {name} is {size} bytes, smaller than its header"),
            ));
        }

        let ptr = match map(fd, size) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                return Err(err);
            }
        };

        let region = Self {
            name: name.to_string(),
            ptr,
            size,
            fd,
            owner: false,
        };

        let header = region.header();
        if header.magic.load(Ordering::Acquire) != REGION_MAGIC {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("region {name} has no pagestream header"),
            ));
        }
        let capacity = header.frame_capacity.load(Ordering::Relaxed) as usize;
        if HEADER_SIZE.saturating_add(capacity) > size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("region {name} advertises {capacity} frame bytes but maps {size}"),
            ));
        }

        debug!("region {name} opened ({size} bytes)");
        Ok(region)
    }

    /// Returns a process-unique region name.
    #[must_use]
    pub fn unique_name() -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("/pgs_{}_{}", std::process::id(), id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Frame area capacity in bytes.
    pub fn frame_capacity(&self) -> usize {
        self.header().frame_capacity.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn header(&self) -> &RegionHeader {
        // SAFETY: the mapping is page aligned, at least HEADER_SIZE bytes and
        // lives as long as self. RegionHeader is repr(C) and all-atomic.
        unsafe { &*(self.ptr as *const RegionHeader) }
    }

    /// Start of the frame area.
    pub(crate) fn frame_ptr(&self) -> *mut u8 {
        // SAFETY: HEADER_SIZE <= size, checked on create/open.
        unsafe { self.ptr.add(HEADER_SIZE) }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_code(self.header().status.load(Ordering::Acquire))
    }

    /// Publishes the worker's exit record; the status store comes last so a
    /// reader that observes a terminal status sees the rest of the record.
    pub fn publish_exit(&self, record: &ExitRecord) {
        let header = self.header();
        header
            .failure
            .store(record.failure.map_or(0, FailureKind::code), Ordering::Relaxed);
        header
            .failed_page
            .store(record.failed_page.unwrap_or(NO_PAGE), Ordering::Relaxed);
        header.remaining.store(record.remaining, Ordering::Relaxed);
        header.skipped.store(record.skipped, Ordering::Relaxed);
        header.status.store(record.status.code(), Ordering::Release);
    }

    pub fn exit_record(&self) -> ExitRecord {
        let header = self.header();
        let status = SessionStatus::from_code(header.status.load(Ordering::Acquire));
        let failed_page = header.failed_page.load(Ordering::Relaxed);
        ExitRecord {
            status,
            failure: FailureKind::from_code(header.failure.load(Ordering::Relaxed)),
            failed_page: (failed_page != NO_PAGE).then_some(failed_page),
            remaining: header.remaining.load(Ordering::Relaxed),
            skipped: header.skipped.load(Ordering::Relaxed),
        }
    }

    fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_str()) {
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
        live_regions()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
            self.ptr = ptr::null_mut();
        }

        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }

        if self.owner {
            self.unlink();
            debug!("region {} released", self.name);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| Error::new(ErrorKind::InvalidInput, "name contains null byte"))
}

fn map(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

/// Names of regions created (and therefore owned) by this process.
fn live_regions() -> &'static Mutex<HashSet<String>> {
    static LIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Unlinks every region this process still owns. Called from the panic hook
/// so crashed sessions do not leak objects in `/dev/shm`.
pub fn cleanup_all_regions() {
    let names: Vec<String> = live_regions()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();

    for name in names {
        if let Ok(c_name) = CString::new(name) {
            unsafe {
                libc::shm_unlink(c_name.as_ptr());
            }
        }
    }
}
