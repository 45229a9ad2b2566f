//! Low-level POSIX shared memory operations

use crate::error::{KvError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

/// How often an opener re-checks an object that is still empty
const SIZE_WAIT_INTERVAL: Duration = Duration::from_millis(1);

/// Polls before an empty object is reported as broken
const SIZE_WAIT_ATTEMPTS: u32 = 1000;

/// Prefix of every object shmkv puts in the system namespace
pub const SHMKV_PREFIX: &str = "/shmkv_";

/// Longest suffix appended to a store name (semaphore names)
const LONGEST_SUFFIX: &str = ".resource";

/// Longest store name accepted. Named semaphores allow NAME_MAX - 4 bytes.
pub const MAX_NAME_LEN: usize = 251 - SHMKV_PREFIX.len() - LONGEST_SUFFIX.len();

/// Build the namespace name of an object belonging to store `name`
pub fn object_name(name: &str, suffix: &str) -> Result<String> {
    if name.len() > MAX_NAME_LEN {
        return Err(KvError::NameTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    if name.is_empty() || name.contains(&['/', '\0'][..]) {
        return Err(KvError::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(format!("{}{}{}", SHMKV_PREFIX, name, suffix))
}

/// A mapped shared memory segment
///
/// Dropping the handle unmaps it; the object stays in the namespace until
/// [`SharedSegment::unlink`] is called.
pub struct SharedSegment {
    addr: NonNull<u8>,
    size: usize,
    name: String,
}

// SAFETY: the mapping is owned by the handle; access to its contents is
// synchronized by the store's semaphores
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Open the segment for store `name`, creating it if absent
    ///
    /// A freshly created object is sized to `size` and reads as zeroes. An
    /// existing object is mapped as is, and must be at least `size` bytes;
    /// only the process that created it ever resizes it.
    pub fn open_or_create(name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(name)?;

        // Try to create exclusively first, fall back to open if exists
        let (fd, created) = match shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EXIST) => {
                let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty())
                    .map_err(|e| KvError::segment(name, e))?;
                (fd, false)
            }
            Err(e) => return Err(KvError::segment(name, e)),
        };

        // Only the creator sizes the object
        if created {
            ftruncate(&fd, size as u64).map_err(|e| KvError::segment(name, e))?;
            tracing::debug!(name = %name, size = size, "Sized shared segment");
        } else {
            let existing = wait_for_size(&fd, name)?;
            if existing < size {
                return Err(KvError::LayoutMismatch {
                    field: "segment size",
                    expected: size as u64,
                    found: existing as u64,
                });
            }
        }

        // Map to memory
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|e| KvError::segment(name, e))?
        };

        let addr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
            KvError::segment(name, io::Error::from(io::ErrorKind::AddrNotAvailable))
        })?;

        tracing::debug!(name = %name, size = size, "Mapped shared segment");

        Ok(Self {
            addr,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the segment of store `name` from the system namespace
    ///
    /// Existing mappings in other processes stay valid until unmapped.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = c_name(name)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| KvError::Teardown {
            name: object_name(name, "").unwrap_or_else(|_| name.to_string()),
            source: e.into(),
        })
    }

    /// Start of the mapping
    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.addr
    }

    /// Get raw pointer to the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the store name this segment belongs to
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: addr and size describe the mapping created in open_or_create
        if let Err(e) = unsafe { munmap(self.addr.as_ptr().cast(), self.size) } {
            tracing::error!(name = %self.name, error = %e, "Failed to unmap shared segment");
        }
    }
}

/// Size of an object another process created, once it has been sized
///
/// A fresh object reads as empty until its creator's ftruncate lands.
fn wait_for_size(fd: &OwnedFd, name: &str) -> Result<usize> {
    for _ in 0..SIZE_WAIT_ATTEMPTS {
        let size = fstat(fd).map_err(|e| KvError::segment(name, e))?.st_size as usize;
        if size > 0 {
            return Ok(size);
        }
        thread::sleep(SIZE_WAIT_INTERVAL);
    }

    Err(KvError::segment(
        name,
        io::Error::new(io::ErrorKind::TimedOut, "segment was never sized by its creator"),
    ))
}

fn c_name(name: &str) -> Result<CString> {
    let full_name = object_name(name, "")?;
    CString::new(full_name).map_err(|_| KvError::InvalidName {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = format!("test_shm_create_{}", std::process::id());
        let size = 4096;

        let first = SharedSegment::open_or_create(&name, size).unwrap();
        assert_eq!(first.size(), size);

        // Fresh objects read as zeroes
        let val = unsafe { std::ptr::read(first.as_ptr().add(100)) };
        assert_eq!(val, 0u8);

        unsafe {
            std::ptr::write(first.as_ptr(), 42u8);
        }

        // Open from another "process"
        let second = SharedSegment::open_or_create(&name, size).unwrap();
        let val = unsafe { std::ptr::read(second.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(second);
        drop(first);
        SharedSegment::unlink(&name).unwrap();
    }

    #[test]
    fn test_existing_segment_too_small() {
        let name = format!("test_shm_small_{}", std::process::id());
        let small = SharedSegment::open_or_create(&name, 4096).unwrap();

        let err = SharedSegment::open_or_create(&name, 8192).err().unwrap();
        assert!(matches!(err, KvError::LayoutMismatch { .. }));

        drop(small);
        SharedSegment::unlink(&name).unwrap();
    }

    #[test]
    fn test_opener_never_resizes_foreign_object() {
        let name = format!("test_shm_foreign_{}", std::process::id());
        let c_name = c_name(&name).unwrap();

        // Another creator has made the object but not sized it yet
        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .unwrap();
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ftruncate(&fd, 4096).unwrap();
        });

        // A larger opener waits for the creator, then refuses to grow it
        let err = SharedSegment::open_or_create(&name, 8192).err().unwrap();
        assert!(matches!(
            err,
            KvError::LayoutMismatch {
                expected: 8192,
                found: 4096,
                ..
            }
        ));
        creator.join().unwrap();

        let segment = SharedSegment::open_or_create(&name, 4096).unwrap();
        assert_eq!(segment.size(), 4096);

        drop(segment);
        SharedSegment::unlink(&name).unwrap();
    }

    #[test]
    fn test_unlink_twice_fails() {
        let name = format!("test_shm_unlink_{}", std::process::id());
        drop(SharedSegment::open_or_create(&name, 4096).unwrap());

        SharedSegment::unlink(&name).unwrap();
        assert!(matches!(
            SharedSegment::unlink(&name),
            Err(KvError::Teardown { .. })
        ));
    }

    #[test]
    fn test_name_validation() {
        assert!(matches!(
            object_name("", ""),
            Err(KvError::InvalidName { .. })
        ));
        assert!(matches!(
            object_name("a/b", ""),
            Err(KvError::InvalidName { .. })
        ));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            object_name(&long, ""),
            Err(KvError::NameTooLong { .. })
        ));
        assert_eq!(object_name("db", ".mutex").unwrap(), "/shmkv_db.mutex");
    }
}
