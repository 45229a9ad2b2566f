//! POSIX named semaphores
//!
//! Thin wrapper over `sem_open` and friends. A named semaphore lives in the
//! system namespace until it is unlinked, independent of the processes that
//! have it open.

use crate::error::{KvError, Result};
use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

/// Handle to an open named semaphore
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: sem_wait/sem_post are thread-safe, and the handle is only closed on drop
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open a named semaphore, creating it with `initial` if absent
    ///
    /// An existing semaphore keeps its current count.
    pub fn open(name: &str, initial: u32) -> Result<Self> {
        let c_name = c_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                0o600 as libc::c_uint,
                initial as libc::c_uint,
            )
        };

        if sem == libc::SEM_FAILED {
            return Err(KvError::sync(name, io::Error::last_os_error()));
        }

        let sem = NonNull::new(sem)
            .ok_or_else(|| KvError::sync(name, io::Error::from(io::ErrorKind::InvalidData)))?;

        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    /// Decrement, blocking until the count is positive
    ///
    /// There is no timeout: a caller waits until a counterpart posts.
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: sem was returned by sem_open and is still open
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(KvError::sync(&self.name, err));
            }
        }
    }

    /// Increment, waking one waiter
    pub fn post(&self) -> Result<()> {
        // SAFETY: sem was returned by sem_open and is still open
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(KvError::sync(&self.name, io::Error::last_os_error()))
        }
    }

    /// Current count
    pub fn value(&self) -> Result<i32> {
        let mut value: libc::c_int = 0;
        // SAFETY: sem is open and value is a valid out pointer
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } == 0 {
            Ok(value)
        } else {
            Err(KvError::sync(&self.name, io::Error::last_os_error()))
        }
    }

    /// Name in the system namespace
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove a named semaphore from the system namespace
    ///
    /// Processes that still have it open keep a working handle.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(KvError::Teardown {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            })
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: sem is open and is not used after this point
        if unsafe { libc::sem_close(self.sem.as_ptr()) } != 0 {
            tracing::error!(
                name = %self.name,
                error = %io::Error::last_os_error(),
                "Failed to close semaphore"
            );
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| KvError::InvalidName {
        name: name.to_string(),
    })
}
