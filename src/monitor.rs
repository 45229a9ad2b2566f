//! Readers-writers monitor over two named semaphores
//!
//! First-reader/last-reader protocol:
//!
//! - `mutex` guards the reader count kept in the shared header.
//! - `resource` guards the shard data. A writer holds it directly; the reader
//!   group holds it from the moment the first reader enters until the last
//!   reader leaves.
//!
//! Entry and exit are tied to guard lifetimes, so every return path of a read
//! or write runs the matching exit protocol.

use crate::error::Result;
use crate::semaphore::NamedSemaphore;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Proof that the caller is inside the reader or writer section
pub trait Held: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

/// Readers-writers monitor shared by every process attached to a store
pub struct Monitor {
    mutex: NamedSemaphore,
    resource: NamedSemaphore,
    reader_count: NonNull<AtomicU32>,
}

// SAFETY: reader_count lives in the shared mapping and is only touched while
// holding `mutex`; the semaphores themselves are thread-safe
unsafe impl Send for Monitor {}
unsafe impl Sync for Monitor {}

impl Monitor {
    /// Build a monitor from its semaphores and the shared reader count
    ///
    /// # Safety
    /// `reader_count` must point into a shared mapping that outlives the
    /// monitor, and every process must pair it with the same semaphores.
    pub unsafe fn from_raw(
        mutex: NamedSemaphore,
        resource: NamedSemaphore,
        reader_count: NonNull<AtomicU32>,
    ) -> Self {
        Self {
            mutex,
            resource,
            reader_count,
        }
    }

    #[inline]
    fn count(&self) -> &AtomicU32 {
        // SAFETY: guaranteed valid by from_raw's contract
        unsafe { self.reader_count.as_ref() }
    }

    /// Enter as a reader
    pub fn read(&self) -> Result<ReadGuard<'_>> {
        self.mutex.wait()?;

        let readers = self.count().load(Ordering::Relaxed) + 1;
        self.count().store(readers, Ordering::Relaxed);

        if readers == 1 {
            if let Err(e) = self.resource.wait() {
                self.abandon_read(readers, false);
                self.mutex.post()?;
                return Err(e);
            }
        }

        if let Err(e) = self.mutex.post() {
            self.abandon_read(readers, true);
            return Err(e);
        }
        Ok(ReadGuard { monitor: self })
    }

    /// Undo a reader entry that failed after counting itself in
    ///
    /// Called with `mutex` held. A first reader that already took `resource`
    /// hands it back.
    fn abandon_read(&self, readers: u32, holds_resource: bool) {
        self.count().store(readers - 1, Ordering::Relaxed);
        if readers == 1 && holds_resource {
            if let Err(e) = self.resource.post() {
                tracing::error!(error = %e, "Failed to release resource lock");
            }
        }
    }

    /// Enter as the exclusive writer
    pub fn write(&self) -> Result<WriteGuard<'_>> {
        self.resource.wait()?;
        Ok(WriteGuard { monitor: self })
    }

    /// Number of readers currently inside the reader section
    pub fn readers(&self) -> u32 {
        self.count().load(Ordering::Relaxed)
    }

    /// The semaphore guarding the reader count
    pub fn mutex(&self) -> &NamedSemaphore {
        &self.mutex
    }

    /// The semaphore guarding shard data
    pub fn resource(&self) -> &NamedSemaphore {
        &self.resource
    }

    fn leave_read(&self) -> Result<()> {
        self.mutex.wait()?;

        let readers = self.count().load(Ordering::Relaxed).saturating_sub(1);
        self.count().store(readers, Ordering::Relaxed);

        let released = if readers == 0 {
            self.resource.post()
        } else {
            Ok(())
        };

        self.mutex.post()?;
        released
    }
}

/// Membership in the reader group; leaves on drop
pub struct ReadGuard<'a> {
    monitor: &'a Monitor,
}

impl sealed::Sealed for ReadGuard<'_> {}
impl Held for ReadGuard<'_> {}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.monitor.leave_read() {
            tracing::error!(error = %e, "Failed to leave reader section");
        }
    }
}

/// Exclusive write access; releases the resource lock on drop
pub struct WriteGuard<'a> {
    monitor: &'a Monitor,
}

impl sealed::Sealed for WriteGuard<'_> {}
impl Held for WriteGuard<'_> {}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.monitor.resource.post() {
            tracing::error!(error = %e, "Failed to release resource lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        monitor: Monitor,
        _count: Box<AtomicU32>,
        names: [String; 2],
    }

    impl Fixture {
        fn new(tag: &str) -> Self {
            let names = [
                format!("/shmkv_test_mon_{}_{}.mutex", tag, std::process::id()),
                format!("/shmkv_test_mon_{}_{}.resource", tag, std::process::id()),
            ];
            let count = Box::new(AtomicU32::new(0));
            let ptr = NonNull::from(count.as_ref());
            let monitor = unsafe {
                Monitor::from_raw(
                    NamedSemaphore::open(&names[0], 1).unwrap(),
                    NamedSemaphore::open(&names[1], 1).unwrap(),
                    ptr,
                )
            };
            Self {
                monitor,
                _count: count,
                names,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for name in &self.names {
                let _ = NamedSemaphore::unlink(name);
            }
        }
    }

    #[test]
    fn test_readers_share_and_release() {
        let fixture = Fixture::new("share");
        let monitor = &fixture.monitor;

        let first = monitor.read().unwrap();
        let second = monitor.read().unwrap();
        assert_eq!(monitor.readers(), 2);
        assert_eq!(monitor.resource().value().unwrap(), 0);

        drop(first);
        assert_eq!(monitor.resource().value().unwrap(), 0);
        drop(second);

        // Back to the initial counts, with no surplus posts
        assert_eq!(monitor.readers(), 0);
        assert_eq!(monitor.resource().value().unwrap(), 1);
        assert_eq!(monitor.mutex().value().unwrap(), 1);
    }

    #[test]
    fn test_abandoned_first_reader_releases_resource() {
        let fixture = Fixture::new("abandon");
        let monitor = &fixture.monitor;

        // First reader counted in and holding resource, as just before its
        // final mutex post
        monitor.mutex().wait().unwrap();
        monitor.count().store(1, Ordering::Relaxed);
        monitor.resource().wait().unwrap();

        monitor.abandon_read(1, true);
        monitor.mutex().post().unwrap();

        assert_eq!(monitor.readers(), 0);
        assert_eq!(monitor.resource().value().unwrap(), 1);
        assert_eq!(monitor.mutex().value().unwrap(), 1);
        drop(monitor.write().unwrap());
    }

    #[test]
    fn test_abandoned_later_reader_keeps_group_lock() {
        let fixture = Fixture::new("abandon2");
        let monitor = &fixture.monitor;

        let first = monitor.read().unwrap();

        monitor.mutex().wait().unwrap();
        monitor.count().store(2, Ordering::Relaxed);
        monitor.abandon_read(2, true);
        monitor.mutex().post().unwrap();

        // The remaining reader still holds resource for the group
        assert_eq!(monitor.readers(), 1);
        assert_eq!(monitor.resource().value().unwrap(), 0);

        drop(first);
        assert_eq!(monitor.readers(), 0);
        assert_eq!(monitor.resource().value().unwrap(), 1);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let fixture = Arc::new(Fixture::new("excl"));
        let entered = Arc::new(AtomicBool::new(false));

        let writer = fixture.monitor.write().unwrap();

        let reader = {
            let fixture = Arc::clone(&fixture);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = fixture.monitor.read().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(writer);
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert_eq!(fixture.monitor.resource().value().unwrap(), 1);
    }

    #[test]
    fn test_readers_exclude_writer() {
        let fixture = Arc::new(Fixture::new("rexcl"));
        let entered = Arc::new(AtomicBool::new(false));

        let reader = fixture.monitor.read().unwrap();

        let writer = {
            let fixture = Arc::clone(&fixture);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _guard = fixture.monitor.write().unwrap();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        drop(reader);
        writer.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
