//! Shared-memory control block used by both sides of an overlay
//!
//! One page of memfd-backed memory holds the readiness flags, the stream
//! state and a process-shared pthread mutex. The block is reference counted;
//! the last holder to drop it destroys the mutex.

use std::cell::UnsafeCell;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::utils;

const MARKER: u32 = 0x6875_9746;

#[repr(C)]
struct Header {
    marker: AtomicU32,
    size: AtomicU32,
    ref_count: AtomicU32,
    control_ready: AtomicBool,
    data_ready: AtomicBool,
    stream_en: AtomicBool,
    streaming_reset: AtomicBool,
    lock: UnsafeCell<libc::pthread_mutex_t>,
}

/// Flags as seen at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharedState {
    pub control_ready: bool,
    pub data_ready: bool,
    pub stream_en: bool,
    pub streaming_reset: bool,
}

pub struct SharedControlBlock {
    file: File,
    map: MmapMut,
}

impl SharedControlBlock {
    /// Create a fresh block owned by the geometry side, refcount 1.
    pub fn create() -> Result<Self> {
        let size = page_size::get();
        if size < mem::size_of::<Header>() {
            return Err(Error::SharedBlock(format!("page of {} bytes too small", size)));
        }

        let file = utils::memfd("overlay-shared", size)
            .map_err(|e| Error::SharedBlock(format!("create: {}", e)))?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| Error::SharedBlock(format!("map: {}", e)))?;
        let block = Self { file, map };

        let header = block.header();
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            libc::pthread_mutexattr_init(&mut attr);
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            let rc = libc::pthread_mutex_init(header.lock.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                // Never marked valid, so drop leaves the mutex alone
                return Err(Error::SharedBlock(format!(
                    "mutex init: {}",
                    io::Error::from_raw_os_error(rc)
                )));
            }
        }
        header.size.store(size as u32, Ordering::Relaxed);
        header.ref_count.store(1, Ordering::Relaxed);
        header.marker.store(MARKER, Ordering::Release);

        info!("Created shared control block fd={} size={}", block.raw_fd(), size);
        Ok(block)
    }

    /// Attach to a block created by the other side and take a reference.
    pub fn open(fd: OwnedFd, size: usize) -> Result<Self> {
        if size < mem::size_of::<Header>() {
            return Err(Error::SharedBlock(format!("invalid size {}", size)));
        }
        let file = File::from(fd);
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| Error::SharedBlock(format!("map: {}", e)))?;

        let header = unsafe { &*(map.as_ptr() as *const Header) };
        if header.marker.load(Ordering::Acquire) != MARKER {
            return Err(Error::SharedBlock("invalid marker".into()));
        }
        if header.size.load(Ordering::Relaxed) as usize != size {
            return Err(Error::SharedBlock(format!(
                "size mismatch: block is {}, handle says {}",
                header.size.load(Ordering::Relaxed),
                size
            )));
        }
        header.ref_count.fetch_add(1, Ordering::AcqRel);

        let block = Self { file, map };
        debug!("Opened shared control block, {} holders", block.ref_count());
        Ok(block)
    }

    fn header(&self) -> &Header {
        // The mapping is page aligned and at least one header long
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    /// Take the cross-process mutex.
    pub fn lock(&self) -> Result<SharedGuard<'_>> {
        let header = self.header();
        let rc = unsafe { libc::pthread_mutex_lock(header.lock.get()) };
        if rc != 0 {
            return Err(Error::SharedBlock(format!(
                "lock: {}",
                io::Error::from_raw_os_error(rc)
            )));
        }
        Ok(SharedGuard { header })
    }

    pub fn snapshot(&self) -> Result<SharedState> {
        Ok(self.lock()?.state())
    }

    pub fn ref_count(&self) -> u32 {
        self.header().ref_count.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Descriptor to hand to the frame-owning side.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        Ok(self.file.try_clone()?.into())
    }
}

impl Drop for SharedControlBlock {
    fn drop(&mut self) {
        let header = self.header();
        if header.marker.load(Ordering::Acquire) != MARKER {
            return;
        }
        // Last holder releases the mutex, otherwise the other side would use a destroyed lock
        if header.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let rc = unsafe { libc::pthread_mutex_destroy(header.lock.get()) };
            if rc != 0 {
                error!(
                    "Failed to destroy shared mutex: {}",
                    io::Error::from_raw_os_error(rc)
                );
            }
            header.marker.store(0, Ordering::Release);
            debug!("Shared control block released");
        }
    }
}

/// Held while the shared mutex is locked. Unlocks on drop.
pub struct SharedGuard<'a> {
    header: &'a Header,
}

impl SharedGuard<'_> {
    pub fn control_ready(&self) -> bool {
        self.header.control_ready.load(Ordering::Relaxed)
    }

    pub fn set_control_ready(&mut self, ready: bool) {
        self.header.control_ready.store(ready, Ordering::Relaxed);
    }

    pub fn data_ready(&self) -> bool {
        self.header.data_ready.load(Ordering::Relaxed)
    }

    pub fn set_data_ready(&mut self, ready: bool) {
        self.header.data_ready.store(ready, Ordering::Relaxed);
    }

    pub fn stream_en(&self) -> bool {
        self.header.stream_en.load(Ordering::Relaxed)
    }

    pub fn set_stream_en(&mut self, enabled: bool) {
        self.header.stream_en.store(enabled, Ordering::Relaxed);
    }

    pub fn streaming_reset(&self) -> bool {
        self.header.streaming_reset.load(Ordering::Relaxed)
    }

    pub fn set_streaming_reset(&mut self, reset: bool) {
        self.header.streaming_reset.store(reset, Ordering::Relaxed);
    }

    /// Consume a pending flush pulse.
    pub fn take_streaming_reset(&mut self) -> bool {
        self.header.streaming_reset.swap(false, Ordering::Relaxed)
    }

    pub fn state(&self) -> SharedState {
        SharedState {
            control_ready: self.control_ready(),
            data_ready: self.data_ready(),
            stream_en: self.stream_en(),
            streaming_reset: self.streaming_reset(),
        }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.header.lock.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_side_shares_flags() {
        let control = SharedControlBlock::create().unwrap();
        let data =
            SharedControlBlock::open(control.try_clone_fd().unwrap(), control.size()).unwrap();
        assert_eq!(control.ref_count(), 2);

        data.lock().unwrap().set_data_ready(true);
        assert!(control.snapshot().unwrap().data_ready);
    }

    #[test]
    fn flush_pulse_is_taken_once() {
        let block = SharedControlBlock::create().unwrap();
        block.lock().unwrap().set_streaming_reset(true);

        let mut guard = block.lock().unwrap();
        assert!(guard.take_streaming_reset());
        assert!(!guard.take_streaming_reset());
    }

    #[test]
    fn last_holder_invalidates_the_block() {
        let control = SharedControlBlock::create().unwrap();
        let fd = control.try_clone_fd().unwrap();
        let size = control.size();
        let keep = control.try_clone_fd().unwrap();

        let data = SharedControlBlock::open(fd, size).unwrap();
        drop(control);
        assert_eq!(data.ref_count(), 1);
        drop(data);

        assert!(matches!(
            SharedControlBlock::open(keep, size),
            Err(Error::SharedBlock(_))
        ));
    }

    #[test]
    fn rejects_wrong_size() {
        let control = SharedControlBlock::create().unwrap();
        let fd = control.try_clone_fd().unwrap();
        assert!(SharedControlBlock::open(fd, control.size() * 2).is_err());
    }

    #[test]
    fn rejects_unmarked_memory() {
        let file = utils::memfd("not-a-block", page_size::get()).unwrap();
        let err = SharedControlBlock::open(file.into(), page_size::get());
        assert!(matches!(err, Err(Error::SharedBlock(_))));
    }
}
