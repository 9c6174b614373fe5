//! Memory-mapped buffer slots and their ownership

use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::device::{DeviceChannel, MemoryMode, UserPtr};
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Who currently owns a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Mapped, holding no frame.
    Free,
    QueuedToDevice,
    OwnedByApplication,
}

/// A slot of one particular mapping of a pool.
///
/// References are only valid until the pool is unmapped, a remap hands out
/// new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pool: u32,
    index: u16,
}

impl SlotRef {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

pub struct BufferSlot {
    index: u32,
    state: SlotState,
    region: MmapMut,
    offset: u32,
}

impl BufferSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Offset of the slot inside the device's buffer memory.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.region
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.region
    }

    /// The slot memory handed to a user-pointer device on queue.
    pub fn user_ptr(&self) -> UserPtr {
        UserPtr {
            addr: self.region.as_ptr() as usize,
            len: self.region.len(),
        }
    }
}

/// Fixed array of mapped device buffers plus the count queued to the device.
pub struct BufferPool {
    id: u32,
    memory: MemoryMode,
    slots: Vec<BufferSlot>,
    in_flight: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub const MAX_BUFFERS: u32 = 8;

    pub fn new() -> Self {
        Self {
            id: 0,
            memory: MemoryMode::Mmap,
            slots: Vec::new(),
            in_flight: 0,
        }
    }

    /// Map `count` buffers already requested on `channel`.
    ///
    /// Either every slot is mapped or none is.
    pub fn map(&mut self, channel: &DeviceChannel, count: u32) -> Result<()> {
        if self.is_mapped() {
            return Err(Error::Buffer("pool is already mapped".into()));
        }
        if count == 0 || count > Self::MAX_BUFFERS {
            return Err(Error::Buffer(format!(
                "{} buffers requested, pool holds 1..={}",
                count,
                Self::MAX_BUFFERS
            )));
        }

        let memory = channel.memory();
        let mut slots = Vec::with_capacity(count as usize);
        for index in 0..count {
            // On error `slots` is dropped, which unmaps everything mapped so far
            let info = channel
                .query_buffer(index)
                .map_err(|e| Error::Buffer(format!("query slot {}: {}", index, e)))?;
            let region = match memory {
                MemoryMode::Mmap => channel.device().map_buffer(&info),
                MemoryMode::UserPtr => MmapMut::map_anon(info.length as usize),
            }
            .map_err(|e| Error::Buffer(format!("map slot {}: {}", index, e)))?;

            debug!("Slot {} mapped: {} bytes at offset {}", index, region.len(), info.offset);
            slots.push(BufferSlot {
                index,
                state: SlotState::Free,
                region,
                offset: info.offset,
            });
        }

        self.id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        self.memory = memory;
        self.slots = slots;
        self.in_flight = 0;
        info!("Mapped {} buffers ({:?})", count, memory);
        Ok(())
    }

    /// Release every mapping. Safe on an unmapped pool.
    pub fn unmap(&mut self) {
        if self.in_flight > 0 {
            warn!("Unmapping with {} buffers still queued", self.in_flight);
        }
        self.slots.clear();
        self.in_flight = 0;
    }

    pub fn is_mapped(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn memory(&self) -> MemoryMode {
        self.memory
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Buffers currently queued to the device.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn slots(&self) -> impl Iterator<Item = &BufferSlot> {
        self.slots.iter()
    }

    pub fn slot(&self, index: usize) -> Result<&BufferSlot> {
        let count = self.slots.len();
        self.slots.get(index).ok_or(Error::SlotIndex { index, count })
    }

    pub fn slot_mut(&mut self, index: usize) -> Result<&mut BufferSlot> {
        let count = self.slots.len();
        self.slots.get_mut(index).ok_or(Error::SlotIndex { index, count })
    }

    pub fn slot_ref(&self, index: usize) -> Result<SlotRef> {
        self.slot(index)?;
        Ok(SlotRef {
            pool: self.id,
            index: index as u16,
        })
    }

    /// Index of `slot` in this mapping.
    pub fn resolve(&self, slot: SlotRef) -> Result<usize> {
        if slot.pool != self.id || !self.is_mapped() {
            return Err(Error::ForeignSlot);
        }
        self.slot(slot.index())?;
        Ok(slot.index())
    }

    /// First slot in `state`, if any.
    pub fn find(&self, state: SlotState) -> Option<usize> {
        self.slots.iter().position(|s| s.state == state)
    }

    /// Record a successful queue of `index`.
    pub fn mark_queued(&mut self, index: usize) -> Result<()> {
        let count = self.slots.len();
        let slot = self.slot_mut(index)?;
        if slot.state == SlotState::QueuedToDevice {
            return Err(Error::Buffer(format!("slot {} is already queued", index)));
        }
        slot.state = SlotState::QueuedToDevice;
        self.in_flight = (self.in_flight + 1).min(count);
        Ok(())
    }

    /// Record a successful dequeue of `index`.
    pub fn mark_dequeued(&mut self, index: usize) -> Result<()> {
        let slot = self.slot_mut(index)?;
        let was_queued = slot.state == SlotState::QueuedToDevice;
        slot.state = SlotState::OwnedByApplication;
        if was_queued {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        Ok(())
    }

    /// Every queued buffer was lost: all slots return to the application.
    pub fn reset_ownership(&mut self) {
        for slot in &mut self.slots {
            slot.state = SlotState::Free;
        }
        self.in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capture::PixelFormat;
    use crate::device::{BufKind, DeviceOp, VirtualDevice};

    fn mapped(count: u32) -> (Arc<VirtualDevice>, DeviceChannel, BufferPool) {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let chan = DeviceChannel::with_device(dev.clone(), BufKind::Output, MemoryMode::Mmap).unwrap();
        chan.request_buffers(count).unwrap();
        let mut pool = BufferPool::new();
        pool.map(&chan, count).unwrap();
        (dev, chan, pool)
    }

    #[test]
    fn maps_every_slot_free() {
        let (_dev, _chan, pool) = mapped(3);
        assert_eq!(pool.len(), 3);
        assert!(pool.slots().all(|s| s.state() == SlotState::Free));
        assert!(pool.slot(0).unwrap().len() >= 640 * 480 * 2);
    }

    #[test]
    fn failed_map_leaves_pool_empty() {
        let dev = Arc::new(VirtualDevice::output(640, 480, PixelFormat::Uyvy));
        let chan = DeviceChannel::with_device(dev.clone(), BufKind::Output, MemoryMode::Mmap).unwrap();
        chan.request_buffers(3).unwrap();
        dev.fail_next(DeviceOp::MapBuffer);

        let mut pool = BufferPool::new();
        assert!(matches!(pool.map(&chan, 3), Err(Error::Buffer(_))));
        assert!(!pool.is_mapped());
        pool.unmap();
    }

    #[test]
    fn in_flight_stays_within_pool_size() {
        let (_dev, _chan, mut pool) = mapped(3);
        for i in 0..3 {
            pool.mark_queued(i).unwrap();
        }
        assert_eq!(pool.in_flight(), 3);
        assert!(pool.mark_queued(1).is_err());
        assert_eq!(pool.in_flight(), 3);

        pool.mark_dequeued(1).unwrap();
        pool.mark_dequeued(1).unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.slot(1).unwrap().state(), SlotState::OwnedByApplication);
    }

    #[test]
    fn out_of_range_index() {
        let (_dev, _chan, pool) = mapped(3);
        assert!(matches!(pool.slot(3), Err(Error::SlotIndex { index: 3, count: 3 })));
    }

    #[test]
    fn slot_refs_do_not_cross_pools() {
        let (_dev, chan, mut pool) = mapped(3);
        let (_dev2, _chan2, other) = mapped(3);
        let slot = other.slot_ref(1).unwrap();
        assert!(matches!(pool.resolve(slot), Err(Error::ForeignSlot)));

        let stale = pool.slot_ref(2).unwrap();
        pool.unmap();
        pool.map(&chan, 3).unwrap();
        assert!(matches!(pool.resolve(stale), Err(Error::ForeignSlot)));
    }

    #[test]
    fn reset_returns_everything() {
        let (_dev, _chan, mut pool) = mapped(3);
        pool.mark_queued(0).unwrap();
        pool.mark_queued(2).unwrap();
        pool.reset_ownership();
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.find(SlotState::QueuedToDevice), None);
    }
}
