//! Host-visible buffer sub-allocation
//!
//! One backing `VkBuffer` is carved into typed sub-buffers. Free ranges are
//! grouped in size buckets (outer list size-ascending, inner list holding
//! equally sized ranges), which makes "smallest bucket ≥ requested" a single
//! outer scan plus a pop. A high-water mark bounds flush/invalidate ranges to
//! the part of the buffer that was ever used.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ash::vk;

use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::LogLevel;
use crate::memory::SubMemory;

/// Bucket length at which the asynchronous release thread is spawned.
const ASYNC_RELEASE_THRESHOLD: usize = 500;

/// A sub-range of the backing buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubBuffer {
    /// Backing buffer; null marks a failed acquisition
    pub buffer: vk::Buffer,
    /// Byte offset inside the backing buffer
    pub offset: u32,
    /// Byte size
    pub size: u32,
}

impl SubBuffer {
    /// True when this sub-buffer holds no range.
    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null()
    }
}

/// Pure bucketed free-list over one backing block.
pub(crate) struct BufferPool {
    /// Outer list ordered by size ascending; inner lists group equal sizes
    zones: Vec<Vec<SubBuffer>>,
    max_offset: u32,
    block_size: u32,
    buffer: vk::Buffer,
}

impl BufferPool {
    pub(crate) fn new(buffer: vk::Buffer, block_size: u32) -> Self {
        let mut pool = Self {
            zones: Vec::new(),
            max_offset: 0,
            block_size,
            buffer,
        };
        pool.insert(SubBuffer {
            buffer,
            offset: 0,
            size: block_size,
        });
        pool
    }

    /// Insert into the bucket of equal sizes, creating it in sorted position
    /// when absent. Returns the bucket length after insertion.
    pub(crate) fn insert(&mut self, sub: SubBuffer) -> usize {
        for (i, zone) in self.zones.iter_mut().enumerate() {
            if zone[0].size == sub.size {
                zone.push(sub);
                return zone.len();
            } else if zone[0].size > sub.size {
                self.zones.insert(i, vec![sub]);
                return 1;
            }
        }
        self.zones.push(vec![sub]);
        1
    }

    /// Pop from the smallest bucket able to hold `size`, splitting off the
    /// excess as a new free range.
    pub(crate) fn acquire(&mut self, size: u32) -> Option<SubBuffer> {
        let zone_idx = self.zones.iter().position(|z| z[0].size >= size)?;
        let zone = &mut self.zones[zone_idx];
        let mut sub = zone.pop().expect("buckets are never left empty");
        if zone.is_empty() {
            self.zones.remove(zone_idx);
        }
        if sub.size > size {
            self.insert(SubBuffer {
                buffer: sub.buffer,
                offset: sub.offset + size,
                size: sub.size - size,
            });
            sub.size = size;
        }
        if sub.offset + sub.size > self.max_offset {
            self.max_offset = sub.offset + sub.size;
        }
        Some(sub)
    }

    /// Merge `sub` with adjacent free ranges, lower the high-water mark when
    /// the released range was the top-most use, and reinsert.
    pub(crate) fn release(&mut self, mut sub: SubBuffer) -> usize {
        let begin = sub.offset;
        let end = begin + sub.size;
        let mut zone_idx = 0;
        while zone_idx < self.zones.len() {
            let zone = &mut self.zones[zone_idx];
            let mut i = 0;
            while i < zone.len() {
                let s = zone[i];
                if s.offset == end {
                    sub.size += s.size;
                    zone.remove(i);
                    continue;
                } else if s.offset + s.size == begin {
                    sub.offset = s.offset;
                    sub.size += s.size;
                    zone.remove(i);
                    continue;
                }
                i += 1;
            }
            if zone.is_empty() {
                self.zones.remove(zone_idx);
            } else {
                zone_idx += 1;
            }
        }
        if sub.offset + sub.size >= self.max_offset && sub.offset < self.max_offset {
            self.max_offset = sub.offset;
        }
        self.insert(sub)
    }

    /// Bump-pointer acquisition for whole-buffer-per-frame use; no release is
    /// allowed, [`BufferPool::reset`] recycles everything at once.
    pub(crate) fn fast_acquire(&mut self, size: u32) -> Option<SubBuffer> {
        if self.max_offset + size > self.block_size {
            return None;
        }
        let sub = SubBuffer {
            buffer: self.buffer,
            offset: self.max_offset,
            size,
        };
        self.max_offset += size;
        Some(sub)
    }

    pub(crate) fn reset(&mut self) {
        self.max_offset = 0;
    }

    pub(crate) fn max_offset(&self) -> u32 {
        self.max_offset
    }

    #[cfg(test)]
    fn free_total(&self) -> u64 {
        self.zones
            .iter()
            .flat_map(|z| z.iter())
            .map(|s| u64::from(s.size))
            .sum()
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.zones.windows(2).all(|w| w[0][0].size < w[1][0].size)
            && self
                .zones
                .iter()
                .all(|z| z.iter().all(|s| s.size == z[0].size))
    }
}

/// Manage sub-allocation of one backing buffer, like the device-memory
/// allocator does for chunks.
pub struct BufferMgr {
    ctx: Arc<VulkanContext>,
    name: String,
    buffer: vk::Buffer,
    memory: SubMemory,
    data: *mut u8,
    uniform_alignment: u32,
    pool: Arc<Mutex<BufferPool>>,
    release_stack: Arc<Mutex<Vec<SubBuffer>>>,
    release_alive: Arc<AtomicBool>,
    release_thread: Mutex<Option<JoinHandle<()>>>,
}

// `data` aliases host-visible device memory; concurrent access is the
// caller's contract exactly as with raw Vulkan mapping.
unsafe impl Send for BufferMgr {}
unsafe impl Sync for BufferMgr {}

impl BufferMgr {
    /// Create the backing buffer and seed the pool with one block-sized free
    /// range. Host-visible backings are mapped for the manager's lifetime.
    pub fn new(
        ctx: &Arc<VulkanContext>,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        block_size: u32,
        name: &str,
    ) -> VulkanResult<Self> {
        let (buffer, memory) =
            ctx.create_buffer(vk::DeviceSize::from(block_size), usage, properties, preferred, 0)?;
        ctx.set_object_name(buffer, vk::ObjectType::BUFFER, if name.is_empty() { "BufferMgr" } else { name });
        let data = if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            ctx.map_memory(&memory)?
        } else {
            std::ptr::null_mut()
        };
        Ok(Self {
            ctx: Arc::clone(ctx),
            name: name.to_owned(),
            buffer,
            memory,
            data,
            uniform_alignment: ctx.uniform_offset_alignment(),
            pool: Arc::new(Mutex::new(BufferPool::new(buffer, block_size))),
            release_stack: Arc::new(Mutex::new(Vec::new())),
            release_alive: Arc::new(AtomicBool::new(false)),
            release_thread: Mutex::new(None),
        })
    }

    /// Backing buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Carve a sub-buffer. Uniform acquisitions are rounded up to the
    /// device's minimum uniform-buffer-offset alignment.
    pub fn acquire(&self, size: u32, is_uniform: bool) -> VulkanResult<SubBuffer> {
        let size = if is_uniform {
            ((size.max(1) - 1) / self.uniform_alignment + 1) * self.uniform_alignment
        } else {
            size
        };
        match self.pool.lock().unwrap().acquire(size) {
            Some(sub) => Ok(sub),
            None => {
                self.ctx.put_log(
                    &format!("Can't allocate buffer in '{}' !", self.name),
                    LogLevel::Error,
                );
                Err(VulkanError::OutOfMemory {
                    requested: u64::from(size),
                })
            }
        }
    }

    /// Bump-pointer acquisition; pair with [`BufferMgr::reset`].
    pub fn fast_acquire(&self, size: u32) -> Option<SubBuffer> {
        self.pool.lock().unwrap().fast_acquire(size)
    }

    /// Reset the high-water mark, recycling every fast acquisition at once.
    pub fn reset(&self) {
        self.pool.lock().unwrap().reset();
    }

    /// Return a sub-buffer to the pool. When the async-release thread is
    /// running the range is queued for it instead of merged inline.
    pub fn release(&self, sub: SubBuffer) {
        if self.release_alive.load(Ordering::Acquire) {
            self.release_stack.lock().unwrap().push(sub);
            return;
        }
        let bucket_len = self.pool.lock().unwrap().release(sub);
        if bucket_len >= ASYNC_RELEASE_THRESHOLD {
            self.start_release_thread();
        }
    }

    fn start_release_thread(&self) {
        let mut slot = self.release_thread.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.release_alive.store(true, Ordering::Release);
        let pool = Arc::clone(&self.pool);
        let stack = Arc::clone(&self.release_stack);
        let alive = Arc::clone(&self.release_alive);
        *slot = Some(std::thread::spawn(move || {
            while alive.load(Ordering::Acquire) {
                let next = stack.lock().unwrap().pop();
                match next {
                    Some(sub) => {
                        pool.lock().unwrap().release(sub);
                    }
                    None => std::thread::sleep(std::time::Duration::from_micros(400)),
                }
            }
        }));
    }

    /// Host pointer to a sub-buffer; requires a host-visible backing.
    pub fn ptr(&self, sub: &SubBuffer) -> *mut u8 {
        debug_assert!(!self.data.is_null(), "backing memory is not host visible");
        unsafe { self.data.add(sub.offset as usize) }
    }

    /// Copy a typed payload into a sub-buffer through the mapping.
    pub fn write<T: bytemuck::Pod>(&self, sub: &SubBuffer, content: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(content);
        debug_assert!(bytes.len() <= sub.size as usize);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr(sub), bytes.len());
        }
    }

    fn range(&self, offset: u32, size: vk::DeviceSize) -> vk::MappedMemoryRange {
        vk::MappedMemoryRange::builder()
            .memory(self.memory.memory)
            .offset(self.memory.offset + vk::DeviceSize::from(offset))
            .size(size)
            .build()
    }

    /// Flush host writes of the whole used region.
    pub fn flush(&self) -> VulkanResult<()> {
        let max = self.pool.lock().unwrap().max_offset();
        let range = self.range(0, vk::DeviceSize::from(max));
        unsafe {
            self.ctx
                .device()
                .flush_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Flush host writes of one sub-buffer.
    pub fn flush_sub(&self, sub: &SubBuffer) -> VulkanResult<()> {
        let range = self.range(sub.offset, vk::DeviceSize::from(sub.size));
        unsafe {
            self.ctx
                .device()
                .flush_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Flush host writes of several sub-buffers at once.
    pub fn flush_all(&self, subs: &[SubBuffer]) -> VulkanResult<()> {
        let ranges: Vec<_> = subs
            .iter()
            .map(|s| self.range(s.offset, vk::DeviceSize::from(s.size)))
            .collect();
        unsafe {
            self.ctx
                .device()
                .flush_mapped_memory_ranges(&ranges)
                .map_err(VulkanError::Api)
        }
    }

    /// Make device writes of the whole used region visible to the host.
    pub fn invalidate(&self) -> VulkanResult<()> {
        let max = self.pool.lock().unwrap().max_offset();
        let range = self.range(0, vk::DeviceSize::from(max));
        unsafe {
            self.ctx
                .device()
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Make device writes of one sub-buffer visible to the host.
    pub fn invalidate_sub(&self, sub: &SubBuffer) -> VulkanResult<()> {
        let range = self.range(sub.offset, vk::DeviceSize::from(sub.size));
        unsafe {
            self.ctx
                .device()
                .invalidate_mapped_memory_ranges(&[range])
                .map_err(VulkanError::Api)
        }
    }

    /// Record a copy of `src` into `dst`, using the smaller of the two sizes.
    pub fn copy(device: &ash::Device, cmd: vk::CommandBuffer, src: &SubBuffer, dst: &SubBuffer) {
        Self::copy_range(device, cmd, src, dst, src.size.min(dst.size), 0, 0);
    }

    /// Record a copy of `size` bytes with per-call source and destination
    /// offsets relative to the sub-buffers.
    pub fn copy_range(
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        src: &SubBuffer,
        dst: &SubBuffer,
        size: u32,
        src_offset: u32,
        dst_offset: u32,
    ) {
        let region = vk::BufferCopy {
            src_offset: vk::DeviceSize::from(src.offset + src_offset),
            dst_offset: vk::DeviceSize::from(dst.offset + dst_offset),
            size: vk::DeviceSize::from(size),
        };
        unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
    }

    /// Rename the backing buffer for validation output.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_owned();
        self.ctx
            .set_object_name(self.buffer, vk::ObjectType::BUFFER, name);
    }
}

impl Drop for BufferMgr {
    fn drop(&mut self) {
        self.release_alive.store(false, Ordering::Release);
        if let Some(thread) = self.release_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        if !self.data.is_null() {
            self.ctx.unmap_memory(&self.memory);
        }
        unsafe { self.ctx.device().destroy_buffer(self.buffer, None) };
        self.ctx.free(self.memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn pool(block: u32) -> BufferPool {
        BufferPool::new(vk::Buffer::from_raw(1), block)
    }

    #[test]
    fn test_acquire_splits_and_tracks_watermark() {
        let mut p = pool(1024);
        let a = p.acquire(100).unwrap();
        assert_eq!((a.offset, a.size), (0, 100));
        assert_eq!(p.max_offset(), 100);
        let b = p.acquire(200).unwrap();
        assert_eq!((b.offset, b.size), (100, 200));
        assert_eq!(p.max_offset(), 300);
        assert_eq!(p.free_total(), 1024 - 300);
    }

    #[test]
    fn test_conservation_over_acquire_release() {
        let mut p = pool(4096);
        let mut live = Vec::new();
        for i in 0..10 {
            live.push(p.acquire(64 + i * 32).unwrap());
        }
        let live_total: u64 = live.iter().map(|s| u64::from(s.size)).sum();
        assert_eq!(live_total + p.free_total(), 4096);
        for sub in live.drain(..) {
            p.release(sub);
        }
        assert_eq!(p.free_total(), 4096);
    }

    #[test]
    fn test_same_slot_round_trip() {
        let mut p = pool(4096);
        let first = p.acquire(256).unwrap();
        p.release(first);
        let second = p.acquire(256).unwrap();
        assert_eq!((second.buffer, second.offset), (first.buffer, first.offset));
    }

    #[test]
    fn test_release_lowers_watermark() {
        let mut p = pool(1024);
        let a = p.acquire(512).unwrap();
        let b = p.acquire(256).unwrap();
        assert_eq!(p.max_offset(), 768);
        p.release(b);
        assert_eq!(p.max_offset(), 512);
        p.release(a);
        assert_eq!(p.max_offset(), 0);
    }

    /// Fragmentation scenario: alternate 1 KiB / 3 KiB until the 1 MiB
    /// backing is exhausted, release the 1 KiB ones, and verify a new 1 KiB
    /// request lands in one of the merged gaps.
    #[test]
    fn test_fragmentation_scenario() {
        const KIB: u32 = 1024;
        let mut p = pool(1024 * KIB);
        let mut small = Vec::new();
        let mut big = Vec::new();
        loop {
            match p.acquire(KIB) {
                Some(s) => small.push(s),
                None => break,
            }
            match p.acquire(3 * KIB) {
                Some(s) => big.push(s),
                None => break,
            }
        }
        assert!(!small.is_empty() && !big.is_empty());
        for s in small.drain(..) {
            p.release(s);
        }
        // Every released 1 KiB range sits between 3 KiB live ranges, so the
        // buckets hold exactly 1 KiB gaps (plus whatever tail remained).
        assert!(p.is_sorted());
        let again = p.acquire(KIB).unwrap();
        assert_eq!(again.size, KIB);
        // Smallest-fit: the gap is used as-is, no splitting happened
        assert_eq!(p.free_total() % u64::from(KIB), 0);
    }

    #[test]
    fn test_fast_acquire_exhaustion_and_reset() {
        let mut p = pool(256);
        let a = p.fast_acquire(128).unwrap();
        let b = p.fast_acquire(128).unwrap();
        assert_eq!((a.offset, b.offset), (0, 128));
        assert!(p.fast_acquire(1).is_none());
        p.reset();
        assert_eq!(p.fast_acquire(256).unwrap().offset, 0);
    }

    #[test]
    fn test_buckets_group_equal_sizes() {
        let mut p = pool(4096);
        let a = p.acquire(512).unwrap();
        let b = p.acquire(512).unwrap();
        let c = p.acquire(512).unwrap();
        p.release(a);
        p.release(c);
        let _keep = b;
        assert!(p.is_sorted());
    }
}
