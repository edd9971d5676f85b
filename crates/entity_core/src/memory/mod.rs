//! Device-memory sub-allocator
//!
//! Memory is drawn from large chunks (one `vkAllocateMemory` each) and carved
//! into sub-ranges by a size-sorted, coalescing free-list per memory type.
//! Free lists are partitioned into independent *batches*, each behind its own
//! mutex, so allocator instances used from different threads never contend.
//!
//! Requests larger than a chunk, and resources for which the driver prefers a
//! dedicated allocation, get their own `VkDeviceMemory` marked with the
//! dedicated sentinel size and are freed as a whole.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::error::{VulkanError, VulkanResult};
use crate::logging::{LogLevel, LogSink};

/// Sentinel size marking a dedicated allocation (its own chunk, freed whole).
pub const DEDICATED_SIZE: vk::DeviceSize = vk::DeviceSize::MAX;
/// Batch index of unbatched (dedicated) allocations.
pub const NO_BATCH: u32 = u32::MAX;

/// A sub-range of one device-memory chunk.
#[derive(Debug, Clone, Copy)]
pub struct SubMemory {
    /// Backing chunk; null marks a failed or empty allocation
    pub memory: vk::DeviceMemory,
    /// Byte offset inside the chunk
    pub offset: vk::DeviceSize,
    /// Byte size; [`DEDICATED_SIZE`] marks a dedicated allocation
    pub size: vk::DeviceSize,
    /// Memory type the chunk was allocated from
    pub memory_index: u32,
    /// Batch owning the chunk; [`NO_BATCH`] for dedicated allocations
    pub batch: u32,
}

impl Default for SubMemory {
    fn default() -> Self {
        Self {
            memory: vk::DeviceMemory::null(),
            offset: 0,
            size: 0,
            memory_index: 0,
            batch: NO_BATCH,
        }
    }
}

impl SubMemory {
    /// True when this sub-range holds no memory.
    pub fn is_null(&self) -> bool {
        self.memory == vk::DeviceMemory::null()
    }

    /// True for allocations that own their whole chunk.
    pub fn is_dedicated(&self) -> bool {
        self.size == DEDICATED_SIZE
    }
}

/// Per-heap memory statistics from the budget extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryQuery {
    /// Physical capacity of the heap
    pub total: u64,
    /// Estimated memory available to this application
    pub available: u64,
    /// Estimated memory currently allocated by this application
    pub used: u64,
    /// Estimated remaining memory
    pub free: u64,
    /// Heap flags; contains `DEVICE_LOCAL` for GPU heaps
    pub flags: vk::MemoryHeapFlags,
}

/// Size-sorted free-list of sub-ranges of one memory type.
///
/// Keeping the list in non-decreasing size order makes the first fit also the
/// smallest fit. The merge step preserves the invariant that adjacent free
/// ranges of the same chunk are always coalesced.
#[derive(Default)]
pub(crate) struct FreeList {
    spaces: Vec<SubMemory>,
}

impl FreeList {
    /// Insert keeping the non-decreasing size order.
    pub(crate) fn insert(&mut self, sub: SubMemory) {
        let pos = self
            .spaces
            .iter()
            .position(|s| s.size >= sub.size)
            .unwrap_or(self.spaces.len());
        self.spaces.insert(pos, sub);
    }

    /// Coalesce `sub` with any free neighbour sharing an edge in the same
    /// chunk. Ranges absorbed into `sub` are removed from the list.
    pub(crate) fn merge(&mut self, sub: &mut SubMemory) {
        let begin = sub.offset;
        let end = begin + sub.size;
        let mut i = 0;
        while i < self.spaces.len() {
            let s = &self.spaces[i];
            if s.memory == sub.memory {
                if s.offset == end {
                    sub.size += s.size;
                    self.spaces.remove(i);
                    continue;
                } else if s.offset + s.size == begin {
                    sub.offset = s.offset;
                    sub.size += s.size;
                    self.spaces.remove(i);
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Smallest-fit extraction honouring the alignment absorption rule: a
    /// range fits when the request fits at its start, or when the misaligned
    /// prefix plus the request still fits inside it.
    pub(crate) fn acquire(&mut self, size: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<SubMemory> {
        let pos = self.spaces.iter().position(|s| {
            size <= s.size
                && (s.offset % alignment == 0 || size + alignment - s.offset % alignment <= s.size)
        })?;
        Some(self.spaces.remove(pos))
    }

    /// Remove and return the chunks that are entirely free.
    pub(crate) fn take_whole_chunks(&mut self, chunk_size: vk::DeviceSize) -> Vec<vk::DeviceMemory> {
        let mut freed = Vec::new();
        self.spaces.retain(|s| {
            if s.size == chunk_size {
                freed.push(s.memory);
                false
            } else {
                true
            }
        });
        freed
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SubMemory> {
        self.spaces.iter()
    }

    #[cfg(test)]
    pub(crate) fn total_size(&self) -> vk::DeviceSize {
        self.spaces.iter().map(|s| s.size).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_sorted(&self) -> bool {
        self.spaces.windows(2).all(|w| w[0].size <= w[1].size)
    }
}

/// Trim `sub` to exactly `size` aligned bytes, releasing the misaligned
/// prefix and the unused tail back to the free-list.
pub(crate) fn allocate_in_sub_memory(
    free: &mut FreeList,
    sub: &mut SubMemory,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
) {
    if sub.is_dedicated() {
        return;
    }
    let misalign = sub.offset % alignment;
    if misalign > 0 {
        let pad = alignment - misalign;
        free.insert(SubMemory {
            size: pad,
            ..*sub
        });
        sub.offset += pad;
        sub.size -= pad;
    }
    let tail = sub.size - size;
    if tail > 0 {
        free.insert(SubMemory {
            offset: sub.offset + size,
            size: tail,
            ..*sub
        });
    }
    sub.size = size;
}

struct MappedChunk {
    mappings: u32,
    ptr: *mut u8,
}

// The host pointer is only handed out under the batch mutex.
unsafe impl Send for MappedChunk {}

#[derive(Default)]
struct TypeState {
    free: FreeList,
    chunks: Vec<vk::DeviceMemory>,
}

struct BatchState {
    types: Vec<TypeState>,
    mapped: HashMap<vk::DeviceMemory, MappedChunk>,
}

struct MemorySnapshot {
    types: Vec<vk::MemoryType>,
    heaps: Vec<vk::MemoryHeap>,
    budget: [u64; vk::MAX_MEMORY_HEAPS],
    usage: [u64; vk::MAX_MEMORY_HEAPS],
    device_heap: u32,
    available_device_mib: u64,
}

/// Chunked device-memory allocator with batched free-lists.
pub struct MemoryAllocator {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    sink: Arc<LogSink>,
    chunk_size: vk::DeviceSize,
    using_batches: bool,
    has_budget_ext: bool,
    batches: Vec<Mutex<BatchState>>,
    snapshot: Mutex<MemorySnapshot>,
    has_released_this_frame: AtomicBool,
    releasing: AtomicBool,
    custom_release: Option<Box<dyn Fn() + Send + Sync>>,
}

impl MemoryAllocator {
    /// Build the allocator. `batch_count == 0` keeps a single batch and marks
    /// the allocator as unbatched, which changes the host-visible miss
    /// strategy (see [`MemoryAllocator::allocate`]).
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        chunk_size: vk::DeviceSize,
        batch_count: u32,
        has_budget_ext: bool,
        sink: Arc<LogSink>,
        custom_release: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let type_count = unsafe {
            instance
                .get_physical_device_memory_properties(physical_device)
                .memory_type_count as usize
        };
        let batches = (0..batch_count.max(1))
            .map(|_| {
                Mutex::new(BatchState {
                    types: (0..type_count).map(|_| TypeState::default()).collect(),
                    mapped: HashMap::new(),
                })
            })
            .collect();
        let allocator = Self {
            instance,
            device,
            physical_device,
            sink,
            chunk_size,
            using_batches: batch_count > 0,
            has_budget_ext,
            batches,
            snapshot: Mutex::new(MemorySnapshot {
                types: Vec::new(),
                heaps: Vec::new(),
                budget: [0; vk::MAX_MEMORY_HEAPS],
                usage: [0; vk::MAX_MEMORY_HEAPS],
                device_heap: 0,
                available_device_mib: 0,
            }),
            has_released_this_frame: AtomicBool::new(false),
            releasing: AtomicBool::new(false),
            custom_release,
        };
        allocator.log_resources();
        allocator
    }

    /// Allocator chunk size in bytes.
    pub fn chunk_size(&self) -> vk::DeviceSize {
        self.chunk_size
    }

    /// Reset the once-per-frame release guard; call once per frame.
    pub fn end_of_frame(&self) {
        self.has_released_this_frame.store(false, Ordering::Release);
    }

    fn refresh_snapshot(&self) {
        let mut guard = self.snapshot.lock().unwrap();
        let snapshot: &mut MemorySnapshot = &mut guard;
        let mut budget = vk::PhysicalDeviceMemoryBudgetPropertiesEXT::default();
        let props = if self.has_budget_ext {
            let mut props2 = vk::PhysicalDeviceMemoryProperties2::builder()
                .push_next(&mut budget)
                .build();
            unsafe {
                self.instance
                    .get_physical_device_memory_properties2(self.physical_device, &mut props2);
            }
            props2.memory_properties
        } else {
            unsafe {
                self.instance
                    .get_physical_device_memory_properties(self.physical_device)
            }
        };
        snapshot.types = props.memory_types[..props.memory_type_count as usize].to_vec();
        snapshot.heaps = props.memory_heaps[..props.memory_heap_count as usize].to_vec();
        snapshot.budget = budget.heap_budget;
        snapshot.usage = budget.heap_usage;
        for (i, heap) in snapshot.heaps.iter().enumerate() {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                snapshot.device_heap = i as u32;
                let budget = if self.has_budget_ext {
                    snapshot.budget[i]
                } else {
                    heap.size
                };
                snapshot.available_device_mib =
                    budget.saturating_sub(snapshot.usage[i]) / 1024 / 1024;
                break;
            }
        }
    }

    fn log_resources(&self) {
        self.refresh_snapshot();
        let snapshot = self.snapshot.lock().unwrap();
        let mut out = String::new();
        for (i, heap) in snapshot.heaps.iter().enumerate() {
            let kind = if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                "GPU"
            } else {
                "local"
            };
            out.push_str(&format!(
                "{kind} memory\ttotal : {} MiB\tavailable : {} MiB\tused : {} MiB\tfree : {} MiB\n",
                heap.size / 1024 / 1024,
                snapshot.budget[i] / 1024 / 1024,
                snapshot.usage[i] / 1024 / 1024,
                snapshot.budget[i].saturating_sub(snapshot.usage[i]) / 1024 / 1024,
            ));
        }
        drop(snapshot);
        self.sink.put(out.trim_end(), LogLevel::Debug);
    }

    /// Two-pass memory-type selection: preferred ∪ required first, required
    /// only as fallback.
    fn find_memory_index(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        let snapshot = self.snapshot.lock().unwrap();
        let wanted = properties | preferred;
        for (i, t) in snapshot.types.iter().enumerate() {
            if requirements.memory_type_bits & (1 << i) != 0 && t.property_flags.contains(wanted) {
                return Ok(i as u32);
            }
        }
        for (i, t) in snapshot.types.iter().enumerate() {
            if requirements.memory_type_bits & (1 << i) != 0 && t.property_flags.contains(properties)
            {
                return Ok(i as u32);
            }
        }
        Err(VulkanError::NoSuitableMemoryType)
    }

    fn type_is_host_visible(&self, memory_index: u32) -> bool {
        let snapshot = self.snapshot.lock().unwrap();
        snapshot.types[memory_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn device_heap_is_low(&self, memory_index: u32) -> bool {
        let snapshot = self.snapshot.lock().unwrap();
        snapshot.types[memory_index as usize].heap_index == snapshot.device_heap
            && snapshot.available_device_mib <= 64 + self.chunk_size / 1024 / 1024
    }

    /// Allocate a sub-range of device memory from the given batch.
    pub fn allocate(
        &self,
        requirements: &vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
        batch: u32,
    ) -> VulkanResult<SubMemory> {
        if requirements.size == 0 {
            return Ok(SubMemory::default());
        }
        let memory_index = self.find_memory_index(requirements, properties, preferred)?;
        let alignment = requirements.alignment.max(1);
        let mut may_release = !self.has_released_this_frame.load(Ordering::Acquire);
        loop {
            let mut guard = self.batches[batch as usize].lock().unwrap();
            let mut sub = if requirements.size > self.chunk_size {
                // Oversized request: give it a chunk of its own
                self.allocate_chunk(&mut guard, memory_index, batch, requirements.size, false)?
            } else if let Some(sub) = guard.types[memory_index as usize]
                .free
                .acquire(requirements.size, alignment)
            {
                sub
            } else if !self.using_batches && self.type_is_host_visible(memory_index) {
                // Host-visible memory is allocated separately so concurrent
                // host access to different buffers never shares a chunk
                self.allocate_chunk(&mut guard, memory_index, batch, requirements.size, false)?
            } else if may_release && self.device_heap_is_low(memory_index) {
                drop(guard);
                self.release_unused_memory();
                self.has_released_this_frame.store(true, Ordering::Release);
                may_release = false;
                self.log_resources();
                continue;
            } else {
                self.allocate_chunk(&mut guard, memory_index, batch, self.chunk_size, true)?
            };
            allocate_in_sub_memory(
                &mut guard.types[memory_index as usize].free,
                &mut sub,
                requirements.size,
                alignment,
            );
            return Ok(sub);
        }
    }

    /// Allocate dedicated memory for one image or buffer.
    pub fn allocate_dedicated(
        &self,
        requirements: &vk::MemoryRequirements,
        dedicated_info: &vk::MemoryDedicatedAllocateInfo,
        properties: vk::MemoryPropertyFlags,
        preferred: vk::MemoryPropertyFlags,
    ) -> VulkanResult<SubMemory> {
        let memory_index = self.find_memory_index(requirements, properties, preferred)?;
        if !self.has_released_this_frame.load(Ordering::Acquire) && self.device_heap_is_low(memory_index)
        {
            self.release_unused_memory();
            self.has_released_this_frame.store(true, Ordering::Release);
            self.log_resources();
        }
        let mut info = *dedicated_info;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_index)
            .push_next(&mut info);
        match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => {
                self.sink.put(
                    &format!(
                        "Dedicated allocation of {} MiB of GPU memory.",
                        requirements.size / 1024 / 1024
                    ),
                    LogLevel::Debug,
                );
                self.log_resources();
                Ok(SubMemory {
                    memory,
                    offset: 0,
                    size: DEDICATED_SIZE,
                    memory_index,
                    batch: NO_BATCH,
                })
            }
            Err(_) => {
                self.sink.put(
                    &format!(
                        "Failed dedicated allocation of {} MiB of GPU memory.",
                        requirements.size / 1024 / 1024
                    ),
                    LogLevel::Error,
                );
                Err(VulkanError::OutOfMemory {
                    requested: requirements.size,
                })
            }
        }
    }

    fn allocate_chunk(
        &self,
        guard: &mut MutexGuard<'_, BatchState>,
        memory_index: u32,
        batch: u32,
        size: vk::DeviceSize,
        register: bool,
    ) -> VulkanResult<SubMemory> {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(memory_index);
        let heap_kind = {
            let snapshot = self.snapshot.lock().unwrap();
            let heap = snapshot.types[memory_index as usize].heap_index as usize;
            if snapshot
                .heaps
                .get(heap)
                .map_or(false, |h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            {
                "GPU"
            } else {
                "local"
            }
        };
        match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => {
                self.sink.put(
                    &format!("Allocate chunk of {} MiB in {heap_kind} memory.", size / 1024 / 1024),
                    LogLevel::Debug,
                );
                let sub = if register {
                    guard.types[memory_index as usize].chunks.push(memory);
                    SubMemory {
                        memory,
                        offset: 0,
                        size,
                        memory_index,
                        batch,
                    }
                } else {
                    SubMemory {
                        memory,
                        offset: 0,
                        size: DEDICATED_SIZE,
                        memory_index,
                        batch: NO_BATCH,
                    }
                };
                self.refresh_snapshot();
                Ok(sub)
            }
            Err(_) => {
                self.sink.put(
                    &format!(
                        "Failed to allocate chunk of {} MiB in {heap_kind} memory.",
                        size / 1024 / 1024
                    ),
                    LogLevel::Error,
                );
                Err(VulkanError::OutOfMemory { requested: size })
            }
        }
    }

    /// Return a sub-range to its free-list, or free a dedicated allocation.
    pub fn free(&self, mut sub: SubMemory) {
        if sub.is_null() {
            return;
        }
        if sub.is_dedicated() {
            unsafe { self.device.free_memory(sub.memory, None) };
            return;
        }
        let mut guard = self.batches[sub.batch as usize].lock().unwrap();
        let free = &mut guard.types[sub.memory_index as usize].free;
        free.merge(&mut sub);
        free.insert(sub);
    }

    /// Map a sub-range; chunk mappings are reference counted, dedicated
    /// allocations map directly.
    pub fn map(&self, sub: &SubMemory) -> VulkanResult<*mut u8> {
        if sub.batch == NO_BATCH {
            let ptr = unsafe {
                self.device
                    .map_memory(sub.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(VulkanError::Api)?
            };
            return Ok(unsafe { ptr.cast::<u8>().add(sub.offset as usize) });
        }
        let mut guard = self.batches[sub.batch as usize].lock().unwrap();
        let entry = guard.mapped.entry(sub.memory).or_insert(MappedChunk {
            mappings: 0,
            ptr: std::ptr::null_mut(),
        });
        entry.mappings += 1;
        if entry.mappings == 1 {
            entry.ptr = unsafe {
                self.device
                    .map_memory(sub.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                    .map_err(VulkanError::Api)?
                    .cast()
            };
        }
        Ok(unsafe { entry.ptr.add(sub.offset as usize) })
    }

    /// Drop one mapping reference, unmapping the chunk when it reaches zero.
    pub fn unmap(&self, sub: &SubMemory) {
        if sub.batch == NO_BATCH {
            unsafe { self.device.unmap_memory(sub.memory) };
            return;
        }
        let mut guard = self.batches[sub.batch as usize].lock().unwrap();
        if let Some(entry) = guard.mapped.get_mut(&sub.memory) {
            entry.mappings -= 1;
            if entry.mappings == 0 {
                unsafe { self.device.unmap_memory(sub.memory) };
                guard.mapped.remove(&sub.memory);
            }
        }
    }

    /// Refresh the budget and return per-heap statistics.
    pub fn query_memory(&self) -> Vec<MemoryQuery> {
        self.refresh_snapshot();
        let snapshot = self.snapshot.lock().unwrap();
        snapshot
            .heaps
            .iter()
            .enumerate()
            .map(|(i, heap)| MemoryQuery {
                total: heap.size,
                available: snapshot.budget[i],
                used: snapshot.usage[i],
                free: snapshot.budget[i].saturating_sub(snapshot.usage[i]),
                flags: heap.flags,
            })
            .collect()
    }

    /// Free every chunk that is entirely unused. One sweep runs at a time;
    /// concurrent calls return immediately.
    pub fn release_unused_chunks(&self) {
        if self.releasing.swap(true, Ordering::AcqRel) {
            return;
        }
        for batch in &self.batches {
            let mut guard = batch.lock().unwrap();
            for t in &mut guard.types {
                for memory in t.free.take_whole_chunks(self.chunk_size) {
                    t.chunks.retain(|c| *c != memory);
                    unsafe { self.device.free_memory(memory, None) };
                }
            }
        }
        self.releasing.store(false, Ordering::Release);
    }

    /// Low-memory reaction: unused-chunk sweep plus the application hook.
    pub fn release_unused_memory(&self) {
        self.sink.put(
            "Low GPU memory detected - release unused memory",
            LogLevel::Warning,
        );
        self.release_unused_chunks();
        if let Some(hook) = &self.custom_release {
            hook();
        }
    }

    /// Dump the free ranges of one batch to the log.
    pub fn log_fragmentation(&self, batch: u32) {
        let guard = self.batches[batch as usize].lock().unwrap();
        let mut out = format!("----- Fragmentation of memory batch {batch} -----\n");
        for (i, t) in guard.types.iter().enumerate() {
            let mut ranges = t.free.iter().peekable();
            if ranges.peek().is_none() {
                continue;
            }
            out.push_str(&format!("Memory type {i} :\n"));
            for s in ranges {
                out.push_str(&format!(
                    "\tmemory={:?}, offset={} ({} MiB), size={} ({}/{} MiB)\n",
                    s.memory,
                    s.offset,
                    s.offset / 1024 / 1024,
                    s.size,
                    s.size / 1024 / 1024,
                    self.chunk_size / 1024 / 1024,
                ));
            }
        }
        drop(guard);
        self.sink.put(out.trim_end(), LogLevel::Debug);
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for batch in &self.batches {
                let guard = batch.lock().unwrap();
                for t in &guard.types {
                    for chunk in &t.chunks {
                        self.device.free_memory(*chunk, None);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn chunk(id: u64) -> vk::DeviceMemory {
        vk::DeviceMemory::from_raw(id)
    }

    fn sub(id: u64, offset: u64, size: u64) -> SubMemory {
        SubMemory {
            memory: chunk(id),
            offset,
            size,
            memory_index: 0,
            batch: 0,
        }
    }

    fn seeded(chunk_size: u64) -> FreeList {
        let mut free = FreeList::default();
        free.insert(sub(1, 0, chunk_size));
        free
    }

    #[test]
    fn test_insert_keeps_size_order() {
        let mut free = FreeList::default();
        free.insert(sub(1, 0, 64));
        free.insert(sub(1, 128, 16));
        free.insert(sub(1, 256, 32));
        assert!(free.is_sorted());
    }

    #[test]
    fn test_acquire_is_smallest_fit() {
        let mut free = FreeList::default();
        free.insert(sub(1, 0, 64));
        free.insert(sub(1, 512, 128));
        let got = free.acquire(60, 1).unwrap();
        assert_eq!(got.size, 64);
    }

    #[test]
    fn test_acquire_alignment_absorption_rule() {
        let mut free = FreeList::default();
        // Offset 24, alignment 16: misaligned prefix of 8 bytes must fit too
        free.insert(sub(1, 24, 40));
        assert!(free.acquire(33, 16).is_none());
        let got = free.acquire(32, 16).unwrap();
        assert_eq!(got.offset, 24);
        assert_eq!(got.size, 40);
    }

    #[test]
    fn test_split_releases_padding_and_tail() {
        let mut free = FreeList::default();
        let mut s = sub(1, 24, 104);
        allocate_in_sub_memory(&mut free, &mut s, 32, 16);
        assert_eq!(s.offset, 32);
        assert_eq!(s.size, 32);
        // 8 bytes of prefix and 64 bytes of tail went back
        assert_eq!(free.total_size(), 72);
        assert!(free.is_sorted());
    }

    #[test]
    fn test_free_merges_both_neighbours() {
        let mut free = FreeList::default();
        free.insert(sub(1, 0, 32));
        free.insert(sub(1, 64, 32));
        let mut released = sub(1, 32, 32);
        free.merge(&mut released);
        free.insert(released);
        assert_eq!(free.iter().count(), 1);
        let merged = free.iter().next().unwrap();
        assert_eq!(merged.offset, 0);
        assert_eq!(merged.size, 96);
    }

    #[test]
    fn test_merge_ignores_other_chunks() {
        let mut free = FreeList::default();
        free.insert(sub(2, 32, 32));
        let mut released = sub(1, 0, 32);
        free.merge(&mut released);
        free.insert(released);
        assert_eq!(free.iter().count(), 2);
    }

    #[test]
    fn test_round_trip_restores_free_list() {
        let mut free = seeded(1 << 20);
        let mut s = free.acquire(4096, 256).unwrap();
        allocate_in_sub_memory(&mut free, &mut s, 4096, 256);
        free.merge(&mut s);
        free.insert(s);
        assert_eq!(free.iter().count(), 1);
        assert_eq!(free.total_size(), 1 << 20);
    }

    #[test]
    fn test_take_whole_chunks() {
        let mut free = FreeList::default();
        free.insert(sub(1, 0, 4096));
        free.insert(sub(2, 0, 1024));
        let freed = free.take_whole_chunks(4096);
        assert_eq!(freed, vec![chunk(1)]);
        assert_eq!(free.iter().count(), 1);
    }

    /// Allocator stress per the end-to-end scenario: 2000 × 8 KiB, free every
    /// second one, then 500 × 16 KiB, against simulated 4 MiB chunks.
    #[test]
    fn test_allocator_stress_live_size_and_order() {
        const CHUNK: u64 = 4 * 1024 * 1024;
        let mut free = FreeList::default();
        let mut next_chunk = 1u64;
        let mut allocate = |free: &mut FreeList, size: u64, align: u64| -> SubMemory {
            let mut s = match free.acquire(size, align) {
                Some(s) => s,
                None => {
                    let s = sub(next_chunk, 0, CHUNK);
                    next_chunk += 1;
                    s
                }
            };
            allocate_in_sub_memory(free, &mut s, size, align);
            s
        };
        let mut live: Vec<SubMemory> = (0..2000)
            .map(|_| allocate(&mut free, 8 * 1024, 256))
            .collect();
        assert!(live.iter().all(|s| !s.is_null() && s.offset % 256 == 0));
        // Free every second allocation
        let mut kept = Vec::new();
        for (i, mut s) in live.drain(..).enumerate() {
            if i % 2 == 1 {
                free.merge(&mut s);
                free.insert(s);
            } else {
                kept.push(s);
            }
        }
        for _ in 0..500 {
            kept.push(allocate(&mut free, 16 * 1024, 256));
        }
        let live_total: u64 = kept.iter().map(|s| s.size).sum();
        assert_eq!(live_total, 1000 * 8 * 1024 + 500 * 16 * 1024);
        assert!(free.is_sorted());
        // Live ranges never overlap
        let mut ranges: Vec<(u64, u64, u64)> = kept
            .iter()
            .map(|s| (s.memory.as_raw(), s.offset, s.size))
            .collect();
        ranges.sort_unstable();
        for w in ranges.windows(2) {
            let ((mem_a, off_a, size_a), (mem_b, off_b, _)) = (w[0], w[1]);
            assert!(mem_a != mem_b || off_a + size_a <= off_b);
        }
    }
}
