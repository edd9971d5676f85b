//! Batched host-to-device copy planner
//!
//! A [`TransferMgr`] owns one staging sub-buffer carved from a host-visible
//! [`BufferMgr`] and hands out write cursors into it. Every planned write is
//! remembered as a pending `VkBufferCopy` grouped by destination buffer, so
//! [`TransferMgr::copy`] can record one host-write barrier plus one
//! `vkCmdCopyBuffer` per destination and reset the staging cursor for the
//! next frame.
//!
//! Copies between two device buffers can also be planned; they are grouped
//! by (source, destination) pair and recorded in the same flush.

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;

use crate::buffer::{BufferMgr, SubBuffer};
use crate::context::VulkanContext;
use crate::error::VulkanResult;
use crate::sync::SyncEvent;

/// Pure planning state: the staging cursor plus the pending copy regions.
///
/// Offsets returned by the plan calls are relative to the staging base
/// pointer; the manager turns them into host pointers.
struct CopyPlan {
    staging: SubBuffer,
    capacity: u32,
    used: u32,
    pending: HashMap<vk::Buffer, Vec<vk::BufferCopy>>,
    pending_external: HashMap<(vk::Buffer, vk::Buffer), Vec<vk::BufferCopy>>,
    planning: bool,
}

impl CopyPlan {
    fn new(staging: SubBuffer) -> Self {
        Self {
            capacity: staging.size,
            staging,
            used: 0,
            pending: HashMap::new(),
            pending_external: HashMap::new(),
            planning: false,
        }
    }

    /// Reserve up to `size` bytes without committing them yet; returns the
    /// write offset inside the staging range.
    fn begin_plan(&mut self, size: u32) -> Option<u32> {
        debug_assert!(!self.planning, "a planned copy is already open");
        if self.used + size > self.capacity {
            return None;
        }
        self.planning = true;
        Some(self.used)
    }

    /// Commit a reservation with its final size; zero cancels it.
    fn end_plan(&mut self, dst: &SubBuffer, size: u32) {
        debug_assert!(self.planning, "no planned copy is open");
        self.planning = false;
        if size == 0 {
            return;
        }
        self.pending.entry(dst.buffer).or_default().push(vk::BufferCopy {
            src_offset: vk::DeviceSize::from(self.staging.offset + self.used),
            dst_offset: vk::DeviceSize::from(dst.offset),
            size: vk::DeviceSize::from(size),
        });
        self.used += size;
    }

    /// Plan a copy of `size` bytes to `dst` at `dst_offset`; returns the
    /// staging write offset, or `None` when the staging range is exhausted.
    fn plan(&mut self, dst: &SubBuffer, dst_offset: u32, size: u32) -> Option<u32> {
        debug_assert!(!self.planning, "a planned copy is already open");
        if self.used + size > self.capacity {
            return None;
        }
        let at = self.used;
        self.pending.entry(dst.buffer).or_default().push(vk::BufferCopy {
            src_offset: vk::DeviceSize::from(self.staging.offset + at),
            dst_offset: vk::DeviceSize::from(dst.offset + dst_offset),
            size: vk::DeviceSize::from(size),
        });
        self.used += size;
        Some(at)
    }

    /// Plan a copy between two buffers, bypassing the staging range unless
    /// the source already lives in it.
    fn plan_between(&mut self, src: &SubBuffer, dst: &SubBuffer, size: u32, src_offset: u32, dst_offset: u32) {
        let copy = vk::BufferCopy {
            src_offset: vk::DeviceSize::from(src.offset + src_offset),
            dst_offset: vk::DeviceSize::from(dst.offset + dst_offset),
            size: vk::DeviceSize::from(size),
        };
        if src.buffer == self.staging.buffer {
            self.pending.entry(dst.buffer).or_default().push(copy);
        } else {
            self.pending_external
                .entry((src.buffer, dst.buffer))
                .or_default()
                .push(copy);
        }
    }

    /// Drain the pending regions and reset the cursor. Each entry is one
    /// `vkCmdCopyBuffer` call: (source, destination, regions).
    fn take_batches(&mut self) -> Vec<(vk::Buffer, vk::Buffer, Vec<vk::BufferCopy>)> {
        self.used = 0;
        let staging = self.staging.buffer;
        let mut batches: Vec<_> = self
            .pending
            .iter_mut()
            .filter(|(_, regions)| !regions.is_empty())
            .map(|(dst, regions)| (staging, *dst, std::mem::take(regions)))
            .collect();
        batches.extend(
            self.pending_external
                .iter_mut()
                .filter(|(_, regions)| !regions.is_empty())
                .map(|((src, dst), regions)| (*src, *dst, std::mem::take(regions))),
        );
        batches
    }

    fn used_space(&self) -> u32 {
        self.used
    }

    fn remaining_space(&self) -> u32 {
        self.capacity - self.used
    }
}

/// Staging planner flushing all pending copies in one recording call.
pub struct TransferMgr {
    ctx: Arc<VulkanContext>,
    mgr: Arc<BufferMgr>,
    barrier: SyncEvent,
    ptr: *mut u8,
    plan: CopyPlan,
}

// The staging pointer aliases host-visible memory exactly like the backing
// manager's mapping; access follows the same single-writer contract.
unsafe impl Send for TransferMgr {}

impl TransferMgr {
    /// Carve `size` bytes of staging out of `mgr` and pre-build the
    /// host-write to transfer-read barrier replayed by every flush.
    pub fn new(ctx: &Arc<VulkanContext>, mgr: &Arc<BufferMgr>, size: u32) -> VulkanResult<Self> {
        let staging = mgr.acquire(size, false)?;
        let ptr = mgr.ptr(&staging);
        let mut barrier = SyncEvent::new(ctx, vk::DependencyFlags::empty());
        barrier.buffer_barrier(
            &staging,
            vk::PipelineStageFlags2::HOST,
            vk::PipelineStageFlags2::COPY,
            vk::AccessFlags2::HOST_WRITE,
            vk::AccessFlags2::TRANSFER_READ,
        );
        barrier.build();
        Ok(Self {
            ctx: Arc::clone(ctx),
            mgr: Arc::clone(mgr),
            barrier,
            ptr,
            plan: CopyPlan::new(staging),
        })
    }

    /// Reserve up to `size` bytes and return the host pointer to write
    /// through, or null when the staging range cannot hold the reservation.
    /// Commit with [`TransferMgr::end_plan_copy`].
    pub fn begin_plan_copy(&mut self, size: u32) -> *mut u8 {
        match self.plan.begin_plan(size) {
            Some(at) => unsafe { self.ptr.add(at as usize) },
            None => std::ptr::null_mut(),
        }
    }

    /// Commit the open reservation with its final size; zero cancels it.
    pub fn end_plan_copy(&mut self, dst: &SubBuffer, size: u32) {
        self.plan.end_plan(dst, size);
    }

    /// Plan a copy covering the whole of `dst` and return the host pointer
    /// to fill, or null when the staging range is exhausted.
    pub fn plan_copy(&mut self, dst: &SubBuffer) -> *mut u8 {
        self.plan_copy_range(dst, 0, dst.size)
    }

    /// Plan a copy of `size` bytes into `dst` at `offset`.
    pub fn plan_copy_range(&mut self, dst: &SubBuffer, offset: u32, size: u32) -> *mut u8 {
        match self.plan.plan(dst, offset, size) {
            Some(at) => unsafe { self.ptr.add(at as usize) },
            None => std::ptr::null_mut(),
        }
    }

    /// Plan a copy of the whole of `dst` from an already filled source.
    pub fn plan_copy_between(&mut self, src: &SubBuffer, dst: &SubBuffer) {
        self.plan.plan_between(src, dst, dst.size, 0, 0);
    }

    /// Plan a copy of `size` bytes between two sub-buffers with per-call
    /// offsets.
    pub fn plan_copy_between_range(
        &mut self,
        src: &SubBuffer,
        dst: &SubBuffer,
        size: u32,
        src_offset: u32,
        dst_offset: u32,
    ) {
        self.plan.plan_between(src, dst, size, src_offset, dst_offset);
    }

    /// Record the barrier and every pending copy, then reset the staging
    /// cursor so planning can start over.
    pub fn copy(&mut self, cmd: vk::CommandBuffer) {
        self.barrier.place_barrier(cmd);
        for (src, dst, regions) in self.plan.take_batches() {
            unsafe {
                self.ctx.device().cmd_copy_buffer(cmd, src, dst, &regions);
            }
        }
    }

    /// Bytes planned since the last flush.
    pub fn used_space(&self) -> u32 {
        self.plan.used_space()
    }

    /// Bytes still plannable until the next flush.
    pub fn remaining_space(&self) -> u32 {
        self.plan.remaining_space()
    }

    /// Fraction of the staging range currently planned.
    pub fn used_ratio(&self) -> f32 {
        self.plan.used_space() as f32 / self.plan.capacity as f32
    }
}

impl Drop for TransferMgr {
    fn drop(&mut self) {
        self.mgr.release(self.plan.staging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sub(buffer: u64, offset: u32, size: u32) -> SubBuffer {
        SubBuffer {
            buffer: vk::Buffer::from_raw(buffer),
            offset,
            size,
        }
    }

    fn plan_of(capacity: u32) -> CopyPlan {
        // Staging carved at offset 4096 of buffer 1
        CopyPlan::new(sub(1, 4096, capacity))
    }

    #[test]
    fn test_plan_advances_cursor_and_records_region() {
        let mut plan = plan_of(1024);
        let dst = sub(2, 256, 100);
        assert_eq!(plan.plan(&dst, 0, 100), Some(0));
        assert_eq!(plan.plan(&dst, 100, 50), Some(100));
        assert_eq!(plan.used_space(), 150);
        assert_eq!(plan.remaining_space(), 874);
        let regions = &plan.pending[&dst.buffer];
        assert_eq!(regions[0].src_offset, 4096);
        assert_eq!(regions[0].dst_offset, 256);
        assert_eq!(regions[1].src_offset, 4196);
        assert_eq!(regions[1].dst_offset, 356);
    }

    #[test]
    fn test_plan_fails_without_side_effect_when_full() {
        let mut plan = plan_of(128);
        let dst = sub(2, 0, 100);
        assert!(plan.plan(&dst, 0, 100).is_some());
        assert!(plan.plan(&dst, 0, 100).is_none());
        assert_eq!(plan.used_space(), 100);
        assert_eq!(plan.pending[&dst.buffer].len(), 1);
    }

    #[test]
    fn test_begin_end_plan_commits_final_size() {
        let mut plan = plan_of(256);
        let dst = sub(3, 64, 200);
        let at = plan.begin_plan(200).unwrap();
        assert_eq!(at, 0);
        // Only 120 of the reserved 200 bytes were written
        plan.end_plan(&dst, 120);
        assert_eq!(plan.used_space(), 120);
        assert_eq!(plan.pending[&dst.buffer][0].size, 120);
    }

    #[test]
    fn test_cancelled_reservation_leaves_no_trace() {
        let mut plan = plan_of(256);
        let dst = sub(3, 0, 64);
        plan.begin_plan(64).unwrap();
        plan.end_plan(&dst, 0);
        assert_eq!(plan.used_space(), 0);
        assert!(plan.pending.get(&dst.buffer).map_or(true, Vec::is_empty));
    }

    #[test]
    fn test_between_routes_by_source_buffer() {
        let mut plan = plan_of(256);
        let internal_src = sub(1, 0, 32);
        let external_src = sub(7, 0, 32);
        let dst = sub(2, 0, 32);
        plan.plan_between(&internal_src, &dst, 32, 0, 0);
        plan.plan_between(&external_src, &dst, 32, 0, 0);
        assert_eq!(plan.pending[&dst.buffer].len(), 1);
        assert_eq!(
            plan.pending_external[&(external_src.buffer, dst.buffer)].len(),
            1
        );
    }

    #[test]
    fn test_take_batches_drains_and_resets() {
        let mut plan = plan_of(512);
        let dst_a = sub(2, 0, 64);
        let dst_b = sub(3, 0, 64);
        plan.plan(&dst_a, 0, 64);
        plan.plan(&dst_b, 0, 64);
        plan.plan_between(&sub(7, 0, 16), &dst_a, 16, 0, 0);
        let batches = plan.take_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(plan.used_space(), 0);
        // Every staged batch copies out of the staging buffer
        let staged: Vec<_> = batches.iter().filter(|(src, _, _)| src.as_raw() == 1).collect();
        assert_eq!(staged.len(), 2);
        assert!(plan.take_batches().is_empty());
    }
}
