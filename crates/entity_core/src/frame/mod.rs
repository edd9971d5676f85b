//! Frame orchestration
//!
//! A [`FrameMgr`] owns everything needed to render one frame: the
//! framebuffer, the command pools, the primary command buffer and a lazily
//! grown block of secondary command buffers. Secondaries queued with
//! [`FrameMgr::to_execute`] are batched per subpass; [`FrameMgr::submit`]
//! hands the frame to the single helper thread, which walks the batches,
//! emits the subpass advances and `ExecuteCommands`, and invokes the
//! user-supplied finalize callback.
//!
//! When using the helper, the primary command buffer must not be touched
//! outside the finalize callback after the first `submit`, except through
//! [`FrameMgr::begin_main`].

pub mod work_queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ash::vk;

use crate::context::swapchain::ViewportState;
use crate::context::VulkanContext;
use crate::error::{VulkanError, VulkanResult};
use crate::logging::LogLevel;
use crate::render::RenderMgr;
use crate::sync::SyncEvent;
use crate::texture::Texture;
use work_queue::WorkQueue;

/// Finalize callback invoked by [`FrameMgr::submit_inline`]; it must end the
/// render pass and the primary command buffer (typically through
/// [`FrameMgr::compile_main`]) and submit to a queue.
pub type SubmitFn = Box<dyn Fn(&FrameMgr, i32) + Send + Sync>;

/// Queue capacity of the helper thread.
const HELPER_QUEUE_CAPACITY: usize = 7;

struct Batches {
    per_subpass: Vec<Vec<vk::CommandBuffer>>,
    current: usize,
}

/// Compact each batch in place, consuming the sorted cancel list. Upon the
/// first match in a batch the tail is shifted down over further matches, so
/// surviving commands keep their relative order.
fn cancel_in_batches(batches: &mut [Vec<vk::CommandBuffer>], cancelled: &[vk::CommandBuffer]) {
    let mut remaining = cancelled.iter().copied();
    let Some(mut target) = remaining.next() else {
        return;
    };
    for batch in batches {
        let Some(first) = batch.iter().position(|c| *c == target) else {
            continue;
        };
        let mut next = remaining.next();
        let mut dst = first;
        for src in (first + 1)..batch.len() {
            if Some(batch[src]) == next {
                next = remaining.next();
            } else {
                batch[dst] = batch[src];
                dst += 1;
            }
        }
        batch.truncate(dst);
        match next {
            Some(t) => target = t,
            None => return,
        }
    }
}

/// Per-frame framebuffer, command pools and subpass batches.
pub struct FrameMgr {
    ctx: Arc<VulkanContext>,
    renderer: Arc<RenderMgr>,
    id: i32,
    name: String,
    width: u32,
    height: u32,
    views: Vec<vk::ImageView>,
    framebuffer: vk::Framebuffer,
    graphic_pool: vk::CommandPool,
    secondary_pool: vk::CommandPool,
    main_cmd: vk::CommandBuffer,
    one_time_submit: bool,
    cmds: Mutex<Vec<vk::CommandBuffer>>,
    batches: Mutex<Batches>,
    submitted: AtomicBool,
    submit_fn: Option<SubmitFn>,
    built: bool,
}

impl FrameMgr {
    /// Create an orchestrator bound to a built render pass. `submit_fn` runs
    /// at the end of [`FrameMgr::submit_inline`], on the helper thread when
    /// the frame goes through [`FrameMgr::submit`].
    pub fn new(
        ctx: &Arc<VulkanContext>,
        renderer: &Arc<RenderMgr>,
        id: i32,
        width: u32,
        height: u32,
        name: &str,
        submit_fn: Option<SubmitFn>,
    ) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            renderer: Arc::clone(renderer),
            id,
            name: name.to_owned(),
            width,
            height,
            views: Vec::new(),
            framebuffer: vk::Framebuffer::null(),
            graphic_pool: vk::CommandPool::null(),
            secondary_pool: vk::CommandPool::null(),
            main_cmd: vk::CommandBuffer::null(),
            one_time_submit: false,
            cmds: Mutex::new(Vec::new()),
            batches: Mutex::new(Batches {
                per_subpass: Vec::new(),
                current: 0,
            }),
            submitted: AtomicBool::new(true),
            submit_fn,
            built: false,
        }
    }

    /// Bind an attachment view at the render pass attachment id.
    pub fn bind_view(&mut self, id: u32, view: vk::ImageView) {
        let id = id as usize;
        if id >= self.views.len() {
            self.views.resize(id + 1, vk::ImageView::null());
        }
        self.views[id] = view;
    }

    /// Bind a texture's view at the render pass attachment id.
    pub fn bind_texture(&mut self, id: u32, texture: &Texture) {
        self.bind_view(id, texture.view());
    }

    /// Build the framebuffer, and when `queue_family` is given, the command
    /// pools and primary command buffer.
    ///
    /// `always_record` marks the pools transient and the primary one-time
    /// submit. `use_secondary` enables the secondary pool and the subpass
    /// batches. With `static_secondary`, re-recording a secondary requires
    /// [`FrameMgr::discard_record`] followed by recording every secondary
    /// again.
    pub fn build(
        &mut self,
        queue_family: Option<u32>,
        always_record: bool,
        use_secondary: bool,
        static_secondary: bool,
    ) -> VulkanResult<()> {
        let info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.renderer.handle())
            .attachments(&self.views)
            .width(self.width)
            .height(self.height)
            .layers(1);
        self.framebuffer = unsafe {
            self.ctx.device().create_framebuffer(&info, None).map_err(|e| {
                self.ctx
                    .put_log(&format!("Failed to build FrameBuffer '{}'", self.name), LogLevel::Error);
                VulkanError::Api(e)
            })?
        };
        self.built = true;
        if let Some(family) = queue_family {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .flags(if always_record {
                    vk::CommandPoolCreateFlags::TRANSIENT
                } else {
                    vk::CommandPoolCreateFlags::empty()
                })
                .queue_family_index(family);
            self.graphic_pool = unsafe {
                self.ctx
                    .device()
                    .create_command_pool(&pool_info, None)
                    .map_err(VulkanError::Api)?
            };
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(self.graphic_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            self.main_cmd = unsafe {
                self.ctx
                    .device()
                    .allocate_command_buffers(&alloc_info)
                    .map_err(VulkanError::Api)?[0]
            };
            self.ctx.set_object_name(
                self.main_cmd,
                vk::ObjectType::COMMAND_BUFFER,
                &format!("mainCmd of {}", self.name),
            );
            self.one_time_submit = always_record;
            if use_secondary {
                let pool_info = vk::CommandPoolCreateInfo::builder()
                    .flags(if static_secondary {
                        vk::CommandPoolCreateFlags::empty()
                    } else {
                        vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    })
                    .queue_family_index(family);
                self.secondary_pool = unsafe {
                    self.ctx
                        .device()
                        .create_command_pool(&pool_info, None)
                        .map_err(VulkanError::Api)?
                };
                self.batches.lock().unwrap().per_subpass =
                    (0..self.renderer.pass_count()).map(|_| Vec::new()).collect();
            }
        }
        self.views.clear();
        self.views.shrink_to_fit();
        self.ctx
            .set_object_name(self.framebuffer, vk::ObjectType::FRAMEBUFFER, &self.name);
        self.renderer.bind(
            self.id as usize,
            self.framebuffer,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.width,
                    height: self.height,
                },
            },
        );
        self.ctx.put_log(
            &format!(
                "Build FrameBuffer '{}' with size ({}, {})",
                self.name, self.width, self.height
            ),
            LogLevel::Debug,
        );
        Ok(())
    }

    /// Allocate `count` secondaries and return the index of the first one.
    pub fn create(&self, count: u32) -> VulkanResult<usize> {
        let mut cmds = self.cmds.lock().unwrap();
        let first = cmds.len();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.secondary_pool)
            .level(vk::CommandBufferLevel::SECONDARY)
            .command_buffer_count(count);
        let new = unsafe {
            self.ctx
                .device()
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| {
                    self.ctx
                        .put_log("Failed to allocate command buffer", LogLevel::Error);
                    VulkanError::Api(e)
                })?
        };
        cmds.extend(new);
        Ok(first)
    }

    /// Handle of a secondary by index.
    pub fn handle(&self, idx: usize) -> vk::CommandBuffer {
        self.cmds.lock().unwrap()[idx]
    }

    fn inheritance(&self, subpass: u32) -> vk::CommandBufferInheritanceInfo {
        vk::CommandBufferInheritanceInfo::builder()
            .render_pass(self.renderer.handle())
            .subpass(subpass)
            .framebuffer(self.framebuffer)
            .build()
    }

    /// Start recording the secondary at `idx` for the given subpass.
    pub fn begin(&self, idx: usize, subpass: u32) -> VulkanResult<vk::CommandBuffer> {
        let cmd = self.handle(idx);
        self.begin_async(cmd, subpass)?;
        Ok(cmd)
    }

    /// Start recording a secondary for the given subpass. The begin info is
    /// copied locally, so this is safe to call from several recording threads
    /// at once for the same orchestrator.
    pub fn begin_async(&self, cmd: vk::CommandBuffer, subpass: u32) -> VulkanResult<()> {
        let inheritance = self.inheritance(subpass);
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .inheritance_info(&inheritance);
        unsafe {
            self.ctx
                .device()
                .begin_command_buffer(cmd, &info)
                .map_err(VulkanError::Api)
        }
    }

    /// End the secondary at `idx`.
    pub fn compile(&self, idx: usize) -> VulkanResult<()> {
        self.compile_cmd(self.handle(idx))
    }

    /// End a secondary by handle.
    pub fn compile_cmd(&self, cmd: vk::CommandBuffer) -> VulkanResult<()> {
        unsafe {
            self.ctx
                .device()
                .end_command_buffer(cmd)
                .map_err(VulkanError::Api)
        }
    }

    /// Name a secondary for validation output.
    pub fn set_name(&self, idx: usize, name: &str) {
        self.ctx
            .set_object_name(self.handle(idx), vk::ObjectType::COMMAND_BUFFER, name);
    }

    /// Reset the secondary pool, discarding every recorded secondary.
    pub fn discard_record(&self) {
        if self.secondary_pool != vk::CommandPool::null() {
            unsafe {
                let _ = self
                    .ctx
                    .device()
                    .reset_command_pool(self.secondary_pool, vk::CommandPoolResetFlags::empty());
            }
        }
    }

    /// Begin recording the primary: reset the graphic pool, transition the
    /// given textures to their sampled state, replay the sync dependency and
    /// begin the render pass.
    pub fn begin_main(
        &self,
        content: vk::SubpassContents,
        textures: &[&Texture],
        sync: Option<&SyncEvent>,
    ) -> VulkanResult<vk::CommandBuffer> {
        let device = self.ctx.device();
        unsafe {
            device
                .reset_command_pool(self.graphic_pool, vk::CommandPoolResetFlags::empty())
                .map_err(VulkanError::Api)?;
            let info = vk::CommandBufferBeginInfo::builder().flags(if self.one_time_submit {
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
            } else {
                vk::CommandBufferUsageFlags::empty()
            });
            device
                .begin_command_buffer(self.main_cmd, &info)
                .map_err(VulkanError::Api)?;
        }
        for texture in textures {
            texture.use_in(self.main_cmd, true)?;
        }
        if let Some(sync) = sync {
            if sync.has_multi_dst_dependency() {
                sync.multi_dst_dependency(self.main_cmd);
            } else {
                sync.dst_dependency(self.main_cmd);
            }
        }
        self.renderer.begin(self.id as usize, self.main_cmd, content);
        Ok(self.main_cmd)
    }

    /// Advance the primary to the next subpass.
    pub fn next(&self, content: vk::SubpassContents) {
        unsafe { self.ctx.device().cmd_next_subpass(self.main_cmd, content) };
    }

    /// Helper-thread variant of [`FrameMgr::next`]: advance the batch cursor
    /// without touching the primary.
    pub fn next_pass(&self) {
        self.batches.lock().unwrap().current += 1;
    }

    /// Queue the secondary at `idx` for execution in the current subpass.
    pub fn to_execute(&self, idx: usize) {
        let cmd = self.handle(idx);
        let mut batches = self.batches.lock().unwrap();
        let current = batches.current;
        batches.per_subpass[current].push(cmd);
    }

    /// Queue the secondary at `idx` for execution in the given subpass.
    pub fn to_execute_in(&self, idx: usize, subpass: usize) {
        let cmd = self.handle(idx);
        self.batches.lock().unwrap().per_subpass[subpass].push(cmd);
    }

    /// Queue a secondary by handle for execution in the given subpass.
    pub fn to_execute_cmd(&self, cmd: vk::CommandBuffer, subpass: usize) {
        self.batches.lock().unwrap().per_subpass[subpass].push(cmd);
    }

    /// Remove pre-queued secondaries before submission. `cancelled` must be
    /// sorted by subpass first, then by queueing order; remaining commands
    /// keep their relative order.
    pub fn cancel_execution(&self, cancelled: &[vk::CommandBuffer]) {
        cancel_in_batches(&mut self.batches.lock().unwrap().per_subpass, cancelled);
    }

    /// Record an immediate `ExecuteCommands` of the secondary at `idx`.
    pub fn execute(&self, idx: usize) {
        let cmd = self.handle(idx);
        unsafe { self.ctx.device().cmd_execute_commands(self.main_cmd, &[cmd]) };
    }

    /// End the render pass and the primary command buffer.
    pub fn compile_main(&self) -> VulkanResult<()> {
        unsafe {
            self.ctx.device().cmd_end_render_pass(self.main_cmd);
            self.ctx
                .device()
                .end_command_buffer(self.main_cmd)
                .map_err(VulkanError::Api)
        }
    }

    /// Primary command buffer handle.
    pub fn main_handle(&self) -> vk::CommandBuffer {
        self.main_cmd
    }

    /// Hand the frame to the helper thread, backing off while its queue is
    /// full. The helper eventually runs [`FrameMgr::submit_inline`].
    pub fn submit(self: &Arc<Self>, helper: &FrameHelper) {
        self.submitted.store(false, Ordering::Release);
        while !helper.queue.push(Arc::clone(self)) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        helper.queue.flush();
    }

    /// Walk the subpass batches: advance the primary between non-first
    /// batches, execute the non-empty ones, then run the finalize callback.
    pub fn submit_inline(&self) {
        let device = self.ctx.device();
        let mut batches = self.batches.lock().unwrap();
        let mut first = true;
        for batch in &mut batches.per_subpass {
            if first {
                first = false;
            } else {
                unsafe {
                    device.cmd_next_subpass(self.main_cmd, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS);
                }
            }
            if !batch.is_empty() {
                unsafe { device.cmd_execute_commands(self.main_cmd, batch) };
            }
            batch.clear();
        }
        batches.current = 0;
        drop(batches);
        if let Some(submit_fn) = &self.submit_fn {
            submit_fn(self, self.id);
        }
        self.submitted.store(true, Ordering::Release);
    }

    /// True once the last submission has been consumed by the helper. Do not
    /// begin the primary again while this is `false`.
    pub fn is_done(&self) -> bool {
        self.submitted.load(Ordering::Acquire)
    }

    /// Viewport and scissor for a centered sub-extent of this framebuffer; a
    /// negative height flips the scissor like the context-level viewport.
    pub fn make_viewport(&self, width: u32, height: i32) -> ViewportState {
        crate::context::swapchain::derive_viewport(
            vk::Extent2D {
                width: self.width,
                height: self.height,
            },
            width as i32,
            height,
        )
    }
}

impl Drop for FrameMgr {
    fn drop(&mut self) {
        if self.built {
            unsafe {
                self.ctx.device().destroy_framebuffer(self.framebuffer, None);
                if self.graphic_pool != vk::CommandPool::null() {
                    self.ctx.device().destroy_command_pool(self.graphic_pool, None);
                    if self.secondary_pool != vk::CommandPool::null() {
                        self.ctx.device().destroy_command_pool(self.secondary_pool, None);
                    }
                }
            }
        }
    }
}

/// The helper thread finalizing submitted frames.
pub struct FrameHelper {
    queue: Arc<WorkQueue<Arc<FrameMgr>>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameHelper {
    /// Start the worker.
    pub fn start() -> Self {
        let queue = Arc::new(WorkQueue::<Arc<FrameMgr>>::new(HELPER_QUEUE_CAPACITY));
        let consumer = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("frame-helper".into())
            .spawn(move || {
                while let Some(frame) = consumer.pop() {
                    frame.submit_inline();
                }
            })
            .expect("failed to spawn the frame helper thread");
        Self {
            queue,
            thread: Some(thread),
        }
    }

    /// Close the queue and join the worker; pending frames are abandoned
    /// after the current drain.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.queue.close();
            let _ = thread.join();
        }
    }
}

impl Drop for FrameHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn cmd(id: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(id)
    }

    fn batches(content: &[&[u64]]) -> Vec<Vec<vk::CommandBuffer>> {
        content
            .iter()
            .map(|b| b.iter().map(|id| cmd(*id)).collect())
            .collect()
    }

    fn cancel(batches: &mut [Vec<vk::CommandBuffer>], cancelled: &[u64]) {
        let cancelled: Vec<_> = cancelled.iter().map(|id| cmd(*id)).collect();
        cancel_in_batches(batches, &cancelled);
    }

    fn flat(batches: &[Vec<vk::CommandBuffer>]) -> Vec<u64> {
        batches
            .iter()
            .flat_map(|b| b.iter().map(|c| c.as_raw()))
            .collect()
    }

    /// Cancellation scenario: [A,B,C,D] in subpass 0, [E,F] in subpass 1,
    /// cancel [B,D,F] → effective order A,C,E.
    #[test]
    fn test_cancel_execution_scenario() {
        let mut b = batches(&[&[1, 2, 3, 4], &[5, 6]]);
        cancel(&mut b, &[2, 4, 6]);
        assert_eq!(flat(&b), vec![1, 3, 5]);
    }

    #[test]
    fn test_cancel_preserves_remaining_order() {
        let mut b = batches(&[&[1, 2, 3, 4, 5]]);
        cancel(&mut b, &[1, 4]);
        assert_eq!(flat(&b), vec![2, 3, 5]);
    }

    #[test]
    fn test_cancel_contiguous_run() {
        let mut b = batches(&[&[1, 2, 3], &[4, 5, 6], &[7]]);
        cancel(&mut b, &[2, 3, 4, 7]);
        assert_eq!(flat(&b), vec![1, 5, 6]);
    }

    #[test]
    fn test_cancel_empty_list_is_noop() {
        let mut b = batches(&[&[1, 2]]);
        cancel(&mut b, &[]);
        assert_eq!(flat(&b), vec![1, 2]);
    }

    #[test]
    fn test_cancel_everything() {
        let mut b = batches(&[&[1, 2], &[3]]);
        cancel(&mut b, &[1, 2, 3]);
        assert!(flat(&b).is_empty());
    }
}
