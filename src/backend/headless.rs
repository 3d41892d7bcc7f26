//! Headless graphics device.
//!
//! This device doesn't touch a GPU. It hands out handles, keeps buffer
//! contents in memory, records every command into an inspectable log and
//! simulates fence completion, so the whole frame pipeline can run in tests
//! and on machines without Vulkan.
//!
//! Submitted work is retired in submission order. Nothing completes on its
//! own: waiting on an unsignaled fence retires every submission up to and
//! including the one that fence guards, and counts as a blocking wait.

use std::collections::{HashMap, HashSet, VecDeque};

use glam::UVec2;

use super::traits::*;
use super::types::*;

/// A command recorded into a headless command buffer
#[derive(Debug, Clone)]
pub enum RecordedCommand {
    BeginRenderPass(RenderPassBeginInfo),
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor { offset: UVec2, extent: UVec2 },
    SetPipeline(RenderPipelineHandle),
    SetCullMode(CullMode),
    BindResources {
        pipeline: RenderPipelineHandle,
        bindings: Vec<ResourceBinding>,
    },
    SetVertexBuffer { slot: u32, buffer: BufferHandle },
    SetIndexBuffer { buffer: BufferHandle, format: IndexFormat },
    Draw { vertex_count: u32, instance_count: u32 },
    DrawIndexed { index_count: u32, instance_count: u32 },
}

/// A command buffer as it was handed to `submit`
#[derive(Debug, Clone)]
pub struct Submission {
    pub command_buffer: CommandBufferHandle,
    pub fence: FenceHandle,
    pub commands: Vec<RecordedCommand>,
}

/// Counters collected by the headless device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submissions: u64,
    pub presents: u64,
    /// Fence waits that had to retire pending work
    pub blocked_waits: u64,
    /// Highest number of submissions pending at once
    pub max_pending: usize,
    pub swapchain_recreations: u64,
    pub buffer_writes: u64,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    recording: bool,
    commands: Vec<RecordedCommand>,
}

/// GPU-less implementation of [`GraphicsDevice`]
#[derive(Debug)]
pub struct HeadlessDevice {
    extent: UVec2,
    format: TextureFormat,
    image_count: u32,
    next_image: u32,
    next_id: u64,

    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureDescriptor>,
    samplers: HashSet<u64>,
    shader_modules: HashSet<u64>,
    pipelines: HashSet<u64>,
    fences: HashMap<u64, bool>,
    semaphores: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,

    pending: VecDeque<FenceHandle>,
    submissions: Vec<Submission>,
    stats: HeadlessStats,
    fail_next_creations: u32,
    creations_before_failure: u32,
    outdated_next_acquire: bool,
}

impl HeadlessDevice {
    pub fn new(width: u32, height: u32) -> Self {
        log::info!("Headless device created ({}x{})", width, height);
        Self {
            extent: UVec2::new(width, height),
            format: TextureFormat::Bgra8UnormSrgb,
            image_count: 3,
            next_image: 0,
            next_id: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashSet::new(),
            shader_modules: HashSet::new(),
            pipelines: HashSet::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            command_buffers: HashMap::new(),
            pending: VecDeque::new(),
            submissions: Vec::new(),
            stats: HeadlessStats::default(),
            fail_next_creations: 0,
            creations_before_failure: 0,
            outdated_next_acquire: false,
        }
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Number of submissions not yet retired
    pub fn pending_submissions(&self) -> usize {
        self.pending.len()
    }

    /// Every submission made so far, oldest first
    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(Vec::as_slice)
    }

    /// Number of live buffers, textures, samplers, modules and pipelines
    pub fn live_resource_count(&self) -> usize {
        self.buffers.len()
            + self.textures.len()
            + self.samplers.len()
            + self.shader_modules.len()
            + self.pipelines.len()
    }

    /// Make the next `count` resource creations fail with `OutOfMemory`
    pub fn fail_next_creations(&mut self, count: u32) {
        self.fail_creations_after(0, count);
    }

    /// Let `skip` resource creations succeed, then fail the next `count`
    pub fn fail_creations_after(&mut self, skip: u32, count: u32) {
        self.creations_before_failure = skip;
        self.fail_next_creations = count;
    }

    /// Make the next acquire report an out-of-date swapchain
    pub fn mark_swapchain_outdated(&mut self) {
        self.outdated_next_acquire = true;
    }

    /// Retire all pending work as if the GPU caught up
    pub fn retire_all(&mut self) {
        while let Some(fence) = self.pending.pop_front() {
            self.fences.insert(fence.0, true);
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_allocation(&mut self) -> BackendResult<()> {
        if self.fail_next_creations > 0 {
            if self.creations_before_failure > 0 {
                self.creations_before_failure -= 1;
                return Ok(());
            }
            self.fail_next_creations -= 1;
            log::trace!("HeadlessDevice: injected allocation failure");
            return Err(BackendError::OutOfMemory);
        }
        Ok(())
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: RecordedCommand) {
        match self.command_buffers.get_mut(&cmd.0) {
            Some(state) if state.recording => state.commands.push(command),
            _ => log::error!(
                "HeadlessDevice: command {:?} recorded outside of command buffer {}",
                command,
                cmd.0
            ),
        }
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn surface_size(&self) -> UVec2 {
        self.extent
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.format
    }

    fn swapchain_image_count(&self) -> u32 {
        self.image_count
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::SwapchainCreationFailed(format!(
                "degenerate extent {}x{}",
                width, height
            )));
        }
        self.extent = UVec2::new(width, height);
        self.next_image = 0;
        self.stats.swapchain_recreations += 1;
        log::debug!("HeadlessDevice: swapchain resized to {}x{}", width, height);
        Ok(())
    }

    fn uniform_offset_alignment(&self) -> u64 {
        256
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        self.check_allocation()?;
        let id = self.allocate_id();
        log::trace!(
            "HeadlessDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        self.buffers.insert(id, vec![0; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data)?;
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let contents = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer", buffer.0))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at offset {} overflows buffer of {} bytes",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        self.stats.buffer_writes += 1;
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle> {
        self.check_allocation()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "degenerate extent {}x{}",
                desc.width, desc.height
            )));
        }
        if let Some(data) = data {
            let expected = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
            if data.len() != expected {
                return Err(BackendError::TextureCreationFailed(format!(
                    "expected {} bytes of texel data, got {}",
                    expected,
                    data.len()
                )));
            }
        }
        let id = self.allocate_id();
        log::trace!(
            "HeadlessDevice: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        self.check_allocation()?;
        let id = self.allocate_id();
        log::trace!("HeadlessDevice: creating sampler {:?}", desc.label);
        self.samplers.insert(id);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn create_shader_module(
        &mut self,
        desc: &ShaderModuleDescriptor,
    ) -> BackendResult<ShaderModuleHandle> {
        self.check_allocation()?;
        if desc.spirv.is_empty() {
            return Err(BackendError::ShaderCreationFailed(format!(
                "empty SPIR-V for {:?}",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.shader_modules.insert(id);
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        self.shader_modules.remove(&module.0);
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        self.check_allocation()?;
        for module in [desc.vertex_module, desc.fragment_module] {
            if !self.shader_modules.contains(&module.0) {
                return Err(BackendError::InvalidHandle("shader module", module.0));
            }
        }
        let id = self.allocate_id();
        log::trace!(
            "HeadlessDevice: creating pipeline {:?} ({} color targets, depth {:?})",
            desc.label,
            desc.color_formats.len(),
            desc.depth_format
        );
        self.pipelines.insert(id);
        Ok(RenderPipelineHandle(id))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.pipelines.remove(&pipeline.0);
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let id = self.allocate_id();
        self.fences.insert(id, signaled);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let signaled = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        if signaled {
            return Ok(());
        }
        if !self.pending.contains(&fence) {
            return Err(BackendError::FenceWaitFailed(format!(
                "fence {} is unsignaled and has no pending submission",
                fence.0
            )));
        }

        self.stats.blocked_waits += 1;
        while let Some(retired) = self.pending.pop_front() {
            self.fences.insert(retired.0, true);
            if retired == fence {
                break;
            }
        }
        log::trace!(
            "HeadlessDevice: waited on fence {}, {} submissions still pending",
            fence.0,
            self.pending.len()
        );
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        if self.pending.contains(&fence) {
            return Err(BackendError::FenceWaitFailed(format!(
                "fence {} reset while its submission is pending",
                fence.0
            )));
        }
        let state = self
            .fences
            .get_mut(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        *state = false;
        Ok(())
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        self.fences
            .get(&fence.0)
            .copied()
            .ok_or(BackendError::InvalidHandle("fence", fence.0))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence.0);
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let id = self.allocate_id();
        self.semaphores.insert(id);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.0);
    }

    fn allocate_command_buffers(
        &mut self,
        count: u32,
    ) -> BackendResult<Vec<CommandBufferHandle>> {
        Ok((0..count)
            .map(|_| {
                let id = self.allocate_id();
                self.command_buffers.insert(id, CommandBufferState::default());
                CommandBufferHandle(id)
            })
            .collect())
    }

    fn free_command_buffers(&mut self, buffers: &[CommandBufferHandle]) {
        for cmd in buffers {
            self.command_buffers.remove(&cmd.0);
        }
    }

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self
            .command_buffers
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?;
        state.recording = true;
        state.commands.clear();
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self
            .command_buffers
            .get_mut(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?;
        state.recording = false;
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquiredImage> {
        if !self.semaphores.contains(&signal.0) {
            return Err(BackendError::InvalidHandle("semaphore", signal.0));
        }
        if std::mem::take(&mut self.outdated_next_acquire) {
            return Err(BackendError::SurfaceOutdated);
        }
        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.image_count;
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn submit(
        &mut self,
        cmd: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        for semaphore in [wait, signal] {
            if !self.semaphores.contains(&semaphore.0) {
                return Err(BackendError::InvalidHandle("semaphore", semaphore.0));
            }
        }
        match self.fences.get(&fence.0) {
            Some(false) => {}
            Some(true) => {
                return Err(BackendError::SubmitFailed(format!(
                    "fence {} is still signaled",
                    fence.0
                )))
            }
            None => return Err(BackendError::InvalidHandle("fence", fence.0)),
        }
        let state = self
            .command_buffers
            .get(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?;
        if state.recording {
            return Err(BackendError::SubmitFailed(format!(
                "command buffer {} is still recording",
                cmd.0
            )));
        }

        self.submissions.push(Submission {
            command_buffer: cmd,
            fence,
            commands: state.commands.clone(),
        });
        self.pending.push_back(fence);
        self.stats.submissions += 1;
        self.stats.max_pending = self.stats.max_pending.max(self.pending.len());
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<bool> {
        if !self.semaphores.contains(&wait.0) {
            return Err(BackendError::InvalidHandle("semaphore", wait.0));
        }
        if image_index >= self.image_count {
            return Err(BackendError::PresentFailed(format!(
                "image index {} out of range",
                image_index
            )));
        }
        self.stats.presents += 1;
        Ok(false)
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.retire_all();
        Ok(())
    }

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, info: &RenderPassBeginInfo) {
        self.record(cmd, RecordedCommand::BeginRenderPass(info.clone()));
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        self.record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_set_viewport(&mut self, cmd: CommandBufferHandle, viewport: &Viewport) {
        self.record(cmd, RecordedCommand::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&mut self, cmd: CommandBufferHandle, offset: UVec2, extent: UVec2) {
        self.record(cmd, RecordedCommand::SetScissor { offset, extent });
    }

    fn cmd_set_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: RenderPipelineHandle) {
        self.record(cmd, RecordedCommand::SetPipeline(pipeline));
    }

    fn cmd_set_cull_mode(&mut self, cmd: CommandBufferHandle, mode: CullMode) {
        self.record(cmd, RecordedCommand::SetCullMode(mode));
    }

    fn cmd_bind_resources(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: RenderPipelineHandle,
        bindings: &[ResourceBinding],
    ) {
        self.record(
            cmd,
            RecordedCommand::BindResources {
                pipeline,
                bindings: bindings.to_vec(),
            },
        );
    }

    fn cmd_set_vertex_buffer(&mut self, cmd: CommandBufferHandle, slot: u32, buffer: BufferHandle) {
        self.record(cmd, RecordedCommand::SetVertexBuffer { slot, buffer });
    }

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    ) {
        self.record(cmd, RecordedCommand::SetIndexBuffer { buffer, format });
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        self.record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32) {
        self.record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }
}
