//! Core backend abstraction
//!
//! `GraphicsDevice` is the GPU device/command-submission collaborator the
//! renderer orchestrates. It hands out opaque handles for every GPU object
//! and never exposes API types, so the same frame pipeline drives both the
//! Vulkan backend and the headless one.

use crate::backend::types::*;
use glam::UVec2;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to submit command buffer: {0}")]
    SubmitFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create synchronization object: {0}")]
    SyncCreationFailed(String),
    #[error("Failed to wait for fence: {0}")]
    FenceWaitFailed(String),
    #[error("Swapchain is out of date")]
    SurfaceOutdated,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    #[error("Invalid {0} handle {1}")]
    InvalidHandle(&'static str, u64),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture together with its default view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a compiled shader module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderModuleHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

/// Handle to a GPU-to-CPU fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a GPU-to-GPU semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

/// Shader source handed to the device, one SPIR-V blob per module
#[derive(Debug, Clone)]
pub struct ShaderModuleDescriptor<'a> {
    pub label: Option<&'a str>,
    pub spirv: &'a [u32],
}

/// Render pipeline descriptor
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor<'a> {
    pub label: Option<&'a str>,
    pub vertex_module: ShaderModuleHandle,
    pub vertex_entry: &'a str,
    pub fragment_module: ShaderModuleHandle,
    pub fragment_entry: &'a str,
    pub vertex_layout: &'a VertexBufferLayout,
    pub bindings: &'a [BindingLayoutEntry],
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub color_formats: &'a [TextureFormat],
    pub depth_format: Option<TextureFormat>,
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    pub blend: Option<BlendState>,
}

/// Where a color attachment of a render pass points to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorTarget {
    /// The swapchain image with the given index
    Swapchain(u32),
    Texture(TextureHandle),
}

/// Render pass begin parameters
#[derive(Debug, Clone)]
pub struct RenderPassBeginInfo {
    pub color_targets: Vec<ColorTarget>,
    pub depth_target: Option<TextureHandle>,
    pub extent: UVec2,
    /// Clear value for the color targets, `None` keeps their contents
    pub clear_color: Option<[f32; 4]>,
    /// Clear value for the depth target, `None` keeps its contents
    pub clear_depth: Option<f32>,
    pub clear_stencil: u32,
}

/// Resource bound to a pipeline binding slot for the following draws
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceBinding {
    Uniform {
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    Texture {
        binding: u32,
        texture: TextureHandle,
        sampler: SamplerHandle,
    },
}

/// Result of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// The swapchain still works but no longer matches the surface
    pub suboptimal: bool,
}

/// Viewport rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn from_extent(extent: UVec2) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.x as f32,
            height: extent.y as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// GPU device and command submission abstraction
pub trait GraphicsDevice {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Current swapchain extent
    fn surface_size(&self) -> UVec2;

    /// Format of the presentable images
    fn swapchain_format(&self) -> TextureFormat;

    /// Number of presentable images
    fn swapchain_image_count(&self) -> u32;

    /// Recreate the swapchain for a new surface size
    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Minimum alignment of uniform buffer binding offsets
    fn uniform_offset_alignment(&self) -> u64;

    // Resource creation

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a buffer and fill it with initial contents
    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture, uploading `data` when given
    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn create_shader_module(
        &mut self,
        desc: &ShaderModuleDescriptor,
    ) -> BackendResult<ShaderModuleHandle>;

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle);

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    // Synchronization

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Block until the fence is signaled
    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool>;

    fn destroy_fence(&mut self, fence: FenceHandle);

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    // Command buffers and submission

    fn allocate_command_buffers(&mut self, count: u32) -> BackendResult<Vec<CommandBufferHandle>>;

    fn free_command_buffers(&mut self, buffers: &[CommandBufferHandle]);

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    /// Acquire the next presentable image, signaling `signal` once it is ready
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquiredImage>;

    /// Submit a recorded command buffer
    fn submit(
        &mut self,
        cmd: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()>;

    /// Present a swapchain image once `wait` is signaled.
    /// Returns true when the swapchain is suboptimal.
    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<bool>;

    /// Block until the device finished all submitted work
    fn wait_idle(&mut self) -> BackendResult<()>;

    // Command recording

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, info: &RenderPassBeginInfo);

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle);

    fn cmd_set_viewport(&mut self, cmd: CommandBufferHandle, viewport: &Viewport);

    fn cmd_set_scissor(&mut self, cmd: CommandBufferHandle, offset: UVec2, extent: UVec2);

    fn cmd_set_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: RenderPipelineHandle);

    fn cmd_set_cull_mode(&mut self, cmd: CommandBufferHandle, mode: CullMode);

    fn cmd_bind_resources(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: RenderPipelineHandle,
        bindings: &[ResourceBinding],
    );

    fn cmd_set_vertex_buffer(&mut self, cmd: CommandBufferHandle, slot: u32, buffer: BufferHandle);

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    );

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32);

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32);
}
