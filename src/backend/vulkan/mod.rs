//! Vulkan device implementation using ash
//!
//! Targets Vulkan 1.3: passes are recorded with dynamic rendering, cull mode
//! is dynamic state, and per-draw resources are bound with
//! `VK_KHR_push_descriptor`, so the device never has to manage render pass,
//! framebuffer or descriptor pool objects.
//!
//! Image layouts are tracked at record time. Recording happens on a single
//! thread in submission order, so the tracked layout is the layout the image
//! will be in when the recorded barrier executes.

mod conv;

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{push_descriptor, surface, swapchain};
use ash::vk;
use glam::UVec2;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

/// Vulkan implementation of [`GraphicsDevice`]
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    push_descriptor_fn: push_descriptor::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    allocator: Option<Arc<Mutex<Allocator>>>,
    pipeline_cache: vk::PipelineCache,
    command_pool: vk::CommandPool,
    uniform_alignment: u64,
    vsync: bool,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_layouts: Vec<vk::ImageLayout>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    samplers: HashMap<u64, vk::Sampler>,
    shader_modules: HashMap<u64, vk::ShaderModule>,
    pipelines: HashMap<u64, VkRenderPipeline>,
    fences: HashMap<u64, vk::Fence>,
    semaphores: HashMap<u64, vk::Semaphore>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
    active_passes: HashMap<u64, Vec<PassAttachment>>,
    next_id: u64,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    view: vk::ImageView,
    allocation: Allocation,
    format: TextureFormat,
    sampled: bool,
    layout: vk::ImageLayout,
}

struct VkRenderPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

#[derive(Clone, Copy)]
enum PassAttachment {
    Swapchain(u32),
    Texture(u64),
}

fn record_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

impl VulkanDevice {
    /// Create the device for a window surface
    pub fn new<W>(window: &W, width: u32, height: u32, vsync: bool) -> BackendResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_name = c"Scene Graphics";
            let app_info = vk::ApplicationInfo::default()
                .application_name(app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(app_name)
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

            let (physical_device, graphics_queue_family) =
                Self::select_physical_device(&instance, &surface_fn, surface)?;
            let properties = instance.get_physical_device_properties(physical_device);
            log::info!(
                "Vulkan device: {}",
                properties
                    .device_name_as_c_str()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "unknown".to_string())
            );

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities)];
            let device_extensions = [swapchain::NAME.as_ptr(), push_descriptor::NAME.as_ptr()];
            let mut features13 =
                vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);
            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .push_next(&mut features13);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);
            let push_descriptor_fn = push_descriptor::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let pipeline_cache = device
                .create_pipeline_cache(&vk::PipelineCacheCreateInfo::default(), None)
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                push_descriptor_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                allocator: Some(Arc::new(Mutex::new(allocator))),
                pipeline_cache,
                command_pool,
                uniform_alignment: properties.limits.min_uniform_buffer_offset_alignment.max(1),
                vsync,
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_layouts: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D {
                    width: 0,
                    height: 0,
                },
                buffers: HashMap::new(),
                textures: HashMap::new(),
                samplers: HashMap::new(),
                shader_modules: HashMap::new(),
                pipelines: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                active_passes: HashMap::new(),
                next_id: 1,
            };

            backend.create_swapchain(width.max(1), height.max(1))?;
            Ok(backend)
        }
    }

    fn select_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<(vk::PhysicalDevice, u32)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        let mut candidates: Vec<(vk::PhysicalDevice, u32, bool)> = physical_devices
            .into_iter()
            .filter_map(|pd| {
                let properties = unsafe { instance.get_physical_device_properties(pd) };
                if vk::api_version_minor(properties.api_version) < 3
                    && vk::api_version_major(properties.api_version) == 1
                {
                    return None;
                }
                if !Self::supports_push_descriptors(instance, pd) {
                    return None;
                }
                let family = Self::find_queue_family(instance, pd, surface_fn, surface)?;
                let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
                Some((pd, family, discrete))
            })
            .collect();

        candidates.sort_by_key(|(_, _, discrete)| !*discrete);
        candidates
            .first()
            .map(|(pd, family, _)| (*pd, *family))
            .ok_or_else(|| {
                BackendError::InitializationFailed(
                    "No Vulkan 1.3 device with push descriptors and presentation support".into(),
                )
            })
    }

    fn supports_push_descriptors(instance: &ash::Instance, pd: vk::PhysicalDevice) -> bool {
        let extensions = match unsafe { instance.enumerate_device_extension_properties(pd) } {
            Ok(extensions) => extensions,
            Err(_) => return false,
        };
        extensions.iter().any(|ext| {
            ext.extension_name_as_c_str()
                .map(|name| name == push_descriptor::NAME)
                .unwrap_or(false)
        })
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families
            .iter()
            .enumerate()
            .find(|(index, family)| {
                let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                let supports_surface = unsafe {
                    surface_fn
                        .get_physical_device_surface_support(physical_device, *index as u32, surface)
                        .unwrap_or(false)
                };
                supports_graphics && supports_surface
            })
            .map(|(index, _)| index as u32)
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device
                .device_wait_idle()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_image_views.clear();

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            // Prefer SRGB, otherwise any format this crate can describe
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| {
                    formats
                        .iter()
                        .find(|f| conv::texture_format_back(f.format).is_some())
                })
                .copied()
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("No supported surface format".into())
                })?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let old_swapchain = self.swapchain;
            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true)
                .old_swapchain(old_swapchain);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            if old_swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(old_swapchain, None);
            }

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;
            self.swapchain_layouts = vec![vk::ImageLayout::UNDEFINED; self.swapchain_images.len()];

            self.swapchain_image_views = self
                .swapchain_images
                .iter()
                .map(|&image| {
                    let view_info = vk::ImageViewCreateInfo::default()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format.format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: vk::ImageAspectFlags::COLOR,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    self.device.create_image_view(&view_info, None)
                })
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| BackendError::SwapchainCreationFailed(e.to_string()))?;

            log::info!(
                "Swapchain created: {}x{}, {} images, {:?}, {:?}",
                extent.width,
                extent.height,
                self.swapchain_images.len(),
                format.format,
                present_mode
            );
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn allocator(&self) -> BackendResult<&Arc<Mutex<Allocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator not available".into()))
    }

    fn free_allocation(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_ref() {
            if let Err(e) = allocator.lock().free(allocation) {
                log::error!("Failed to free GPU allocation: {}", e);
            }
        }
    }

    fn command_buffer(&self, cmd: CommandBufferHandle) -> Option<vk::CommandBuffer> {
        let buffer = self.command_buffers.get(&cmd.0).copied();
        if buffer.is_none() {
            log::error!("Unknown command buffer {}", cmd.0);
        }
        buffer
    }

    fn create_raw_buffer(
        &mut self,
        label: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> BackendResult<VkBuffer> {
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);

            let buffer = self
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| BackendError::BufferCreationFailed(e.to_string()))?;

            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
                name: label,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(BackendError::BufferCreationFailed(e.to_string()));
                }
            };

            if let Err(e) =
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            {
                self.device.destroy_buffer(buffer, None);
                self.free_allocation(allocation);
                return Err(BackendError::BufferCreationFailed(e.to_string()));
            }

            Ok(VkBuffer {
                buffer,
                allocation,
                size,
            })
        }
    }

    fn destroy_raw_buffer(&self, buffer: VkBuffer) {
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        self.free_allocation(buffer.allocation);
    }

    /// Record and synchronously execute a one-off command buffer
    fn immediate_submit<F>(&self, record: F) -> BackendResult<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self
                .device
                .allocate_command_buffers(&alloc_info)
                .map_err(conv::result_error)?[0];

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            let result = self
                .device
                .begin_command_buffer(cmd, &begin_info)
                .and_then(|_| {
                    record(cmd);
                    self.device.end_command_buffer(cmd)
                })
                .and_then(|_| {
                    let command_buffers = [cmd];
                    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                    self.device
                        .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                })
                .and_then(|_| self.device.queue_wait_idle(self.graphics_queue));

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result.map_err(conv::result_error)
        }
    }

    fn transition_texture(&mut self, cmd: vk::CommandBuffer, id: u64, new_layout: vk::ImageLayout) {
        if let Some(texture) = self.textures.get_mut(&id) {
            if texture.layout != new_layout {
                record_barrier(
                    &self.device,
                    cmd,
                    texture.image,
                    conv::aspect_mask(texture.format),
                    texture.layout,
                    new_layout,
                );
                texture.layout = new_layout;
            }
        }
    }

    fn transition_swapchain(&mut self, cmd: vk::CommandBuffer, index: u32, new_layout: vk::ImageLayout) {
        let index = index as usize;
        if let (Some(&image), Some(layout)) = (
            self.swapchain_images.get(index),
            self.swapchain_layouts.get_mut(index),
        ) {
            if *layout != new_layout {
                record_barrier(
                    &self.device,
                    cmd,
                    image,
                    vk::ImageAspectFlags::COLOR,
                    *layout,
                    new_layout,
                );
                *layout = new_layout;
            }
        }
    }
}

impl GraphicsDevice for VulkanDevice {
    fn name(&self) -> &'static str {
        "Vulkan"
    }

    fn surface_size(&self) -> UVec2 {
        UVec2::new(self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        conv::texture_format_back(self.swapchain_format).unwrap_or(TextureFormat::Bgra8UnormSrgb)
    }

    fn swapchain_image_count(&self) -> u32 {
        self.swapchain_images.len() as u32
    }

    fn resize_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if width == 0 || height == 0 {
            return Err(BackendError::SwapchainCreationFailed(format!(
                "degenerate extent {}x{}",
                width, height
            )));
        }
        self.create_swapchain(width, height)
    }

    fn uniform_offset_alignment(&self) -> u64 {
        self.uniform_alignment
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let location = if desc.mapped {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let mut usage = conv::buffer_usage(desc.usage);
        if !desc.mapped {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        let buffer = self.create_raw_buffer(
            desc.label.as_deref().unwrap_or("buffer"),
            desc.size,
            usage,
            location,
        )?;
        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        if let Err(e) = self.write_buffer(handle, 0, data) {
            self.destroy_buffer(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or(BackendError::InvalidHandle("buffer", buffer.0))?;
        if offset + data.len() as u64 > target.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at offset {} overflows buffer of {} bytes",
                data.len(),
                offset,
                target.size
            )));
        }

        if let Some(mapped) = target.allocation.mapped_slice_mut() {
            let start = offset as usize;
            mapped[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }

        // Device-local buffer, go through a staging copy
        let dst = target.buffer;
        let mut staging = self.create_raw_buffer(
            "staging",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.destroy_raw_buffer(staging);
                return Err(BackendError::BufferCreationFailed(
                    "staging buffer is not host visible".into(),
                ));
            }
        }
        let src = staging.buffer;
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        };
        let device = self.device.clone();
        let result = self.immediate_submit(|cmd| unsafe {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        });
        self.destroy_raw_buffer(staging);
        result
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            self.destroy_raw_buffer(buffer);
        }
    }

    fn create_texture(
        &mut self,
        desc: &TextureDescriptor,
        data: Option<&[u8]>,
    ) -> BackendResult<TextureHandle> {
        let format = conv::texture_format(desc.format);
        let aspect_mask = conv::aspect_mask(desc.format);
        let mut usage = conv::image_usage(desc.usage, desc.format);
        if data.is_some() {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocator()?.lock().allocate(&AllocationCreateDesc {
            name: desc.label.as_deref().unwrap_or("texture"),
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        let view = bound.and_then(|_| {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe { self.device.create_image_view(&view_info, None) }
        });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_allocation(allocation);
                return Err(BackendError::TextureCreationFailed(e.to_string()));
            }
        };

        let mut texture = VkTexture {
            image,
            view,
            allocation,
            format: desc.format,
            sampled: desc.usage.contains(TextureUsage::TEXTURE_BINDING),
            layout: vk::ImageLayout::UNDEFINED,
        };

        if let Some(data) = data {
            if let Err(e) = self.upload_texture(&mut texture, desc, data) {
                unsafe {
                    self.device.destroy_image_view(texture.view, None);
                    self.device.destroy_image(texture.image, None);
                }
                self.free_allocation(texture.allocation);
                return Err(e);
            }
        }

        let id = self.allocate_id();
        self.textures.insert(id, texture);
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(texture) = self.textures.remove(&texture.0) {
            unsafe {
                self.device.destroy_image_view(texture.view, None);
                self.device.destroy_image(texture.image, None);
            }
            self.free_allocation(texture.allocation);
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(conv::filter(desc.mag_filter))
            .min_filter(conv::filter(desc.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(conv::address_mode(desc.address_mode_u))
            .address_mode_v(conv::address_mode(desc.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .compare_enable(desc.compare.is_some())
            .compare_op(
                desc.compare
                    .map(conv::compare_op)
                    .unwrap_or(vk::CompareOp::ALWAYS),
            )
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(|e| BackendError::TextureCreationFailed(e.to_string()))?;

        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_shader_module(
        &mut self,
        desc: &ShaderModuleDescriptor,
    ) -> BackendResult<ShaderModuleHandle> {
        let module_info = vk::ShaderModuleCreateInfo::default().code(desc.spirv);
        let module = unsafe { self.device.create_shader_module(&module_info, None) }
            .map_err(|e| {
                BackendError::ShaderCreationFailed(format!("{:?}: {}", desc.label, e))
            })?;
        let id = self.allocate_id();
        self.shader_modules.insert(id, module);
        Ok(ShaderModuleHandle(id))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        if let Some(module) = self.shader_modules.remove(&module.0) {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let vertex_module = *self
            .shader_modules
            .get(&desc.vertex_module.0)
            .ok_or(BackendError::InvalidHandle("shader module", desc.vertex_module.0))?;
        let fragment_module = *self
            .shader_modules
            .get(&desc.fragment_module.0)
            .ok_or(BackendError::InvalidHandle("shader module", desc.fragment_module.0))?;

        let set_bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(conv::descriptor_type(entry.kind))
                    .descriptor_count(1)
                    .stage_flags(conv::shader_stages(entry.stages))
            })
            .collect();
        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR)
            .bindings(&set_bindings);
        let set_layout = unsafe {
            self.device
                .create_descriptor_set_layout(&set_layout_info, None)
        }
        .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;

        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match unsafe { self.device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(BackendError::PipelineCreationFailed(e.to_string()));
            }
        };

        let vertex_entry = CString::new(desc.vertex_entry)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let fragment_entry = CString::new(desc.fragment_entry)
            .map_err(|e| BackendError::PipelineCreationFailed(e.to_string()))?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(vertex_entry.as_c_str()),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment_module)
                .name(fragment_entry.as_c_str()),
        ];

        let vertex_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_layout.array_stride as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: 0,
                format: conv::vertex_format(attribute.format),
                offset: attribute.offset as u32,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(conv::topology(desc.topology));

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(conv::front_face(desc.front_face))
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_format.is_some())
            .depth_write_enable(desc.depth_format.is_some() && desc.depth_write)
            .depth_compare_op(conv::compare_op(desc.depth_compare));

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_formats
            .iter()
            .map(|_| match desc.blend {
                Some(blend) => vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::TRUE,
                    src_color_blend_factor: conv::blend_factor(blend.color.src_factor),
                    dst_color_blend_factor: conv::blend_factor(blend.color.dst_factor),
                    color_blend_op: vk::BlendOp::ADD,
                    src_alpha_blend_factor: conv::blend_factor(blend.alpha.src_factor),
                    dst_alpha_blend_factor: conv::blend_factor(blend.alpha.dst_factor),
                    alpha_blend_op: vk::BlendOp::ADD,
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                },
                None => vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::FALSE,
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                    ..Default::default()
                },
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::CULL_MODE,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = desc
            .color_formats
            .iter()
            .map(|&format| conv::texture_format(format))
            .collect();
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(
                desc.depth_format
                    .map(conv::texture_format)
                    .unwrap_or(vk::Format::UNDEFINED),
            );

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipeline = match unsafe {
            self.device
                .create_graphics_pipelines(self.pipeline_cache, &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe {
                    self.device.destroy_pipeline_layout(layout, None);
                    self.device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(BackendError::PipelineCreationFailed(format!(
                    "{:?}: {}",
                    desc.label, e
                )));
            }
        };

        log::debug!("Created pipeline {:?}", desc.label);
        let id = self.allocate_id();
        self.pipelines.insert(
            id,
            VkRenderPipeline {
                pipeline,
                layout,
                set_layout,
            },
        );
        Ok(RenderPipelineHandle(id))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pipeline) = self.pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
                self.device
                    .destroy_descriptor_set_layout(pipeline.set_layout, None);
            }
        }
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| BackendError::SyncCreationFailed(e.to_string()))?;
        let id = self.allocate_id();
        self.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let raw = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        unsafe { self.device.wait_for_fences(&[raw], true, u64::MAX) }.map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::FenceWaitFailed(other.to_string()),
        })
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let raw = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        unsafe { self.device.reset_fences(&[raw]) }
            .map_err(|e| BackendError::FenceWaitFailed(e.to_string()))
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> BackendResult<bool> {
        let raw = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        unsafe { self.device.get_fence_status(raw) }.map_err(conv::result_error)
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| BackendError::SyncCreationFailed(e.to_string()))?;
        let id = self.allocate_id();
        self.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn allocate_command_buffers(
        &mut self,
        count: u32,
    ) -> BackendResult<Vec<CommandBufferHandle>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        Ok(buffers
            .into_iter()
            .map(|buffer| {
                let id = self.allocate_id();
                self.command_buffers.insert(id, buffer);
                CommandBufferHandle(id)
            })
            .collect())
    }

    fn free_command_buffers(&mut self, buffers: &[CommandBufferHandle]) {
        let raw: Vec<vk::CommandBuffer> = buffers
            .iter()
            .filter_map(|cmd| self.command_buffers.remove(&cmd.0))
            .collect();
        if !raw.is_empty() {
            unsafe { self.device.free_command_buffers(self.command_pool, &raw) };
        }
    }

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let raw = *self
            .command_buffers
            .get(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?;
        unsafe {
            self.device
                .reset_command_buffer(raw, vk::CommandBufferResetFlags::empty())
                .and_then(|_| {
                    self.device
                        .begin_command_buffer(raw, &vk::CommandBufferBeginInfo::default())
                })
        }
        .map_err(conv::result_error)
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let raw = *self
            .command_buffers
            .get(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?;
        unsafe { self.device.end_command_buffer(raw) }.map_err(conv::result_error)
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquiredImage> {
        let semaphore = *self
            .semaphores
            .get(&signal.0)
            .ok_or(BackendError::InvalidHandle("semaphore", signal.0))?;
        let (index, suboptimal) = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceOutdated,
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::AcquireImageFailed(other.to_string()),
        })?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn submit(
        &mut self,
        cmd: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        let command_buffers = [*self
            .command_buffers
            .get(&cmd.0)
            .ok_or(BackendError::InvalidHandle("command buffer", cmd.0))?];
        let wait_semaphores = [*self
            .semaphores
            .get(&wait.0)
            .ok_or(BackendError::InvalidHandle("semaphore", wait.0))?];
        let signal_semaphores = [*self
            .semaphores
            .get(&signal.0)
            .ok_or(BackendError::InvalidHandle("semaphore", signal.0))?];
        let fence = *self
            .fences
            .get(&fence.0)
            .ok_or(BackendError::InvalidHandle("fence", fence.0))?;
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
        }
        .map_err(|e| match e {
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::SubmitFailed(other.to_string()),
        })
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<bool> {
        let wait_semaphores = [*self
            .semaphores
            .get(&wait.0)
            .ok_or(BackendError::InvalidHandle("semaphore", wait.0))?];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_fn
                .queue_present(self.graphics_queue, &present_info)
        }
        .map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_DATE_KHR => BackendError::SurfaceOutdated,
            vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
            other => BackendError::PresentFailed(other.to_string()),
        })
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(conv::result_error)
    }

    fn cmd_begin_render_pass(&mut self, cmd: CommandBufferHandle, info: &RenderPassBeginInfo) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };

        let color_load = if info.clear_color.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };
        let clear_color = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: info.clear_color.unwrap_or([0.0; 4]),
            },
        };

        let mut attachments = Vec::with_capacity(info.color_targets.len() + 1);
        let mut color_infos = Vec::with_capacity(info.color_targets.len());
        for target in &info.color_targets {
            let view = match *target {
                ColorTarget::Swapchain(index) => {
                    self.transition_swapchain(raw, index, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                    attachments.push(PassAttachment::Swapchain(index));
                    self.swapchain_image_views.get(index as usize).copied()
                }
                ColorTarget::Texture(texture) => {
                    self.transition_texture(raw, texture.0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
                    attachments.push(PassAttachment::Texture(texture.0));
                    self.textures.get(&texture.0).map(|t| t.view)
                }
            };
            let Some(view) = view else {
                log::error!("Render pass color target {:?} does not exist", target);
                continue;
            };
            color_infos.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(color_load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(clear_color),
            );
        }

        let depth_info = info.depth_target.and_then(|depth| {
            self.transition_texture(raw, depth.0, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
            attachments.push(PassAttachment::Texture(depth.0));
            self.textures.get(&depth.0).map(|texture| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(texture.view)
                    .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                    .load_op(if info.clear_depth.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: info.clear_depth.unwrap_or(1.0),
                            stencil: info.clear_stencil,
                        },
                    })
            })
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.extent.x,
                    height: info.extent.y,
                },
            })
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        unsafe { self.device.cmd_begin_rendering(raw, &rendering_info) };
        self.active_passes.insert(cmd.0, attachments);
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        unsafe { self.device.cmd_end_rendering(raw) };

        for attachment in self.active_passes.remove(&cmd.0).unwrap_or_default() {
            match attachment {
                PassAttachment::Swapchain(index) => {
                    self.transition_swapchain(raw, index, vk::ImageLayout::PRESENT_SRC_KHR)
                }
                PassAttachment::Texture(id) => {
                    let sampled = self.textures.get(&id).map(|t| t.sampled).unwrap_or(false);
                    if sampled {
                        self.transition_texture(raw, id, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                    }
                }
            }
        }
    }

    fn cmd_set_viewport(&mut self, cmd: CommandBufferHandle, viewport: &Viewport) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(raw, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&mut self, cmd: CommandBufferHandle, offset: UVec2, extent: UVec2) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: offset.x as i32,
                y: offset.y as i32,
            },
            extent: vk::Extent2D {
                width: extent.x,
                height: extent.y,
            },
        };
        unsafe { self.device.cmd_set_scissor(raw, 0, &[scissor]) };
    }

    fn cmd_set_pipeline(&mut self, cmd: CommandBufferHandle, pipeline: RenderPipelineHandle) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        match self.pipelines.get(&pipeline.0) {
            Some(pipeline) => unsafe {
                self.device
                    .cmd_bind_pipeline(raw, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline)
            },
            None => log::error!("Unknown pipeline {}", pipeline.0),
        }
    }

    fn cmd_set_cull_mode(&mut self, cmd: CommandBufferHandle, mode: CullMode) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        unsafe { self.device.cmd_set_cull_mode(raw, conv::cull_mode(mode)) };
    }

    fn cmd_bind_resources(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: RenderPipelineHandle,
        bindings: &[ResourceBinding],
    ) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        let Some(layout) = self.pipelines.get(&pipeline.0).map(|p| p.layout) else {
            log::error!("Unknown pipeline {}", pipeline.0);
            return;
        };

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for binding in bindings {
            match *binding {
                ResourceBinding::Uniform {
                    binding,
                    buffer,
                    offset,
                    size,
                } => match self.buffers.get(&buffer.0) {
                    Some(target) => buffer_infos.push((
                        binding,
                        vk::DescriptorBufferInfo {
                            buffer: target.buffer,
                            offset,
                            range: size,
                        },
                    )),
                    None => log::error!("Unknown uniform buffer {}", buffer.0),
                },
                ResourceBinding::Texture {
                    binding,
                    texture,
                    sampler,
                } => match (self.textures.get(&texture.0), self.samplers.get(&sampler.0)) {
                    (Some(texture), Some(&sampler)) => image_infos.push((
                        binding,
                        vk::DescriptorImageInfo {
                            sampler,
                            image_view: texture.view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        },
                    )),
                    _ => log::error!("Unknown texture {} or sampler {}", texture.0, sampler.0),
                },
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .chain(image_infos.iter().map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
            }))
            .collect();

        if !writes.is_empty() {
            unsafe {
                self.push_descriptor_fn.cmd_push_descriptor_set(
                    raw,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    0,
                    &writes,
                )
            };
        }
    }

    fn cmd_set_vertex_buffer(&mut self, cmd: CommandBufferHandle, slot: u32, buffer: BufferHandle) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(target) => unsafe {
                self.device
                    .cmd_bind_vertex_buffers(raw, slot, &[target.buffer], &[0])
            },
            None => log::error!("Unknown vertex buffer {}", buffer.0),
        }
    }

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        format: IndexFormat,
    ) {
        let Some(raw) = self.command_buffer(cmd) else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(target) => unsafe {
                self.device
                    .cmd_bind_index_buffer(raw, target.buffer, 0, conv::index_type(format))
            },
            None => log::error!("Unknown index buffer {}", buffer.0),
        }
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        if let Some(raw) = self.command_buffer(cmd) {
            unsafe { self.device.cmd_draw(raw, vertex_count, instance_count, 0, 0) };
        }
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32) {
        if let Some(raw) = self.command_buffer(cmd) {
            unsafe {
                self.device
                    .cmd_draw_indexed(raw, index_count, instance_count, 0, 0, 0)
            };
        }
    }
}

impl VulkanDevice {
    fn upload_texture(
        &mut self,
        texture: &mut VkTexture,
        desc: &TextureDescriptor,
        data: &[u8],
    ) -> BackendResult<()> {
        let expected = (desc.width * desc.height * desc.format.bytes_per_pixel()) as usize;
        if data.len() != expected {
            return Err(BackendError::TextureCreationFailed(format!(
                "expected {} bytes of texel data, got {}",
                expected,
                data.len()
            )));
        }

        let mut staging = self.create_raw_buffer(
            "texture staging",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        match staging.allocation.mapped_slice_mut() {
            Some(mapped) => mapped[..data.len()].copy_from_slice(data),
            None => {
                self.destroy_raw_buffer(staging);
                return Err(BackendError::TextureCreationFailed(
                    "staging buffer is not host visible".into(),
                ));
            }
        }

        let aspect_mask = conv::aspect_mask(desc.format);
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
        };
        let device = self.device.clone();
        let image = texture.image;
        let src = staging.buffer;
        let result = self.immediate_submit(|cmd| unsafe {
            record_barrier(
                &device,
                cmd,
                image,
                aspect_mask,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            );
            device.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            record_barrier(
                &device,
                cmd,
                image,
                aspect_mask,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            );
        });
        self.destroy_raw_buffer(staging);
        result?;
        texture.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let pipeline_ids: Vec<u64> = self.pipelines.keys().copied().collect();
            for id in pipeline_ids {
                self.destroy_render_pipeline(RenderPipelineHandle(id));
            }
            for (_, module) in self.shader_modules.drain() {
                self.device.destroy_shader_module(module, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            let texture_ids: Vec<u64> = self.textures.keys().copied().collect();
            for id in texture_ids {
                self.destroy_texture(TextureHandle(id));
            }
            let buffer_ids: Vec<u64> = self.buffers.keys().copied().collect();
            for id in buffer_ids {
                self.destroy_buffer(BufferHandle(id));
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in self.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }

            // Every allocation is freed, the allocator can go before the device
            self.allocator.take();

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_fn.destroy_swapchain(self.swapchain, None);
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

