//! Frame lifecycle state and synchronization

use std::fmt;

use super::PassType;
use crate::backend::{
    BackendError, BackendResult, CommandBufferHandle, FenceHandle, GraphicsDevice,
    SemaphoreHandle,
};

/// Renderer lifecycle state.
///
/// `Prepared` is the state between frames; a frame walks through
/// `Begun`, `Updated`, `Recorded` and `Submitted` before `end_frame`
/// returns to `Prepared`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Uninitialized,
    Prepared,
    Begun,
    Updated,
    Recorded,
    Submitted,
    Terminated,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::Uninitialized => "uninitialized",
            FrameState::Prepared => "prepared",
            FrameState::Begun => "begun",
            FrameState::Updated => "updated",
            FrameState::Recorded => "recorded",
            FrameState::Submitted => "submitted",
            FrameState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Synchronization objects of one in-flight frame
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: CommandBufferHandle,
    /// Signaled when the GPU finished the slot's command buffer
    pub in_flight: FenceHandle,
    /// Signaled when the acquired swapchain image is ready
    pub present_complete: SemaphoreHandle,
}

/// Per-slot command buffers, fences and acquire semaphores, plus one
/// render-complete semaphore per swapchain image.
///
/// At most one frame per slot is in flight: a slot's fence has to signal
/// before its command buffer is recorded again. Presentation may hold an
/// image's semaphore past the slot's fence, so it is owned by the image.
#[derive(Debug)]
pub struct FrameSync {
    slots: Vec<FrameSlot>,
    render_complete: Vec<SemaphoreHandle>,
}

impl FrameSync {
    pub fn new(device: &mut dyn GraphicsDevice, frames_in_flight: usize) -> BackendResult<Self> {
        assert!(frames_in_flight > 0, "at least one frame must be in flight");
        let command_buffers = device.allocate_command_buffers(frames_in_flight as u32)?;
        let mut slots = Vec::with_capacity(frames_in_flight);
        for command_buffer in command_buffers {
            // Signaled so the first wait on each slot returns at once
            slots.push(FrameSlot {
                command_buffer,
                in_flight: device.create_fence(true)?,
                present_complete: device.create_semaphore()?,
            });
        }
        let mut sync = Self {
            slots,
            render_complete: Vec::new(),
        };
        sync.match_swapchain(device)?;
        log::debug!(
            "Created synchronization for {} frames in flight, {} swapchain images",
            frames_in_flight,
            sync.render_complete.len()
        );
        Ok(sync)
    }

    /// Keep one render-complete semaphore per swapchain image; the device
    /// must be idle when the image count changed
    pub fn match_swapchain(&mut self, device: &mut dyn GraphicsDevice) -> BackendResult<()> {
        let count = device.swapchain_image_count() as usize;
        while self.render_complete.len() > count {
            if let Some(semaphore) = self.render_complete.pop() {
                device.destroy_semaphore(semaphore);
            }
        }
        while self.render_complete.len() < count {
            self.render_complete.push(device.create_semaphore()?);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot used by frame number `frame`
    pub fn slot(&self, frame: u64) -> &FrameSlot {
        &self.slots[(frame % self.slots.len() as u64) as usize]
    }

    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.slots.len() as u64) as usize
    }

    /// Semaphore signaled when rendering to swapchain image `image_index`
    /// finished, waited on by its presentation
    pub fn render_complete(&self, image_index: u32) -> BackendResult<SemaphoreHandle> {
        self.render_complete
            .get(image_index as usize)
            .copied()
            .ok_or(BackendError::InvalidHandle("swapchain image", image_index as u64))
    }

    /// Release every object; the device must be idle
    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        let command_buffers: Vec<_> = self.slots.iter().map(|slot| slot.command_buffer).collect();
        device.free_command_buffers(&command_buffers);
        for slot in self.slots {
            device.destroy_fence(slot.in_flight);
            device.destroy_semaphore(slot.present_complete);
        }
        for semaphore in self.render_complete {
            device.destroy_semaphore(semaphore);
        }
    }
}

/// What the renderer did during one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub image_index: u32,
    /// Draw calls recorded per pass type
    pub draws: [u32; PassType::COUNT],
    /// Render passes begun
    pub passes: u32,
    /// Per-object uniform blocks written
    pub uniform_uploads: u32,
}

impl FrameStats {
    pub fn draw_calls(&self, pass_type: PassType) -> u32 {
        self.draws[pass_type.index()]
    }

    pub fn total_draw_calls(&self) -> u32 {
        self.draws.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessDevice;

    #[test]
    fn test_slots_cycle() {
        let mut device = HeadlessDevice::new(64, 64);
        let sync = FrameSync::new(&mut device, 3).unwrap();
        assert_eq!(sync.len(), 3);
        assert_eq!(sync.slot_index(4), 1);
        assert_eq!(sync.slot(0).in_flight, sync.slot(3).in_flight);
        assert_ne!(sync.slot(0).in_flight, sync.slot(1).in_flight);
    }

    #[test]
    fn test_fences_start_signaled() {
        let mut device = HeadlessDevice::new(64, 64);
        let sync = FrameSync::new(&mut device, 2).unwrap();
        for frame in 0..2 {
            assert!(device.is_fence_signaled(sync.slot(frame).in_flight).unwrap());
        }
        sync.destroy(&mut device);
    }

    #[test]
    fn test_render_complete_per_swapchain_image() {
        let mut device = HeadlessDevice::new(64, 64);
        let sync = FrameSync::new(&mut device, 2).unwrap();
        let images = device.swapchain_image_count();
        assert!(images > sync.len() as u32);

        let semaphores: Vec<_> = (0..images)
            .map(|image| sync.render_complete(image).unwrap())
            .collect();
        for (i, semaphore) in semaphores.iter().enumerate() {
            assert!(!semaphores[i + 1..].contains(semaphore));
        }
        assert!(sync.render_complete(images).is_err());
        sync.destroy(&mut device);
    }

    #[test]
    #[should_panic(expected = "at least one frame")]
    fn test_zero_frames_panics() {
        let mut device = HeadlessDevice::new(64, 64);
        let _ = FrameSync::new(&mut device, 0);
    }

    #[test]
    fn test_stats_totals() {
        let mut stats = FrameStats::default();
        stats.draws[PassType::Standard.index()] = 3;
        stats.draws[PassType::Shadows.index()] = 2;
        assert_eq!(stats.draw_calls(PassType::Standard), 3);
        assert_eq!(stats.total_draw_calls(), 5);
    }
}
