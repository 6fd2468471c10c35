//! The assembled Vulkan backend.

use ash::vk;
use tracing::{debug, info, instrument, warn};
use winit::raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::{
    backend::FrameBackend,
    binding::FieldBuffer,
    config::EngineConfig,
    error::{EngineResult, VkResultExt},
    field::{Amplitude, Grid, InitialState},
    gpu::{
        allocator::Allocator,
        context::DeviceContext,
        frame_ring::{FrameRing, HostFlush},
        pipeline::ComputePipeline,
        record::record_plan,
        state::StateStore,
        surface::SurfaceChain,
    },
    plan::FramePlan,
    teardown::OwnershipList,
};

/// [`FrameBackend`] driving a real device.
///
/// Dropping the backend waits for the device to go idle, whatever state the
/// frame loop ended in, and then destroys every object in reverse creation
/// order.
pub struct VulkanBackend {
    owned: OwnershipList,
    context: DeviceContext,
    allocator: Allocator,
    surface: SurfaceChain,
    ring: FrameRing,
    host_flush: HostFlush,
    state: StateStore,
    pipeline: ComputePipeline,
    grid: Grid,
}

impl VulkanBackend {
    /// Builds every device object for `window`.
    ///
    /// On failure, whatever was already created is released before the error
    /// is returned.
    #[instrument(level = "info", skip_all)]
    pub fn new<W>(window: &W, config: &EngineConfig) -> EngineResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        config.validate()?;
        let grid = config.grid()?;
        let mut owned = OwnershipList::new();

        let context = DeviceContext::create(window, &config.features, &mut owned)?;
        let allocator = context.allocator(&mut owned)?;
        let surface = SurfaceChain::create(&context, grid, &mut owned)?;
        let ring = FrameRing::create(
            &context.device,
            context.queue_family,
            config.frames_in_flight,
            &mut owned,
        )?;
        let host_flush = HostFlush::create(&context.device, context.queue_family, &mut owned)?;
        let state = StateStore::create(&allocator, grid, &mut owned)?;
        let pipeline = ComputePipeline::create(
            &context.device,
            &config.program_path,
            surface.images(),
            &state,
            &mut owned,
        )?;
        info!(
            width = grid.width,
            height = grid.height,
            slots = ring.len(),
            images = surface.images().len(),
            "Vulkan backend ready"
        );

        Ok(Self {
            owned,
            context,
            allocator,
            surface,
            ring,
            host_flush,
            state,
            pipeline,
            grid,
        })
    }

    /// Names of the owned objects in creation order.
    #[must_use]
    pub fn owned_objects(&self) -> Vec<&'static str> {
        self.owned.labels()
    }
}

impl FrameBackend for VulkanBackend {
    fn slot_count(&self) -> usize {
        self.ring.len()
    }

    fn image_count(&self) -> u32 {
        self.surface.images().len() as u32
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn upload(&mut self, initial: &InitialState) -> EngineResult<()> {
        self.wait_idle()?;
        self.state.upload(&self.allocator, initial)
    }

    fn wait_slot(&mut self, slot: usize) -> EngineResult<()> {
        self.ring.acquire(slot)
    }

    fn acquire_image(&mut self, slot: usize) -> EngineResult<u32> {
        let signal = self.ring.slot(slot)?.image_available;
        self.surface.acquire(signal)
    }

    fn record(&mut self, plan: &FramePlan) -> EngineResult<()> {
        let frame = self.ring.slot(plan.slot)?;
        let device = &self.context.device;
        unsafe {
            device
                .reset_command_pool(frame.pool, vk::CommandPoolResetFlags::empty())
                .during("vkResetCommandPool")?;
        }
        record_plan(
            device,
            frame.commands,
            plan,
            &self.pipeline,
            self.surface.images(),
        )
    }

    fn submit(&mut self, slot: usize) -> EngineResult<()> {
        let frame = self.ring.slot(slot)?;
        let waits = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.image_available)
            .stage_mask(vk::PipelineStageFlags2::COMPUTE_SHADER)];
        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(frame.work_complete)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let commands = [vk::CommandBufferSubmitInfo::default().command_buffer(frame.commands)];
        let submit = [vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&commands)
            .signal_semaphore_infos(&signals)];
        unsafe {
            self.context
                .device
                .queue_submit2(self.context.queue, &submit, frame.fence)
                .during("vkQueueSubmit2")
        }
    }

    fn present(&mut self, slot: usize, image: u32) -> EngineResult<()> {
        let wait = self.ring.slot(slot)?.work_complete;
        self.surface.present(self.context.queue, wait, image)
    }

    fn flush_to_host(&mut self) -> EngineResult<()> {
        self.host_flush.submit_and_wait(self.context.queue)
    }

    fn read_field(&mut self, slot: usize, buffer: FieldBuffer) -> EngineResult<Vec<Amplitude>> {
        self.ring.wait(slot)?;
        self.state.read_field(&self.allocator, buffer)
    }

    fn wait_idle(&mut self) -> EngineResult<()> {
        unsafe {
            self.context
                .device
                .device_wait_idle()
                .during("vkDeviceWaitIdle")
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            warn!("Device did not go idle before teardown: {err}");
        }
        debug!(objects = self.owned.len(), "releasing device objects");
        self.owned.release_all();
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("grid", &self.grid)
            .field("slots", &self.ring.len())
            .field("format", &self.surface.format())
            .field("extent", &self.surface.extent())
            .finish_non_exhaustive()
    }
}
