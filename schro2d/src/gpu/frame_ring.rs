//! Per-frame synchronization objects, used round-robin.

use ash::vk;
use tracing::debug;

use crate::{
    error::{EngineError, EngineResult, VkResultExt},
    gpu::record::record_host_flush,
    teardown::OwnershipList,
};

/// The objects one in-flight frame needs.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Signaled when the slot's submission completes. Created signaled.
    pub fence: vk::Fence,
    /// Signaled when the acquired image may be written.
    pub image_available: vk::Semaphore,
    /// Signaled when the slot's work is done and the image may be presented.
    pub work_complete: vk::Semaphore,
    /// Pool the slot records from; reset as a whole every frame.
    pub pool: vk::CommandPool,
    /// The slot's primary command buffer.
    pub commands: vk::CommandBuffer,
}

/// A fixed ring of [`FrameSlot`]s.
pub struct FrameRing {
    device: ash::Device,
    slots: Vec<FrameSlot>,
}

impl FrameRing {
    /// Creates `count` slots recording for `queue_family`.
    pub fn create(
        device: &ash::Device,
        queue_family: u32,
        count: usize,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let slots = (0..count)
            .map(|_| create_slot(device, queue_family, owned))
            .collect::<EngineResult<Vec<_>>>()?;
        debug!(count, "frame ring created");
        Ok(Self {
            device: device.clone(),
            slots,
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The objects of `slot`.
    pub fn slot(&self, slot: usize) -> EngineResult<&FrameSlot> {
        self.slots.get(slot).ok_or_else(|| {
            EngineError::Config(format!("slot {slot} out of range 0..{}", self.slots.len()))
        })
    }

    /// Waits for the slot's last submission, then resets its fence.
    pub fn acquire(&self, slot: usize) -> EngineResult<()> {
        self.wait(slot)?;
        let fence = self.slot(slot)?.fence;
        unsafe {
            self.device
                .reset_fences(&[fence])
                .during("vkResetFences")
        }
    }

    /// Waits for the slot's last submission without resetting anything.
    pub fn wait(&self, slot: usize) -> EngineResult<()> {
        let fence = self.slot(slot)?.fence;
        match wait_fence(&self.device, fence) {
            Err(vk::Result::TIMEOUT) => Err(EngineError::FenceTimeout { slot }),
            waited => waited.during("vkWaitForFences"),
        }
    }
}

/// A one-shot submission that publishes field writes to the host between
/// sampled frames. It has its own fence and command buffer, so it never
/// disturbs a frame slot.
pub struct HostFlush {
    device: ash::Device,
    fence: vk::Fence,
    pool: vk::CommandPool,
    commands: vk::CommandBuffer,
}

impl HostFlush {
    /// Creates the flush objects for `queue_family`.
    pub fn create(
        device: &ash::Device,
        queue_family: u32,
        owned: &mut OwnershipList,
    ) -> EngineResult<Self> {
        let fence = create_fence(device, vk::FenceCreateFlags::empty(), owned)?;
        let (pool, commands) = create_commands(device, queue_family, owned)?;
        Ok(Self {
            device: device.clone(),
            fence,
            pool,
            commands,
        })
    }

    /// Submits the barrier behind all earlier work on `queue` and waits for it.
    pub fn submit_and_wait(&self, queue: vk::Queue) -> EngineResult<()> {
        unsafe {
            self.device
                .reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())
                .during("vkResetCommandPool")?;
        }
        record_host_flush(&self.device, self.commands)?;
        let commands = [vk::CommandBufferSubmitInfo::default().command_buffer(self.commands)];
        let submit = [vk::SubmitInfo2::default().command_buffer_infos(&commands)];
        unsafe {
            self.device
                .reset_fences(&[self.fence])
                .during("vkResetFences")?;
            self.device
                .queue_submit2(queue, &submit, self.fence)
                .during("vkQueueSubmit2")?;
        }
        wait_fence(&self.device, self.fence).during("vkWaitForFences")
    }
}

fn wait_fence(device: &ash::Device, fence: vk::Fence) -> Result<(), vk::Result> {
    unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
}

fn create_fence(
    device: &ash::Device,
    flags: vk::FenceCreateFlags,
    owned: &mut OwnershipList,
) -> EngineResult<vk::Fence> {
    let fence_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&fence_info, None).during("vkCreateFence")? };
    let destroy = device.clone();
    owned.adopt("fence", fence, move |fence| unsafe {
        destroy.destroy_fence(fence, None);
    });
    Ok(fence)
}

fn create_commands(
    device: &ash::Device,
    queue_family: u32,
    owned: &mut OwnershipList,
) -> EngineResult<(vk::CommandPool, vk::CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
        .queue_family_index(queue_family);
    let pool = unsafe {
        device
            .create_command_pool(&pool_info, None)
            .during("vkCreateCommandPool")?
    };
    let destroy = device.clone();
    owned.adopt("command pool", pool, move |pool| unsafe {
        destroy.destroy_command_pool(pool, None);
    });

    let allocate = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let commands = unsafe {
        device
            .allocate_command_buffers(&allocate)
            .during("vkAllocateCommandBuffers")?
    };
    let commands = commands.first().copied().ok_or(EngineError::Vulkan {
        call: "vkAllocateCommandBuffers",
        result: vk::Result::ERROR_UNKNOWN,
    })?;
    Ok((pool, commands))
}

fn create_slot(
    device: &ash::Device,
    queue_family: u32,
    owned: &mut OwnershipList,
) -> EngineResult<FrameSlot> {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    let fence = create_fence(device, vk::FenceCreateFlags::SIGNALED, owned)?;

    let mut semaphores = [vk::Semaphore::null(); 2];
    for semaphore in &mut semaphores {
        *semaphore = unsafe {
            device
                .create_semaphore(&semaphore_info, None)
                .during("vkCreateSemaphore")?
        };
        let destroy = device.clone();
        owned.adopt("semaphore", *semaphore, move |semaphore| unsafe {
            destroy.destroy_semaphore(semaphore, None);
        });
    }

    let (pool, commands) = create_commands(device, queue_family, owned)?;

    let [image_available, work_complete] = semaphores;
    Ok(FrameSlot {
        fence,
        image_available,
        work_complete,
        pool,
        commands,
    })
}
