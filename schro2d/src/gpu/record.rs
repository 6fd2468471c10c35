//! Translation of a [`FramePlan`] into command-buffer calls.

use ash::vk;

use crate::{
    error::{EngineError, EngineResult, VkResultExt},
    gpu::{
        pipeline::ComputePipeline,
        surface::{PresentableImage, color_range},
    },
    plan::{Barrier, FrameOp, FramePlan, ImageLayout},
};

/// Source and destination scopes of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    /// Stages that must finish first.
    pub src_stage: vk::PipelineStageFlags2,
    /// Accesses made available.
    pub src_access: vk::AccessFlags2,
    /// Stages that wait.
    pub dst_stage: vk::PipelineStageFlags2,
    /// Accesses made visible.
    pub dst_access: vk::AccessFlags2,
}

/// The Vulkan layout for an [`ImageLayout`].
#[must_use]
pub fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

/// Scopes for an image layout transition.
///
/// Entering `General` waits on the compute stage, which is where submission
/// waits for the acquire signal, so the transition happens after the image is
/// free. Leaving for `PresentSrc` publishes the storage writes; presentation
/// itself is ordered by the completion signal.
#[must_use]
pub fn transition_masks(from: ImageLayout, to: ImageLayout) -> BarrierMasks {
    let (src_stage, src_access) = match from {
        ImageLayout::Undefined | ImageLayout::PresentSrc => {
            (vk::PipelineStageFlags2::COMPUTE_SHADER, vk::AccessFlags2::NONE)
        }
        ImageLayout::General => (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
    };
    let (dst_stage, dst_access) = match to {
        ImageLayout::General => (
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        ImageLayout::Undefined | ImageLayout::PresentSrc => {
            (vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE)
        }
    };
    BarrierMasks {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    }
}

/// Scopes for a global memory barrier. `None` for image transitions.
#[must_use]
pub fn memory_barrier_masks(barrier: Barrier) -> Option<BarrierMasks> {
    let src_stage = vk::PipelineStageFlags2::COMPUTE_SHADER;
    let src_access = vk::AccessFlags2::SHADER_STORAGE_WRITE;
    match barrier {
        Barrier::ComputeToCompute => Some(BarrierMasks {
            src_stage,
            src_access,
            dst_stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            dst_access: vk::AccessFlags2::SHADER_STORAGE_READ
                | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        }),
        Barrier::ComputeToHost => Some(BarrierMasks {
            src_stage,
            src_access,
            dst_stage: vk::PipelineStageFlags2::HOST,
            dst_access: vk::AccessFlags2::HOST_READ,
        }),
        Barrier::ImageTransition { .. } => None,
    }
}

/// Records `plan` into `commands`, which must be in its initial state.
pub fn record_plan(
    device: &ash::Device,
    commands: vk::CommandBuffer,
    plan: &FramePlan,
    pipeline: &ComputePipeline,
    images: &[PresentableImage],
) -> EngineResult<()> {
    let begin =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        device
            .begin_command_buffer(commands, &begin)
            .during("vkBeginCommandBuffer")?;
    }

    for op in plan.ops() {
        match *op {
            FrameOp::Barrier(Barrier::ImageTransition { image, from, to }) => {
                let target = images.get(image as usize).ok_or_else(|| {
                    EngineError::Config(format!("no presentable image {image}"))
                })?;
                let masks = transition_masks(from, to);
                let barrier = [vk::ImageMemoryBarrier2::default()
                    .src_stage_mask(masks.src_stage)
                    .src_access_mask(masks.src_access)
                    .dst_stage_mask(masks.dst_stage)
                    .dst_access_mask(masks.dst_access)
                    .old_layout(vk_layout(from))
                    .new_layout(vk_layout(to))
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(target.image)
                    .subresource_range(color_range())];
                let dependency = vk::DependencyInfo::default().image_memory_barriers(&barrier);
                unsafe { device.cmd_pipeline_barrier2(commands, &dependency) };
            }
            FrameOp::Barrier(barrier) => {
                if let Some(masks) = memory_barrier_masks(barrier) {
                    cmd_memory_barrier(device, commands, masks);
                }
            }
            FrameOp::BindPipeline => unsafe {
                device.cmd_bind_pipeline(
                    commands,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.handle(),
                );
            },
            FrameOp::BindSet(key) => {
                let sets = [pipeline.set(key)?];
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        commands,
                        vk::PipelineBindPoint::COMPUTE,
                        pipeline.layout(),
                        0,
                        &sets,
                        &[],
                    );
                }
            }
            FrameOp::PushConstants(params) => unsafe {
                device.cmd_push_constants(
                    commands,
                    pipeline.layout(),
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&params),
                );
            },
            FrameOp::Dispatch { x, y, z } => unsafe {
                device.cmd_dispatch(commands, x, y, z);
            },
        }
    }

    unsafe {
        device
            .end_command_buffer(commands)
            .during("vkEndCommandBuffer")
    }
}

/// Records a command buffer holding a single compute-to-host barrier.
///
/// A pipeline barrier's first scope covers everything submitted earlier on
/// the queue, so submitting this after any frame publishes that frame's field
/// writes to the host.
pub fn record_host_flush(device: &ash::Device, commands: vk::CommandBuffer) -> EngineResult<()> {
    let begin =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe {
        device
            .begin_command_buffer(commands, &begin)
            .during("vkBeginCommandBuffer")?;
    }
    if let Some(masks) = memory_barrier_masks(Barrier::ComputeToHost) {
        cmd_memory_barrier(device, commands, masks);
    }
    unsafe {
        device
            .end_command_buffer(commands)
            .during("vkEndCommandBuffer")
    }
}

fn cmd_memory_barrier(device: &ash::Device, commands: vk::CommandBuffer, masks: BarrierMasks) {
    let barrier = [vk::MemoryBarrier2::default()
        .src_stage_mask(masks.src_stage)
        .src_access_mask(masks.src_access)
        .dst_stage_mask(masks.dst_stage)
        .dst_access_mask(masks.dst_access)];
    let dependency = vk::DependencyInfo::default().memory_barriers(&barrier);
    unsafe { device.cmd_pipeline_barrier2(commands, &dependency) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_enters_general_for_storage_writes() {
        let masks = transition_masks(ImageLayout::Undefined, ImageLayout::General);
        assert_eq!(masks.src_access, vk::AccessFlags2::NONE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(masks.dst_access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
    }

    #[test]
    fn image_leaves_general_after_writes() {
        let masks = transition_masks(ImageLayout::General, ImageLayout::PresentSrc);
        assert_eq!(masks.src_access, vk::AccessFlags2::SHADER_STORAGE_WRITE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(vk_layout(ImageLayout::PresentSrc), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn memory_barriers_target_compute_or_host() {
        let compute = memory_barrier_masks(Barrier::ComputeToCompute).unwrap();
        assert!(
            compute
                .dst_access
                .contains(vk::AccessFlags2::SHADER_STORAGE_READ)
        );
        let host = memory_barrier_masks(Barrier::ComputeToHost).unwrap();
        assert_eq!(host.dst_stage, vk::PipelineStageFlags2::HOST);
        assert_eq!(host.dst_access, vk::AccessFlags2::HOST_READ);
        assert!(
            memory_barrier_masks(Barrier::ImageTransition {
                image: 0,
                from: ImageLayout::General,
                to: ImageLayout::PresentSrc,
            })
            .is_none()
        );
    }
}
