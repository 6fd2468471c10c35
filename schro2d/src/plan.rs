//! Backend-neutral description of one frame's device work.
//!
//! The scheduler records a [`FramePlan`] during the RECORD phase and hands it
//! to the backend, which translates each [`FrameOp`] into command-buffer calls.
//! Keeping the plan as plain data lets the ordering rules (barrier placement,
//! layout transitions, which binding set is bound) be checked without a
//! device.
//!
//! A frame always has this shape:
//!
//! 1. hand-off barrier, so the previous frame's field writes are visible;
//! 2. transition of the acquired image `Undefined → General`;
//! 3. pipeline and binding-set bind;
//! 4. [`SUB_STAGES`] dispatches, separated by compute-to-compute barriers,
//!    each preceded by its push constants;
//! 5. transition of the acquired image `General → PresentSrc`;
//! 6. on sampled frames, a compute-to-host barrier for the readback.

use bytemuck::{Pod, Zeroable};
use smallvec::SmallVec;

use crate::{
    binding::{BindingSetKey, FieldBuffer},
    field::Grid,
};

/// Number of dispatches that make up one time-step.
pub const SUB_STAGES: u32 = 3;

/// Layout of a presentable image as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents are discarded.
    Undefined,
    /// Storage-image access from compute.
    General,
    /// Ready for presentation.
    PresentSrc,
}

/// An execution and memory dependency inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Layout transition of one presentable image.
    ImageTransition {
        /// Image index.
        image: u32,
        /// Layout before the barrier.
        from: ImageLayout,
        /// Layout after the barrier.
        to: ImageLayout,
    },
    /// Compute writes made visible to later compute reads and writes.
    ComputeToCompute,
    /// Compute writes made visible to host reads.
    ComputeToHost,
}

/// Push constants for one dispatch.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct StepParameters {
    /// Simulated time advanced per frame.
    pub time_step: f32,
    /// Which sub-stage of the split-step this dispatch performs.
    pub sub_stage: u32,
}

impl StepParameters {
    /// Size of the push-constant block in bytes.
    pub const SIZE: u32 = size_of::<Self>() as u32;
}

/// One recorded command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOp {
    /// A pipeline barrier.
    Barrier(Barrier),
    /// Bind the compute pipeline.
    BindPipeline,
    /// Bind one prebuilt binding set.
    BindSet(BindingSetKey),
    /// Update the push constants.
    PushConstants(StepParameters),
    /// Launch a grid of workgroups.
    Dispatch {
        /// Workgroups along x.
        x: u32,
        /// Workgroups along y.
        y: u32,
        /// Workgroups along z.
        z: u32,
    },
}

type OpList = SmallVec<[FrameOp; 16]>;

/// The device work of a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePlan {
    /// Frame slot the work is recorded into.
    pub slot: usize,
    /// Presentable image written by the frame.
    pub image: u32,
    /// Logical step advanced by the frame.
    pub step: u64,
    /// Field read by the frame.
    pub read: FieldBuffer,
    /// Field written by the frame.
    pub write: FieldBuffer,
    /// Whether the frame ends with a host-readback barrier.
    pub readback: bool,
    ops: OpList,
}

impl FramePlan {
    /// Records the work that advances `step` into `image`.
    #[must_use]
    pub fn record(
        slot: usize,
        image: u32,
        step: u64,
        grid: Grid,
        time_step: f32,
        readback: bool,
    ) -> Self {
        let (read, write) = FieldBuffer::for_step(step);
        let [x, y, z] = grid.workgroups();
        let mut ops = OpList::new();

        ops.push(FrameOp::Barrier(Barrier::ComputeToCompute));
        ops.push(FrameOp::Barrier(Barrier::ImageTransition {
            image,
            from: ImageLayout::Undefined,
            to: ImageLayout::General,
        }));
        ops.push(FrameOp::BindPipeline);
        ops.push(FrameOp::BindSet(BindingSetKey::for_frame(image, step)));
        for sub_stage in 0..SUB_STAGES {
            if sub_stage > 0 {
                ops.push(FrameOp::Barrier(Barrier::ComputeToCompute));
            }
            ops.push(FrameOp::PushConstants(StepParameters {
                time_step,
                sub_stage,
            }));
            ops.push(FrameOp::Dispatch { x, y, z });
        }
        ops.push(FrameOp::Barrier(Barrier::ImageTransition {
            image,
            from: ImageLayout::General,
            to: ImageLayout::PresentSrc,
        }));
        if readback {
            ops.push(FrameOp::Barrier(Barrier::ComputeToHost));
        }

        Self {
            slot,
            image,
            step,
            read,
            write,
            readback,
            ops,
        }
    }

    /// Recorded ops in submission order.
    #[must_use]
    pub fn ops(&self) -> &[FrameOp] {
        &self.ops
    }

    /// Push constants and workgroup counts of every dispatch, in order.
    pub fn dispatches(&self) -> impl Iterator<Item = (StepParameters, [u32; 3])> + '_ {
        let mut params = None;
        self.ops.iter().filter_map(move |op| match *op {
            FrameOp::PushConstants(p) => {
                params = Some(p);
                None
            }
            FrameOp::Dispatch { x, y, z } => params.map(|p| (p, [x, y, z])),
            _ => None,
        })
    }

    /// Image layout transitions as `(image, from, to)`, in order.
    pub fn transitions(&self) -> impl Iterator<Item = (u32, ImageLayout, ImageLayout)> + '_ {
        self.ops.iter().filter_map(|op| match *op {
            FrameOp::Barrier(Barrier::ImageTransition { image, from, to }) => {
                Some((image, from, to))
            }
            _ => None,
        })
    }

    /// The binding set bound by the frame.
    #[must_use]
    pub fn bound_set(&self) -> Option<BindingSetKey> {
        self.ops.iter().find_map(|op| match *op {
            FrameOp::BindSet(key) => Some(key),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new(100, 64).unwrap()
    }

    #[test]
    fn three_tagged_dispatches_cover_the_grid() {
        let plan = FramePlan::record(0, 1, 0, grid(), 1e-16, false);
        let dispatches: Vec<_> = plan.dispatches().collect();
        assert_eq!(dispatches.len(), SUB_STAGES as usize);
        for (expected, (params, groups)) in dispatches.iter().enumerate() {
            assert_eq!(params.sub_stage, expected as u32);
            assert_eq!(params.time_step, 1e-16);
            assert_eq!(*groups, [4, 2, 1]);
        }
    }

    #[test]
    fn every_dispatch_after_the_first_follows_a_barrier() {
        let plan = FramePlan::record(1, 0, 7, grid(), 1.0, false);
        let mut barrier_pending = false;
        let mut seen = 0;
        for op in plan.ops() {
            match op {
                FrameOp::Barrier(Barrier::ComputeToCompute) => barrier_pending = true,
                FrameOp::Dispatch { .. } => {
                    assert!(barrier_pending, "dispatch {seen} has no preceding barrier");
                    barrier_pending = false;
                    seen += 1;
                }
                _ => {}
            }
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn acquired_image_is_transitioned_and_bound() {
        let plan = FramePlan::record(0, 2, 3, grid(), 1.0, false);
        let transitions: Vec<_> = plan.transitions().collect();
        assert_eq!(
            transitions,
            [
                (2, ImageLayout::Undefined, ImageLayout::General),
                (2, ImageLayout::General, ImageLayout::PresentSrc),
            ]
        );
        assert_eq!(plan.bound_set(), Some(BindingSetKey::for_frame(2, 3)));
        assert_eq!(plan.read, FieldBuffer::Pong);
        assert_eq!(plan.write, FieldBuffer::Ping);
    }

    #[test]
    fn readback_barrier_only_on_sampled_frames() {
        let plain = FramePlan::record(0, 0, 0, grid(), 1.0, false);
        let sampled = FramePlan::record(0, 0, 0, grid(), 1.0, true);
        let host = FrameOp::Barrier(Barrier::ComputeToHost);
        assert!(!plain.ops().contains(&host));
        assert_eq!(sampled.ops().last(), Some(&host));
    }

    #[test]
    fn push_constant_block_is_eight_bytes() {
        assert_eq!(StepParameters::SIZE, 8);
        let bytes = bytemuck::bytes_of(&StepParameters {
            time_step: 0.5,
            sub_stage: 2,
        });
        assert_eq!(&bytes[4..], &2u32.to_ne_bytes());
    }
}
