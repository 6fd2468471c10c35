//! The seam between the frame scheduler and a device.
//!
//! The scheduler only sequences phases; everything that touches a device goes
//! through [`FrameBackend`]. The Vulkan engine implements it for real, and a
//! CPU model implements it for tests.

use crate::{
    binding::FieldBuffer,
    error::EngineResult,
    field::{Amplitude, Grid, InitialState},
    plan::FramePlan,
};

/// Device operations the frame scheduler drives.
///
/// Slots are indices into a ring of `slot_count()` frame slots. A slot is
/// reusable once `wait_slot` returns for it.
pub trait FrameBackend {
    /// Number of frame slots, the bound on frames in flight.
    fn slot_count(&self) -> usize;

    /// Number of presentable images.
    fn image_count(&self) -> u32;

    /// Grid the field buffers were sized for.
    fn grid(&self) -> Grid;

    /// Writes the initial field into both field buffers and the potential.
    ///
    /// Called once before the first frame, with no work in flight.
    fn upload(&mut self, initial: &InitialState) -> EngineResult<()>;

    /// Blocks until the slot's previous submission has completed, then
    /// re-arms its completion signal.
    fn wait_slot(&mut self, slot: usize) -> EngineResult<()>;

    /// Acquires a presentable image, arranging for the slot's acquire signal
    /// to fire once it is free. Returns the image index.
    fn acquire_image(&mut self, slot: usize) -> EngineResult<u32>;

    /// Records the frame's work into the slot's command buffer.
    fn record(&mut self, plan: &FramePlan) -> EngineResult<()>;

    /// Submits the slot's recorded work.
    fn submit(&mut self, slot: usize) -> EngineResult<()>;

    /// Queues `image` for presentation once the slot's work completes.
    fn present(&mut self, slot: usize, image: u32) -> EngineResult<()>;

    /// Makes every field write submitted so far visible to the host, with a
    /// submission of its own that carries only a compute-to-host barrier.
    /// Returns once that submission has completed.
    fn flush_to_host(&mut self) -> EngineResult<()>;

    /// Waits for the slot's latest submission without re-arming it, then
    /// copies `buffer` to the host.
    ///
    /// The writes being read must already be host-visible, either through the
    /// readback barrier of a sampled frame or through [`Self::flush_to_host`].
    fn read_field(&mut self, slot: usize, buffer: FieldBuffer) -> EngineResult<Vec<Amplitude>>;

    /// Blocks until the device has no outstanding work.
    fn wait_idle(&mut self) -> EngineResult<()>;
}
