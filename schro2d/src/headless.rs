//! A CPU model of the device for exercising the frame scheduler.
//!
//! [`HeadlessBackend`] implements [`FrameBackend`] without a GPU. Submitted
//! frames are queued and only execute when something waits on them, in
//! submission order, the way a single device queue behaves when the host runs
//! ahead. While executing it checks the rules a real device relies on and
//! records every breach in [`HeadlessBackend::violations`]:
//!
//! - a slot's completion signal is re-armed before it is submitted again;
//! - a submission waits on an acquired image;
//! - presentation uses the image acquired for the same slot;
//! - a dispatch never reads field writes that no barrier made visible;
//! - the host only reads field data after a compute-to-host barrier;
//! - a presentable image is in `General` layout while it is written and in
//!   `PresentSrc` layout when the frame ends.
//!
//! The numerics are supplied by a [`StageKernel`]. [`PhaseShiftKernel`]
//! applies only unitary operations, so the normalization it produces is
//! conserved up to rounding.

use std::collections::VecDeque;

use crate::{
    backend::FrameBackend,
    binding::{BindingResource, BindingSetKey, FIELD_BINDINGS, FieldBuffer, ResolvedResource},
    error::{EngineError, EngineResult, SurfaceStatus},
    event::{EventSource, SurfaceEvent},
    field::{Amplitude, Grid, InitialState},
    plan::{Barrier, FrameOp, FramePlan, ImageLayout},
};

/// Buffers visible to one sub-stage of a time-step.
#[derive(Debug)]
pub struct StageBuffers<'a> {
    /// Grid the buffers are laid out on.
    pub grid: Grid,
    /// Field read by the step.
    pub current: &'a [Amplitude],
    /// Field written by the step.
    pub next: &'a mut [Amplitude],
    /// Storage shared between sub-stages.
    pub scratch: &'a mut [Amplitude],
    /// Static potential, in its device layout.
    pub potential: &'a [Amplitude],
}

/// CPU stand-in for the device program.
pub trait StageKernel {
    /// Runs sub-stage `stage` of one time-step.
    fn apply(&self, stage: u32, time_step: f32, buffers: StageBuffers<'_>);
}

/// A split-step shaped kernel built from unitary pieces.
///
/// Stage 0 applies half a potential phase into scratch, stage 1 shifts the
/// scratch field one cell along x with periodic wrap into the next field, and
/// stage 2 applies the second half of the potential phase in place.
#[derive(Debug, Clone, Copy)]
pub struct PhaseShiftKernel {
    /// Phase per unit of potential and time.
    pub coupling: f32,
}

impl Default for PhaseShiftKernel {
    fn default() -> Self {
        Self { coupling: 1.0 }
    }
}

impl PhaseShiftKernel {
    fn half_phase(&self, potential: Amplitude, time_step: f32) -> Amplitude {
        Amplitude::from_polar(1.0, -0.5 * self.coupling * potential.re * time_step)
    }
}

impl StageKernel for PhaseShiftKernel {
    fn apply(&self, stage: u32, time_step: f32, buffers: StageBuffers<'_>) {
        let StageBuffers {
            grid,
            current,
            next,
            scratch,
            potential,
        } = buffers;
        match stage {
            0 => {
                for ((out, &psi), &v) in scratch.iter_mut().zip(current).zip(potential) {
                    *out = psi * self.half_phase(v, time_step);
                }
            }
            1 => {
                let width = grid.width as usize;
                for (row_out, row_in) in next.chunks_mut(width).zip(scratch.chunks(width)) {
                    for (x, out) in row_out.iter_mut().enumerate() {
                        *out = row_in[(x + width - 1) % width];
                    }
                }
            }
            _ => {
                for (psi, &v) in next.iter_mut().zip(potential) {
                    *psi = *psi * self.half_phase(v, time_step);
                }
            }
        }
    }
}

/// A frame as the model executed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedFrame {
    /// Logical step.
    pub step: u64,
    /// Slot it was submitted from.
    pub slot: usize,
    /// Image it wrote.
    pub image: u32,
    /// Binding set it bound.
    pub set: BindingSetKey,
    /// Field it read.
    pub read: FieldBuffer,
    /// Field it wrote.
    pub write: FieldBuffer,
}

#[derive(Debug, Clone, Default)]
struct SlotModel {
    signaled: bool,
    acquired_image: Option<u32>,
    acquire_signal: bool,
    recorded: Option<FramePlan>,
    has_pending: bool,
}

/// CPU implementation of [`FrameBackend`].
pub struct HeadlessBackend {
    grid: Grid,
    images: u32,
    slots: Vec<SlotModel>,
    acquire_order: Vec<u32>,
    acquisitions: usize,
    held: Vec<bool>,
    layouts: Vec<ImageLayout>,
    queue: VecDeque<FramePlan>,
    fields: [Vec<Amplitude>; 2],
    scratch: Vec<Amplitude>,
    potential: Vec<Amplitude>,
    unsynced_writes: bool,
    host_visible: bool,
    kernel: Box<dyn StageKernel>,
    presents: u64,
    host_flushes: usize,
    surface_failure: Option<(u64, SurfaceStatus)>,
    max_in_flight: usize,
    executed: Vec<ExecutedFrame>,
    presented: Vec<u32>,
    violations: Vec<String>,
}

impl HeadlessBackend {
    /// A model with `slots` frame slots and `images` presentable images.
    #[must_use]
    pub fn new(grid: Grid, slots: usize, images: u32) -> Self {
        let initial_slot = SlotModel {
            signaled: true,
            ..SlotModel::default()
        };
        Self {
            grid,
            images,
            slots: vec![initial_slot; slots],
            acquire_order: (0..images).collect(),
            acquisitions: 0,
            held: vec![false; images as usize],
            layouts: vec![ImageLayout::Undefined; images as usize],
            queue: VecDeque::new(),
            fields: [
                vec![Amplitude::ZERO; grid.cells()],
                vec![Amplitude::ZERO; grid.cells()],
            ],
            scratch: vec![Amplitude::ZERO; grid.cells()],
            potential: vec![Amplitude::ZERO; grid.cells()],
            unsynced_writes: false,
            host_visible: true,
            kernel: Box::new(PhaseShiftKernel::default()),
            presents: 0,
            host_flushes: 0,
            surface_failure: None,
            max_in_flight: 0,
            executed: Vec::new(),
            presented: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Hands out images in this repeating order instead of round-robin.
    #[must_use]
    pub fn with_acquire_order(mut self, order: Vec<u32>) -> Self {
        self.acquire_order = order;
        self
    }

    /// Replaces the numerical kernel.
    #[must_use]
    pub fn with_kernel(mut self, kernel: impl StageKernel + 'static) -> Self {
        self.kernel = Box::new(kernel);
        self
    }

    /// Makes the `present`-th presentation (counting from zero) report `status`.
    #[must_use]
    pub fn with_surface_failure(mut self, present: u64, status: SurfaceStatus) -> Self {
        self.surface_failure = Some((present, status));
        self
    }

    /// Largest number of submissions that were pending at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Submissions not yet executed.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    /// Frames in the order they executed.
    #[must_use]
    pub fn executed(&self) -> &[ExecutedFrame] {
        &self.executed
    }

    /// Standalone host barriers submitted.
    #[must_use]
    pub fn host_flushes(&self) -> usize {
        self.host_flushes
    }

    /// Image indices in the order they were presented.
    #[must_use]
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    /// Every ordering rule the driven sequence broke.
    #[must_use]
    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// The field buffer contents as they are after all executed work.
    #[must_use]
    pub fn field(&self, buffer: FieldBuffer) -> &[Amplitude] {
        &self.fields[buffer.index()]
    }

    /// The potential buffer contents.
    #[must_use]
    pub fn potential(&self) -> &[Amplitude] {
        &self.potential
    }

    fn violation(&mut self, message: String) {
        self.violations.push(message);
    }

    fn slot_mut(&mut self, slot: usize) -> EngineResult<&mut SlotModel> {
        let count = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or_else(|| EngineError::Config(format!("slot {slot} out of range 0..{count}")))
    }

    /// Executes queued submissions in order until `slot` has none pending.
    fn complete_through(&mut self, slot: usize) {
        while self.slots[slot].has_pending {
            let Some(plan) = self.queue.pop_front() else {
                break;
            };
            self.execute(&plan);
            let done = &mut self.slots[plan.slot];
            done.has_pending = false;
            done.signaled = true;
        }
    }

    fn execute(&mut self, plan: &FramePlan) {
        let mut set = None;
        let mut params = None;
        for op in plan.ops() {
            match *op {
                FrameOp::Barrier(Barrier::ComputeToCompute) => self.unsynced_writes = false,
                FrameOp::Barrier(Barrier::ComputeToHost) => self.host_visible = true,
                FrameOp::Barrier(Barrier::ImageTransition { image, from, to }) => {
                    let current = self.layouts[image as usize];
                    if from != ImageLayout::Undefined && current != from {
                        self.violation(format!(
                            "step {}: image {image} transitioned from {from:?} but is {current:?}",
                            plan.step
                        ));
                    }
                    self.layouts[image as usize] = to;
                }
                FrameOp::BindPipeline => {}
                FrameOp::BindSet(key) => set = Some(key),
                FrameOp::PushConstants(p) => params = Some(p),
                FrameOp::Dispatch { .. } => {
                    let (Some(key), Some(p)) = (set, params) else {
                        self.violation(format!(
                            "step {}: dispatch without bound set or push constants",
                            plan.step
                        ));
                        continue;
                    };
                    if self.unsynced_writes {
                        self.violation(format!(
                            "step {}: sub-stage {} reads writes no barrier made visible",
                            plan.step, p.sub_stage
                        ));
                    }
                    self.dispatch(key, p.sub_stage, p.time_step);
                    self.unsynced_writes = true;
                    self.host_visible = false;
                }
            }
        }
        if self.layouts[plan.image as usize] != ImageLayout::PresentSrc {
            self.violation(format!(
                "step {}: image {} left in {:?}",
                plan.step, plan.image, self.layouts[plan.image as usize]
            ));
        }
        if let Some(key) = set {
            self.executed.push(ExecutedFrame {
                step: plan.step,
                slot: plan.slot,
                image: plan.image,
                set: key,
                read: plan.read,
                write: plan.write,
            });
        }
    }

    fn dispatch(&mut self, key: BindingSetKey, stage: u32, time_step: f32) {
        let mut current = None;
        let mut next = None;
        for slot in &FIELD_BINDINGS {
            match (slot.resource, slot.resolve(key)) {
                (BindingResource::CurrentField, ResolvedResource::Field(buffer)) => {
                    current = Some(buffer);
                }
                (BindingResource::NextField, ResolvedResource::Field(buffer)) => {
                    next = Some(buffer);
                }
                _ => {}
            }
        }
        let (Some(current), Some(next)) = (current, next) else {
            return;
        };
        if current == next {
            self.violation(format!("set {key:?} reads and writes the same buffer"));
            return;
        }
        let [ping, pong] = &mut self.fields;
        let (current, next) = match current {
            FieldBuffer::Ping => (&*ping, pong),
            FieldBuffer::Pong => (&*pong, ping),
        };
        self.kernel.apply(
            stage,
            time_step,
            StageBuffers {
                grid: self.grid,
                current,
                next,
                scratch: &mut self.scratch,
                potential: &self.potential,
            },
        );
    }
}

impl FrameBackend for HeadlessBackend {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn image_count(&self) -> u32 {
        self.images
    }

    fn grid(&self) -> Grid {
        self.grid
    }

    fn upload(&mut self, initial: &InitialState) -> EngineResult<()> {
        if !self.queue.is_empty() {
            self.violation("upload while work is in flight".into());
        }
        let field = initial.field().to_vec();
        self.fields = [field.clone(), field];
        self.potential = initial.device_potential();
        self.host_visible = true;
        Ok(())
    }

    fn wait_slot(&mut self, slot: usize) -> EngineResult<()> {
        self.slot_mut(slot)?;
        self.complete_through(slot);
        let model = &mut self.slots[slot];
        model.signaled = false;
        model.recorded = None;
        Ok(())
    }

    fn acquire_image(&mut self, slot: usize) -> EngineResult<u32> {
        self.slot_mut(slot)?;
        if self.acquire_order.is_empty() {
            return Err(EngineError::Config("no presentable images to acquire".into()));
        }
        let image = self.acquire_order[self.acquisitions % self.acquire_order.len()];
        self.acquisitions += 1;
        if self.held[image as usize] {
            self.violation(format!("image {image} acquired while still held"));
        }
        self.held[image as usize] = true;
        let model = &mut self.slots[slot];
        model.acquired_image = Some(image);
        model.acquire_signal = true;
        Ok(image)
    }

    fn record(&mut self, plan: &FramePlan) -> EngineResult<()> {
        let model = self.slot_mut(plan.slot)?;
        let acquired = model.acquired_image;
        model.recorded = Some(plan.clone());
        if acquired != Some(plan.image) {
            self.violation(format!(
                "step {} records image {} but slot {} acquired {acquired:?}",
                plan.step, plan.image, plan.slot
            ));
        }
        if plan.bound_set().map(|key| key.image) != Some(plan.image) {
            self.violation(format!(
                "step {} binds a set for another image",
                plan.step
            ));
        }
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> EngineResult<()> {
        let model = self.slot_mut(slot)?;
        let signaled = model.signaled;
        let waited_on_image = std::mem::take(&mut model.acquire_signal);
        let plan = model.recorded.take();
        model.has_pending = true;
        if signaled {
            self.violation(format!("slot {slot} submitted with a signaled fence"));
        }
        if !waited_on_image {
            self.violation(format!("slot {slot} submitted without an acquired image"));
        }
        match plan {
            Some(plan) => self.queue.push_back(plan),
            None => self.violation(format!("slot {slot} submitted without recording")),
        }
        self.max_in_flight = self.max_in_flight.max(self.queue.len());
        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> EngineResult<()> {
        let index = self.presents;
        self.presents += 1;
        if let Some((at, status)) = self.surface_failure
            && at == index
        {
            return Err(EngineError::SurfaceState(status));
        }
        let model = self.slot_mut(slot)?;
        let acquired = model.acquired_image.take();
        if acquired != Some(image) {
            self.violation(format!(
                "slot {slot} presents image {image} but acquired {acquired:?}"
            ));
        }
        self.held[image as usize] = false;
        self.presented.push(image);
        Ok(())
    }

    fn flush_to_host(&mut self) -> EngineResult<()> {
        // The barrier is queued behind everything submitted so far, and the
        // host waits for it.
        self.wait_idle()?;
        self.host_visible = true;
        self.host_flushes += 1;
        Ok(())
    }

    fn read_field(&mut self, slot: usize, buffer: FieldBuffer) -> EngineResult<Vec<Amplitude>> {
        self.slot_mut(slot)?;
        self.complete_through(slot);
        if !self.host_visible {
            self.violation(format!("host read of {buffer:?} without a host barrier"));
        }
        Ok(self.fields[buffer.index()].clone())
    }

    fn wait_idle(&mut self) -> EngineResult<()> {
        while let Some(plan) = self.queue.pop_front() {
            self.execute(&plan);
            let done = &mut self.slots[plan.slot];
            done.has_pending = false;
            done.signaled = true;
        }
        Ok(())
    }
}

/// An [`EventSource`] that replays a fixed script.
///
/// Each poll returns the next batch. Once the script is exhausted every poll
/// reports [`SurfaceEvent::CloseRequested`].
#[derive(Debug, Clone, Default)]
pub struct ScriptedEvents {
    script: VecDeque<Vec<SurfaceEvent>>,
    polls: usize,
}

impl ScriptedEvents {
    /// A script that stays quiet for `polls` polls and then asks to close.
    #[must_use]
    pub fn close_after(polls: usize) -> Self {
        Self {
            script: std::iter::repeat_with(Vec::new).take(polls).collect(),
            polls: 0,
        }
    }

    /// Appends one poll's worth of events.
    #[must_use]
    pub fn then(mut self, events: Vec<SurfaceEvent>) -> Self {
        self.script.push_back(events);
        self
    }

    /// Number of polls served so far.
    #[must_use]
    pub fn polls(&self) -> usize {
        self.polls
    }
}

impl EventSource for ScriptedEvents {
    fn poll(&mut self) -> Vec<SurfaceEvent> {
        self.polls += 1;
        self.script
            .pop_front()
            .unwrap_or_else(|| vec![SurfaceEvent::CloseRequested])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::normalization;

    fn packet(grid: Grid) -> InitialState {
        let field = (0..grid.cells())
            .map(|i| Amplitude::from_polar(((i % 7) as f32 + 1.0) * 0.1, i as f32 * 0.3))
            .collect();
        let potential = (0..grid.cells()).map(|i| (i % 5) as f32).collect();
        InitialState::new(grid, field, potential).unwrap()
    }

    #[test]
    fn phase_shift_kernel_is_unitary() {
        let grid = Grid::new(8, 4).unwrap();
        let initial = packet(grid);
        let mut next = vec![Amplitude::ZERO; grid.cells()];
        let mut scratch = vec![Amplitude::ZERO; grid.cells()];
        let potential = initial.device_potential();
        let kernel = PhaseShiftKernel { coupling: 0.7 };
        for stage in 0..3 {
            kernel.apply(
                stage,
                0.1,
                StageBuffers {
                    grid,
                    current: initial.field(),
                    next: &mut next,
                    scratch: &mut scratch,
                    potential: &potential,
                },
            );
        }
        let before = normalization(initial.field(), grid);
        let after = normalization(&next, grid);
        assert!((before - after).abs() / before < 1e-6);
    }

    #[test]
    fn shift_wraps_within_rows() {
        let grid = Grid::new(3, 2).unwrap();
        let current: Vec<_> = (0..6).map(|i| Amplitude::new(i as f32, 0.0)).collect();
        let mut next = vec![Amplitude::ZERO; 6];
        let mut scratch = vec![Amplitude::ZERO; 6];
        let potential = vec![Amplitude::ZERO; 6];
        let kernel = PhaseShiftKernel::default();
        for stage in 0..3 {
            kernel.apply(
                stage,
                1.0,
                StageBuffers {
                    grid,
                    current: &current,
                    next: &mut next,
                    scratch: &mut scratch,
                    potential: &potential,
                },
            );
        }
        let re: Vec<f32> = next.iter().map(|a| a.re).collect();
        assert_eq!(re, [2.0, 0.0, 1.0, 5.0, 3.0, 4.0]);
    }

    #[test]
    fn submissions_complete_in_order_when_waited() {
        let grid = Grid::new(4, 4).unwrap();
        let mut backend = HeadlessBackend::new(grid, 2, 2);
        backend.upload(&packet(grid)).unwrap();
        for (step, slot) in [(0u64, 0usize), (1, 1)] {
            backend.wait_slot(slot).unwrap();
            let image = backend.acquire_image(slot).unwrap();
            backend
                .record(&FramePlan::record(slot, image, step, grid, 0.1, false))
                .unwrap();
            backend.submit(slot).unwrap();
            backend.present(slot, image).unwrap();
        }
        assert_eq!(backend.in_flight(), 2);
        assert!(backend.executed().is_empty());
        backend.wait_slot(1).unwrap();
        assert_eq!(backend.in_flight(), 0);
        let steps: Vec<_> = backend.executed().iter().map(|f| f.step).collect();
        assert_eq!(steps, [0, 1]);
        assert!(backend.violations().is_empty(), "{:?}", backend.violations());
    }

    #[test]
    fn upload_stores_the_potential_as_complex_cells() {
        let grid = Grid::new(5, 3).unwrap();
        let initial = packet(grid);
        let mut backend = HeadlessBackend::new(grid, 1, 1);
        backend.upload(&initial).unwrap();
        let potential = backend.potential();
        assert_eq!(
            bytemuck::cast_slice::<_, u8>(potential).len() as u64,
            grid.potential_bytes()
        );
        for (cell, &v) in potential.iter().zip(initial.potential()) {
            assert_eq!(*cell, Amplitude::new(v, 0.0));
        }
    }

    #[test]
    fn misuse_is_reported() {
        let grid = Grid::new(4, 4).unwrap();
        let mut backend = HeadlessBackend::new(grid, 1, 2);
        // Submitting without waiting keeps the fence signaled, and nothing
        // was acquired or recorded.
        backend.submit(0).unwrap();
        assert_eq!(backend.violations().len(), 3);
    }

    #[test]
    fn scripted_events_close_when_exhausted() {
        let mut events =
            ScriptedEvents::close_after(1).then(vec![SurfaceEvent::Focused(false)]);
        assert!(events.poll().is_empty());
        assert_eq!(events.poll(), [SurfaceEvent::Focused(false)]);
        assert_eq!(events.poll(), [SurfaceEvent::CloseRequested]);
        assert_eq!(events.polls(), 3);
    }
}
