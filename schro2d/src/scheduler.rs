//! The frame scheduler.
//!
//! One frame is one time-step of the simulation and one presented image. The
//! scheduler advances through a fixed cycle of phases per frame:
//!
//! ```text
//! WAIT_FENCE → ACQUIRE_IMAGE → RECORD → SUBMIT → PRESENT → (next slot)
//! ```
//!
//! Frame slots are used round-robin, and a slot is only reused after its
//! previous submission has completed, so at most `slot_count` frames are in
//! flight. Every phase after acquisition uses the image index the surface
//! handed out, which may differ from the slot index.
//!
//! The field is double-buffered by step parity: frame `k` reads buffer
//! `k mod 2` and writes `(k + 1) mod 2`. After frame `k` completes, buffer
//! `(k + 1) mod 2` holds the latest state.

use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    backend::FrameBackend,
    binding::FieldBuffer,
    config::EngineConfig,
    diagnostics::{DiagnosticSink, NormSample},
    error::{EngineError, EngineResult},
    event::{EventSource, SurfaceEvent},
    field::{InitialState, normalization},
    plan::FramePlan,
};

/// Phases of one frame, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Wait for the slot's previous submission, then re-arm its fence.
    WaitFence,
    /// Acquire a presentable image.
    AcquireImage,
    /// Record the frame's device work.
    Record,
    /// Submit the recorded work.
    Submit,
    /// Queue the image for presentation.
    Present,
}

/// Per-run scheduling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    /// Simulated time advanced per frame.
    pub time_step: f32,
    /// Frames between normalization samples.
    pub diagnostic_interval: u64,
}

impl SchedulerSettings {
    /// Takes the scheduling parameters from an engine configuration.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            time_step: config.time_step,
            diagnostic_interval: config.diagnostic_interval,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What one call to [`FrameScheduler::step`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    /// Frame counter of the frame.
    pub frame: u64,
    /// Slot used.
    pub slot: usize,
    /// Image acquired and presented.
    pub image: u32,
    /// Field read.
    pub read: FieldBuffer,
    /// Field written.
    pub write: FieldBuffer,
    /// Normalization sample taken after the frame, if it was a sampled frame.
    pub sample: Option<NormSample>,
}

/// Totals of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunSummary {
    /// Frames submitted.
    pub frames: u64,
    /// Normalization samples reported.
    pub samples: u64,
    /// The last reported normalization.
    pub last_norm: Option<f64>,
}

/// Drives a [`FrameBackend`] one frame at a time.
#[derive(Debug)]
pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    settings: SchedulerSettings,
    frame: u64,
    slot: usize,
    host_visible: bool,
}

impl<B: FrameBackend> FrameScheduler<B> {
    /// Uploads the initial state and prepares to run frame 0 on slot 0.
    ///
    /// The upload is synchronous and happens before any frame is in flight.
    pub fn new(
        mut backend: B,
        initial: &InitialState,
        settings: SchedulerSettings,
    ) -> EngineResult<Self> {
        let grid = backend.grid();
        if initial.grid() != grid {
            return Err(EngineError::GridMismatch {
                what: "initial field",
                actual: initial.grid().cells(),
                expected: grid.cells(),
                width: grid.width,
                height: grid.height,
            });
        }
        if backend.slot_count() == 0 || backend.image_count() == 0 {
            return Err(EngineError::Config(format!(
                "backend has {} slots and {} images",
                backend.slot_count(),
                backend.image_count()
            )));
        }
        if settings.diagnostic_interval == 0 {
            return Err(EngineError::Config(
                "diagnostic interval must be at least one frame".into(),
            ));
        }
        backend.upload(initial)?;
        info!(
            width = grid.width,
            height = grid.height,
            slots = backend.slot_count(),
            images = backend.image_count(),
            "initial state uploaded"
        );
        Ok(Self {
            backend,
            settings,
            frame: 0,
            slot: 0,
            host_visible: true,
        })
    }

    /// Runs one full frame cycle.
    ///
    /// Sampled frames additionally read the field back after the frame's
    /// work completes.
    pub fn step(&mut self) -> EngineResult<FrameReport> {
        let frame = self.frame;
        let slot = self.slot;
        let _span = debug_span!("frame", frame, slot).entered();

        with_phase(Phase::WaitFence, self.backend.wait_slot(slot))?;
        let image = with_phase(Phase::AcquireImage, self.backend.acquire_image(slot))?;
        let readback = self.is_sampled(frame);
        let plan = FramePlan::record(
            slot,
            image,
            frame,
            self.backend.grid(),
            self.settings.time_step,
            readback,
        );
        with_phase(Phase::Record, self.backend.record(&plan))?;
        with_phase(Phase::Submit, self.backend.submit(slot))?;
        with_phase(Phase::Present, self.backend.present(slot, image))?;
        trace!(image, read = ?plan.read, write = ?plan.write, "frame submitted");

        self.frame += 1;
        self.slot = (slot + 1) % self.backend.slot_count();
        self.host_visible = readback;

        let sample = if readback {
            Some(self.read_norm(slot, frame, plan.write)?)
        } else {
            None
        };
        Ok(FrameReport {
            frame,
            slot,
            image,
            read: plan.read,
            write: plan.write,
            sample,
        })
    }

    /// Reads back the latest field and computes its normalization.
    ///
    /// Waits for the most recent submission. If that frame did not end with
    /// the readback barrier, a standalone host barrier is submitted first.
    /// Before the first frame it reads the uploaded state.
    pub fn sample_norm(&mut self) -> EngineResult<NormSample> {
        if !self.host_visible {
            debug!(frame = self.frame, "flushing field writes to the host");
            self.backend.flush_to_host()?;
            self.host_visible = true;
        }
        let slot_count = self.backend.slot_count();
        let last_slot = (self.slot + slot_count - 1) % slot_count;
        let label = self.frame.saturating_sub(1);
        self.read_norm(last_slot, label, self.current_buffer())
    }

    /// Runs frames until the event source asks to close.
    ///
    /// Events are polled once per frame, before the frame starts. On return
    /// the backend has no outstanding work.
    pub fn run(
        &mut self,
        events: &mut impl EventSource,
        sink: &mut impl DiagnosticSink,
    ) -> EngineResult<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            if close_requested(events.poll()) {
                info!(frames = self.frame, "close requested");
                break;
            }
            let report = match self.step() {
                Ok(report) => report,
                Err(err) => {
                    warn!(frame = self.frame, tier = ?err.tier(), "frame loop stopped: {err}");
                    return Err(err);
                }
            };
            summary.frames += 1;
            if let Some(sample) = report.sample {
                summary.samples += 1;
                summary.last_norm = Some(sample.norm);
                sink.record(sample);
            }
        }
        self.backend.wait_idle()?;
        Ok(summary)
    }

    /// The field buffer holding the latest state.
    #[must_use]
    pub fn current_buffer(&self) -> FieldBuffer {
        FieldBuffer::latest_after(self.frame)
    }

    /// Number of frames submitted so far.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot the next frame will use.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The driven backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Releases the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }

    fn is_sampled(&self, frame: u64) -> bool {
        frame % self.settings.diagnostic_interval == 0
    }

    fn read_norm(
        &mut self,
        slot: usize,
        frame: u64,
        buffer: FieldBuffer,
    ) -> EngineResult<NormSample> {
        let field = self.backend.read_field(slot, buffer)?;
        let norm = normalization(&field, self.backend.grid());
        Ok(NormSample { frame, norm })
    }
}

fn with_phase<T>(phase: Phase, result: EngineResult<T>) -> EngineResult<T> {
    if let Err(err) = &result {
        debug!(?phase, tier = ?err.tier(), "phase failed: {err}");
    }
    result
}

fn close_requested(events: Vec<SurfaceEvent>) -> bool {
    let mut close = false;
    for event in events {
        match event {
            SurfaceEvent::CloseRequested => close = true,
            SurfaceEvent::Resized { width, height } => {
                warn!("ignoring resize to {width}x{height}; the surface has a fixed size");
            }
            SurfaceEvent::Focused(focused) => debug!(focused, "focus changed"),
            SurfaceEvent::Other => {}
        }
    }
    close
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::BindingSetKey,
        diagnostics::relative_drift,
        error::{ErrorTier, SurfaceStatus},
        field::{Amplitude, Grid},
        headless::{HeadlessBackend, ScriptedEvents},
    };

    fn grid() -> Grid {
        Grid::new(16, 8).unwrap()
    }

    fn packet(grid: Grid) -> InitialState {
        let cx = grid.width as f32 / 2.0;
        let cy = grid.height as f32 / 2.0;
        let mut field = Vec::with_capacity(grid.cells());
        for y in 0..grid.height {
            for x in 0..grid.width {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                let envelope = (-(dx * dx + dy * dy) / 16.0).exp();
                field.push(Amplitude::from_polar(envelope, 0.8 * dx));
            }
        }
        InitialState::new(grid, field, vec![0.0; grid.cells()]).unwrap()
    }

    fn scheduler(backend: HeadlessBackend) -> FrameScheduler<HeadlessBackend> {
        FrameScheduler::new(backend, &packet(grid()), SchedulerSettings::default()).unwrap()
    }

    #[test]
    fn in_flight_never_exceeds_slot_count() {
        for slots in 1..=3 {
            let mut scheduler = scheduler(HeadlessBackend::new(grid(), slots, 3));
            for _ in 0..20 {
                scheduler.step().unwrap();
                assert!(scheduler.backend().in_flight() <= slots);
            }
            assert_eq!(scheduler.backend().max_in_flight(), slots);
            assert!(
                scheduler.backend().violations().is_empty(),
                "{:?}",
                scheduler.backend().violations()
            );
        }
    }

    #[test]
    fn slots_rotate_round_robin() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 2));
        let slots: Vec<_> = (0..5).map(|_| scheduler.step().unwrap().slot).collect();
        assert_eq!(slots, [0, 1, 0, 1, 0]);
        assert_eq!(scheduler.slot(), 1);
        assert_eq!(scheduler.frame(), 5);
    }

    #[test]
    fn buffers_alternate_by_step_parity() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 3));
        for k in 0..10u64 {
            let report = scheduler.step().unwrap();
            assert_eq!(report.read.index() as u64, k % 2);
            assert_eq!(report.write.index() as u64, (k + 1) % 2);
        }
        scheduler.backend_mut_wait_idle();
        let executed = scheduler.backend().executed();
        assert_eq!(executed.len(), 10);
        for frame in executed {
            assert_eq!(frame.set.parity, frame.read);
        }
    }

    #[test]
    fn acquired_image_drives_binding_and_presentation() {
        for order in [vec![1, 0], vec![2, 0, 1], vec![0, 2, 1, 1, 0, 2]] {
            let images = order.iter().copied().max().unwrap() + 1;
            let backend = HeadlessBackend::new(grid(), 2, images).with_acquire_order(order.clone());
            let mut scheduler = scheduler(backend);
            let mut reported = Vec::new();
            for _ in 0..order.len() * 2 {
                reported.push(scheduler.step().unwrap().image);
            }
            let expected: Vec<u32> = order.iter().cycle().take(reported.len()).copied().collect();
            assert_eq!(reported, expected);
            assert_eq!(scheduler.backend().presented(), expected.as_slice());
            scheduler.backend_mut_wait_idle();
            for frame in scheduler.backend().executed() {
                assert_eq!(frame.set, BindingSetKey::for_frame(frame.image, frame.step));
            }
            assert!(
                scheduler.backend().violations().is_empty(),
                "{order:?}: {:?}",
                scheduler.backend().violations()
            );
        }
    }

    #[test]
    fn normalization_is_conserved_over_a_thousand_steps() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 3));
        let initial = scheduler.sample_norm().unwrap();
        let mut samples = vec![initial];
        for _ in 0..1000 {
            if let Some(sample) = scheduler.step().unwrap().sample {
                samples.push(sample);
            }
        }
        assert_eq!(samples.len(), 11);
        assert_eq!(samples[1].frame, 0);
        assert_eq!(samples[10].frame, 900);
        let drift = relative_drift(&samples).unwrap();
        assert!(drift < 0.01, "normalization drifted by {drift}");
        assert!(scheduler.backend().violations().is_empty());
    }

    #[test]
    fn off_cycle_sample_makes_writes_host_visible() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 2));
        let first = scheduler.step().unwrap();
        assert!(first.sample.is_some());
        let second = scheduler.step().unwrap();
        assert!(second.sample.is_none());

        let sample = scheduler.sample_norm().unwrap();
        assert_eq!(sample.frame, 1);
        assert!(
            scheduler.backend().violations().is_empty(),
            "{:?}",
            scheduler.backend().violations()
        );
        assert_eq!(scheduler.backend().host_flushes(), 1);
        let latest = scheduler.backend().field(scheduler.current_buffer());
        assert_eq!(sample.norm, normalization(latest, grid()));

        scheduler.sample_norm().unwrap();
        assert_eq!(scheduler.backend().host_flushes(), 1);
    }

    #[test]
    fn sampled_frames_need_no_extra_flush() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 3));
        scheduler.sample_norm().unwrap();
        scheduler.step().unwrap();
        scheduler.sample_norm().unwrap();
        assert_eq!(scheduler.backend().host_flushes(), 0);
        assert!(scheduler.backend().violations().is_empty());
    }

    #[test]
    fn identical_runs_produce_identical_fields() {
        let run = || {
            let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 3));
            for _ in 0..37 {
                scheduler.step().unwrap();
            }
            let buffer = scheduler.current_buffer();
            let mut backend = scheduler.into_backend();
            backend.wait_idle().unwrap();
            backend.field(buffer).to_vec()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn run_stops_on_close_and_drains() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 2));
        let mut events = ScriptedEvents::close_after(250);
        let mut sink = Vec::new();
        let summary = scheduler.run(&mut events, &mut sink).unwrap();
        assert_eq!(summary.frames, 250);
        assert_eq!(summary.samples, 3);
        assert_eq!(
            sink.iter().map(|s| s.frame).collect::<Vec<_>>(),
            [0, 100, 200]
        );
        assert_eq!(summary.last_norm, Some(sink[2].norm));
        assert_eq!(scheduler.backend().in_flight(), 0);
        assert_eq!(events.polls(), 251);
    }

    #[test]
    fn close_in_a_batch_wins_over_other_events() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 2));
        let mut events = ScriptedEvents::close_after(2).then(vec![
            SurfaceEvent::Resized {
                width: 10,
                height: 10,
            },
            SurfaceEvent::CloseRequested,
            SurfaceEvent::Focused(true),
        ]);
        let summary = scheduler.run(&mut events, &mut Vec::new()).unwrap();
        assert_eq!(summary.frames, 2);
    }

    #[test]
    fn resize_does_not_stop_the_loop() {
        let mut scheduler = scheduler(HeadlessBackend::new(grid(), 2, 2));
        let mut events = ScriptedEvents::default()
            .then(vec![SurfaceEvent::Resized {
                width: 1,
                height: 1,
            }])
            .then(vec![SurfaceEvent::Other]);
        let summary = scheduler.run(&mut events, &mut Vec::new()).unwrap();
        assert_eq!(summary.frames, 2);
    }

    #[test]
    fn surface_state_terminates_the_loop() {
        let backend = HeadlessBackend::new(grid(), 2, 2)
            .with_surface_failure(4, SurfaceStatus::OutOfDate);
        let mut scheduler = scheduler(backend);
        let mut events = ScriptedEvents::close_after(100);
        let err = scheduler.run(&mut events, &mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SurfaceState(SurfaceStatus::OutOfDate)
        ));
        assert_eq!(err.tier(), ErrorTier::SteadyState);
        assert_eq!(events.polls(), 5);
    }

    #[test]
    fn initial_state_must_match_backend_grid() {
        let other = Grid::new(4, 4).unwrap();
        let result = FrameScheduler::new(
            HeadlessBackend::new(grid(), 2, 2),
            &InitialState::vacuum(other),
            SchedulerSettings::default(),
        );
        assert!(matches!(result, Err(EngineError::GridMismatch { .. })));
    }

    impl FrameScheduler<HeadlessBackend> {
        fn backend_mut_wait_idle(&mut self) {
            self.backend.wait_idle().unwrap();
        }
    }
}
