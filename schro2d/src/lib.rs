//! schro2d is a real-time solver for the two-dimensional time-dependent
//! Schrödinger equation that runs entirely on a Vulkan compute queue.
//!
//! Each displayed frame advances the wave function by one split-step time
//! step and writes a visualization straight into a presentable image. The
//! host only sequences frames; the field never leaves device-visible memory
//! except for the periodic normalization check.
//!
//! # Running
//!
//! ```no_run
//! use schro2d::{EngineConfig, InitialState, Launcher};
//!
//! # fn main() -> schro2d::EngineResult<()> {
//! let config = EngineConfig {
//!     viewport_width: 640,
//!     viewport_height: 480,
//!     ..Default::default()
//! };
//! let initial = InitialState::vacuum(config.grid()?);
//! Launcher::new(initial).config(config).run()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Frame loop
//!
//! [`FrameScheduler`] drives any [`FrameBackend`]. With `N` frame slots at
//! most `N` frames are in flight, and frame `k` reads field buffer `k mod 2`
//! while writing `(k + 1) mod 2`. The sub-stages inside a frame, the hand-off
//! between frames and the host readback are all separated by explicit
//! barriers carried in the recorded [`FramePlan`].
//!
//! The `testing` feature exposes the `headless` module, a CPU backend that checks
//! those rules while running a unitary stand-in for the device program.
#![deny(missing_docs, clippy::unwrap_used)]

pub mod backend;
pub mod binding;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod field;
pub mod gpu;
#[cfg(any(test, feature = "testing"))]
pub mod headless;
pub mod launch;
pub mod plan;
pub mod scheduler;
pub mod teardown;
pub mod window;

pub use ash;
pub use winit;

pub use crate::{
    backend::FrameBackend,
    binding::{BindingSetKey, FIELD_BINDINGS, FieldBuffer},
    config::{EngineConfig, FeatureToggles},
    diagnostics::{DiagnosticSink, NormSample, StdoutSink},
    error::{EngineError, EngineResult, ErrorTier},
    event::{EventSource, SurfaceEvent},
    field::{Amplitude, Grid, InitialState, normalization},
    gpu::VulkanBackend,
    launch::{Launcher, init_tracing},
    plan::{FramePlan, StepParameters},
    scheduler::{FrameReport, FrameScheduler, RunSummary, SchedulerSettings},
    window::WindowHost,
};
