//! Builder that wires the window, the Vulkan backend and the frame scheduler
//! together and runs them.
//!
//! ## Usage
//!
//! ```no_run
//! use schro2d::{config::EngineConfig, field::InitialState, launch::Launcher};
//!
//! # fn main() -> schro2d::error::EngineResult<()> {
//! let config = EngineConfig::default();
//! let initial = InitialState::vacuum(config.grid()?);
//! let summary = Launcher::new(initial).config(config).run()?;
//! println!("ran {} frames", summary.frames);
//! # Ok(())
//! # }
//! ```

use tracing::{error, info};

use crate::{
    config::EngineConfig,
    diagnostics::StdoutSink,
    error::{EngineError, EngineResult},
    field::InitialState,
    gpu::VulkanBackend,
    scheduler::{FrameScheduler, RunSummary, SchedulerSettings},
    window::WindowHost,
};

/// Builder for a simulation run.
#[derive(Debug)]
pub struct Launcher {
    initial: InitialState,
    config: EngineConfig,
}

impl Launcher {
    /// Creates a launcher for `initial` with the default configuration.
    pub fn new(initial: InitialState) -> Self {
        Self {
            initial,
            config: EngineConfig::default(),
        }
    }

    /// Overrides the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Opens the window and runs frames until it is closed.
    ///
    /// Normalization samples are printed to stdout. Every device object is
    /// released before this returns, on success and on error.
    pub fn run(self) -> EngineResult<RunSummary> {
        init_tracing();
        self.config.validate()?;
        let grid = self.config.grid()?;
        if self.initial.grid() != grid {
            return Err(EngineError::GridMismatch {
                what: "initial field",
                actual: self.initial.grid().cells(),
                expected: grid.cells(),
                width: grid.width,
                height: grid.height,
            });
        }
        info!(
            width = grid.width,
            height = grid.height,
            time_step = self.config.time_step,
            "starting simulation"
        );

        // Declared first so it outlives the backend's surface.
        let mut host = WindowHost::open(&self.config)?;
        let backend = VulkanBackend::new(host.window()?, &self.config)?;
        let settings = SchedulerSettings::from_config(&self.config);
        let mut scheduler = FrameScheduler::new(backend, &self.initial, settings)?;

        let summary = scheduler.run(&mut host, &mut StdoutSink);
        match &summary {
            Ok(summary) => info!(
                frames = summary.frames,
                samples = summary.samples,
                "simulation finished"
            ),
            Err(err) => error!(tier = ?err.tier(), "simulation aborted: {err}"),
        }
        drop(scheduler);
        summary
    }
}

/// Installs the global tracing subscriber.
///
/// [`Launcher::run`] calls this before anything else, so applications built
/// on the launcher do not need to. The filter comes from `RUST_LOG` when set.
/// Calling it again is harmless.
pub fn init_tracing() {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match tracing_subscriber::EnvFilter::try_new("warn,schro2d=info,schro2d_app=info")
        {
            Ok(filter) => filter,
            Err(_) => tracing_subscriber::EnvFilter::new("warn"),
        },
    };

    let _ = tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_installs_a_global_subscriber_once() {
        init_tracing();
        assert!(tracing::dispatcher::has_been_set());
        init_tracing();
        assert!(tracing::dispatcher::has_been_set());
    }

    #[test]
    fn mismatched_initial_state_is_rejected_before_opening_a_window() {
        let config = EngineConfig {
            viewport_width: 8,
            viewport_height: 8,
            sim_scale: 1.0,
            ..Default::default()
        };
        let initial = InitialState::vacuum(crate::field::Grid::new(4, 4).unwrap());
        let err = Launcher::new(initial).config(config).run().unwrap_err();
        assert!(matches!(err, EngineError::GridMismatch { expected: 64, .. }));
    }
}
