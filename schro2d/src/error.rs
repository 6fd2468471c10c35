//! Error types for the engine.
//!
//! Failures fall into two tiers. Fatal errors describe an environment the
//! engine cannot work in (no device, no usable surface format, a missing
//! device program) and are reported once before the process ends. Steady-state
//! errors come out of the per-frame loop (a fence timeout, a surface that is no
//! longer optimal). A hardened engine would reconfigure the surface and resume
//! on those; this one still terminates, and [`EngineError::tier`] keeps the
//! distinction visible in logs.

use std::{io, path::PathBuf};

use ash::vk;

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// How severe an [`EngineError`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// The environment cannot run the engine; retrying will not help.
    Fatal,
    /// Raised by the running frame loop. Currently also terminates the run.
    SteadyState,
}

/// Non-success states reported by the presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// The swapchain still works but no longer matches the surface exactly.
    Suboptimal,
    /// The swapchain can no longer present to the surface.
    OutOfDate,
}

/// Every failure the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The Vulkan loader library could not be opened.
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    /// No physical device is exposed by the instance.
    #[error("no Vulkan device is available")]
    NoDevice,
    /// No device has a queue family supporting graphics, compute and presentation.
    #[error("no queue family supports graphics, compute and presentation")]
    NoQueueFamily,
    /// None of the offered surface formats can be used as a storage image.
    #[error("no usable surface format among {available} offered")]
    NoSurfaceFormat {
        /// Number of formats the surface offered.
        available: usize,
    },
    /// The surface does not allow storage usage on its images.
    #[error("presentable images do not support storage usage")]
    StorageUnsupported,
    /// The device program could not be read from disk.
    #[error("failed to read device program {}: {source}", path.display())]
    ProgramRead {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// The device program is not a valid SPIR-V word stream.
    #[error("device program {} is not valid SPIR-V: {source}", path.display())]
    ProgramInvalid {
        /// Path that was read.
        path: PathBuf,
        /// Parse failure reported by the SPIR-V reader.
        #[source]
        source: io::Error,
    },
    /// The memory allocator could not be created or could not place a buffer.
    #[error("device memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    /// A Vulkan entry point returned an error.
    #[error("{call} failed: {result}")]
    Vulkan {
        /// Name of the failing call.
        call: &'static str,
        /// Result code it returned.
        result: vk::Result,
    },
    /// The windowing event loop failed.
    #[error("event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),
    /// The window could not be created.
    #[error("window creation failed: {0}")]
    WindowCreation(#[from] winit::error::OsError),
    /// The window did not expose native handles.
    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] winit::raw_window_handle::HandleError),
    /// The event loop never delivered a window.
    #[error("the event loop did not produce a window")]
    WindowUnavailable,
    /// Initial data does not match the simulation grid.
    #[error("{what} has {actual} cells, the {width}x{height} grid needs {expected}")]
    GridMismatch {
        /// Which array was checked.
        what: &'static str,
        /// Cells provided.
        actual: usize,
        /// Cells required.
        expected: usize,
        /// Grid width.
        width: u32,
        /// Grid height.
        height: u32,
    },
    /// The configuration cannot describe a runnable engine.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Waiting on a frame slot's fence timed out.
    #[error("timed out waiting for frame slot {slot}")]
    FenceTimeout {
        /// Slot whose fence did not signal.
        slot: usize,
    },
    /// The surface reported a state that needs reconfiguration.
    #[error("presentation surface is {0:?}; surface reconfiguration is not implemented")]
    SurfaceState(SurfaceStatus),
}

impl EngineError {
    /// Classifies the error into its tier.
    #[must_use]
    pub fn tier(&self) -> ErrorTier {
        match self {
            Self::FenceTimeout { .. } | Self::SurfaceState(_) => ErrorTier::SteadyState,
            _ => ErrorTier::Fatal,
        }
    }
}

/// Attaches the failing entry point name to a raw [`vk::Result`].
pub(crate) trait VkResultExt<T> {
    fn during(self, call: &'static str) -> EngineResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn during(self, call: &'static str) -> EngineResult<T> {
        self.map_err(|result| EngineError::Vulkan { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_errors_are_tiered() {
        assert_eq!(
            EngineError::FenceTimeout { slot: 1 }.tier(),
            ErrorTier::SteadyState
        );
        assert_eq!(
            EngineError::SurfaceState(SurfaceStatus::Suboptimal).tier(),
            ErrorTier::SteadyState
        );
        assert_eq!(EngineError::NoQueueFamily.tier(), ErrorTier::Fatal);
        assert_eq!(
            EngineError::NoSurfaceFormat { available: 3 }.tier(),
            ErrorTier::Fatal
        );
    }

    #[test]
    fn vulkan_errors_name_the_call() {
        let err = Err::<(), _>(vk::Result::ERROR_DEVICE_LOST)
            .during("vkQueueSubmit2")
            .unwrap_err();
        assert_eq!(err.tier(), ErrorTier::Fatal);
        assert!(err.to_string().starts_with("vkQueueSubmit2 failed"));
    }

    #[test]
    fn grid_mismatch_reports_both_sizes() {
        let err = EngineError::GridMismatch {
            what: "potential",
            actual: 10,
            expected: 16,
            width: 4,
            height: 4,
        };
        assert_eq!(
            err.to_string(),
            "potential has 10 cells, the 4x4 grid needs 16"
        );
    }
}
