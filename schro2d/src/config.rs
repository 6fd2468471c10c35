//! Engine configuration.
//!
//! [`EngineConfig`] carries every knob the engine reads at startup. Optional
//! platform behavior is not decided by scattered compile-time switches but by
//! an explicit [`FeatureToggles`] record, which expands into a list of
//! [`FeatureEffect`]s that instance and device creation apply by iteration.

use std::{ffi::CStr, path::PathBuf};

use ash::vk;

use crate::{
    error::{EngineError, EngineResult},
    field::Grid,
};

/// Configuration for a simulation run.
///
/// # Examples
///
/// ```
/// use schro2d::config::EngineConfig;
///
/// let config = EngineConfig {
///     viewport_width: 400,
///     viewport_height: 300,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// assert_eq!(config.grid().unwrap().width, 800);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Title of the presentation window.
    pub window_title: String,
    /// Window width in logical pixels.
    pub viewport_width: u32,
    /// Window height in logical pixels.
    pub viewport_height: u32,
    /// Grid cells per logical pixel along each axis.
    pub sim_scale: f64,
    /// Number of frame slots, the upper bound on frames in flight.
    pub frames_in_flight: usize,
    /// Simulated time advanced by one frame, in seconds.
    pub time_step: f32,
    /// Path of the precompiled SPIR-V device program.
    pub program_path: PathBuf,
    /// Frames between two normalization samples.
    pub diagnostic_interval: u64,
    /// Optional platform behavior.
    pub features: FeatureToggles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_title: "schro2d".to_string(),
            viewport_width: 800,
            viewport_height: 800,
            sim_scale: 2.0,
            frames_in_flight: 2,
            time_step: 1e-16,
            program_path: PathBuf::from("bin/schro.spv"),
            diagnostic_interval: 100,
            features: FeatureToggles::platform_default(),
        }
    }
}

impl EngineConfig {
    /// Rejects configurations no engine could run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.viewport_width == 0 || self.viewport_height == 0 {
            return Err(EngineError::Config(format!(
                "viewport must be non-empty, got {}x{}",
                self.viewport_width, self.viewport_height
            )));
        }
        if !self.time_step.is_finite() || self.time_step <= 0.0 {
            return Err(EngineError::Config(format!(
                "time step must be positive, got {}",
                self.time_step
            )));
        }
        if self.frames_in_flight == 0 {
            return Err(EngineError::Config(
                "at least one frame must be allowed in flight".into(),
            ));
        }
        if self.diagnostic_interval == 0 {
            return Err(EngineError::Config(
                "diagnostic interval must be at least one frame".into(),
            ));
        }
        self.grid().map(|_| ())
    }

    /// The simulation grid: the viewport scaled by [`Self::sim_scale`].
    pub fn grid(&self) -> EngineResult<Grid> {
        Grid::from_viewport(self.viewport_width, self.viewport_height, self.sim_scale)
    }
}

/// Optional platform behavior, decided at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureToggles {
    /// Enable the Khronos validation layer and route its messages into logs.
    pub validation: bool,
    /// Enumerate portability-subset implementations such as MoltenVK.
    pub portability: bool,
}

/// One concrete consequence of an enabled feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureEffect {
    /// An instance layer to enable.
    InstanceLayer(&'static CStr),
    /// An instance extension to enable.
    InstanceExtension(&'static CStr),
    /// A flag added to the instance creation flags.
    InstanceFlag(vk::InstanceCreateFlags),
    /// A device extension to enable.
    DeviceExtension(&'static CStr),
}

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

impl FeatureToggles {
    /// Validation in debug builds, portability on Apple targets.
    #[must_use]
    pub const fn platform_default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            portability: cfg!(any(target_os = "macos", target_os = "ios")),
        }
    }

    /// Every effect of the enabled features, in application order.
    #[must_use]
    pub fn effects(&self) -> Vec<FeatureEffect> {
        let mut effects = Vec::new();
        if self.validation {
            effects.push(FeatureEffect::InstanceLayer(VALIDATION_LAYER));
            effects.push(FeatureEffect::InstanceExtension(ash::ext::debug_utils::NAME));
        }
        if self.portability {
            effects.push(FeatureEffect::InstanceExtension(
                ash::khr::portability_enumeration::NAME,
            ));
            effects.push(FeatureEffect::InstanceExtension(
                ash::khr::get_physical_device_properties2::NAME,
            ));
            effects.push(FeatureEffect::InstanceFlag(
                vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR,
            ));
            effects.push(FeatureEffect::DeviceExtension(
                ash::khr::portability_subset::NAME,
            ));
        }
        effects
    }

    /// Instance layers requested by the enabled features.
    #[must_use]
    pub fn instance_layers(&self) -> Vec<&'static CStr> {
        self.effects()
            .into_iter()
            .filter_map(|effect| match effect {
                FeatureEffect::InstanceLayer(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Instance extensions requested by the enabled features.
    #[must_use]
    pub fn instance_extensions(&self) -> Vec<&'static CStr> {
        self.effects()
            .into_iter()
            .filter_map(|effect| match effect {
                FeatureEffect::InstanceExtension(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Instance creation flags requested by the enabled features.
    #[must_use]
    pub fn instance_flags(&self) -> vk::InstanceCreateFlags {
        self.effects()
            .into_iter()
            .fold(vk::InstanceCreateFlags::empty(), |flags, effect| match effect {
                FeatureEffect::InstanceFlag(flag) => flags | flag,
                _ => flags,
            })
    }

    /// Device extensions requested by the enabled features.
    #[must_use]
    pub fn device_extensions(&self) -> Vec<&'static CStr> {
        self.effects()
            .into_iter()
            .filter_map(|effect| match effect {
                FeatureEffect::DeviceExtension(name) => Some(name),
                _ => None,
            })
            .collect()
    }
}
