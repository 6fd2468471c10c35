use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use schro2d::{EngineConfig, FeatureToggles, Launcher};
use tracing::info;

mod packet;
use packet::WavePacket;

#[derive(Parser, Debug)]
#[command(name = "schro2d")]
#[command(version, about = "Real-time 2D Schrödinger solver", long_about = None)]
struct Cli {
    /// Window width in logical pixels
    #[arg(long, default_value_t = 800)]
    width: u32,
    /// Window height in logical pixels
    #[arg(long, default_value_t = 800)]
    height: u32,
    /// Simulation cells per window pixel
    #[arg(long, default_value_t = 2.0)]
    scale: f64,
    /// Time step per frame, in seconds
    #[arg(long, default_value_t = 1e-16)]
    dt: f32,
    /// Compiled SPIR-V compute program
    #[arg(long, default_value = "bin/schro.spv")]
    program: PathBuf,
    /// Frames the device may work on concurrently
    #[arg(long, default_value_t = 2)]
    frames_in_flight: usize,
    /// Frames between normalization samples
    #[arg(long, default_value_t = 100)]
    diagnostic_interval: u64,
    /// Enable the Khronos validation layer (default: on in debug builds)
    #[arg(long, value_name = "BOOL")]
    validation: Option<bool>,
    /// Enable portability enumeration (default: on for Apple targets)
    #[arg(long, value_name = "BOOL")]
    portability: Option<bool>,
    /// Packet centre x, in cells (default: grid centre)
    #[arg(long)]
    x0: Option<f64>,
    /// Packet centre y, in cells (default: grid centre)
    #[arg(long)]
    y0: Option<f64>,
    /// Packet energy, in eV
    #[arg(long, default_value_t = 1e-3)]
    energy: f64,
    /// Direction of travel, in radians from +x
    #[arg(long, default_value_t = 0.0)]
    angle: f64,
    /// Envelope width, in cells
    #[arg(long, default_value_t = 50.0)]
    sigma: f64,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let defaults = FeatureToggles::platform_default();
        EngineConfig {
            viewport_width: self.width,
            viewport_height: self.height,
            sim_scale: self.scale,
            time_step: self.dt,
            program_path: self.program.clone(),
            frames_in_flight: self.frames_in_flight,
            diagnostic_interval: self.diagnostic_interval,
            features: FeatureToggles {
                validation: self.validation.unwrap_or(defaults.validation),
                portability: self.portability.unwrap_or(defaults.portability),
            },
            ..Default::default()
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.engine_config();
    let grid = config.grid().context("invalid viewport")?;
    let centred = WavePacket::centred(grid);
    let packet = WavePacket {
        x0: cli.x0.unwrap_or(centred.x0),
        y0: cli.y0.unwrap_or(centred.y0),
        energy: cli.energy,
        angle: cli.angle,
        sigma: cli.sigma,
    };
    let initial = packet
        .initial_state(grid)
        .context("failed to sample the initial state")?;

    let summary = Launcher::new(initial).config(config).run()?;
    info!(
        ?packet,
        frames = summary.frames,
        last_norm = ?summary.last_norm,
        "done"
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    run(&cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine_defaults() {
        let cli = Cli::parse_from(["schro2d"]);
        let config = cli.engine_config();
        let defaults = EngineConfig::default();
        assert_eq!(config.viewport_width, defaults.viewport_width);
        assert_eq!(config.sim_scale, defaults.sim_scale);
        assert_eq!(config.time_step, defaults.time_step);
        assert_eq!(config.program_path, defaults.program_path);
        assert_eq!(config.features, FeatureToggles::platform_default());
    }

    #[test]
    fn feature_flags_override_platform_defaults() {
        let cli = Cli::parse_from(["schro2d", "--validation", "false", "--portability", "true"]);
        let features = cli.engine_config().features;
        assert!(!features.validation);
        assert!(features.portability);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
