//! Gaussian wave packet initial condition.
//!
//! Lengths are in grid cells, which the device program treats as nanometres;
//! energies are in electronvolts.

use schro2d::{Amplitude, EngineResult, Grid, InitialState};

/// Reduced Planck constant, eV·s.
pub const HBAR: f64 = 6.582_119_569e-16;
/// Electron mass, eV/(nm/s)².
pub const ELECTRON_MASS: f64 = 5.685_630_111e-30;

/// A Gaussian envelope travelling as a plane wave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WavePacket {
    /// Centre, x.
    pub x0: f64,
    /// Centre, y.
    pub y0: f64,
    /// Kinetic energy of the carrier wave.
    pub energy: f64,
    /// Direction of travel, radians from +x.
    pub angle: f64,
    /// Envelope width.
    pub sigma: f64,
}

impl WavePacket {
    /// A packet at the centre of `grid` with the default energy and width.
    pub fn centred(grid: Grid) -> Self {
        Self {
            x0: f64::from(grid.width) / 2.0,
            y0: f64::from(grid.height) / 2.0,
            energy: 1e-3,
            angle: 0.0,
            sigma: 50.0,
        }
    }

    /// Carrier wave number, 1/nm.
    pub fn wave_number(&self) -> f64 {
        (2.0 * ELECTRON_MASS * self.energy).sqrt() / HBAR
    }

    /// ψ at cell `(x, y)`.
    pub fn amplitude(&self, x: f64, y: f64) -> Amplitude {
        let dx = x - self.x0;
        let dy = y - self.y0;
        let phase = self.wave_number() * (dx * self.angle.cos() + dy * self.angle.sin());
        let envelope = (-(dx * dx + dy * dy) / (4.0 * self.sigma * self.sigma)).exp();
        Amplitude::from_polar(envelope as f32, phase as f32)
    }

    /// The packet sampled over `grid`, in a zero potential.
    pub fn initial_state(&self, grid: Grid) -> EngineResult<InitialState> {
        let field = (0..grid.height)
            .flat_map(|y| (0..grid.width).map(move |x| (x, y)))
            .map(|(x, y)| self.amplitude(f64::from(x), f64::from(y)))
            .collect();
        InitialState::new(grid, field, vec![0.0; grid.cells()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> Grid {
        Grid::new(64, 48).unwrap()
    }

    #[test]
    fn peak_is_at_the_centre() {
        let packet = WavePacket::centred(grid());
        let peak = packet.amplitude(32.0, 24.0);
        assert!((peak.re - 1.0).abs() < 1e-6);
        assert!(peak.im.abs() < 1e-6);
    }

    #[test]
    fn envelope_falls_to_one_over_e_at_two_sigma() {
        let packet = WavePacket::centred(grid());
        let far = packet.amplitude(32.0, 24.0 + 2.0 * packet.sigma);
        let magnitude = far.norm_sqr().sqrt();
        assert!((f64::from(magnitude) - (-1.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn phase_advances_along_the_direction_of_travel() {
        let packet = WavePacket {
            angle: std::f64::consts::FRAC_PI_2,
            ..WavePacket::centred(grid())
        };
        let along_x = packet.amplitude(33.0, 24.0);
        assert!(along_x.im.abs() < 1e-6);
        let along_y = packet.amplitude(32.0, 25.0);
        let expected = packet.wave_number().sin() as f32;
        let magnitude = along_y.norm_sqr().sqrt();
        assert!((along_y.im / magnitude - expected).abs() < 1e-4);
    }

    #[test]
    fn default_wave_number_is_about_point_one_six() {
        let k = WavePacket::centred(grid()).wave_number();
        assert!((k - 0.162).abs() < 1e-3, "k = {k}");
    }

    #[test]
    fn initial_state_covers_the_grid_row_major() {
        let grid = grid();
        let packet = WavePacket::centred(grid);
        let state = packet.initial_state(grid).unwrap();
        assert_eq!(state.grid(), grid);
        assert_eq!(state.field().len(), grid.cells());
        assert!(state.potential().iter().all(|&v| v == 0.0));
        let index = 24 * grid.width as usize + 32;
        assert_eq!(state.field()[index], packet.amplitude(32.0, 24.0));
    }
}
