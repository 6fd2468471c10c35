//! Simulation grid and host-side field data.
//!
//! The field is a dense row-major array of complex amplitudes, one per grid
//! cell. The potential is given as real values with the same layout, but the
//! device program reads it with the field's element type, so it is widened to
//! [`Amplitude`] with a zero imaginary part on upload. Both are uploaded once
//! before the frame loop starts.

use std::ops::Mul;

use bytemuck::{Pod, Zeroable};

use crate::error::{EngineError, EngineResult};

/// A complex amplitude as stored in device memory: two consecutive `f32`s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Amplitude {
    /// Real part.
    pub re: f32,
    /// Imaginary part.
    pub im: f32,
}

impl Amplitude {
    /// The zero amplitude.
    pub const ZERO: Self = Self { re: 0.0, im: 0.0 };

    /// Creates an amplitude from its parts.
    #[must_use]
    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Creates `r · e^{iθ}`.
    #[must_use]
    pub fn from_polar(r: f32, theta: f32) -> Self {
        let (sin, cos) = theta.sin_cos();
        Self {
            re: r * cos,
            im: r * sin,
        }
    }

    /// Squared magnitude `|ψ|²`.
    #[must_use]
    pub fn norm_sqr(self) -> f32 {
        self.re * self.re + self.im * self.im
    }
}

impl Mul for Amplitude {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            re: self.re * rhs.re - self.im * rhs.im,
            im: self.re * rhs.im + self.im * rhs.re,
        }
    }
}

/// Dimensions of the simulation grid, in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Grid {
    /// Cells along x.
    pub width: u32,
    /// Cells along y.
    pub height: u32,
}

impl Grid {
    /// Edge length of the square compute workgroup the device program declares.
    pub const WORKGROUP_EXTENT: u32 = 32;

    /// Creates a grid, rejecting empty dimensions.
    pub fn new(width: u32, height: u32) -> EngineResult<Self> {
        if width == 0 || height == 0 {
            return Err(EngineError::Config(format!(
                "grid must be non-empty, got {width}x{height}"
            )));
        }
        Ok(Self { width, height })
    }

    /// Derives the grid from a window size and a resolution multiplier.
    pub fn from_viewport(width: u32, height: u32, scale: f64) -> EngineResult<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(EngineError::Config(format!(
                "simulation scale must be positive, got {scale}"
            )));
        }
        let scaled = |extent: u32| (f64::from(extent) * scale).round() as u32;
        Self::new(scaled(width), scaled(height))
    }

    /// Total number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Workgroup counts covering the whole grid; the last group on each axis
    /// may extend past the edge.
    #[must_use]
    pub fn workgroups(&self) -> [u32; 3] {
        [
            self.width.div_ceil(Self::WORKGROUP_EXTENT),
            self.height.div_ceil(Self::WORKGROUP_EXTENT),
            1,
        ]
    }

    /// Size in bytes of one field buffer.
    #[must_use]
    pub fn field_bytes(&self) -> u64 {
        (self.cells() * size_of::<Amplitude>()) as u64
    }

    /// Size in bytes of the potential buffer. Each cell holds one
    /// [`Amplitude`], the same as a field buffer.
    #[must_use]
    pub fn potential_bytes(&self) -> u64 {
        (self.cells() * size_of::<Amplitude>()) as u64
    }
}

/// Initial field and static potential, validated against a grid.
#[derive(Debug, Clone)]
pub struct InitialState {
    grid: Grid,
    field: Vec<Amplitude>,
    potential: Vec<f32>,
}

impl InitialState {
    /// Wraps row-major arrays, checking that both match the grid.
    pub fn new(grid: Grid, field: Vec<Amplitude>, potential: Vec<f32>) -> EngineResult<Self> {
        check_cells("field", field.len(), grid)?;
        check_cells("potential", potential.len(), grid)?;
        Ok(Self {
            grid,
            field,
            potential,
        })
    }

    /// Builds the state from 2D arrays indexed `[row][column]`.
    pub fn from_rows(field: &[Vec<Amplitude>], potential: &[Vec<f32>]) -> EngineResult<Self> {
        let height = field.len() as u32;
        let width = field.first().map_or(0, Vec::len) as u32;
        let grid = Grid::new(width, height)?;
        if field.iter().any(|row| row.len() != width as usize) {
            return Err(EngineError::Config("field rows differ in length".into()));
        }
        if potential.iter().any(|row| row.len() != width as usize) {
            return Err(EngineError::Config(
                "potential rows do not match the field width".into(),
            ));
        }
        Self::new(grid, field.concat(), potential.concat())
    }

    /// A field of zeros with zero potential.
    #[must_use]
    pub fn vacuum(grid: Grid) -> Self {
        Self {
            grid,
            field: vec![Amplitude::ZERO; grid.cells()],
            potential: vec![0.0; grid.cells()],
        }
    }

    /// Grid the state was validated against.
    #[must_use]
    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Row-major field amplitudes.
    #[must_use]
    pub fn field(&self) -> &[Amplitude] {
        &self.field
    }

    /// Row-major potential values.
    #[must_use]
    pub fn potential(&self) -> &[f32] {
        &self.potential
    }

    /// The potential in its device layout: `v + 0i` per cell.
    #[must_use]
    pub fn device_potential(&self) -> Vec<Amplitude> {
        self.potential
            .iter()
            .map(|&v| Amplitude::new(v, 0.0))
            .collect()
    }
}

fn check_cells(what: &'static str, actual: usize, grid: Grid) -> EngineResult<()> {
    if actual == grid.cells() {
        return Ok(());
    }
    Err(EngineError::GridMismatch {
        what,
        actual,
        expected: grid.cells(),
        width: grid.width,
        height: grid.height,
    })
}

/// Sum of `|ψ|²` over the field divided by the grid area.
///
/// Stays constant for a closed system with no probability flux across the
/// boundary, so drift points at the numerical kernel.
#[must_use]
pub fn normalization(field: &[Amplitude], grid: Grid) -> f64 {
    let total: f64 = field.iter().map(|a| f64::from(a.norm_sqr())).sum();
    total / grid.cells() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_cover_partial_tiles() {
        let grid = Grid::new(1600, 1600).unwrap();
        assert_eq!(grid.workgroups(), [50, 50, 1]);

        let grid = Grid::new(33, 31).unwrap();
        assert_eq!(grid.workgroups(), [2, 1, 1]);
    }

    #[test]
    fn viewport_scale_rounds_per_axis() {
        let grid = Grid::from_viewport(800, 600, 2.0).unwrap();
        assert_eq!((grid.width, grid.height), (1600, 1200));

        let grid = Grid::from_viewport(3, 3, 0.5).unwrap();
        assert_eq!((grid.width, grid.height), (2, 2));

        assert!(Grid::from_viewport(800, 800, 0.0).is_err());
        assert!(Grid::from_viewport(800, 800, f64::NAN).is_err());
        assert!(Grid::new(0, 4).is_err());
    }

    #[test]
    fn buffer_sizes_follow_element_layout() {
        let grid = Grid::new(4, 2).unwrap();
        assert_eq!(grid.field_bytes(), 64);
        assert_eq!(grid.potential_bytes(), grid.field_bytes());

        let grid = Grid::new(1600, 1600).unwrap();
        assert_eq!(grid.potential_bytes(), 20_480_000);
    }

    #[test]
    fn potential_widens_to_complex_cells() {
        let grid = Grid::new(3, 1).unwrap();
        let state =
            InitialState::new(grid, vec![Amplitude::ZERO; 3], vec![1.5, -2.0, 0.0]).unwrap();
        let device = state.device_potential();
        assert_eq!(
            device,
            [
                Amplitude::new(1.5, 0.0),
                Amplitude::new(-2.0, 0.0),
                Amplitude::ZERO,
            ]
        );
        let bytes: &[u8] = bytemuck::cast_slice(&device);
        assert_eq!(bytes.len() as u64, grid.potential_bytes());
        assert_eq!(&bytes[..4], &1.5f32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &0.0f32.to_ne_bytes());
    }

    #[test]
    fn initial_state_rejects_wrong_lengths() {
        let grid = Grid::new(2, 2).unwrap();
        let err = InitialState::new(grid, vec![Amplitude::ZERO; 3], vec![0.0; 4]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::GridMismatch {
                what: "field",
                actual: 3,
                expected: 4,
                ..
            }
        ));
        let err = InitialState::new(grid, vec![Amplitude::ZERO; 4], vec![0.0; 5]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::GridMismatch {
                what: "potential",
                ..
            }
        ));
    }

    #[test]
    fn rows_flatten_row_major() {
        let field = vec![
            vec![Amplitude::new(1.0, 0.0), Amplitude::new(2.0, 0.0)],
            vec![Amplitude::new(3.0, 0.0), Amplitude::new(4.0, 0.0)],
            vec![Amplitude::new(5.0, 0.0), Amplitude::new(6.0, 0.0)],
        ];
        let potential = vec![vec![0.0; 2]; 3];
        let state = InitialState::from_rows(&field, &potential).unwrap();
        assert_eq!(state.grid(), Grid::new(2, 3).unwrap());
        let re: Vec<f32> = state.field().iter().map(|a| a.re).collect();
        assert_eq!(re, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let field = vec![vec![Amplitude::ZERO; 2], vec![Amplitude::ZERO; 1]];
        let potential = vec![vec![0.0; 2]; 2];
        assert!(InitialState::from_rows(&field, &potential).is_err());
    }

    #[test]
    fn normalization_averages_squared_magnitude() {
        let grid = Grid::new(2, 2).unwrap();
        let field = [
            Amplitude::new(1.0, 0.0),
            Amplitude::new(0.0, 1.0),
            Amplitude::new(3.0, 4.0),
            Amplitude::ZERO,
        ];
        assert!((normalization(&field, grid) - 27.0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn polar_product_keeps_magnitude() {
        let a = Amplitude::from_polar(2.0, 0.3);
        let b = Amplitude::from_polar(1.0, 1.1);
        let product = a * b;
        assert!((product.norm_sqr() - 4.0).abs() < 1e-5);
        assert!((product.im.atan2(product.re) - 1.4).abs() < 1e-5);
    }
}
