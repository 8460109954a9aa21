//! 3D density grid container.
//!
//! Holds the single-precision overdensity field the fresh catalog build
//! samples from. The tag records whether cell values are Eulerian
//! (nonlinear, evolved) or Lagrangian (initial-condition) overdensities,
//! which decides how a cell is converted into a sampling condition.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridKind {
    /// Evolved density; converted to linear overdensity with the
    /// Mo & White fit, cell mass scaled by (1 + delta).
    Eulerian,
    /// Initial-condition density; scaled directly by the growth factor.
    Lagrangian,
}

/// A cubic grid of overdensities.
#[derive(Clone)]
pub struct DensityGrid {
    pub dim: usize,
    pub kind: GridKind,
    data: Vec<f32>,
}

impl DensityGrid {
    pub fn new(dim: usize, kind: GridKind) -> Self {
        Self {
            dim,
            kind,
            data: vec![0.0; dim * dim * dim],
        }
    }

    /// Wrap an existing field. Panics if the buffer is not dim^3.
    pub fn from_vec(dim: usize, kind: GridKind, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), dim * dim * dim, "density field size mismatch");
        Self { dim, kind, data }
    }

    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        (x * self.dim + y) * self.dim + z
    }

    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.data[self.index(x, y, z)]
    }

    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) {
        let idx = self.index(x, y, z);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cell coordinates for a flat index, row-major in (x, y, z).
    pub fn coords_of(&self, flat: usize) -> (usize, usize, usize) {
        let z = flat % self.dim;
        let y = (flat / self.dim) % self.dim;
        let x = flat / (self.dim * self.dim);
        (x, y, z)
    }

    /// Cell value at a flat index.
    pub fn value_at(&self, flat: usize) -> f32 {
        self.data[flat]
    }

    /// Mean overdensity of the field.
    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&v| v as f64).sum::<f64>() / self.data.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_index_roundtrip() {
        let mut grid = DensityGrid::new(4, GridKind::Lagrangian);
        grid.set(1, 2, 3, 0.5);
        for flat in 0..grid.len() {
            let (x, y, z) = grid.coords_of(flat);
            assert_eq!(grid.value_at(flat), grid.get(x, y, z));
        }
        assert_eq!(grid.get(1, 2, 3), 0.5);
    }

    #[test]
    fn mean_of_uniform_field() {
        let mut grid = DensityGrid::new(3, GridKind::Eulerian);
        grid.fill(-0.25);
        assert!((grid.mean() + 0.25).abs() < 1e-6);
    }
}
