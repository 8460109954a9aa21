//! Stochastic halo-population sampler.
//!
//! Samples discrete halo catalogs from the conditional halo mass function:
//! fresh catalogs from a density grid, and progenitor catalogs by splitting
//! an existing catalog backwards in cosmic time.

pub mod catalog;
pub mod cosmology;
pub mod error;
pub mod grid;
pub mod integrate;
pub mod params;
pub mod properties;
pub mod rng;
pub mod sampling;
pub mod tables;

pub use catalog::{build_halo_catalog, update_halo_catalog, HaloCatalog};
pub use error::{Result, SampleError};
pub use grid::{DensityGrid, GridKind};
pub use params::SamplerConfig;
