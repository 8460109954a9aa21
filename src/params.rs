//! Sampler configuration
//!
//! A single immutable parameter context threaded through every component for
//! the lifetime of a top-level call. Nothing in the sampler reads global
//! state; whoever drives a catalog build owns one of these.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Selectable unconditional halo mass function shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum MassFunctionKind {
    /// Press-Schechter (the conditional form is extended PS, so this needs
    /// no rescaling).
    #[default]
    PressSchechter,
    /// Sheth-Tormen ellipsoidal-collapse fit.
    ShethTormen,
    /// Watson et al. 2013 FOF universal fit.
    WatsonFof,
    /// Watson et al. 2013 FOF fit with redshift-dependent coefficients.
    WatsonFofZ,
}

/// How the minimum source mass is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum MinMassMode {
    /// A fixed fraction (1/50) of the star-formation turnover mass.
    #[default]
    TurnoverFraction,
    /// Virial mass at the configured minimum virial temperature, with the
    /// mean molecular weight picked by ionization state.
    VirialTemperature,
}

/// Which generator backs each worker's random stream.
///
/// The default is a single robust engine for every stream; `Diverse` cycles
/// three ChaCha variants across workers for callers who want algorithmic
/// diversity between streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
pub enum EngineKind {
    #[default]
    ChaCha8,
    Diverse,
}

/// Immutable cosmological + astrophysical parameter set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplerConfig {
    // Cosmology
    /// Matter density parameter at z=0.
    pub omega_m: f64,
    /// Baryon density parameter at z=0.
    pub omega_b: f64,
    /// Dark energy density parameter at z=0 (flat universe assumed).
    pub omega_lambda: f64,
    /// Dimensionless Hubble constant (H0 / 100 km/s/Mpc).
    pub hubble: f64,
    /// RMS mass fluctuation in 8 Mpc/h spheres at z=0.
    pub sigma_8: f64,
    /// Effective logarithmic slope of sigma(M) (power-law approximation).
    pub sigma_index: f64,

    // Star formation
    /// Stellar fraction normalization at 1e10 solar masses.
    pub f_star10: f64,
    /// Power-law slope of the stellar fraction with halo mass.
    pub alpha_star: f64,
    /// Log-normal scatter of the stellar fraction (0 disables).
    pub sigma_star: f64,
    /// Log-normal scatter of the star formation rate (0 disables).
    pub sigma_sfr: f64,
    /// Star formation timescale as a fraction of the Hubble time.
    pub t_star: f64,
    /// Turnover mass below which star formation is suppressed (solar masses).
    pub m_turn: f64,
    /// Minimum virial temperature of star-forming halos (K), used by
    /// `MinMassMode::VirialTemperature`.
    pub ion_tvir_min: f64,

    // Switches
    pub mass_function: MassFunctionKind,
    /// Use interpolation tables instead of direct integration per condition.
    pub use_tables: bool,
    /// Draw single halos from the inverse-CDF table instead of rejection.
    /// Requires `use_tables`.
    pub inverse_sampling: bool,
    /// Use the mass-budget construction policy instead of count-then-sample.
    pub mass_budget_sampling: bool,
    pub min_mass_mode: MinMassMode,
    pub engine: EngineKind,
    /// Fixed worker-pool size; also the number of independent RNG streams.
    pub workers: usize,

    // Grid geometry
    /// Comoving box side length (Mpc).
    pub box_len: f64,
    /// Cells per side of the low-resolution sampling grid.
    pub lo_dim: usize,
    /// Cells per side of the high-resolution output coordinate grid.
    pub hi_dim: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            omega_m: 0.31,
            omega_b: 0.049,
            omega_lambda: 0.69,
            hubble: 0.68,
            sigma_8: 0.81,
            sigma_index: 0.25,
            f_star10: 0.05,
            alpha_star: 0.5,
            sigma_star: 0.5,
            sigma_sfr: 0.6,
            t_star: 0.5,
            m_turn: 5.0e8,
            ion_tvir_min: 5.0e4,
            mass_function: MassFunctionKind::PressSchechter,
            use_tables: true,
            inverse_sampling: false,
            mass_budget_sampling: false,
            min_mass_mode: MinMassMode::TurnoverFraction,
            engine: EngineKind::ChaCha8,
            workers: 4,
            box_len: 100.0,
            lo_dim: 32,
            hi_dim: 128,
        }
    }
}

impl SamplerConfig {
    /// Minimum source halo mass at the given redshift (solar masses).
    pub fn minimum_source_mass(&self, redshift: f64) -> f64 {
        match self.min_mass_mode {
            MinMassMode::TurnoverFraction => self.m_turn / 50.0,
            MinMassMode::VirialTemperature => {
                // mu = 1.22 for a neutral IGM, 0.6 once ionized
                let mu = if self.ion_tvir_min < 9.99999e3 { 1.22 } else { 0.6 };
                crate::cosmology::virial_temp_to_mass(self, redshift, self.ion_tvir_min, mu)
            }
        }
    }

    /// Side length of one low-resolution cell (Mpc).
    pub fn cell_len(&self) -> f64 {
        self.box_len / self.lo_dim as f64
    }
}
