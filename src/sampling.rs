//! Single-halo samplers and catalog construction policies.
//!
//! A [`Condition`] describes one sampling context: a grid cell of given
//! overdensity and volume, or a parent halo being split into progenitors.
//! Two interchangeable single-halo samplers (rejection, inverse-table) feed
//! two construction policies: count-then-sample, which Poisson-draws the
//! halo count from the expected-count integral, and mass-budget, which draws
//! until the condition's collapsed mass is spent.

use log::debug;
use rand::Rng;
use rand_distr::{Distribution, Poisson};

use crate::cosmology::{self, DELTA_CRIT};
use crate::error::{Result, SampleError};
use crate::integrate::{integrate_mass_function, Shape};
use crate::params::{MassFunctionKind, SamplerConfig};
use crate::tables::{InverseCdfTable, SamplerTables, MIN_LOGPROB};

/// Iteration bound for the rejection sampler; it should need well under 20.
const MAX_DRAW_ATTEMPTS: u64 = 1000;

/// One sampling context: either a density-grid cell or a parent halo.
#[derive(Clone, Copy, Debug)]
pub struct Condition {
    /// True when the condition is a parent halo (update step).
    pub update: bool,
    pub redshift: f64,
    pub growth: f64,
    /// Linear overdensity at the output epoch.
    pub delta_lin: f64,
    /// Volumetric (nonlinear) overdensity; zero for Lagrangian cells and
    /// parent halos.
    pub delta_vol: f64,
    /// Comoving volume of the condition (Mpc^3).
    pub volume: f64,
    /// Log of the minimum source mass.
    pub lnm_min: f64,
    /// Log of the condition's total mass bound.
    pub lnm_max: f64,
    /// First-moment ratio of Press-Schechter to the configured unconditional
    /// mass function; rescales expected counts when they differ.
    pub ps_ratio: f64,
}

impl Condition {
    /// The coordinate this condition occupies in the lookup tables.
    pub fn table_coord(&self) -> f64 {
        if self.update {
            self.lnm_max
        } else {
            self.delta_lin
        }
    }
}

/// First-moment ratio between the Press-Schechter and the configured
/// unconditional mass function over the condition's mass range. The
/// conditional form is extended Press-Schechter, so sampling under another
/// shape rescales expected counts by this factor.
pub fn ps_ratio(
    cfg: &SamplerConfig,
    redshift: f64,
    growth: f64,
    lnm_min: f64,
    lnm_max: f64,
) -> Result<f64> {
    if cfg.mass_function == MassFunctionKind::PressSchechter {
        return Ok(1.0);
    }
    let ps = integrate_mass_function(
        cfg,
        Shape::Unconditional(MassFunctionKind::PressSchechter),
        redshift,
        growth,
        lnm_min,
        lnm_max,
        lnm_max,
        0.0,
        1,
    )?;
    let other = integrate_mass_function(
        cfg,
        Shape::Unconditional(cfg.mass_function),
        redshift,
        growth,
        lnm_min,
        lnm_max,
        lnm_max,
        0.0,
        1,
    )?;
    if other <= 0.0 {
        return Err(SampleError::InvalidValue {
            context: "mass function moment for rescaling",
            value: other,
        });
    }
    Ok(ps / other)
}

/// Draw one log mass by rejection against the conditional mass function.
///
/// `ymax` approximates the function's maximum as its value at the minimum
/// mass, which is what the acceptance box is sized by. This underestimates
/// the true peak for conditions very close to critical density; those are
/// diverted to the one-big-halo branch before sampling.
fn draw_lnm_rejection(
    cfg: &SamplerConfig,
    cond: &Condition,
    sigma_max: f64,
    ymax: f64,
    rng: &mut impl Rng,
) -> Result<f64> {
    for _ in 0..MAX_DRAW_ATTEMPTS {
        let lnm = rng.gen_range(cond.lnm_min..cond.lnm_max);
        let accept = rng.gen_range(0.0..ymax);
        let value = cosmology::conditional_dndlnm(
            cfg,
            cond.growth,
            lnm,
            cond.lnm_max,
            cond.delta_lin,
            sigma_max,
        );
        if accept < value {
            return Ok(lnm);
        }
    }
    Err(SampleError::Sampling {
        context: "rejection sampler",
        limit: MAX_DRAW_ATTEMPTS,
    })
}

/// Draw one log mass through the inverse-CDF table.
fn draw_lnm_inverse(
    table: &InverseCdfTable,
    coord: f64,
    rng: &mut impl Rng,
) -> Result<f64> {
    // Resample draws rarer than the tabulated tail.
    let mut log_prob = rng.gen::<f64>().ln();
    while log_prob < MIN_LOGPROB {
        log_prob = rng.gen::<f64>().ln();
    }
    let lnm = table.eval(coord, log_prob);
    if !lnm.is_finite() {
        return Err(SampleError::InvalidValue {
            context: "inverse table interpolation",
            value: lnm,
        });
    }
    Ok(lnm)
}

/// Dispatch one draw to the configured single-halo sampler.
fn draw_lnm(
    cfg: &SamplerConfig,
    cond: &Condition,
    tables: Option<&SamplerTables>,
    sigma_max: f64,
    ymax: f64,
    rng: &mut impl Rng,
) -> Result<f64> {
    if cfg.inverse_sampling {
        let table = tables
            .and_then(|t| t.inverse.as_ref())
            .ok_or(SampleError::Config {
                context: "inverse sampling requires interpolation tables",
            })?;
        draw_lnm_inverse(table, cond.table_coord(), rng)
    } else {
        draw_lnm_rejection(cfg, cond, sigma_max, ymax, rng)
    }
}

/// Sample the halo masses hosted by one condition using the configured
/// construction policy. Masses are in solar masses, unsorted.
pub fn sample_halo_masses(
    cfg: &SamplerConfig,
    cond: &Condition,
    tables: Option<&SamplerTables>,
    rng: &mut impl Rng,
) -> Result<Vec<f64>> {
    // Collapsed or empty conditions never reach a sampler. Both extremes
    // are reachable through Lagrangian linear evolution.
    if cond.delta_lin >= DELTA_CRIT {
        return Ok(vec![cond.lnm_max.exp()]);
    }
    if cond.delta_lin < -1.0 || cond.lnm_max <= cond.lnm_min {
        return Ok(Vec::new());
    }
    if cfg.mass_budget_sampling {
        sample_mass_budget(cfg, cond, tables, rng)
    } else {
        sample_count_then_mass(cfg, cond, tables, rng)
    }
}

/// Count-then-sample policy: Poisson halo count from the expected-count
/// integral, then that many independent mass draws.
fn sample_count_then_mass(
    cfg: &SamplerConfig,
    cond: &Condition,
    tables: Option<&SamplerTables>,
    rng: &mut impl Rng,
) -> Result<Vec<f64>> {
    let sigma_max = cosmology::sigma_lnm(cfg, cond.lnm_max);
    let ymax = cosmology::conditional_dndlnm(
        cfg,
        cond.growth,
        cond.lnm_min,
        cond.lnm_max,
        cond.delta_lin,
        sigma_max,
    );
    // Condition too close to the minimum mass to host anything.
    if ymax == 0.0 {
        return Ok(Vec::new());
    }

    let expected_per_mass = match tables {
        Some(t) => t.count.eval(cond.table_coord()),
        None => integrate_mass_function(
            cfg,
            Shape::Conditional,
            cond.redshift,
            cond.growth,
            cond.lnm_min,
            cond.lnm_max,
            cond.lnm_max,
            cond.delta_lin,
            0,
        )?,
    };
    let mean = expected_per_mass
        * cond.volume
        * cosmology::rho_mean(cfg)
        * (1.0 + cond.delta_vol)
        / cond.ps_ratio;
    if mean <= 0.0 {
        return Ok(Vec::new());
    }
    let poisson = Poisson::new(mean).map_err(|_| SampleError::InvalidValue {
        context: "Poisson mean",
        value: mean,
    })?;
    let n = poisson.sample(rng) as usize;
    debug!(
        "count policy: mean {mean:.3e} -> {n} halos (delta {:.3}, M_max {:.3e})",
        cond.delta_lin,
        cond.lnm_max.exp()
    );

    let mut masses = Vec::with_capacity(n);
    for _ in 0..n {
        let lnm = draw_lnm(cfg, cond, tables, sigma_max, ymax, rng)?;
        masses.push(lnm.exp());
    }
    Ok(masses)
}

/// Mass-budget policy: spend the condition's expected collapsed mass on
/// successive draws. Draws below the minimum mass still consume budget but
/// are not kept, so the output never invents mass; a draw overshooting the
/// remaining condition mass is capped rather than redrawn, which avoids
/// biasing toward small halos.
fn sample_mass_budget(
    cfg: &SamplerConfig,
    cond: &Condition,
    tables: Option<&SamplerTables>,
    rng: &mut impl Rng,
) -> Result<Vec<f64>> {
    let m_min = cond.lnm_min.exp();
    let m_max = cond.lnm_max.exp();
    let sigma_max = cosmology::sigma_lnm(cfg, cond.lnm_max);

    let frac = cosmology::collapsed_fraction(
        cfg,
        cond.redshift,
        cond.lnm_min,
        cond.delta_lin / cond.growth,
        sigma_max,
    )?;
    let mut budget = (m_max * frac / cond.ps_ratio).min(m_max);

    let ymax = cosmology::conditional_dndlnm(
        cfg,
        cond.growth,
        cond.lnm_min,
        cond.lnm_max,
        cond.delta_lin,
        sigma_max,
    );

    let draw_limit = (m_max / m_min) as u64;
    let mut draws: u64 = 0;
    let mut kept_mass = 0.0;
    let mut masses = Vec::new();
    while budget > m_min {
        let lnm = draw_lnm(cfg, cond, tables, sigma_max, ymax, rng)?;
        // Cap at the unassigned condition mass: re-drawing would skew small,
        // keeping the overshoot would invent mass.
        let m = lnm.exp().min(m_max - kept_mass);

        draws += 1;
        if draws >= draw_limit {
            return Err(SampleError::Sampling {
                context: "mass budget exhaustion",
                limit: draw_limit,
            });
        }

        budget -= m;
        if m > m_min {
            kept_mass += m;
            masses.push(m);
        }
    }
    Ok(masses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosmology::growth_factor;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn mean_density_condition(cfg: &SamplerConfig, z: f64, m_min: f64, m_max: f64) -> Condition {
        let growth = growth_factor(cfg, z);
        Condition {
            update: false,
            redshift: z,
            growth,
            delta_lin: 0.0,
            delta_vol: 0.0,
            volume: m_max / cosmology::rho_mean(cfg),
            lnm_min: m_min.ln(),
            lnm_max: m_max.ln(),
            ps_ratio: 1.0,
        }
    }

    #[test]
    fn collapsed_condition_is_one_big_halo() {
        let cfg = SamplerConfig::default();
        let mut cond = mean_density_condition(&cfg, 8.0, 1e8, 1e12);
        cond.delta_lin = DELTA_CRIT + 0.2;
        for seed in 0..5 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let masses = sample_halo_masses(&cfg, &cond, None, &mut rng).unwrap();
            assert_eq!(masses.len(), 1);
            assert!((masses[0] / 1e12 - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn underdense_condition_is_empty() {
        let cfg = SamplerConfig::default();
        let mut cond = mean_density_condition(&cfg, 8.0, 1e8, 1e12);
        cond.delta_lin = -1.5;
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert!(sample_halo_masses(&cfg, &cond, None, &mut rng)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn degenerate_mass_range_is_empty() {
        let cfg = SamplerConfig::default();
        let cond = mean_density_condition(&cfg, 8.0, 1e10, 1e10);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        assert!(sample_halo_masses(&cfg, &cond, None, &mut rng)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rejection_draws_stay_in_range() {
        let cfg = SamplerConfig::default();
        let cond = mean_density_condition(&cfg, 8.0, 1e9, 1e12);
        let sigma_max = cosmology::sigma_lnm(&cfg, cond.lnm_max);
        let ymax = cosmology::conditional_dndlnm(
            &cfg,
            cond.growth,
            cond.lnm_min,
            cond.lnm_max,
            cond.delta_lin,
            sigma_max,
        );
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..200 {
            let lnm = draw_lnm_rejection(&cfg, &cond, sigma_max, ymax, &mut rng).unwrap();
            assert!(lnm >= cond.lnm_min && lnm <= cond.lnm_max);
        }
    }

    #[test]
    fn mass_budget_never_exceeds_condition_mass() {
        let cfg = SamplerConfig {
            mass_budget_sampling: true,
            ..SamplerConfig::default()
        };
        for seed in 0..20 {
            let cond = mean_density_condition(&cfg, 8.0, 1e8, 1e12);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let masses = sample_halo_masses(&cfg, &cond, None, &mut rng).unwrap();
            let total: f64 = masses.iter().sum();
            assert!(total <= 1e12 * (1.0 + 1e-12), "seed {seed}: total {total:.4e}");
            for &m in &masses {
                assert!(m > 1e8, "kept a sub-minimum halo of {m:.3e}");
            }
        }
    }

    #[test]
    fn count_policy_matches_integral_prediction() {
        let cfg = SamplerConfig {
            use_tables: false,
            ..SamplerConfig::default()
        };
        let cond = mean_density_condition(&cfg, 8.0, 1e9, 1e11);
        let expected = integrate_mass_function(
            &cfg,
            Shape::Conditional,
            cond.redshift,
            cond.growth,
            cond.lnm_min,
            cond.lnm_max,
            cond.lnm_max,
            cond.delta_lin,
            0,
        )
        .unwrap()
            * cond.volume
            * cosmology::rho_mean(&cfg);
        assert!(expected > 0.5, "expected count {expected:.3} too small to test");

        let trials = 20_000;
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        let mut total = 0usize;
        for _ in 0..trials {
            total += sample_halo_masses(&cfg, &cond, None, &mut rng).unwrap().len();
        }
        let empirical = total as f64 / trials as f64;
        assert!(
            (empirical / expected - 1.0).abs() < 0.03,
            "empirical {empirical:.4} vs expected {expected:.4}"
        );
    }

    #[test]
    fn inverse_sampling_without_tables_is_an_error() {
        let cfg = SamplerConfig {
            inverse_sampling: true,
            use_tables: true,
            ..SamplerConfig::default()
        };
        let cond = mean_density_condition(&cfg, 8.0, 1e9, 1e12);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let err = sample_halo_masses(&cfg, &cond, None, &mut rng).unwrap_err();
        assert!(matches!(err, SampleError::Config { .. }));
    }

    #[test]
    fn inverse_draws_match_table_range() {
        let cfg = SamplerConfig {
            inverse_sampling: true,
            ..SamplerConfig::default()
        };
        let z = 8.0;
        let growth = growth_factor(&cfg, z);
        let cond = mean_density_condition(&cfg, z, 1e9, 1e13);
        let tables =
            SamplerTables::for_generation(&cfg, z, growth, cond.lnm_max, cond.lnm_min).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let masses = sample_halo_masses(&cfg, &cond, Some(&tables), &mut rng).unwrap();
        for &m in &masses {
            assert!(m >= 1e9 * 0.99 && m <= 1e13 * 1.01, "mass {m:.3e} out of range");
        }
    }
}
