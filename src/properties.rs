//! Stochastic baryonic properties per halo.
//!
//! Stellar mass follows a power law in halo mass with an exponential
//! duty-cycle suppression below the turnover mass, with optional log-normal
//! scatter; the star formation rate divides the stellar mass by a configured
//! fraction of the Hubble time, with its own scatter. Both scatters are
//! mean-preserving: a delta function given log-normal scatter would
//! otherwise grow its mean, since doubling is as likely as halving.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::cosmology;
use crate::params::SamplerConfig;

/// Correlation between a progenitor's scatter and its descendant's.
/// Deliberately zero until a correlation model is chosen: the blending
/// algebra in `update_properties` is exercised but inert.
const PROGENITOR_PROPERTY_CORR: f64 = 0.0;

/// Baryonic properties carried per halo.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HaloProperties {
    /// Stellar mass (solar masses).
    pub stellar_mass: f64,
    /// Star formation rate (solar masses per year).
    pub sfr: f64,
}

/// Draw fresh properties for a halo of the given mass.
pub fn sample_properties(
    cfg: &SamplerConfig,
    halo_mass: f64,
    redshift: f64,
    rng: &mut impl Rng,
) -> HaloProperties {
    // Duty cycle folded into the mean for now rather than drawn as an
    // on/off state per halo.
    let duty_cycle = (-cfg.m_turn / halo_mass).exp();
    let fstar_mean = cfg.f_star10 * (halo_mass / 1e10).powf(cfg.alpha_star) * duty_cycle;

    let baryon_fraction = cfg.omega_b / cfg.omega_m;
    let stellar_mass = if cfg.sigma_star > 0.0 {
        let draw: f64 = rng.sample(StandardNormal);
        // exp(-sigma^2/2) keeps the log-normal mean at the noiseless value.
        let f = fstar_mean
            * (-cfg.sigma_star * cfg.sigma_star / 2.0 + draw * cfg.sigma_star).exp();
        halo_mass * baryon_fraction * f.min(1.0)
    } else {
        halo_mass * baryon_fraction * fstar_mean.min(1.0)
    };

    let sfr_mean = stellar_mass / (cfg.t_star * cosmology::hubble_time(cfg, redshift));
    let sfr = if cfg.sigma_sfr > 0.0 {
        let draw: f64 = rng.sample(StandardNormal);
        sfr_mean * (-cfg.sigma_sfr * cfg.sigma_sfr / 2.0 + draw * cfg.sigma_sfr).exp()
    } else {
        sfr_mean
    };

    HaloProperties { stellar_mass, sfr }
}

/// Derive a progenitor's properties from its parent's.
///
/// Currently draws an independent sample and blends it with the parent's
/// rank through `PROGENITOR_PROPERTY_CORR`; with the coefficient at zero
/// the parent's values do not influence the output.
pub fn update_properties(
    cfg: &SamplerConfig,
    halo_mass: f64,
    parent_mass: f64,
    redshift: f64,
    parent_redshift: f64,
    parent: &HaloProperties,
    rng: &mut impl Rng,
) -> HaloProperties {
    let mut out = sample_properties(cfg, halo_mass, redshift, rng);
    let corr = PROGENITOR_PROPERTY_CORR;
    if corr == 0.0 {
        return out;
    }

    // Medians of the scatter-free relation at both masses; the scatter is
    // mass- and redshift-independent so the ratio maps the parent's CDF
    // position onto the progenitor's distribution.
    let mu_parent = (cfg.f_star10 * (parent_mass / 1e10).powf(cfg.alpha_star)).min(1.0)
        * parent_mass;
    let mu_prog = (cfg.f_star10 * (halo_mass / 1e10).powf(cfg.alpha_star)).min(1.0) * halo_mass;
    let matched_sm = mu_prog / mu_parent * parent.stellar_mass;
    out.stellar_mass *= 1.0 - corr * matched_sm / out.stellar_mass;

    let mu_sfr_parent = parent.stellar_mass / cosmology::hubble_time(cfg, parent_redshift);
    let mu_sfr_prog = out.stellar_mass / cosmology::hubble_time(cfg, redshift);
    let matched_sfr = mu_sfr_prog / mu_sfr_parent * parent.sfr;
    out.sfr *= 1.0 - corr * matched_sfr / out.sfr;

    out
}
