//! Cosmological background quantities and halo mass function shapes.
//!
//! This is the interface the sampler consumes from the power-spectrum side:
//! sigma(M), the linear growth factor, Hubble times and the selectable mass
//! function forms. Everything here is a pure function of the configuration,
//! with a self-contained default implementation: sigma(M) is a power law in
//! mass normalized to sigma_8, and the growth factor uses the Carroll, Press
//! & Turner fit. The sampling machinery only relies on sigma(M) decreasing
//! with mass, so swapping in a full transfer-function integration changes
//! numbers, not behavior.

use crate::error::{Result, SampleError};
use crate::params::{MassFunctionKind, SamplerConfig};

/// Critical linear overdensity for spherical collapse.
pub const DELTA_CRIT: f64 = 1.68647;

/// Critical density of the universe in Msun/Mpc^3, per h^2.
pub const RHO_CRIT_H2: f64 = 2.7754e11;

/// Hubble time 1/H0 in years, per 1/h.
const HUBBLE_TIME_YR: f64 = 9.778e9;

/// Mean comoving matter density (Msun/Mpc^3).
pub fn rho_mean(cfg: &SamplerConfig) -> f64 {
    RHO_CRIT_H2 * cfg.hubble * cfg.hubble * cfg.omega_m
}

/// Mass enclosed by a comoving sphere of radius `r` Mpc at mean density.
pub fn radius_to_mass(cfg: &SamplerConfig, r: f64) -> f64 {
    4.0 / 3.0 * std::f64::consts::PI * r.powi(3) * rho_mean(cfg)
}

/// Comoving radius enclosing mass `m` at mean density.
pub fn mass_to_radius(cfg: &SamplerConfig, m: f64) -> f64 {
    (3.0 * m / (4.0 * std::f64::consts::PI * rho_mean(cfg))).cbrt()
}

/// Mass scale of the sigma_8 normalization sphere (8 Mpc/h).
fn m_sigma8(cfg: &SamplerConfig) -> f64 {
    radius_to_mass(cfg, 8.0 / cfg.hubble)
}

/// RMS linear mass fluctuation at z=0 for the mass exp(lnm).
///
/// Power-law approximation sigma(M) = sigma_8 * (M / M_8)^(-sigma_index).
pub fn sigma_lnm(cfg: &SamplerConfig, lnm: f64) -> f64 {
    cfg.sigma_8 * (-cfg.sigma_index * (lnm - m_sigma8(cfg).ln())).exp()
}

/// d(sigma^2)/d(lnM) at z=0. Analytic under the power-law sigma(M).
pub fn dsigmasq_dlnm(cfg: &SamplerConfig, lnm: f64) -> f64 {
    let s = sigma_lnm(cfg, lnm);
    -2.0 * cfg.sigma_index * s * s
}

/// Dimensionless Hubble rate E(z) = H(z)/H0 for flat LCDM.
fn hubble_e(cfg: &SamplerConfig, z: f64) -> f64 {
    (cfg.omega_m * (1.0 + z).powi(3) + cfg.omega_lambda).sqrt()
}

/// Matter density parameter at redshift z.
pub fn omega_m_z(cfg: &SamplerConfig, z: f64) -> f64 {
    let e2 = cfg.omega_m * (1.0 + z).powi(3) + cfg.omega_lambda;
    cfg.omega_m * (1.0 + z).powi(3) / e2
}

/// Linear growth factor D(z), normalized so D(0) = 1.
///
/// Carroll, Press & Turner (1992) fitting form.
pub fn growth_factor(cfg: &SamplerConfig, z: f64) -> f64 {
    fn g(om: f64, ol: f64) -> f64 {
        2.5 * om / (om.powf(4.0 / 7.0) - ol + (1.0 + om / 2.0) * (1.0 + ol / 70.0))
    }
    let e2 = cfg.omega_m * (1.0 + z).powi(3) + cfg.omega_lambda;
    let om_z = cfg.omega_m * (1.0 + z).powi(3) / e2;
    let ol_z = cfg.omega_lambda / e2;
    g(om_z, ol_z) / ((1.0 + z) * g(cfg.omega_m, cfg.omega_lambda))
}

/// Hubble time 1/H(z) in years.
pub fn hubble_time(cfg: &SamplerConfig, z: f64) -> f64 {
    HUBBLE_TIME_YR / cfg.hubble / hubble_e(cfg, z)
}

/// Virial mass for a given virial temperature (Barkana & Loeb 2001),
/// `mu` the mean molecular weight.
pub fn virial_temp_to_mass(cfg: &SamplerConfig, z: f64, tvir: f64, mu: f64) -> f64 {
    let om_z = omega_m_z(cfg, z);
    let d = om_z - 1.0;
    let delta_vir = 18.0 * std::f64::consts::PI.powi(2) + 82.0 * d - 39.0 * d * d;
    let density_term =
        (cfg.omega_m / om_z * delta_vir / (18.0 * std::f64::consts::PI.powi(2))).powf(-0.5);
    1.0e8 / cfg.hubble
        * (tvir / 1.98e4 * 0.6 / mu * 10.0 / (1.0 + z)).powf(1.5)
        * density_term
}

/// Mo & White (1996) fit mapping a nonlinear (Eulerian) overdensity to the
/// linear overdensity that produces it.
pub fn nonlinear_to_linear(delta_nl: f64) -> f64 {
    let d = 1.0 + delta_nl;
    -1.35 * d.powf(-2.0 / 3.0) + 0.78785 * d.powf(-0.58661) - 1.12431 * d.powf(-0.5) + 1.68647
}

/// Collapsed mass fraction above exp(lnm) in a biased region.
///
/// `del_bias` and `sig_bias` describe the condition: its linear overdensity
/// extrapolated to z=0 and sigma at its filter scale. A condition already
/// past critical density at this redshift is out of domain.
pub fn collapsed_fraction(
    cfg: &SamplerConfig,
    z: f64,
    lnm: f64,
    del_bias: f64,
    sig_bias: f64,
) -> Result<f64> {
    let sig_small = sigma_lnm(cfg, lnm);
    let del = DELTA_CRIT / growth_factor(cfg, z) - del_bias;
    if del < 0.0 {
        return Err(SampleError::InvalidValue {
            context: "collapsed fraction: condition past critical density",
            value: del,
        });
    }
    // Condition mass close enough to the minimum that the sigmas agree to
    // float precision: no room for progenitors.
    if sig_small <= sig_bias {
        return Ok(0.0);
    }
    let sig = (sig_small * sig_small - sig_bias * sig_bias).sqrt();
    Ok(libm::erfc(del / (std::f64::consts::SQRT_2 * sig)))
}

/// Unconditional halo mass function dN/dlnM in Mpc^-3 for the selected shape.
pub fn unconditional_dndlnm(
    cfg: &SamplerConfig,
    kind: MassFunctionKind,
    z: f64,
    growth: f64,
    lnm: f64,
) -> f64 {
    let m = lnm.exp();
    let sigma_z = sigma_lnm(cfg, lnm) * growth;
    let nu = DELTA_CRIT / sigma_z;
    let f = match kind {
        MassFunctionKind::PressSchechter => {
            (2.0 / std::f64::consts::PI).sqrt() * nu * (-nu * nu / 2.0).exp()
        }
        MassFunctionKind::ShethTormen => {
            const A: f64 = 0.322;
            const LITTLE_A: f64 = 0.707;
            const P: f64 = 0.3;
            let anu2 = LITTLE_A * nu * nu;
            A * (2.0 * LITTLE_A / std::f64::consts::PI).sqrt()
                * nu
                * (1.0 + anu2.powf(-P))
                * (-anu2 / 2.0).exp()
        }
        MassFunctionKind::WatsonFof => {
            const A: f64 = 0.282;
            const ALPHA: f64 = 2.163;
            const BETA: f64 = 1.406;
            const GAMMA: f64 = 1.210;
            A * ((BETA / sigma_z).powf(ALPHA) + 1.0) * (-GAMMA / (sigma_z * sigma_z)).exp()
        }
        MassFunctionKind::WatsonFofZ => {
            let om_z = omega_m_z(cfg, z);
            let a = om_z * (1.097 * (1.0 + z).powf(-3.216) + 0.074);
            let alpha = om_z * (3.136 * (1.0 + z).powf(-3.058) + 2.349);
            let beta = om_z * (5.907 * (1.0 + z).powf(-3.599) + 2.344);
            const GAMMA: f64 = 1.318;
            a * ((beta / sigma_z).powf(alpha) + 1.0) * (-GAMMA / (sigma_z * sigma_z)).exp()
        }
    };
    // dN/dlnM = rho_m / M * f(sigma) * dln(1/sigma)/dlnM
    rho_mean(cfg) / m * f * cfg.sigma_index
}

/// Conditional (extended Press-Schechter) mass function for progenitors of
/// mass exp(lnm) inside a condition of filter mass exp(lnm_filter) and
/// linear overdensity `delta_lin` at the epoch with growth factor `growth`.
///
/// Returns (1/M) dfcoll/dlnM, so the expected count in a condition is
/// rho_m * V * (1+delta_v) * integral of this over lnM.
pub fn conditional_dndlnm(
    cfg: &SamplerConfig,
    growth: f64,
    lnm: f64,
    lnm_filter: f64,
    delta_lin: f64,
    sigma_filter: f64,
) -> f64 {
    if lnm > lnm_filter {
        return 0.0;
    }
    let s1 = sigma_lnm(cfg, lnm).powi(2);
    let s2 = sigma_filter * sigma_filter;
    if s1 <= s2 {
        return 0.0;
    }
    let del = (DELTA_CRIT - delta_lin) / growth;
    if del <= 0.0 {
        return 0.0;
    }
    let sdiff = s1 - s2;
    let dsdlnm = 2.0 * cfg.sigma_index * s1;
    del / (2.0 * std::f64::consts::PI).sqrt() * dsdlnm * sdiff.powf(-1.5)
        * (-del * del / (2.0 * sdiff)).exp()
        / lnm.exp()
}
