//! Adaptive quadrature of halo mass function moments.
//!
//! Evaluates integral of M^n * dN/dlnM over [lnM1, lnM2] for either an
//! unconditional shape or the conditional (extended Press-Schechter) form.
//! Adaptive Simpson subdivision with a 1% relative tolerance and a bounded
//! recursion depth; running out of depth is an unrecoverable
//! `SampleError::Integration` for the calling sampling pass.

use crate::cosmology;
use crate::error::{Result, SampleError};
use crate::params::{MassFunctionKind, SamplerConfig};

/// Relative tolerance on the moment integrals.
const REL_TOL: f64 = 0.01;

/// Maximum subdivision depth before giving up.
const MAX_DEPTH: u32 = 40;

/// Which mass function the integrand evaluates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
    /// One of the selectable unconditional forms.
    Unconditional(MassFunctionKind),
    /// Conditional form, parameterized by filter mass and linear overdensity.
    Conditional,
}

/// Order-`order` moment integral of the chosen mass function.
///
/// `lnm_filter` and `delta_lin` parameterize the conditional form and are
/// ignored for unconditional shapes. Returns 0 for an empty interval.
pub fn integrate_mass_function(
    cfg: &SamplerConfig,
    shape: Shape,
    redshift: f64,
    growth: f64,
    lnm_lo: f64,
    lnm_hi: f64,
    lnm_filter: f64,
    delta_lin: f64,
    order: i32,
) -> Result<f64> {
    if lnm_hi <= lnm_lo {
        return Ok(0.0);
    }
    let sigma_filter = cosmology::sigma_lnm(cfg, lnm_filter);
    let integrand = |lnm: f64| -> f64 {
        let mf = match shape {
            Shape::Unconditional(kind) => {
                cosmology::unconditional_dndlnm(cfg, kind, redshift, growth, lnm)
            }
            Shape::Conditional => {
                cosmology::conditional_dndlnm(cfg, growth, lnm, lnm_filter, delta_lin, sigma_filter)
            }
        };
        (order as f64 * lnm).exp() * mf
    };
    adaptive_simpson(&integrand, lnm_lo, lnm_hi)
}

/// Adaptive Simpson quadrature with relative tolerance `REL_TOL`.
fn adaptive_simpson(f: &impl Fn(f64) -> f64, a: f64, b: f64) -> Result<f64> {
    let m = 0.5 * (a + b);
    let fa = f(a);
    let fm = f(m);
    let fb = f(b);
    let whole = (b - a) / 6.0 * (fa + 4.0 * fm + fb);
    let eps = REL_TOL * whole.abs().max(f64::MIN_POSITIVE);
    refine(f, a, b, fa, fm, fb, whole, eps, MAX_DEPTH)
}

#[allow(clippy::too_many_arguments)]
fn refine(
    f: &impl Fn(f64) -> f64,
    a: f64,
    b: f64,
    fa: f64,
    fm: f64,
    fb: f64,
    whole: f64,
    eps: f64,
    depth: u32,
) -> Result<f64> {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = f(lm);
    let frm = f(rm);
    let left = (m - a) / 6.0 * (fa + 4.0 * flm + fm);
    let right = (b - m) / 6.0 * (fm + 4.0 * frm + fb);
    let delta = left + right - whole;
    if delta.abs() <= 15.0 * eps {
        return Ok(left + right + delta / 15.0);
    }
    if depth == 0 {
        return Err(SampleError::Integration {
            lower: a,
            upper: b,
            estimate: left + right,
        });
    }
    let half = 0.5 * eps;
    Ok(refine(f, a, m, fa, flm, fm, left, half, depth - 1)?
        + refine(f, m, b, fm, frm, fb, right, half, depth - 1)?)
}
