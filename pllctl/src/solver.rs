//! M/N/PL search
//!
//! The PLL produces `reference * N / M` at its VCO and divides that by the
//! factor selected by PL:
//!
//! ```text
//! u      = reference / M
//! vco    = u * N
//! output = vco / divider[PL]
//! ```
//!
//! [`solve`] walks the post dividers from the largest useful factor down and,
//! for each one, only the one or two N values that bracket the target VCO
//! frequency. [`Fit::Fast`] additionally accepts the first candidate that is
//! within [`FAST_MATCH_RATIO`] of the target.

use fugit::HertzU32;

use crate::bounds::{DividerTable, PllBounds};

/// Early exit threshold of [`Fit::Fast`].
///
/// A candidate is accepted once `vco / delta` exceeds this value, i.e. when
/// the output error is below roughly 0.46 % of the VCO frequency. The value
/// was tuned empirically on the GK20A GPC PLL.
pub const FAST_MATCH_RATIO: u64 = 218;

/// How hard [`solve`] tries.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fit {
    /// Search until the closest achievable frequency is found.
    Best,
    /// Stop at the first candidate within [`FAST_MATCH_RATIO`].
    Fast,
}

/// No M/N/PL combination satisfies the bounds.
///
/// This points at a broken [`PllBounds`] description rather than a runtime
/// condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SolveError {
    /// The search found no candidate.
    Unsatisfiable,
}

/// Coefficients programmed into the PLL.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Coefficients {
    /// Reference divider
    pub m: u32,
    /// Feedback multiplier
    pub n: u32,
    /// Post divider index
    pub pl: u32,
}

impl Coefficients {
    /// Output frequency these coefficients produce from `reference`.
    ///
    /// Returns `None` if `m` is zero or `pl` is not in `table`.
    pub fn output_frequency(&self, reference: HertzU32, table: &DividerTable) -> Option<HertzU32> {
        let divisor = u64::from(self.m) * u64::from(table.factor(self.pl)?);
        let hz = (u64::from(reference.to_Hz()) * u64::from(self.n)).checked_div(divisor)?;
        u32::try_from(hz).ok().map(HertzU32::from_raw)
    }

    /// Whether every coefficient lies within `bounds`.
    pub fn within(&self, bounds: &PllBounds) -> bool {
        bounds.m.contains(&self.m) && bounds.n.contains(&self.n) && bounds.pl.contains(&self.pl)
    }
}

/// Coefficients together with the frequency they produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Solution {
    /// Coefficients
    pub coefficients: Coefficients,
    /// Achieved output frequency, truncated to whole hertz.
    pub frequency: HertzU32,
}

/// Find the coefficients whose output comes closest to `target`.
///
/// The output of each candidate is rounded half-up before it is compared
/// with `target`; the returned frequency is the truncated exact output.
/// Among equally close candidates the one with the larger post divider
/// (lower VCO) wins.
///
/// ```
/// use fugit::HertzU32;
/// use pllctl::bounds::{GK20A_DIVIDERS, GK20A_GPCPLL_BOUNDS};
/// use pllctl::solver::{solve, Coefficients, Fit};
///
/// let solution = solve(
///     &GK20A_GPCPLL_BOUNDS,
///     &GK20A_DIVIDERS,
///     HertzU32::MHz(12),
///     HertzU32::MHz(852),
///     Fit::Best,
/// )
/// .unwrap();
/// assert_eq!(solution.coefficients, Coefficients { m: 1, n: 142, pl: 1 });
/// assert_eq!(solution.frequency, HertzU32::MHz(852));
/// ```
pub fn solve(
    bounds: &PllBounds,
    table: &DividerTable,
    reference: HertzU32,
    target: HertzU32,
    fit: Fit,
) -> Result<Solution, SolveError> {
    search(bounds, table, reference, target, fit, false)
}

/// Find the coefficients whose output comes closest to `ceiling` without
/// exceeding it.
///
/// Unlike [`solve`], the truncated output is compared with `ceiling` and
/// every post divider in `bounds` is tried.
///
/// ```
/// use fugit::HertzU32;
/// use pllctl::bounds::{GK20A_DIVIDERS, GK20A_GPCPLL_BOUNDS};
/// use pllctl::solver::{solve_at_most, Coefficients};
///
/// // 1005 MHz sits between 12 MHz x 83 and 12 MHz x 84.
/// let solution = solve_at_most(
///     &GK20A_GPCPLL_BOUNDS,
///     &GK20A_DIVIDERS,
///     HertzU32::MHz(12),
///     HertzU32::MHz(1005),
/// )
/// .unwrap();
/// assert_eq!(solution.coefficients, Coefficients { m: 1, n: 166, pl: 1 });
/// assert_eq!(solution.frequency, HertzU32::MHz(996));
/// ```
pub fn solve_at_most(
    bounds: &PllBounds,
    table: &DividerTable,
    reference: HertzU32,
    ceiling: HertzU32,
) -> Result<Solution, SolveError> {
    search(bounds, table, reference, ceiling, Fit::Best, true)
}

fn search(
    bounds: &PllBounds,
    table: &DividerTable,
    reference: HertzU32,
    target: HertzU32,
    fit: Fit,
    at_most: bool,
) -> Result<Solution, SolveError> {
    let reference_hz = u64::from(reference.to_Hz());
    let target_hz = u64::from(target.to_Hz());
    if reference_hz == 0 || target_hz == 0 {
        return Err(SolveError::Unsatisfiable);
    }

    let vco_min = u64::from(bounds.vco.start().to_Hz());
    let vco_max = u64::from(bounds.vco.end().to_Hz());
    let u_min = u64::from(bounds.u.start().to_Hz());
    let u_max = u64::from(bounds.u.end().to_Hz());
    let n_min = u64::from(*bounds.n.start());
    let n_max = u64::from(*bounds.n.end());

    let (low_pl, high_pl) = if at_most {
        (*bounds.pl.start(), *bounds.pl.end())
    } else {
        // Aim 2% above the target to leave headroom in the VCO.
        let headroom_vco = target_hz + target_hz / 50;
        let vco_ceiling = vco_max.max(headroom_vco);

        let factor_min =
            u64::from(table.factor(*bounds.pl.start()).ok_or(SolveError::Unsatisfiable)?);
        let factor_max =
            u64::from(table.factor(*bounds.pl.end()).ok_or(SolveError::Unsatisfiable)?);
        let high_factor = vco_ceiling
            .div_ceil(headroom_vco)
            .min(factor_max)
            .max(factor_min);
        let low_factor = (vco_min / headroom_vco).min(factor_max).max(factor_min);
        (
            table.first_at_least(low_factor, &bounds.pl),
            table.first_at_least(high_factor, &bounds.pl),
        )
    };

    #[cfg(feature = "defmt")]
    defmt::trace!("pl search window {}..={}", low_pl, high_pl);

    let mut best: Option<(Coefficients, u64)> = None;

    'search: for pl in (low_pl..=high_pl).rev() {
        let Some(divider) = table.factor(pl).map(u64::from) else {
            continue;
        };
        let target_vco = target_hz * divider;

        for m in bounds.m.clone() {
            let m_wide = u64::from(m);
            let Some(u) = reference_hz.checked_div(m_wide) else {
                continue;
            };
            // u only shrinks as m grows.
            if u < u_min {
                break;
            }
            if u > u_max {
                continue;
            }

            let scaled = target_vco.saturating_mul(m_wide);
            let mut n_lo = scaled / reference_hz;
            let mut n_hi = scaled.div_ceil(reference_hz);
            if at_most {
                // Largest N that keeps both the output and the VCO in range.
                n_lo = n_lo
                    .min(vco_max.saturating_mul(m_wide) / reference_hz)
                    .min(n_max);
                n_hi = n_lo;
            } else if n_lo > n_max {
                break;
            }

            for n in n_lo..=n_hi {
                if n < n_min {
                    continue;
                }
                if n > n_max {
                    break;
                }

                let vco = reference_hz * n / m_wide;
                if vco < vco_min || vco > vco_max {
                    continue;
                }

                let delta = if at_most {
                    match target_hz.checked_sub(vco / divider) {
                        Some(below) => below,
                        None => continue,
                    }
                } else {
                    let rounded = (vco + divider / 2) / divider;
                    rounded.abs_diff(target_hz)
                };
                if best.is_some_and(|(_, best_delta)| delta >= best_delta) {
                    continue;
                }

                // n is bounded by n_max, which fits the register field.
                let candidate = Coefficients {
                    m,
                    n: n as u32,
                    pl,
                };
                best = Some((candidate, delta));

                if delta == 0 || (fit == Fit::Fast && vco / delta > FAST_MATCH_RATIO) {
                    break 'search;
                }

                #[cfg(feature = "defmt")]
                defmt::trace!(
                    "delta {} @ M {}, N {}, PL {}",
                    delta,
                    candidate.m,
                    candidate.n,
                    candidate.pl
                );
            }
        }
    }

    let (coefficients, _delta) = best.ok_or(SolveError::Unsatisfiable)?;

    #[cfg(feature = "defmt")]
    if fit == Fit::Best && _delta != 0 {
        defmt::debug!("no exact match for target {}", target);
    }

    let frequency = coefficients
        .output_frequency(reference, table)
        .ok_or(SolveError::Unsatisfiable)?;

    #[cfg(feature = "defmt")]
    defmt::debug!(
        "pll target {} -> {}: M {}, N {}, PL {}",
        target,
        frequency,
        coefficients.m,
        coefficients.n,
        coefficients.pl
    );

    Ok(Solution {
        coefficients,
        frequency,
    })
}
