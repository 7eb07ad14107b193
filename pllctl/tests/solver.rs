//! Coefficient search against known operating points.

mod common;

use pllctl::bounds::{PllBounds, GK20A_DIVIDERS, GK20A_GPCPLL_BOUNDS};
use pllctl::fugit::HertzU32;
use pllctl::solver::{solve, solve_at_most, Coefficients, Fit, SolveError};

const REFERENCE: HertzU32 = HertzU32::MHz(12);

fn gk20a(target: HertzU32, fit: Fit) -> Result<pllctl::Solution, SolveError> {
    solve(&GK20A_GPCPLL_BOUNDS, &GK20A_DIVIDERS, REFERENCE, target, fit)
}

#[test]
fn reaches_720_mhz_without_post_divider() {
    let solution = solve(
        &common::low_vco_bounds(),
        &common::dividers(),
        REFERENCE,
        HertzU32::MHz(720),
        Fit::Best,
    )
    .unwrap();
    assert_eq!(solution.coefficients, Coefficients { m: 1, n: 60, pl: 0 });
    assert_eq!(solution.frequency, HertzU32::MHz(720));
}

#[test]
fn prefers_larger_post_divider() {
    // 720 MHz is also 12 MHz x 60 / 1, but that VCO is below 1 GHz.
    let solution = gk20a(HertzU32::MHz(720), Fit::Best).unwrap();
    assert_eq!(solution.coefficients, Coefficients { m: 1, n: 120, pl: 1 });
    assert_eq!(solution.frequency, HertzU32::MHz(720));
}

#[test]
fn exact_operating_points() {
    let points = [
        (1248, Coefficients { m: 1, n: 104, pl: 0 }),
        (852, Coefficients { m: 1, n: 142, pl: 1 }),
        (600, Coefficients { m: 1, n: 150, pl: 2 }),
        (204, Coefficients { m: 1, n: 136, pl: 6 }),
    ];
    for (mhz, coefficients) in points {
        for fit in [Fit::Best, Fit::Fast] {
            let solution = gk20a(HertzU32::MHz(mhz), fit).unwrap();
            assert_eq!(solution.coefficients, coefficients, "{mhz} MHz, {fit:?}");
            assert_eq!(solution.frequency, HertzU32::MHz(mhz));
        }
    }
}

#[test]
fn best_fit_keeps_searching_after_a_good_candidate() {
    let target = HertzU32::MHz(725);

    let best = gk20a(target, Fit::Best).unwrap();
    assert_eq!(best.coefficients, Coefficients { m: 1, n: 121, pl: 1 });
    assert_eq!(best.frequency, HertzU32::MHz(726));

    // 1440 MHz / 5 MHz is already past the early exit threshold.
    let fast = gk20a(target, Fit::Fast).unwrap();
    assert_eq!(fast.coefficients, Coefficients { m: 1, n: 120, pl: 1 });
    assert_eq!(fast.frequency, HertzU32::MHz(720));
}

#[test]
fn solving_is_deterministic() {
    for mhz in [333, 500, 725, 1000] {
        let target = HertzU32::MHz(mhz);
        assert_eq!(gk20a(target, Fit::Best), gk20a(target, Fit::Best));
    }
}

#[test]
fn every_supported_rate_is_reachable() {
    let dividers = GK20A_DIVIDERS;
    for mhz in (204..=1248).step_by(4) {
        let target = HertzU32::MHz(mhz);
        let solution = gk20a(target, Fit::Best).unwrap();
        let c = solution.coefficients;

        assert!(c.within(&GK20A_GPCPLL_BOUNDS), "{mhz} MHz: {c:?}");

        let vco = HertzU32::from_raw(REFERENCE.to_Hz() * c.n / c.m);
        assert!(GK20A_GPCPLL_BOUNDS.vco.contains(&vco), "{mhz} MHz: vco {vco:?}");

        assert_eq!(
            Some(solution.frequency),
            c.output_frequency(REFERENCE, &dividers)
        );
        // One reference step at the VCO, spread over the post divider.
        assert!(
            solution.frequency.to_Hz().abs_diff(target.to_Hz()) <= REFERENCE.to_Hz(),
            "{mhz} MHz: got {:?}",
            solution.frequency
        );
    }
}

/// Smallest rounded distance to `target` over every M/N/PL in `bounds`.
fn closest_by_enumeration(bounds: &PllBounds, target: u64) -> u64 {
    let reference = u64::from(REFERENCE.to_Hz());
    let mut closest = u64::MAX;
    for m in bounds.m.clone().map(u64::from) {
        let u = HertzU32::from_raw((reference / m) as u32);
        if !bounds.u.contains(&u) {
            continue;
        }
        for n in bounds.n.clone().map(u64::from) {
            let vco = reference * n / m;
            if !bounds.vco.contains(&HertzU32::from_raw(vco as u32)) {
                continue;
            }
            for pl in bounds.pl.clone() {
                let divider = u64::from(GK20A_DIVIDERS.factor(pl).unwrap());
                let rounded = (vco + divider / 2) / divider;
                closest = closest.min(rounded.abs_diff(target));
            }
        }
    }
    closest
}

#[test]
fn best_fit_is_the_closest_achievable() {
    for khz in (204_000..=1_248_000).step_by(997) {
        let target = HertzU32::kHz(khz);
        let solution = gk20a(target, Fit::Best).unwrap();

        let c = solution.coefficients;
        let vco = u64::from(REFERENCE.to_Hz()) * u64::from(c.n) / u64::from(c.m);
        let divider = u64::from(GK20A_DIVIDERS.factor(c.pl).unwrap());
        let delta = ((vco + divider / 2) / divider).abs_diff(u64::from(target.to_Hz()));

        assert_eq!(
            delta,
            closest_by_enumeration(&GK20A_GPCPLL_BOUNDS, u64::from(target.to_Hz())),
            "{khz} kHz: {c:?}"
        );
    }
}

#[test]
fn at_most_never_overshoots() {
    for khz in (204_000..=1_248_000).step_by(1_009) {
        let ceiling = HertzU32::kHz(khz);
        let solution =
            solve_at_most(&GK20A_GPCPLL_BOUNDS, &GK20A_DIVIDERS, REFERENCE, ceiling).unwrap();
        let c = solution.coefficients;

        assert!(c.within(&GK20A_GPCPLL_BOUNDS), "{khz} kHz: {c:?}");
        assert!(solution.frequency <= ceiling, "{khz} kHz: {c:?}");
        assert_eq!(
            Some(solution.frequency),
            c.output_frequency(REFERENCE, &GK20A_DIVIDERS)
        );
        // Never further below than the nearest fit is away.
        let nearest = gk20a(ceiling, Fit::Best).unwrap();
        if nearest.frequency <= ceiling {
            assert_eq!(solution.frequency, nearest.frequency, "{khz} kHz");
        }
    }
}

#[test]
fn at_most_steps_down_past_the_vco_limit() {
    // Neither 12 MHz x 84 nor 12 MHz x 167 / 2 stays at or below 1005 MHz
    // inside the VCO range.
    let solution = solve_at_most(
        &GK20A_GPCPLL_BOUNDS,
        &GK20A_DIVIDERS,
        REFERENCE,
        HertzU32::MHz(1005),
    )
    .unwrap();
    assert_eq!(solution.coefficients, Coefficients { m: 1, n: 166, pl: 1 });
    assert_eq!(solution.frequency, HertzU32::MHz(996));

    let exact = solve_at_most(
        &GK20A_GPCPLL_BOUNDS,
        &GK20A_DIVIDERS,
        REFERENCE,
        HertzU32::MHz(852),
    )
    .unwrap();
    assert_eq!(exact.frequency, HertzU32::MHz(852));
}

#[test]
fn unreachable_comparison_frequency_is_unsatisfiable() {
    let bounds = PllBounds {
        u: HertzU32::MHz(20)..=HertzU32::MHz(38),
        ..GK20A_GPCPLL_BOUNDS
    };
    assert_eq!(
        solve(&bounds, &GK20A_DIVIDERS, REFERENCE, HertzU32::MHz(852), Fit::Best),
        Err(SolveError::Unsatisfiable)
    );
}

#[test]
fn zero_target_is_unsatisfiable() {
    assert_eq!(
        gk20a(HertzU32::from_raw(0), Fit::Best),
        Err(SolveError::Unsatisfiable)
    );
}
