// ── Rates ───────────────────────────────────────────────────────────

/// `conversions / impressions × 100`, or 0 when there are no impressions.
pub fn conversion_rate(conversions: u64, impressions: u64) -> f64 {
    if impressions == 0 {
        return 0.0;
    }
    conversions as f64 / impressions as f64 * 100.0
}

/// Revenue divided by impressions, or 0 when there are no impressions.
pub fn revenue_per_visitor(revenue: f64, impressions: u64) -> f64 {
    if impressions == 0 {
        return 0.0;
    }
    revenue / impressions as f64
}

/// Relative lift of `rate` over `control_rate` in percent. 0 when the
/// control rate is 0.
pub fn improvement_pct(rate: f64, control_rate: f64) -> f64 {
    if control_rate == 0.0 {
        return 0.0;
    }
    (rate - control_rate) / control_rate * 100.0
}

// ── Two-Proportion Z-Test ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZTest {
    /// Absolute z score. Always >= 0.
    pub z_score: f64,
    /// Two-tailed p-value from the normal survival function.
    pub p_value: f64,
    /// Discrete confidence bucket in percent (see [`confidence_from_z`]).
    pub confidence: u32,
}

/// Pooled two-proportion z-test of a variant against the control.
///
/// Returns z = 0 (confidence 0, p = 1) when either arm has no impressions or
/// the pooled standard error is 0.
pub fn two_proportion_z_test(
    control_conversions: u64,
    control_impressions: u64,
    variant_conversions: u64,
    variant_impressions: u64,
) -> ZTest {
    let z = two_proportion_z(
        control_conversions,
        control_impressions,
        variant_conversions,
        variant_impressions,
    );
    ZTest {
        z_score: z,
        p_value: (2.0 * normal_sf(z)).clamp(0.0, 1.0),
        confidence: confidence_from_z(z),
    }
}

fn two_proportion_z(c1: u64, n1: u64, c2: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let p1 = c1 as f64 / n1f;
    let p2 = c2 as f64 / n2f;
    let pooled = (c1 + c2) as f64 / (n1f + n2f);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1f + 1.0 / n2f)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return 0.0;
    }
    (p2 - p1).abs() / se
}

/// Maps a z score onto the discrete confidence levels shown to operators.
///
/// Below the 80% threshold the value is a rough linear `round(z × 40)`.
pub fn confidence_from_z(z: f64) -> u32 {
    if z >= 2.576 {
        99
    } else if z >= 1.96 {
        95
    } else if z >= 1.645 {
        90
    } else if z >= 1.28 {
        80
    } else {
        (z.max(0.0) * 40.0).round() as u32
    }
}

// ── Normal Survival Function (A&S 26.2.17) ──────────────────────────

/// P(Z > z) for the standard normal distribution. Caller passes z >= 0.
pub fn normal_sf(z: f64) -> f64 {
    debug_assert!(z >= 0.0, "normal_sf requires z >= 0, got {}", z);

    let t = 1.0 / (1.0 + 0.2316419 * z);
    let density = 0.3989422804014327 * (-z * z / 2.0).exp();
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));

    density * poly
}

// ── Sample Size Estimator ───────────────────────────────────────────

/// Impressions each arm needs to detect a relative lift of `relative_mde`
/// over `baseline_rate` (a fraction, e.g. 0.10) at the given confidence
/// percentage and statistical power. Suggested value for
/// `minimumSampleSize`.
///
/// Returns `u64::MAX` when the lift is 0 or the inputs are out of range.
pub fn estimate_required_impressions(
    baseline_rate: f64,
    relative_mde: f64,
    confidence_level: u32,
    power: f64,
) -> u64 {
    let p1 = baseline_rate;
    let p2 = baseline_rate * (1.0 + relative_mde);
    let delta = (p2 - p1).abs();
    if delta == 0.0
        || !(0.0..1.0).contains(&p1)
        || !(0.0..=1.0).contains(&p2)
        || !(1..100).contains(&confidence_level)
    {
        return u64::MAX;
    }

    let alpha = 1.0 - confidence_level as f64 / 100.0;
    let z_alpha = z_from_p(1.0 - alpha / 2.0);
    let z_power = z_from_p(power);

    let p_bar = (p1 + p2) / 2.0;
    let numerator = z_alpha * (2.0 * p_bar * (1.0 - p_bar)).sqrt()
        + z_power * (p1 * (1.0 - p1) + p2 * (1.0 - p2)).sqrt();
    (numerator.powi(2) / delta.powi(2)).ceil() as u64
}

/// Inverse normal CDF (A&S 26.2.23): z such that P(Z < z) = p.
fn z_from_p(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let (tail, sign) = if p < 0.5 { (p, -1.0) } else { (1.0 - p, 1.0) };
    let t = (-2.0 * tail.ln()).sqrt();

    let (c0, c1, c2) = (2.515517, 0.802853, 0.010328);
    let (d1, d2, d3) = (1.432788, 0.189269, 0.001308);
    let z = t - (c0 + c1 * t + c2 * t * t) / (1.0 + d1 * t + d2 * t * t + d3 * t * t * t);

    sign * z
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Rates ───────────────────────────────────────────────────────

    #[test]
    fn conversion_rate_with_zero_impressions_is_zero() {
        let rate = conversion_rate(0, 0);
        assert_eq!(rate, 0.0);
        assert!(!rate.is_nan());
        assert_eq!(conversion_rate(5, 0), 0.0);
    }

    #[test]
    fn conversion_rate_is_percentage() {
        assert!((conversion_rate(100, 1000) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn revenue_per_visitor_handles_zero_impressions() {
        assert_eq!(revenue_per_visitor(500.0, 0), 0.0);
        assert!((revenue_per_visitor(500.0, 100) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn improvement_over_zero_control_is_zero() {
        assert_eq!(improvement_pct(12.0, 0.0), 0.0);
    }

    #[test]
    fn improvement_is_relative_percent() {
        assert!((improvement_pct(14.0, 10.0) - 40.0).abs() < 1e-9);
        assert!((improvement_pct(8.0, 10.0) + 20.0).abs() < 1e-9);
    }

    // ── Z-test ──────────────────────────────────────────────────────

    #[test]
    fn worked_example_10_vs_14_percent_is_99_confidence() {
        // p = 0.12, se ≈ 0.01453, z ≈ 2.752
        let t = two_proportion_z_test(100, 1000, 140, 1000);
        assert!((t.z_score - 2.752).abs() < 0.01, "z={}", t.z_score);
        assert!(t.z_score >= 1.96);
        assert_eq!(t.confidence, 99);
        assert!(t.p_value < 0.01, "p={}", t.p_value);
    }

    #[test]
    fn z_test_is_symmetric_in_direction() {
        let up = two_proportion_z_test(100, 1000, 140, 1000);
        let down = two_proportion_z_test(140, 1000, 100, 1000);
        assert!((up.z_score - down.z_score).abs() < 1e-12);
    }

    #[test]
    fn z_test_with_empty_arm_is_zero() {
        let t = two_proportion_z_test(0, 0, 10, 100);
        assert_eq!(t.z_score, 0.0);
        assert_eq!(t.confidence, 0);
        assert!((t.p_value - 1.0).abs() < 0.01);
    }

    #[test]
    fn z_test_with_zero_standard_error_is_zero() {
        // pooled proportion 0 → se 0
        let t = two_proportion_z_test(0, 500, 0, 500);
        assert_eq!(t.z_score, 0.0);
        // pooled proportion 1 → se 0
        let t = two_proportion_z_test(500, 500, 500, 500);
        assert_eq!(t.z_score, 0.0);
    }

    #[test]
    fn confidence_buckets() {
        assert_eq!(confidence_from_z(3.0), 99);
        assert_eq!(confidence_from_z(2.576), 99);
        assert_eq!(confidence_from_z(2.0), 95);
        assert_eq!(confidence_from_z(1.96), 95);
        assert_eq!(confidence_from_z(1.7), 90);
        assert_eq!(confidence_from_z(1.3), 80);
        assert_eq!(confidence_from_z(1.0), 40);
        assert_eq!(confidence_from_z(0.5), 20);
        assert_eq!(confidence_from_z(0.0), 0);
    }

    #[test]
    fn confidence_below_80_never_reaches_bucket() {
        // round(1.2799 × 40) = 51
        assert_eq!(confidence_from_z(1.2799), 51);
    }

    // ── Normal SF ───────────────────────────────────────────────────

    #[test]
    fn normal_sf_at_z196_is_approximately_0025() {
        let sf = normal_sf(1.96);
        assert!((sf - 0.025).abs() < 0.0005, "sf={}", sf);
    }

    #[test]
    fn normal_sf_at_z0_is_0_5() {
        let sf = normal_sf(0.0);
        assert!((sf - 0.5).abs() < 0.001, "sf={}", sf);
    }

    // ── Sample size ─────────────────────────────────────────────────

    #[test]
    fn sample_size_baseline_10pct_mde_20pct() {
        // Classic two-proportion power analysis: ~3.8k per arm at 95% / 80% power.
        let n = estimate_required_impressions(0.10, 0.20, 95, 0.80);
        assert!((3500..4200).contains(&n), "n={}", n);
    }

    #[test]
    fn sample_size_larger_mde_needs_fewer_impressions() {
        let small = estimate_required_impressions(0.10, 0.10, 95, 0.80);
        let large = estimate_required_impressions(0.10, 0.30, 95, 0.80);
        assert!(large < small);
    }

    #[test]
    fn sample_size_higher_confidence_needs_more_impressions() {
        let c90 = estimate_required_impressions(0.10, 0.20, 90, 0.80);
        let c99 = estimate_required_impressions(0.10, 0.20, 99, 0.80);
        assert!(c99 > c90);
    }

    #[test]
    fn sample_size_zero_lift_is_unbounded() {
        assert_eq!(estimate_required_impressions(0.10, 0.0, 95, 0.80), u64::MAX);
        assert_eq!(estimate_required_impressions(0.10, 0.2, 100, 0.80), u64::MAX);
    }
}
