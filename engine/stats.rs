//! Stateless hypothesis-test primitives.
//!
//! Every function here computes a result record from in-memory data plus a
//! bit pattern (or two bit patterns for the categorical tests). Nothing in
//! this module holds state: the same inputs always produce bit-identical
//! outputs, which is the invariant the pattern-result cache depends on.
//!
//! Conventions:
//! - `p_value_and_z` returns the one-tailed upper-tail p unless `two_tailed`
//!   is set, in which case the one-tailed p is doubled and capped at 1.0.
//! - The z score is the standard-normal quantile of the one-tailed p,
//!   carrying the sign of the t statistic for the t-family tests.
//! - Fisher's exact test leaves its `x2` field at 0.0; consumers must use
//!   `p` and `z`.
//! - A pattern that splits the sample into groups with zero pooled variance
//!   yields `t = 0, p = 1` rather than an error. An empty group is
//!   `StatError::DegenerateSample`; the scan driver's count gate keeps such
//!   patterns from reaching this module in normal operation.

use crate::bitpattern::BitPattern;
use ndarray::ArrayView1;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatError {
    #[error(
        "sample of {n} observations split into groups of {n1} and {n0}; both groups need at least {min} members"
    )]
    DegenerateSample { n: usize, n1: usize, n0: usize, min: usize },
    #[error("pattern length {pattern_len} does not match sample length {sample_len}")]
    LengthMismatch { pattern_len: usize, sample_len: usize },
    #[error("invalid degrees of freedom: {0}")]
    InvalidDegreesOfFreedom(f64),
}

/// Result of a t-family test. Immutable once computed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TestResult {
    /// The t statistic.
    pub t: f64,
    /// Degrees of freedom (fractional under Welch).
    pub df: f64,
    /// p-value per the configured tails.
    pub p: f64,
    /// Standard-normal equivalent of `p`, signed like `t`.
    pub z: f64,
    /// Pooled standard deviation.
    pub sd: f64,
    /// Standard error of the mean difference.
    pub stderr: f64,
    /// Mean difference (positive group minus negative group).
    pub diff: f64,
    /// Half-width of the confidence interval (0 until requested).
    pub halfci: f64,
}

/// Result of a 2x2 categorical test. Immutable once computed.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CategoricalResult {
    /// Chi-squared statistic; 0.0 by convention for Fisher's exact test.
    pub x2: f64,
    pub df: f64,
    pub p: f64,
    pub z: f64,
    /// Contingency cell counts: `cAB` = count of (bm1 == A, bm2 == B).
    pub c00: u64,
    pub c01: u64,
    pub c10: u64,
    pub c11: u64,
}

/// Either kind of per-voxel result; the cache value type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VoxelResult {
    Continuous(TestResult),
    Categorical(CategoricalResult),
}

impl VoxelResult {
    /// The statistic that populates the statistic map.
    pub fn statistic(&self) -> f64 {
        match self {
            VoxelResult::Continuous(r) => r.t,
            VoxelResult::Categorical(r) => r.x2,
        }
    }

    pub fn p_value(&self) -> f64 {
        match self {
            VoxelResult::Continuous(r) => r.p,
            VoxelResult::Categorical(r) => r.p,
        }
    }

    pub fn z_score(&self) -> f64 {
        match self {
            VoxelResult::Continuous(r) => r.z,
            VoxelResult::Categorical(r) => r.z,
        }
    }
}

/// Splits `sample` by pattern bits: (values where bit set, values where clear).
fn split_groups(
    sample: ArrayView1<'_, f64>,
    pattern: &BitPattern,
) -> Result<(Vec<f64>, Vec<f64>), StatError> {
    if pattern.len() != sample.len() {
        return Err(StatError::LengthMismatch {
            pattern_len: pattern.len(),
            sample_len: sample.len(),
        });
    }
    let mut pos = Vec::with_capacity(pattern.count());
    let mut neg = Vec::with_capacity(pattern.count_zeros());
    for (&v, bit) in sample.iter().zip(pattern.iter()) {
        if bit {
            pos.push(v);
        } else {
            neg.push(v);
        }
    }
    Ok((pos, neg))
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Unbiased sample variance (n - 1 denominator).
fn variance(xs: &[f64], m: f64) -> f64 {
    xs.iter().map(|&x| (x - m) * (x - m)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Two-sample pooled-variance t-test, splitting `sample` by `pattern`.
///
/// `df = n1 + n0 - 2`; `diff` is mean(set) - mean(clear); `stderr` uses the
/// pooled variance. The caller applies tail handling via `p_value_and_z`.
pub fn t_test(
    sample: ArrayView1<'_, f64>,
    pattern: &BitPattern,
) -> Result<TestResult, StatError> {
    let (pos, neg) = split_groups(sample, pattern)?;
    if pos.is_empty() || neg.len() < 2 {
        return Err(StatError::DegenerateSample {
            n: sample.len(),
            n1: pos.len(),
            n0: neg.len(),
            min: if pos.is_empty() { 1 } else { 2 },
        });
    }
    let (n1, n0) = (pos.len() as f64, neg.len() as f64);
    let (m1, m0) = (mean(&pos), mean(&neg));
    let df = n1 + n0 - 2.0;
    // Single-member positive group contributes zero sum of squares.
    let ss1 = if pos.len() > 1 { variance(&pos, m1) * (n1 - 1.0) } else { 0.0 };
    let ss0 = variance(&neg, m0) * (n0 - 1.0);
    let pooled_var = (ss1 + ss0) / df;
    let stderr = (pooled_var * (1.0 / n1 + 1.0 / n0)).sqrt();
    let diff = m1 - m0;
    let t = if stderr > 0.0 { diff / stderr } else { 0.0 };
    Ok(TestResult {
        t,
        df,
        sd: pooled_var.sqrt(),
        stderr,
        diff,
        ..TestResult::default()
    })
}

/// Paired / one-sample t-test on the elementwise differences `a - b`.
///
/// `df = n - 1`; `diff` is the mean difference, `stderr` its standard error.
pub fn paired_t_test(
    a: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
) -> Result<TestResult, StatError> {
    if a.len() != b.len() {
        return Err(StatError::LengthMismatch {
            pattern_len: b.len(),
            sample_len: a.len(),
        });
    }
    if a.len() < 2 {
        return Err(StatError::DegenerateSample { n: a.len(), n1: a.len(), n0: 0, min: 2 });
    }
    let deltas: Vec<f64> = a.iter().zip(b.iter()).map(|(&x, &y)| x - y).collect();
    let n = deltas.len() as f64;
    let m = mean(&deltas);
    let var = variance(&deltas, m);
    let stderr = (var / n).sqrt();
    let t = if stderr > 0.0 { m / stderr } else { 0.0 };
    Ok(TestResult {
        t,
        df: n - 1.0,
        sd: var.sqrt(),
        stderr,
        diff: m,
        ..TestResult::default()
    })
}

/// Welch's unequal-variance t-test with the Welch-Satterthwaite df
/// approximation, splitting `sample` by `pattern`.
pub fn welch_test(
    sample: ArrayView1<'_, f64>,
    pattern: &BitPattern,
) -> Result<TestResult, StatError> {
    let (pos, neg) = split_groups(sample, pattern)?;
    if pos.len() < 2 || neg.len() < 2 {
        return Err(StatError::DegenerateSample {
            n: sample.len(),
            n1: pos.len(),
            n0: neg.len(),
            min: 2,
        });
    }
    let (n1, n0) = (pos.len() as f64, neg.len() as f64);
    let (m1, m0) = (mean(&pos), mean(&neg));
    let (v1, v0) = (variance(&pos, m1), variance(&neg, m0));
    let se2 = v1 / n1 + v0 / n0;
    let stderr = se2.sqrt();
    let diff = m1 - m0;
    let t = if stderr > 0.0 { diff / stderr } else { 0.0 };
    // Welch-Satterthwaite approximation; collapses to n-2 when variances match.
    let df = if se2 > 0.0 {
        se2 * se2
            / ((v1 / n1) * (v1 / n1) / (n1 - 1.0) + (v0 / n0) * (v0 / n0) / (n0 - 1.0))
    } else {
        n1 + n0 - 2.0
    };
    Ok(TestResult {
        t,
        df,
        sd: ((v1 + v0) / 2.0).sqrt(),
        stderr,
        diff,
        ..TestResult::default()
    })
}

/// 2x2 contingency table over a shared index space.
fn contingency(bm1: &BitPattern, bm2: &BitPattern) -> Result<[u64; 4], StatError> {
    if bm1.len() != bm2.len() {
        return Err(StatError::LengthMismatch {
            pattern_len: bm2.len(),
            sample_len: bm1.len(),
        });
    }
    let mut cells = [0u64; 4];
    for i in 0..bm1.len() {
        let idx = (bm1.get(i) as usize) << 1 | bm2.get(i) as usize;
        cells[idx] += 1;
    }
    Ok(cells)
}

/// Pearson chi-squared test on the 2x2 table built from two bit patterns,
/// with optional Yates continuity correction. df = 1.
pub fn chi_squared(
    bm1: &BitPattern,
    bm2: &BitPattern,
    yates: bool,
) -> Result<CategoricalResult, StatError> {
    let [c00, c01, c10, c11] = contingency(bm1, bm2)?;
    let (a, b, c, d) = (c11 as f64, c10 as f64, c01 as f64, c00 as f64);
    let n = a + b + c + d;
    let (r1, r0) = (a + b, c + d);
    let (k1, k0) = (a + c, b + d);
    let denom = r1 * r0 * k1 * k0;
    let x2 = if denom > 0.0 {
        let dev = (a * d - b * c).abs();
        let dev = if yates { (dev - n / 2.0).max(0.0) } else { dev };
        n * dev * dev / denom
    } else {
        0.0
    };
    let (p, z) = chi_squared_p_and_z(x2, 1.0)?;
    Ok(CategoricalResult { x2, df: 1.0, p, z, c00, c01, c10, c11 })
}

/// Fisher's exact test on the same 2x2 table.
///
/// One-tailed: sum of hypergeometric probabilities of tables at least as
/// extreme in the observed direction. Two-tailed: sum of all table
/// probabilities not exceeding the observed table's. The `x2` field is 0.0
/// by convention.
pub fn fisher_exact(
    bm1: &BitPattern,
    bm2: &BitPattern,
    two_tailed: bool,
) -> Result<CategoricalResult, StatError> {
    let [c00, c01, c10, c11] = contingency(bm1, bm2)?;
    let (a, b, c, d) = (c11, c10, c01, c00);
    let (r1, k1, n) = (a + b, a + c, a + b + c + d);
    // Hypergeometric probability of cell value `ai` under fixed margins.
    let ln_p_of =
        |ai: u64| -> f64 { ln_binom(r1, ai) + ln_binom(n - r1, k1 - ai) - ln_binom(n, k1) };
    let a_min = k1.saturating_sub(n - r1);
    let a_max = r1.min(k1);
    let ln_obs = ln_p_of(a);
    let p = if two_tailed {
        // All tables with probability <= observed (within rounding slack).
        let mut total = 0.0;
        for ai in a_min..=a_max {
            let lp = ln_p_of(ai);
            if lp <= ln_obs + 1e-7 {
                total += lp.exp();
            }
        }
        total.min(1.0)
    } else {
        // Tail in the observed direction of association.
        let expected_a = r1 as f64 * k1 as f64 / n as f64;
        let mut total = 0.0;
        if a as f64 >= expected_a {
            for ai in a..=a_max {
                total += ln_p_of(ai).exp();
            }
        } else {
            for ai in a_min..=a {
                total += ln_p_of(ai).exp();
            }
        }
        total.min(1.0)
    };
    let z = z_from_one_tailed_p(if two_tailed { p / 2.0 } else { p });
    Ok(CategoricalResult { x2: 0.0, df: 1.0, p, z, c00, c01, c10, c11 })
}

/// ln C(n, k) via the log-gamma function.
fn ln_binom(n: u64, k: u64) -> f64 {
    ln_gamma(n as f64 + 1.0) - ln_gamma(k as f64 + 1.0) - ln_gamma((n - k) as f64 + 1.0)
}

/// Converts a t statistic into (p, z) via the Student-t CDF.
///
/// One-tailed p is the upper-tail probability of `|t|`; two-tailed doubles
/// it, capped at 1.0. z carries the sign of t.
pub fn p_value_and_z(t: f64, df: f64, two_tailed: bool) -> Result<(f64, f64), StatError> {
    if !(df > 0.0) {
        return Err(StatError::InvalidDegreesOfFreedom(df));
    }
    let dist =
        StudentsT::new(0.0, 1.0, df).map_err(|_| StatError::InvalidDegreesOfFreedom(df))?;
    let one_tailed = dist.sf(t.abs());
    let p = if two_tailed { (one_tailed * 2.0).min(1.0) } else { one_tailed };
    let z = z_from_one_tailed_p(one_tailed).copysign(if t < 0.0 { -1.0 } else { 1.0 });
    Ok((p, z))
}

/// Converts a chi-squared statistic into (p, z); p is inherently one-tailed.
pub fn chi_squared_p_and_z(x2: f64, df: f64) -> Result<(f64, f64), StatError> {
    if !(df > 0.0) {
        return Err(StatError::InvalidDegreesOfFreedom(df));
    }
    let dist = ChiSquared::new(df).map_err(|_| StatError::InvalidDegreesOfFreedom(df))?;
    let p = dist.sf(x2);
    let z = z_from_one_tailed_p(p);
    Ok((p, z))
}

/// Standard-normal quantile of a one-tailed p, clamped away from infinities.
fn z_from_one_tailed_p(p: f64) -> f64 {
    let norm = Normal::standard();
    // 1 - p must stay strictly below 1.0 in f64 for the quantile to be finite.
    let p = p.clamp(1e-16, 1.0 - 1e-16);
    norm.inverse_cdf(1.0 - p)
}

/// Confidence-interval half-width: `stderr * t_{df}(1 - alpha/2)`.
pub fn ci_half_width(stderr: f64, df: f64, alpha: f64) -> Result<f64, StatError> {
    if !(df > 0.0) {
        return Err(StatError::InvalidDegreesOfFreedom(df));
    }
    let dist =
        StudentsT::new(0.0, 1.0, df).map_err(|_| StatError::InvalidDegreesOfFreedom(df))?;
    Ok(stderr * dist.inverse_cdf(1.0 - alpha / 2.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn pooled_t_test_hand_computed() {
        // Groups: set bits pick {4, 5}, clear bits pick {1, 2, 3}.
        // m1 = 4.5, m0 = 2.0, ss1 = 0.5, ss0 = 2.0, df = 3,
        // pooled var = 2.5/3, stderr = sqrt(2.5/3 * (1/2 + 1/3)) = sqrt(25/36)
        // t = 2.5 / (5/6) = 3.0
        let iv = array![1.0, 2.0, 3.0, 4.0, 5.0];
        let pattern = BitPattern::from_bools(&[false, false, false, true, true]);
        let r = t_test(iv.view(), &pattern).unwrap();
        assert_relative_eq!(r.diff, 2.5, epsilon = 1e-12);
        assert_relative_eq!(r.t, 3.0, epsilon = 1e-12);
        assert_relative_eq!(r.df, 3.0, epsilon = 1e-12);
        assert_relative_eq!(r.stderr, 5.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn welch_reduces_toward_pooled_for_equal_groups() {
        let iv = array![1.0, 2.0, 3.0, 11.0, 12.0, 13.0];
        let pattern = BitPattern::from_bools(&[false, false, false, true, true, true]);
        let pooled = t_test(iv.view(), &pattern).unwrap();
        let welch = welch_test(iv.view(), &pattern).unwrap();
        // Equal group sizes and equal variances: identical t, df = n - 2.
        assert_relative_eq!(welch.t, pooled.t, epsilon = 1e-12);
        assert_relative_eq!(welch.df, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn paired_t_test_on_shifted_series() {
        let a = array![2.0, 3.0, 4.0, 5.0];
        let b = array![1.0, 2.0, 3.0, 4.0];
        // Constant shift: zero variance in the differences, so t falls back
        // to 0 by the degenerate-variance convention.
        let r = paired_t_test(a.view(), b.view()).unwrap();
        assert_relative_eq!(r.diff, 1.0, epsilon = 1e-12);
        assert_eq!(r.t, 0.0);
        let a2 = array![2.0, 3.5, 4.0, 5.5];
        let r2 = paired_t_test(a2.view(), b.view()).unwrap();
        assert!(r2.t > 0.0);
        assert_relative_eq!(r2.df, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn chi_squared_hand_computed() {
        // Table: a=8 (1,1), b=2 (1,0), c=3 (0,1), d=7 (0,0), n=20.
        // x2 = 20*(8*7-2*3)^2 / (10*10*11*9) = 20*2500/9900 = 5.0505...
        let mut bm1 = BitPattern::new(20);
        let mut bm2 = BitPattern::new(20);
        for i in 0..10 {
            bm1.set(i);
        }
        for i in 0..8 {
            bm2.set(i);
        }
        for i in 10..13 {
            bm2.set(i);
        }
        let r = chi_squared(&bm1, &bm2, false).unwrap();
        assert_eq!((r.c11, r.c10, r.c01, r.c00), (8, 2, 3, 7));
        assert_relative_eq!(r.x2, 20.0 * 2500.0 / 9900.0, epsilon = 1e-12);
        assert_relative_eq!(r.df, 1.0, epsilon = 1e-12);
        assert!(r.p > 0.0 && r.p < 0.05);
    }

    #[test]
    fn yates_correction_shrinks_statistic() {
        let mut bm1 = BitPattern::new(20);
        let mut bm2 = BitPattern::new(20);
        for i in 0..10 {
            bm1.set(i);
        }
        for i in 0..8 {
            bm2.set(i);
        }
        for i in 10..13 {
            bm2.set(i);
        }
        let plain = chi_squared(&bm1, &bm2, false).unwrap();
        let yates = chi_squared(&bm1, &bm2, true).unwrap();
        assert!(yates.x2 < plain.x2);
        assert_eq!(yates.df, plain.df);
        // Continuity correction: dev 50 -> 40, x2 = 20*1600/9900.
        assert_relative_eq!(yates.x2, 20.0 * 1600.0 / 9900.0, epsilon = 1e-12);
    }

    #[test]
    fn fisher_exact_matches_hypergeometric_hand_value() {
        // Classic 2x2: a=1, b=9, c=11, d=3. One-tailed p (under-enrichment
        // direction) = P(A <= 1) with margins r1=10, k1=12, n=24.
        let mut bm1 = BitPattern::new(24);
        let mut bm2 = BitPattern::new(24);
        for i in 0..10 {
            bm1.set(i);
        }
        bm2.set(0);
        for i in 10..21 {
            bm2.set(i);
        }
        let r = fisher_exact(&bm1, &bm2, false).unwrap();
        assert_eq!((r.c11, r.c10, r.c01, r.c00), (1, 9, 11, 3));
        // R: phyper(1, 12, 12, 10) = 0.001379728
        assert_relative_eq!(r.p, 0.001379728, epsilon = 1e-6);
        assert_eq!(r.x2, 0.0);
    }

    #[test]
    fn two_tailed_doubles_and_caps() {
        let (one, _) = p_value_and_z(2.0, 10.0, false).unwrap();
        let (two, _) = p_value_and_z(2.0, 10.0, true).unwrap();
        assert_relative_eq!(two, (one * 2.0).min(1.0), epsilon = 1e-12);
        let (capped, _) = p_value_and_z(0.0, 10.0, true).unwrap();
        assert_eq!(capped, 1.0);
    }

    #[test]
    fn z_sign_follows_t() {
        let (_, z_pos) = p_value_and_z(2.5, 12.0, true).unwrap();
        let (_, z_neg) = p_value_and_z(-2.5, 12.0, true).unwrap();
        assert!(z_pos > 0.0);
        assert_relative_eq!(z_neg, -z_pos, epsilon = 1e-12);
    }

    #[test]
    fn ci_half_width_uses_t_quantile() {
        // t_{0.975, 10} = 2.2281...
        let hw = ci_half_width(2.0, 10.0, 0.05).unwrap();
        assert_relative_eq!(hw, 2.0 * 2.228138852, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_groups_are_rejected() {
        let iv = array![1.0, 2.0, 3.0];
        let all_set = BitPattern::from_bools(&[true, true, true]);
        assert!(matches!(
            t_test(iv.view(), &all_set),
            Err(StatError::DegenerateSample { .. })
        ));
        let mismatched = BitPattern::new(5);
        assert!(matches!(
            t_test(iv.view(), &mismatched),
            Err(StatError::LengthMismatch { .. })
        ));
    }
}
