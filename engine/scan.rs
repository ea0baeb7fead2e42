//! The volume scan driver.
//!
//! Walks every voxel of a 4D series, builds the voxel's observation pattern,
//! applies the minimum-count gate, and computes (or reuses from the
//! per-scan cache) the configured test statistic. The driver owns the cache
//! and every output map for the duration of one scan; a new scan always
//! starts from an empty cache, so a changed dependent variable or
//! configuration can never serve stale results.

use crate::bitpattern::BitPattern;
use crate::cache::PatternCache;
use crate::fdr::PEntry;
use crate::stats::{
    self, CategoricalResult, StatError, TestResult, VoxelResult,
};
use crate::volume::{Series, Volume, VolumeError, VolumeMask};
use log::warn;
use ndarray::{Array1, Array3};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Stat(#[from] StatError),
    #[error(
        "the {test} test needs a binary dependent variable, but entry {index} is {value}"
    )]
    NonBinaryVariable { test: &'static str, index: usize, value: f64 },
}

/// Which hypothesis test the scan runs at each voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestKind {
    /// Pooled-variance two-sample t-test.
    TTest,
    /// Welch's unequal-variance t-test.
    Welch,
    /// Pearson chi-squared on the 2x2 table, optionally Yates-corrected.
    ChiSquared { yates: bool },
    /// Fisher's exact test on the 2x2 table.
    FisherExact,
}

impl TestKind {
    fn is_categorical(self) -> bool {
        matches!(self, TestKind::ChiSquared { .. } | TestKind::FisherExact)
    }

    fn name(self) -> &'static str {
        match self {
            TestKind::TTest => "t",
            TestKind::Welch => "welch",
            TestKind::ChiSquared { .. } => "chi-squared",
            TestKind::FisherExact => "fisher",
        }
    }
}

/// Explicit scan configuration; there is no ambient state.
#[derive(Clone, Copy, Debug)]
pub struct ScanConfig {
    pub test: TestKind,
    /// Double the one-tailed p, capped at 1.0.
    pub two_tailed: bool,
    /// Negate t and the mean difference before tail handling, for designs
    /// where a lower dependent value means a stronger deficit.
    pub flip_sign: bool,
    /// Minimum set-bit count for a voxel to be tested.
    pub min_lesions: usize,
    /// When set, populate the three confidence-interval planes at this alpha.
    pub ci_alpha: Option<f64>,
    /// Populate the per-voxel p map.
    pub compute_p_map: bool,
    /// Let cache hits contribute their p to the FDR collection. Off by
    /// default: repeated identical tests would otherwise bias the
    /// correction.
    pub include_duplicate_p: bool,
    /// Diagnostic switch; disabling the cache must not change any output.
    pub use_cache: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            test: TestKind::TTest,
            two_tailed: true,
            flip_sign: false,
            min_lesions: 2,
            ci_alpha: None,
            compute_p_map: false,
            include_duplicate_p: false,
            use_cache: true,
        }
    }
}

/// Three-plane confidence-interval output.
#[derive(Clone, Debug)]
pub struct CiMaps {
    pub lower: Volume,
    pub diff: Volume,
    pub upper: Volume,
}

/// Everything one scan produces.
#[derive(Debug)]
pub struct ScanOutputs {
    pub stat_map: Volume,
    pub p_map: Option<Volume>,
    pub ci: Option<CiMaps>,
    /// Which voxels were actually tested.
    pub tested: VolumeMask,
    /// p-values in discovery order, each paired with its map statistic.
    pub p_collection: Vec<PEntry>,
    pub n_tested: usize,
    pub n_unique_patterns: usize,
    /// Voxels skipped by the minimum-count gate.
    pub n_gated: usize,
    /// Series values outside {0, 1} encountered while building patterns.
    pub n_non_binary: u64,
}

impl ScanOutputs {
    /// Largest statistic among tested voxels; the per-permutation extreme
    /// recorded into null-distribution files.
    pub fn peak_statistic(&self) -> Option<f64> {
        if self.n_tested == 0 {
            return None;
        }
        let mut peak = f64::NEG_INFINITY;
        let dims = self.tested.dims();
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    if self.tested.included(x, y, z) {
                        peak = peak.max(self.stat_map[[x, y, z]]);
                    }
                }
            }
        }
        Some(peak)
    }
}

/// Drives one scan of a series against a fixed dependent variable.
pub struct Scanner {
    config: ScanConfig,
    variable: Array1<f64>,
    /// The dependent variable as a pattern, for the categorical tests.
    variable_pattern: Option<BitPattern>,
}

impl Scanner {
    /// Validates the dependent variable against the configured test. The
    /// categorical tests need a strictly binary variable.
    pub fn new(config: ScanConfig, variable: Array1<f64>) -> Result<Self, ScanError> {
        let variable_pattern = if config.test.is_categorical() {
            let mut pattern = BitPattern::new(variable.len());
            for (index, &value) in variable.iter().enumerate() {
                if value == 1.0 {
                    pattern.set(index);
                } else if value != 0.0 {
                    return Err(ScanError::NonBinaryVariable {
                        test: config.test.name(),
                        index,
                        value,
                    });
                }
            }
            Some(pattern)
        } else {
            None
        };
        Ok(Self { config, variable, variable_pattern })
    }

    /// Runs the full voxel loop. `mask` restricts which voxels are visited;
    /// it must match the series' spatial dimensions.
    pub fn scan(&self, series: &Series, mask: &VolumeMask) -> Result<ScanOutputs, ScanError> {
        let dims = series.spatial_dims();
        if mask.dims() != dims {
            return Err(VolumeError::MaskShapeMismatch { mask: mask.dims(), series: dims }.into());
        }
        if series.n_observations() != self.variable.len() {
            return Err(VolumeError::ObservationCountMismatch {
                observations: series.n_observations(),
                variable: self.variable.len(),
            }
            .into());
        }

        let n_obs = series.n_observations();
        let mut cache = PatternCache::new();
        let mut outputs = ScanOutputs {
            stat_map: Array3::zeros(dims),
            p_map: self.config.compute_p_map.then(|| Array3::zeros(dims)),
            ci: self.config.ci_alpha.map(|_| CiMaps {
                lower: Array3::zeros(dims),
                diff: Array3::zeros(dims),
                upper: Array3::zeros(dims),
            }),
            tested: VolumeMask::none(dims),
            p_collection: Vec::new(),
            n_tested: 0,
            n_unique_patterns: 0,
            n_gated: 0,
            n_non_binary: 0,
        };

        let mut pattern = BitPattern::new(n_obs);
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    if !mask.included(x, y, z) {
                        continue;
                    }
                    pattern.clear();
                    for obs in 0..n_obs {
                        let value = series.value(x, y, z, obs);
                        if value != 0.0 {
                            if value != 1.0 {
                                outputs.n_non_binary += 1;
                            }
                            pattern.set(obs);
                        }
                    }

                    // Data-quality gate: too few positive or negative
                    // observations make the voxel untestable. Welch needs
                    // two per group for its variance terms.
                    let min_positives = match self.config.test {
                        TestKind::Welch => self.config.min_lesions.max(2),
                        _ => self.config.min_lesions,
                    };
                    if pattern.count() < min_positives || pattern.count_zeros() < 2 {
                        outputs.n_gated += 1;
                        continue;
                    }

                    let (result, fresh) = match cache.lookup(&pattern) {
                        Some(&hit) if self.config.use_cache => (hit, false),
                        _ => {
                            let computed = self.run_test(&pattern)?;
                            cache.insert(pattern.clone(), computed);
                            (computed, true)
                        }
                    };

                    let statistic = self.map_statistic(&result);
                    outputs.stat_map[[x, y, z]] = statistic;
                    if let Some(p_map) = outputs.p_map.as_mut() {
                        p_map[[x, y, z]] = result.p_value();
                    }
                    if let Some(ci) = outputs.ci.as_mut() {
                        if let VoxelResult::Continuous(r) = &result {
                            ci.lower[[x, y, z]] = r.diff - r.halfci;
                            ci.diff[[x, y, z]] = r.diff;
                            ci.upper[[x, y, z]] = r.diff + r.halfci;
                        }
                    }
                    outputs.tested.set(x, y, z, true);
                    outputs.n_tested += 1;
                    if fresh || self.config.include_duplicate_p {
                        outputs
                            .p_collection
                            .push(PEntry { p: result.p_value(), statistic });
                    }
                }
            }
        }

        outputs.n_unique_patterns = cache.len();
        if outputs.n_non_binary > 0 {
            warn!(
                "{} series values outside {{0, 1}} were treated as set bits",
                outputs.n_non_binary
            );
        }
        Ok(outputs)
    }

    /// Runs the configured test on one pattern, applying flip, tails, and
    /// the confidence-interval half-width.
    fn run_test(&self, pattern: &BitPattern) -> Result<VoxelResult, ScanError> {
        match self.config.test {
            TestKind::TTest | TestKind::Welch => {
                let mut r: TestResult = match self.config.test {
                    TestKind::TTest => stats::t_test(self.variable.view(), pattern)?,
                    _ => stats::welch_test(self.variable.view(), pattern)?,
                };
                if self.config.flip_sign {
                    r.t = -r.t;
                    r.diff = -r.diff;
                }
                let (p, z) = stats::p_value_and_z(r.t, r.df, self.config.two_tailed)?;
                r.p = p;
                r.z = z;
                if let Some(alpha) = self.config.ci_alpha {
                    r.halfci = stats::ci_half_width(r.stderr, r.df, alpha)?;
                }
                Ok(VoxelResult::Continuous(r))
            }
            TestKind::ChiSquared { yates } => {
                // Safe: the constructor builds the pattern for categorical tests.
                let variable_pattern = self.variable_pattern.as_ref().unwrap();
                let r: CategoricalResult =
                    stats::chi_squared(variable_pattern, pattern, yates)?;
                Ok(VoxelResult::Categorical(r))
            }
            TestKind::FisherExact => {
                let variable_pattern = self.variable_pattern.as_ref().unwrap();
                let r = stats::fisher_exact(
                    variable_pattern,
                    pattern,
                    self.config.two_tailed,
                )?;
                Ok(VoxelResult::Categorical(r))
            }
        }
    }

    /// The value written into the statistic map. Fisher's exact test keeps
    /// its x2 field at 0.0, so its map carries the z equivalent instead.
    fn map_statistic(&self, result: &VoxelResult) -> f64 {
        match self.config.test {
            TestKind::FisherExact => result.z_score(),
            _ => result.statistic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, array};

    /// A 3-voxel, 4-observation series laid out as (3, 1, 1, 4).
    fn three_voxel_series(patterns: [[f64; 4]; 3]) -> Series {
        let mut data = Array4::zeros((3, 1, 1, 4));
        for (x, pattern) in patterns.iter().enumerate() {
            for (obs, &v) in pattern.iter().enumerate() {
                data[[x, 0, 0, obs]] = v;
            }
        }
        Series::new(data)
    }

    #[test]
    fn shared_patterns_share_one_cache_entry() {
        // Voxels 1 and 2 share a pattern; voxel 3 differs: 2 unique
        // entries, 3 populated statistic-map voxels.
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let config = ScanConfig { min_lesions: 2, ..ScanConfig::default() };
        let scanner = Scanner::new(config, array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &VolumeMask::all([3, 1, 1])).unwrap();
        assert_eq!(out.n_unique_patterns, 2);
        assert_eq!(out.n_tested, 3);
        assert_eq!(out.stat_map[[0, 0, 0]], out.stat_map[[1, 0, 0]]);
        assert_ne!(out.stat_map[[0, 0, 0]], out.stat_map[[2, 0, 0]]);
        // Duplicate patterns stay out of the FDR collection by default.
        assert_eq!(out.p_collection.len(), 2);
    }

    #[test]
    fn duplicates_enter_p_collection_on_request() {
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let config = ScanConfig { include_duplicate_p: true, ..ScanConfig::default() };
        let scanner = Scanner::new(config, array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &VolumeMask::all([3, 1, 1])).unwrap();
        assert_eq!(out.p_collection.len(), 3);
    }

    #[test]
    fn count_gate_boundary() {
        // min_lesions = 2: exactly one positive is excluded, exactly two
        // are included.
        let series = three_voxel_series([
            [1.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 1.0, 0.0],
        ]);
        let config = ScanConfig { min_lesions: 2, ..ScanConfig::default() };
        let scanner = Scanner::new(config, array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &VolumeMask::all([3, 1, 1])).unwrap();
        assert!(!out.tested.included(0, 0, 0));
        assert!(out.tested.included(1, 0, 0));
        // Voxel 3 has only one negative observation: also gated.
        assert!(!out.tested.included(2, 0, 0));
        assert_eq!(out.n_gated, 2);
        assert_eq!(out.n_tested, 1);
    }

    #[test]
    fn welch_raises_the_positive_minimum_to_two() {
        // min_lesions = 1: the pooled t-test accepts a single-positive
        // voxel, Welch gates it instead of erroring mid-scan.
        let series = three_voxel_series([
            [1.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let mask = VolumeMask::all([3, 1, 1]);
        let iv = array![1.0, 2.0, 3.0, 4.0];
        let pooled = Scanner::new(
            ScanConfig { min_lesions: 1, ..ScanConfig::default() },
            iv.clone(),
        )
        .unwrap()
        .scan(&series, &mask)
        .unwrap();
        assert!(pooled.tested.included(0, 0, 0));
        assert_eq!(pooled.n_tested, 3);
        let welch = Scanner::new(
            ScanConfig { test: TestKind::Welch, min_lesions: 1, ..ScanConfig::default() },
            iv,
        )
        .unwrap()
        .scan(&series, &mask)
        .unwrap();
        assert!(!welch.tested.included(0, 0, 0));
        assert_eq!(welch.n_gated, 1);
        assert_eq!(welch.n_tested, 2);
    }

    #[test]
    fn cache_is_a_pure_optimization() {
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let iv = array![4.0, 1.0, 3.0, 2.0];
        let mask = VolumeMask::all([3, 1, 1]);
        let with_cache = Scanner::new(
            ScanConfig { include_duplicate_p: true, ..ScanConfig::default() },
            iv.clone(),
        )
        .unwrap()
        .scan(&series, &mask)
        .unwrap();
        let without_cache = Scanner::new(
            ScanConfig {
                include_duplicate_p: true,
                use_cache: false,
                ..ScanConfig::default()
            },
            iv,
        )
        .unwrap()
        .scan(&series, &mask)
        .unwrap();
        assert_eq!(with_cache.stat_map, without_cache.stat_map);
        assert_eq!(with_cache.p_collection, without_cache.p_collection);
    }

    #[test]
    fn masked_voxels_are_skipped() {
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let mut mask = VolumeMask::all([3, 1, 1]);
        mask.set(1, 0, 0, false);
        let scanner =
            Scanner::new(ScanConfig::default(), array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &mask).unwrap();
        assert_eq!(out.n_tested, 2);
        assert!(!out.tested.included(1, 0, 0));
        assert_eq!(out.stat_map[[1, 0, 0]], 0.0);
    }

    #[test]
    fn non_binary_values_warn_but_scan_continues() {
        let series = three_voxel_series([
            [2.0, 1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
        ]);
        let scanner =
            Scanner::new(ScanConfig::default(), array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &VolumeMask::all([3, 1, 1])).unwrap();
        assert_eq!(out.n_non_binary, 1);
        assert_eq!(out.n_tested, 3);
    }

    #[test]
    fn categorical_tests_reject_non_binary_variable() {
        let err = Scanner::new(
            ScanConfig { test: TestKind::ChiSquared { yates: false }, ..ScanConfig::default() },
            array![0.0, 1.0, 2.0, 1.0],
        );
        assert!(matches!(err, Err(ScanError::NonBinaryVariable { index: 2, .. })));
    }

    #[test]
    fn dimension_mismatches_are_input_errors() {
        let series = three_voxel_series([[0.0; 4]; 3]);
        let scanner =
            Scanner::new(ScanConfig::default(), array![1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            scanner.scan(&series, &VolumeMask::all([3, 1, 1])),
            Err(ScanError::Volume(VolumeError::ObservationCountMismatch { .. }))
        ));
        let scanner4 =
            Scanner::new(ScanConfig::default(), array![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(matches!(
            scanner4.scan(&series, &VolumeMask::all([2, 1, 1])),
            Err(ScanError::Volume(VolumeError::MaskShapeMismatch { .. }))
        ));
    }

    #[test]
    fn ci_planes_bracket_the_mean_difference() {
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
        ]);
        let config = ScanConfig { ci_alpha: Some(0.05), ..ScanConfig::default() };
        let scanner = Scanner::new(config, array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = scanner.scan(&series, &VolumeMask::all([3, 1, 1])).unwrap();
        let ci = out.ci.as_ref().unwrap();
        for x in 0..3 {
            assert!(ci.lower[[x, 0, 0]] <= ci.diff[[x, 0, 0]]);
            assert!(ci.diff[[x, 0, 0]] <= ci.upper[[x, 0, 0]]);
        }
    }

    #[test]
    fn flip_negates_statistic_and_difference() {
        let series = three_voxel_series([
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 1.0, 1.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
        ]);
        let iv = array![1.0, 2.0, 3.0, 4.0];
        let mask = VolumeMask::all([3, 1, 1]);
        let plain = Scanner::new(ScanConfig::default(), iv.clone())
            .unwrap()
            .scan(&series, &mask)
            .unwrap();
        let flipped =
            Scanner::new(ScanConfig { flip_sign: true, ..ScanConfig::default() }, iv)
                .unwrap()
                .scan(&series, &mask)
                .unwrap();
        for x in 0..3 {
            assert_eq!(plain.stat_map[[x, 0, 0]], -flipped.stat_map[[x, 0, 0]]);
        }
    }
}
