// ========================================================================================
//
//                            THE VLSM ORCHESTRATOR
//
// ========================================================================================
//
// This binary wires the engine together: it parses arguments, loads the 4D
// series, mask, dependent variable, and permutation matrix, runs one scan
// (or a permutation sweep), and persists every requested artifact. All
// statistics live in the library; nothing here computes.
//
// Exit codes: 0 success; 1 input error (nothing written); 2 at least one
// output artifact failed to write (the others were still attempted).

use clap::{Parser, ValueEnum};
use ndarray::Array1;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use vlsm::data;
use vlsm::fdr::{self, FdrStat};
use vlsm::nifti;
use vlsm::permute::{PermutationKind, PermutationMatrix};
use vlsm::scan::{ScanConfig, ScanOutputs, Scanner, TestKind};
use vlsm::volume::VolumeMask;

const EXIT_INPUT_ERROR: i32 = 1;
const EXIT_WRITE_ERROR: i32 = 2;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TestArg {
    T,
    Welch,
    Chi2,
    Fisher,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PermKindArg {
    Order,
    Sign,
}

#[derive(Parser, Debug)]
#[clap(
    name = "vlsm",
    version,
    about = "Voxel-wise statistical mapping with pattern memoization and FDR thresholds."
)]
struct Args {
    /// 4D binary series (.nii or .nii.gz), one volume per observation.
    #[clap(long)]
    series: PathBuf,

    /// Dependent variable, one value per observation.
    #[clap(long)]
    iv: PathBuf,

    /// Optional mask volume; intersected with the series' derived mask.
    #[clap(long)]
    mask: Option<PathBuf>,

    /// Hypothesis test to run at each voxel.
    #[clap(long, value_enum, default_value = "t")]
    test: TestArg,

    /// Yates continuity correction (chi2 only).
    #[clap(long)]
    yates: bool,

    /// One-tailed p-values (default is two-tailed).
    #[clap(long)]
    one_tailed: bool,

    /// Negate the statistic and mean difference.
    #[clap(long)]
    flip: bool,

    /// Minimum positive-observation count for a voxel to be tested.
    #[clap(long, default_value_t = 2)]
    min_lesions: usize,

    /// Confidence-interval alpha; enables the three-plane CI output.
    #[clap(long)]
    alpha: Option<f64>,

    /// FDR q values, comma separated.
    #[clap(long, value_delimiter = ',', default_values_t = [0.05])]
    q: Vec<f64>,

    /// Permutation matrix file (rows = observations, columns = permutations).
    #[clap(long)]
    perm: Option<PathBuf>,

    /// Interpretation of the permutation matrix.
    #[clap(long, value_enum, default_value = "order")]
    perm_kind: PermKindArg,

    /// Apply one permutation column before scanning.
    #[clap(long)]
    perm_index: Option<usize>,

    /// Scan every permutation column, appending one peak statistic per
    /// column to the null-distribution file.
    #[clap(long)]
    perm_sweep: bool,

    /// Zero-based part index for a partitioned sweep.
    #[clap(long, default_value_t = 0)]
    perm_part: usize,

    /// Number of parts the sweep's column range is split into.
    #[clap(long, default_value_t = 1)]
    perm_parts: usize,

    /// Output prefix for every artifact.
    #[clap(long, default_value = "vlsm")]
    out: PathBuf,

    /// Write the per-voxel p-value map.
    #[clap(long)]
    write_p: bool,

    /// Write the flat p-value list (one value per line, discovery order).
    #[clap(long)]
    write_p_list: bool,

    /// Let cache hits contribute their p-value to the FDR collection.
    #[clap(long)]
    keep_duplicate_p: bool,
}

impl Args {
    fn test_kind(&self) -> TestKind {
        match self.test {
            TestArg::T => TestKind::TTest,
            TestArg::Welch => TestKind::Welch,
            TestArg::Chi2 => TestKind::ChiSquared { yates: self.yates },
            TestArg::Fisher => TestKind::FisherExact,
        }
    }

    fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            test: self.test_kind(),
            two_tailed: !self.one_tailed,
            flip_sign: self.flip,
            min_lesions: self.min_lesions,
            ci_alpha: self.alpha,
            compute_p_map: self.write_p,
            include_duplicate_p: self.keep_duplicate_p,
            use_cache: true,
        }
    }

    fn artifact(&self, suffix: &str) -> PathBuf {
        let mut name = self.out.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::init();
    let args = Args::parse();

    // --- Phase 1: Load and validate every input before writing anything ---
    let series = match nifti::read(&args.series) {
        Ok(image) => image.into_series(),
        Err(e) => {
            eprintln!("Error reading series '{}': {}", args.series.display(), e);
            process::exit(EXIT_INPUT_ERROR);
        }
    };
    eprintln!(
        "> Series: {:?} voxels, {} observations",
        series.spatial_dims(),
        series.n_observations()
    );

    let variable = match data::load_variable(&args.iv) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error reading dependent variable '{}': {}", args.iv.display(), e);
            process::exit(EXIT_INPUT_ERROR);
        }
    };
    if variable.len() != series.n_observations() {
        eprintln!(
            "Error: dependent variable has {} entries but the series has {} observations",
            variable.len(),
            series.n_observations()
        );
        process::exit(EXIT_INPUT_ERROR);
    }

    let mut mask = series.derived_mask();
    if let Some(mask_path) = &args.mask {
        let external = match nifti::read(mask_path) {
            Ok(image) => VolumeMask::from_volume(&image.into_volume()),
            Err(e) => {
                eprintln!("Error reading mask '{}': {}", mask_path.display(), e);
                process::exit(EXIT_INPUT_ERROR);
            }
        };
        if let Err(e) = mask.intersect(&external) {
            eprintln!("Error: {}", e);
            process::exit(EXIT_INPUT_ERROR);
        }
    }
    eprintln!("> Mask: {} voxels eligible", mask.count());

    let matrix = match &args.perm {
        Some(path) => {
            let kind = match args.perm_kind {
                PermKindArg::Order => PermutationKind::Order,
                PermKindArg::Sign => PermutationKind::Sign,
            };
            match data::load_permutation_matrix(path, kind, variable.len()) {
                Ok(m) => Some(m),
                Err(e) => {
                    eprintln!("Error reading permutation matrix '{}': {}", path.display(), e);
                    process::exit(EXIT_INPUT_ERROR);
                }
            }
        }
        None => None,
    };
    if (args.perm_index.is_some() || args.perm_sweep) && matrix.is_none() {
        eprintln!("Error: --perm-index/--perm-sweep need --perm");
        process::exit(EXIT_INPUT_ERROR);
    }

    // --- Phase 2: Run ---
    if args.perm_sweep {
        run_sweep(&args, &variable, matrix.as_ref().unwrap(), &series, &mask);
    } else {
        run_single(&args, variable, matrix.as_ref(), &series, &mask);
    }
}

/// One scan (optionally under a single permutation), with the full artifact
/// set and FDR thresholds.
fn run_single(
    args: &Args,
    variable: Array1<f64>,
    matrix: Option<&PermutationMatrix>,
    series: &vlsm::volume::Series,
    mask: &VolumeMask,
) {
    let variable = match (matrix, args.perm_index) {
        (Some(matrix), Some(index)) => match matrix.apply(index, variable.view()) {
            Ok(permuted) => permuted,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(EXIT_INPUT_ERROR);
            }
        },
        _ => variable,
    };

    let outputs = match run_scan(args, variable, series, mask) {
        Ok(outputs) => outputs,
        Err(message) => {
            eprintln!("{message}");
            process::exit(EXIT_INPUT_ERROR);
        }
    };
    eprintln!(
        "> Scan complete: {} voxels tested, {} unique patterns, {} gated",
        outputs.n_tested, outputs.n_unique_patterns, outputs.n_gated
    );

    let fdr_stats = fdr::fdr_thresholds(&outputs.p_collection, &args.q);
    for stat in &fdr_stats {
        eprintln!("> {}", stat.render());
    }

    // --- Phase 3: Persist artifacts; report each failure, attempt the rest ---
    let mut any_write_failed = false;
    let mut report = |path: &Path, result: Result<(), String>| {
        if let Err(message) = result {
            any_write_failed = true;
            eprintln!("Error writing '{}': {}", path.display(), message);
        } else {
            eprintln!("> Wrote {}", path.display());
        }
    };

    // The first threshold line rides along in the stat map's descrip; the
    // full set goes to the notes sidecar verbatim.
    let descrip = fdr_stats.first().map(FdrStat::render).unwrap_or_default();
    let stat_path = args.artifact("_stat.nii.gz");
    report(
        &stat_path,
        nifti::write_volume(&stat_path, &outputs.stat_map, &descrip).map_err(|e| e.to_string()),
    );

    if let Some(p_map) = &outputs.p_map {
        let p_path = args.artifact("_p.nii.gz");
        report(
            &p_path,
            nifti::write_volume(&p_path, p_map, "p-value map").map_err(|e| e.to_string()),
        );
    }

    if let Some(ci) = &outputs.ci {
        let ci_path = args.artifact("_ci.nii.gz");
        report(
            &ci_path,
            nifti::write_planes(&ci_path, &[&ci.lower, &ci.diff, &ci.upper], "ci planes")
                .map_err(|e| e.to_string()),
        );
    }

    if args.write_p_list {
        let list_path = args.artifact("_pvals.txt");
        let body: String =
            outputs.p_collection.iter().map(|e| format!("{}\n", e.p)).collect();
        report(&list_path, std::fs::write(&list_path, body).map_err(|e| e.to_string()));
    }

    let notes_path = args.artifact("_fdr.txt");
    let notes: String = fdr_stats.iter().map(|s| format!("{}\n", s.render())).collect();
    report(&notes_path, std::fs::write(&notes_path, notes).map_err(|e| e.to_string()));

    let json_path = args.artifact("_fdr.json");
    let json = serde_json::to_string_pretty(&fdr_stats).unwrap_or_default();
    report(&json_path, std::fs::write(&json_path, json).map_err(|e| e.to_string()));

    if any_write_failed {
        process::exit(EXIT_WRITE_ERROR);
    }
}

/// A permutation sweep: one scan per column of this part's range, one peak
/// statistic per line in the null-distribution file.
fn run_sweep(
    args: &Args,
    variable: &Array1<f64>,
    matrix: &PermutationMatrix,
    series: &vlsm::volume::Series,
    mask: &VolumeMask,
) {
    if args.perm_parts == 0 || args.perm_part >= args.perm_parts {
        eprintln!(
            "Error: part {} of {} is not a valid partition",
            args.perm_part, args.perm_parts
        );
        process::exit(EXIT_INPUT_ERROR);
    }
    let n_columns = matrix.n_columns();
    let per_part = n_columns.div_ceil(args.perm_parts);
    let start = args.perm_part * per_part;
    let end = ((args.perm_part + 1) * per_part).min(n_columns);
    eprintln!(
        "> Sweep part {}/{}: permutation columns {}..{}",
        args.perm_part + 1,
        args.perm_parts,
        start,
        end
    );

    let dist_path = args.artifact(&format!("_null_part{}.txt", args.perm_part));
    let mut dist_file = match OpenOptions::new().create(true).append(true).open(&dist_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", dist_path.display(), e);
            process::exit(EXIT_WRITE_ERROR);
        }
    };

    for column in start..end {
        let permuted = match matrix.apply(column, variable.view()) {
            Ok(permuted) => permuted,
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(EXIT_INPUT_ERROR);
            }
        };
        let outputs = match run_scan(args, permuted, series, mask) {
            Ok(outputs) => outputs,
            Err(message) => {
                eprintln!("{message}");
                process::exit(EXIT_INPUT_ERROR);
            }
        };
        let peak = outputs.peak_statistic().unwrap_or(0.0);
        if let Err(e) = writeln!(dist_file, "{peak}") {
            eprintln!("Error writing '{}': {}", dist_path.display(), e);
            process::exit(EXIT_WRITE_ERROR);
        }
    }
    eprintln!("> Wrote {}", dist_path.display());
}

fn run_scan(
    args: &Args,
    variable: Array1<f64>,
    series: &vlsm::volume::Series,
    mask: &VolumeMask,
) -> Result<ScanOutputs, String> {
    let scanner = Scanner::new(args.scan_config(), variable)
        .map_err(|e| format!("Error configuring scan: {e}"))?;
    scanner
        .scan(series, mask)
        .map_err(|e| format!("Error during scan: {e}"))
}
