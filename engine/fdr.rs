//! False-discovery-rate thresholds via the Benjamini-Hochberg step-up
//! procedure.
//!
//! The scan driver hands over one p-value collection (each p paired with the
//! statistic of the voxel it came from). The collection is sorted once; each
//! requested q value is then answered independently against the same sorted
//! order: find the maximal 1-based rank i with `p(i) <= (i / V) * q`. The
//! statistic paired with that rank becomes the threshold a voxel's statistic
//! must equal or exceed to survive FDR control at level q. Finding no such
//! rank is a valid outcome (`maxind = -1`), not an error.

use serde::Serialize;

/// One tested voxel's contribution to the FDR computation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PEntry {
    pub p: f64,
    pub statistic: f64,
}

/// The outcome of the step-up procedure for a single q.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FdrStat {
    /// Target false-discovery rate.
    pub q: f64,
    /// Statistic threshold, absent when no rank satisfied the criterion.
    pub statval: Option<f64>,
    /// Smallest p among eligible voxels.
    pub low: f64,
    /// Largest p among eligible voxels.
    pub high: f64,
    /// Number of eligible voxels (V in the step-up criterion).
    pub nvoxels: usize,
    /// Zero-based index of the maximal qualifying rank, -1 when none.
    pub maxind: i64,
}

impl FdrStat {
    /// The exact textual rendering consumed by downstream tooling. The
    /// key/value layout must not change.
    pub fn render(&self) -> String {
        match self.statval {
            Some(statval) => format!("fdrthresh: {} {}", self.q, statval),
            None => format!("fdrthresh: {} none", self.q),
        }
    }
}

/// Runs the step-up procedure once per q over a shared sorted collection.
pub fn fdr_thresholds(entries: &[PEntry], qs: &[f64]) -> Vec<FdrStat> {
    let mut sorted: Vec<PEntry> = entries.to_vec();
    sorted.sort_by(|a, b| a.p.total_cmp(&b.p));
    let v = sorted.len();
    let (low, high) = match (sorted.first(), sorted.last()) {
        (Some(first), Some(last)) => (first.p, last.p),
        _ => (f64::NAN, f64::NAN),
    };
    qs.iter()
        .map(|&q| {
            let mut maxind: i64 = -1;
            for (i, entry) in sorted.iter().enumerate() {
                let rank = (i + 1) as f64;
                if entry.p <= rank / v as f64 * q {
                    maxind = i as i64;
                }
            }
            FdrStat {
                q,
                statval: (maxind >= 0).then(|| sorted[maxind as usize].statistic),
                low,
                high,
                nvoxels: v,
                maxind,
            }
        })
        .collect()
}
