use indexserver_protocol::RepoId;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BinOutcome {
    Unchanged,
    Merged { output_size: u64 },
    /// An input was leased by an indexing worker or another merge.
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinReport {
    pub target_path: PathBuf,
    pub inputs: Vec<PathBuf>,
    pub repository_ids: Vec<RepoId>,
    pub input_size: u64,
    #[serde(flatten)]
    pub outcome: BinOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub simulated: bool,
    pub target_size: u64,
    pub bins: Vec<BinReport>,
}

impl MergeReport {
    pub fn merged(&self) -> usize {
        self.bins
            .iter()
            .filter(|b| matches!(b.outcome, BinOutcome::Merged { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.bins
            .iter()
            .filter(|b| matches!(b.outcome, BinOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Temp files that were valid and got renamed into place.
    pub completed: Vec<PathBuf>,
    /// Temp files that were torn or already superseded.
    pub discarded: Vec<PathBuf>,
    /// Inputs of an earlier merge that were still on disk.
    pub finished_replacements: Vec<PathBuf>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.discarded.is_empty() && self.finished_replacements.is_empty()
    }
}

/// Everything one merge cycle did, or would do when simulated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeRun {
    pub recovery: RecoveryReport,
    pub vacuumed: Vec<PathBuf>,
    /// Shards left out of planning because they were leased.
    pub skipped: Vec<PathBuf>,
    pub report: MergeReport,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Human-readable summary of a merge cycle.
pub fn render_merge_run(run: &MergeRun) -> String {
    let mut out = String::new();
    let report = &run.report;
    if report.simulated {
        out.push_str("simulation: no files were changed\n");
    }

    for path in &run.recovery.completed {
        let _ = writeln!(out, "recovered {}", file_name(path));
    }
    for path in &run.recovery.discarded {
        let _ = writeln!(out, "discarded {}", file_name(path));
    }
    for path in &run.recovery.finished_replacements {
        let _ = writeln!(out, "removed leftover input {}", file_name(path));
    }
    for path in &run.vacuumed {
        let _ = writeln!(out, "vacuum {}", file_name(path));
    }
    for path in &run.skipped {
        let _ = writeln!(out, "skipped busy shard {}", file_name(path));
    }

    for bin in &report.bins {
        let inputs: Vec<String> = bin.inputs.iter().map(|p| file_name(p)).collect();
        let target = file_name(&bin.target_path);
        let line = match &bin.outcome {
            BinOutcome::Unchanged => format!("keep {target} ({})", format_bytes(bin.input_size)),
            BinOutcome::Merged { output_size } => format!(
                "merge {} -> {target} ({})",
                inputs.join(" + "),
                format_bytes(*output_size)
            ),
            BinOutcome::Skipped { reason } => {
                format!("skip {}: {reason}", inputs.join(" + "))
            }
            BinOutcome::Failed { error } => {
                format!("failed {} -> {target}: {error}", inputs.join(" + "))
            }
        };
        out.push_str(&line);
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "{} bin(s), {} merged, {} failed, target {}",
        report.bins.len(),
        report.merged(),
        report.failed(),
        format_bytes(report.target_size)
    );
    out
}
