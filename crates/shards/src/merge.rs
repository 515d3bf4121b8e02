use crate::format::{
    read_header, verify_shard, write_shard, RepoSection, SectionSource, ShardFile, ShardHeader,
};
use crate::fsutil::{commit_file, discard, remove_if_exists, stage_file, sync_dir};
use crate::lease::{try_acquire_merge_lock, LeaseTable, MergeLock, ShardLease};
use crate::naming::{final_path_for, is_shard_file, parse_shard_name, temp_path_for, ShardName};
use crate::plan::{plan, Bin, MergePlan};
use crate::report::{BinOutcome, BinReport, MergeReport, MergeRun, RecoveryReport};
use crate::shard::Shard;
use crate::store::{RecoveryView, ShardStore};
use crate::{Result, ShardError};
use indexserver_protocol::RepoId;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A compound shard written to its temp path but not yet renamed into place.
#[derive(Debug)]
pub struct StagedBin {
    temp_path: PathBuf,
    target_path: PathBuf,
    inputs: Vec<PathBuf>,
    generation: u64,
    size: u64,
}

impl StagedBin {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Sections of the output in id order, each pointing into its input file.
struct Layout {
    header: ShardHeader,
    sources: Vec<(PathBuf, u64)>,
}

impl Layout {
    /// Keeps only sections whose newest copy is in the input they came from.
    fn new(bin: &Bin, files: &[ShardFile], live: &HashMap<RepoId, PathBuf>) -> Self {
        let mut picked: Vec<(RepoSection, PathBuf, u64)> = Vec::new();
        for file in files {
            for section in &file.header.repos {
                if live.get(&section.id) == Some(&file.path) {
                    picked.push((section.clone(), file.path.clone(), file.section_start(section)));
                }
            }
        }
        picked.sort_by_key(|(section, _, _)| section.id);
        picked.dedup_by_key(|(section, _, _)| section.id);

        let replaces = files
            .iter()
            .filter_map(|f| f.path.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        let (repos, sources): (Vec<RepoSection>, Vec<(PathBuf, u64)>) = picked
            .into_iter()
            .map(|(section, path, offset)| (section, (path, offset)))
            .unzip();
        Self {
            header: ShardHeader::new(bin.generation, repos, replaces),
            sources,
        }
    }

    fn is_empty(&self) -> bool {
        self.header.repos.is_empty()
    }
}

struct LeasedInputs {
    files: Vec<ShardFile>,
    _leases: Vec<ShardLease>,
}

enum Pending {
    Done(BinOutcome),
    Leased(LeasedInputs),
}

/// Compacts a shard directory: recovery of interrupted merges, removal of
/// dead shards, and bin-packed merging of the rest.
pub struct MergeEngine {
    store: Arc<ShardStore>,
    leases: Arc<LeaseTable>,
}

impl MergeEngine {
    pub fn new(store: Arc<ShardStore>, leases: Arc<LeaseTable>) -> Self {
        Self { store, leases }
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    fn merge_lock(&self, simulate: bool) -> Result<Option<MergeLock>> {
        if simulate {
            return Ok(None);
        }
        self.store.ensure_writable()?;
        try_acquire_merge_lock(self.store.dir()).map(Some)
    }

    /// Finishes or undoes whatever an interrupted merge left behind.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let _lock = self.merge_lock(false)?;
        self.recover_locked(false)
    }

    /// With `simulate`, only reports what would be done.
    fn recover_locked(&self, simulate: bool) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for temp in self.store.temp_files()? {
            let Some(target) = final_path_for(&temp) else {
                continue;
            };
            if self.written_by_worker(&target) {
                debug!("leaving {} to its indexing worker", temp.display());
                continue;
            }
            let valid = match verify_shard(&temp) {
                Ok(file) => Some(file),
                Err(err) => {
                    debug!("temp file {} is not a finished shard: {err}", temp.display());
                    None
                }
            };
            match valid {
                Some(_) if simulate && !target.exists() => report.completed.push(target),
                Some(file) if !target.exists() => {
                    commit_file(&temp, &target)?;
                    self.store.observe_generation(file.header.generation);
                    info!("recovered interrupted write {}", target.display());
                    report.completed.push(target);
                }
                _ => {
                    if !simulate {
                        discard(&temp);
                        info!("discarded {}", temp.display());
                    }
                    report.discarded.push(temp);
                }
            }
        }

        // Files renamed above are already on disk; a preview reads them from
        // their temp paths instead.
        let view = if simulate {
            RecoveryView::preview(&report)
        } else {
            RecoveryView::default()
        };
        let mut paths = self.store.shard_paths()?;
        paths.extend(report.completed.iter().cloned());
        paths.sort();
        paths.dedup();

        for path in paths {
            let source = view.source(&path);
            let Ok(file) = read_header(source) else {
                continue;
            };
            let leftovers: Vec<PathBuf> = file
                .header
                .replaces
                .iter()
                .filter_map(|name| replaced_path(self.store.dir(), name))
                .filter(|old| old != &path && old.exists())
                .filter(|old| !report.finished_replacements.contains(old))
                .collect();
            if leftovers.is_empty() {
                continue;
            }
            if let Err(err) = verify_shard(source) {
                warn!("not finishing replacements of {}: {err}", path.display());
                continue;
            }
            for old in leftovers {
                if simulate {
                    report.finished_replacements.push(old);
                } else if remove_if_exists(&old)? {
                    info!("removed {} superseded by {}", old.display(), path.display());
                    report.finished_replacements.push(old);
                }
            }
        }
        report.finished_replacements.sort();
        if !simulate && !report.finished_replacements.is_empty() {
            sync_dir(self.store.dir())?;
        }
        Ok(report)
    }

    fn written_by_worker(&self, target: &Path) -> bool {
        let name = target.file_name().and_then(|n| n.to_str());
        match name.and_then(parse_shard_name) {
            Some(ShardName::Simple { repo_id, .. }) => self.leases.is_repo_leased(repo_id),
            _ => false,
        }
    }

    /// Carries out `plan`. Lease conflicts and per-bin I/O failures are
    /// reported on the bin; only setup failures return `Err`.
    pub fn execute(&self, plan: &MergePlan) -> Result<MergeReport> {
        let _lock = self.merge_lock(plan.simulate)?;
        self.execute_locked(plan, &RecoveryView::default())
    }

    fn execute_locked(&self, plan: &MergePlan, view: &RecoveryView) -> Result<MergeReport> {
        let pending: Vec<Pending> = plan
            .bins
            .iter()
            .map(|bin| {
                if bin.is_noop() {
                    Pending::Done(BinOutcome::Unchanged)
                } else {
                    self.lease_inputs(bin, view)
                }
            })
            .collect();

        let live = if pending.iter().any(|p| matches!(p, Pending::Leased(_))) {
            self.live_locations(view)?
        } else {
            HashMap::new()
        };

        let mut bins = Vec::with_capacity(plan.bins.len());
        for (bin, pending) in plan.bins.iter().zip(pending) {
            let outcome = match pending {
                Pending::Done(outcome) => outcome,
                Pending::Leased(inputs) => self.merge_leased(bin, inputs, &live, plan.simulate),
            };
            bins.push(BinReport {
                target_path: bin.target_path.clone(),
                inputs: bin.inputs.iter().map(|m| m.path.clone()).collect(),
                repository_ids: bin.repository_ids(),
                input_size: bin.total_size(),
                outcome,
            });
        }

        Ok(MergeReport {
            simulated: plan.simulate,
            target_size: plan.target_size,
            bins,
        })
    }

    fn lease_inputs(&self, bin: &Bin, view: &RecoveryView) -> Pending {
        let mut files = Vec::with_capacity(bin.inputs.len());
        let mut leases = Vec::with_capacity(bin.inputs.len());
        for input in &bin.inputs {
            let file = match read_header(view.source(&input.path)) {
                Ok(mut file) => {
                    file.path = input.path.clone();
                    file
                }
                Err(ShardError::IoError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Pending::Done(BinOutcome::Skipped {
                        reason: format!("{} no longer exists", input.file_name()),
                    });
                }
                Err(err) => {
                    return Pending::Done(BinOutcome::Failed {
                        error: err.to_string(),
                    })
                }
            };
            let members: Vec<RepoId> = file.header.repos.iter().map(|s| s.id).collect();
            let Some(lease) = self.leases.try_lease_shard(&file.path, &members) else {
                debug!("{} is leased, skipping its bin", input.path.display());
                return Pending::Done(BinOutcome::Skipped {
                    reason: format!("{} is in use", input.file_name()),
                });
            };
            leases.push(lease);
            files.push(file);
        }
        Pending::Leased(LeasedInputs {
            files,
            _leases: leases,
        })
    }

    fn live_locations(&self, view: &RecoveryView) -> Result<HashMap<RepoId, PathBuf>> {
        Ok(self
            .store
            .indexed_in(view)?
            .into_iter()
            .map(|(id, repo)| (id, repo.shard))
            .collect())
    }

    fn merge_leased(
        &self,
        bin: &Bin,
        inputs: LeasedInputs,
        live: &HashMap<RepoId, PathBuf>,
        simulate: bool,
    ) -> BinOutcome {
        let layout = Layout::new(bin, &inputs.files, live);
        if layout.is_empty() {
            return BinOutcome::Skipped {
                reason: "inputs were superseded after planning".to_string(),
            };
        }

        let result = if simulate {
            layout.header.encoded_file_len()
        } else {
            self.stage_layout(bin, layout)
                .and_then(|staged| self.commit_bin(staged))
        };
        match result {
            Ok(output_size) => BinOutcome::Merged { output_size },
            Err(err) => {
                warn!("merge into {} failed: {err}", bin.target_path.display());
                BinOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Writes the merged shard for `bin` to its temp path and syncs it. The
    /// caller must keep other writers away from the inputs until
    /// [`commit_bin`](Self::commit_bin) returns.
    pub fn stage_bin(&self, bin: &Bin) -> Result<StagedBin> {
        self.store.ensure_writable()?;
        let files = bin
            .inputs
            .iter()
            .map(|input| read_header(&input.path))
            .collect::<Result<Vec<_>>>()?;
        let layout = Layout::new(bin, &files, &self.live_locations(&RecoveryView::default())?);
        if layout.is_empty() {
            return Err(ShardError::InvalidInput(format!(
                "no live sections left for {}",
                bin.target_path.display()
            )));
        }
        self.stage_layout(bin, layout)
    }

    fn stage_layout(&self, bin: &Bin, layout: Layout) -> Result<StagedBin> {
        let temp_path = temp_path_for(&bin.target_path);
        let sources: Vec<SectionSource<'_>> = layout
            .sources
            .into_iter()
            .map(|(path, offset)| SectionSource::File { path, offset })
            .collect();
        let size = stage_file(&temp_path, |out| write_shard(out, &layout.header, &sources))?;
        debug!("staged {} ({size} bytes)", temp_path.display());
        Ok(StagedBin {
            temp_path,
            target_path: bin.target_path.clone(),
            inputs: bin.inputs.iter().map(|m| m.path.clone()).collect(),
            generation: bin.generation,
            size,
        })
    }

    /// Renames a staged shard into place, then deletes its inputs. A failed
    /// deletion is left for [`recover`](Self::recover) to finish.
    pub fn commit_bin(&self, staged: StagedBin) -> Result<u64> {
        self.store.ensure_writable()?;
        commit_file(&staged.temp_path, &staged.target_path)?;
        self.store.observe_generation(staged.generation);
        info!(
            "merged {} shard(s) into {} ({} bytes)",
            staged.inputs.len(),
            staged.target_path.display(),
            staged.size
        );

        for input in staged.inputs.iter().filter(|p| **p != staged.target_path) {
            if let Err(err) = remove_if_exists(input) {
                warn!("could not remove merged input {}: {err}", input.display());
            }
        }
        if let Err(err) = sync_dir(self.store.dir()) {
            warn!("could not sync {}: {err}", self.store.dir().display());
        }
        Ok(staged.size)
    }

    /// Deletes shards with no live section. Busy ones go to `skipped`.
    fn vacuum(
        &self,
        dead: Vec<Shard>,
        simulate: bool,
        skipped: &mut Vec<PathBuf>,
    ) -> Result<Vec<PathBuf>> {
        let mut vacuumed = Vec::new();
        for shard in dead {
            let path = shard.meta().path.clone();
            let Some(_lease) = self.leases.try_lease_shard(&path, &shard.member_ids()) else {
                skipped.push(path);
                continue;
            };
            if simulate || remove_if_exists(&path)? {
                info!("vacuum {}", path.display());
                vacuumed.push(path);
            }
        }
        if !simulate && !vacuumed.is_empty() {
            sync_dir(self.store.dir())?;
        }
        Ok(vacuumed)
    }

    /// One full merge cycle. With `simulate`, the directory is left
    /// untouched and the result, recovery included, describes what a real
    /// run would do.
    pub fn run(&self, target_size: u64, simulate: bool) -> Result<MergeRun> {
        if target_size == 0 {
            return Err(ShardError::InvalidInput(
                "merge target size must be positive".to_string(),
            ));
        }
        let _lock = self.merge_lock(simulate)?;
        let recovery = self.recover_locked(simulate)?;
        let view = if simulate {
            RecoveryView::preview(&recovery)
        } else {
            RecoveryView::default()
        };

        let (dead, live): (Vec<Shard>, Vec<Shard>) =
            self.store.scan_in(&view)?.into_iter().partition(Shard::is_dead);
        let mut skipped = Vec::new();
        let vacuumed = self.vacuum(dead, simulate, &mut skipped)?;

        let mut candidates = Vec::with_capacity(live.len());
        for shard in live {
            if self
                .leases
                .shard_conflicts(&shard.meta().path, &shard.member_ids())
            {
                skipped.push(shard.into_meta().path);
            } else {
                candidates.push(shard.into_meta());
            }
        }

        let plan = plan(&candidates, target_size).with_simulate(simulate);
        debug!(
            "planned {} bin(s) over {} shard(s), {} merge(s)",
            plan.bins.len(),
            candidates.len(),
            plan.merges().count()
        );
        let report = self.execute_locked(&plan, &view)?;
        Ok(MergeRun {
            recovery,
            vacuumed,
            skipped,
            report,
        })
    }
}

/// Resolves a `replaces` entry to a shard path inside `dir`, refusing
/// anything that is not a bare shard file name.
fn replaced_path(dir: &Path, name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.file_name().and_then(|n| n.to_str()) != Some(name) || !is_shard_file(candidate) {
        return None;
    }
    Some(dir.join(candidate))
}
