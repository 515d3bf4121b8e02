use crate::naming::compound_shard_name;
use crate::shard::ShardMeta;
use indexserver_protocol::RepoId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;

/// A group of shards that becomes one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bin {
    pub inputs: Vec<ShardMeta>,
    pub target_path: PathBuf,
    /// Generation of the output; for a single-shard bin, the input's own.
    pub generation: u64,
}

impl Bin {
    pub fn total_size(&self) -> u64 {
        self.inputs.iter().map(|s| s.size).sum()
    }

    /// Single-shard bins leave their shard as it is.
    pub fn is_noop(&self) -> bool {
        self.inputs.len() < 2
    }

    pub fn repository_ids(&self) -> Vec<RepoId> {
        let mut ids: Vec<RepoId> = self
            .inputs
            .iter()
            .flat_map(|s| s.repository_ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePlan {
    pub bins: Vec<Bin>,
    pub target_size: u64,
    pub simulate: bool,
}

impl MergePlan {
    #[must_use]
    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Bins that actually merge something.
    pub fn merges(&self) -> impl Iterator<Item = &Bin> {
        self.bins.iter().filter(|b| !b.is_noop())
    }
}

struct OpenBin<'a> {
    inputs: Vec<&'a ShardMeta>,
    size: u64,
    ids: HashSet<RepoId>,
    closed: bool,
}

impl OpenBin<'_> {
    fn accepts(&self, shard: &ShardMeta, target_size: u64) -> bool {
        !self.closed
            && self.size.saturating_add(shard.size) <= target_size
            && shard.repository_ids.iter().all(|id| !self.ids.contains(id))
    }
}

/// First-fit bin packing of `shards` into bins of at most `target_size`
/// bytes.
///
/// Shards are visited in path order, so the result depends only on the set
/// of inputs. A shard at or above `target_size` gets a bin of its own that
/// nothing else joins. No shard is split and no bin holds a repository twice.
pub fn plan(shards: &[ShardMeta], target_size: u64) -> MergePlan {
    let mut ordered: Vec<&ShardMeta> = shards.iter().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    let mut open: Vec<OpenBin<'_>> = Vec::new();
    for shard in ordered {
        let oversized = shard.size >= target_size;
        let slot = if oversized {
            None
        } else {
            open.iter_mut().find(|bin| bin.accepts(shard, target_size))
        };
        match slot {
            Some(bin) => {
                bin.size += shard.size;
                bin.ids.extend(shard.repository_ids.iter().copied());
                bin.inputs.push(shard);
            }
            None => open.push(OpenBin {
                inputs: vec![shard],
                size: shard.size,
                ids: shard.repository_ids.iter().copied().collect(),
                closed: oversized,
            }),
        }
    }

    let bins = open.into_iter().map(close_bin).collect();
    MergePlan {
        bins,
        target_size,
        simulate: false,
    }
}

fn close_bin(bin: OpenBin<'_>) -> Bin {
    let inputs: Vec<ShardMeta> = bin.inputs.into_iter().cloned().collect();
    if inputs.len() == 1 {
        let input = &inputs[0];
        return Bin {
            target_path: input.path.clone(),
            generation: input.generation,
            inputs,
        };
    }

    let generation = inputs.iter().map(|s| s.generation).max().unwrap_or(0) + 1;
    let ids: Vec<RepoId> = bin.ids.into_iter().collect();
    let dir = inputs[0]
        .path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    Bin {
        target_path: dir.join(compound_shard_name(&ids, generation)),
        generation,
        inputs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MB: u64 = 1024 * 1024;

    fn shard(name: &str, size: u64, ids: &[RepoId], generation: u64) -> ShardMeta {
        ShardMeta {
            path: PathBuf::from(format!("/idx/{name}")),
            size,
            repository_ids: ids.to_vec(),
            generation,
        }
    }

    fn names(plan: &MergePlan) -> Vec<Vec<String>> {
        plan.bins
            .iter()
            .map(|b| b.inputs.iter().map(ShardMeta::file_name).collect())
            .collect()
    }

    #[test]
    fn worked_example_packs_first_fit() {
        let shards = vec![
            shard("a.shard", 10 * MB, &[1], 1),
            shard("b.shard", 15 * MB, &[2], 2),
            shard("c.shard", 80 * MB, &[3], 3),
            shard("d.shard", 5 * MB, &[4], 4),
        ];
        let plan = plan(&shards, 20 * MB);

        assert_eq!(
            names(&plan),
            vec![
                vec!["a.shard".to_string(), "d.shard".to_string()],
                vec!["b.shard".to_string()],
                vec!["c.shard".to_string()],
            ]
        );
        assert_eq!(plan.bins[0].total_size(), 15 * MB);
        assert_eq!(plan.merges().count(), 1);
        assert_eq!(plan.bins[0].generation, 5);
        assert_eq!(plan.bins[1].target_path, PathBuf::from("/idx/b.shard"));
    }

    #[test]
    fn plan_is_deterministic_regardless_of_input_order() {
        let mut shards: Vec<ShardMeta> = (0..40u32)
            .map(|i| shard(&format!("s{i:02}.shard"), u64::from(i % 9 + 1) * MB, &[i], u64::from(i)))
            .collect();
        let first = plan(&shards, 12 * MB);
        let again = plan(&shards, 12 * MB);
        shards.reverse();
        let reversed = plan(&shards, 12 * MB);
        assert_eq!(first, again);
        assert_eq!(first, reversed);
    }

    #[test]
    fn bins_never_overflow_or_repeat_repositories() {
        let shards: Vec<ShardMeta> = (0..60u32)
            .map(|i| {
                let ids = [i % 17, 100 + i % 5];
                shard(&format!("s{i:02}.shard"), u64::from(i * 7 % 23 + 1) * MB, &ids, 1)
            })
            .collect();
        let target = 20 * MB;
        let plan = plan(&shards, target);

        let mut seen = 0;
        for bin in &plan.bins {
            seen += bin.inputs.len();
            assert!(bin.total_size() <= target || bin.inputs.len() == 1);
            let ids = bin.repository_ids();
            let unique: HashSet<RepoId> = ids.iter().copied().collect();
            assert_eq!(ids.len(), unique.len(), "duplicate repository in bin");
        }
        assert_eq!(seen, shards.len());
    }

    #[test]
    fn shard_at_target_size_stays_alone() {
        let shards = vec![
            shard("a.shard", 20 * MB, &[1], 1),
            shard("b.shard", 1, &[2], 1),
        ];
        let plan = plan(&shards, 20 * MB);
        assert_eq!(plan.bins.len(), 2);
        assert!(plan.bins.iter().all(Bin::is_noop));
    }

    #[test]
    fn shared_repository_forces_separate_bins() {
        let shards = vec![
            shard("a.shard", MB, &[1, 2], 1),
            shard("b.shard", MB, &[2], 2),
            shard("c.shard", MB, &[3], 3),
        ];
        let plan = plan(&shards, 10 * MB);
        assert_eq!(
            names(&plan),
            vec![
                vec!["a.shard".to_string(), "c.shard".to_string()],
                vec!["b.shard".to_string()],
            ]
        );
    }

    #[test]
    fn empty_input_gives_empty_plan() {
        let plan = plan(&[], MB).with_simulate(true);
        assert!(plan.bins.is_empty());
        assert!(plan.simulate);
    }
}
