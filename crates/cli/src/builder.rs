use crate::catalog::CatalogRepo;
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use ignore::WalkBuilder;
use indexserver_protocol::{Branch, RepoId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Produces the content section of a repository's simple shard.
#[async_trait]
pub trait ShardBuilder: Send + Sync {
    async fn build(&self, repo: &CatalogRepo) -> Result<Vec<u8>>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RepoManifest {
    pub id: RepoId,
    pub name: String,
    pub branches: Vec<Branch>,
    pub files: Vec<String>,
}

/// Writes a JSON manifest of the repository: its branch set and, when the
/// catalog names a local checkout, the files a text index would cover.
#[derive(Default)]
pub struct ManifestBuilder;

#[async_trait]
impl ShardBuilder for ManifestBuilder {
    async fn build(&self, repo: &CatalogRepo) -> Result<Vec<u8>> {
        let files = match repo.path.clone() {
            Some(root) => tokio::task::spawn_blocking(move || list_files(&root))
                .await
                .context("File listing task failed")??,
            None => Vec::new(),
        };
        let manifest = RepoManifest {
            id: repo.id,
            name: repo.name.clone(),
            branches: repo.branches.clone(),
            files,
        };
        Ok(serde_json::to_vec(&manifest)?)
    }
}

/// Relative paths of every non-ignored file under `root`, sorted.
fn list_files(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        anyhow::bail!("Repository checkout {} is not a directory", root.display());
    }
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(true)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(true)
        .require_git(false);

    let mut files = Vec::new();
    for result in builder.build() {
        match result {
            Ok(entry) => {
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                let rel: PathBuf = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .to_path_buf();
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
            Err(e) => log::warn!("Failed to read entry: {e}"),
        }
    }
    files.sort();
    log::debug!("Listed {} files under {}", files.len(), root.display());
    Ok(files)
}
