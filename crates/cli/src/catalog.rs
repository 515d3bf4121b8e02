use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use indexserver_protocol::{Branch, Priority, RepoId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One repository the index server is expected to keep indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRepo {
    pub id: RepoId,
    pub name: String,
    #[serde(default)]
    pub priority: Priority,
    pub branches: Vec<Branch>,
    /// Local checkout to list files from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Source of truth for which repositories exist and which branch versions
/// should be indexed.
#[async_trait]
pub trait RepositoryCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<CatalogRepo>>;

    async fn get(&self, id: RepoId) -> Result<Option<CatalogRepo>> {
        Ok(self.list().await?.into_iter().find(|repo| repo.id == id))
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    repositories: Vec<CatalogRepo>,
}

/// Catalog backed by a JSON document of the form
/// `{"repositories": [{"id": 1, "name": "...", "branches": [...]}]}`.
/// The file is re-read on every call so edits apply on the next
/// reconciliation.
pub struct FileCatalog {
    path: PathBuf,
}

impl FileCatalog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl RepositoryCatalog for FileCatalog {
    async fn list(&self) -> Result<Vec<CatalogRepo>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read catalog {}", self.path.display()))?;
        let doc: CatalogDocument = serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid catalog {}", self.path.display()))?;

        let mut seen = HashSet::new();
        for repo in &doc.repositories {
            if !seen.insert(repo.id) {
                anyhow::bail!(
                    "Catalog {} lists repository {} twice",
                    self.path.display(),
                    repo.id
                );
            }
        }
        Ok(doc.repositories)
    }
}

/// Branch sets compare as sets; catalog order is not significant.
pub(crate) fn branches_differ(desired: &[Branch], indexed: Option<&[Branch]>) -> bool {
    let Some(indexed) = indexed else {
        return true;
    };
    let mut a = desired.to_vec();
    let mut b = indexed.to_vec();
    a.sort();
    b.sort();
    a != b
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_catalog_reads_repositories() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"repositories":[
                {"id":1,"name":"acme/web","priority":2.5,"branches":[{"name":"main","version":"abc"}]},
                {"id":2,"name":"acme/api","branches":[]}
            ]}"#,
        )
        .unwrap();

        let catalog = FileCatalog::new(&path);
        let repos = catalog.list().await.unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].priority, 2.5);
        assert_eq!(repos[1].priority, 0.0);
        assert_eq!(
            catalog.get(1).await.unwrap().map(|r| r.name),
            Some("acme/web".to_string())
        );
        assert!(catalog.get(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"repositories":[{"id":1,"name":"a","branches":[]},{"id":1,"name":"b","branches":[]}]}"#,
        )
        .unwrap();
        let err = FileCatalog::new(&path).list().await.unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn branch_comparison_ignores_order() {
        let a = vec![Branch::new("main", "1"), Branch::new("dev", "2")];
        let b = vec![Branch::new("dev", "2"), Branch::new("main", "1")];
        assert!(!branches_differ(&a, Some(&b)));
        assert!(branches_differ(&a, Some(&b[..1])));
        assert!(branches_differ(&a, None));
    }
}
