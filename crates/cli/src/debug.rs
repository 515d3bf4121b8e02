use crate::catalog::{FileCatalog, RepositoryCatalog};
use crate::config::{mib_to_bytes, resolve_index_dir, resolve_target_size_mib};
use crate::server::IndexServer;
use crate::{
    print_stdout, IndexArgs, ListArgs, ListIndexedArgs, ManifestBuilder, MergeArgs, MetaArgs,
    QueueArgs,
};
use anyhow::{Context as AnyhowContext, Result};
use indexserver_protocol::{parse_branches, RepoId};
use indexserver_shards::{
    render_merge_run, verify_shard, LeaseTable, MergeEngine, MergeRun, ShardStore,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Writable unless `read_only`; a writable open fails while `serve` or
/// another writing command holds the directory.
fn open_store(dir: &Path, read_only: bool) -> Result<ShardStore> {
    let store = if read_only {
        ShardStore::open_read_only(dir)
    } else {
        ShardStore::open(dir)
    };
    store.with_context(|| format!("Failed to open shard directory {}", dir.display()))
}

pub(crate) async fn run_merge(args: MergeArgs) -> Result<()> {
    let dir = resolve_index_dir(args.index);
    let target_size = mib_to_bytes(resolve_target_size_mib(args.merge_target_size));
    let simulate = args.simulate;

    let run = tokio::task::spawn_blocking(move || -> Result<MergeRun> {
        let store = Arc::new(open_store(&dir, simulate)?);
        let engine = MergeEngine::new(store, LeaseTable::new());
        Ok(engine.run(target_size, simulate)?)
    })
    .await??;

    if args.json {
        print_stdout(&serde_json::to_string_pretty(&run)?)?;
    } else {
        print_stdout(render_merge_run(&run).trim_end())?;
    }

    let failed = run.report.failed();
    if failed > 0 {
        anyhow::bail!("{failed} bin(s) failed to merge");
    }
    Ok(())
}

pub(crate) async fn run_queue(args: QueueArgs) -> Result<()> {
    let url = format!("http://{}:{}/debug/queue", args.hostname, args.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {url}"))?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("{url} returned {status}: {body}");
    }
    print_stdout(body.trim_end())
}

pub(crate) async fn run_list_indexed(args: ListIndexedArgs) -> Result<()> {
    let dir = resolve_index_dir(args.index);
    let indexed = tokio::task::spawn_blocking(move || -> Result<_> {
        Ok(open_store(&dir, true)?.indexed()?)
    })
    .await??;

    if args.json {
        let rows: Vec<serde_json::Value> = indexed
            .iter()
            .map(|(id, repo)| {
                serde_json::json!({
                    "id": id,
                    "name": repo.name,
                    "branches": repo.branches,
                    "shard": repo.shard,
                })
            })
            .collect();
        return print_stdout(&serde_json::to_string_pretty(&rows)?);
    }

    let ids: Vec<String> = indexed.keys().map(ToString::to_string).collect();
    if ids.is_empty() {
        return Ok(());
    }
    print_stdout(&ids.join("\n"))
}

/// Repository ids this server is responsible for: the catalog, plus
/// repositories still indexed here unless `--exclude-indexed` is given.
pub(crate) async fn run_list(args: ListArgs) -> Result<()> {
    let catalog = FileCatalog::new(&args.catalog);
    let mut ids: BTreeSet<RepoId> = catalog.list().await?.iter().map(|r| r.id).collect();

    let dir = resolve_index_dir(args.index);
    if !args.exclude_indexed && dir.is_dir() {
        let indexed = tokio::task::spawn_blocking(move || -> Result<_> {
            Ok(open_store(&dir, true)?.indexed()?)
        })
        .await??;
        ids.extend(indexed.into_keys());
    }

    let lines: Vec<String> = ids.iter().map(ToString::to_string).collect();
    if lines.is_empty() {
        return Ok(());
    }
    print_stdout(&lines.join("\n"))
}

pub(crate) async fn run_meta(args: MetaArgs) -> Result<()> {
    let path = args.shard;
    let shard = tokio::task::spawn_blocking(move || verify_shard(&path)).await??;
    let out = serde_json::json!({
        "path": shard.path,
        "size": shard.len,
        "header": shard.header,
    });
    print_stdout(&serde_json::to_string_pretty(&out)?)
}

pub(crate) async fn run_index(args: IndexArgs) -> Result<()> {
    let catalog = Arc::new(FileCatalog::new(&args.catalog));
    let mut repo = catalog
        .get(args.id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Repository {} is not in {}", args.id, args.catalog.display()))?;

    if let Some(raw) = args.branches.as_deref() {
        repo.branches = parse_branches(raw)
            .map_err(|err| anyhow::anyhow!("Invalid --branches: {err}"))?;
    }

    let index_dir = resolve_index_dir(args.index);
    std::fs::create_dir_all(&index_dir)?;
    let server = IndexServer::open(&index_dir, catalog, Arc::new(ManifestBuilder)).await?;
    let meta = server.index_repo(repo).await?;
    print_stdout(&format!(
        "indexed repository {} into {}",
        args.id,
        meta.path.display()
    ))
}
