use crate::bind_guard::resolve_guarded_listen_addr;
use crate::builder::ShardBuilder;
use crate::catalog::{branches_differ, CatalogRepo, RepositoryCatalog};
use crate::http_api::{error_response, json_response, text_response};
use anyhow::{Context as AnyhowContext, Result};
use axum::{http::StatusCode, http::Uri, response::Response, routing::get, Router};
use indexserver_protocol::RepoId;
use indexserver_queue::{render_queue_table, IndexingQueue, QueueEntry};
use indexserver_shards::{
    format_bytes, LeaseTable, MergeEngine, Shard, ShardError, ShardMeta, ShardStore,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

const IDLE_POLL: Duration = Duration::from_secs(5);

pub(crate) struct ServeOptions {
    pub listen: String,
    pub public: bool,
    pub workers: usize,
    pub reconcile_interval: Duration,
    /// `None` disables the periodic merge.
    pub merge_interval: Option<Duration>,
    pub target_size: u64,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ReconcileSummary {
    pub queued: usize,
    pub up_to_date: usize,
    pub removed: Vec<RepoId>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    queued: usize,
    known_repositories: usize,
    generation: u64,
    uptime_secs: u64,
}

/// Owns the queue, the shard store and the loops that connect them.
pub(crate) struct IndexServer {
    queue: IndexingQueue,
    store: Arc<ShardStore>,
    leases: Arc<LeaseTable>,
    engine: Arc<MergeEngine>,
    catalog: Arc<dyn RepositoryCatalog>,
    builder: Arc<dyn ShardBuilder>,
    known: Mutex<HashMap<RepoId, CatalogRepo>>,
    work_available: Notify,
    started_at: Instant,
}

impl IndexServer {
    /// Opens the shard directory, finishes any interrupted merge and seeds
    /// the queue with what is already on disk.
    pub(crate) async fn open(
        index_dir: &Path,
        catalog: Arc<dyn RepositoryCatalog>,
        builder: Arc<dyn ShardBuilder>,
    ) -> Result<Arc<Self>> {
        let dir = index_dir.to_path_buf();
        let leases = LeaseTable::new();
        let engine_leases = Arc::clone(&leases);
        let (store, engine, indexed) = tokio::task::spawn_blocking(move || -> Result<_> {
            let store = Arc::new(
                ShardStore::open(&dir)
                    .with_context(|| format!("Failed to open shard directory {}", dir.display()))?,
            );
            let engine = Arc::new(MergeEngine::new(Arc::clone(&store), engine_leases));
            let recovery = engine.recover().context("Shard recovery failed")?;
            if !recovery.is_empty() {
                info!(
                    "recovery: {} completed, {} discarded, {} leftover inputs removed",
                    recovery.completed.len(),
                    recovery.discarded.len(),
                    recovery.finished_replacements.len()
                );
            }
            let indexed = store.indexed()?;
            Ok((store, engine, indexed))
        })
        .await??;

        let queue = IndexingQueue::new();
        for (id, repo) in indexed {
            queue.set_name(id, repo.name);
            queue.mark_indexed(id, repo.branches);
        }

        Ok(Arc::new(Self {
            queue,
            store,
            leases,
            engine,
            catalog,
            builder,
            known: Mutex::new(HashMap::new()),
            work_available: Notify::new(),
            started_at: Instant::now(),
        }))
    }

    fn known_repo(&self, id: RepoId) -> Option<CatalogRepo> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Brings the queue in line with the catalog: out-of-date repositories
    /// are (re)queued, vanished ones forgotten.
    pub(crate) async fn reconcile(&self) -> Result<ReconcileSummary> {
        let repos = self.catalog.list().await?;
        let keep: HashSet<RepoId> = repos.iter().map(|r| r.id).collect();

        let mut summary = ReconcileSummary::default();
        for repo in &repos {
            self.queue.set_name(repo.id, repo.name.clone());
            let indexed = self.queue.indexed_branches(repo.id);
            if branches_differ(&repo.branches, indexed.as_deref()) {
                self.queue
                    .enqueue(repo.id, repo.priority, repo.branches.clone());
                summary.queued += 1;
            } else {
                self.queue.remove(repo.id);
                summary.up_to_date += 1;
            }
        }
        summary.removed = self.queue.remove_missing(&keep);

        *self.known.lock().unwrap_or_else(PoisonError::into_inner) =
            repos.into_iter().map(|r| (r.id, r)).collect();
        if summary.queued > 0 {
            self.work_available.notify_waiters();
        }
        debug!(
            "reconciled: {} queued, {} up to date, {} removed",
            summary.queued,
            summary.up_to_date,
            summary.removed.len()
        );
        Ok(summary)
    }

    /// Builds and commits a fresh simple shard for `repo`, waiting for any
    /// merge that holds its shard.
    pub(crate) async fn index_repo(&self, repo: CatalogRepo) -> Result<ShardMeta> {
        let lease = self.leases.lease_repo(repo.id).await;
        let started = Instant::now();
        let content = self
            .builder
            .build(&repo)
            .await
            .with_context(|| format!("Failed to build shard for {}", repo.name))?;

        let store = Arc::clone(&self.store);
        let CatalogRepo {
            id, name, branches, ..
        } = repo;
        let committed_branches = branches.clone();
        let meta = tokio::task::spawn_blocking(move || {
            store.commit_simple(&lease, &name, &branches, &content)
        })
        .await??;

        self.queue.mark_indexed(id, committed_branches);
        info!(
            "indexed repository {id} in {:.1}s ({})",
            started.elapsed().as_secs_f64(),
            format_bytes(meta.size)
        );
        Ok(meta)
    }

    async fn index_entry(&self, entry: QueueEntry) -> Result<()> {
        let Some(mut repo) = self.known_repo(entry.repo_id) else {
            debug!("repository {} left the catalog, dropping job", entry.repo_id);
            return Ok(());
        };
        repo.branches = entry.desired_branches;
        repo.priority = entry.priority;
        self.index_repo(repo).await.map(|_| ())
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("worker {worker} started");
        while !*shutdown.borrow() {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let Some(entry) = self.queue.dequeue() else {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };
            let repo_id = entry.repo_id;
            if let Err(err) = self.index_entry(entry).await {
                warn!("worker {worker}: indexing repository {repo_id} failed: {err:#}");
            }
        }
        debug!("worker {worker} stopped");
    }

    async fn reconcile_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(err) = self.reconcile().await {
                warn!("catalog reconciliation failed: {err:#}");
            }
        }
    }

    async fn merge_loop(
        self: Arc<Self>,
        every: Duration,
        target_size: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let engine = Arc::clone(&self.engine);
            match tokio::task::spawn_blocking(move || engine.run(target_size, false)).await {
                Ok(Ok(run)) => info!(
                    "merge cycle: {} merged, {} failed, {} vacuumed, {} skipped",
                    run.report.merged(),
                    run.report.failed(),
                    run.vacuumed.len(),
                    run.skipped.len()
                ),
                Ok(Err(ShardError::MergeInProgress(dir))) => {
                    debug!("merge already running in {dir}, skipping cycle")
                }
                Ok(Err(err)) => warn!("merge cycle failed: {err}"),
                Err(err) => warn!("merge task panicked: {err}"),
            }
        }
    }

    fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            queued: self.queue.len(),
            known_repositories: self
                .known
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            generation: self.store.current_generation(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    async fn shard_listing(&self) -> Response {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.scan()).await {
            Ok(Ok(shards)) => text_response(render_shard_listing(&shards)),
            Ok(Err(err)) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "scan_failed",
                err.to_string(),
            ),
            Err(err) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "scan_failed",
                err.to_string(),
            ),
        }
    }

    pub(crate) fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                "/debug/queue",
                get({
                    let server = Arc::clone(self);
                    move || {
                        let server = Arc::clone(&server);
                        async move {
                            text_response(render_queue_table(
                                &server.queue.debug_rows(Instant::now()),
                            ))
                        }
                    }
                }),
            )
            .route(
                "/debug/shards",
                get({
                    let server = Arc::clone(self);
                    move || {
                        let server = Arc::clone(&server);
                        async move { server.shard_listing().await }
                    }
                }),
            )
            .route(
                "/health",
                get({
                    let server = Arc::clone(self);
                    move || {
                        let report = server.health();
                        async move { json_response(StatusCode::OK, &report) }
                    }
                }),
            )
            .fallback(|uri: Uri| async move {
                error_response(
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("No route for {uri}"),
                )
            })
    }

    /// Runs every loop plus the HTTP surface until ctrl-c.
    pub(crate) async fn serve(self: Arc<Self>, options: ServeOptions) -> Result<()> {
        let addr = resolve_guarded_listen_addr(&options.listen, options.public).await?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
            }
            let _ = shutdown_tx.send(true);
        });

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(Arc::clone(&self).reconcile_loop(
            options.reconcile_interval,
            shutdown_rx.clone(),
        )));
        for worker in 0..options.workers {
            tasks.push(tokio::spawn(
                Arc::clone(&self).worker_loop(worker, shutdown_rx.clone()),
            ));
        }
        match options.merge_interval {
            Some(every) => tasks.push(tokio::spawn(Arc::clone(&self).merge_loop(
                every,
                options.target_size,
                shutdown_rx.clone(),
            ))),
            None => info!("periodic shard merging disabled"),
        }

        info!(
            "serving on http://{local_addr} with {} worker(s), shards in {}",
            options.workers,
            self.store.dir().display()
        );
        let mut http_shutdown = shutdown_rx.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .await?;

        for task in tasks {
            if let Err(err) = task.await {
                warn!("background task ended abnormally: {err}");
            }
        }
        Ok(())
    }
}

fn shard_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// One line per shard: name, size, kind, live ids (stale ones in brackets).
pub(crate) fn render_shard_listing(shards: &[Shard]) -> String {
    let mut out = String::new();
    for shard in shards {
        let meta = shard.meta();
        let ids: Vec<String> = shard
            .member_ids()
            .into_iter()
            .map(|id| {
                if meta.repository_ids.binary_search(&id).is_ok() {
                    id.to_string()
                } else {
                    format!("[{id}]")
                }
            })
            .collect();
        let kind = if shard.is_compound() { "compound" } else { "simple" };
        let _ = writeln!(
            out,
            "{}  {}  {kind}  {}",
            shard_name(&meta.path),
            format_bytes(meta.size),
            ids.join(",")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ManifestBuilder;
    use crate::catalog::FileCatalog;
    use indexserver_protocol::Branch;
    use tempfile::TempDir;

    fn write_catalog(path: &Path, repos: &[(RepoId, &str, &str)]) {
        let repos: Vec<CatalogRepo> = repos
            .iter()
            .map(|(id, name, version)| CatalogRepo {
                id: *id,
                name: (*name).to_string(),
                priority: f64::from(*id),
                branches: vec![Branch::new("main", *version)],
                path: None,
            })
            .collect();
        let doc = serde_json::json!({ "repositories": repos });
        std::fs::write(path, serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    async fn open(temp: &TempDir) -> Arc<IndexServer> {
        let index = temp.path().join("index");
        std::fs::create_dir_all(&index).unwrap();
        let catalog = Arc::new(FileCatalog::new(temp.path().join("catalog.json")));
        IndexServer::open(&index, catalog, Arc::new(ManifestBuilder))
            .await
            .unwrap()
    }

    async fn drain(server: &IndexServer) {
        while let Some(entry) = server.queue.dequeue() {
            server.index_entry(entry).await.unwrap();
        }
    }

    #[tokio::test]
    async fn reconcile_queues_only_out_of_date_repositories() {
        let temp = TempDir::new().unwrap();
        let catalog = temp.path().join("catalog.json");
        write_catalog(&catalog, &[(1, "acme/a", "v1"), (2, "acme/b", "v1")]);
        let server = open(&temp).await;

        let first = server.reconcile().await.unwrap();
        assert_eq!(first.queued, 2);
        assert_eq!(server.queue.dequeue().map(|e| e.repo_id), Some(2));
        server.queue.enqueue(2, 2.0, vec![Branch::new("main", "v1")]);
        drain(&server).await;

        let second = server.reconcile().await.unwrap();
        assert_eq!(second.queued, 0);
        assert_eq!(second.up_to_date, 2);

        write_catalog(&catalog, &[(1, "acme/a", "v2")]);
        let third = server.reconcile().await.unwrap();
        assert_eq!(third.queued, 1);
        assert_eq!(third.removed, vec![2]);
        assert!(server.queue.contains(1));
    }

    #[tokio::test]
    async fn reopening_seeds_indexed_branches_from_disk() {
        let temp = TempDir::new().unwrap();
        write_catalog(&temp.path().join("catalog.json"), &[(7, "acme/seven", "abc")]);
        {
            let server = open(&temp).await;
            server.reconcile().await.unwrap();
            drain(&server).await;
        }

        let server = open(&temp).await;
        assert_eq!(
            server.queue.indexed_branches(7),
            Some(vec![Branch::new("main", "abc")])
        );
        assert_eq!(server.reconcile().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn http_surface_serves_queue_shards_and_404() {
        let temp = TempDir::new().unwrap();
        write_catalog(&temp.path().join("catalog.json"), &[(1, "acme/a", "v1")]);
        let server = open(&temp).await;
        server.reconcile().await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = server.router();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let client = reqwest::Client::new();

        let queue = client
            .get(format!("http://{addr}/debug/queue"))
            .send()
            .await
            .unwrap();
        assert!(queue.status().is_success());
        let body = queue.text().await.unwrap();
        assert!(body.contains("acme/a"), "{body}");
        assert!(body.contains("main@v1"), "{body}");

        drain(&server).await;
        let shards = client
            .get(format!("http://{addr}/debug/shards"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(shards.contains("repo-1.g1.shard"), "{shards}");
        assert!(shards.contains("simple"), "{shards}");

        let health = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        let health: serde_json::Value = serde_json::from_str(&health).unwrap();
        assert_eq!(health["status"], "ok");

        let missing = client
            .get(format!("http://{addr}/nope"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let envelope: serde_json::Value =
            serde_json::from_str(&missing.text().await.unwrap()).unwrap();
        assert_eq!(envelope["code"], "not_found");
    }

    #[tokio::test]
    async fn idle_worker_wakes_when_work_is_queued() {
        let temp = TempDir::new().unwrap();
        let server = open(&temp).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Arc::clone(&server).worker_loop(0, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_catalog(&temp.path().join("catalog.json"), &[(3, "acme/c", "v1")]);
        assert_eq!(server.reconcile().await.unwrap().queued, 1);

        let deadline = Instant::now() + IDLE_POLL / 2;
        while server.queue.indexed_branches(3).is_none() {
            assert!(Instant::now() < deadline, "worker did not wake up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn second_server_on_the_same_directory_is_refused() {
        let temp = TempDir::new().unwrap();
        let _first = open(&temp).await;
        let catalog = Arc::new(FileCatalog::new(temp.path().join("catalog.json")));
        let err = IndexServer::open(&temp.path().join("index"), catalog, Arc::new(ManifestBuilder))
            .await
            .err()
            .expect("second open must fail");
        assert!(
            matches!(
                err.downcast_ref::<ShardError>(),
                Some(ShardError::DirectoryBusy(_))
            ),
            "{err:#}"
        );
    }

    #[tokio::test]
    async fn jobs_for_removed_repositories_are_dropped() {
        let temp = TempDir::new().unwrap();
        write_catalog(&temp.path().join("catalog.json"), &[(1, "acme/a", "v1")]);
        let server = open(&temp).await;
        server.reconcile().await.unwrap();

        let stray = IndexingQueue::new();
        stray.enqueue(99, 1.0, vec![Branch::new("main", "x")]);
        server.index_entry(stray.dequeue().unwrap()).await.unwrap();
        assert!(server.store.indexed().unwrap().is_empty());
    }
}
