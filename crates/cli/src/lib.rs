use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod bind_guard;
mod builder;
mod catalog;
mod config;
mod debug;
mod http_api;
mod server;

pub use builder::{ManifestBuilder, RepoManifest, ShardBuilder};
pub use catalog::{CatalogRepo, FileCatalog, RepositoryCatalog};

use config::parse_interval;
use server::{IndexServer, ServeOptions};

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.write_all(b"\n"))
        .and_then(|_| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "indexserver")]
#[command(about = "Keeps repository indexes fresh and their shards compact", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index server: catalog reconciliation, indexing workers,
    /// periodic shard merging and the debug HTTP endpoints
    Serve(ServeArgs),

    /// Inspect or maintain an index directory
    Debug(DebugArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Repository catalog (JSON)
    #[arg(long)]
    catalog: PathBuf,

    /// Shard directory (default: $DATA_DIR/index)
    #[arg(long)]
    index: Option<PathBuf>,

    /// Listen address for the debug endpoints (env: INDEXSERVER_LISTEN)
    #[arg(long)]
    listen: Option<String>,

    /// Allow listening on non-loopback addresses
    #[arg(long)]
    public: bool,

    /// Concurrent indexing jobs (env: INDEXSERVER_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// How often to reconcile with the catalog
    #[arg(long, default_value = "1m", value_parser = parse_interval)]
    interval: Duration,

    /// How often to run a merge cycle
    #[arg(long, default_value = "30m", value_parser = parse_interval)]
    merge_interval: Duration,

    /// Merge target size in MiB (env: SRC_TARGET_SIZE, default 2000)
    #[arg(long)]
    merge_target_size: Option<u64>,

    /// Never merge shards
    #[arg(long)]
    no_merge: bool,
}

#[derive(Args)]
pub(crate) struct DebugArgs {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
pub(crate) enum DebugCommand {
    /// Merge small shards into compound shards
    Merge(MergeArgs),

    /// Print the indexing queue of a running server
    Queue(QueueArgs),

    /// List repositories this server is responsible for
    List(ListArgs),

    /// List repositories with a live shard
    #[command(name = "list-indexed")]
    ListIndexed(ListIndexedArgs),

    /// Print a shard header as JSON
    Meta(MetaArgs),

    /// Index one repository now, bypassing the queue
    Index(IndexArgs),
}

#[derive(Args)]
pub(crate) struct MergeArgs {
    /// Shard directory (default: $DATA_DIR/index)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Upper bound for a compound shard in MiB (env: SRC_TARGET_SIZE, default 2000)
    #[arg(long)]
    pub merge_target_size: Option<u64>,

    /// Report what would happen without touching the directory
    #[arg(long)]
    pub simulate: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub(crate) struct QueueArgs {
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    #[arg(long, default_value_t = 6072)]
    pub port: u16,
}

#[derive(Args)]
pub(crate) struct ListArgs {
    /// Repository catalog (JSON)
    #[arg(long)]
    pub catalog: PathBuf,

    /// Shard directory (default: $DATA_DIR/index)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Leave out repositories that are indexed here but no longer in the
    /// catalog
    #[arg(long)]
    pub exclude_indexed: bool,
}

#[derive(Args)]
pub(crate) struct ListIndexedArgs {
    /// Shard directory (default: $DATA_DIR/index)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Print names, branches and shard paths as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub(crate) struct MetaArgs {
    /// Path to a .shard file
    pub shard: PathBuf,
}

#[derive(Args)]
pub(crate) struct IndexArgs {
    /// Repository id as listed in the catalog
    pub id: u32,

    /// Repository catalog (JSON)
    #[arg(long)]
    pub catalog: PathBuf,

    /// Shard directory (default: $DATA_DIR/index)
    #[arg(long)]
    pub index: Option<PathBuf>,

    /// Index these branches instead of the catalog's, e.g. `main@abc,dev@def`
    #[arg(long)]
    pub branches: Option<String>,
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();

    // Keep stdout clean for machine-readable output.
    let json_output = match &cli.command {
        Commands::Debug(args) => match &args.command {
            DebugCommand::Merge(merge) => merge.json,
            DebugCommand::ListIndexed(list) => list.json,
            DebugCommand::Meta(_) => true,
            _ => false,
        },
        Commands::Serve(_) => false,
    };
    if json_output {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Serve(args) => run_serve(args).await?,
        Commands::Debug(args) => match args.command {
            DebugCommand::Merge(args) => debug::run_merge(args).await?,
            DebugCommand::Queue(args) => debug::run_queue(args).await?,
            DebugCommand::List(args) => debug::run_list(args).await?,
            DebugCommand::ListIndexed(args) => debug::run_list_indexed(args).await?,
            DebugCommand::Meta(args) => debug::run_meta(args).await?,
            DebugCommand::Index(args) => debug::run_index(args).await?,
        },
    }

    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let index_dir = config::resolve_index_dir(args.index);
    std::fs::create_dir_all(&index_dir)?;
    let catalog = Arc::new(FileCatalog::new(&args.catalog));
    let server = IndexServer::open(&index_dir, catalog, Arc::new(ManifestBuilder)).await?;

    let options = ServeOptions {
        listen: config::resolve_listen(args.listen),
        public: args.public,
        workers: config::resolve_workers(args.workers),
        reconcile_interval: args.interval,
        merge_interval: (!args.no_merge).then_some(args.merge_interval),
        target_size: config::mib_to_bytes(config::resolve_target_size_mib(
            args.merge_target_size,
        )),
    };
    if options.target_size == 0 {
        anyhow::bail!("--merge-target-size must be positive");
    }
    server.serve(options).await
}
