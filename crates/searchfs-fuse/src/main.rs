//! searchfs FUSE daemon
//!
//! Mounts one user's searches on one instance, read-only.
//!
//! ```bash
//! searchfs-fuse --instance /srv/db/study.sqlite --login alice \
//!     --mountpoint /var/lib/searchfs/home/alice/rql_download/1_study --foreground
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use searchfs_kernel::config;
use searchfs_kernel::registry::{InstanceSession, SearchRegistry};
use searchfs_kernel::store::Repository;
use searchfs_kernel::vfs::{NamespaceLayout, UnixIdentity};
use searchfs_kernel::{PathTranslator, SqliteRepository, TranslatorOptions};
use searchfs_fuse::SearchFs;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Mount a user's saved searches.
#[derive(Parser, Debug)]
#[command(name = "searchfs-fuse")]
#[command(about = "Mount a user's saved searches as a read-only filesystem")]
struct Args {
    /// Backing instance (SQLite database)
    #[arg(long)]
    instance: String,

    /// Owner of the searches to expose
    #[arg(long)]
    login: String,

    /// Where to mount
    #[arg(long)]
    mountpoint: PathBuf,

    /// Real directory masked by search directories
    #[arg(long, default_value = "/")]
    base_dir: String,

    /// Unix user whose permissions frame file access
    #[arg(long)]
    unix_username: Option<String>,

    /// Stay attached and unmount on exit
    #[arg(long)]
    foreground: bool,
}

async fn open_translator(args: &Args) -> Result<Arc<PathTranslator>> {
    let path = config::expand(&args.instance);
    let repo = SqliteRepository::open(&path)
        .with_context(|| format!("opening instance {}", path.display()))?;
    let session = repo
        .session_for(&args.login)
        .await
        .with_context(|| format!("no such login {}", args.login))?;

    let identity = match &args.unix_username {
        Some(name) => UnixIdentity::lookup(name)
            .with_context(|| format!("resolving unix user {name}"))?,
        None => UnixIdentity::current(),
    };
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.instance.clone());

    let translator = PathTranslator::new(
        Arc::new(SearchRegistry::new(vec![InstanceSession { name, session }])),
        TranslatorOptions {
            layout: NamespaceLayout::Single,
            base_dir: args.base_dir.clone(),
            identity,
            enforce_access: args.unix_username.is_some(),
            refresh_on_list: false,
            login: args.login.clone(),
        },
    );
    translator.refresh().await.context("building the search tree")?;
    Ok(Arc::new(translator))
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    // FUSE owns the main thread; translator futures run on this runtime.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting the runtime")?;
    let translator = runtime.block_on(open_translator(&args))?;

    let fs = SearchFs::new(translator.clone(), runtime.handle().clone());
    let mounted = searchfs_fuse::mount(fs, &args.mountpoint, args.foreground)
        .with_context(|| format!("mounting {}", args.mountpoint.display()));

    runtime.block_on(translator.close());
    mounted
}
