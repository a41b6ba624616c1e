//! searchfs server binary
//!
//! SFTP server over saved searches, plus store administration.
//!
//! ## Usage
//!
//! ```bash
//! # Run the server (default)
//! searchfs-server --instances /srv/db/study.sqlite --unix-username researcher
//!
//! # Administration
//! searchfs-server add-user --instance /srv/db/study.sqlite --login alice --password secret
//! searchfs-server create-search --instance /srv/db/study.sqlite --login alice \
//!     --title t1 --query "SELECT S.eid FROM scan S"
//! searchfs-server cleanup
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use searchfs_kernel::config::{self, DEFAULT_CONFIG_PATH, ServerConfig, parse_instance_list};
use searchfs_kernel::search::{DATE_FORMAT, NewSearch};
use searchfs_kernel::store::Repository;
use searchfs_kernel::vfs::UnixIdentity;
use searchfs_kernel::{AdapterRegistry, SearchService, SqliteRepository};
use searchfs_server::{
    FuseSpawner, Housekeeping, ManagedInstance, ServerContext, SshServer, SshServerConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// SFTP server over saved searches.
#[derive(Parser, Debug)]
#[command(name = "searchfs-server")]
#[command(about = "Serve saved searches as a read-only filesystem over SFTP")]
struct Cli {
    /// TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Command-line values layered over the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Backing instances, colon-separated
    #[arg(long)]
    instances: Option<String>,

    /// Unix user whose permissions frame file access
    #[arg(long)]
    unix_username: Option<String>,

    /// OpenSSH host key (ephemeral when unset)
    #[arg(long)]
    host_key: Option<String>,

    /// Host key passphrase
    #[arg(long)]
    passphrase: Option<String>,

    /// Real directory masked by search directories
    #[arg(long)]
    base_dir: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Spawn a FUSE daemon per search owner
    #[arg(long)]
    start_user_fuse: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the SFTP server (default)
    Serve,
    /// Create an account on one instance
    AddUser {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        login: String,
        #[arg(long)]
        password: String,
    },
    /// Save a search for a user
    CreateSearch {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        login: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        query: String,
        /// Expiration date (YYYY-MM-DD)
        #[arg(long)]
        expiration: Option<String>,
    },
    /// Delete expired searches once and exit
    Cleanup,
}

fn layered_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(&cli.config)?;
    let o = &cli.overrides;
    if let Some(instances) = &o.instances {
        config.instances = parse_instance_list(instances);
    }
    if o.unix_username.is_some() {
        config.unix_username = o.unix_username.clone();
    }
    if o.host_key.is_some() {
        config.host_key = o.host_key.clone();
    }
    if o.passphrase.is_some() {
        config.passphrase = o.passphrase.clone();
    }
    if let Some(base_dir) = &o.base_dir {
        config.base_dir = base_dir.clone();
    }
    if let Some(port) = o.port {
        config.port = port;
    }
    if let Some(bind) = &o.bind {
        config.bind_address = bind.clone();
    }
    if o.start_user_fuse {
        config.start_user_fuse = true;
    }
    Ok(config)
}

fn open_instances(config: &ServerConfig) -> Result<Vec<ManagedInstance>> {
    config
        .instance_paths()
        .into_iter()
        .zip(config.instance_names())
        .map(|(path, name)| {
            let repo = SqliteRepository::open(&path)
                .with_context(|| format!("opening instance {}", path.display()))?;
            Ok(ManagedInstance {
                path,
                name,
                repository: Arc::new(repo),
            })
        })
        .collect()
}

fn search_service(config: &ServerConfig) -> SearchService {
    SearchService::new(
        Arc::new(AdapterRegistry::with_defaults()),
        config.default_expiration_days,
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match &cli.command {
        None | Some(Command::Serve) => run_server(layered_config(&cli)?).await,
        Some(Command::AddUser {
            instance,
            login,
            password,
        }) => {
            let repo = SqliteRepository::open(config::expand(instance))?;
            let eid = repo.create_user(login, password)?;
            println!("Created user '{}' (eid {})", login, eid);
            Ok(())
        }
        Some(Command::CreateSearch {
            instance,
            login,
            title,
            query,
            expiration,
        }) => {
            let config = layered_config(&cli)?;
            let expiration = expiration
                .as_deref()
                .map(|d| NaiveDate::parse_from_str(d, DATE_FORMAT))
                .transpose()
                .context("expiration must be YYYY-MM-DD")?;
            let repo = SqliteRepository::open(config::expand(instance))?;
            let session = repo.session_for(login).await?;
            let created = search_service(&config)
                .create(
                    session.as_ref(),
                    NewSearch {
                        title: title.clone(),
                        query: query.clone(),
                        expiration,
                    },
                )
                .await?;
            session.close().await;
            println!(
                "Created search '{}': {} file(s), {} export, expires {}",
                title,
                created.report.files.len(),
                created.format,
                created.expiration.format(DATE_FORMAT)
            );
            Ok(())
        }
        Some(Command::Cleanup) => {
            let config = layered_config(&cli)?;
            let housekeeping = Housekeeping::new(
                open_instances(&config)?,
                search_service(&config),
                None,
                Duration::from_secs(config.cleanup_interval_secs),
                Duration::from_secs(config.reap_interval_secs),
            );
            let deleted = housekeeping.cleanup().await;
            println!("Deleted {} expired search(es)", deleted);
            Ok(())
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;

    let identity = match &config.unix_username {
        Some(name) => UnixIdentity::lookup(name)
            .with_context(|| format!("resolving unix user {name}"))?,
        None => UnixIdentity::current(),
    };
    if identity.uid == 0 && config.unix_username.is_none() {
        tracing::warn!("no unix user configured, file access is framed by root");
    }

    let instances = open_instances(&config)?;
    let bind_addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("bad listen address {}:{}", config.bind_address, config.port))?;
    let ssh_config = match &config.host_key {
        Some(path) => SshServerConfig::from_key_file(
            bind_addr,
            &config::expand(path),
            config.passphrase.as_deref(),
        )?,
        None => {
            tracing::warn!("no host key configured, using an ephemeral key");
            SshServerConfig::ephemeral(bind_addr)?
        }
    };

    let context = Arc::new(ServerContext {
        repositories: instances.iter().map(|i| i.repository.clone()).collect(),
        instance_names: instances.iter().map(|i| i.name.clone()).collect(),
        layout: config.layout(),
        base_dir: config.base_dir.clone(),
        identity,
    });

    let spawner = config.start_user_fuse.then(|| FuseSpawner {
        binary: config.fuse_binary.clone(),
        mount_base: config::expand(&config.fuse_mount_base),
        base_dir: config.base_dir.clone(),
        unix_username: config.unix_username.clone(),
    });
    let housekeeping = Housekeeping::new(
        instances,
        search_service(&config),
        spawner,
        Duration::from_secs(config.cleanup_interval_secs),
        Duration::from_secs(config.reap_interval_secs),
    )
    .spawn();

    tracing::info!(
        instances = ?context.instance_names,
        base_dir = %config.base_dir,
        port = config.port,
        "Starting searchfs server"
    );
    let server = SshServer::new(ssh_config, context);
    let result = tokio::select! {
        result = server.run() => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    housekeeping.shutdown().await;
    if let Err(e) = &result {
        tracing::error!("Server error: {}", e);
        bail!("server stopped: {e}");
    }
    Ok(())
}
