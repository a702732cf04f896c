use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clusterkit_core::config::{load_config, ClusterConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json }

#[cfg(feature = "migrate")]
#[derive(Debug, clap::Args)]
struct DbArgs {
    /// Run against a SQLite database file instead of the cluster
    #[arg(long, value_name = "FILE")]
    sqlite: Option<PathBuf>,
    /// SQL endpoint host:port. Default: advertise_host (or localhost) and sql_port.
    #[arg(long)]
    host: Option<String>,
    /// Migrations directory (overrides migrations_dir)
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,
}

#[cfg(feature = "migrate")]
#[derive(Debug, Subcommand)]
enum MigrateCmd {
    /// Apply every pending migration in version order
    Apply {
        #[command(flatten)]
        db: DbArgs,
    },
    /// Show the current version, applied and pending migrations
    Status {
        #[command(flatten)]
        db: DbArgs,
    },
    /// Create the next numbered migration file from the template
    New {
        name: String,
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
}

#[cfg(feature = "certs")]
#[derive(Debug, Subcommand)]
enum CertsCmd {
    /// Create or fetch the cluster CA and issue this node's certificates
    Bootstrap {
        /// Act as the originator even when peers are configured
        #[arg(long, default_value_t = false)]
        init: bool,
    },
    /// Serve ca.crt to joining nodes for a bounded time
    ServeCa {
        #[arg(long)]
        port: Option<u16>,
        /// Shut down after this many seconds
        #[arg(long)]
        window_secs: Option<u64>,
        /// Shut down after this many successful fetches
        #[arg(long)]
        max_fetches: Option<u32>,
    },
    /// Print the SHA-256 fingerprint of the local CA
    Fingerprint,
    /// Compare a peer's CA with the local one
    CheckPeer { peer: String },
    /// Issue a client certificate for a SQL user
    IssueClient { user: String },
}

#[derive(Debug, Parser)]
#[command(name = "clusterctl", version, about = "Secure CockroachDB cluster bootstrap: trust and schema migrations")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./clusterkit.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log filter (e.g. info, trust=debug). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Certificate directory (overrides certs_dir)
    #[arg(long, global = true, value_name = "DIR")]
    certs_dir: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Schema migrations
    #[cfg(feature = "migrate")]
    Migrate {
        #[command(subcommand)]
        cmd: MigrateCmd,
    },
    /// Cluster CA and node certificates
    #[cfg(feature = "certs")]
    Certs {
        #[command(subcommand)]
        cmd: CertsCmd,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn emit(format: OutputFormat, text: String, json: serde_json::Value) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", text),
        OutputFormat::Json => println!("{}", serde_json::to_string(&json)?),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let mut cfg = load_config(cli.config.as_deref())?;
    if let Some(dir) = cli.certs_dir.clone() {
        cfg.certs_dir = dir;
    }
    match cli.command {
        Commands::Version => {
            emit(
                cli.format,
                format!("clusterctl {} (core {})", env!("CARGO_PKG_VERSION"), clusterkit_core::version()),
                serde_json::json!({ "clusterctl": env!("CARGO_PKG_VERSION"), "core": clusterkit_core::version() }),
            )?;
        }
        #[cfg(feature = "migrate")]
        Commands::Migrate { cmd } => run_migrate(cmd, &cfg, cli.format)?,
        #[cfg(feature = "certs")]
        Commands::Certs { cmd } => run_certs(cmd, cfg, cli.format)?,
    }
    Ok(())
}

#[cfg(feature = "migrate")]
fn run_migrate(cmd: MigrateCmd, cfg: &ClusterConfig, format: OutputFormat) -> Result<()> {
    use migrations::MigrationCatalog;
    use sql_executor::{CockroachCli, Db};

    let (db, status) = match cmd {
        MigrateCmd::New { name, dir } => {
            let catalog = MigrationCatalog::new(dir.unwrap_or_else(|| cfg.migrations_dir.clone()));
            let path = catalog.create(&name)?;
            return emit(format, format!("created {}", path.display()), serde_json::json!({ "path": path }));
        }
        MigrateCmd::Apply { db } => (db, false),
        MigrateCmd::Status { db } => (db, true),
    };
    let catalog = MigrationCatalog::new(db.dir.clone().unwrap_or_else(|| cfg.migrations_dir.clone()));
    match &db.sqlite {
        Some(path) => {
            let conn = Db::open_or_create(path).with_context(|| format!("opening {}", path.display()))?;
            migrate_with(catalog, conn, status, format)
        }
        None => {
            let host = db.host.clone().unwrap_or_else(|| {
                let h = cfg.advertise_host.clone().unwrap_or_else(|| "localhost".to_string());
                format!("{}:{}", h, cfg.sql_port)
            });
            let cli = CockroachCli::new(cfg.cockroach_binary.clone(), cfg.certs_dir.clone(), host, cfg.database_name.clone())
                .with_user(cfg.admin_user.clone());
            migrate_with(catalog, cli, status, format)
        }
    }
}

#[cfg(feature = "migrate")]
fn migrate_with<E: clusterkit_core::DatabaseExecutor>(
    catalog: migrations::MigrationCatalog,
    db: E,
    status: bool,
    format: OutputFormat,
) -> Result<()> {
    let runner = migrations::MigrationRunner::new(catalog, db);
    if status {
        let st = runner.status()?;
        let mut text = format!("current version: {}", st.current_version);
        for r in &st.applied {
            text.push_str(&format!("\n  applied  {:>4}  {}  {}", r.version, r.name, r.applied_at.as_deref().unwrap_or("-")));
        }
        for p in &st.pending {
            text.push_str(&format!("\n  pending  {:>4}  {}", p.version, p.name));
        }
        emit(format, text, serde_json::to_value(&st)?)
    } else {
        let report = runner.migrate()?;
        let text = if report.applied == 0 {
            format!("schema up to date at version {}", report.current_version)
        } else {
            format!("applied {} migration(s), now at version {}", report.applied, report.current_version)
        };
        emit(format, text, serde_json::to_value(&report)?)
    }
}

#[cfg(feature = "certs")]
fn run_certs(cmd: CertsCmd, mut cfg: ClusterConfig, format: OutputFormat) -> Result<()> {
    use clusterkit_core::PeerAddr;
    use std::net::SocketAddr;
    use trust::{BootstrapSettings, CaExchangeServer, CertIssuer, ExchangeLimits, FsCertStore, TrustBootstrapper, TrustError};

    if let CertsCmd::Bootstrap { init: true } = cmd {
        cfg.initialize = true;
    }
    let issuer = CertIssuer::from_config(&cfg.certs);
    let mut node = TrustBootstrapper::new(FsCertStore::new(&cfg.certs_dir), BootstrapSettings::from_config(&cfg), issuer)?;
    let missing_ca = || TrustError::MissingCa { path: cfg.certs_dir.join("ca.crt") };
    let rt = tokio::runtime::Runtime::new()?;

    match cmd {
        CertsCmd::Bootstrap { .. } => {
            let state = rt.block_on(node.bootstrap())?;
            let fingerprint = node.local_ca()?.map(|ca| ca.fingerprint()).unwrap_or_default();
            let role = serde_json::to_value(node.role())?;
            emit(
                format,
                format!("{} node: {} ({})\nCA fingerprint: {}", role.as_str().unwrap_or(""), state, cfg.certs_dir.display(), fingerprint),
                serde_json::json!({ "role": role, "state": state, "certs_dir": cfg.certs_dir, "ca_fingerprint": fingerprint }),
            )
        }
        CertsCmd::ServeCa { port, window_secs, max_fetches } => {
            let ca = node.local_ca()?.ok_or_else(missing_ca)?;
            let mut limits = ExchangeLimits::from(&cfg.ca_exchange);
            if let Some(w) = window_secs { limits.window = std::time::Duration::from_secs(w); }
            if let Some(m) = max_fetches { limits.max_fetches = m; }
            let port = port.unwrap_or(cfg.ca_exchange.port);
            let addr: SocketAddr = format!("{}:{}", cfg.ca_exchange.bind_addr, port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", cfg.ca_exchange.bind_addr, port))?;
            let summary = rt.block_on(async move {
                let server = CaExchangeServer::bind(addr, ca, limits).await?;
                server.serve().await
            })?;
            emit(
                format,
                format!("CA exchange closed after {} fetch(es): {:?}", summary.fetches, summary.reason),
                serde_json::to_value(summary)?,
            )
        }
        CertsCmd::Fingerprint => {
            let ca = node.local_ca()?.ok_or_else(missing_ca)?;
            let not_after = ca.not_after().map(|t| t.to_string()).unwrap_or_default();
            emit(
                format,
                format!("{}  {}", ca.fingerprint(), ca.subject()),
                serde_json::json!({ "fingerprint": ca.fingerprint(), "subject": ca.subject(), "not_after": not_after }),
            )
        }
        CertsCmd::CheckPeer { peer } => {
            let peer = PeerAddr::from(peer.as_str());
            let fingerprint = rt.block_on(node.check_peer(&peer))?;
            emit(
                format,
                format!("{} trusts the same CA ({})", peer.host, fingerprint),
                serde_json::json!({ "peer": peer.host, "match": true, "fingerprint": fingerprint }),
            )
        }
        CertsCmd::IssueClient { user } => {
            let issued = node.issue_client_cert(&user)?;
            emit(
                format,
                format!("issued client.{}.crt (expires {})", user, issued.not_after),
                serde_json::json!({ "user": user, "not_after": issued.not_after.to_string(), "ca_fingerprint": issued.ca_fingerprint }),
            )
        }
    }
}
