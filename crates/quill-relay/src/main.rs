//! Quill relay server.
//!
//! A local mediation proxy between an AI agent and its JSON-RPC tool
//! servers. Every `tools/call` is evaluated against a declarative policy and
//! a heuristic risk score, and every decision is appended to a signed,
//! hash-chained audit ledger that third parties can verify offline.

use anyhow::Context;
use clap::{Parser, Subcommand};
use quill_core::keystore::{KeyLoad, Keystore, OperatorKeys};
use quill_core::Policy;
use quill_relay::config::{self, RelayConfig};
use quill_relay::http::{build_router, AppState};
use quill_relay::rate_limit::RateLimiter;
use quill_relay::{stdio, DecisionCore};
use quill_risk::{RiskConfig, RiskEngine};
use quill_storage::{verify, AuditLogger, AuthStore, BehaviorStore, LedgerStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Exit code when the keystore needs a passphrase that was not supplied.
const EXIT_NEEDS_PASSPHRASE: i32 = 2;

/// Exit code when the supplied keystore passphrase is wrong.
const EXIT_BAD_PASSPHRASE: i32 = 3;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Quill mediation relay for JSON-RPC tool servers.
#[derive(Parser)]
#[command(name = "quill-relay", version, about, long_about = None)]
struct Cli {
    /// Path to YAML configuration file.
    #[arg(short, long, global = true, env = "QUILL_CONFIG")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "QUILL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override log output format (text, json).
    #[arg(long, global = true, env = "QUILL_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP transport.
    Serve,
    /// Wrap a stdio tool server: `quill-relay wrap -- npx some-mcp-server`.
    Wrap {
        /// The child command and its arguments.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Verify the audit ledger's signatures and hash chain.
    Verify,
    /// Export ledger records as JSON lines, oldest first.
    Export {
        /// Only records with an id greater than this.
        #[arg(long, default_value_t = 0)]
        after_id: i64,
        /// Maximum number of records per run.
        #[arg(long, default_value_t = 1000)]
        limit: u32,
    },
    /// Validate the configuration and policy, then print resolved settings.
    Validate,
    /// Generate the operator keypair (honors QUILL_KEY_PASSPHRASE).
    Keygen,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_and_merge_config(&cli)?;

    match cli.command {
        Commands::Validate => run_validate(&config),
        Commands::Keygen => run_keygen(&config),
        Commands::Verify => {
            init_logging(&config)?;
            run_verify(&config).await
        }
        Commands::Export { after_id, limit } => run_export(&config, after_id, limit).await,
        Commands::Serve => {
            init_logging(&config)?;
            config::validate_config(&config)?;
            run_serve(config).await
        }
        Commands::Wrap { command } => {
            init_logging(&config)?;
            run_wrap(config, command).await
        }
    }
}

/// Load configuration from file/defaults, then apply env and CLI overrides.
fn load_and_merge_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            // Logging isn't initialised yet; use eprintln for early
            // diagnostics.
            eprintln!("Loading configuration from {}", path.display());
            config::load_config(path)?
        }
        None => RelayConfig::default(),
    };

    config::apply_env_overrides(&mut config);

    if let Some(ref level) = cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(ref format) = cli.log_format {
        config.logging.format.clone_from(format);
    }

    Ok(config)
}

/// Initialize structured logging. `RUST_LOG` takes precedence over the
/// configured level.
fn init_logging(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared wiring
// ---------------------------------------------------------------------------

/// Everything the transports need, assembled from one data directory.
struct RelayParts {
    core: Arc<DecisionCore>,
    auth: Option<Arc<AuthStore>>,
    limiter: RateLimiter,
    ledger: Arc<LedgerStore>,
}

/// Load the operator key, generating one on first run and exiting with a
/// distinguishable message and code for each keystore failure mode.
fn load_operator_keys(config: &RelayConfig) -> anyhow::Result<OperatorKeys> {
    let passphrase = std::env::var("QUILL_KEY_PASSPHRASE").ok();
    let keystore = Keystore::new(&config.data_dir, &config.key_name);

    match keystore.load(passphrase.as_deref())? {
        KeyLoad::Loaded(keys) => {
            info!(fingerprint = %keys.fingerprint(), "Operator key loaded");
            Ok(keys)
        }
        KeyLoad::Absent => {
            let keys = keystore.generate(passphrase.as_deref())?;
            info!(
                fingerprint = %keys.fingerprint(),
                path = %keystore.key_path().display(),
                "Generated operator keypair"
            );
            Ok(keys)
        }
        KeyLoad::NeedsPassphrase => {
            eprintln!(
                "error: the operator key at {} is encrypted; set QUILL_KEY_PASSPHRASE",
                keystore.key_path().display()
            );
            std::process::exit(EXIT_NEEDS_PASSPHRASE);
        }
        KeyLoad::BadPassphrase => {
            eprintln!("error: QUILL_KEY_PASSPHRASE does not decrypt the operator key");
            std::process::exit(EXIT_BAD_PASSPHRASE);
        }
    }
}

/// Load `policy.json` from the data directory, writing the permissive
/// starter policy on first run.
fn load_policy(data_dir: &Path) -> anyhow::Result<Policy> {
    let path = data_dir.join("policy.json");
    if !path.exists() {
        let starter = serde_json::to_string_pretty(&Policy::default())?;
        std::fs::write(&path, starter)
            .with_context(|| format!("writing starter policy to {}", path.display()))?;
        info!(path = %path.display(), "Wrote starter policy");
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let document: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;

    let errors = quill_policy::validate_document(&document);
    if !errors.is_empty() {
        anyhow::bail!(
            "invalid policy at {}:\n  - {}",
            path.display(),
            errors.join("\n  - ")
        );
    }

    Ok(serde_json::from_value(document)?)
}

async fn build_parts(config: &RelayConfig) -> anyhow::Result<RelayParts> {
    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let keys = Arc::new(load_operator_keys(config)?);
    let policy = load_policy(&data_dir)?;
    let policy_hash = quill_core::policy_hash(&policy)?;
    info!(%policy_hash, "Policy loaded");

    let ledger = Arc::new(
        LedgerStore::new(&format!("sqlite:{}", data_dir.join("audit.db").display())).await?,
    );
    let behavior =
        BehaviorStore::new(&format!("sqlite:{}", data_dir.join("behavior.db").display())).await?;
    let logger = Arc::new(AuditLogger::new(
        Arc::clone(&ledger),
        keys,
        policy_hash,
    ));
    let risk = Arc::new(RiskEngine::new(RiskConfig::default(), behavior)?);

    let limiter = match policy.rate_limit {
        Some(settings) => RateLimiter::new(Some(settings.requests_per_minute), settings.burst),
        None => RateLimiter::unlimited(),
    };

    let auth = if config.auth_enabled {
        let store =
            AuthStore::new(&format!("sqlite:{}", data_dir.join("auth.db").display())).await?;
        Some(Arc::new(store))
    } else {
        None
    };

    let core = Arc::new(DecisionCore::new(
        config.server_name.clone(),
        Arc::new(policy),
        risk,
        logger,
    ));

    Ok(RelayParts {
        core,
        auth,
        limiter,
        ledger,
    })
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_serve(config: RelayConfig) -> anyhow::Result<()> {
    let parts = build_parts(&config).await?;
    let ledger = Arc::clone(&parts.ledger);

    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_millis(config.connection_timeout_ms))
        .timeout(std::time::Duration::from_millis(config.timeout_ms))
        .build()?;

    let state = Arc::new(AppState {
        core: parts.core,
        auth: parts.auth,
        limiter: parts.limiter,
        client,
        upstream_url: config.upstream_url.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(
        listen_addr = %config.listen_addr,
        upstream_url = %config.upstream_url,
        server_name = %config.server_name,
        "Quill relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down; closing stores");
    ledger.close().await;
    Ok(())
}

async fn run_wrap(config: RelayConfig, command: Vec<String>) -> anyhow::Result<()> {
    let parts = build_parts(&config).await?;
    let ledger = Arc::clone(&parts.ledger);

    stdio::run(parts.core, &command).await?;

    ledger.close().await;
    Ok(())
}

async fn run_verify(config: &RelayConfig) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&config.data_dir);
    let ledger = LedgerStore::new(&format!(
        "sqlite:{}",
        data_dir.join("audit.db").display()
    ))
    .await?;

    let report = verify::verify_ledger(&ledger).await?;
    println!("records checked: {}", report.checked);
    if report.is_valid() {
        println!("ledger OK: every signature verifies and the chain is intact");
        Ok(())
    } else {
        for issue in &report.issues {
            println!("record {}: {}", issue.id, issue.reason);
        }
        anyhow::bail!("{} integrity issue(s) found", report.issues.len());
    }
}

async fn run_export(config: &RelayConfig, after_id: i64, limit: u32) -> anyhow::Result<()> {
    let data_dir = PathBuf::from(&config.data_dir);
    let ledger = LedgerStore::new(&format!(
        "sqlite:{}",
        data_dir.join("audit.db").display()
    ))
    .await?;

    for record in ledger.get_after_id(after_id, limit).await? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn run_validate(config: &RelayConfig) -> anyhow::Result<()> {
    config::validate_config(config)?;
    let data_dir = PathBuf::from(&config.data_dir);
    if data_dir.join("policy.json").exists() {
        load_policy(&data_dir)?;
        println!("✓ Policy is valid.");
    }
    println!("✓ Configuration is valid.\n");
    println!("Resolved configuration:");
    println!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

fn run_keygen(config: &RelayConfig) -> anyhow::Result<()> {
    let passphrase = std::env::var("QUILL_KEY_PASSPHRASE").ok();
    let keystore = Keystore::new(&config.data_dir, &config.key_name);

    if keystore.key_path().exists() {
        anyhow::bail!(
            "refusing to overwrite existing key at {}",
            keystore.key_path().display()
        );
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let keys = keystore.generate(passphrase.as_deref())?;
    println!("generated operator keypair");
    println!("  private key: {}", keystore.key_path().display());
    println!("  public key:  {}", keystore.pub_path().display());
    println!("  fingerprint: {}", keys.fingerprint());
    if passphrase.is_some() {
        println!("  private key is encrypted with the supplied passphrase");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received shutdown signal");
}
