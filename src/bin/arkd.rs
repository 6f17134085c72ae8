use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ark::cli::{init_tracing, DaemonOpts};
use ark::config::ArkConfig;
use ark::net_async::server::{serve_with_tls, ServerContext};
use ark::registry::ClientRegistry;
use ark::tls::{self, AuthorizedClients};

#[derive(Parser, Debug)]
#[command(name = "arkd", version, about = "Authenticated push-backup receiver")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the TLS daemon. SIGHUP reloads the manifest and client keys.
    Serve {
        #[command(flatten)]
        opts: DaemonOpts,

        /// Server certificate (generated if missing)
        #[arg(long)]
        tls_cert: Option<PathBuf>,

        /// Server private key (generated if missing)
        #[arg(long)]
        tls_key: Option<PathBuf>,

        /// Fingerprint to identity map
        #[arg(long)]
        authorized_clients: Option<PathBuf>,
    },
    /// Handle one push as an sshd forced command
    ForcedCommand {
        #[command(flatten)]
        opts: DaemonOpts,

        /// Identity fixed by the authorized_keys entry
        #[arg(long)]
        identity: String,
    },
    /// Validate a manifest against the archive root and exit
    CheckManifest {
        #[command(flatten)]
        opts: DaemonOpts,
    },
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve {
            opts,
            tls_cert,
            tls_key,
            authorized_clients,
        } => {
            let mut cfg = opts.resolve()?;
            if let Some(v) = tls_cert {
                cfg.tls_cert = v;
            }
            if let Some(v) = tls_key {
                cfg.tls_key = v;
            }
            if authorized_clients.is_some() {
                cfg.authorized_clients = authorized_clients;
            }
            serve(cfg)
        }
        Command::ForcedCommand { opts, identity } => {
            let cfg = opts.resolve()?;
            let code = forced_command(cfg, &identity)?;
            std::process::exit(code);
        }
        Command::CheckManifest { opts } => check_manifest(opts.resolve()?),
    }
}

fn serve(cfg: ArkConfig) -> Result<()> {
    if cfg.bind.starts_with("0.0.0.0") {
        tracing::warn!(bind = %cfg.bind, "listening on all interfaces");
    }
    let rt = runtime()?;
    rt.block_on(async move {
        let dispatcher = cfg.build_dispatcher(cfg.open_audit_sink()?)?;
        let authorized = match &cfg.authorized_clients {
            Some(path) => AuthorizedClients::load(path)?,
            None => {
                tracing::warn!("no authorized_clients file; TLS clients are known only by fingerprint");
                AuthorizedClients::default()
            }
        };
        let tls_config = tls::load_or_generate_server_config(&cfg.tls_cert, &cfg.tls_key)
            .context("Failed to set up TLS configuration")?;
        tracing::info!(
            cert = %cfg.tls_cert.display(),
            fingerprint = %tls::fingerprint_file(&cfg.tls_cert)?,
            "server certificate"
        );

        let ctx = Arc::new(ServerContext::new(
            dispatcher,
            authorized,
            cfg.authorized_clients.clone(),
            cfg.stream_limits(),
            cfg.tar_config(),
        ));
        spawn_reload_on_hup(ctx.clone())?;
        serve_with_tls(&cfg.bind, ctx, tls_config).await
    })
}

#[cfg(unix)]
fn spawn_reload_on_hup(ctx: Arc<ServerContext>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hup = signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            if let Err(e) = ctx.reload() {
                tracing::error!(error = %format!("{:#}", e), "reload failed; keeping previous configuration");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hup(_ctx: Arc<ServerContext>) -> Result<()> {
    Ok(())
}

fn forced_command(cfg: ArkConfig, identity: &str) -> Result<i32> {
    let rt = runtime()?;
    let original = std::env::var("SSH_ORIGINAL_COMMAND").ok();
    rt.block_on(async move {
        let dispatcher = cfg.build_dispatcher(cfg.open_audit_sink()?)?;
        let mut stdout = std::io::stdout();
        let outcome = ark::ssh::run_forced_command(
            &dispatcher,
            identity,
            original.as_deref(),
            std::io::stdin(),
            cfg.stream_limits(),
            &mut stdout,
        )
        .await
        .context("write status line")?;
        Ok::<i32, anyhow::Error>(ark::ssh::exit_code(outcome))
    })
}

fn check_manifest(cfg: ArkConfig) -> Result<()> {
    let root = cfg.canonical_root()?;
    let registry = ClientRegistry::load(&cfg.manifest, &root)
        .with_context(|| format!("manifest {}", cfg.manifest.display()))?;
    println!("{}: {} clients under {}", cfg.manifest.display(), registry.len(), root.display());
    for entry in registry.entries() {
        println!(
            "  {:<24} {}{}{}",
            entry.identity,
            entry.destination.display(),
            if entry.enabled { "" } else { "  (disabled)" },
            entry
                .quota_bytes
                .map(|q| format!("  quota={}", q))
                .unwrap_or_default()
        );
    }
    Ok(())
}
