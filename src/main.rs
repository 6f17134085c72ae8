//! ark - push local directories to an arkd receiver
//!
//! The server decides where a push lands; the client only names what it
//! sends. Exit codes: 0 accepted, 2 rejected, 75 retry later, 1 failed.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use ark::cli::init_tracing;
use ark::net_async::{client, RemoteError};
use ark::tar_stream::TarConfig;
use ark::tls;
use ark::ErrorClass;

#[derive(Parser, Debug)]
#[command(author, version, about = "Push backups to an arkd receiver over mutual TLS")]
struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Client certificate (default: ~/.config/ark/client-cert.pem)
    #[arg(long, global = true)]
    cert: Option<PathBuf>,

    /// Client private key (default: ~/.config/ark/client-key.pem)
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pack sources as tar and push them
    Push {
        /// Server host
        #[arg(long)]
        host: String,

        /// Server port
        #[arg(long, default_value_t = 9031)]
        port: u16,

        /// Pinned server fingerprints
        #[arg(long)]
        known_hosts: Option<PathBuf>,

        /// Suppress the progress spinner
        #[arg(long, short = 'q')]
        quiet: bool,

        /// Directories or files to push; each lands under its own name
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// Create a client certificate if missing and print its fingerprint
    Keygen {
        /// Identity to record next to the fingerprint
        #[arg(long)]
        identity: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("ark: {:#}", e);
            match e.downcast_ref::<RemoteError>().map(|r| r.class) {
                Some(ErrorClass::Rejected) => 2,
                Some(ErrorClass::Retryable) => 75,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let (default_cert, default_key) = tls::default_client_cert_paths();
    let cert = cli.cert.unwrap_or(default_cert);
    let key = cli.key.unwrap_or(default_key);

    match cli.command {
        Command::Keygen { identity } => {
            let subject = identity.clone().unwrap_or_else(|| {
                hostname::get()
                    .map(|h| h.to_string_lossy().into_owned())
                    .unwrap_or_else(|_| "ark-client".to_string())
            });
            if tls::generate_if_missing(&cert, &key, &subject)? {
                eprintln!("created {}", cert.display());
            }
            let fp = tls::fingerprint_file(&cert)?;
            // Ready to paste into the server's authorized_clients file
            println!("{}={}", fp, identity.unwrap_or(subject));
            Ok(())
        }
        Command::Push {
            host,
            port,
            known_hosts,
            quiet,
            sources,
        } => {
            for src in &sources {
                if !src.exists() {
                    anyhow::bail!("source {} does not exist", src.display());
                }
            }
            let known = known_hosts.unwrap_or_else(tls::known_hosts_path);
            let tls_config = tls::build_client_config(&host, port, &cert, &key, &known)
                .with_context(|| format!("load client identity {}", cert.display()))?;

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;

            let spinner = if quiet {
                ProgressBar::hidden()
            } else {
                let s = ProgressBar::new_spinner();
                s.set_style(
                    ProgressStyle::default_spinner()
                        .template("{spinner:.green} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                s.enable_steady_tick(Duration::from_millis(100));
                s
            };
            spinner.set_message(format!("pushing {} source(s) to {}:{}", sources.len(), host, port));

            let started = Instant::now();
            let result = rt.block_on(client::push(&host, port, &sources, tls_config, &TarConfig::default()));
            spinner.finish_and_clear();

            let outcome = result?;
            let secs = started.elapsed().as_secs_f64();
            println!(
                "accepted: {} files, {} bytes in {:.1}s",
                outcome.files, outcome.bytes, secs
            );
            Ok(())
        }
    }
}
