use std::{path::Path, sync::Arc};

use anyhow::Context;
use clap::Parser;
use ssh_casign_sso::{config::Config, ssh};
use ssh_key::HashAlg;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // EnvFilter does not implement Clone, so clap can't parse it for us.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SSHCA_LOG contains an invalid log directive; refer to \
        https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
        filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .context("a global tracing subscriber was already installed")?;

    let config = Config::load(&opts.config)?;
    let base_dir = opts.config.parent().unwrap_or(Path::new("."));
    let keys = config.key_provider(base_dir);

    match opts.command {
        cli::Command::Listen {} => {
            let halt = CancellationToken::new();
            tokio::spawn(signal_handler(halt.clone()));
            let registry = ssh_casign_sso::load_registry(&config, &keys)?;
            ssh_casign_sso::run(Arc::new(config), registry, halt)
                .instrument(tracing::info_span!("service"))
                .await?;
        }
        cli::Command::CheckConfig {} => {
            let registry = ssh_casign_sso::load_registry(&config, &keys)?;
            ssh::load_host_key(&config.ssh_host_key_file).with_context(|| {
                format!(
                    "failed to read the SSH host key from {}",
                    config.ssh_host_key_file.display()
                )
            })?;
            let mut entries = registry.entries().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.name().cmp(b.name()));
            for entry in entries {
                let login = if entry.oidc().is_some() {
                    "browser login"
                } else {
                    "signer only"
                };
                println!(
                    "{}\t{}\t{}",
                    entry.name(),
                    login,
                    entry.public_key().fingerprint(HashAlg::Sha256)
                );
            }
        }
    }

    Ok(())
}

/// Cancel `halt_token` on SIGTERM or SIGINT.
///
/// Sessions already waiting on a browser login are dropped with their connections.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, beginning service shutdown");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, beginning service shutdown");
                halt_token.cancel();
            }
        }
    }
}
