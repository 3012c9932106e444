//! An SSH certificate authority that vouches for users through a browser login.
//!
//! A user connects over SSH, is shown a one-time link, logs in with their
//! organisation's OpenID Connect provider and receives a short-lived
//! certificate for the key they connected with.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub mod certificate_settings;
pub mod config;
pub mod identity;
pub mod issuer;
pub mod registry;
pub mod rendezvous;
pub mod ssh;
pub mod ssh_ca;
pub mod web;

use config::Config;
use issuer::Issuer;
use registry::CaRegistry;
use rendezvous::RendezvousStore;
use ssh_ca::KeyProvider;

/// Build the CA registry from the configured authorities.
pub fn load_registry(config: &Config, keys: &dyn KeyProvider) -> anyhow::Result<CaRegistry> {
    let registry = CaRegistry::load(&config.authorities, keys)
        .context("failed to load the certificate authorities")?;
    if let Some(default_ca) = &config.default_ca {
        registry
            .lookup(default_ca)
            .context("default_ca does not name a configured authority")?;
    }
    Ok(registry)
}

/// Run both front-ends and the rendezvous reaper until `halt` is cancelled.
pub async fn run(
    config: Arc<Config>,
    registry: CaRegistry,
    halt: CancellationToken,
) -> anyhow::Result<()> {
    let registry = Arc::new(registry);
    let host_key = ssh::load_host_key(&config.ssh_host_key_file).with_context(|| {
        format!(
            "failed to read the SSH host key from {}",
            config.ssh_host_key_file.display()
        )
    })?;
    let store = RendezvousStore::new(config.rendezvous_ttl(), config.sso_ttl());
    let issuer = Arc::new(Issuer::new(config.certificate.clone()));

    let web_listener = TcpListener::bind(config.web_listen_on)
        .await
        .with_context(|| format!("failed to listen on {}", config.web_listen_on))?;
    let ssh_listener = TcpListener::bind(config.ssh_listen_on)
        .await
        .with_context(|| format!("failed to listen on {}", config.ssh_listen_on))?;

    let app_state = web::AppState::new(
        config.clone(),
        registry.clone(),
        store.clone(),
        issuer.clone(),
    )
    .context("failed to build the identity provider client")?;
    let ssh_state = ssh::SshState::new(config.clone(), registry, store.clone(), issuer);

    let reaper = store.spawn_reaper(config.reap_interval(), halt.clone());
    // Whichever front-end stops first takes the other one down with it.
    let web = tokio::spawn({
        let guard = halt.clone().drop_guard();
        let serve = web::serve(web_listener, app_state, halt.clone());
        async move {
            let _guard = guard;
            serve.await
        }
        .instrument(tracing::info_span!("web"))
    });
    let ssh = tokio::spawn({
        let guard = halt.clone().drop_guard();
        let serve = ssh::serve(ssh_listener, ssh_state, host_key, halt.clone());
        async move {
            let _guard = guard;
            serve.await
        }
        .instrument(tracing::info_span!("ssh_server"))
    });

    let (web, ssh) = tokio::join!(web, ssh);
    reaper.await.context("rendezvous reaper panicked")?;
    web.context("web front-end panicked")?
        .context("web front-end failed")?;
    ssh.context("SSH front-end panicked")?
        .context("SSH front-end failed")?;
    Ok(())
}
