//! SSH front-end.
//!
//! A user runs `ssh -p 2221 <ca>@host`. The key they authenticate with is the
//! key to certify and the user name (or the exec command, if any) names the
//! CA. The session prints a verification link, waits for the browser login
//! and finally prints the certificate:
//!
//! * stdout: the verification link, then the OpenSSH certificate
//! * stderr: `error: <kind>: <message>` on failure
//! * exit status: 0, or the [`ErrorKind`] status

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use russh::{
    server::{Auth, Msg, Session},
    Channel, ChannelId, CryptoVec, Pty,
};
use ssh_key::{Certificate, PublicKey};
use thiserror::Error;
use tokio::{net::TcpListener, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::Config,
    issuer::{IssueError, Issuer},
    registry::{CaRegistry, UnknownCa},
    rendezvous::{code_prefix, RendezvousError, RendezvousStore},
};

/// Failure classes reported to the SSH client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    UnknownCa,
    Expired,
    Denied,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownCa => "unknown_ca",
            ErrorKind::Expired => "expired",
            ErrorKind::Denied => "denied",
        }
    }

    pub fn exit_status(&self) -> u32 {
        match self {
            ErrorKind::UnknownCa => 2,
            ErrorKind::Expired => 3,
            ErrorKind::Denied => 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    UnknownCa(#[from] UnknownCa),
    #[error("CA '{0}' does not offer browser login")]
    SignerOnly(String),
    #[error("the public key could not be read: {0}")]
    PublicKey(String),
    #[error("the login was not completed in time; run the command again")]
    Expired,
    #[error("the login could not be completed: {0}")]
    Rendezvous(RendezvousError),
    #[error(transparent)]
    Issue(#[from] IssueError),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::UnknownCa(_) => ErrorKind::UnknownCa,
            RequestError::Expired => ErrorKind::Expired,
            RequestError::SignerOnly(_)
            | RequestError::PublicKey(_)
            | RequestError::Rendezvous(_)
            | RequestError::Issue(_) => ErrorKind::Denied,
        }
    }
}

impl From<RendezvousError> for RequestError {
    fn from(error: RendezvousError) -> Self {
        match error {
            RendezvousError::Expired | RendezvousError::NotFound => RequestError::Expired,
            other => RequestError::Rendezvous(other),
        }
    }
}

/// What a session ended with.
#[derive(Debug)]
pub(crate) enum Outcome {
    Delivered(Certificate),
    Failed(ErrorKind),
    /// The client went away; nothing was sent.
    Abandoned,
}

/// The session's stdout, stderr and exit status.
pub(crate) trait Output {
    /// Returns false once the client can no longer be reached.
    async fn stdout(&mut self, text: &str) -> bool;
    async fn stderr(&mut self, text: &str) -> bool;
    async fn exit(&mut self, status: u32);
}

/// Everything an SSH session needs; cheap to clone.
#[derive(Clone)]
pub struct SshState {
    config: Arc<Config>,
    registry: Arc<CaRegistry>,
    store: RendezvousStore,
    issuer: Arc<Issuer>,
}

impl SshState {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<CaRegistry>,
        store: RendezvousStore,
        issuer: Arc<Issuer>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            issuer,
        }
    }
}

async fn fail<O: Output>(out: &mut O, error: RequestError) -> Outcome {
    let kind = error.kind();
    tracing::info!(kind = kind.as_str(), %error, "Certificate request failed");
    out.stderr(&format!("error: {}: {error}\n", kind.as_str()))
        .await;
    out.exit(kind.exit_status()).await;
    Outcome::Failed(kind)
}

/// Run one certificate request from CA name to delivered certificate.
pub(crate) async fn handle_request<O: Output>(
    state: &SshState,
    ca: &str,
    public_key: PublicKey,
    out: &mut O,
    cancel: &CancellationToken,
) -> Outcome {
    let entry = match state.registry.lookup(ca) {
        Ok(entry) => entry,
        Err(error) => return fail(out, error.into()).await,
    };
    if entry.oidc().is_none() {
        return fail(out, RequestError::SignerOnly(entry.name().to_string())).await;
    }

    let code = state.store.create(entry.name().clone(), public_key);
    let deadline = Instant::now() + state.config.rendezvous_ttl();
    let uri = state.config.verification_uri(&code);
    let greeting = format!(
        "Log in to {} within {} seconds to receive your certificate:\n{}\n",
        entry.display_name(),
        state.config.rendezvous_ttl,
        uri.trim_end()
    );
    if !out.stdout(&greeting).await {
        // Cancelling the wait abandons the entry.
        cancel.cancel();
    }

    let completed = match state.store.wait(&code, deadline, cancel).await {
        Ok(completed) => completed,
        Err(RendezvousError::Cancelled) => {
            tracing::info!(code = code_prefix(&code), "Client disconnected before login completed");
            return Outcome::Abandoned;
        }
        Err(error) => return fail(out, error.into()).await,
    };

    let certificate = match state
        .issuer
        .issue(&entry, &completed.identity, &completed.public_key, None)
        .await
    {
        Ok(certificate) => certificate,
        Err(error) => return fail(out, error.into()).await,
    };
    let encoded = match certificate.to_openssh() {
        Ok(encoded) => encoded,
        Err(error) => {
            return fail(out, IssueError::Signing(error.into()).into()).await;
        }
    };
    if out.stdout(&format!("{encoded}\n")).await {
        out.exit(0).await;
    } else {
        tracing::warn!(principal = completed.identity.principal(), "Client left before the certificate was delivered");
    }
    Outcome::Delivered(certificate)
}

struct ChannelOutput {
    handle: russh::server::Handle,
    channel: ChannelId,
}

impl Output for ChannelOutput {
    async fn stdout(&mut self, text: &str) -> bool {
        self.handle
            .data(self.channel, CryptoVec::from_slice(text.as_bytes()))
            .await
            .is_ok()
    }

    async fn stderr(&mut self, text: &str) -> bool {
        self.handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(text.as_bytes()))
            .await
            .is_ok()
    }

    async fn exit(&mut self, status: u32) {
        let _ = self.handle.exit_status_request(self.channel, status).await;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

/// Per-connection state. Dropped when the connection ends, which cancels
/// any wait still in progress.
struct ConnectionHandler {
    state: SshState,
    user: Option<String>,
    public_key: Option<Result<PublicKey, String>>,
    channel: Option<Channel<Msg>>,
    started: bool,
    cancel: CancellationToken,
}

impl ConnectionHandler {
    fn new(state: SshState) -> Self {
        Self {
            state,
            user: None,
            public_key: None,
            channel: None,
            started: false,
            cancel: CancellationToken::new(),
        }
    }

    fn start(&mut self, channel: ChannelId, command: Option<String>, session: &mut Session) {
        if self.started {
            return;
        }
        self.started = true;
        let ca = command
            .filter(|command| !command.is_empty())
            .or_else(|| self.user.clone())
            .unwrap_or_default();
        let mut out = ChannelOutput {
            handle: session.handle(),
            channel,
        };
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let public_key = self.public_key.clone();
        let span = tracing::info_span!("certificate_request", %ca);
        tokio::spawn(
            async move {
                match public_key {
                    Some(Ok(public_key)) => {
                        handle_request(&state, &ca, public_key, &mut out, &cancel).await;
                    }
                    Some(Err(error)) => {
                        fail(&mut out, RequestError::PublicKey(error)).await;
                    }
                    None => {
                        fail(&mut out, RequestError::PublicKey("no key offered".into())).await;
                    }
                }
            }
            .instrument(span),
        );
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // russh carries its own copy of the ssh-key types; go through the wire format.
        let converted = public_key
            .to_openssh()
            .map_err(|error| error.to_string())
            .and_then(|encoded| {
                PublicKey::from_openssh(&encoded).map_err(|error| error.to_string())
            });
        tracing::debug!(user, accepted = converted.is_ok(), "Public key authentication");
        self.user = Some(user.to_string());
        self.public_key = Some(converted);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        // One certificate request per connection.
        if self.channel.is_some() {
            return Ok(false);
        }
        self.channel = Some(channel);
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        self.start(channel, None, session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let command = String::from_utf8_lossy(data).trim().to_string();
        self.start(channel, Some(command), session);
        Ok(())
    }

    /// Interactive clients ask for a terminal first; grant it so they go on
    /// to request a shell.
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.cancel.cancel();
        Ok(())
    }
}

pub fn load_host_key(path: &Path) -> Result<russh::keys::PrivateKey, russh::keys::Error> {
    russh::keys::load_secret_key(path, None)
}

/// Accept SSH connections until `halt` is cancelled, one task per connection.
pub async fn serve(
    listener: TcpListener,
    state: SshState,
    host_key: russh::keys::PrivateKey,
    halt: CancellationToken,
) -> std::io::Result<()> {
    let config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        inactivity_timeout: Some(state.config.rendezvous_ttl() + Duration::from_secs(60)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });
    tracing::info!(address = ?listener.local_addr().ok(), "SSH front-end listening");

    loop {
        let (socket, peer): (_, SocketAddr) = tokio::select! {
            _ = halt.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!(?error, "Failed to accept SSH connection");
                    continue;
                }
            },
        };
        let config = config.clone();
        let handler = ConnectionHandler::new(state.clone());
        let span = tracing::info_span!("ssh", %peer);
        tokio::spawn(
            async move {
                tracing::debug!("Connection accepted");
                let result = match russh::server::run_stream(config, socket, handler).await {
                    Ok(session) => session.await,
                    Err(error) => Err(error),
                };
                if let Err(error) = result {
                    tracing::debug!(%error, "SSH session ended with an error");
                }
            }
            .instrument(span),
        );
    }
    tracing::info!("SSH front-end stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        certificate_settings::Profiles,
        config::tests::EXAMPLE,
        identity::Identity,
        registry::{CaEntry, OidcEndpoints, OidcSettings, Tenant},
        ssh_ca::{tests::random_key, Signer},
    };
    use ssh_key::PrivateKey;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Stdout(String),
        Stderr(String),
        Exit(u32),
    }

    struct Recorder {
        events: mpsc::UnboundedSender<Event>,
        connected: bool,
    }

    impl Output for Recorder {
        async fn stdout(&mut self, text: &str) -> bool {
            let _ = self.events.send(Event::Stdout(text.to_string()));
            self.connected
        }

        async fn stderr(&mut self, text: &str) -> bool {
            let _ = self.events.send(Event::Stderr(text.to_string()));
            self.connected
        }

        async fn exit(&mut self, status: u32) {
            let _ = self.events.send(Event::Exit(status));
        }
    }

    fn recorder() -> (Recorder, mpsc::UnboundedReceiver<Event>) {
        let (events, received) = mpsc::unbounded_channel();
        (
            Recorder {
                events,
                connected: true,
            },
            received,
        )
    }

    fn oidc_settings() -> OidcSettings {
        OidcSettings {
            client_id: "login-client".into(),
            introspection_client_id: "introspector".into(),
            introspection_client_secret: "secret".into(),
            endpoints: OidcEndpoints {
                token: "http://idp.example/token".into(),
                introspection: "http://idp.example/introspect".into(),
                issuer: "http://idp.example".into(),
                ..Default::default()
            },
        }
    }

    fn state() -> (SshState, PrivateKey) {
        let ca_key = random_key();
        let registry = CaRegistry::default()
            .with_entry(CaEntry::new(
                "demoCA",
                Signer::new(ca_key.clone()),
                Tenant::Oidc(oidc_settings()),
            ))
            .with_entry(CaEntry::new(
                "transport",
                Signer::new(random_key()),
                Tenant::SignerOnly,
            ));
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let store = RendezvousStore::new(config.rendezvous_ttl(), config.sso_ttl());
        let state = SshState::new(
            Arc::new(config),
            Arc::new(registry),
            store,
            Arc::new(Issuer::new(Profiles::default())),
        );
        (state, ca_key)
    }

    fn code_from(event: Event) -> String {
        let Event::Stdout(text) = event else {
            panic!("expected the verification link, got {event:?}");
        };
        let link = text.lines().last().unwrap();
        link.strip_prefix("http://localhost:2280/").unwrap().to_string()
    }

    #[tokio::test]
    async fn unknown_ca_fails_without_rendezvous() {
        let (state, _) = state();
        let (mut out, mut events) = recorder();
        let outcome = handle_request(
            &state,
            "nonexistent",
            random_key().public_key().clone(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, Outcome::Failed(ErrorKind::UnknownCa)));
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Stderr("error: unknown_ca: unknown CA 'nonexistent'\n".into())
        );
        assert_eq!(events.recv().await.unwrap(), Event::Exit(2));
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn signer_only_ca_is_denied() {
        let (state, _) = state();
        let (mut out, _events) = recorder();
        let outcome = handle_request(
            &state,
            "transport",
            random_key().public_key().clone(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed(ErrorKind::Denied)));
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn delivers_certificate_after_login() {
        let (state, ca_key) = state();
        let user_key = random_key();
        let (mut out, mut events) = recorder();

        let session = {
            let state = state.clone();
            let public_key = user_key.public_key().clone();
            tokio::spawn(async move {
                handle_request(
                    &state,
                    "demoCA",
                    public_key,
                    &mut out,
                    &CancellationToken::new(),
                )
                .await
            })
        };

        let code = code_from(events.recv().await.unwrap());
        state
            .store
            .authenticate(&code, Identity::new("alice"))
            .unwrap();

        let Outcome::Delivered(certificate) = session.await.unwrap() else {
            panic!("no certificate delivered");
        };
        assert_eq!(certificate.valid_principals(), ["alice".to_string()]);
        assert_eq!(certificate.public_key(), user_key.public_key().key_data());
        assert_eq!(certificate.signature_key(), ca_key.public_key().key_data());

        let Event::Stdout(delivered) = events.recv().await.unwrap() else {
            panic!("expected the certificate on stdout");
        };
        assert_eq!(Certificate::from_openssh(delivered.trim()).unwrap(), certificate);
        assert_eq!(events.recv().await.unwrap(), Event::Exit(0));

        // The code is single use.
        assert_eq!(
            state.store.authenticate(&code, Identity::new("mallory")),
            Err(RendezvousError::AlreadyAuthenticated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reports_expiry() {
        let (state, _) = state();
        let (mut out, mut events) = recorder();
        let started = Instant::now();
        let outcome = handle_request(
            &state,
            "demoCA",
            random_key().public_key().clone(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(outcome, Outcome::Failed(ErrorKind::Expired)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        code_from(events.recv().await.unwrap());
        let Event::Stderr(error) = events.recv().await.unwrap() else {
            panic!("expected an error on stderr");
        };
        assert!(error.starts_with("error: expired: "));
        assert_eq!(events.recv().await.unwrap(), Event::Exit(3));
        assert!(state.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_abandons_rendezvous() {
        let (state, _) = state();
        let (mut out, mut events) = recorder();
        let cancel = CancellationToken::new();

        let session = {
            let state = state.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                handle_request(
                    &state,
                    "demoCA",
                    random_key().public_key().clone(),
                    &mut out,
                    &cancel,
                )
                .await
            })
        };
        let code = code_from(events.recv().await.unwrap());
        cancel.cancel();

        assert!(matches!(session.await.unwrap(), Outcome::Abandoned));
        assert_eq!(
            state.store.authenticate(&code, Identity::new("alice")),
            Err(RendezvousError::NotFound)
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_client_abandons_immediately() {
        let (state, _) = state();
        let (mut out, _events) = recorder();
        out.connected = false;
        let outcome = handle_request(
            &state,
            "demoCA",
            random_key().public_key().clone(),
            &mut out,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, Outcome::Abandoned));
        assert!(state.store.is_empty());
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            RequestError::from(RendezvousError::Expired).kind(),
            ErrorKind::Expired
        );
        assert_eq!(
            RequestError::from(RendezvousError::Cancelled).kind(),
            ErrorKind::Denied
        );
        assert_eq!(ErrorKind::UnknownCa.exit_status(), 2);
        assert_eq!(ErrorKind::Denied.as_str(), "denied");
    }

    /// Drives the server through a real russh client.
    mod over_the_wire {
        use super::*;
        use russh::{client, ChannelMsg, Disconnect};
        use ssh_key::LineEnding;

        struct TrustingClient;

        impl client::Handler for TrustingClient {
            type Error = russh::Error;

            async fn check_server_key(
                &mut self,
                _server_public_key: &russh::keys::PublicKey,
            ) -> Result<bool, Self::Error> {
                Ok(true)
            }
        }

        fn to_russh(key: &PrivateKey) -> russh::keys::PrivateKey {
            let encoded = key.to_openssh(LineEnding::LF).unwrap();
            russh::keys::PrivateKey::from_openssh(encoded.as_bytes()).unwrap()
        }

        async fn start_server(state: &SshState) -> (SocketAddr, CancellationToken) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap();
            let halt = CancellationToken::new();
            tokio::spawn(serve(
                listener,
                state.clone(),
                to_russh(&random_key()),
                halt.clone(),
            ));
            (address, halt)
        }

        async fn connect(
            address: SocketAddr,
            user: &str,
            key: &PrivateKey,
        ) -> client::Handle<TrustingClient> {
            let config = Arc::new(client::Config::default());
            let mut session = client::connect(config, address, TrustingClient)
                .await
                .unwrap();
            let auth = session
                .authenticate_publickey(
                    user,
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(to_russh(key)), None),
                )
                .await
                .unwrap();
            assert!(auth.success());
            session
        }

        #[derive(Default)]
        struct Transcript {
            stdout: String,
            stderr: String,
            exit: Option<u32>,
            granted: usize,
        }

        /// Read channel messages until `done` holds or the channel ends.
        async fn read_until(
            channel: &mut russh::Channel<client::Msg>,
            transcript: &mut Transcript,
            done: impl Fn(&Transcript) -> bool,
        ) {
            let reading = async {
                while !done(transcript) {
                    match channel.wait().await {
                        Some(ChannelMsg::Data { data }) => {
                            transcript.stdout.push_str(&String::from_utf8_lossy(&data));
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            transcript.stderr.push_str(&String::from_utf8_lossy(&data));
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            transcript.exit = Some(exit_status);
                        }
                        Some(ChannelMsg::Success) => transcript.granted += 1,
                        Some(_) => {}
                        None => break,
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(10), reading)
                .await
                .unwrap();
        }

        fn code_in(stdout: &str) -> String {
            let link = stdout
                .lines()
                .find(|line| line.starts_with("http://localhost:2280/"))
                .unwrap();
            link.trim_start_matches("http://localhost:2280/").to_string()
        }

        #[tokio::test]
        async fn unknown_ca_exits_with_status_2() {
            let (state, _) = state();
            let (address, halt) = start_server(&state).await;
            let session = connect(address, "nonexistent", &random_key()).await;

            let mut channel = session.channel_open_session().await.unwrap();
            channel.request_shell(true).await.unwrap();
            let mut transcript = Transcript::default();
            read_until(&mut channel, &mut transcript, |t| t.exit.is_some()).await;

            assert_eq!(transcript.exit, Some(2));
            assert_eq!(transcript.stderr, "error: unknown_ca: unknown CA 'nonexistent'\n");
            assert!(transcript.stdout.is_empty());
            assert!(state.store.is_empty());
            halt.cancel();
        }

        #[tokio::test]
        async fn exec_command_names_the_ca() {
            let (state, ca_key) = state();
            let (address, halt) = start_server(&state).await;
            let user_key = random_key();
            let session = connect(address, "x", &user_key).await;

            let mut channel = session.channel_open_session().await.unwrap();
            channel.exec(true, "demoCA").await.unwrap();
            let mut transcript = Transcript::default();
            read_until(&mut channel, &mut transcript, |t| {
                t.stdout.contains("http://localhost:2280/") && t.stdout.ends_with('\n')
            })
            .await;

            let code = code_in(&transcript.stdout);
            state
                .store
                .authenticate(&code, Identity::new("alice"))
                .unwrap();
            read_until(&mut channel, &mut transcript, |t| t.exit.is_some()).await;

            assert_eq!(transcript.exit, Some(0));
            assert!(transcript.stderr.is_empty());
            let line = transcript.stdout.lines().last().unwrap();
            let certificate = Certificate::from_openssh(line).unwrap();
            assert_eq!(certificate.valid_principals(), ["alice".to_string()]);
            assert_eq!(certificate.public_key(), user_key.public_key().key_data());
            assert_eq!(certificate.signature_key(), ca_key.public_key().key_data());
            halt.cancel();
        }

        #[tokio::test]
        async fn disconnect_while_waiting_abandons_the_code() {
            let (state, _) = state();
            let (address, halt) = start_server(&state).await;
            let session = connect(address, "demoCA", &random_key()).await;

            // What an interactive `ssh demoCA@host` sends.
            let mut channel = session.channel_open_session().await.unwrap();
            channel
                .request_pty(true, "xterm", 80, 24, 0, 0, &[])
                .await
                .unwrap();
            channel.request_shell(true).await.unwrap();
            let mut transcript = Transcript::default();
            read_until(&mut channel, &mut transcript, |t| {
                t.granted == 2
                    && t.stdout.contains("http://localhost:2280/")
                    && t.stdout.ends_with('\n')
            })
            .await;
            assert_eq!(transcript.granted, 2);
            let code = code_in(&transcript.stdout);
            assert_eq!(state.store.len(), 1);

            session
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .unwrap();
            drop(channel);
            drop(session);

            let abandoned = async {
                while !state.store.is_empty() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            };
            tokio::time::timeout(Duration::from_secs(10), abandoned)
                .await
                .unwrap();
            assert_eq!(
                state.store.authenticate(&code, Identity::new("alice")),
                Err(RendezvousError::NotFound)
            );
            halt.cancel();
        }
    }
}
