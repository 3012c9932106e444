//! Boot the whole service from a configuration file and talk to both front-ends.

use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{extract::Form, routing::post, Json};
use serde_json::{json, Value};
use ssh_casign_sso::config::Config;
use ssh_key::{rand_core::OsRng, Algorithm, Certificate, LineEnding, PrivateKey};
use tokio::{io::AsyncReadExt, net::TcpListener};
use tokio_util::sync::CancellationToken;

fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// A provider that knows a single active token.
async fn spawn_introspection() -> SocketAddr {
    async fn introspect(Form(form): Form<Vec<(String, String)>>) -> Json<Value> {
        let token = form
            .iter()
            .find(|(name, _)| name == "token")
            .map(|(_, value)| value.as_str());
        if token == Some("carol-token") {
            Json(json!({"active": true, "sub": "6f1d", "preferred_username": "carol"}))
        } else {
            Json(json!({"active": false}))
        }
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = axum::Router::new().route("/introspect", post(introspect));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    address
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn write_config(dir: &Path, provider: SocketAddr, web: u16, ssh: u16) -> PrivateKey {
    let ca_key = random_key();
    ca_key
        .write_openssh_file(&dir.join("demo_ca"), LineEnding::LF)
        .unwrap();
    random_key()
        .write_openssh_file(&dir.join("host_key"), LineEnding::LF)
        .unwrap();
    let config = format!(
        r#"
        verification_uri_template = "http://127.0.0.1:{web}/{{code}}"
        callback_uri = "http://127.0.0.1:{web}/callback"
        ssh_listen_on = "127.0.0.1:{ssh}"
        web_listen_on = "127.0.0.1:{web}"
        ssh_host_key_file = "host_key"
        default_ca = "demoCA"

        [authorities.demoCA]
        client_id = "login-client"
        introspection_client_id = "introspector"
        introspection_client_secret = "secret"
        signer = {{ provider = "file", private_key_file = "demo_ca" }}

        [authorities.demoCA.oidc]
        authorization = "http://{provider}/authorize"
        token = "http://{provider}/token"
        introspection = "http://{provider}/introspect"
        issuer = "http://{provider}"
        "#
    );
    std::fs::write(dir.join("sshca.toml"), config).unwrap();
    ca_key
}

async fn wait_for(port: u16) -> tokio::net::TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on port {port}");
}

#[tokio::test]
async fn serves_both_front_ends() {
    let dir = tempfile::tempdir().unwrap();
    let provider = spawn_introspection().await;
    let (web, ssh) = (free_port().await, free_port().await);
    let ca_key = write_config(dir.path(), provider, web, ssh);

    let path = dir.path().join("sshca.toml");
    let config = Config::load(&path).unwrap();
    let registry = ssh_casign_sso::load_registry(&config, &config.key_provider(dir.path())).unwrap();
    let halt = CancellationToken::new();
    let service = tokio::spawn(ssh_casign_sso::run(Arc::new(config), registry, halt.clone()));

    // The SSH front-end greets with its version string.
    let mut stream = wait_for(ssh).await;
    let mut banner = [0u8; 8];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"SSH-2.0-");

    wait_for(web).await;
    let client = reqwest::Client::new();
    let user_key = random_key();
    let response = client
        .post(format!("http://127.0.0.1:{web}/sign"))
        .body(
            json!({
                "PublicKey": user_key.public_key().to_openssh().unwrap(),
                "OTT": "carol-token",
            })
            .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let certificate = Certificate::from_openssh(response.text().await.unwrap().trim()).unwrap();
    assert_eq!(certificate.valid_principals(), ["carol".to_string()]);
    assert_eq!(certificate.signature_key(), ca_key.public_key().key_data());

    let response = client
        .get(format!("http://127.0.0.1:{web}/notarealcode"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    halt.cancel();
    tokio::time::timeout(Duration::from_secs(5), service)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn refuses_unknown_default_ca() {
    let dir = tempfile::tempdir().unwrap();
    let provider = spawn_introspection().await;
    write_config(dir.path(), provider, 1, 2);
    let path = dir.path().join("sshca.toml");
    let mut config = Config::load(&path).unwrap();
    config.default_ca = Some("nonexistent".to_string());

    let keys = config.key_provider(dir.path());
    let error = ssh_casign_sso::load_registry(&config, &keys).unwrap_err();
    assert!(error.to_string().contains("default_ca"));
}
