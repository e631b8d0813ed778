use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use contracthost::{
    config::{HostConfig, TlsConfig},
    host::Host,
    ledger::{BalanceLedger, ContractRef, MemoryLedger, SqliteLedger},
    sandbox::{Sandbox, SandboxEngine, SandboxExit, SandboxStream, StartedSandbox},
    token::Token,
    HostResult,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tempfile::TempDir;
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::TcpStream,
    sync::oneshot,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

//--------------------------------------------------------------------------------------------------
// Fixtures
//--------------------------------------------------------------------------------------------------

const FUNDED: &str = "w6c3j5mf3w6hyrkcphfylxkfqilollx55qctspadscmwp7ii5qva";
const UNFUNDED: &str = "uwxcucg6on2mddsa6cmpeeoo4axh5iuda3q6rpokofwh4mgam4wq";
const UNKNOWN: &str = "gt6pedc7ofkgf2orvggxj4eo4igxm4yj3mxmmnikc2yyi373eoza";

#[derive(Default)]
struct EchoEngine {
    starts: AtomicUsize,
}

struct EchoSandbox {
    exit_tx: Mutex<Option<oneshot::Sender<SandboxExit>>>,
}

#[async_trait]
impl SandboxEngine for EchoEngine {
    async fn start(&self, _contract: &ContractRef, _token: &Token) -> HostResult<StartedSandbox> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exited) = oneshot::channel();
        Ok(StartedSandbox {
            sandbox: Arc::new(EchoSandbox {
                exit_tx: Mutex::new(Some(exit_tx)),
            }),
            exited,
        })
    }
}

#[async_trait]
impl Sandbox for EchoSandbox {
    async fn open_stream(&self) -> HostResult<SandboxStream> {
        let (ours, theirs) = duplex(64 * 1024);
        tokio::spawn(echo(theirs));
        Ok(Box::new(ours))
    }

    async fn terminate(&self) -> HostResult<()> {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(SandboxExit::Exited { code: None });
        }
        Ok(())
    }
}

async fn echo(mut stream: DuplexStream) {
    let mut buf = [0u8; 1024];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
}

/// TLS material for a host reachable as `localhost`, `127.0.0.1` and the test tokens.
struct Pki {
    _dir: TempDir,
    tls: TlsConfig,
    roots: RootCertStore,
}

impl Pki {
    fn generate() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "contracthost test ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let names = ["localhost", "127.0.0.1", FUNDED, UNFUNDED, UNKNOWN]
            .into_iter()
            .map(|name| match name {
                "localhost" | "127.0.0.1" => name.to_string(),
                token => format!("{token}.localhost"),
            })
            .collect::<Vec<_>>();
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = CertificateParams::new(names)
            .unwrap()
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, leaf_cert.pem()).unwrap();
        std::fs::write(&key, leaf_key.serialize_pem()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(ca_cert.der().clone()).unwrap();

        Self {
            _dir: dir,
            tls: TlsConfig::builder().cert(cert).key(key).build(),
            roots,
        }
    }

    fn connector(&self) -> TlsConnector {
        let config =
            ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

fn host_config(pki: &Pki, database_path: &Path, ms_per_unit: u64) -> HostConfig {
    HostConfig::builder()
        .port(0)
        .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .tls(pki.tls.clone())
        .poll_interval_ms(20)
        .milliseconds_per_compute_unit(ms_per_unit)
        .database_path(database_path)
        .dev_funding(true)
        .build()
}

fn memory_ledger() -> Arc<MemoryLedger> {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.register(token(FUNDED), ContractRef::new("c0ffee"), 1_000_000);
    ledger.register(token(UNFUNDED), ContractRef::new("c0ffee"), 0);
    ledger
}

fn token(token: &str) -> Token {
    token.parse().unwrap()
}

async fn connect(pki: &Pki, addr: SocketAddr, server_name: &str) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from(server_name.to_string()).unwrap();
    pki.connector().connect(server_name, tcp).await.unwrap()
}

async fn read_all(stream: &mut TlsStream<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received))
        .await
        .expect("stream should close")?;
    Ok(received)
}

async fn start_host(pki: &Pki, dir: &TempDir) -> (Host, Arc<MemoryLedger>, Arc<EchoEngine>) {
    let ledger = memory_ledger();
    let engine = Arc::new(EchoEngine::default());
    let config = host_config(pki, &dir.path().join("unused.db"), 100);
    let host = Host::start(&config, ledger.clone(), engine.clone())
        .await
        .unwrap();
    (host, ledger, engine)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_token_server_name_routes_to_contract() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let (host, _, engine) = start_host(&pki, &dir).await;

    let server_name = format!("{FUNDED}.localhost");
    let mut first = connect(&pki, host.local_addr(), &server_name).await;
    first.write_all(b"hello contract").await?;
    let mut buf = [0u8; 14];
    first.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"hello contract");

    let mut second = connect(&pki, host.local_addr(), &server_name).await;
    second.write_all(b"again").await?;
    let mut buf = [0u8; 5];
    second.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"again");

    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);
    assert_eq!(host.manager().live_count(), 1);
    let info = host.manager().instance(&token(FUNDED)).unwrap();
    assert_eq!(info.active_streams, 2);

    host.shutdown().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_plain_server_name_routes_to_control_plane() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let (host, _, engine) = start_host(&pki, &dir).await;

    let mut stream = connect(&pki, host.local_addr(), "localhost").await;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await?;
    let response = String::from_utf8(read_all(&mut stream).await?)?;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""status":"ok""#), "{response}");
    assert_eq!(engine.starts.load(Ordering::SeqCst), 0);

    host.shutdown().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_missing_server_name_routes_to_control_plane() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let (host, _, _) = start_host(&pki, &dir).await;

    // Clients never send SNI for an IP address.
    let mut stream = connect(&pki, host.local_addr(), "127.0.0.1").await;
    stream
        .write_all(
            format!("GET /token/{FUNDED} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await?;
    let response = String::from_utf8(read_all(&mut stream).await?)?;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""balance":1000000"#), "{response}");

    host.shutdown().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_refused_contract_connections_close_without_payload() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let (host, _, engine) = start_host(&pki, &dir).await;

    for refused in [UNFUNDED, UNKNOWN] {
        let mut stream = connect(&pki, host.local_addr(), &format!("{refused}.localhost")).await;
        let received = read_all(&mut stream).await?;
        assert!(received.is_empty(), "{refused} received {received:?}");
    }

    assert_eq!(engine.starts.load(Ordering::SeqCst), 0);
    assert_eq!(host.manager().live_count(), 0);

    host.shutdown().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_exhausted_balance_closes_connection() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let db_path = dir.path().join("ledger.db");

    let ledger = Arc::new(SqliteLedger::open(&db_path).await?);
    ledger
        .register_token(&token(FUNDED), &ContractRef::new("c0ffee"), 30)
        .await?;

    let engine = Arc::new(EchoEngine::default());
    let config = host_config(&pki, &db_path, 10);
    let host = Host::start(&config, ledger.clone(), engine.clone()).await?;

    let mut stream = connect(&pki, host.local_addr(), &format!("{FUNDED}.localhost")).await;
    stream.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    assert_eq!(&buf, b"ping");

    // Thirty units at ten milliseconds each run out well within the timeout.
    let rest = read_all(&mut stream).await?;
    assert!(rest.is_empty());
    assert_eq!(ledger.get_balance(&token(FUNDED)).await?, 0);

    // The next connection is refused.
    let mut stream = connect(&pki, host.local_addr(), &format!("{FUNDED}.localhost")).await;
    assert!(read_all(&mut stream).await?.is_empty());
    assert_eq!(engine.starts.load(Ordering::SeqCst), 1);

    host.shutdown().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_shutdown_closes_open_connections() -> anyhow::Result<()> {
    let pki = Pki::generate();
    let dir = TempDir::new()?;
    let (host, _, _) = start_host(&pki, &dir).await;

    let mut stream = connect(&pki, host.local_addr(), &format!("{FUNDED}.localhost")).await;
    stream.write_all(b"ping").await?;
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;

    let manager = host.manager().clone();
    host.shutdown().await?;
    assert_eq!(manager.live_count(), 0);

    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))));
    Ok(())
}
