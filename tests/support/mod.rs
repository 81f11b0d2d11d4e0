#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use socketry::connect::{Connect, Connecting, TcpConnector, TcpOptions};
use socketry::dns::{Family, Name, Resolve, Resolving};

/// A TCP listener that accepts and holds connections open, giving mock
/// connects something real to succeed against.
pub struct Backend {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Backend {
    pub async fn spawn() -> Backend {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Backend { addr, handle }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// An address nothing listens on; connects are refused immediately.
pub async fn refused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[derive(Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Connect to the backend; succeeds.
    Ok,
    /// Connect to a closed port; fails with ECONNREFUSED.
    Refused,
    /// Never completes.
    Hang,
}

pub struct Rule {
    pub needle: &'static str,
    pub delay: Duration,
    pub outcome: Outcome,
}

/// A connector with scripted per-target outcomes and an attempt log. Rules
/// match on a substring of the target URI; unmatched targets succeed.
pub struct MockConnector {
    _backend: Backend,
    backend: SocketAddr,
    refused: SocketAddr,
    rules: Vec<Rule>,
    tcp: TcpConnector,
    log: Arc<Mutex<Vec<(String, Instant)>>>,
}

impl MockConnector {
    pub async fn new(rules: Vec<Rule>) -> MockConnector {
        let backend = Backend::spawn().await;
        let backend_addr = backend.addr;
        MockConnector {
            _backend: backend,
            backend: backend_addr,
            refused: refused_addr().await,
            rules,
            tcp: TcpConnector::new(TcpOptions::new()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The attempt targets, in start order.
    pub fn attempts(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn attempt_log(&self) -> Arc<Mutex<Vec<(String, Instant)>>> {
        Arc::clone(&self.log)
    }
}

impl Connect for MockConnector {
    fn connect(&self, target: &str) -> Connecting {
        self.log
            .lock()
            .unwrap()
            .push((target.to_owned(), Instant::now()));

        let outcome = self
            .rules
            .iter()
            .find(|rule| target.contains(rule.needle))
            .map(|rule| (rule.delay, rule.outcome))
            .unwrap_or((Duration::ZERO, Outcome::Ok));

        let tcp = self.tcp.clone();
        let addr = match outcome.1 {
            Outcome::Refused => self.refused,
            _ => self.backend,
        };
        Box::pin(async move {
            if !outcome.0.is_zero() {
                tokio::time::sleep(outcome.0).await;
            }
            if outcome.1 == Outcome::Hang {
                return std::future::pending().await;
            }
            tcp.connect(&format!("tcp://{}", addr)).await
        })
    }
}

/// A resolver answering from a script, with per-family delays and a record
/// of which families were queried.
pub struct ScriptedResolver {
    v6: (Duration, Result<Vec<IpAddr>, String>),
    v4: (Duration, Result<Vec<IpAddr>, String>),
    queried: Arc<Mutex<Vec<Family>>>,
}

impl ScriptedResolver {
    pub fn new(
        v6: (Duration, Result<Vec<IpAddr>, String>),
        v4: (Duration, Result<Vec<IpAddr>, String>),
    ) -> ScriptedResolver {
        ScriptedResolver {
            v6,
            v4,
            queried: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn immediate(v6: Vec<IpAddr>, v4: Vec<IpAddr>) -> ScriptedResolver {
        ScriptedResolver::new((Duration::ZERO, Ok(v6)), (Duration::ZERO, Ok(v4)))
    }

    pub fn queried(&self) -> Arc<Mutex<Vec<Family>>> {
        Arc::clone(&self.queried)
    }
}

impl Resolve for ScriptedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let v6 = self.resolve_family(name.clone(), Family::V6);
        let v4 = self.resolve_family(name, Family::V4);
        Box::pin(async move {
            let mut addrs = v6.await?;
            addrs.extend(v4.await?);
            Ok(addrs)
        })
    }

    fn resolve_family(&self, _name: Name, family: Family) -> Resolving {
        self.queried.lock().unwrap().push(family);
        let (delay, result) = match family {
            Family::V6 => self.v6.clone(),
            Family::V4 => self.v4.clone(),
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result.map_err(Into::into)
        })
    }
}

pub fn v4(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn v6(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// PEM fixtures generated with rcgen: a CA and a server certificate (chain +
/// key in one file, the way `local_cert` expects them).
pub struct TestCerts {
    pub dir: tempfile::TempDir,
    pub ca_pem: PathBuf,
    pub server_pem: PathBuf,
}

pub fn make_certs(hosts: &[&str]) -> TestCerts {
    let dir = tempfile::tempdir().unwrap();

    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new());
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "socketry test CA");
    let ca = rcgen::Certificate::from_params(ca_params).unwrap();

    let server_params =
        rcgen::CertificateParams::new(hosts.iter().map(|h| h.to_string()).collect::<Vec<_>>());
    let server = rcgen::Certificate::from_params(server_params).unwrap();
    let server_cert_pem = server.serialize_pem_with_signer(&ca).unwrap();

    let ca_pem = dir.path().join("ca.pem");
    std::fs::write(&ca_pem, ca.serialize_pem().unwrap()).unwrap();

    let server_pem = dir.path().join("server.pem");
    std::fs::write(
        &server_pem,
        format!("{}{}", server_cert_pem, server.serialize_private_key_pem()),
    )
    .unwrap();

    TestCerts {
        dir,
        ca_pem,
        server_pem,
    }
}

/// Extracts the port from a canonical `scheme://host:port` address string.
pub fn port_of(addr: &str) -> u16 {
    addr.rsplit(':').next().unwrap().parse().unwrap()
}
