/// Accepts tunnel connections, drives the handshake and authentication
/// (C5), then hands each connection off to a `ServerHub` for its
/// lifetime. Tracks live connections for `status()` (C13).
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};

use crate::authenticator::{valid_username, Authenticator, UserIdentity};
use crate::buffer_pool::BufferPool;
use crate::config::{BackendServer, ServerConfig};
use crate::crypto::{self, EncryptAlgorithm, Token};
use crate::error::Error;
use crate::server_hub::ServerHub;
use crate::status::ConnStatus;
use crate::tunnel::Tunnel;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);

struct ConnRecord {
    tunnel: Arc<Tunnel>,
    user: UserIdentity,
    created_at: DateTime<Utc>,
}

pub struct Server {
    listener: TcpListener,
    backends: HashMap<String, BackendServer>,
    secret: String,
    pool: Arc<BufferPool>,
    authenticator: Arc<dyn Authenticator>,
    connections: RwLock<HashMap<u64, ConnRecord>>,
    next_id: AtomicU64,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Server, Error> {
        let listener = TcpListener::bind(&config.listen).await?;
        let backends = config
            .backends
            .iter()
            .cloned()
            .map(|b| (b.name.clone(), b))
            .collect();
        Ok(Server {
            listener,
            backends,
            secret: config.secret.clone(),
            pool: Arc::new(BufferPool::new()),
            authenticator,
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until a non-transient accept error occurs.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => {
                    if let Err(err) = socket.set_nodelay(true) {
                        log::debug!("set_nodelay failed: {}", err);
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(socket).await;
                    });
                }
                Err(err) if is_transient(&err) => {
                    log::warn!("accept error, retrying: {}", err);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(err) => {
                    log::error!("accept loop terminating: {}", err);
                    break;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream) {
        let pool = self.pool.clone();
        let tunnel = match Tunnel::new(socket, pool.clone()) {
            Ok(tunnel) => Arc::new(tunnel),
            Err(err) => {
                log::warn!("failed to wrap accepted socket: {}", err);
                return;
            }
        };

        let (user, backend) = match self.handshake_and_auth(&tunnel).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("tunnel {} rejected: {}", tunnel, err);
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().insert(
            id,
            ConnRecord {
                tunnel: tunnel.clone(),
                user: user.clone(),
                created_at: Utc::now(),
            },
        );
        log::info!(
            "tunnel {} authenticated as {} for backend {}",
            tunnel,
            user.to_log_entry(),
            backend.name
        );

        let server_hub = ServerHub::new(tunnel.clone(), pool, backend, user);
        server_hub.hub.start().await;

        self.connections.write().remove(&id);
        log::info!("tunnel {} closed", tunnel);
    }

    /// Server-driven handshake and auth (C5). The 32-byte challenge/
    /// response blocks and the auth packet all ride as link 0 packets
    /// through the ordinary framed protocol, ahead of `ServerHub`/`Hub`
    /// ever starting their demultiplex loop.
    async fn handshake_and_auth(
        &self,
        tunnel: &Tunnel,
    ) -> Result<(UserIdentity, BackendServer), Error> {
        let algo = EncryptAlgorithm::new(&self.secret);
        let token = Token::random();

        let mut challenge = self.pool.get();
        challenge.extend_from_slice(&algo.seal(token));
        tunnel.write_packet(0, challenge).await?;

        let (link_id, response) = tunnel.read_packet().await?;
        if link_id != 0 {
            self.pool.put(response);
            return Err(Error::BadHandshake);
        }
        let recovered = algo.open(&response);
        self.pool.put(response);
        let recovered = recovered.ok_or(Error::BadHandshake)?;
        let expected = token.complement();
        if recovered.challenge != expected.challenge || recovered.timestamp != expected.timestamp {
            return Err(Error::BadHandshake);
        }

        tunnel.set_cipher_key(&token.rc4_key());

        let (link_id, auth_body) = tunnel.read_packet().await?;
        if link_id != 0 {
            self.pool.put(auth_body);
            return Err(Error::BadAuthPacket);
        }
        let parsed = crypto::parse_auth_packet(&auth_body);
        self.pool.put(auth_body);
        let (username, password, backend_name) = parsed.ok_or(Error::BadAuthPacket)?;

        if !valid_username(&username) {
            self.reply(tunnel, "error: invalid username").await;
            return Err(Error::BadAuthPacket);
        }

        let backend = match self.backends.get(&backend_name) {
            Some(backend) => backend.clone(),
            None => {
                self.reply(tunnel, "error: unknown backend").await;
                return Err(Error::UnknownBackend);
            }
        };

        match self.authenticator.login(&username, &password).await {
            Ok(user) => {
                self.reply(tunnel, "ok").await;
                Ok((user, backend))
            }
            Err(err) => {
                self.reply(
                    tunnel,
                    &format!("error: invalid password for user {}: {}", username, err),
                )
                .await;
                Err(Error::AuthFailed(err.to_string()))
            }
        }
    }

    async fn reply(&self, tunnel: &Tunnel, text: &str) {
        let mut body = self.pool.get();
        body.extend_from_slice(text.as_bytes());
        let _ = tunnel.write_packet(0, body).await;
    }

    /// Snapshot of every live connection (C13).
    pub fn status(&self) -> Vec<ConnStatus> {
        self.connections
            .read()
            .iter()
            .map(|(id, record)| {
                ConnStatus::new(
                    id.to_string(),
                    record.tunnel.local_addr().to_string(),
                    record.tunnel.peer_addr().to_string(),
                    Some(&record.user),
                    record.tunnel.read_bytes(),
                    record.tunnel.write_bytes(),
                    record.created_at,
                )
            })
            .collect()
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionAborted
    )
}
