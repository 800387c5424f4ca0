/// Client side: one backend mapping's local listener, tunnel pool, and
/// link-id allocator. Each mapping authenticates its own tunnels against
/// a single named backend, so the pool is scoped per mapping rather than
/// shared across the whole client process.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::buffer_pool::BufferPool;
use crate::client_hub::ClientHub;
use crate::config::{BackendPortMapping, ClientConfig};
use crate::crypto::{self, EncryptAlgorithm};
use crate::error::Error;
use crate::id_allocator::IdAllocator;
use crate::packet::Cmd;
use crate::pool::Pool;
use crate::tunnel::Tunnel;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(15);
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Grace period after the pool is first kicked off, so at least one
/// tunnel has a chance to connect before the first `fetch`.
const POOL_WARMUP_DELAY: Duration = Duration::from_secs(3);

pub struct BackendClient {
    server_addr: String,
    secret: String,
    username: String,
    password: String,
    mapping: BackendPortMapping,
    tunnels: u32,
    heartbeat: Duration,
    timeout: Duration,
    pool: Pool,
    ids: IdAllocator,
    buffers: Arc<BufferPool>,
    kicked_off: AtomicBool,
    /// Notified once, from any tunnel slot, on a fatal handshake/auth
    /// failure — credentials or secret are wrong and retrying is futile.
    /// `run_all` selects on this to trigger process-level shutdown.
    shutdown: Arc<Notify>,
}

impl BackendClient {
    pub fn new(
        config: &ClientConfig,
        mapping: BackendPortMapping,
        shutdown: Arc<Notify>,
    ) -> Arc<BackendClient> {
        Arc::new(BackendClient {
            server_addr: config.server_addr.clone(),
            secret: config.secret.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            mapping,
            tunnels: config.tunnels,
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            timeout: Duration::from_secs(config.timeout_secs),
            pool: Pool::new(),
            ids: IdAllocator::new(),
            buffers: Arc::new(BufferPool::new()),
            kicked_off: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Binds the local listener and accepts connections until a fatal
    /// error occurs. Tunnel slots are started lazily, on first accept.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.mapping.listen).await?;
        log::info!(
            "listening on {} for backend {}",
            self.mapping.listen,
            self.mapping.backend
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let first_accept = self.kick_off_pool();
                    log::info!("new connection from {}", peer);
                    let client = self.clone();
                    tokio::spawn(async move {
                        if first_accept {
                            sleep(POOL_WARMUP_DELAY).await;
                        }
                        client.handle_connection(socket).await;
                    });
                }
                Err(err) if is_transient(&err) => {
                    log::warn!("accept error, retrying: {}", err);
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(err) => {
                    log::error!("listener for {} terminating: {}", self.mapping.listen, err);
                    return Err(err.into());
                }
            }
        }
    }

    /// Returns true the first time it's called for this listener, i.e.
    /// when it actually spawned the tunnel slots.
    fn kick_off_pool(self: &Arc<Self>) -> bool {
        if self.kicked_off.swap(true, Ordering::SeqCst) {
            return false;
        }
        for index in 0..self.tunnels {
            let client = self.clone();
            tokio::spawn(async move { client.run_tunnel_slot(index).await });
        }
        true
    }

    /// One tunnel slot's lifetime: dial + handshake, register with the
    /// pool, run the hub's demultiplex loop until it fails, unregister,
    /// back off, repeat.
    async fn run_tunnel_slot(self: Arc<Self>, index: u32) {
        loop {
            match self.connect_and_auth().await {
                Ok(client_hub) => {
                    client_hub.spawn_heartbeat(self.heartbeat, self.timeout);
                    let item = self.pool.add(client_hub.clone());
                    log::debug!("tunnel {} connect succeeded", index);
                    client_hub.hub.start().await;
                    self.pool.remove(&item);
                    log::warn!("tunnel {} disconnected", index);
                }
                Err(err @ (Error::BadHandshake | Error::AuthFailed(_))) => {
                    log::error!("tunnel {} fatal auth failure, retrying is futile: {}", index, err);
                    self.shutdown.notify_waiters();
                    return;
                }
                Err(err) => {
                    log::error!("tunnel {} reconnect failed: {}", index, err);
                }
            }
            sleep(RECONNECT_BACKOFF).await;
        }
    }

    /// Client-driven side of the handshake (C5): the server issues the
    /// challenge; the client answers with its complement, keys the
    /// cipher, then sends the auth packet naming this mapping's backend.
    async fn connect_and_auth(&self) -> Result<Arc<ClientHub>, Error> {
        let socket = TcpStream::connect(&self.server_addr).await?;
        if let Err(err) = socket.set_nodelay(true) {
            log::debug!("set_nodelay failed: {}", err);
        }
        let tunnel = Arc::new(Tunnel::new(socket, self.buffers.clone())?);
        let algo = EncryptAlgorithm::new(&self.secret);

        let (link_id, challenge) = tunnel.read_packet().await?;
        if link_id != 0 {
            self.buffers.put(challenge);
            return Err(Error::BadHandshake);
        }
        let token = algo.open(&challenge);
        self.buffers.put(challenge);
        let token = token.ok_or(Error::BadHandshake)?;

        let mut response = self.buffers.get();
        response.extend_from_slice(&algo.seal(token.complement()));
        tunnel.write_packet(0, response).await?;

        tunnel.set_cipher_key(&token.rc4_key());

        let mut auth = self.buffers.get();
        auth.extend_from_slice(&crypto::build_auth_packet(
            &self.username,
            &self.password,
            &self.mapping.backend,
        ));
        tunnel.write_packet(0, auth).await?;

        let (link_id, reply) = tunnel.read_packet().await?;
        let ok = link_id == 0 && &reply[..] == b"ok";
        let message = String::from_utf8_lossy(&reply).into_owned();
        self.buffers.put(reply);
        if !ok {
            return Err(Error::AuthFailed(message));
        }

        Ok(ClientHub::new(tunnel, self.buffers.clone()))
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream) {
        let item = match self.pool.fetch() {
            Some(item) => item,
            None => {
                log::error!("no active tunnel for backend {}", self.mapping.backend);
                return;
            }
        };

        let id = self.ids.acquire().await;
        let hub = item.client_hub.hub.clone();

        let link = match hub.create_link(id) {
            Some(link) => link,
            None => {
                self.ids.release(id);
                self.pool.drop_load(&item);
                return;
            }
        };

        hub.send_command(id, Cmd::LinkCreate).await;
        hub.start_link(link, socket, self.username.clone()).await;

        hub.delete_link(id);
        self.ids.release(id);
        self.pool.drop_load(&item);
    }
}

/// Spawns a `BackendClient` for every configured mapping and runs them
/// concurrently until one of them hits a fatal listener error, or any
/// tunnel slot across any mapping hits a fatal auth failure.
pub async fn run_all(config: Arc<ClientConfig>) -> Result<(), Error> {
    let shutdown = Arc::new(Notify::new());
    let mut handlers = Vec::new();
    for mapping in config.backends.clone() {
        let client = BackendClient::new(&config, mapping, shutdown.clone());
        handlers.push(tokio::spawn(async move { client.run().await }));
    }

    tokio::select! {
        _ = shutdown.notified() => {
            Err(Error::AuthFailed("credentials rejected, shutting down".to_string()))
        }
        result = join_all(handlers) => result,
    }
}

async fn join_all(handlers: Vec<tokio::task::JoinHandle<Result<(), Error>>>) -> Result<(), Error> {
    for handler in handlers {
        match handler.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::SocketError),
        }
    }
    Ok(())
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::ConnectionAborted
    )
}
