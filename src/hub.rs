/// Per-tunnel link registry and control-packet dispatcher. `ClientHub`
/// and `ServerHub` extend this with role-specific control filters.
use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::net::TcpStream;

use crate::buffer_pool::BufferPool;
use crate::link::{Link, LinkError, LinkReader};
use crate::packet::{Cmd, Command};
use crate::tunnel::Tunnel;

/// Returning `true` tells the hub's default dispatch to skip this command
/// (the filter has already handled it).
pub type ControlFilter = Arc<dyn Fn(Command) -> bool + Send + Sync>;
/// `is_response` distinguishes server->client bytes from client->server.
pub type DataFilter = Arc<dyn Fn(bool, u16, &[u8]) + Send + Sync>;

pub struct Hub {
    pub tunnel: Arc<Tunnel>,
    pub pool: Arc<BufferPool>,
    links: RwLock<HashMap<u16, Arc<Link>>>,
    pub control_filter: RwLock<Option<ControlFilter>>,
    pub data_filter: RwLock<Option<DataFilter>>,
}

impl Hub {
    pub fn new(tunnel: Arc<Tunnel>, pool: Arc<BufferPool>) -> Hub {
        Hub {
            tunnel,
            pool,
            links: RwLock::new(HashMap::new()),
            control_filter: RwLock::new(None),
            data_filter: RwLock::new(None),
        }
    }

    pub fn create_link(&self, id: u16) -> Option<Arc<Link>> {
        let mut links = self.links.write();
        if links.contains_key(&id) {
            log::error!("link {} already exists", id);
            return None;
        }
        let link = Arc::new(Link::new(id));
        links.insert(id, link.clone());
        Some(link)
    }

    pub fn delete_link(&self, id: u16) {
        self.links.write().remove(&id);
        log::info!("link {} deleted", id);
    }

    pub fn get_link(&self, id: u16) -> Option<Arc<Link>> {
        self.links.read().get(&id).cloned()
    }

    pub async fn send_command(&self, id: u16, cmd: Cmd) -> bool {
        self.tunnel.send_command(id, cmd).await.is_ok()
    }

    pub async fn send(&self, link_id: u16, body: BytesMut) -> bool {
        self.tunnel.write_packet(link_id, body).await.is_ok()
    }

    /// Runs the demultiplex loop until the tunnel's reader fails, then
    /// force-closes every remaining link.
    pub async fn start(self: &Arc<Self>) {
        loop {
            match self.tunnel.read_packet().await {
                Ok((0, body)) => {
                    self.dispatch_control(&body);
                    self.pool.put(body);
                }
                Ok((link_id, body)) => {
                    self.dispatch_data(link_id, body).await;
                }
                Err(err) => {
                    log::warn!("tunnel {} reader stopped: {}", self.tunnel, err);
                    break;
                }
            }
        }
        self.reset_all_links();
    }

    fn dispatch_control(&self, body: &[u8]) {
        let command = match Command::decode(body) {
            Some(cmd) => cmd,
            None => {
                log::warn!("dropping malformed control packet");
                return;
            }
        };

        if let Some(filter) = self.control_filter.read().clone() {
            if filter(command) {
                return;
            }
        }

        match command.cmd {
            Cmd::LinkClose => {
                if let Some(link) = self.get_link(command.id) {
                    link.close();
                }
            }
            Cmd::LinkCloseRecv => {
                if let Some(link) = self.get_link(command.id) {
                    link.close_read();
                }
            }
            Cmd::LinkCloseSend => {
                if let Some(link) = self.get_link(command.id) {
                    link.close_write();
                }
            }
            other => {
                log::warn!("unhandled control command {:?}({})", other, command.id);
            }
        }
    }

    async fn dispatch_data(&self, link_id: u16, body: BytesMut) {
        let link = match self.get_link(link_id) {
            Some(link) => link,
            None => {
                self.pool.put(body);
                return;
            }
        };

        if let Some(filter) = self.data_filter.read().clone() {
            filter(false, link_id, &body);
        }

        // Non-blocking: an overloaded link's write buffer drops the packet
        // rather than stalling the tunnel's single reader fibre.
        if !link.write(body).await {
            log::debug!("link {} write buffer closed, dropping packet", link_id);
        }
    }

    fn reset_all_links(&self) {
        let links = self.links.read();
        for link in links.values() {
            link.close();
        }
    }

    /// Binds `link` to `socket` and runs its reader/writer fibres to
    /// completion. `user_tag` is a display label for logging only.
    pub async fn start_link(self: &Arc<Self>, link: Arc<Link>, socket: TcpStream, user_tag: String) {
        if let Err(err) = socket.set_nodelay(true) {
            log::debug!("set_nodelay failed: {}", err);
        }
        let (rd, wr) = socket.into_split();
        link.set_conn(rd, wr).await;
        log::info!("link({}) started for {}", link.id, user_tag);

        let (rd, wr) = link.take_conn().await.expect("just bound");
        let mut rx = link.take_receiver().await.expect("receiver taken once");

        let reader_hub = self.clone();
        let reader_link = link.clone();
        let reader_pool = self.pool.clone();
        let reader = tokio::spawn(async move {
            let mut rd = rd;
            let reading = LinkReader { pool: &reader_pool };
            loop {
                match reading.read_once(&reader_link, &mut rd).await {
                    Ok(data) => {
                        if let Some(filter) = reader_hub.data_filter.read().clone() {
                            filter(true, reader_link.id, &data);
                        }
                        if !reader_hub.send(reader_link.id, data).await {
                            break;
                        }
                    }
                    Err(LinkError::PeerClosed) => break,
                    Err(LinkError::Io) => {
                        reader_hub.send_command(reader_link.id, Cmd::LinkCloseSend).await;
                        break;
                    }
                }
            }
        });

        let writer_hub = self.clone();
        let writer_link = link.clone();
        let writer_pool = self.pool.clone();
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut wr = wr;
            let mut write_failed = false;
            while let Some(data) = rx.recv().await {
                let result = wr.write_all(&data).await;
                writer_pool.put(data);
                if result.is_err() {
                    write_failed = true;
                    break;
                }
            }
            let _ = wr.shutdown().await;
            if write_failed {
                writer_hub.send_command(writer_link.id, Cmd::LinkCloseRecv).await;
            }
        });

        let _ = tokio::join!(reader, writer);
        log::info!("link({}) closed", link.id);
    }
}
