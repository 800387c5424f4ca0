/// A single ciphered connection between client and server, framed into
/// packets. Concurrent writers are serialized; once any write fails the
/// tunnel is poisoned and all further writes fail fast.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::TcpStream;

use crate::buffer_pool::BufferPool;
use crate::cipher_conn::CipherConn;
use crate::error::Error;
use crate::packet::{self, Cmd, Command, HEADER_SIZE, MAX_PACKET_SIZE};

pub struct Tunnel {
    conn: CipherConn,
    pool: Arc<BufferPool>,
    poisoned: AtomicBool,
}

impl Tunnel {
    pub fn new(stream: TcpStream, pool: Arc<BufferPool>) -> Result<Tunnel, Error> {
        let conn = CipherConn::new(stream)?;
        Ok(Tunnel {
            conn,
            pool,
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn set_cipher_key(&self, key: &[u8; 128]) {
        self.conn.set_cipher_key(key);
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.conn.local_addr
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.conn.peer_addr
    }

    pub fn read_bytes(&self) -> u64 {
        self.conn.read_bytes()
    }

    pub fn write_bytes(&self) -> u64 {
        self.conn.write_bytes()
    }

    fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Locally-initiated close (e.g. a heartbeat timeout): poisons the
    /// tunnel and unblocks its reader fibre so the hub's dispatch loop
    /// observes the closure promptly rather than waiting for a socket
    /// error that may never come.
    pub async fn close(&self) {
        self.poison();
        self.conn.close().await;
    }

    /// Writes a packet's body, releasing the slab back to the pool
    /// regardless of outcome. Safe to call concurrently from many fibres.
    pub async fn write_packet(&self, link_id: u16, body: BytesMut) -> Result<(), Error> {
        if self.is_closed() {
            self.pool.put(body);
            return Err(Error::TunnelClosed);
        }

        let header = packet::encode_header(link_id, body.len() as u16);
        let result = self.write_raw(&header, &body).await;
        self.pool.put(body);

        if result.is_err() {
            self.poison();
        }
        result
    }

    async fn write_raw(&self, header: &[u8], body: &[u8]) -> Result<(), Error> {
        let mut framed = Vec::with_capacity(header.len() + body.len());
        framed.extend_from_slice(header);
        framed.extend_from_slice(body);
        self.conn.write_all(&framed).await
    }

    pub async fn send_command(&self, id: u16, cmd: Cmd) -> Result<(), Error> {
        let command = Command::new(cmd, id);
        let mut body = self.pool.get();
        body.extend_from_slice(&command.encode());
        self.write_packet(0, body).await
    }

    /// Must be called from a single reader fibre per tunnel.
    pub async fn read_packet(&self) -> Result<(u16, BytesMut), Error> {
        let mut header = [0u8; HEADER_SIZE];
        self.conn.read_exact(&mut header).await.map_err(|e| {
            self.poison();
            e
        })?;
        let (link_id, len) = packet::decode_header(&header);
        if len as usize > MAX_PACKET_SIZE {
            self.poison();
            return Err(Error::PacketTooLarge);
        }

        let mut body = self.pool.get();
        body.resize(len as usize, 0);
        if let Err(e) = self.conn.read_exact(&mut body[..]).await {
            self.poison();
            self.pool.put(body);
            return Err(e);
        }
        Ok((link_id, body))
    }
}

impl std::fmt::Display for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.conn)
    }
}
