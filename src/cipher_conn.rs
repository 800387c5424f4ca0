/// A buffered TCP connection that applies the tunnel's stream cipher in
/// place once keyed. Before `set_cipher_key` is called (during the
/// handshake itself) reads and writes pass through unmodified.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::crypto::TunnelCipher;
use crate::error::Error;

const BUF_CAPACITY: usize = 2 * crate::buffer_pool::SLAB_SIZE;

pub struct CipherConn {
    // Owned by the tunnel's single reader fibre; no lock needed for
    // exclusivity, but wrapped in an async mutex so the type stays
    // uniform with `writer` and safe if ever called from more than one
    // place (e.g. during the handshake, before a reader fibre exists).
    reader: AsyncMutex<BufReader<OwnedReadHalf>>,
    writer: AsyncMutex<BufWriter<OwnedWriteHalf>>,
    cipher: SyncMutex<Option<TunnelCipher>>,
    closed: Notify,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl CipherConn {
    pub fn new(stream: TcpStream) -> std::io::Result<CipherConn> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (rd, wr) = stream.into_split();
        Ok(CipherConn {
            reader: AsyncMutex::new(BufReader::with_capacity(BUF_CAPACITY, rd)),
            writer: AsyncMutex::new(BufWriter::with_capacity(BUF_CAPACITY, wr)),
            cipher: SyncMutex::new(None),
            closed: Notify::new(),
            read_bytes: AtomicU64::new(0),
            write_bytes: AtomicU64::new(0),
            local_addr,
            peer_addr,
        })
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_bytes.load(Ordering::Relaxed)
    }

    pub fn set_cipher_key(&self, key: &[u8; 128]) {
        *self.cipher.lock() = Some(TunnelCipher::new(key));
    }

    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = reader.read_exact(buf) => {
                result.map_err(|_| Error::SocketError)?;
            }
            _ = self.closed.notified() => {
                return Err(Error::TunnelClosed);
            }
        }
        self.read_bytes.fetch_add(buf.len() as u64, Ordering::Relaxed);
        if let Some(cipher) = self.cipher.lock().as_mut() {
            cipher.decrypt(buf);
        }
        Ok(())
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), Error> {
        // Encrypt and write under the same held writer lock: RC4 is a
        // stream cipher, so encrypt-order must match wire-order exactly,
        // or both sides' keystreams desync for the rest of the tunnel.
        let mut out = buf.to_vec();
        let mut writer = self.writer.lock().await;
        if let Some(cipher) = self.cipher.lock().as_mut() {
            cipher.encrypt(&mut out);
        }
        writer.write_all(&out).await.map_err(|_| Error::SocketError)?;
        writer.flush().await.map_err(|_| Error::SocketError)?;
        self.write_bytes.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Unblocks any in-flight `read_exact` and shuts down the write half
    /// so the peer observes EOF. Used for locally-initiated closes (e.g.
    /// a heartbeat timeout) where no socket error has occurred yet.
    pub async fn close(&self) {
        self.closed.notify_waiters();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }
}

impl std::fmt::Display for CipherConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local_addr, self.peer_addr)
    }
}
