/// A logical connection multiplexed over a tunnel. Owns a bound local TCP
/// socket (once started) and a bounded write buffer; read and write sides
/// close independently to support half-close.
use bytes::BytesMut;
use parking_lot::Mutex as SyncMutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex as AsyncMutex;

use crate::buffer_pool::BufferPool;
use crate::error::Error;

const WRITE_BUFFER_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// The peer has signaled it will send no more data on this link.
    PeerClosed,
    /// The local socket errored.
    Io,
}

pub struct Link {
    pub id: u16,
    write_tx: SyncMutex<Option<Sender<BytesMut>>>,
    write_rx: AsyncMutex<Option<Receiver<BytesMut>>>,
    read_err: SyncMutex<Option<LinkError>>,
    conn: AsyncMutex<Option<(OwnedReadHalf, OwnedWriteHalf)>>,
}

impl Link {
    pub fn new(id: u16) -> Link {
        let (tx, rx) = mpsc::channel(WRITE_BUFFER_DEPTH);
        Link {
            id,
            write_tx: SyncMutex::new(Some(tx)),
            write_rx: AsyncMutex::new(Some(rx)),
            read_err: SyncMutex::new(None),
            conn: AsyncMutex::new(None),
        }
    }

    /// Binds the link to its local socket. Panics (like the original
    /// `setConn`) if called more than once, since that indicates a
    /// programming error in the accept path.
    pub async fn set_conn(&self, rd: OwnedReadHalf, wr: OwnedWriteHalf) {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            panic!("link {} already bound to a connection", self.id);
        }
        *slot = Some((rd, wr));
    }

    pub async fn take_conn(&self) -> Option<(OwnedReadHalf, OwnedWriteHalf)> {
        self.conn.lock().await.take()
    }

    /// Enqueues data for the local socket. Non-blocking: if the buffer is
    /// full, the packet is dropped rather than backing up the tunnel's
    /// single demultiplex loop behind one slow link.
    pub async fn write(&self, data: BytesMut) -> bool {
        let tx = self.write_tx.lock().clone();
        match tx {
            Some(tx) => tx.try_send(data).is_ok(),
            None => false,
        }
    }

    pub async fn take_receiver(&self) -> Option<Receiver<BytesMut>> {
        self.write_rx.lock().await.take()
    }

    fn set_read_error(&self, err: LinkError) -> bool {
        let mut slot = self.read_err.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(err);
        true
    }

    pub fn read_error(&self) -> Option<LinkError> {
        *self.read_err.lock()
    }

    /// Stops further reads from being considered fresh; a peer-initiated
    /// half-close on the receive side.
    pub fn close_read(&self) -> bool {
        self.set_read_error(LinkError::PeerClosed)
    }

    pub fn mark_io_error(&self) -> bool {
        self.set_read_error(LinkError::Io)
    }

    /// Closes the write side: no further data is accepted, but whatever
    /// is already queued still drains to the socket.
    pub fn close_write(&self) {
        *self.write_tx.lock() = None;
    }

    pub fn close(&self) {
        self.close_read();
        self.close_write();
    }
}

pub struct LinkReader<'a> {
    pub pool: &'a BufferPool,
}

impl<'a> LinkReader<'a> {
    /// Reads at most one slab from `rd`. Returns `Err(PeerClosed)` if the
    /// link's read side was already closed by the peer.
    pub async fn read_once(
        &self,
        link: &Link,
        rd: &mut OwnedReadHalf,
    ) -> Result<BytesMut, LinkError> {
        use tokio::io::AsyncReadExt;

        if let Some(err) = link.read_error() {
            return Err(err);
        }

        let mut buf = self.pool.get();
        buf.resize(crate::buffer_pool::SLAB_SIZE, 0);
        let n = match rd.read(&mut buf[..]).await {
            Ok(0) => {
                self.pool.put(buf);
                link.mark_io_error();
                return Err(LinkError::Io);
            }
            Ok(n) => n,
            Err(_) => {
                self.pool.put(buf);
                link.mark_io_error();
                return Err(LinkError::Io);
            }
        };
        buf.truncate(n);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_buffer_rejects_after_close() {
        let link = Link::new(7);
        assert!(link.write(BytesMut::from(&b"a"[..])).await);
        link.close_write();
        assert!(!link.write(BytesMut::from(&b"b"[..])).await);

        let mut rx = link.take_receiver().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"a");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn read_error_is_sticky() {
        let link = Link::new(1);
        assert!(link.close_read());
        assert_eq!(link.read_error(), Some(LinkError::PeerClosed));
        // A later io error must not overwrite the first sticky error.
        assert!(!link.mark_io_error());
        assert_eq!(link.read_error(), Some(LinkError::PeerClosed));
    }
}
