/// Fixed-size byte slab pool shared by every tunnel and link on a process.
use bytes::BytesMut;
use parking_lot::Mutex;

pub const SLAB_SIZE: usize = 8192;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a slab of exactly `SLAB_SIZE` capacity, reused from the pool
    /// when one is available.
    pub fn get(&self) -> BytesMut {
        match self.free.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => BytesMut::with_capacity(SLAB_SIZE),
        }
    }

    /// Return a slab for reuse. Slabs whose capacity doesn't match
    /// `SLAB_SIZE` are dropped rather than pooled, since a sub-sliced
    /// buffer would silently shrink the pool's effective slab size.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() != SLAB_SIZE {
            return;
        }
        buf.clear();
        self.free.lock().push(buf);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_slab() {
        let pool = BufferPool::new();
        let buf = pool.get();
        assert_eq!(buf.capacity(), SLAB_SIZE);
        pool.put(buf);
        assert_eq!(pool.free.lock().len(), 1);
        let buf2 = pool.get();
        assert_eq!(buf2.len(), 0);
        assert_eq!(pool.free.lock().len(), 0);
    }

    #[test]
    fn drops_mis_sized_slab() {
        let pool = BufferPool::new();
        let undersized = BytesMut::with_capacity(16);
        pool.put(undersized);
        assert_eq!(pool.free.lock().len(), 0);
    }
}
