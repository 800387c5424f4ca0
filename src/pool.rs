/// Client-side tunnel pool: a min-heap of live tunnels keyed by how many
/// local connections each is currently servicing, with explicit index
/// tracking so an arbitrary item can be removed or re-sifted without a
/// linear scan. `std::collections::BinaryHeap` doesn't expose this
/// (no `Fix`/decrease-key at an arbitrary index), so it's hand-rolled.
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client_hub::ClientHub;

pub struct HubItem {
    pub client_hub: Arc<ClientHub>,
    priority: AtomicI64,
    index: AtomicUsize,
}

impl HubItem {
    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }
}

pub struct Pool {
    heap: Mutex<Vec<Arc<HubItem>>>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool {
            heap: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&self, client_hub: Arc<ClientHub>) -> Arc<HubItem> {
        let item = Arc::new(HubItem {
            client_hub,
            priority: AtomicI64::new(0),
            index: AtomicUsize::new(0),
        });

        let mut heap = self.heap.lock();
        let idx = heap.len();
        item.index.store(idx, Ordering::Relaxed);
        heap.push(item.clone());
        sift_up(&mut heap, idx);
        item
    }

    pub fn remove(&self, item: &Arc<HubItem>) {
        let mut heap = self.heap.lock();
        let idx = item.index.load(Ordering::Relaxed);
        if idx >= heap.len() || !Arc::ptr_eq(&heap[idx], item) {
            return;
        }
        let last = heap.len() - 1;
        heap.swap(idx, last);
        heap.pop();
        if idx < heap.len() {
            heap[idx].index.store(idx, Ordering::Relaxed);
            fix(&mut heap, idx);
        }
    }

    /// Returns the least-loaded tunnel and bumps its load by one.
    pub fn fetch(&self) -> Option<Arc<HubItem>> {
        let mut heap = self.heap.lock();
        if heap.is_empty() {
            return None;
        }
        let item = heap[0].clone();
        item.priority.fetch_add(1, Ordering::Relaxed);
        fix(&mut heap, 0);
        Some(item)
    }

    /// Call when a local connection served by `item` ends.
    pub fn drop_load(&self, item: &Arc<HubItem>) {
        let mut heap = self.heap.lock();
        item.priority.fetch_sub(1, Ordering::Relaxed);
        let idx = item.index.load(Ordering::Relaxed);
        if idx < heap.len() && Arc::ptr_eq(&heap[idx], item) {
            fix(&mut heap, idx);
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Pool::new()
    }
}

fn parent(i: usize) -> Option<usize> {
    if i == 0 {
        None
    } else {
        Some((i - 1) / 2)
    }
}

fn sift_up(heap: &mut [Arc<HubItem>], mut i: usize) {
    while let Some(p) = parent(i) {
        if heap[p].priority() <= heap[i].priority() {
            break;
        }
        heap.swap(p, i);
        heap[p].index.store(p, Ordering::Relaxed);
        heap[i].index.store(i, Ordering::Relaxed);
        i = p;
    }
}

/// Re-sifts the item at `i` in whichever direction heap order requires,
/// mirroring Go's `container/heap.Fix`.
fn fix(heap: &mut [Arc<HubItem>], i: usize) {
    if !sift_down(heap, i) {
        sift_up(heap, i);
    }
}

/// Returns true if any swap happened.
fn sift_down(heap: &mut [Arc<HubItem>], mut i: usize) -> bool {
    let len = heap.len();
    let start = i;
    loop {
        let left = 2 * i + 1;
        if left >= len {
            break;
        }
        let mut smallest = left;
        let right = left + 1;
        if right < len && heap[right].priority() < heap[left].priority() {
            smallest = right;
        }
        if heap[smallest].priority() >= heap[i].priority() {
            break;
        }
        heap.swap(i, smallest);
        heap[i].index.store(i, Ordering::Relaxed);
        heap[smallest].index.store(smallest, Ordering::Relaxed);
        i = smallest;
    }
    i != start
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPool;
    use crate::tunnel::Tunnel;
    use std::sync::Arc;

    // A pool test needs a ClientHub, which needs a Tunnel, which needs a
    // real socket pair. Use a loopback pair purely to construct valid
    // handles; no bytes are exchanged in these tests.
    async fn dummy_client_hub() -> Arc<ClientHub> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::net::TcpStream::connect(addr);
        let (a, (b, _)) = tokio::join!(connect, listener.accept());
        let _keep_alive = b.unwrap();
        let stream = a.unwrap();
        let pool = Arc::new(BufferPool::new());
        let tunnel = Arc::new(Tunnel::new(stream, pool.clone()).unwrap());
        ClientHub::new(tunnel, pool)
    }

    #[tokio::test]
    async fn fetch_returns_least_loaded_and_heap_invariant_holds() {
        let pool = Pool::new();
        let a = pool.add(dummy_client_hub().await);
        let b = pool.add(dummy_client_hub().await);
        let c = pool.add(dummy_client_hub().await);

        let first = pool.fetch().unwrap();
        assert_eq!(first.priority(), 1);

        pool.drop_load(&first);
        assert_eq!(first.priority(), 0);

        assert_heap_invariant(&pool);

        pool.remove(&b);
        assert_eq!(pool.len(), 2);
        assert_heap_invariant(&pool);

        pool.remove(&a);
        pool.remove(&c);
        assert!(pool.is_empty());
    }

    fn assert_heap_invariant(pool: &Pool) {
        let heap = pool.heap.lock();
        for (i, item) in heap.iter().enumerate() {
            assert_eq!(item.index.load(Ordering::Relaxed), i);
            if let Some(p) = parent(i) {
                assert!(heap[p].priority() <= item.priority());
            }
        }
    }
}
