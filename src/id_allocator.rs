/// Bounded pool of 16-bit link IDs, handed out to a single client-side
/// tunnel pool. ID 0 is reserved for control packets and never allocated.
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;

const MIN_ID: u16 = 1;
const MAX_ID: u16 = 65534;

pub struct IdAllocator {
    tx: Sender<u16>,
    rx: Mutex<Receiver<u16>>,
}

impl IdAllocator {
    pub fn new() -> IdAllocator {
        let capacity = (MAX_ID - MIN_ID + 1) as usize;
        let (tx, rx) = mpsc::channel(capacity);
        for id in MIN_ID..=MAX_ID {
            // Capacity matches the id range exactly, so this never blocks.
            tx.try_send(id).expect("id allocator channel undersized");
        }
        IdAllocator {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Blocks until an ID is available.
    pub async fn acquire(&self) -> u16 {
        // Only one waiter should be in here at a time per allocator (one
        // client owns each allocator), but guard against misuse anyway.
        let mut rx = self.rx.lock().await;
        rx.recv().await.expect("id allocator sender dropped")
    }

    pub fn release(&self, id: u16) {
        let _ = self.tx.try_send(id);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn ids_are_unique_until_released() {
        let alloc = IdAllocator::new();
        let mut seen = HashSet::new();
        let mut held = Vec::new();
        for _ in 0..100 {
            let id = alloc.acquire().await;
            assert!(seen.insert(id), "id {} handed out twice", id);
            held.push(id);
        }
        for id in held {
            alloc.release(id);
        }
        let id = alloc.acquire().await;
        assert!(seen.contains(&id));
    }

    #[test]
    fn range_excludes_zero() {
        assert_eq!(MIN_ID, 1);
        assert!(MAX_ID < u16::MAX);
    }
}
