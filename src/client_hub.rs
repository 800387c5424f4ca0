/// Client-side hub: adds a periodic heartbeat and liveness detection on
/// top of the generic `Hub`.
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::interval;

use crate::buffer_pool::BufferPool;
use crate::hub::Hub;
use crate::packet::{Cmd, Command};
use crate::tunnel::Tunnel;

const MIN_SPAN: i64 = 3;

pub struct ClientHub {
    pub hub: Arc<Hub>,
    sent: AtomicU16,
    received: AtomicU16,
}

impl ClientHub {
    pub fn new(tunnel: Arc<Tunnel>, pool: Arc<BufferPool>) -> Arc<ClientHub> {
        let hub = Arc::new(Hub::new(tunnel, pool));
        let client_hub = Arc::new(ClientHub {
            hub: hub.clone(),
            sent: AtomicU16::new(0),
            received: AtomicU16::new(0),
        });

        // Weak to avoid a Hub <-> ClientHub reference cycle: the closure
        // outlives individual heartbeat ticks but must not keep the hub
        // alive by itself.
        let weak = Arc::downgrade(&client_hub);
        *hub.control_filter.write() = Some(Arc::new(move |cmd: Command| {
            weak.upgrade().map(|ch| ch.on_ctrl(cmd)).unwrap_or(false)
        }));

        client_hub
    }

    fn on_ctrl(&self, cmd: Command) -> bool {
        if cmd.cmd == Cmd::TunHeartbeat {
            self.received.store(cmd.id, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Spawns the heartbeat ticker. Closes the tunnel and stops once
    /// `max(timeout/heartbeat, 3)` consecutive beats go unacknowledged.
    pub fn spawn_heartbeat(self: &Arc<Self>, heartbeat: Duration, timeout: Duration) {
        let client_hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(heartbeat);
            let ratio = if heartbeat.as_secs() > 0 {
                (timeout.as_secs() / heartbeat.as_secs()) as i64
            } else {
                MIN_SPAN
            };
            let max_span = ratio.max(MIN_SPAN);

            loop {
                ticker.tick().await;

                let received = client_hub.received.load(Ordering::SeqCst);
                let sent = client_hub.sent.load(Ordering::SeqCst);
                // Wraps in u16 space (sent/received are 16-bit counters
                // that themselves wrap); the result is the outstanding
                // heartbeat lag, widened to i64 only for the comparison.
                let span = (0xffffu16.wrapping_sub(received).wrapping_add(sent).wrapping_add(1)) as i64;
                if span >= max_span {
                    log::error!(
                        "tunnel {} heartbeat timeout: span={} max_span={} sent={} received={}",
                        client_hub.hub.tunnel,
                        span,
                        max_span,
                        sent,
                        received
                    );
                    client_hub.hub.tunnel.close().await;
                    break;
                }

                let next = client_hub.sent.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                if !client_hub.hub.send_command(next, Cmd::TunHeartbeat).await {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    fn span(received: u16, sent: u16) -> i64 {
        (0xffffu16.wrapping_sub(received).wrapping_add(sent).wrapping_add(1)) as i64
    }

    #[test]
    fn span_is_zero_when_fully_acked() {
        assert_eq!(span(40, 40), 0);
    }

    #[test]
    fn span_is_small_lag_when_a_few_beats_outstanding() {
        assert_eq!(span(10, 12), 2);
    }

    #[test]
    fn span_wraps_across_counter_overflow() {
        // received is just behind sent across a u16 wraparound boundary.
        assert_eq!(span(65535, 1), 2);
    }
}
