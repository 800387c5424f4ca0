/// Server-side hub: dials the requested backend on `LinkCreate` and
/// echoes heartbeats back to the client.
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::authenticator::UserIdentity;
use crate::buffer_pool::BufferPool;
use crate::config::BackendServer;
use crate::error::Error;
use crate::filters::{build_filter, Protocol};
use crate::hub::Hub;
use crate::packet::{Cmd, Command};
use crate::tunnel::Tunnel;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ServerHub {
    pub hub: Arc<Hub>,
    backend: BackendServer,
}

impl ServerHub {
    pub fn new(
        tunnel: Arc<Tunnel>,
        pool: Arc<BufferPool>,
        backend: BackendServer,
        user: UserIdentity,
    ) -> Arc<ServerHub> {
        let hub = Arc::new(Hub::new(tunnel, pool));

        let protocol = Protocol::from_name(&backend.protocol);
        *hub.data_filter.write() = Some(build_filter(
            protocol,
            backend.name.clone(),
            user.clone(),
            backend.log_response,
        ));

        let server_hub = Arc::new(ServerHub {
            hub: hub.clone(),
            backend,
        });

        let weak = Arc::downgrade(&server_hub);
        *hub.control_filter.write() = Some(Arc::new(move |cmd: Command| match weak.upgrade() {
            Some(sh) => sh.on_ctrl(cmd, user.clone()),
            None => false,
        }));

        server_hub
    }

    fn on_ctrl(self: &Arc<Self>, cmd: Command, user: UserIdentity) -> bool {
        match cmd.cmd {
            Cmd::LinkCreate => {
                self.spawn_dial(cmd.id, user);
                true
            }
            Cmd::TunHeartbeat => {
                let hub = self.hub.clone();
                let id = cmd.id;
                tokio::spawn(async move {
                    hub.send_command(id, Cmd::TunHeartbeat).await;
                });
                true
            }
            _ => false,
        }
    }

    fn spawn_dial(self: &Arc<Self>, id: u16, user: UserIdentity) {
        let link = match self.hub.create_link(id) {
            Some(link) => link,
            None => return,
        };

        let hub = self.hub.clone();
        let addr = self.backend.addr.clone();
        tokio::spawn(async move {
            let dial = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await;
            match dial {
                Ok(Ok(socket)) => {
                    let tag = user.to_log_entry();
                    hub.start_link(link, socket, tag).await;
                    hub.delete_link(id);
                }
                _ => {
                    log::warn!("link({}) dial to {}: {}", id, addr, Error::DialFailed);
                    hub.send_command(id, Cmd::LinkClose).await;
                    hub.delete_link(id);
                }
            }
        });
    }
}
