/// Snapshot types for the server's in-process connection status.
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::authenticator::UserIdentity;

#[derive(Serialize)]
pub struct ConnStatus {
    pub id: String,
    pub local_addr: String,
    pub remote_addr: String,
    pub user: Option<String>,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl ConnStatus {
    pub fn new(
        id: String,
        local_addr: String,
        remote_addr: String,
        user: Option<&UserIdentity>,
        read_bytes: u64,
        write_bytes: u64,
        created_at: DateTime<Utc>,
    ) -> ConnStatus {
        ConnStatus {
            id,
            local_addr,
            remote_addr,
            user: user.map(|u| u.to_log_entry()),
            read_bytes,
            write_bytes,
            created_at,
        }
    }
}
