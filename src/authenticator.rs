/// The `Authenticator` trait is the one seam the core tunnel server
/// depends on for verifying credentials; `NoneAuthenticator` and
/// `LocalAuthenticator` are the two concrete, testable implementations
/// shipped here. A production deployment might plug in LDAP instead,
/// which is out of scope for this crate.
use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{LocalUser, ServerConfig};
use crate::error::Error;

static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.@-]{1,128}$").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub account: String,
    pub display_name: String,
    pub kind: &'static str,
}

impl UserIdentity {
    pub fn to_log_entry(&self) -> String {
        format!("{}({})", self.account, self.kind)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<UserIdentity, Error>;
    async fn get_user(&self, username: &str) -> Result<UserIdentity, Error>;
    async fn users(&self) -> Result<Vec<UserIdentity>, Error>;
}

/// Accepts any username/password; used for `auth_type = "none"`.
pub struct NoneAuthenticator;

#[async_trait]
impl Authenticator for NoneAuthenticator {
    async fn login(&self, username: &str, _password: &str) -> Result<UserIdentity, Error> {
        Ok(UserIdentity {
            account: username.to_string(),
            display_name: username.to_string(),
            kind: "none",
        })
    }

    async fn get_user(&self, username: &str) -> Result<UserIdentity, Error> {
        self.login(username, "").await
    }

    async fn users(&self) -> Result<Vec<UserIdentity>, Error> {
        Ok(Vec::new())
    }
}

/// In-memory table of local users, keyed by account name. Passwords are
/// stored either plaintext or base64-encoded, per `LocalUser::algo`.
pub struct LocalAuthenticator {
    users: HashMap<String, LocalUser>,
}

impl LocalAuthenticator {
    pub fn from_config(config: &ServerConfig) -> LocalAuthenticator {
        let mut users = HashMap::new();
        for user in &config.users.local {
            users.insert(user.account.clone(), user.clone());
        }
        LocalAuthenticator { users }
    }

    fn check_password(stored: &LocalUser, password: &str) -> bool {
        match stored.algo.as_str() {
            "base64" => match base64::decode(&stored.password) {
                Ok(decoded) => decoded == password.as_bytes(),
                Err(_) => false,
            },
            _ => constant_time_eq(stored.password.as_bytes(), password.as_bytes()),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[async_trait]
impl Authenticator for LocalAuthenticator {
    async fn login(&self, username: &str, password: &str) -> Result<UserIdentity, Error> {
        let normalized = stringprep::saslprep(username)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| username.to_string());

        let stored = self.users.get(normalized.as_str()).ok_or(Error::NoSuchUser)?;
        if !Self::check_password(stored, password) {
            return Err(Error::InvalidPassword);
        }
        Ok(UserIdentity {
            account: stored.account.clone(),
            display_name: stored.account.clone(),
            kind: "local",
        })
    }

    async fn get_user(&self, username: &str) -> Result<UserIdentity, Error> {
        let stored = self.users.get(username).ok_or(Error::NoSuchUser)?;
        Ok(UserIdentity {
            account: stored.account.clone(),
            display_name: stored.account.clone(),
            kind: "local",
        })
    }

    async fn users(&self) -> Result<Vec<UserIdentity>, Error> {
        Ok(self
            .users
            .values()
            .map(|u| UserIdentity {
                account: u.account.clone(),
                display_name: u.account.clone(),
                kind: "local",
            })
            .collect())
    }
}

/// Rejects usernames that don't fit the conservative allowed pattern,
/// before they ever reach an `Authenticator` implementation.
pub fn valid_username(username: &str) -> bool {
    USERNAME_PATTERN.is_match(username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalUser, Users};

    fn config_with(users: Vec<LocalUser>) -> ServerConfig {
        ServerConfig {
            listen: "127.0.0.1:9000".into(),
            secret: "s".into(),
            backends: vec![],
            auth_type: "local".into(),
            users: Users { local: users },
            verbose: false,
        }
    }

    #[tokio::test]
    async fn none_authenticator_always_succeeds() {
        let auth = NoneAuthenticator;
        let user = auth.login("anybody", "whatever").await.unwrap();
        assert_eq!(user.account, "anybody");
    }

    #[tokio::test]
    async fn local_authenticator_accepts_plain_password() {
        let config = config_with(vec![LocalUser {
            account: "alice".into(),
            password: "hunter2".into(),
            algo: "plain".into(),
        }]);
        let auth = LocalAuthenticator::from_config(&config);
        assert!(auth.login("alice", "hunter2").await.is_ok());
        assert!(matches!(
            auth.login("alice", "wrong").await,
            Err(Error::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn local_authenticator_accepts_base64_password() {
        let encoded = base64::encode("hunter2");
        let config = config_with(vec![LocalUser {
            account: "bob".into(),
            password: encoded,
            algo: "base64".into(),
        }]);
        let auth = LocalAuthenticator::from_config(&config);
        assert!(auth.login("bob", "hunter2").await.is_ok());
        assert!(matches!(
            auth.login("bob", "hunter3").await,
            Err(Error::InvalidPassword)
        ));
    }

    #[tokio::test]
    async fn local_authenticator_rejects_unknown_user() {
        let config = config_with(vec![]);
        let auth = LocalAuthenticator::from_config(&config);
        assert!(matches!(
            auth.login("ghost", "x").await,
            Err(Error::NoSuchUser)
        ));
    }

    #[test]
    fn username_pattern_rejects_control_characters() {
        assert!(valid_username("alice.smith-01@corp"));
        assert!(!valid_username("alice\nsmith"));
        assert!(!valid_username(""));
    }
}
