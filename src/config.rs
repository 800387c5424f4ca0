/// TOML-backed configuration for both tunnel roles.
use serde_derive::Deserialize;
use std::fmt;
use std::path::Path;

use crate::error::Error;

const DEFAULT_HEARTBEAT_SECS: u64 = 1;
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// One local listener forwarded to a named backend on the server.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendPortMapping {
    pub backend: String,
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server_addr: String,
    pub secret: String,
    pub username: String,
    pub password: String,
    pub backends: Vec<BackendPortMapping>,
    #[serde(default)]
    pub tunnels: u32,
    #[serde(default)]
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub verbose: bool,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_addr", &self.server_addr)
            .field("secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("backends", &self.backends)
            .field("tunnels", &self.tunnels)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("timeout_secs", &self.timeout_secs)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl ClientConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ClientConfig, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("reading config: {}", e)))?;
        let conf: ClientConfig = toml::from_str(&text)
            .map_err(|e| Error::ConfigError(format!("parsing config: {}", e)))?;
        let conf = conf.populate_defaults();
        conf.validate()?;
        Ok(conf)
    }

    fn populate_defaults(mut self) -> Self {
        if self.tunnels == 0 {
            self.tunnels = 1;
        }
        if self.heartbeat_secs == 0 {
            self.heartbeat_secs = DEFAULT_HEARTBEAT_SECS;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = DEFAULT_TIMEOUT_SECS;
        }
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.server_addr.is_empty() {
            return Err(Error::ConfigError("server_addr is required".into()));
        }
        if self.backends.is_empty() {
            return Err(Error::ConfigError(
                "at least one backend mapping is required".into(),
            ));
        }
        for mapping in &self.backends {
            if mapping.backend.is_empty() || mapping.listen.is_empty() {
                return Err(Error::ConfigError(
                    "backend mapping requires both backend and listen".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendServer {
    #[serde(default)]
    pub name: String,
    pub addr: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub log_response: bool,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalUser {
    pub account: String,
    pub password: String,
    #[serde(default = "default_algo")]
    pub algo: String,
}

fn default_algo() -> String {
    "plain".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Users {
    #[serde(default)]
    pub local: Vec<LocalUser>,
}

#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub secret: String,
    pub backends: Vec<BackendServer>,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub users: Users,
    #[serde(default)]
    pub verbose: bool,
}

fn default_auth_type() -> String {
    "none".to_string()
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("listen", &self.listen)
            .field("secret", &"<redacted>")
            .field("backends", &self.backends)
            .field("auth_type", &self.auth_type)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ServerConfig, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("reading config: {}", e)))?;
        let conf: ServerConfig = toml::from_str(&text)
            .map_err(|e| Error::ConfigError(format!("parsing config: {}", e)))?;
        let conf = conf.populate_defaults();
        conf.validate()?;
        Ok(conf)
    }

    fn populate_defaults(mut self) -> Self {
        for backend in self.backends.iter_mut() {
            if backend.name.is_empty() {
                backend.name = backend.addr.clone();
            }
        }
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if self.listen.is_empty() {
            return Err(Error::ConfigError("listen is required".into()));
        }
        match self.auth_type.as_str() {
            "none" | "local" => {}
            other => {
                return Err(Error::ConfigError(format!(
                    "unknown auth_type: {}",
                    other
                )))
            }
        }
        if self.auth_type == "local" {
            if self.users.local.is_empty() {
                return Err(Error::ConfigError(
                    "auth_type = \"local\" requires at least one user".into(),
                ));
            }
            for user in &self.users.local {
                if user.account.is_empty() {
                    return Err(Error::ConfigError("local user account is empty".into()));
                }
                if user.algo != "plain" && user.algo != "base64" {
                    return Err(Error::ConfigError(format!(
                        "unknown password algo: {}",
                        user.algo
                    )));
                }
            }
        }
        if self.backends.is_empty() {
            return Err(Error::ConfigError(
                "at least one backend is required".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults_tunnels_to_one() {
        let toml = r#"
            server_addr = "127.0.0.1:9000"
            secret = "s"
            username = "u"
            password = "p"
            [[backends]]
            backend = "echo"
            listen = "127.0.0.1:9001"
        "#;
        let conf: ClientConfig = toml::from_str(toml).unwrap();
        let conf = conf.populate_defaults();
        assert_eq!(conf.tunnels, 1);
        assert_eq!(conf.heartbeat_secs, DEFAULT_HEARTBEAT_SECS);
        assert!(conf.validate().is_ok());
    }

    #[test]
    fn server_config_rejects_unknown_auth_type() {
        let toml = r#"
            listen = "127.0.0.1:9000"
            secret = "s"
            auth_type = "ldap"
            [[backends]]
            addr = "127.0.0.1:3306"
        "#;
        let conf: ServerConfig = toml::from_str(toml).unwrap();
        let conf = conf.populate_defaults();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn server_config_defaults_backend_name_to_addr() {
        let toml = r#"
            listen = "127.0.0.1:9000"
            secret = "s"
            [[backends]]
            addr = "127.0.0.1:3306"
        "#;
        let conf: ServerConfig = toml::from_str(toml).unwrap();
        let conf = conf.populate_defaults();
        assert_eq!(conf.backends[0].name, "127.0.0.1:3306");
        assert_eq!(conf.backends[0].protocol, "tcp");
    }
}
