//! Server configuration

use crate::{Error, Result};

/// Runtime configuration, assembled from command-line arguments by the binary.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listening socket binds to.
    pub bind_address: String,
    /// TCP port to listen on. Port 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Shared secret compared byte-for-byte against the PASS argument.
    pub password: String,
    /// Name used as the server prefix and as the host part of user prefixes.
    pub server_name: String,
}

impl Config {
    /// Create a configuration with the default bind address and server name.
    pub fn new(port: u16, password: impl Into<String>) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port,
            password: password.into(),
            server_name: "localhost".to_string(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(Error::Config("bind address must not be empty".to_string()));
        }
        if self.server_name.is_empty() || self.server_name.contains(' ') {
            return Err(Error::Config(
                "server name must be a single non-empty word".to_string(),
            ));
        }
        Ok(())
    }
}
