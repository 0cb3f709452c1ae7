use std::path::PathBuf;
use std::time::Duration;

use crate::error::RelayError;

/// Server configuration, assembled with a builder and validated at build
/// time.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// Chat port; upload, download and directory listen on the next three.
    pub port: u16,
    /// Maximum number of simultaneous client connections.
    pub capacity: usize,
    pub files_dir: PathBuf,
    pub channels_dir: PathBuf,
    /// How long a spawned service worker waits for its side connection.
    pub accept_timeout: Duration,
    /// Pause between the shutdown notice and tearing every worker down.
    pub shutdown_grace: Duration,
    pub max_upload_bytes: u64,
    /// Messages queued for a client before further deliveries to it are
    /// dropped.
    pub outbox_capacity: usize,
}

pub struct ServerConfigBuilder {
    addr: String,
    port: u16,
    capacity: usize,
    files_dir: PathBuf,
    channels_dir: PathBuf,
    accept_timeout: Duration,
    shutdown_grace: Duration,
    max_upload_bytes: u64,
    outbox_capacity: usize,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            addr: "0.0.0.0".to_string(),
            port: 8080,
            capacity: 25,
            files_dir: PathBuf::from("server_files"),
            channels_dir: PathBuf::from("server_channels"),
            accept_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
            max_upload_bytes: 1 << 30,
            outbox_capacity: 256,
        }
    }

    pub fn upload_port(&self) -> u16 {
        self.port + 1
    }

    pub fn download_port(&self) -> u16 {
        self.port + 2
    }

    pub fn directory_port(&self) -> u16 {
        self.port + 3
    }
}

impl ServerConfigBuilder {
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn files_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.files_dir = dir.into();
        self
    }

    pub fn channels_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.channels_dir = dir.into();
        self
    }

    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    pub fn outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ServerConfig, RelayError> {
        if self.capacity == 0 {
            return Err(RelayError::Config("capacity must be at least 1".into()));
        }
        if self.outbox_capacity == 0 {
            return Err(RelayError::Config("outbox capacity must be at least 1".into()));
        }
        if self.port == 0 || self.port > u16::MAX - 3 {
            return Err(RelayError::Config(format!(
                "base port {} leaves no room for the three service ports",
                self.port
            )));
        }

        Ok(ServerConfig {
            addr: self.addr,
            port: self.port,
            capacity: self.capacity,
            files_dir: self.files_dir,
            channels_dir: self.channels_dir,
            accept_timeout: self.accept_timeout,
            shutdown_grace: self.shutdown_grace,
            max_upload_bytes: self.max_upload_bytes,
            outbox_capacity: self.outbox_capacity,
        })
    }
}
