// src/server.rs
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::NocturneResult;
use crate::reactor::Reactor;
use crate::syscalls;

/// Listen backlog handed to `listen(2)`.
const BACKLOG: i32 = 1024;

pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn bind(host: &str, port: u16) -> Self {
        Self::new(ServerConfig {
            host: host.to_string(),
            port,
            ..ServerConfig::default()
        })
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn doc_root(mut self, doc_root: impl Into<PathBuf>) -> Self {
        self.config.doc_root = doc_root.into();
        self
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    /// `None` keeps idle connections open forever.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.config.tick_interval = tick_interval;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Validate the configuration, bind the listener and start the pool.
    pub fn build(self) -> NocturneResult<Reactor> {
        self.config.validate()?;
        let listen_fd = syscalls::create_listen_socket(&self.config.host, self.config.port, BACKLOG)?;
        let reactor = Reactor::new(&self.config, listen_fd)?;
        info!(
            addr = %self.config.server_addr(),
            doc_root = %self.config.doc_root.display(),
            workers = self.config.workers,
            "server listening"
        );
        Ok(reactor)
    }

    /// Build and run until Ctrl-C.
    pub fn serve(self) -> NocturneResult<()> {
        let mut reactor = self.build()?;

        let handle = reactor.shutdown_handle();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received SIGINT, shutting down");
            handle.shutdown();
        }) {
            warn!(error = %e, "could not install Ctrl-C handler");
        }

        reactor.run()?;
        info!("nocturne server shut down successfully");
        Ok(())
    }
}
