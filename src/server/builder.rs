use std::time::Duration;

use super::Server;
use crate::config::{ConnectionConfig, Http2Config, KeepAliveConfig};
use crate::executor::{Executor, TokioExecutor};

/// Configures a [`Server`].
#[derive(Debug, Clone)]
pub struct Builder<E = TokioExecutor> {
    config: ConnectionConfig,
    keep_alive: KeepAliveConfig,
    exec: E,
}

impl Builder<TokioExecutor> {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            exec: TokioExecutor,
        }
    }

    /// Create a builder from loaded configuration
    pub fn from_config(config: &Http2Config) -> Self {
        Self {
            config: config.connection.clone(),
            keep_alive: config.keep_alive.clone(),
            exec: TokioExecutor,
        }
    }
}

impl Default for Builder<TokioExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Builder<E> {
    /// Run per-stream tasks on `exec`
    pub fn executor<E2: Executor>(self, exec: E2) -> Builder<E2> {
        Builder {
            config: self.config,
            keep_alive: self.keep_alive,
            exec,
        }
    }

    pub fn initial_stream_window_size(mut self, size: u32) -> Self {
        self.config.initial_stream_window_size = size;
        self
    }

    pub fn initial_connection_window_size(mut self, size: u32) -> Self {
        self.config.initial_connection_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Limit on streams the client may have open at once
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn max_concurrent_reset_streams(mut self, max: usize) -> Self {
        self.config.max_concurrent_reset_streams = max;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout.as_millis() as u64;
        self
    }

    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = KeepAliveConfig::every(interval, timeout);
        self
    }

    /// Finish configuration with the service factory
    pub fn build<M>(self, make_service: M) -> Server<M, E> {
        Server::new(make_service, self.config, self.keep_alive, self.exec)
    }
}
