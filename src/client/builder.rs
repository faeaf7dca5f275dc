use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use super::Connection;
use crate::config::{ConnectionConfig, Http2Config, KeepAliveConfig};
use crate::driver::{Driver, Shared};
use crate::error::{Error, HandshakeError};
use crate::executor::{Executor, TokioExecutor};
use crate::handshake;

/// Configures and establishes client connections.
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
    /// Run drivers and request body pumps on `exec`
    pub fn executor<E2>(self, exec: E2) -> Builder<E2> {
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

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn max_send_buffer_size(mut self, size: usize) -> Self {
        self.config.max_send_buffer_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout.as_millis() as u64;
        self
    }

    /// PING every `interval`, failing the connection if a PONG takes longer
    /// than `timeout`
    pub fn keep_alive(mut self, interval: Duration, timeout: Duration) -> Self {
        self.keep_alive = KeepAliveConfig::every(interval, timeout);
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl<E> Builder<E>
where
    E: Executor + Clone,
{
    /// Handshake over `io`, returning the driver for the caller to run.
    pub async fn handshake<T>(&self, io: T) -> Result<(Connection<E>, Driver<T>), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.keep_alive
            .validate()
            .map_err(|e| HandshakeError::IncompatibleSettings(e.to_string()))?;

        let (send_request, connection) = handshake::client(io, &self.config).await?;
        let shared = Shared::new();
        let driver = Driver::new(connection, self.keep_alive.clone(), shared.clone());

        info!(connection = %shared.id(), "🔗 HTTP/2 client connection established");
        Ok((Connection::new(send_request, shared, self.exec.clone()), driver))
    }

    /// Handshake over `io` and run the driver on the builder's executor.
    pub async fn connect<T>(&self, io: T) -> Result<Connection<E>, Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, driver) = self.handshake(io).await?;
        self.exec
            .execute(Box::pin(async move {
                let _ = driver.run().await;
            }))
            .map_err(|e| {
                warn!("failed to spawn connection driver: {}", e);
                e
            })?;
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_settings() {
        let builder = Builder::new()
            .initial_stream_window_size(1 << 20)
            .max_frame_size(32_768)
            .max_concurrent_streams(8)
            .handshake_timeout(Duration::from_secs(2));

        assert_eq!(builder.config().initial_stream_window_size, 1 << 20);
        assert_eq!(builder.config().max_frame_size, 32_768);
        assert_eq!(builder.config().max_concurrent_streams, Some(8));
        assert_eq!(builder.config().handshake_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_builder_from_config() {
        let mut config = Http2Config::default();
        config.connection.max_header_list_size = 4096;
        let builder = Builder::from_config(&config);
        assert_eq!(builder.config().max_header_list_size, 4096);
    }

    #[tokio::test]
    async fn test_invalid_keep_alive_rejected() {
        let (io, _peer) = tokio::io::duplex(1024);
        let result = Builder::new()
            .keep_alive(Duration::ZERO, Duration::from_secs(1))
            .handshake(io)
            .await;
        assert!(matches!(
            result,
            Err(Error::Handshake(HandshakeError::IncompatibleSettings(_)))
        ));
    }
}
