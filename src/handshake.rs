//! HTTP/2 connection preface and settings exchange
//!
//! Local settings are validated before anything is written to the transport.
//! Settings HTTP/2 cannot express are reported as
//! [`HandshakeError::IncompatibleSettings`], never clamped.

use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::HandshakeError;

/// Which side of the connection preface we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the client preface and opens streams
    Initiator,
    /// Reads the client preface and accepts streams
    Acceptor,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("client"),
            Role::Acceptor => f.write_str("server"),
        }
    }
}

pub(crate) type ClientParts<T> = (h2::client::SendRequest<Bytes>, h2::client::Connection<T, Bytes>);

/// Perform the client side of the handshake.
///
/// h2 writes the preface and our SETTINGS here; the peer's SETTINGS are
/// processed by the driver, so a bad server preface surfaces as a connection
/// failure once the driver runs.
pub(crate) async fn client<T>(io: T, config: &ConnectionConfig) -> Result<ClientParts<T>, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    check(config, Role::Initiator)?;

    let mut builder = h2::client::Builder::new();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_frame_size(config.max_frame_size)
        .max_header_list_size(config.max_header_list_size)
        .max_send_buffer_size(config.max_send_buffer_size)
        .max_concurrent_reset_streams(config.max_concurrent_reset_streams)
        .enable_push(false);
    if let Some(max) = config.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }

    let timeout = config.handshake_timeout();
    match tokio::time::timeout(timeout, builder.handshake::<T, Bytes>(io)).await {
        Ok(Ok(parts)) => {
            debug!(role = %Role::Initiator, "handshake complete");
            Ok(parts)
        }
        Ok(Err(e)) => Err(failed(e, Role::Initiator)),
        Err(_) => Err(timed_out(timeout, Role::Initiator)),
    }
}

/// Perform the server side of the handshake: send SETTINGS, then read and
/// verify the client preface.
pub(crate) async fn server<T>(
    io: T,
    config: &ConnectionConfig,
) -> Result<h2::server::Connection<T, Bytes>, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    check(config, Role::Acceptor)?;

    let mut builder = h2::server::Builder::new();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_frame_size(config.max_frame_size)
        .max_header_list_size(config.max_header_list_size)
        .max_send_buffer_size(config.max_send_buffer_size)
        .max_concurrent_reset_streams(config.max_concurrent_reset_streams);
    if let Some(max) = config.max_concurrent_streams {
        builder.max_concurrent_streams(max);
    }

    let timeout = config.handshake_timeout();
    match tokio::time::timeout(timeout, builder.handshake::<T, Bytes>(io)).await {
        Ok(Ok(connection)) => {
            debug!(role = %Role::Acceptor, "handshake complete");
            Ok(connection)
        }
        Ok(Err(e)) => Err(failed(e, Role::Acceptor)),
        Err(_) => Err(timed_out(timeout, Role::Acceptor)),
    }
}

fn check(config: &ConnectionConfig, role: Role) -> Result<(), HandshakeError> {
    config.validate().map_err(|e| {
        warn!(%role, "refusing handshake: {}", e);
        HandshakeError::IncompatibleSettings(e.to_string())
    })
}

fn failed(err: h2::Error, role: Role) -> HandshakeError {
    let err = HandshakeError::from(err);
    warn!(%role, "handshake failed: {}", err);
    err
}

fn timed_out(timeout: std::time::Duration, role: Role) -> HandshakeError {
    warn!(%role, ?timeout, "handshake timed out");
    HandshakeError::Timeout(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use h2::Reason;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_client_server_handshake() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig::default();

        let accept = tokio::spawn({
            let config = config.clone();
            async move { server(server_io, &config).await.map(|_| ()) }
        });

        let parts = client(client_io, &config).await;
        assert!(parts.is_ok());

        // keep the client half alive until the server has read the preface
        let (_send, connection) = parts.unwrap();
        let driver = tokio::spawn(async move {
            let _ = connection.await;
        });
        assert!(accept.await.unwrap().is_ok());
        driver.abort();
    }

    #[tokio::test]
    async fn test_server_rejects_malformed_preface() {
        let (mut client_io, server_io) = tokio::io::duplex(64 * 1024);
        client_io
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let err = server(server_io, &ConnectionConfig::default()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedPreface(Reason::PROTOCOL_ERROR)));
    }

    #[tokio::test]
    async fn test_server_peer_closed_before_preface() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        drop(client_io);

        let err = server(server_io, &ConnectionConfig::default()).await.unwrap_err();
        assert!(matches!(err, HandshakeError::PeerClosed));
    }

    #[tokio::test]
    async fn test_server_handshake_timeout() {
        let (_client_io, server_io) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig {
            handshake_timeout: 50,
            ..Default::default()
        };

        let err = server(server_io, &config).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(t) if t == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_incompatible_settings_are_not_coerced() {
        let (client_io, _server_io) = tokio::io::duplex(64 * 1024);
        let config = ConnectionConfig {
            max_frame_size: 1024,
            ..Default::default()
        };

        let err = client(client_io, &config).await.unwrap_err();
        assert!(matches!(err, HandshakeError::IncompatibleSettings(_)));
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Initiator.to_string(), "client");
        assert_eq!(Role::Acceptor.to_string(), "server");
    }
}
