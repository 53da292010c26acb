//! Request/response client built on the same framing code as the server.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    error::{Result, SocketError},
    frame::{decode_ascii, encode_ascii, send_frame, Framing},
    transport::{SharedTransport, TcpTransport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    /// Buffer used by [`SocketClient::receive_bytes`].
    pub buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            send_timeout: Duration::from_millis(10000),
            receive_timeout: Duration::from_millis(10000),
            buffer_size: 512,
        }
    }
}

/// One connection to a remote endpoint.
///
/// Each `receive_*` call picks its own framing and keeps the payload it
/// returns, available afterwards through [`SocketClient::message`].
pub struct SocketClient {
    host: String,
    port: u16,
    transport: SharedTransport,
    config: ClientConfig,
    message: Vec<u8>,
}

impl SocketClient {
    /// A client over a real TCP socket.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_transport(host, port, Arc::new(TcpTransport::new()))
    }

    pub fn with_transport(host: impl Into<String>, port: u16, transport: SharedTransport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            config: ClientConfig::default(),
            message: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// Opens the connection within the connect timeout. Any failure, the
    /// timeout included, yields `false`.
    pub async fn connect(&self) -> bool {
        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.host, self.port),
        )
        .await;

        match attempt {
            Ok(Ok(())) => self.transport.is_connected() && self.transport.has_stream(),
            Ok(Err(err)) => {
                debug!(host = %self.host, port = self.port, error = ?err, "connect failed");
                false
            }
            Err(_) => {
                debug!(
                    host = %self.host,
                    port = self.port,
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "connect timed out"
                );
                false
            }
        }
    }

    /// Closes the stream. The client can `connect` again afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        if self.transport.is_connected() {
            self.transport.disconnect().await?;
        }
        Ok(())
    }

    /// Releases the socket for good.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(SocketError::InvalidArgument(
                "the message to send can not be empty".into(),
            ));
        }
        self.send(&encode_ascii(text)).await
    }

    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_with_timeout(data, self.config.send_timeout).await
    }

    pub async fn send_with_timeout(&self, data: &[u8], timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(SocketError::InvalidArgument(
                "timeout has to be greater than 0".into(),
            ));
        }
        send_frame(data, self.transport.as_ref(), timeout).await
    }

    /// Reads until the stream goes idle, using the configured buffer size.
    pub async fn receive_bytes(&mut self) -> Result<&[u8]> {
        let buffer_size = self.config.buffer_size;
        self.receive_bytes_with_buffer(buffer_size).await
    }

    pub async fn receive_bytes_with_buffer(&mut self, buffer_size: usize) -> Result<&[u8]> {
        self.receive(Framing::BufferUntilIdle { buffer_size }).await
    }

    pub async fn receive_number_of_bytes(
        &mut self,
        buffer_size: usize,
        length: usize,
    ) -> Result<&[u8]> {
        self.receive(Framing::FixedLength {
            buffer_size,
            length,
        })
        .await
    }

    pub async fn receive_with_delimiters(&mut self, start: &[u8], end: &[u8]) -> Result<&[u8]> {
        self.receive(Framing::DelimitedBothEnds {
            start: start.to_vec(),
            end: end.to_vec(),
        })
        .await
    }

    pub async fn receive_with_end_delimiter(&mut self, end: &[u8]) -> Result<&[u8]> {
        self.receive(Framing::DelimitedEndOnly { end: end.to_vec() })
            .await
    }

    async fn receive(&mut self, framing: Framing) -> Result<&[u8]> {
        framing.validate()?;
        let transport = SharedTransport::clone(&self.transport);
        let message = self
            .bounded(framing.read_frame(transport.as_ref()))
            .await?;
        self.message = message;
        Ok(&self.message)
    }

    async fn bounded<T>(&self, read: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.receive_timeout;
        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| SocketError::ReceiveTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// The payload returned by the last successful receive.
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

impl fmt::Display for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&decode_ascii(&self.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedTransport, Transport};

    fn client_over(transport: &Arc<ScriptedTransport>) -> SocketClient {
        let shared: SharedTransport = transport.clone();
        SocketClient::with_transport("127.0.0.1", 9999, shared)
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert_eq!(config.send_timeout, Duration::from_millis(10000));
        assert_eq!(config.receive_timeout, Duration::from_millis(10000));
        assert_eq!(config.buffer_size, 512);
    }

    #[tokio::test]
    async fn connect_reports_refusal_as_false() {
        let transport = Arc::new(ScriptedTransport::new().refusing_connect());
        let client = client_over(&transport);
        assert!(!client.connect().await);
    }

    #[tokio::test]
    async fn connect_then_send_text() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_over(&transport);
        assert!(client.connect().await);

        client.send_text("hello").await.expect("send");
        assert_eq!(transport.written_bytes(), b"hello");
    }

    #[tokio::test]
    async fn blank_text_and_zero_timeout_are_invalid_arguments() {
        let transport = Arc::new(ScriptedTransport::connected(
            "127.0.0.1:9999".parse().expect("addr"),
        ));
        let client = client_over(&transport);

        assert!(matches!(
            client.send_text("  \r\n").await,
            Err(SocketError::InvalidArgument(_))
        ));
        assert!(matches!(
            client.send_with_timeout(b"x", Duration::ZERO).await,
            Err(SocketError::InvalidArgument(_))
        ));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn receive_keeps_the_last_message() {
        let transport = Arc::new(
            ScriptedTransport::connected("127.0.0.1:9999".parse().expect("addr"))
                .with_chunks([b"<ack>".to_vec(), b"12345678".to_vec()]),
        );
        let mut client = client_over(&transport);

        let ack = client
            .receive_with_delimiters(b"<", b">")
            .await
            .expect("delimited")
            .to_vec();
        assert_eq!(ack, b"ack");
        assert_eq!(client.to_string(), "ack");

        client.receive_number_of_bytes(8, 4).await.expect("fixed");
        assert_eq!(client.message(), b"1234");
    }

    #[tokio::test]
    async fn silent_peer_hits_the_receive_timeout() {
        let transport = Arc::new(
            ScriptedTransport::connected("127.0.0.1:9999".parse().expect("addr")).held_open(),
        );
        let mut client = client_over(&transport).with_config(ClientConfig {
            receive_timeout: Duration::from_millis(100),
            ..ClientConfig::default()
        });

        let err = client
            .receive_with_end_delimiter(b"\n")
            .await
            .expect_err("nothing arrives");
        assert!(matches!(err, SocketError::ReceiveTimeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn disconnect_allows_reconnect_but_close_does_not() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client_over(&transport);
        assert!(client.connect().await);

        client.disconnect().await.expect("disconnect");
        assert!(!transport.is_connected());
        assert!(client.connect().await);

        client.close().await;
        assert!(transport.is_closed());
        assert!(!client.connect().await);
    }
}
