//! A single framed TCP connection to one broker.
//!
//! The socket is opened lazily on first use. Any I/O failure drops the socket
//! and marks the connection dirty; the next [`BrokerConnection::send`] opens a
//! fresh one before writing.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::constants::MAX_RESPONSE_SIZE;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct BrokerConnection {
    host: String,
    port: u16,
    timeout: Option<Duration>,
    stream: Option<TcpStream>,
    dirty: bool,
}

impl BrokerConnection {
    /// Create an unopened connection; nothing touches the network until the first send.
    pub fn new(host: impl Into<String>, port: u16, timeout: Option<Duration>) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
            stream: None,
            dirty: false,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the last operation failed and the socket has to be reopened.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Same broker and timeout, without the live socket.
    pub fn copy(&self) -> Self {
        Self::new(self.host.clone(), self.port, self.timeout)
    }

    fn connection_error(&self, reason: impl Into<String>) -> Error {
        Error::Connection {
            host: self.host.clone(),
            port: self.port,
            reason: reason.into(),
        }
    }

    async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(Error::from),
            None => fut.await.map_err(Error::from),
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() && !self.dirty {
            return Ok(());
        }

        if self.dirty {
            debug!(host = %self.host, port = self.port, "Reopening dirty connection");
        }
        self.stream = None;

        let addr = (self.host.as_str(), self.port);
        match Self::with_timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                debug!(host = %self.host, port = self.port, "Connected to broker");
                self.stream = Some(stream);
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                warn!(host = %self.host, port = self.port, error = %e, "Unable to connect to broker");
                Err(self.connection_error(format!("connect failed: {}", e)))
            }
        }
    }

    fn fail(&mut self, correlation_id: i32, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        warn!(
            host = %self.host,
            port = self.port,
            correlation_id,
            reason = %reason,
            "Broker connection failed"
        );
        self.stream = None;
        self.dirty = true;
        self.connection_error(reason)
    }

    /// Write a complete request frame, reconnecting first if the connection is dirty.
    pub async fn send(&mut self, correlation_id: i32, payload: &Bytes) -> Result<()> {
        self.ensure_connected().await?;
        trace!(host = %self.host, port = self.port, correlation_id, bytes = payload.len(), "Sending request");

        let timeout = self.timeout;
        let result = match self.stream.as_mut() {
            Some(stream) => Self::with_timeout(timeout, stream.write_all(payload)).await,
            None => return Err(self.fail(correlation_id, "not connected")),
        };

        result.map_err(|e| self.fail(correlation_id, format!("send failed: {}", e)))
    }

    /// Read one response frame and return its body without the size prefix.
    pub async fn recv(&mut self, correlation_id: i32) -> Result<Bytes> {
        let timeout = self.timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.fail(correlation_id, "not connected"));
        };

        let size = match Self::with_timeout(timeout, stream.read_i32()).await {
            Ok(size) => size,
            Err(e) => return Err(self.fail(correlation_id, format!("size read failed: {}", e))),
        };

        if size < 0 || size as usize > MAX_RESPONSE_SIZE {
            return Err(self.fail(correlation_id, format!("invalid response size {}", size)));
        }

        let mut body = BytesMut::zeroed(size as usize);
        let Some(stream) = self.stream.as_mut() else {
            return Err(self.fail(correlation_id, "not connected"));
        };
        if let Err(e) = Self::with_timeout(timeout, stream.read_exact(&mut body)).await {
            return Err(self.fail(correlation_id, format!("body read failed: {}", e)));
        }

        trace!(host = %self.host, port = self.port, correlation_id, bytes = size, "Received response");
        Ok(body.freeze())
    }

    /// Forget the socket after the stream got out of step; the next send reconnects.
    pub fn mark_dirty(&mut self) {
        self.stream = None;
        self.dirty = true;
    }

    /// Drop the socket. The connection stays usable and reopens on the next send.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
            debug!(host = %self.host, port = self.port, "Closed broker connection");
        }
        self.dirty = false;
    }

    /// Close and reopen the socket right away.
    pub async fn reinit(&mut self) -> Result<()> {
        self.close().await;
        self.ensure_connected().await
    }
}
