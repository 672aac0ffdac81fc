//! Point-to-point transport ports: [`Port`], [`SynchronousPort`], [`StreamPort`].

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::ports::PortError;

/// A raw, asynchronous byte-oriented transport.
#[async_trait::async_trait]
pub trait Port: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), PortError>;

    async fn receive(&self) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>, PortError>;
}

/// A [`Port`] that additionally supports request/response round trips.
#[async_trait::async_trait]
pub trait SynchronousPort: Port {
    async fn respond(
        &self,
        bytes: Vec<u8>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Vec<u8>, PortError>;

    /// Run `body` with exclusive access to the port, so a multi-round
    /// request/response exchange cannot interleave with another caller's.
    async fn transaction(
        &self,
        body: Box<dyn FnOnce() -> Result<Vec<u8>, PortError> + Send>,
    ) -> Result<Vec<u8>, PortError>;
}

/// A framed, message-oriented transport.
#[async_trait::async_trait]
pub trait StreamPort: Send + Sync {
    async fn send(&self, buffer: Vec<u8>) -> Result<(), PortError>;

    async fn incoming(&self) -> Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;
}

/// In-process loopback: everything sent is immediately visible to `receive`,
/// and `respond` echoes the request back, useful as a test double for
/// request/response plan steps without a real transport.
pub struct LoopbackPort {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    lock: Mutex<()>,
}

impl LoopbackPort {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            lock: Mutex::new(()),
        }
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Port for LoopbackPort {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), PortError> {
        self.tx.send(bytes).await.map_err(|_| PortError::NotConnected)
    }

    async fn receive(&self) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>, PortError> {
        let rx = self.rx.lock().await.take().ok_or(PortError::NotConnected)?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait::async_trait]
impl SynchronousPort for LoopbackPort {
    async fn respond(
        &self,
        bytes: Vec<u8>,
        _timeout: Option<std::time::Duration>,
    ) -> Result<Vec<u8>, PortError> {
        Ok(bytes)
    }

    async fn transaction(
        &self,
        body: Box<dyn FnOnce() -> Result<Vec<u8>, PortError> + Send>,
    ) -> Result<Vec<u8>, PortError> {
        let _guard = self.lock.lock().await;
        body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn loopback_round_trips_a_send() {
        let port = LoopbackPort::new();
        let mut stream = port.receive().await.unwrap();
        port.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(stream.next().await, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn loopback_respond_echoes() {
        let port = LoopbackPort::new();
        let reply = port.respond(vec![9], None).await.unwrap();
        assert_eq!(reply, vec![9]);
    }

    #[tokio::test]
    async fn loopback_transaction_serializes_access() {
        let port = Arc::new(LoopbackPort::new());
        let result = port
            .transaction(Box::new(|| Ok(vec![42])))
            .await
            .unwrap();
        assert_eq!(result, vec![42]);
    }
}
