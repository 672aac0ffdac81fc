//! [`PeerConnection`]: addressed request/response and fire-and-forget
//! exchange with another hub process.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::naming::Address;
use crate::ports::PortError;

/// Delivery guarantee requested for a [`PeerConnection::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DeliveryQos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// An opaque payload exchanged between peers, identified by a content id so
/// large binary transfers can be negotiated out-of-band.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerEnvelope {
    pub content_id: String,
    pub payload: Vec<u8>,
}

#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    async fn connect(&self, address: &Address) -> Result<(), PortError>;

    async fn disconnect(&self, address: &Address) -> Result<(), PortError>;

    async fn send(
        &self,
        address: &Address,
        envelope: PeerEnvelope,
        qos: DeliveryQos,
        timeout: Option<Duration>,
    ) -> Result<(), PortError>;

    async fn receive(
        &self,
        address: &Address,
        content_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<PeerEnvelope>, PortError>;
}

/// In-process peer connection for tests and single-node deployments: `send`
/// deposits the envelope into a per-address mailbox that `receive` drains.
#[derive(Default)]
pub struct LoopbackPeerConnection {
    connected: DashMap<String, bool>,
    mailboxes: DashMap<(String, String), Arc<Mutex<Vec<PeerEnvelope>>>>,
}

impl LoopbackPeerConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(address: &Address, content_id: &str) -> (String, String) {
        (address.to_string(), content_id.to_string())
    }
}

#[async_trait::async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn connect(&self, address: &Address) -> Result<(), PortError> {
        self.connected.insert(address.to_string(), true);
        Ok(())
    }

    async fn disconnect(&self, address: &Address) -> Result<(), PortError> {
        self.connected.insert(address.to_string(), false);
        Ok(())
    }

    async fn send(
        &self,
        address: &Address,
        envelope: PeerEnvelope,
        _qos: DeliveryQos,
        _timeout: Option<Duration>,
    ) -> Result<(), PortError> {
        if !self.connected.get(&address.to_string()).map(|c| *c).unwrap_or(false) {
            return Err(PortError::NotConnected);
        }
        let key = Self::key(address, &envelope.content_id);
        let mailbox = self.mailboxes.entry(key).or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        mailbox.lock().await.push(envelope);
        Ok(())
    }

    async fn receive(
        &self,
        address: &Address,
        content_id: &str,
        _timeout: Option<Duration>,
    ) -> Result<Option<PeerEnvelope>, PortError> {
        let key = Self::key(address, content_id);
        match self.mailboxes.get(&key) {
            Some(mailbox) => Ok(mailbox.lock().await.pop()),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::Name;

    #[tokio::test]
    async fn send_without_connect_fails() {
        let peer = LoopbackPeerConnection::new();
        let addr = Address::new("hub", Name::single("dev"));
        let result = peer
            .send(
                &addr,
                PeerEnvelope { content_id: "x".into(), payload: vec![] },
                DeliveryQos::AtMostOnce,
                None,
            )
            .await;
        assert!(matches!(result, Err(PortError::NotConnected)));
    }

    #[tokio::test]
    async fn connected_send_then_receive_round_trips() {
        let peer = LoopbackPeerConnection::new();
        let addr = Address::new("hub", Name::single("dev"));
        peer.connect(&addr).await.unwrap();
        peer.send(
            &addr,
            PeerEnvelope { content_id: "blob".into(), payload: vec![1, 2, 3] },
            DeliveryQos::ExactlyOnce,
            None,
        )
        .await
        .unwrap();
        let received = peer.receive(&addr, "blob", None).await.unwrap().unwrap();
        assert_eq!(received.payload, vec![1, 2, 3]);
    }
}
