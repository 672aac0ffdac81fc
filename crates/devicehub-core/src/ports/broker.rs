//! [`MessageBroker`]: publish/subscribe with hierarchical topic pattern
//! matching (`*` = one token, `**` = any number of tokens).

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::meta::Meta;
use crate::naming::Name;
use crate::ports::PortError;

/// A message delivered to a subscriber.
#[derive(Clone, Debug)]
pub struct BrokerEvent {
    pub topic: Name,
    pub payload: Meta,
    pub key: Option<String>,
    pub headers: Meta,
}

#[async_trait::async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: Name, event: BrokerEvent) -> Result<(), PortError>;

    async fn subscribe(
        &self,
        pattern: Name,
    ) -> Result<Pin<Box<dyn Stream<Item = BrokerEvent> + Send>>, PortError>;
}

/// Whether `topic` matches `pattern`, where a pattern token of `*` matches
/// exactly one topic token and `**` matches zero or more trailing tokens.
pub fn topic_matches(pattern: &Name, topic: &Name) -> bool {
    fn go(pattern: &[Arc<str>], topic: &[Arc<str>]) -> bool {
        match pattern.split_first() {
            None => topic.is_empty(),
            Some((head, rest)) if &**head == "**" => {
                if rest.is_empty() {
                    return true;
                }
                (0..=topic.len()).any(|i| go(rest, &topic[i..]))
            }
            Some((head, rest)) if &**head == "*" => {
                !topic.is_empty() && go(rest, &topic[1..])
            }
            Some((head, rest)) => match topic.split_first() {
                Some((t_head, t_rest)) if t_head == head => go(rest, t_rest),
                _ => false,
            },
        }
    }
    go(pattern.tokens(), topic.tokens())
}

/// In-process broker backed by a broadcast channel per process; subscribers
/// each get their own stream and filter by pattern locally.
pub struct InMemoryBroker {
    tx: broadcast::Sender<BrokerEvent>,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait::async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: Name, event: BrokerEvent) -> Result<(), PortError> {
        debug_assert_eq!(event.topic, topic);
        let _ = self.tx.send(event);
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: Name,
    ) -> Result<Pin<Box<dyn Stream<Item = BrokerEvent> + Send>>, PortError> {
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx)
            .filter_map(|res| res.ok())
            .filter(move |event| topic_matches(&pattern, &event.topic));
        Ok(Box::pin(stream))
    }
}
