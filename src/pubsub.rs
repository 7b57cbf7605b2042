use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{PubSubSink, PubSubStream};

use crate::error::PubSubError;

/// A raw message as delivered by the notification transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A notification transport that can open one shared subscription connection.
/// The connection is split into a sink half (channel membership changes,
/// driven by the fan-out manager) and a stream half (owned exclusively by the
/// multiplexer's listener task).
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, Box<dyn SubscriptionStream>), PubSubError>;
}

#[async_trait]
pub trait SubscriptionSink: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), PubSubError>;
    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PubSubError>;
}

#[async_trait]
pub trait SubscriptionStream: Send {
    /// Wait up to `wait` for the next message. `Ok(None)` means the timeout
    /// elapsed with nothing to deliver.
    async fn next_message(&mut self, wait: Duration) -> Result<Option<RawMessage>, PubSubError>;
}

pub struct ValkeyPubSubTransport {
    client: redis::Client,
}

impl ValkeyPubSubTransport {
    pub fn new(valkey_url: &str) -> Result<Self, PubSubError> {
        Ok(ValkeyPubSubTransport {
            client: redis::Client::open(valkey_url)?,
        })
    }
}

#[async_trait]
impl PubSubTransport for ValkeyPubSubTransport {
    async fn connect(
        &self,
    ) -> Result<(Box<dyn SubscriptionSink>, Box<dyn SubscriptionStream>), PubSubError> {
        let pubsub = self.client.get_async_pubsub().await?;
        let (sink, stream) = pubsub.split();
        Ok((
            Box::new(ValkeySink { sink }),
            Box::new(ValkeyStream { stream }),
        ))
    }
}

struct ValkeySink {
    sink: PubSubSink,
}

#[async_trait]
impl SubscriptionSink for ValkeySink {
    async fn subscribe(&mut self, topic: &str) -> Result<(), PubSubError> {
        self.sink.subscribe(topic).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), PubSubError> {
        self.sink.unsubscribe(topic).await?;
        Ok(())
    }
}

struct ValkeyStream {
    stream: PubSubStream,
}

#[async_trait]
impl SubscriptionStream for ValkeyStream {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<RawMessage>, PubSubError> {
        match tokio::time::timeout(wait, self.stream.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(RawMessage {
                topic: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            })),
            // The stream only ends when the sink (and with it the shared
            // connection) has been dropped.
            Ok(None) => Err(PubSubError::ConnectionLost),
        }
    }
}
