//! Redis-backed [`MessageBus`].

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use sandgate_core::error::{Error, Result};
use sandgate_core::traits::MessageBus;

const SUBSCRIPTION_BUFFER: usize = 64;

pub struct RedisMessageBus {
    client: redis::Client,
}

impl RedisMessageBus {
    pub fn new(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::bus(format!("redis open {url}: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::bus(format!("redis connect: {e}")))?;
        conn.publish::<_, _, ()>(subject, payload)
            .await
            .map_err(|e| Error::bus(format!("redis publish {subject}: {e}")))
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::bus(format!("redis connect: {e}")))?;
        pubsub
            .subscribe(subject)
            .await
            .map_err(|e| Error::bus(format!("redis subscribe {subject}: {e}")))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let subject = subject.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::warn!(subject = %subject, error = %e, "undecodable bus message");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            tracing::warn!(subject = %subject, "redis subscription ended");
        });
        Ok(rx)
    }
}
