// 进程内代理，基于 tokio broadcast
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use super::{Broker, BrokerError, BrokerMessage, RealtimeEnvelope};

const NAME: &str = "local";

pub struct LocalBroker {
    sender: broadcast::Sender<Vec<u8>>,
    closed: AtomicBool,
}

impl LocalBroker {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            closed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }

    /// 订阅为字节流，落后的订阅者跳过丢失的消息
    pub fn stream(&self) -> BoxStream<'static, Vec<u8>> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(bytes) => Some(bytes),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "本地代理订阅者落后，丢弃消息");
                    None
                }
            }
        })
        .boxed()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for LocalBroker {
    fn name(&self) -> &str {
        NAME
    }

    async fn publish(&self, message: &BrokerMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(NAME.to_string()));
        }

        let bytes = RealtimeEnvelope::from_message(message)?.to_bytes()?;
        // 没有订阅者不算失败
        let _ = self.sender.send(bytes);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
