use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use scheduler_domain::UpdateMessage;

/// 订阅句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// 把检测到的更新投递给订阅者；本身不修改任何调度状态
#[derive(Debug, Default)]
pub struct UpdatePublisher {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<SubscriptionId, mpsc::UnboundedSender<UpdateMessage>>>,
}

impl UpdatePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, sender: mpsc::UnboundedSender<UpdateMessage>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().await.insert(id, sender);
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.write().await.remove(&id).is_some()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// 返回成功投递的订阅者数量；接收端已关闭的订阅会被移除
    pub async fn publish(&self, message: UpdateMessage) -> usize {
        let mut closed = Vec::new();
        let mut delivered = 0;
        {
            let subscribers = self.subscribers.read().await;
            for (id, sender) in subscribers.iter() {
                if sender.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(*id);
                }
            }
        }

        if !closed.is_empty() {
            warn!("移除 {} 个已关闭的更新订阅", closed.len());
            let mut subscribers = self.subscribers.write().await;
            for id in closed {
                subscribers.remove(&id);
            }
        }
        debug!("发布更新 {} -> {} 个订阅者", message.kind(), delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::{DefinitionUpdate, JobKey};

    fn remove(code: &str) -> UpdateMessage {
        DefinitionUpdate::Remove(JobKey::new(code, "ops")).into()
    }

    #[tokio::test]
    async fn test_publish_preserves_order_per_subscriber() {
        let publisher = UpdatePublisher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        publisher.subscribe(tx).await;

        publisher.publish(remove("a")).await;
        publisher.publish(remove("b")).await;

        assert_eq!(rx.recv().await, Some(remove("a")));
        assert_eq!(rx.recv().await, Some(remove("b")));
    }

    #[tokio::test]
    async fn test_unsubscribe_and_closed_receivers() {
        let publisher = UpdatePublisher::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let first = publisher.subscribe(tx1).await;
        let second = publisher.subscribe(tx2).await;

        assert!(publisher.unsubscribe(second).await);
        assert!(!publisher.unsubscribe(second).await);

        drop(rx1);
        assert_eq!(publisher.publish(remove("a")).await, 0);
        assert_eq!(publisher.subscriber_count().await, 0);
        assert!(!publisher.unsubscribe(first).await);
    }
}
