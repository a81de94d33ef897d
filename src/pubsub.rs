//! 发布订阅中心
//!
//! 每个订阅连接有一个fastlane邮箱，发布者把消息直接投递到邮箱并唤醒订阅连接，
//! 订阅连接在它自己的事件循环线程上把邮箱里的消息写给客户端。

use crate::conn::ConnId;
use crate::fastlane;
use crate::value::Value;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Notify;

/// 订阅者的邮箱和唤醒句柄
#[derive(Clone)]
pub struct Subscriber {
    pub mailbox: fastlane::Sender<Value>,
    pub wake: Arc<Notify>,
}

type Topics = HashMap<Bytes, HashMap<ConnId, Subscriber>>;

#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<Topics>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Topics> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Topics> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, topic: Bytes, conn: ConnId, subscriber: &Subscriber) {
        self.write()
            .entry(topic)
            .or_default()
            .insert(conn, subscriber.clone());
    }

    /// 取消订阅，返回之前是否订阅过
    pub fn unsubscribe(&self, topic: &[u8], conn: ConnId) -> bool {
        let mut topics = self.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(&conn).is_some();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// 向主题发布消息，返回收到消息的订阅者数量
    pub fn publish(&self, topic: &Bytes, message: &Bytes) -> usize {
        let topics = self.read();
        let Some(subscribers) = topics.get(topic) else {
            return 0;
        };
        for subscriber in subscribers.values() {
            subscriber.mailbox.send(Value::Array(vec![
                Value::bulk("message"),
                Value::BulkString(topic.clone()),
                Value::BulkString(message.clone()),
            ]));
            subscriber.wake.notify_one();
        }
        subscribers.len()
    }

    pub fn subscriber_count(&self, topic: &[u8]) -> usize {
        self.read().get(topic).map_or(0, |s| s.len())
    }

    pub fn topic_count(&self) -> usize {
        self.read().len()
    }
}
