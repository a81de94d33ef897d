//! fastlane - 无锁、按生产者线程分片的多生产者单消费者通道
//!
//! 每个生产者线程在第一次发送时为通道创建自己的分片（一个无锁的无界队列），
//! 并把分片缓存在线程局部存储中。发送只是一次无锁的入队，从不阻塞；
//! 同一线程发送的值保持先进先出，不同线程之间的顺序没有保证。
//!
//! 消费者持有所有已发现分片的列表和一个轮询游标：
//!
//! - 新分片通过一个无锁的注册队列公布，消费者每次轮询前把它取空
//! - 从分片 i 取到值后，下一次从 i+1 开始，慢分片不会饿死其他分片
//! - 没有数据时消费者挂起（park），生产者发现消费者在睡眠时唤醒它
//!
//! 内存回收：已消费的节点由分段队列自行释放；生产者线程退出后，
//! 它在线程局部存储中的弱引用随之消失，消费者在分片为空时将其移除。
//!
//! 线程局部存储已经销毁时（例如在其他线程局部变量的析构函数里发送），
//! 发送改走通道共用的溢出分片。溢出分片只有一个队列，所以这些发送同样保持先进先出，
//! 它也不会被回收。

use crossbeam::queue::SegQueue;
use crossbeam::sync::{Parker, Unparker};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::AccessError;
use std::time::{Duration, Instant};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type ErasedShard = dyn Any + Send + Sync;

thread_local! {
    /// 本线程在各个通道上的分片，按通道ID索引
    static LOCAL_SHARDS: RefCell<HashMap<u64, Weak<ErasedShard>>> = RefCell::new(HashMap::new());
}

/// 分片中的一项：值或者结束标记
enum Slot<T> {
    Value(T),
    End,
}

/// 接收结果
#[derive(Debug, PartialEq, Eq)]
pub enum Received<T> {
    Value(T),
    /// 生产者主动发送的结束标记
    End,
}

impl<T> Received<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Received::Value(v) => Some(v),
            Received::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Received::End)
    }
}

impl<T> From<Slot<T>> for Received<T> {
    fn from(slot: Slot<T>) -> Self {
        match slot {
            Slot::Value(v) => Received::Value(v),
            Slot::End => Received::End,
        }
    }
}

struct Shard<T> {
    queue: SegQueue<Slot<T>>,
}

struct Shared<T> {
    id: u64,
    /// 新创建、尚未被消费者发现的分片
    discovered: SegQueue<Arc<Shard<T>>>,
    sleeping: AtomicBool,
    unparker: Unparker,
    /// 没有线程局部存储可用时使用的分片
    overflow: Arc<Shard<T>>,
    overflow_published: AtomicBool,
}

/// 发送端，可以克隆并在任意线程使用
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// 接收端，同一时刻只能由一个线程使用
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
    parker: Parker,
    shards: Vec<Arc<Shard<T>>>,
    cursor: usize,
}

/// 创建一个通道
pub fn channel<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let parker = Parker::new();
    let shared = Arc::new(Shared {
        id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
        discovered: SegQueue::new(),
        sleeping: AtomicBool::new(false),
        unparker: parker.unparker().clone(),
        overflow: Arc::new(Shard {
            queue: SegQueue::new(),
        }),
        overflow_published: AtomicBool::new(false),
    });
    let sender = Sender {
        shared: shared.clone(),
    };
    let receiver = Receiver {
        shared,
        parker,
        shards: Vec::new(),
        cursor: 0,
    };
    (sender, receiver)
}

impl<T: Send + 'static> Sender<T> {
    /// 发送一个值，所有权转移给消费者
    pub fn send(&self, value: T) {
        self.push(Slot::Value(value));
    }

    /// 发送结束标记，通知消费者停止
    pub fn send_end(&self) {
        self.push(Slot::End);
    }

    fn push(&self, slot: Slot<T>) {
        match self.local_shard() {
            Ok(Some(shard)) => shard.queue.push(slot),
            Ok(None) => {
                let shard = Arc::new(Shard {
                    queue: SegQueue::new(),
                });
                if self.cache_shard(&shard) {
                    // 新分片先写入数据再公布，消费者不会看到一个可被回收的空分片
                    shard.queue.push(slot);
                    self.shared.discovered.push(shard);
                } else {
                    self.push_overflow(slot);
                }
            }
            Err(_) => self.push_overflow(slot),
        }

        fence(Ordering::SeqCst);
        if self.shared.sleeping.load(Ordering::SeqCst) {
            self.shared.unparker.unpark();
        }
    }

    fn push_overflow(&self, slot: Slot<T>) {
        self.shared.overflow.queue.push(slot);
        if !self.shared.overflow_published.swap(true, Ordering::AcqRel) {
            self.shared.discovered.push(self.shared.overflow.clone());
        }
    }

    /// 本线程在这个通道上的分片；线程局部存储不可用时返回错误
    fn local_shard(&self) -> Result<Option<Arc<Shard<T>>>, AccessError> {
        LOCAL_SHARDS.try_with(|cell| {
            let map = cell.borrow();
            let erased = map.get(&self.shared.id)?.upgrade()?;
            erased.downcast::<Shard<T>>().ok()
        })
    }

    fn cache_shard(&self, shard: &Arc<Shard<T>>) -> bool {
        let erased: Arc<ErasedShard> = shard.clone();
        LOCAL_SHARDS
            .try_with(|cell| {
                let mut map = cell.borrow_mut();
                map.retain(|_, weak| weak.strong_count() > 0);
                map.insert(self.shared.id, Arc::downgrade(&erased));
            })
            .is_ok()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").field("channel", &self.shared.id).finish()
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// 阻塞接收，直到有值或结束标记
    pub fn recv(&mut self) -> Received<T> {
        loop {
            if let Some(slot) = self.poll_or_sleep() {
                return slot.into();
            }
            self.parker.park();
            self.shared.sleeping.store(false, Ordering::SeqCst);
        }
    }

    /// 最多等待 `timeout`，超时返回 `None`
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Received<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(slot) = self.poll_or_sleep() {
                return Some(slot.into());
            }
            let now = Instant::now();
            if now >= deadline {
                self.shared.sleeping.store(false, Ordering::SeqCst);
                return None;
            }
            self.parker.park_timeout(deadline - now);
            self.shared.sleeping.store(false, Ordering::SeqCst);
        }
    }

    /// 非阻塞接收
    pub fn try_recv(&mut self) -> Option<Received<T>> {
        self.poll().map(Received::from)
    }

    /// 轮询一次；没有数据时标记睡眠并再检查一次，避免错过唤醒
    fn poll_or_sleep(&mut self) -> Option<Slot<T>> {
        if let Some(slot) = self.poll() {
            return Some(slot);
        }
        self.shared.sleeping.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let slot = self.poll();
        if slot.is_some() {
            self.shared.sleeping.store(false, Ordering::SeqCst);
        }
        slot
    }

    fn poll(&mut self) -> Option<Slot<T>> {
        while let Some(shard) = self.shared.discovered.pop() {
            self.shards.push(shard);
        }

        let n = self.shards.len();
        for step in 0..n {
            let idx = (self.cursor + step) % n;
            if let Some(slot) = self.shards[idx].queue.pop() {
                self.cursor = (idx + 1) % n;
                return Some(slot);
            }
        }

        self.prune();
        None
    }

    /// 移除生产者线程已经退出且没有剩余数据的分片
    fn prune(&mut self) {
        let before = self.shards.len();
        let overflow = &self.shared.overflow;
        self.shards.retain(|shard| {
            Arc::weak_count(shard) > 0 || !shard.queue.is_empty() || Arc::ptr_eq(shard, overflow)
        });
        if self.shards.len() != before {
            self.cursor = 0;
        }
    }

    /// 当前已发现的分片数
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("channel", &self.shared.id)
            .field("shards", &self.shards.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}
