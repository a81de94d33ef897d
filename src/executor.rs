//! 后端执行器
//!
//! 连接把解码好的命令连同连接类型和持久化级别交给执行器，得到一个回复值。
//! 执行器既可以在事件循环线程上直接调用，也可以放到独立的工作线程，
//! 通过fastlane通道收发请求和回复。交给工作线程的请求不会阻塞事件循环：
//! 提交后立即返回序号，回复到达时工作线程通过 `Notify` 唤醒连接所在的事件循环。

use crate::command::Command;
use crate::conn::{ConnKind, Durability};
use crate::error::SlicedResult;
use crate::fastlane::{self, Received};
use crate::store::Store;
use crate::value::{self, Value};
use bytes::Bytes;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::Notify;
use tracing::{info, warn};

/// 发往后端的请求
#[derive(Debug, Clone)]
pub struct Request {
    pub args: Vec<Bytes>,
    pub kind: ConnKind,
    pub durability: Durability,
}

pub trait Executor: Send + Sync {
    fn execute(&self, request: Request) -> Value;
}

/// 基于内存存储的执行器
#[derive(Debug, Clone, Default)]
pub struct StoreExecutor {
    store: Store,
}

impl StoreExecutor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn apply(&self, cmd: Command, request: &Request) -> Value {
        match cmd {
            Command::Get { key } => self.store.get(&key).into(),

            Command::Set { key, value, nx, xx } => {
                if self.store.set_if(key, value, nx, xx) {
                    value::OK
                } else {
                    value::NIL
                }
            }

            Command::GetSet { key, value } => self.store.getset(key, value).into(),

            Command::Append { key, value } => {
                Value::Integer(self.store.append(key, &value) as i64)
            }

            Command::Strlen { key } => Value::Integer(self.store.strlen(&key) as i64),

            Command::IncrBy { key, delta } => match self.store.incr_by(key, delta) {
                Ok(n) => Value::Integer(n),
                Err(e) => Value::Error(e.to_reply_text()),
            },

            Command::MGet { keys } => Value::Array(
                self.store
                    .mget(&keys)
                    .into_iter()
                    .map(Value::from)
                    .collect(),
            ),

            Command::MSet { pairs } => {
                self.store.mset(pairs);
                value::OK
            }

            Command::Del { keys } => Value::Integer(self.store.del(&keys) as i64),

            Command::Exists { keys } => Value::Integer(self.store.exists(&keys) as i64),

            Command::Keys { pattern } => Value::Array(
                self.store
                    .keys(&pattern)
                    .into_iter()
                    .map(Value::BulkString)
                    .collect(),
            ),

            Command::DbSize => Value::Integer(self.store.dbsize() as i64),

            Command::FlushDb => {
                self.store.flush();
                value::OK
            }

            Command::Info => {
                let info = format!(
                    "# Server\r\n\
                     sliced_version:{}\r\n\
                     # Client\r\n\
                     kind:{}\r\n\
                     durability:{}\r\n\
                     # Keyspace\r\n\
                     db0:keys={}\r\n",
                    crate::VERSION,
                    request.kind,
                    request.durability,
                    self.store.dbsize()
                );
                Value::BulkString(Bytes::from(info))
            }
        }
    }
}

impl Executor for StoreExecutor {
    fn execute(&self, request: Request) -> Value {
        match Command::parse(&request.args) {
            Ok(cmd) => self.apply(cmd, &request),
            Err(e) => Value::Error(e.to_reply_text()),
        }
    }
}

/// 工作线程处理的任务：请求、序号、回复通道和回复后要唤醒的连接
pub struct Job {
    pub request: Request,
    pub seq: u64,
    pub reply: fastlane::Sender<(u64, Value)>,
    pub wake: Arc<Notify>,
}

/// 在独立线程上运行执行器，从fastlane通道消费任务
pub struct Worker {
    jobs: fastlane::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(executor: Arc<dyn Executor>) -> SlicedResult<Self> {
        let (jobs, mut rx) = fastlane::channel::<Job>();
        let handle = thread::Builder::new()
            .name("sliced-executor".to_string())
            .spawn(move || {
                info!("executor worker started");
                let mut served: u64 = 0;
                loop {
                    match rx.recv() {
                        Received::Value(job) => {
                            let reply = executor.execute(job.request);
                            job.reply.send((job.seq, reply));
                            job.wake.notify_one();
                            served += 1;
                        }
                        Received::End => break,
                    }
                }
                info!(served, "executor worker stopped");
            })?;
        Ok(Self {
            jobs,
            handle: Some(handle),
        })
    }

    pub fn backend(&self) -> Backend {
        Backend::Worker(self.jobs.clone())
    }

    /// 发送结束标记并等待线程退出
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.jobs.send_end();
            if handle.join().is_err() {
                warn!("executor worker panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 连接到后端的方式
#[derive(Clone)]
pub enum Backend {
    /// 在调用线程上直接执行
    Inline(Arc<dyn Executor>),
    /// 交给工作线程执行
    Worker(fastlane::Sender<Job>),
}

impl Backend {
    pub fn inline(executor: impl Executor + 'static) -> Self {
        Backend::Inline(Arc::new(executor))
    }

    /// 为一个连接建立路由，每个连接有自己的回复通道，`wake` 在回复到达时被通知
    pub fn connect(&self, wake: Arc<Notify>) -> Route {
        match self {
            Backend::Inline(executor) => Route::Inline(executor.clone()),
            Backend::Worker(jobs) => {
                let (reply_tx, replies) = fastlane::channel();
                Route::Worker {
                    jobs: jobs.clone(),
                    reply_tx,
                    replies,
                    wake,
                    seq: 0,
                }
            }
        }
    }
}

/// 提交请求的结果
#[derive(Debug, PartialEq)]
pub enum Submitted {
    /// 已经执行完毕
    Done(Value),
    /// 交给了工作线程，回复稍后带着这个序号到达
    Pending(u64),
}

/// 单个连接的后端路由
pub enum Route {
    Inline(Arc<dyn Executor>),
    Worker {
        jobs: fastlane::Sender<Job>,
        reply_tx: fastlane::Sender<(u64, Value)>,
        replies: fastlane::Receiver<(u64, Value)>,
        wake: Arc<Notify>,
        seq: u64,
    },
}

impl Route {
    /// 提交一个请求，从不阻塞
    pub fn submit(&mut self, request: Request) -> Submitted {
        match self {
            Route::Inline(executor) => Submitted::Done(executor.execute(request)),
            Route::Worker {
                jobs,
                reply_tx,
                wake,
                seq,
                ..
            } => {
                *seq += 1;
                jobs.send(Job {
                    request,
                    seq: *seq,
                    reply: reply_tx.clone(),
                    wake: wake.clone(),
                });
                Submitted::Pending(*seq)
            }
        }
    }

    /// 取出一个已经到达的回复
    pub fn try_reply(&mut self) -> Option<(u64, Value)> {
        match self {
            Route::Inline(_) => None,
            Route::Worker { replies, .. } => match replies.try_recv()? {
                Received::Value(reply) => Some(reply),
                Received::End => None,
            },
        }
    }
}
