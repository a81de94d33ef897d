//! 连接分发契约
//!
//! 事件循环只通过下面四组能力与连接交互，每组都是独立的trait：
//!
//! - `Classify` - 读写连接类型，协议升级时由连接自己改写
//! - `DataHandler` - 输入字节，输出字节和一个 `Action`
//! - `Closer` - 关闭与关闭后的清理
//! - `Detacher` - 把原始双工流一次性移交给外部所有者
//!
//! 同一个连接上的所有调用都在它所属的事件循环线程上串行发生。

use crate::error::{SlicedError, SlicedResult};
use crate::raft::RaftService;
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub type ConnId = u64;

/// 连接类型，接受连接时为 `Command`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnKind {
    Command = 0,
    PubSub = 1,
    Raft = 2,
    Queue = 3,
    Install = 4,
    Http = 5,
    WebSocket = 6,
}

impl ConnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnKind::Command => "command",
            ConnKind::PubSub => "pubsub",
            ConnKind::Raft => "raft",
            ConnKind::Queue => "queue",
            ConnKind::Install => "install",
            ConnKind::Http => "http",
            ConnKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 每次处理输入后交给事件循环的一次性指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// 保持连接，等待更多输入
    None,
    /// 写出输出后关闭连接
    Close,
    /// 写出输出后停止整个服务进程
    Shutdown,
    /// 写出输出后把原始流移交出去，而不是正常关闭
    Detach,
}

/// 写操作要求的持久化级别，本层只负责原样传递
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    None,
    Low,
    #[default]
    Medium,
    High,
}

impl Durability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Durability::None => "none",
            Durability::Low => "low",
            Durability::Medium => "medium",
            Durability::High => "high",
        }
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Durability {
    type Err = SlicedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Durability::None),
            "low" => Ok(Durability::Low),
            "medium" => Ok(Durability::Medium),
            "high" => Ok(Durability::High),
            other => Err(SlicedError::Config(format!("unknown durability '{}'", other))),
        }
    }
}

/// 可以被移交的原始双工流
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

pub type BoxStream = Box<dyn RawStream>;

/// 一次移交：连接类型、连接上已经读到但还没处理的字节、原始流
pub struct Handoff {
    pub conn: ConnId,
    pub kind: ConnKind,
    pub preface: Bytes,
    pub stream: BoxStream,
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handoff")
            .field("conn", &self.conn)
            .field("kind", &self.kind)
            .field("preface", &self.preface.len())
            .finish()
    }
}

/// 接收被移交的流，之后流的读写和关闭都由它负责
pub trait StreamOwner: Send + Sync {
    fn adopt(&self, handoff: Handoff);
}

/// 默认的所有者：在当前tokio运行时上把流读到结束后关闭
#[derive(Debug, Default)]
pub struct DrainOwner;

impl StreamOwner for DrainOwner {
    fn adopt(&self, handoff: Handoff) {
        let Handoff {
            conn, kind, mut stream, ..
        } = handoff;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let drained = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
                    debug!(conn, %kind, ?drained, "detached stream finished");
                });
            }
            Err(_) => debug!(conn, %kind, "no runtime, dropping detached stream"),
        }
    }
}

pub trait Classify {
    fn kind(&self) -> ConnKind;

    fn set_kind(&mut self, kind: ConnKind);
}

pub trait DataHandler {
    /// 处理新到达的输入；还没有完整的帧时返回空输出和 `Action::None`
    fn on_data(&mut self, input: &[u8]) -> (BytesMut, Action);
}

pub trait Closer {
    /// 开始关闭，重复调用没有副作用
    fn close(&mut self) -> SlicedResult<()>;

    /// 传输层释放完毕后调用，最多生效一次
    fn on_closed(&mut self);
}

pub trait Detacher {
    /// 声明要移交原始流，只能成功一次
    fn detach(&mut self) -> SlicedResult<()>;

    /// 接收原始流并负责它的整个生命周期
    fn on_detach(&mut self, stream: BoxStream);
}

/// 命令连接：四组能力加上持久化级别和Raft服务
pub trait CommandConn: Classify + DataHandler + Closer + Detacher {
    fn id(&self) -> ConnId;

    fn durability(&self) -> Durability;

    fn raft(&self) -> Option<Arc<dyn RaftService>>;

    fn set_raft(&mut self, raft: Arc<dyn RaftService>);
}
