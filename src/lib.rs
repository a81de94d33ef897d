//! sliced - RESP兼容的命令服务器
//!
//! 这个crate提供三块可以单独使用的部件，以及把它们连起来的服务器：
//!
//! ### 1. RESP值与编解码
//! - `Value` 表示一个协议值，可以编码成RESP字节
//! - `Decoder` 从任意切分的字节流中逐个取出完整的值
//! - 不完整的帧留在缓冲区里，畸形输入返回协议错误
//!
//! ### 2. 连接分发契约
//! - 每个连接有一个类型（`ConnKind`），由命令切换
//! - `on_data` 返回输出字节和一个 `Action`，告诉事件循环下一步做什么
//! - 关闭和移交原始流（detach）都是一次性的生命周期转换
//!
//! ### 3. fastlane通道
//! - 无锁的多生产者单消费者通道
//! - 每个生产者线程有自己的分片，同一生产者的消息保持顺序
//! - 消费者轮询所有分片，没有消息时休眠
//!
//! ## 模块结构
//!
//! - `error` - 错误处理
//! - `value` - RESP值和编码
//! - `decoder` - RESP流式解码
//! - `fastlane` - 分片MPSC通道
//! - `conn` - 连接类型、动作和分发契约
//! - `connection` - 命令连接的具体实现
//! - `store` - 内存键值存储
//! - `command` - 后端命令解析
//! - `executor` - 后端执行器和工作线程
//! - `raft` - Raft服务契约
//! - `pubsub` - 发布订阅
//! - `http` - 命令端口上的HTTP识别
//! - `server` - 多事件循环传输层
//! - `config` - 命令行配置

pub mod command;
pub mod config;
pub mod conn;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod executor;
pub mod fastlane;
pub mod http;
pub mod pubsub;
pub mod raft;
pub mod server;
pub mod store;
pub mod value;

// 重新导出常用类型
pub use conn::{Action, ConnKind, Durability};
pub use decoder::Decoder;
pub use error::{ProtocolError, SlicedError, SlicedResult};
pub use store::Store;
pub use value::Value;

/// 默认端口
pub const DEFAULT_PORT: u16 = 6380;

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
