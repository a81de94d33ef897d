//! 错误处理模块
//!
//! - `ProtocolError` 只由解码器产生，描述线协议层面的格式错误
//! - `SlicedError` 是整个crate统一的错误类型

use std::io;
use thiserror::Error;

/// 协议错误 - 解码器在输入不符合RESP格式时返回
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// 在找到行终止符之前，行长度已经超过上限
    #[error("long response line")]
    LineTooLong,

    /// 行以 `\n` 结尾但前面不是 `\r`
    #[error("bad response line terminator")]
    BadTerminator,

    /// 空行，没有类型前缀
    #[error("short response line")]
    ShortLine,

    /// 长度字段为空
    #[error("malformed length")]
    MalformedLength,

    /// 长度字段中出现非数字字节
    #[error("illegal bytes in length")]
    IllegalLength,

    /// 整数格式错误
    #[error("malformed integer")]
    MalformedInteger,

    /// 整数超出i64范围
    #[error("integer overflow")]
    IntegerOverflow,

    /// 批量字符串的数据之后不是CRLF
    #[error("bad bulk string format")]
    BadBulkString,

    /// 批量字符串声明的长度超过上限
    #[error("bulk string too long: {len} bytes exceeds {max} byte limit")]
    BulkTooLong { len: usize, max: usize },

    /// 数组嵌套过深
    #[error("nesting too deep: depth exceeds {0}")]
    NestingTooDeep(usize),

    /// 未知的类型前缀
    #[error("unexpected response line")]
    UnexpectedLine,

    /// 简单字符串或错误文本不是合法的UTF-8
    #[error("invalid utf-8 in line")]
    InvalidUtf8,
}

/// crate统一错误类型
#[derive(Debug, Error)]
pub enum SlicedError {
    /// IO错误 - 网络或文件操作失败
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 未知命令
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// 参数数量错误
    #[error("wrong number of arguments for '{0}' command")]
    WrongNumberOfArguments(String),

    /// 类型错误
    #[error("{0}")]
    TypeError(String),

    /// 连接已经被移交给外部所有者
    #[error("connection already detached")]
    Detached,

    /// 连接正在关闭或已经关闭，无法移交
    #[error("connection already closed")]
    Closed,

    /// 后端服务不可用
    #[error("{0} unavailable")]
    Unavailable(&'static str),

    /// 配置错误
    #[error("invalid config: {0}")]
    Config(String),
}

pub type SlicedResult<T> = Result<T, SlicedError>;

impl SlicedError {
    /// 转换为返回给客户端的错误文本，带上Redis惯用的 `ERR ` 前缀
    pub fn to_reply_text(&self) -> String {
        match self {
            SlicedError::TypeError(msg) => msg.clone(),
            other => format!("ERR {}", other),
        }
    }
}
