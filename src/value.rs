//! RESP值类型与编码
//!
//! RESP (REdis Serialization Protocol) 中客户端与服务器交换的所有数据都是 `Value`。
//! 值一旦创建就不再修改，编码时追加到调用者提供的缓冲区。

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const CRLF: &[u8] = b"\r\n";

/// 常用的单例值
pub const OK: Value = Value::Ok;
pub const PONG: Value = Value::Pong;
pub const QUEUED: Value = Value::Queued;
pub const NIL: Value = Value::Nil;
pub const PING: Value = Value::BulkString(Bytes::from_static(b"PING"));

/// RESP值 - 封闭的枚举，编码、比较、描述都通过穷尽匹配完成
#[derive(Debug, Clone)]
pub enum Value {
    /// +OK\r\n
    Ok,
    /// +QUEUED\r\n
    Queued,
    /// +PONG\r\n
    Pong,
    /// 简单字符串: +text\r\n
    SimpleString(String),
    /// 错误: -text\r\n
    Error(String),
    /// 整数: :1000\r\n
    Integer(i64),
    /// 浮点数，按Redis惯例以批量字符串形式编码
    Float(f64),
    /// 批量字符串: $6\r\nfoobar\r\n
    BulkString(Bytes),
    /// 空值: $-1\r\n
    Nil,
    /// 数组: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<Value>),
}

impl Value {
    pub fn simple(s: impl Into<String>) -> Self {
        Value::SimpleString(s.into())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Value::Error(msg.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Value::BulkString(data.into())
    }

    /// 把值的线格式追加到 `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Ok => buf.put_slice(b"+OK\r\n"),
            Value::Queued => buf.put_slice(b"+QUEUED\r\n"),
            Value::Pong => buf.put_slice(b"+PONG\r\n"),
            Value::SimpleString(s) => put_line(buf, b'+', s.as_bytes()),
            Value::Error(e) => put_line(buf, b'-', e.as_bytes()),
            Value::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
            Value::Float(f) => put_bulk(buf, format_float(*f).as_bytes()),
            Value::BulkString(data) => put_bulk(buf, data),
            Value::Nil => buf.put_slice(b"$-1\r\n"),
            Value::Array(items) => {
                put_line(buf, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }

    /// 编码为独立的字节序列
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// 值类型的名称，用于日志和调试
    pub fn describe(&self) -> &'static str {
        match self {
            Value::Ok => "Ok",
            Value::Queued => "Queued",
            Value::Pong => "Pong",
            Value::SimpleString(_) => "SimpleString",
            Value::Error(_) => "Error",
            Value::Integer(_) => "Int",
            Value::Float(_) => "Float",
            Value::BulkString(_) => "BulkString",
            Value::Nil => "Nil",
            Value::Array(_) => "Array",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// 字符串类值的原始内容；单例值返回它们的文本
    pub fn as_text(&self) -> Option<&[u8]> {
        match self {
            Value::Ok => Some(b"OK"),
            Value::Queued => Some(b"QUEUED"),
            Value::Pong => Some(b"PONG"),
            Value::SimpleString(s) | Value::Error(s) => Some(s.as_bytes()),
            Value::BulkString(data) => Some(data),
            _ => None,
        }
    }

    /// 取出批量字符串的字节，用于命令参数
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::BulkString(data) => Some(data),
            Value::SimpleString(s) => Some(Bytes::from(s)),
            Value::Integer(n) => Some(Bytes::from(n.to_string())),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::BulkString(data) => std::str::from_utf8(data).ok()?.parse().ok(),
            _ => None,
        }
    }
}

/// 结构相等：字符串类的值按内容互相比较，数组逐个元素比较全部元素
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Float(a), Value::Float(b)) => same_float(*a, *b),
            (Value::Float(f), other) | (other, Value::Float(f)) => other
                .as_text()
                .and_then(|text| std::str::from_utf8(text).ok())
                .and_then(|text| text.parse::<f64>().ok())
                .map_or(false, |parsed| same_float(parsed, *f)),
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
            }
            (a, b) => match (a.as_text(), b.as_text()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "(integer) {}", n),
            Value::Float(x) => write!(f, "\"{}\"", format_float(*x)),
            Value::Nil => write!(f, "(nil)"),
            Value::Error(e) => write!(f, "(error) {}", e),
            Value::BulkString(data) => write!(f, "\"{}\"", String::from_utf8_lossy(data)),
            Value::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
            other => match other.as_text() {
                Some(text) => write!(f, "{}", String::from_utf8_lossy(text)),
                None => Ok(()),
            },
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<&'static str> for Value {
    fn from(s: &'static str) -> Self {
        Value::BulkString(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Option<Bytes>> for Value {
    fn from(data: Option<Bytes>) -> Self {
        data.map_or(Value::Nil, Value::BulkString)
    }
}

fn put_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(prefix);
    buf.put_slice(body);
    buf.put_slice(CRLF);
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    put_line(buf, b'$', data.len().to_string().as_bytes());
    buf.reserve(data.len() + 2);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// NaN 与 NaN 相等，这样编码再解码后的值仍然等于原值
fn same_float(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        let text = if f > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else {
        f.to_string()
    }
}
