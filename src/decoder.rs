//! RESP流式解码器
//!
//! 解码器缓存尚未成帧的输入，每次调用最多取出一个完整的值。
//! 不完整的帧保留在缓冲区中，直到后续输入把它补齐；一个值之后的字节永远不会被消费。

use crate::error::ProtocolError;
use crate::value::Value;
use bytes::{Buf, Bytes, BytesMut};

/// 单行最大长度（不含CRLF）
pub const DEFAULT_MAX_LINE: usize = 4096;
/// 批量字符串最大长度
pub const DEFAULT_MAX_BULK: usize = 512 * 1024 * 1024;
/// 数组最大嵌套深度
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// 解码限制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_line: usize,
    pub max_bulk: usize,
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_line: DEFAULT_MAX_LINE,
            max_bulk: DEFAULT_MAX_BULK,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// 未完成帧的扫描进度
///
/// 扫描只校验帧结构、不构造值，下次输入到达时从 `pos` 继续，
/// 所以一个大数组分多次到达时总的工作量与帧长度成线性关系。
#[derive(Debug, Default)]
struct Scan {
    /// 下一个待扫描的位置，相对缓冲区开头
    pos: usize,
    /// 每层尚未扫描的数组元素个数
    pending: Vec<usize>,
}

/// 解码器 - 每个连接独占一个实例
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
    limits: Limits,
    scan: Scan,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buf: BytesMut::new(),
            limits,
            scan: Scan::default(),
        }
    }

    /// 追加新到达的输入
    pub fn feed(&mut self, input: &[u8]) {
        self.buf.extend_from_slice(input);
    }

    /// 尚未被消费的字节
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// 丢弃缓冲区开头的 `n` 个字节
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
        self.scan = Scan::default();
    }

    /// 取走缓冲区中剩余的全部字节
    pub fn take_buffered(&mut self) -> Bytes {
        self.scan = Scan::default();
        self.buf.split().freeze()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 解码下一个完整的值
    ///
    /// 返回 `Ok(None)` 表示数据还不完整，缓冲区保持不变。
    pub fn next_value(&mut self) -> Result<Option<Value>, ProtocolError> {
        let Some(end) = self.scan_frame()? else {
            return Ok(None);
        };
        self.scan = Scan::default();
        let frame = self.buf.split_to(end).freeze();
        let mut pos = 0;
        build(&frame, &mut pos).map(Some)
    }

    /// 继续扫描缓冲区开头的帧，帧完整时返回它的长度
    fn scan_frame(&mut self) -> Result<Option<usize>, ProtocolError> {
        let limits = self.limits;
        let scan = &mut self.scan;
        let buf = &self.buf[..];

        loop {
            let rest = &buf[scan.pos..];
            let Some((line, used)) = read_line(rest, limits.max_line)? else {
                return Ok(None);
            };
            let (&prefix, body) = line.split_first().ok_or(ProtocolError::ShortLine)?;

            match prefix {
                b'+' | b'-' => {
                    std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)?;
                    scan.pos += used;
                }
                b':' => {
                    parse_int(body)?;
                    scan.pos += used;
                }
                b'$' => match parse_len(body)? {
                    None => scan.pos += used,
                    Some(len) => {
                        if len > limits.max_bulk {
                            return Err(ProtocolError::BulkTooLong {
                                len,
                                max: limits.max_bulk,
                            });
                        }
                        let end = used + len;
                        // 数据不全时不前进，下次只重读这一行头
                        if rest.len() < end + 2 {
                            return Ok(None);
                        }
                        if &rest[end..end + 2] != b"\r\n" {
                            return Err(ProtocolError::BadBulkString);
                        }
                        scan.pos += end + 2;
                    }
                },
                b'*' => match parse_len(body)? {
                    None | Some(0) => scan.pos += used,
                    Some(count) => {
                        if scan.pending.len() >= limits.max_depth {
                            return Err(ProtocolError::NestingTooDeep(limits.max_depth));
                        }
                        scan.pos += used;
                        scan.pending.push(count);
                        continue;
                    }
                },
                _ => return Err(ProtocolError::UnexpectedLine),
            }

            // 完成了一个值，逐层向上结算
            loop {
                match scan.pending.last_mut() {
                    None => return Ok(Some(scan.pos)),
                    Some(left) => {
                        *left -= 1;
                        if *left > 0 {
                            break;
                        }
                        scan.pending.pop();
                    }
                }
            }
        }
    }

    /// 解码下一条客户端命令
    ///
    /// 以 `*` 开头的是标准的多批量格式，其余按内联命令处理（如 `PING\r\n`），
    /// 内联命令按空白切分为批量字符串数组，空行被跳过。
    pub fn next_command(&mut self) -> Result<Option<Value>, ProtocolError> {
        loop {
            match self.buf.first().copied() {
                None => return Ok(None),
                Some(b'*') => return self.next_value(),
                Some(_) => {}
            }

            let (line, used) = match read_inline(&self.buf, self.limits.max_line)? {
                Some(found) => found,
                None => return Ok(None),
            };
            let args: Vec<Value> = line
                .split(|b| b.is_ascii_whitespace())
                .filter(|part| !part.is_empty())
                .map(|part| Value::BulkString(Bytes::copy_from_slice(part)))
                .collect();
            self.buf.advance(used);
            self.scan = Scan::default();

            if !args.is_empty() {
                return Ok(Some(Value::Array(args)));
            }
        }
    }
}

/// 从已经扫描过的完整帧中构造值，批量字符串直接切片共享帧的内存
fn build(frame: &Bytes, pos: &mut usize) -> Result<Value, ProtocolError> {
    let rest = &frame[*pos..];
    let end = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ProtocolError::ShortLine)?;
    let line = rest[..end]
        .strip_suffix(b"\r")
        .ok_or(ProtocolError::BadTerminator)?;
    let (&prefix, body) = line.split_first().ok_or(ProtocolError::ShortLine)?;
    let start = *pos + end + 1;
    *pos = start;

    let value = match prefix {
        b'+' => match body {
            // 高频回复直接使用单例
            b"OK" => Value::Ok,
            b"PONG" => Value::Pong,
            b"QUEUED" => Value::Queued,
            text => Value::SimpleString(utf8(text)?),
        },
        b'-' => Value::Error(utf8(body)?),
        b':' => Value::Integer(parse_int(body)?),
        b'$' => match parse_len(body)? {
            None => Value::Nil,
            Some(len) => {
                *pos = start + len + 2;
                Value::BulkString(frame.slice(start..start + len))
            }
        },
        b'*' => match parse_len(body)? {
            None => Value::Nil,
            Some(count) => {
                // 声明的数量不可信，预分配设上限
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(build(frame, pos)?);
                }
                Value::Array(items)
            }
        },
        _ => return Err(ProtocolError::UnexpectedLine),
    };
    Ok(value)
}

/// 读取一行，返回 (行内容不含CRLF, 含CRLF的总长度)
fn read_line(buf: &[u8], max_line: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let window = &buf[..buf.len().min(max_line + 2)];
    match window.iter().position(|&b| b == b'\n') {
        Some(i) => {
            if i == 0 || buf[i - 1] != b'\r' {
                return Err(ProtocolError::BadTerminator);
            }
            Ok(Some((&buf[..i - 1], i + 1)))
        }
        None if buf.len() > max_line + 1 => Err(ProtocolError::LineTooLong),
        None => Ok(None),
    }
}

/// 内联命令允许只用 `\n` 结尾
fn read_inline(buf: &[u8], max_line: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let window = &buf[..buf.len().min(max_line + 2)];
    match window.iter().position(|&b| b == b'\n') {
        Some(i) => {
            let line = &buf[..i];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            Ok(Some((line, i + 1)))
        }
        None if buf.len() > max_line + 1 => Err(ProtocolError::LineTooLong),
        None => Ok(None),
    }
}

/// 解析批量字符串和数组的长度，`-1` 表示空值
fn parse_len(p: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if p.is_empty() {
        return Err(ProtocolError::MalformedLength);
    }
    if p == b"-1" {
        return Ok(None);
    }

    let mut n: usize = 0;
    for &b in p {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::IllegalLength);
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add((b - b'0') as usize))
            .ok_or(ProtocolError::MalformedLength)?;
    }
    Ok(Some(n))
}

/// 解析整数回复：只接受ASCII数字和一个可选的前导负号
pub fn parse_int(p: &[u8]) -> Result<i64, ProtocolError> {
    let (negate, digits) = match p.split_first() {
        None => return Err(ProtocolError::MalformedInteger),
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, p),
    };
    if digits.is_empty() {
        return Err(ProtocolError::MalformedInteger);
    }

    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::MalformedInteger);
        }
        let d = (b - b'0') as i64;
        // 负数直接向下累加，这样 i64::MIN 也能表示
        n = n
            .checked_mul(10)
            .and_then(|n| if negate { n.checked_sub(d) } else { n.checked_add(d) })
            .ok_or(ProtocolError::IntegerOverflow)?;
    }
    Ok(n)
}

fn utf8(p: &[u8]) -> Result<String, ProtocolError> {
    String::from_utf8(p.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn decode_all(input: &[u8]) -> Vec<Value> {
        let mut decoder = Decoder::new();
        decoder.feed(input);
        let mut out = Vec::new();
        while let Some(value) = decoder.next_value().unwrap() {
            out.push(value);
        }
        out
    }

    fn decode_one(input: &[u8]) -> Result<Option<Value>, ProtocolError> {
        let mut decoder = Decoder::new();
        decoder.feed(input);
        decoder.next_value()
    }

    #[test]
    fn test_decode_ping_with_empty_bulk() {
        let values = decode_all(b"*2\r\n$4\r\nPING\r\n$0\r\n\r\n");
        assert_eq!(
            values,
            vec![Value::Array(vec![Value::bulk("PING"), Value::bulk("")])]
        );
    }

    #[test]
    fn test_null_bulk_differs_from_empty_bulk() {
        let null = decode_one(b"$-1\r\n").unwrap().unwrap();
        let empty = decode_one(b"$0\r\n\r\n").unwrap().unwrap();
        assert!(null.is_nil());
        assert!(matches!(&empty, Value::BulkString(b) if b.is_empty()));
        assert_ne!(null, empty);
    }

    #[test]
    fn test_empty_array_and_null_array() {
        let empty = decode_one(b"*0\r\n").unwrap().unwrap();
        assert!(matches!(&empty, Value::Array(items) if items.is_empty()));

        let null = decode_one(b"*-1\r\n").unwrap().unwrap();
        assert!(null.is_nil());

        assert_eq!(decode_one(b"*-2\r\n"), Err(ProtocolError::IllegalLength));
    }

    #[test]
    fn test_singletons_decode() {
        assert!(matches!(decode_one(b"+OK\r\n"), Ok(Some(Value::Ok))));
        assert!(matches!(decode_one(b"+PONG\r\n"), Ok(Some(Value::Pong))));
        assert!(matches!(decode_one(b"+QUEUED\r\n"), Ok(Some(Value::Queued))));
        assert!(matches!(
            decode_one(b"+OKAY\r\n"),
            Ok(Some(Value::SimpleString(s))) if s == "OKAY"
        ));
    }

    #[test]
    fn test_integers() {
        assert_eq!(decode_one(b":1000\r\n").unwrap(), Some(Value::Integer(1000)));
        assert_eq!(decode_one(b":-42\r\n").unwrap(), Some(Value::Integer(-42)));
        assert_eq!(
            decode_one(b":-9223372036854775808\r\n").unwrap(),
            Some(Value::Integer(i64::MIN))
        );
        assert_eq!(
            decode_one(b":9223372036854775808\r\n"),
            Err(ProtocolError::IntegerOverflow)
        );
        assert_eq!(decode_one(b":12a\r\n"), Err(ProtocolError::MalformedInteger));
        assert_eq!(decode_one(b":-\r\n"), Err(ProtocolError::MalformedInteger));
        assert_eq!(decode_one(b":+5\r\n"), Err(ProtocolError::MalformedInteger));
    }

    #[test]
    fn test_protocol_errors() {
        assert_eq!(decode_one(b"$abc\r\n"), Err(ProtocolError::IllegalLength));
        assert_eq!(decode_one(b"$\r\n"), Err(ProtocolError::MalformedLength));
        assert_eq!(decode_one(b"$3\r\nfoobar\r\n"), Err(ProtocolError::BadBulkString));
        assert_eq!(decode_one(b"+OK\n"), Err(ProtocolError::BadTerminator));
        assert_eq!(decode_one(b"\r\n"), Err(ProtocolError::ShortLine));
        assert_eq!(decode_one(b"?what\r\n"), Err(ProtocolError::UnexpectedLine));
    }

    #[test]
    fn test_line_too_long() {
        let mut decoder = Decoder::with_limits(Limits {
            max_line: 8,
            ..Limits::default()
        });
        decoder.feed(b"+0123456");
        assert_eq!(decoder.next_value(), Ok(None));
        decoder.feed(b"789abc");
        assert_eq!(decoder.next_value(), Err(ProtocolError::LineTooLong));
    }

    #[test]
    fn test_bulk_too_long() {
        let mut decoder = Decoder::with_limits(Limits {
            max_bulk: 4,
            ..Limits::default()
        });
        decoder.feed(b"$5\r\nhello\r\n");
        assert_eq!(
            decoder.next_value(),
            Err(ProtocolError::BulkTooLong { len: 5, max: 4 })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut decoder = Decoder::with_limits(Limits {
            max_depth: 2,
            ..Limits::default()
        });
        decoder.feed(b"*1\r\n*1\r\n*1\r\n:1\r\n");
        assert_eq!(decoder.next_value(), Err(ProtocolError::NestingTooDeep(2)));
    }

    #[test]
    fn test_child_error_propagates() {
        assert_eq!(
            decode_one(b"*2\r\n:1\r\n$x\r\n"),
            Err(ProtocolError::IllegalLength)
        );
    }

    #[test]
    fn test_incomplete_leaves_buffer_intact() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*2\r\n$3\r\nfoo\r\n$3\r\nba");
        assert_eq!(decoder.next_value(), Ok(None));
        assert_eq!(decoder.buffered().len(), 19);
        decoder.feed(b"r\r\n");
        assert_eq!(
            decoder.next_value().unwrap(),
            Some(Value::Array(vec![Value::bulk("foo"), Value::bulk("bar")]))
        );
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_no_over_read() {
        let mut decoder = Decoder::new();
        decoder.feed(b":1\r\n$5\r\nhel");
        assert_eq!(decoder.next_value().unwrap(), Some(Value::Integer(1)));
        assert_eq!(decoder.next_value(), Ok(None));
        assert_eq!(decoder.buffered(), b"$5\r\nhel");
    }

    #[test]
    fn test_round_trip() {
        let values = vec![
            Value::Ok,
            Value::Pong,
            Value::Queued,
            Value::simple("hello world"),
            Value::error("ERR something"),
            Value::Integer(0),
            Value::Integer(-123456789),
            Value::Integer(i64::MAX),
            Value::bulk(""),
            Value::bulk(&b"bin\r\nary\x00"[..]),
            Value::Array(vec![]),
            Value::Array(vec![
                Value::Integer(1),
                Value::Array(vec![Value::bulk("nested"), Value::Nil]),
                Value::simple("x"),
            ]),
        ];
        for value in values {
            let encoded = value.to_bytes();
            let decoded = decode_one(&encoded).unwrap().unwrap();
            assert_eq!(decoded, value, "round trip of {}", value.describe());
            assert_eq!(decoded.describe(), value.describe());
        }
    }

    #[test]
    fn test_non_finite_floats_round_trip() {
        for f in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.5, -0.25] {
            let value = Value::Float(f);
            let decoded = decode_one(&value.to_bytes()).unwrap().unwrap();
            assert_eq!(decoded, value, "round trip of {}", f);
        }
    }

    #[test]
    fn test_large_array_scans_incrementally() {
        let n = 200_000;
        let mut wire = BytesMut::new();
        wire.extend_from_slice(format!("*{}\r\n", n).as_bytes());
        for _ in 0..n {
            wire.extend_from_slice(b"$1\r\nx\r\n");
        }

        let mut decoder = Decoder::new();
        let started = std::time::Instant::now();
        let mut decoded = None;
        let mut last_pos = 0;
        for chunk in wire.chunks(16 * 1024) {
            decoder.feed(chunk);
            match decoder.next_value().unwrap() {
                Some(value) => decoded = Some(value),
                None => {
                    // 扫描位置只前进，并且停在最后一个完整元素之后
                    assert!(decoder.scan.pos >= last_pos);
                    assert!(decoder.buffered().len() - decoder.scan.pos < 7);
                    last_pos = decoder.scan.pos;
                }
            }
        }

        let Some(Value::Array(items)) = decoded else {
            panic!("expected the array to complete");
        };
        assert_eq!(items.len(), n);
        assert!(decoder.is_empty());
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_bulk_shares_frame_memory() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
        let Some(Value::Array(items)) = decoder.next_value().unwrap() else {
            panic!("expected array");
        };
        let (Value::BulkString(a), Value::BulkString(b)) = (&items[0], &items[1]) else {
            panic!("expected bulk strings");
        };
        // 两个切片来自同一块帧内存
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 9);
    }

    #[test]
    fn test_fragmented_pipeline() {
        let mut rng = rand::thread_rng();
        let commands: Vec<Value> = (0..50)
            .map(|i| {
                Value::Array(vec![
                    Value::bulk("SET"),
                    Value::bulk(format!("key:{}", i)),
                    Value::bulk("v".repeat(i * 7)),
                ])
            })
            .collect();
        let mut wire = BytesMut::new();
        for cmd in &commands {
            cmd.encode(&mut wire);
        }

        for _ in 0..20 {
            let mut decoder = Decoder::new();
            let mut decoded = Vec::new();
            let mut pos = 0;
            while pos < wire.len() {
                let step = rng.gen_range(1..=16).min(wire.len() - pos);
                decoder.feed(&wire[pos..pos + step]);
                pos += step;
                while let Some(value) = decoder.next_value().unwrap() {
                    decoded.push(value);
                }
            }
            assert_eq!(decoded.len(), commands.len());
            assert_eq!(decoded, commands);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_split_inside_length_field() {
        let mut decoder = Decoder::new();
        decoder.feed(b"$1");
        assert_eq!(decoder.next_value(), Ok(None));
        decoder.feed(b"2\r\nhello world!\r");
        assert_eq!(decoder.next_value(), Ok(None));
        decoder.feed(b"\n");
        assert_eq!(decoder.next_value().unwrap(), Some(Value::bulk("hello world!")));
    }

    #[test]
    fn test_inline_commands() {
        let mut decoder = Decoder::new();
        decoder.feed(b"PING\r\n\r\nSET  a   b\nGET a");
        assert_eq!(
            decoder.next_command().unwrap(),
            Some(Value::Array(vec![Value::bulk("PING")]))
        );
        assert_eq!(
            decoder.next_command().unwrap(),
            Some(Value::Array(vec![
                Value::bulk("SET"),
                Value::bulk("a"),
                Value::bulk("b")
            ]))
        );
        assert_eq!(decoder.next_command(), Ok(None));
        assert_eq!(decoder.buffered(), b"GET a");
    }

    #[test]
    fn test_multibulk_command() {
        let mut decoder = Decoder::new();
        decoder.feed(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(
            decoder.next_command().unwrap(),
            Some(Value::Array(vec![Value::bulk("PING")]))
        );
    }
}
