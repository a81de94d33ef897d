//! 命令端口上的HTTP识别
//!
//! 新连接的第一行如果是HTTP请求行（`GET /path HTTP/1.1`），连接就被改写为HTTP类型。
//! 普通请求得到一个状态响应后关闭；WebSocket升级请求则把原始流移交出去。

use bytes::{BufMut, BytesMut};

/// 请求头的最大长度，超过后不再当作HTTP处理
pub const MAX_HEAD: usize = 8192;

const METHODS: [&[u8]; 7] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"HEAD ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    /// 请求头（含结尾空行）的字节数
    pub head_len: usize,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map_or(false, |v| v.eq_ignore_ascii_case("websocket"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniff {
    /// 不是HTTP，交给RESP解码器
    NotHttp,
    /// 看起来是HTTP，但请求头还没收全
    Incomplete,
    Request(Request),
}

/// 检查缓冲区开头是否是一个HTTP请求
pub fn sniff(buf: &[u8]) -> Sniff {
    if buf.is_empty() {
        return Sniff::NotHttp;
    }
    let maybe_method = METHODS
        .iter()
        .any(|m| buf.starts_with(m) || m.starts_with(buf));
    if !maybe_method {
        return Sniff::NotHttp;
    }

    let head = &buf[..buf.len().min(MAX_HEAD)];
    let Some(line_end) = head.iter().position(|&b| b == b'\n') else {
        return if buf.len() >= MAX_HEAD {
            Sniff::NotHttp
        } else {
            Sniff::Incomplete
        };
    };

    let line = String::from_utf8_lossy(trim_cr(&head[..line_end])).into_owned();
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/1.") {
        // `GET key` 这样的内联命令
        return Sniff::NotHttp;
    }

    let Some(head_len) = find_head_end(head) else {
        return if buf.len() >= MAX_HEAD {
            Sniff::NotHttp
        } else {
            Sniff::Incomplete
        };
    };

    let headers = head[line_end + 1..head_len]
        .split(|&b| b == b'\n')
        .map(trim_cr)
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            let text = String::from_utf8_lossy(l);
            let (name, value) = text.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Sniff::Request(Request {
        method: parts[0].to_string(),
        path: parts[1].to_string(),
        version: parts[2].to_string(),
        headers,
        head_len,
    })
}

/// 对普通HTTP请求的响应
pub fn respond(req: &Request) -> BytesMut {
    let (status, body) = match (req.method.as_str(), req.path.as_str()) {
        ("GET" | "HEAD", "/" | "/health") => ("200 OK", format!("sliced {}\n", crate::VERSION)),
        ("GET" | "HEAD", _) => ("404 Not Found", "not found\n".to_string()),
        _ => ("405 Method Not Allowed", "method not allowed\n".to_string()),
    };

    let mut out = BytesMut::new();
    out.put_slice(
        format!(
            "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        )
        .as_bytes(),
    );
    if req.method != "HEAD" {
        out.put_slice(body.as_bytes());
    }
    out
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// 空行之后的位置
fn find_head_end(buf: &[u8]) -> Option<usize> {
    if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some(i + 4);
    }
    buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2)
}
