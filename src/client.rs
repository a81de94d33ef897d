//! sliced命令行客户端
//!
//! 从标准输入读取命令，按RESP数组发送，用 `Decoder` 读取并打印回复。
//! 订阅之后持续打印推送的消息，直到连接关闭。

use anyhow::{bail, Result};
use clap::Parser;
use sliced::value::Value;
use sliced::{Decoder, DEFAULT_PORT};
use std::io::{self, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(author, version, about = "Interactive client for sliced", long_about = None)]
struct Args {
    /// Server host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    println!("连接到 {}...", addr);
    let mut stream = TcpStream::connect(&addr).await?;
    println!("已连接！输入 QUIT 退出。\n");

    let mut decoder = Decoder::new();

    loop {
        print!("{}> ", addr);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let tokens = tokenize(input);
        // 单独一个引号分不出任何词
        let Some(name) = command_name(&tokens) else {
            continue;
        };
        stream.write_all(&to_command(&tokens).to_bytes()).await?;

        let Some(reply) = read_reply(&mut stream, &mut decoder).await? else {
            println!("服务器断开连接");
            return Ok(());
        };
        println!("{}", reply);

        if name == "QUIT" {
            println!("再见！");
            break;
        }
        if name == "SUBSCRIBE" {
            // 已经收到第一个确认，剩下的确认和消息持续打印
            while let Some(message) = read_reply(&mut stream, &mut decoder).await? {
                println!("{}", message);
            }
            println!("服务器断开连接");
            break;
        }
    }

    Ok(())
}

/// 读取一个完整的回复，连接关闭时返回 `None`
async fn read_reply(stream: &mut TcpStream, decoder: &mut Decoder) -> Result<Option<Value>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(value) = decoder.next_value()? {
            return Ok(Some(value));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if !decoder.is_empty() {
                bail!("connection closed in the middle of a reply");
            }
            return Ok(None);
        }
        decoder.feed(&buf[..n]);
    }
}

fn command_name(tokens: &[String]) -> Option<String> {
    tokens.first().map(|first| first.to_ascii_uppercase())
}

fn to_command(tokens: &[String]) -> Value {
    Value::Array(
        tokens
            .iter()
            .map(|s| Value::bulk(s.clone()))
            .collect(),
    )
}

/// 分词器 - 支持单引号和双引号
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), c) if c == q => {
                quote = None;
                tokens.push(std::mem::take(&mut current));
            }
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("SET k v"), vec!["SET", "k", "v"]);
        assert_eq!(tokenize("SET k \"a b\""), vec!["SET", "k", "a b"]);
        assert_eq!(tokenize("ECHO ''"), vec!["ECHO", ""]);
        assert_eq!(tokenize("  PING  "), vec!["PING"]);
    }

    #[test]
    fn test_lone_quote_has_no_command() {
        assert!(tokenize("'").is_empty());
        assert_eq!(command_name(&tokenize("\"")), None);
        assert_eq!(command_name(&tokenize("subscribe news")), Some("SUBSCRIBE".to_string()));
    }

    #[test]
    fn test_to_command() {
        let cmd = to_command(&tokenize("GET key"));
        assert_eq!(cmd.to_bytes().as_ref(), b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }
}
