//! 后端命令解析
//!
//! 连接层已经把命令拆成参数列表，这里只负责识别命令名和校验参数。

use crate::error::{SlicedError, SlicedResult};
use bytes::Bytes;

/// 后端支持的命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: Bytes },
    Set {
        key: Bytes,
        value: Bytes,
        nx: bool, // 仅当键不存在时设置
        xx: bool, // 仅当键存在时设置
    },
    GetSet { key: Bytes, value: Bytes },
    Append { key: Bytes, value: Bytes },
    Strlen { key: Bytes },
    /// INCR / INCRBY / DECR / DECRBY 统一为加法
    IncrBy { key: Bytes, delta: i64 },
    MGet { keys: Vec<Bytes> },
    MSet { pairs: Vec<(Bytes, Bytes)> },
    Del { keys: Vec<Bytes> },
    Exists { keys: Vec<Bytes> },
    Keys { pattern: Bytes },
    DbSize,
    FlushDb,
    Info,
}

impl Command {
    /// 从参数列表解析命令，`args[0]` 是命令名
    pub fn parse(args: &[Bytes]) -> SlicedResult<Command> {
        let (name, rest) = args
            .split_first()
            .ok_or_else(|| SlicedError::UnknownCommand(String::new()))?;
        let lower = String::from_utf8_lossy(name).to_ascii_lowercase();

        match lower.as_str() {
            "get" => {
                require_args(&lower, rest, 1)?;
                Ok(Command::Get {
                    key: rest[0].clone(),
                })
            }

            "set" => {
                require_min_args(&lower, rest, 2)?;
                let mut nx = false;
                let mut xx = false;
                for opt in &rest[2..] {
                    match opt.to_ascii_uppercase().as_slice() {
                        b"NX" => nx = true,
                        b"XX" => xx = true,
                        _ => return Err(SlicedError::TypeError("ERR syntax error".to_string())),
                    }
                }
                if nx && xx {
                    return Err(SlicedError::TypeError("ERR syntax error".to_string()));
                }
                Ok(Command::Set {
                    key: rest[0].clone(),
                    value: rest[1].clone(),
                    nx,
                    xx,
                })
            }

            "getset" => {
                require_args(&lower, rest, 2)?;
                Ok(Command::GetSet {
                    key: rest[0].clone(),
                    value: rest[1].clone(),
                })
            }

            "append" => {
                require_args(&lower, rest, 2)?;
                Ok(Command::Append {
                    key: rest[0].clone(),
                    value: rest[1].clone(),
                })
            }

            "strlen" => {
                require_args(&lower, rest, 1)?;
                Ok(Command::Strlen {
                    key: rest[0].clone(),
                })
            }

            "incr" | "decr" => {
                require_args(&lower, rest, 1)?;
                Ok(Command::IncrBy {
                    key: rest[0].clone(),
                    delta: if lower == "incr" { 1 } else { -1 },
                })
            }

            "incrby" | "decrby" => {
                require_args(&lower, rest, 2)?;
                let delta = get_integer(&rest[1])?;
                let delta = if lower == "incrby" {
                    delta
                } else {
                    delta.checked_neg().ok_or_else(not_an_integer)?
                };
                Ok(Command::IncrBy {
                    key: rest[0].clone(),
                    delta,
                })
            }

            "mget" => {
                require_min_args(&lower, rest, 1)?;
                Ok(Command::MGet {
                    keys: rest.to_vec(),
                })
            }

            "mset" => {
                if rest.is_empty() || rest.len() % 2 != 0 {
                    return Err(SlicedError::WrongNumberOfArguments(lower));
                }
                let pairs = rest
                    .chunks(2)
                    .map(|pair| (pair[0].clone(), pair[1].clone()))
                    .collect();
                Ok(Command::MSet { pairs })
            }

            "del" => {
                require_min_args(&lower, rest, 1)?;
                Ok(Command::Del {
                    keys: rest.to_vec(),
                })
            }

            "exists" => {
                require_min_args(&lower, rest, 1)?;
                Ok(Command::Exists {
                    keys: rest.to_vec(),
                })
            }

            "keys" => {
                require_args(&lower, rest, 1)?;
                Ok(Command::Keys {
                    pattern: rest[0].clone(),
                })
            }

            "dbsize" => Ok(Command::DbSize),

            "flushdb" | "flushall" => Ok(Command::FlushDb),

            "info" => Ok(Command::Info),

            _ => Err(SlicedError::UnknownCommand(
                String::from_utf8_lossy(name).into_owned(),
            )),
        }
    }
}

/// 检查参数数量是否正确
fn require_args(cmd: &str, args: &[Bytes], expected: usize) -> SlicedResult<()> {
    if args.len() != expected {
        Err(SlicedError::WrongNumberOfArguments(cmd.to_string()))
    } else {
        Ok(())
    }
}

/// 检查最少参数数量
fn require_min_args(cmd: &str, args: &[Bytes], min: usize) -> SlicedResult<()> {
    if args.len() < min {
        Err(SlicedError::WrongNumberOfArguments(cmd.to_string()))
    } else {
        Ok(())
    }
}

fn get_integer(arg: &Bytes) -> SlicedResult<i64> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(not_an_integer)
}

fn not_an_integer() -> SlicedError {
    SlicedError::TypeError("ERR value is not an integer or out of range".to_string())
}
