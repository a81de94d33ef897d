//! 服务端配置 - 命令行参数

use crate::conn::Durability;
use crate::connection::Services;
use crate::decoder::{Limits, DEFAULT_MAX_BULK, DEFAULT_MAX_DEPTH, DEFAULT_MAX_LINE};
use crate::error::{SlicedError, SlicedResult};
use crate::executor::{Backend, Executor, StoreExecutor, Worker};
use crate::raft::{SingleNode, Unavailable};
use crate::DEFAULT_PORT;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RaftMode {
    /// RAFT命令返回不可用错误
    None,
    /// 单节点，命令立即提交
    Single,
}

/// 新连接分配到事件循环的策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Balance {
    /// 随机选一个事件循环
    Random,
    /// 依次轮流
    #[default]
    RoundRobin,
    /// 选活跃连接最少的事件循环
    LeastConnections,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "RESP-compatible command server", long_about = None)]
pub struct Config {
    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of event loop threads.
    #[arg(long, default_value_t = default_loops())]
    pub loops: usize,

    /// Durability level passed to the backend (none, low, medium, high).
    #[arg(long, default_value = "medium")]
    pub durability: Durability,

    /// Longest accepted protocol line in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE)]
    pub max_line: usize,

    /// Longest accepted bulk string in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BULK)]
    pub max_bulk: usize,

    /// Raft service behind the RAFT command.
    #[arg(long, value_enum, default_value_t = RaftMode::None)]
    pub raft: RaftMode,

    /// Run the backend on a dedicated worker thread.
    #[arg(long)]
    pub worker: bool,

    /// How new connections are spread over the event loops.
    #[arg(long, value_enum, default_value_t = Balance::RoundRobin)]
    pub balance: Balance,

    /// Also accept connections on this unix socket path.
    #[arg(long)]
    pub unixsocket: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            loops: default_loops(),
            durability: Durability::default(),
            max_line: DEFAULT_MAX_LINE,
            max_bulk: DEFAULT_MAX_BULK,
            raft: RaftMode::None,
            worker: false,
            balance: Balance::default(),
            unixsocket: None,
        }
    }
}

fn default_loops() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl Config {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_line: self.max_line,
            max_bulk: self.max_bulk,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    pub fn validate(&self) -> SlicedResult<()> {
        if self.loops == 0 {
            return Err(SlicedError::Config("--loops must be at least 1".to_string()));
        }
        if self.max_line < 16 {
            return Err(SlicedError::Config("--max-line must be at least 16".to_string()));
        }
        Ok(())
    }

    /// 组装连接共享的服务；使用工作线程时一并返回它，调用方负责让它活到服务结束
    pub fn build(&self) -> SlicedResult<(Services, Option<Worker>)> {
        self.validate()?;

        let executor: Arc<dyn Executor> = Arc::new(StoreExecutor::default());
        let (backend, worker) = if self.worker {
            let worker = Worker::spawn(executor.clone())?;
            (worker.backend(), Some(worker))
        } else {
            (Backend::Inline(executor.clone()), None)
        };

        let mut services = Services::new(backend)
            .with_durability(self.durability)
            .with_limits(self.limits());
        services = match self.raft {
            RaftMode::None => services.with_raft(Arc::new(Unavailable)),
            RaftMode::Single => services.with_raft(Arc::new(SingleNode::new(executor))),
        };
        Ok((services, worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["sliced-server"]).unwrap();
        assert_eq!(config.port, 6380);
        assert_eq!(config.durability, Durability::Medium);
        assert_eq!(config.raft, RaftMode::None);
        assert_eq!(config.limits(), Limits::default());
        assert_eq!(config.addr(), "127.0.0.1:6380");
        assert_eq!(config.balance, Balance::RoundRobin);
        assert_eq!(config.unixsocket, None);
    }

    #[test]
    fn test_parse_flags() {
        let config = Config::try_parse_from([
            "sliced-server",
            "--port",
            "7000",
            "--loops",
            "4",
            "--durability",
            "HIGH",
            "--raft",
            "single",
            "--worker",
            "--balance",
            "least-connections",
            "--unixsocket",
            "/tmp/sliced.sock",
        ])
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.loops, 4);
        assert_eq!(config.durability, Durability::High);
        assert_eq!(config.raft, RaftMode::Single);
        assert!(config.worker);
        assert_eq!(config.balance, Balance::LeastConnections);
        assert_eq!(config.unixsocket, Some(PathBuf::from("/tmp/sliced.sock")));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::try_parse_from(["sliced-server", "--durability", "max"]).is_err());
        assert!(Config::try_parse_from(["sliced-server", "--balance", "fastest"]).is_err());

        let config = Config {
            loops: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SlicedError::Config(_))));
    }

    #[test]
    fn test_build_services() {
        let config = Config {
            raft: RaftMode::Single,
            durability: Durability::Low,
            ..Config::default()
        };
        let (services, worker) = config.build().unwrap();
        assert!(worker.is_none());
        assert_eq!(services.durability, Durability::Low);
        assert!(services.raft.is_some());
    }
}
