//! Raft服务契约
//!
//! 共识与复制不在本crate内实现，连接只通过 "提交命令、拿到回复" 这一窄接口使用它。
//! 服务不可用时返回普通的错误值，而不是控制流信号。

use crate::conn::{ConnId, ConnKind, Durability};
use crate::error::{SlicedError, SlicedResult};
use crate::executor::{Executor, Request};
use crate::value::Value;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub trait RaftService: Send + Sync {
    /// 连接切换到Raft模式时打开会话
    fn open_session(&self, conn: ConnId) -> SlicedResult<()>;

    /// 提交一条命令并返回状态机的回复
    fn apply(&self, conn: ConnId, args: Vec<Bytes>, durability: Durability) -> Value;

    /// 连接关闭时释放会话
    fn release_session(&self, conn: ConnId);
}

/// 没有配置Raft时使用
#[derive(Debug, Default)]
pub struct Unavailable;

impl RaftService for Unavailable {
    fn open_session(&self, _conn: ConnId) -> SlicedResult<()> {
        Err(SlicedError::Unavailable("raft"))
    }

    fn apply(&self, _conn: ConnId, _args: Vec<Bytes>, _durability: Durability) -> Value {
        Value::Error(SlicedError::Unavailable("raft").to_reply_text())
    }

    fn release_session(&self, _conn: ConnId) {}
}

/// 单节点：每条命令立即提交并应用到本地执行器
pub struct SingleNode {
    executor: Arc<dyn Executor>,
    commit_index: AtomicU64,
    sessions: Mutex<HashSet<ConnId>>,
}

impl SingleNode {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            commit_index: AtomicU64::new(0),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl RaftService for SingleNode {
    fn open_session(&self, conn: ConnId) -> SlicedResult<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn);
        debug!(conn, "raft session opened");
        Ok(())
    }

    fn apply(&self, conn: ConnId, args: Vec<Bytes>, durability: Durability) -> Value {
        let known = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&conn);
        if !known {
            return Value::error("ERR no raft session");
        }
        let index = self.commit_index.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(conn, index, %durability, "raft entry committed");
        self.executor.execute(Request {
            args,
            kind: ConnKind::Raft,
            durability,
        })
    }

    fn release_session(&self, conn: ConnId) {
        if self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn)
        {
            debug!(conn, "raft session released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StoreExecutor;

    fn args(parts: &[&'static str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::from_static(p.as_bytes()))
            .collect()
    }

    #[test]
    fn test_unavailable() {
        assert!(Unavailable.open_session(1).is_err());
        let reply = Unavailable.apply(1, args(&["GET", "k"]), Durability::High);
        assert_eq!(reply, Value::error("ERR raft unavailable"));
    }

    #[test]
    fn test_single_node_requires_session() {
        let raft = SingleNode::new(Arc::new(StoreExecutor::default()));
        assert!(raft.apply(7, args(&["SET", "k", "v"]), Durability::Low).is_error());

        raft.open_session(7).unwrap();
        assert_eq!(raft.apply(7, args(&["SET", "k", "v"]), Durability::Low), Value::Ok);
        assert_eq!(raft.apply(7, args(&["GET", "k"]), Durability::Low), Value::bulk("v"));
        assert_eq!(raft.commit_index(), 2);

        raft.release_session(7);
        assert_eq!(raft.session_count(), 0);
    }
}
