//! 内存键值存储 - 后端执行器的状态机
//!
//! 只实现字符串类型，满足协议层端到端运行的需要。

use crate::error::{SlicedError, SlicedResult};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 线程安全的键值存储，克隆后共享同一份数据
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<HashMap<Bytes, Bytes>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // 锁中毒时继续使用内部数据，存储的每个操作都不会留下半完成的状态
    fn read(&self) -> RwLockReadGuard<'_, HashMap<Bytes, Bytes>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Bytes, Bytes>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: Bytes, value: Bytes) {
        self.write().insert(key, value);
    }

    /// 按 NX / XX 条件设置，返回是否写入
    pub fn set_if(&self, key: Bytes, value: Bytes, nx: bool, xx: bool) -> bool {
        let mut map = self.write();
        let exists = map.contains_key(&key);
        if (nx && exists) || (xx && !exists) {
            return false;
        }
        map.insert(key, value);
        true
    }

    /// 设置新值并返回旧值
    pub fn getset(&self, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.write().insert(key, value)
    }

    /// 追加并返回新长度
    pub fn append(&self, key: Bytes, suffix: &[u8]) -> usize {
        let mut map = self.write();
        let mut joined = BytesMut::new();
        if let Some(old) = map.get(&key) {
            joined.extend_from_slice(old);
        }
        joined.extend_from_slice(suffix);
        let len = joined.len();
        map.insert(key, joined.freeze());
        len
    }

    pub fn strlen(&self, key: &[u8]) -> usize {
        self.read().get(key).map_or(0, |v| v.len())
    }

    /// 整数加法，键不存在时按0处理
    pub fn incr_by(&self, key: Bytes, delta: i64) -> SlicedResult<i64> {
        let mut map = self.write();
        let current = match map.get(&key) {
            Some(v) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(not_an_integer)?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(|| {
            SlicedError::TypeError("ERR increment or decrement would overflow".to_string())
        })?;
        map.insert(key, Bytes::from(next.to_string()));
        Ok(next)
    }

    pub fn mget(&self, keys: &[Bytes]) -> Vec<Option<Bytes>> {
        let map = self.read();
        keys.iter().map(|k| map.get(k).cloned()).collect()
    }

    pub fn mset(&self, pairs: Vec<(Bytes, Bytes)>) {
        let mut map = self.write();
        for (k, v) in pairs {
            map.insert(k, v);
        }
    }

    /// 删除多个键，返回实际删除的数量
    pub fn del(&self, keys: &[Bytes]) -> usize {
        let mut map = self.write();
        keys.iter().filter(|k| map.remove(*k).is_some()).count()
    }

    /// 重复的键会被重复计数，与Redis一致
    pub fn exists(&self, keys: &[Bytes]) -> usize {
        let map = self.read();
        keys.iter().filter(|k| map.contains_key(*k)).count()
    }

    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let mut keys: Vec<Bytes> = self
            .read()
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn dbsize(&self) -> usize {
        self.read().len()
    }

    pub fn flush(&self) {
        self.write().clear();
    }
}

fn not_an_integer() -> SlicedError {
    SlicedError::TypeError("ERR value is not an integer or out of range".to_string())
}

/// 支持 `*` 和 `?` 的glob匹配
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                // 回溯：让上一个 `*` 多吞一个字符
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p.min(pattern.len())..].iter().all(|&c| c == b'*')
}
