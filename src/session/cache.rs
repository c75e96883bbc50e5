//! 会话状态缓存
//!
//! chat_id → SessionState 的 TTL + LRU 镜像。权威数据在 SessionManager 手里，
//! 这里只是热路径的快速通道：过期或未命中时调用方回落到权威来源即可，
//! 未命中不是错误。所有操作经同一把异步锁串行化，多会话并发访问不会踩坏状态。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// 会话连续性状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub chat_id: String,
    /// 远端会话 ID（下次调用恢复上下文用）
    pub session_id: Option<String>,
    /// 最近一条回复的标识
    pub last_response_id: Option<String>,
    /// 最近回复时间（毫秒时间戳）
    pub last_response_at: Option<i64>,
    /// 最近读取时间（毫秒时间戳）
    pub last_read_at: Option<i64>,
}

impl SessionState {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            session_id: None,
            last_response_id: None,
            last_response_at: None,
            last_read_at: None,
        }
    }
}

struct CacheEntry {
    state: SessionState,
    expires_at: Instant,
    /// 最近访问序号（LRU 依据）
    last_access: u64,
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
    ticks: u64,
}

/// TTL + LRU 会话缓存
pub struct SessionCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
}

impl SessionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
                ticks: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// 写入；新键超出容量时先逐出最久未访问的条目
    pub async fn set(&self, chat_id: &str, state: SessionState) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.ticks += 1;
        if !inner.entries.contains_key(chat_id) && inner.entries.len() >= self.max_entries {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!(chat = %oldest, "cache full, evicting least recently used entry");
                inner.entries.remove(&oldest);
                inner.stats.evictions += 1;
            }
        }
        inner.entries.insert(
            chat_id.to_string(),
            CacheEntry {
                state,
                expires_at: Instant::now() + self.ttl,
                last_access: inner.ticks,
            },
        );
    }

    /// 读取；命中计 hit 并刷新访问序号，过期则逐出并计 miss + eviction
    pub async fn get(&self, chat_id: &str) -> Option<SessionState> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        inner.ticks += 1;
        let ticks = inner.ticks;
        let live = inner
            .entries
            .get(chat_id)
            .map(|entry| entry.expires_at > Instant::now());
        match live {
            Some(true) => {
                inner.stats.hits += 1;
                let entry = inner.entries.get_mut(chat_id)?;
                entry.last_access = ticks;
                Some(entry.state.clone())
            }
            Some(false) => {
                inner.entries.remove(chat_id);
                inner.stats.misses += 1;
                inner.stats.evictions += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// 主动失效（会话清除时调用）
    pub async fn remove(&self, chat_id: &str) {
        self.inner.lock().await.entries.remove(chat_id);
    }

    pub async fn stats(&self) -> CacheStats {
        self.inner.lock().await.stats
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
