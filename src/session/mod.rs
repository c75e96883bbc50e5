//! 会话层：消息缓冲与 flush 调度、TTL+LRU 会话状态缓存

pub mod cache;
pub mod manager;

pub use cache::{CacheStats, SessionCache, SessionState};
pub use manager::{BatchHandler, InboundMessage, SessionExpiredHandler, SessionManager};
