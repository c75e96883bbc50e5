//! 协调原语：退避重试、入站队列、跨进程任务锁、队列处理器

pub mod backoff;
pub mod lock;
pub mod processor;
pub mod queue;

pub use backoff::{Backoff, BackoffConfig};
pub use lock::{LockGuard, LockRecord, TaskLock};
pub use processor::QueueProcessor;
pub use queue::{InboundQueue, QueuedMessage};
