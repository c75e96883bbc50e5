//! 调用错误类型
//!
//! 与退避/降级策略配合：只有传输类失败（Spawn / Timeout / Transport）可能被
//! 重试或降级；Malformed 与 Execution 一律直接上抛，绝不重试。

use thiserror::Error;

/// 智能体子进程调用可能出现的错误
#[derive(Error, Debug)]
pub enum InvokeError {
    /// 进程启动或 stdin 写入失败
    #[error("Failed to launch agent process: {0}")]
    Spawn(String),

    /// 超过调用时限；挂起的调用按传输失败处理
    #[error("Agent call timed out after {0}s")]
    Timeout(u64),

    /// 传输/进程层失败（附 stderr 摘要）
    #[error("Agent transport failure: {0}")]
    Transport(String),

    /// stdout 不是单个合法 JSON 对象
    #[error("Malformed agent output: {0}")]
    Malformed(String),

    /// 智能体自报执行失败，携带其原话
    #[error("Agent execution failed: {0}")]
    Execution(String),

    /// 远端会话已被回收，需要以全新会话重试
    #[error("Remote session expired: {0}")]
    SessionExpired(String),

    /// 所有层级都已尝试；消息应留在队列等待下个周期
    #[error("All model tiers exhausted: {0}")]
    Exhausted(String),

    /// 账本持久化失败
    #[error("Ledger update failed: {0}")]
    Ledger(String),
}
