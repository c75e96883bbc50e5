//! Courier - 消息桥接编排核心
//!
//! 把人类协作者各渠道的入站消息批量转交给外部推理智能体（子进程调用），
//! 并管理随之而来的一切：批量时机、跨进程串行化、重试与降级、会话连续性
//! 缓存、账本与交接。平台消息监听、语义记忆检索、外发传输、图像生成都是
//! 外部协作方，本 crate 只消费/产出它们的接口。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 退避重试、入站队列、跨进程任务锁、队列处理器
//! - **agent**: 模型降级链、子进程调用器、回复清洗
//! - **session**: 会话缓冲与 flush 调度、会话状态缓存
//! - **ledger**: 会话账本与交接快照
//! - **observability**: tracing 初始化

pub mod agent;
pub mod config;
pub mod core;
pub mod ledger;
pub mod observability;
pub mod session;

pub use crate::agent::{AgentInvoker, InvocationResult, InvokeError};
pub use crate::core::{Backoff, BackoffConfig, InboundQueue, QueueProcessor, TaskLock};
pub use crate::ledger::LedgerManager;
pub use crate::session::{InboundMessage, SessionCache, SessionManager};
