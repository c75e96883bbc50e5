//! 智能体调用层：任务分类与降级链、子进程调用、回复清洗

pub mod error;
pub mod fallback;
pub mod invoker;
pub mod sanitize;

pub use error::InvokeError;
pub use fallback::{
    classify_task, should_fallback_to_local, starting_tier, ModelTier, TaskComplexity,
};
pub use invoker::{
    AgentBackend, AgentInvoker, AgentRequest, InvocationResult, InvokerConfig, StructuredOutput,
    SubprocessBackend, EMPTY_RESULT_PLACEHOLDER,
};
pub use sanitize::{
    sanitize_response, SanitizedResponse, StripKind, StrippedFragment, NOT_DELIVERED_PLACEHOLDER,
};
