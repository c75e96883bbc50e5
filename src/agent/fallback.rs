//! 模型降级链
//!
//! 任务分类决定起始层级；错误分类决定是按退避重试、降级到本地模型，
//! 还是直接上抛。所有字符串匹配都收在命名谓词函数里，匹配策略可以
//! 独立于调用点演进——这些是启发式规则，不是精确判定。

use std::sync::OnceLock;

use regex::Regex;

/// 任务复杂度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskComplexity {
    /// 简短致谢/确认
    SimpleAck,
    /// 直接的状态/时间/事实性提问
    StatusQuery,
    /// 其余一切（默认）
    Complex,
}

/// 模型层级，按能力/成本降序
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    /// 最强远端模型
    Primary,
    /// 次级远端模型
    Secondary,
    /// 本地轻量模型
    Local,
    /// 无层级可用，消息留在队列等下个周期
    Queued,
}

impl ModelTier {
    /// 下一个更低的层级；Queued 之后没有退路
    pub fn next(self) -> Option<ModelTier> {
        match self {
            ModelTier::Primary => Some(ModelTier::Secondary),
            ModelTier::Secondary => Some(ModelTier::Local),
            ModelTier::Local => Some(ModelTier::Queued),
            ModelTier::Queued => None,
        }
    }
}

/// 简短致谢/确认类消息
fn is_simple_ack(text: &str) -> bool {
    static ACK_RE: OnceLock<Regex> = OnceLock::new();
    let re = ACK_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(ok(ay)?|thanks( a lot)?|thank you|thx|ty|got it|sounds good|great|nice|cool|perfect|sure|yes|yep|yeah|no|nope|will do|good night|good morning|lol|haha+|👍|🙏|❤️)[.!?\s]*$",
        )
        .unwrap()
    });
    let trimmed = text.trim();
    trimmed.len() <= 32 && re.is_match(trimmed)
}

/// 直接的状态/时间/事实性提问
fn is_status_query(text: &str) -> bool {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    let re = STATUS_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(what time|what's the time|what day|what date|what's today|are you (there|up|around|awake|busy)|you (there|up|around)\??|how('s| is) it going|any update(s)?|status\??|did (it|you|that) (finish|work|run)|is it (done|ready|finished))",
        )
        .unwrap()
    });
    let trimmed = text.trim();
    trimmed.len() <= 80 && re.is_match(trimmed)
}

/// 根据消息内容推断复杂度；匹配不上的一律按 Complex 处理
pub fn classify_task(text: &str) -> TaskComplexity {
    if is_simple_ack(text) {
        return TaskComplexity::SimpleAck;
    }
    if is_status_query(text) {
        return TaskComplexity::StatusQuery;
    }
    TaskComplexity::Complex
}

/// 简单消息直接走本地层级，复杂任务从最强层级开始
pub fn starting_tier(complexity: TaskComplexity) -> ModelTier {
    match complexity {
        TaskComplexity::SimpleAck | TaskComplexity::StatusQuery => ModelTier::Local,
        TaskComplexity::Complex => ModelTier::Primary,
    }
}

/// 网络/连接类错误
pub fn is_network_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    [
        "network",
        "connection",
        "connect",
        "timed out",
        "timeout",
        "dns",
        "unreachable",
        "refused",
        "reset by peer",
        "broken pipe",
        "econn",
    ]
    .iter()
    .any(|k| lower.contains(k))
}

/// 认证类错误：换本地模型也救不了，必须上抛
pub fn is_auth_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    ["401", "403", "auth", "unauthorized", "api key", "credential"]
        .iter()
        .any(|k| lower.contains(k))
}

/// 上下文超限：同样救不了，必须上抛
pub fn is_context_overflow(error: &str) -> bool {
    let lower = error.to_lowercase();
    [
        "context overflow",
        "context window",
        "context length",
        "context_length_exceeded",
        "prompt is too long",
        "too many tokens",
    ]
    .iter()
    .any(|k| lower.contains(k))
}

/// 是否应降级到本地层级：只有网络类故障值得降级
pub fn should_fallback_to_local(error: &str) -> bool {
    if is_auth_error(error) || is_context_overflow(error) {
        return false;
    }
    is_network_error(error)
}

/// 传输层错误是否值得按退避策略重试
pub fn is_retryable_error(error: &str) -> bool {
    if is_auth_error(error) || is_context_overflow(error) {
        return false;
    }
    let lower = error.to_lowercase();
    is_network_error(error)
        || lower.contains("overloaded")
        || lower.contains("529")
        || lower.contains("503")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_simple_ack() {
        assert_eq!(classify_task("ok"), TaskComplexity::SimpleAck);
        assert_eq!(classify_task("Thanks!"), TaskComplexity::SimpleAck);
        assert_eq!(classify_task("sounds good"), TaskComplexity::SimpleAck);
        assert_eq!(classify_task("👍"), TaskComplexity::SimpleAck);
    }

    #[test]
    fn test_classify_status_query() {
        assert_eq!(classify_task("what time is it?"), TaskComplexity::StatusQuery);
        assert_eq!(classify_task("are you there?"), TaskComplexity::StatusQuery);
        assert_eq!(classify_task("any update on the build?"), TaskComplexity::StatusQuery);
    }

    #[test]
    fn test_classify_defaults_to_complex() {
        assert_eq!(
            classify_task("can you refactor the session module and add tests"),
            TaskComplexity::Complex
        );
        // 长文本即便以 thanks 开头也不算简单确认
        assert_eq!(
            classify_task("thanks, and also please reschedule tomorrow's meeting to 3pm and let Sam know"),
            TaskComplexity::Complex
        );
    }

    #[test]
    fn test_starting_tier_by_complexity() {
        assert_eq!(starting_tier(TaskComplexity::SimpleAck), ModelTier::Local);
        assert_eq!(starting_tier(TaskComplexity::StatusQuery), ModelTier::Local);
        assert_eq!(starting_tier(TaskComplexity::Complex), ModelTier::Primary);
    }

    #[test]
    fn test_tier_descends_to_queued() {
        assert_eq!(ModelTier::Primary.next(), Some(ModelTier::Secondary));
        assert_eq!(ModelTier::Secondary.next(), Some(ModelTier::Local));
        assert_eq!(ModelTier::Local.next(), Some(ModelTier::Queued));
        assert_eq!(ModelTier::Queued.next(), None);
    }

    #[test]
    fn test_fallback_on_network_errors() {
        assert!(should_fallback_to_local("network error"));
        assert!(should_fallback_to_local("connection refused"));
        assert!(should_fallback_to_local("request timed out"));
    }

    #[test]
    fn test_no_fallback_on_auth_errors() {
        assert!(!should_fallback_to_local("401 unauthorized"));
        assert!(!should_fallback_to_local("auth token rejected"));
        assert!(!should_fallback_to_local("invalid api key"));
    }

    #[test]
    fn test_no_fallback_on_context_overflow() {
        assert!(!should_fallback_to_local("context overflow"));
        assert!(!should_fallback_to_local("prompt is too long: 210000 tokens"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("503 service unavailable"));
        assert!(is_retryable_error("overloaded_error"));
        assert!(!is_retryable_error("401 unauthorized"));
        assert!(!is_retryable_error("context_length_exceeded"));
        assert!(!is_retryable_error("invalid JSON in request body"));
    }
}
