//! 智能体回复清洗
//!
//! 顺序执行、可短路的过滤流水线：
//! 纯元叙述 → 思考块 → 成对标记块 → 会话 ID → 命名空间标签 → 空白收敛。
//! 每个被剥离的片段都记入诊断通道并打 debug 日志，绝不透给用户——
//! 这些是可调的启发式规则，留痕才能回头校准。清洗自身永不报错：
//! 处理不了就按原样放行。

use std::sync::OnceLock;

use regex::Regex;

/// 纯元叙述回复被整体替换为该占位文案
pub const NOT_DELIVERED_PLACEHOLDER: &str =
    "(reply not delivered; please send your message again)";

/// 剥离片段的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripKind {
    /// 只描述「发了一条消息」而不含实际内容的整条回复
    MetaCommentary,
    /// 内部推理块
    Thinking,
    /// 其它成对标记块
    MarkerBlock,
    /// 会话标识（10 位-5 位数字）
    SessionId,
    /// 命名空间内部标签块
    NamespacedTag,
}

/// 单个被剥离的片段
#[derive(Debug, Clone)]
pub struct StrippedFragment {
    pub kind: StripKind,
    pub content: String,
}

/// 清洗结果：净文本 + 诊断片段
#[derive(Debug, Clone)]
pub struct SanitizedResponse {
    pub text: String,
    pub stripped: Vec<StrippedFragment>,
}

/// 纯元叙述判定：整条回复只是在转述「已发送/已确认」。
/// 带引号说明回复里嵌着真实文本，不算。
fn is_meta_commentary(text: &str) -> bool {
    static META_RES: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = META_RES.get_or_init(|| {
        [
            r"(?i)^sent\s+(a|an|the)\b",
            r"(?i)^(i\s+)?(just\s+)?(sent|replied|responded)\b",
            r"(?i)^responded\s+to\b",
            r"(?i)^acknowledged\s+the\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    let trimmed = text.trim();
    if trimmed.contains('"') || trimmed.contains('“') || trimmed.contains('”') {
        return false;
    }
    patterns.iter().any(|re| re.is_match(trimmed))
}

fn thinking_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<thinking>.*?</thinking>").unwrap())
}

fn session_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{10}-\d{5}\b").unwrap())
}

fn namespaced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<[A-Za-z][\w.-]*:[^>]*>.*?</[A-Za-z][\w.-]*:[^>]*>|<[A-Za-z][\w.-]*:[^>]*/>")
            .unwrap()
    })
}

/// 清洗智能体原始回复
pub fn sanitize_response(raw: &str) -> SanitizedResponse {
    let mut stripped = Vec::new();

    // 纯元叙述：整条替换并短路，后续步骤全部跳过
    if is_meta_commentary(raw) {
        tracing::debug!(original = %raw, "meta-commentary reply suppressed");
        stripped.push(StrippedFragment {
            kind: StripKind::MetaCommentary,
            content: raw.to_string(),
        });
        return SanitizedResponse {
            text: NOT_DELIVERED_PLACEHOLDER.to_string(),
            stripped,
        };
    }

    let text = strip_regex(raw, thinking_re(), StripKind::Thinking, &mut stripped);
    let text = strip_marker_blocks(&text, &mut stripped);
    let text = strip_regex(&text, session_id_re(), StripKind::SessionId, &mut stripped);
    let text = strip_regex(&text, namespaced_re(), StripKind::NamespacedTag, &mut stripped);
    let text = collapse_whitespace(&text);

    SanitizedResponse { text, stripped }
}

fn strip_regex(
    text: &str,
    re: &Regex,
    kind: StripKind,
    stripped: &mut Vec<StrippedFragment>,
) -> String {
    if !re.is_match(text) {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for found in re.find_iter(text) {
        out.push_str(&text[last..found.start()]);
        tracing::debug!(kind = ?kind, fragment = %found.as_str(), "stripped fragment");
        stripped.push(StrippedFragment {
            kind,
            content: found.as_str().to_string(),
        });
        last = found.end();
    }
    out.push_str(&text[last..]);
    out
}

/// 成对的 `<tag>...</tag>` 标记块；regex crate 不支持反向引用，这里手工配对。
/// 找不到同名闭合标签的孤立标签原样保留。
fn strip_marker_blocks(text: &str, stripped: &mut Vec<StrippedFragment>) -> String {
    static OPEN_RE: OnceLock<Regex> = OnceLock::new();
    let open_re = OPEN_RE.get_or_init(|| Regex::new(r"<([A-Za-z_][A-Za-z0-9_-]*)>").unwrap());

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let Some(caps) = open_re.captures(rest) else {
            out.push_str(rest);
            break;
        };
        let Some(open) = caps.get(0) else {
            out.push_str(rest);
            break;
        };
        let Some(name) = caps.get(1) else {
            out.push_str(rest);
            break;
        };
        let close = format!("</{}>", name.as_str());
        match rest[open.end()..].find(&close) {
            Some(rel) => {
                let block_end = open.end() + rel + close.len();
                let block = &rest[open.start()..block_end];
                tracing::debug!(fragment = %block, "stripped marker block");
                stripped.push(StrippedFragment {
                    kind: StripKind::MarkerBlock,
                    content: block.to_string(),
                });
                out.push_str(&rest[..open.start()]);
                rest = &rest[block_end..];
            }
            None => {
                out.push_str(&rest[..open.end()]);
                rest = &rest[open.end()..];
            }
        }
    }
    out
}

/// 收敛重复空白与空行并修剪首尾
fn collapse_whitespace(text: &str) -> String {
    static MULTI_SPACE: OnceLock<Regex> = OnceLock::new();
    static MULTI_BLANK: OnceLock<Regex> = OnceLock::new();
    let spaces = MULTI_SPACE.get_or_init(|| Regex::new(r"[ \t]{2,}").unwrap());
    let blanks = MULTI_BLANK.get_or_init(|| Regex::new(r"\n{3,}").unwrap());
    let collapsed = spaces.replace_all(text, " ");
    let collapsed = blanks.replace_all(&collapsed, "\n\n");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thinking_block_stripped_and_recorded() {
        let cleaned = sanitize_response("Hello! <thinking>internal</thinking> How can I help?");
        assert_eq!(cleaned.text, "Hello! How can I help?");
        assert_eq!(cleaned.stripped.len(), 1);
        assert_eq!(cleaned.stripped[0].kind, StripKind::Thinking);
        assert!(cleaned.stripped[0].content.contains("internal"));
    }

    #[test]
    fn test_meta_commentary_replaced_and_short_circuits() {
        let cleaned = sanitize_response("Sent a brief response acknowledging the update.");
        assert_eq!(cleaned.text, NOT_DELIVERED_PLACEHOLDER);
        assert_eq!(cleaned.stripped.len(), 1);
        assert_eq!(cleaned.stripped[0].kind, StripKind::MetaCommentary);
    }

    #[test]
    fn test_meta_commentary_variants() {
        for raw in [
            "I sent them a summary of today's meetings.",
            "Just sent a quick reply.",
            "Responded to Alex - confirmed the plan.",
            "Acknowledged the reminder.",
            "Replied with the details.",
        ] {
            let cleaned = sanitize_response(raw);
            assert_eq!(cleaned.text, NOT_DELIVERED_PLACEHOLDER, "raw: {}", raw);
        }
    }

    #[test]
    fn test_quoted_content_is_not_meta_commentary() {
        let raw = r#"Sent the draft: "Dinner at 7 works, see you there!""#;
        let cleaned = sanitize_response(raw);
        assert_eq!(cleaned.text, raw);
        assert!(cleaned.stripped.is_empty());
    }

    #[test]
    fn test_session_id_shape_stripped_numbers_kept() {
        let cleaned = sanitize_response("Processing task 1767301033-68210 now");
        assert_eq!(cleaned.text, "Processing task now");
        assert_eq!(cleaned.stripped.len(), 1);
        assert_eq!(cleaned.stripped[0].kind, StripKind::SessionId);

        let untouched = sanitize_response("The answer is 42 and the year is 2024");
        assert_eq!(untouched.text, "The answer is 42 and the year is 2024");
        assert!(untouched.stripped.is_empty());
    }

    #[test]
    fn test_marker_block_stripped() {
        let cleaned = sanitize_response("Before <scratchpad>notes here</scratchpad> after");
        assert_eq!(cleaned.text, "Before after");
        assert_eq!(cleaned.stripped[0].kind, StripKind::MarkerBlock);
    }

    #[test]
    fn test_unclosed_tag_left_alone() {
        let cleaned = sanitize_response("Use <tag> carefully");
        assert_eq!(cleaned.text, "Use <tag> carefully");
        assert!(cleaned.stripped.is_empty());
    }

    #[test]
    fn test_namespaced_tag_stripped() {
        let cleaned = sanitize_response("Done. <sys:meta>k=v</sys:meta> All set.");
        assert_eq!(cleaned.text, "Done. All set.");
        assert_eq!(cleaned.stripped[0].kind, StripKind::NamespacedTag);
    }

    #[test]
    fn test_whitespace_collapsed() {
        let cleaned = sanitize_response("line one\n\n\n\nline two   with   gaps");
        assert_eq!(cleaned.text, "line one\n\nline two with gaps");
    }

    #[test]
    fn test_plain_text_passes_through() {
        let raw = "See you at 6pm — I'll bring the slides.";
        let cleaned = sanitize_response(raw);
        assert_eq!(cleaned.text, raw);
        assert!(cleaned.stripped.is_empty());
    }

    #[test]
    fn test_multiple_kinds_in_one_response() {
        let raw = "Okay. <thinking>plan</thinking> Task 1700000001-12345 queued. <note>internal</note>";
        let cleaned = sanitize_response(raw);
        assert_eq!(cleaned.text, "Okay. Task queued.");
        let kinds: Vec<StripKind> = cleaned.stripped.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&StripKind::Thinking));
        assert!(kinds.contains(&StripKind::SessionId));
        assert!(kinds.contains(&StripKind::MarkerBlock));
    }
}
