//! 会话账本与交接
//!
//! 每个 chat + 远端会话组合维护一份累积账本：目标、决策、文件改动、后续步骤与
//! 悬而未决的问题。会话退役时生成交接快照（Handoff）——快照一旦写入，在册账本
//! 即被删除，新会话用快照渲染的回顾文本接续上下文。

pub mod manager;

pub use manager::{sanitize_chat_key, LedgerManager};

use serde::{Deserialize, Serialize};

/// 目标状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalStatus {
    Active,
    Done,
}

/// 单个目标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub description: String,
    pub status: GoalStatus,
    /// 添加时间（毫秒时间戳）
    pub added_at: i64,
}

/// 一次决策
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub description: String,
    pub decided_at: i64,
}

/// 一次文件改动
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub summary: String,
    pub changed_at: i64,
}

/// 账本：chat + session 维度的累积记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    pub session_id: String,
    pub chat_id: String,
    /// 创建时间（毫秒时间戳）
    pub started_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    /// 上下文占用百分比（0-100）
    pub context_percentage: Option<f32>,
    pub summary: Option<String>,
}

impl Ledger {
    pub fn new(chat_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            session_id: session_id.into(),
            chat_id: chat_id.into(),
            started_at: now,
            updated_at: now,
            goals: Vec::new(),
            decisions: Vec::new(),
            file_changes: Vec::new(),
            next_steps: Vec::new(),
            open_questions: Vec::new(),
            context_percentage: None,
            summary: None,
        }
    }

    /// 渲染已填充的部分；空账本渲染为空串
    pub fn human_readable(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.summary {
            out.push_str(&format!("Summary: {}\n", summary));
        }
        if !self.goals.is_empty() {
            out.push_str("Goals:\n");
            for goal in &self.goals {
                let marker = match goal.status {
                    GoalStatus::Active => " ",
                    GoalStatus::Done => "x",
                };
                out.push_str(&format!("  - [{}] {}\n", marker, goal.description));
            }
        }
        if !self.decisions.is_empty() {
            out.push_str("Decisions:\n");
            for decision in &self.decisions {
                out.push_str(&format!("  - {}\n", decision.description));
            }
        }
        if !self.file_changes.is_empty() {
            out.push_str("File changes:\n");
            for change in &self.file_changes {
                if change.summary.is_empty() {
                    out.push_str(&format!("  - {}\n", change.path));
                } else {
                    out.push_str(&format!("  - {}: {}\n", change.path, change.summary));
                }
            }
        }
        if !self.next_steps.is_empty() {
            out.push_str("Next steps:\n");
            for step in &self.next_steps {
                out.push_str(&format!("  - {}\n", step));
            }
        }
        if !self.open_questions.is_empty() {
            out.push_str("Open questions:\n");
            for question in &self.open_questions {
                out.push_str(&format!("  - {}\n", question));
            }
        }
        if let Some(pct) = self.context_percentage {
            out.push_str(&format!("Context usage: {:.0}%\n", pct));
        }
        out.trim_end().to_string()
    }
}

/// 交接原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandoffReason {
    /// 上下文占用越过阈值
    ContextThreshold,
    /// 会话正常退役
    SessionRetired,
    /// 显式请求
    Manual,
}

impl HandoffReason {
    /// 从结构化输出里的字符串解析；未知原因归入 Manual
    pub fn parse(raw: &str) -> Self {
        match raw {
            "context-threshold" | "context_threshold" => HandoffReason::ContextThreshold,
            "session-retired" | "session_retired" | "session-end" | "session_end" => {
                HandoffReason::SessionRetired
            }
            _ => HandoffReason::Manual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffReason::ContextThreshold => "context-threshold",
            HandoffReason::SessionRetired => "session-retired",
            HandoffReason::Manual => "manual",
        }
    }
}

/// 交接快照：生成后源账本即被删除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub reason: HandoffReason,
    pub ledger: Ledger,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

/// 智能体结构化输出里的账本增量
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerUpdate {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub completed_goals: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    /// "path: summary" 或裸路径
    #[serde(default)]
    pub file_changes: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
    pub context_percentage: Option<f32>,
    pub summary: Option<String>,
    /// 出现即触发交接而非增量写入
    pub handoff_reason: Option<String>,
}
