//! 账本管理器
//!
//! 在册账本按 chat 各存一个 JSON 文件，文件名是 chat 标识的文件系统安全形式；
//! 交接快照单独存放，文件名再带一个可排序的时间戳。读写都是小文件整写，
//! 父目录不存在时自动创建。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use super::{
    Decision, FileChange, Goal, GoalStatus, Handoff, HandoffReason, Ledger, LedgerUpdate,
};

/// chat 标识转文件系统安全键：保留字母数字与 `. _ -`，其余替换为下划线
pub fn sanitize_chat_key(chat_id: &str) -> String {
    chat_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct LedgerManager {
    ledger_dir: PathBuf,
    handoff_dir: PathBuf,
    /// 在册账本的内存副本（chat → Ledger）
    active: Mutex<HashMap<String, Ledger>>,
}

impl LedgerManager {
    pub fn new(ledger_dir: impl AsRef<Path>, handoff_dir: impl AsRef<Path>) -> Self {
        Self {
            ledger_dir: ledger_dir.as_ref().to_path_buf(),
            handoff_dir: handoff_dir.as_ref().to_path_buf(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn ledger_path(&self, chat_id: &str) -> PathBuf {
        self.ledger_dir
            .join(format!("{}.json", sanitize_chat_key(chat_id)))
    }

    fn load(&self, chat_id: &str) -> Option<Ledger> {
        let data = std::fs::read_to_string(self.ledger_path(chat_id)).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn persist(&self, ledger: &Ledger) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.ledger_dir)?;
        let path = self.ledger_path(&ledger.chat_id);
        std::fs::write(&path, serde_json::to_string_pretty(ledger)?)?;
        Ok(())
    }

    /// 取或建账本（幂等）；磁盘上已有同 chat 的账本时直接加载。
    /// 新账本此时只在内存里，首次修改才落盘。
    pub async fn get_ledger(&self, chat_id: &str, session_id: &str) -> Ledger {
        let mut active = self.active.lock().await;
        if let Some(ledger) = active.get(chat_id) {
            return ledger.clone();
        }
        let ledger = self
            .load(chat_id)
            .unwrap_or_else(|| Ledger::new(chat_id, session_id));
        active.insert(chat_id.to_string(), ledger.clone());
        ledger
    }

    /// 对在册账本执行一次修改并落盘
    async fn mutate<F>(&self, chat_id: &str, session_id: &str, apply: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut Ledger),
    {
        let mut active = self.active.lock().await;
        if !active.contains_key(chat_id) {
            let loaded = self
                .load(chat_id)
                .unwrap_or_else(|| Ledger::new(chat_id, session_id));
            active.insert(chat_id.to_string(), loaded);
        }
        let Some(ledger) = active.get_mut(chat_id) else {
            anyhow::bail!("ledger vanished for chat {}", chat_id);
        };
        apply(ledger);
        ledger.updated_at = chrono::Utc::now().timestamp_millis();
        self.persist(ledger)
    }

    pub async fn add_goal(
        &self,
        chat_id: &str,
        session_id: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        let description = description.to_string();
        self.mutate(chat_id, session_id, |ledger| {
            if !ledger.goals.iter().any(|g| g.description == description) {
                ledger.goals.push(Goal {
                    description,
                    status: GoalStatus::Active,
                    added_at: chrono::Utc::now().timestamp_millis(),
                });
            }
        })
        .await
    }

    pub async fn update_goal_status(
        &self,
        chat_id: &str,
        session_id: &str,
        description: &str,
        status: GoalStatus,
    ) -> anyhow::Result<()> {
        let description = description.to_string();
        self.mutate(chat_id, session_id, |ledger| {
            if let Some(goal) = ledger
                .goals
                .iter_mut()
                .find(|g| g.description == description)
            {
                goal.status = status;
            }
        })
        .await
    }

    pub async fn record_decision(
        &self,
        chat_id: &str,
        session_id: &str,
        description: &str,
    ) -> anyhow::Result<()> {
        let description = description.to_string();
        self.mutate(chat_id, session_id, |ledger| {
            ledger.decisions.push(Decision {
                description,
                decided_at: chrono::Utc::now().timestamp_millis(),
            });
        })
        .await
    }

    pub async fn record_file_change(
        &self,
        chat_id: &str,
        session_id: &str,
        path: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        let path = path.to_string();
        let summary = summary.to_string();
        self.mutate(chat_id, session_id, |ledger| {
            ledger.file_changes.push(FileChange {
                path,
                summary,
                changed_at: chrono::Utc::now().timestamp_millis(),
            });
        })
        .await
    }

    pub async fn add_next_steps(
        &self,
        chat_id: &str,
        session_id: &str,
        steps: &[String],
    ) -> anyhow::Result<()> {
        let steps = steps.to_vec();
        self.mutate(chat_id, session_id, |ledger| {
            for step in steps {
                if !ledger.next_steps.contains(&step) {
                    ledger.next_steps.push(step);
                }
            }
        })
        .await
    }

    pub async fn add_open_questions(
        &self,
        chat_id: &str,
        session_id: &str,
        questions: &[String],
    ) -> anyhow::Result<()> {
        let questions = questions.to_vec();
        self.mutate(chat_id, session_id, |ledger| {
            for question in questions {
                if !ledger.open_questions.contains(&question) {
                    ledger.open_questions.push(question);
                }
            }
        })
        .await
    }

    pub async fn update_context_percentage(
        &self,
        chat_id: &str,
        session_id: &str,
        percentage: f32,
    ) -> anyhow::Result<()> {
        self.mutate(chat_id, session_id, |ledger| {
            ledger.context_percentage = Some(percentage.clamp(0.0, 100.0));
        })
        .await
    }

    pub async fn set_summary(
        &self,
        chat_id: &str,
        session_id: &str,
        summary: &str,
    ) -> anyhow::Result<()> {
        let summary = summary.to_string();
        self.mutate(chat_id, session_id, |ledger| {
            ledger.summary = Some(summary);
        })
        .await
    }

    /// 应用一份结构化增量
    pub async fn apply_update(
        &self,
        chat_id: &str,
        session_id: &str,
        update: &LedgerUpdate,
    ) -> anyhow::Result<()> {
        for goal in &update.goals {
            self.add_goal(chat_id, session_id, goal).await?;
        }
        for goal in &update.completed_goals {
            self.update_goal_status(chat_id, session_id, goal, GoalStatus::Done)
                .await?;
        }
        for decision in &update.decisions {
            self.record_decision(chat_id, session_id, decision).await?;
        }
        for change in &update.file_changes {
            let (path, summary) = match change.split_once(": ") {
                Some((p, s)) => (p, s),
                None => (change.as_str(), ""),
            };
            self.record_file_change(chat_id, session_id, path, summary)
                .await?;
        }
        if !update.next_steps.is_empty() {
            self.add_next_steps(chat_id, session_id, &update.next_steps)
                .await?;
        }
        if !update.open_questions.is_empty() {
            self.add_open_questions(chat_id, session_id, &update.open_questions)
                .await?;
        }
        if let Some(pct) = update.context_percentage {
            self.update_context_percentage(chat_id, session_id, pct)
                .await?;
        }
        if let Some(summary) = &update.summary {
            self.set_summary(chat_id, session_id, summary).await?;
        }
        Ok(())
    }

    /// 生成交接：快照在册账本 → 写入交接存储 → 删除在册账本文件
    pub async fn create_handoff(
        &self,
        chat_id: &str,
        reason: HandoffReason,
    ) -> anyhow::Result<Handoff> {
        let ledger = {
            let mut active = self.active.lock().await;
            match active.remove(chat_id) {
                Some(ledger) => ledger,
                None => match self.load(chat_id) {
                    Some(ledger) => ledger,
                    None => anyhow::bail!("no active ledger for chat {}", chat_id),
                },
            }
        };

        let handoff = Handoff {
            reason,
            ledger,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        std::fs::create_dir_all(&self.handoff_dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.handoff_dir.join(format!(
            "{}_{}.json",
            sanitize_chat_key(chat_id),
            stamp
        ));
        std::fs::write(&path, serde_json::to_string_pretty(&handoff)?)?;

        let live = self.ledger_path(chat_id);
        if live.exists() {
            std::fs::remove_file(&live)?;
        }
        tracing::info!(chat = %chat_id, reason = handoff.reason.as_str(), "ledger handed off");
        Ok(handoff)
    }

    /// 该 chat 最近一次交接；没有则为 None
    pub fn most_recent_handoff(&self, chat_id: &str) -> Option<Handoff> {
        let prefix = format!("{}_", sanitize_chat_key(chat_id));
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.handoff_dir)
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        // 文件名里的时间戳可按字典序排序
        paths.sort();
        let latest = paths.pop()?;
        let data = std::fs::read_to_string(latest).ok()?;
        serde_json::from_str(&data).ok()
    }

    /// 用交接快照渲染新会话的接续上下文
    pub fn context_from_handoff(&self, handoff: &Handoff) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Continuing from a previous session (handed off: {}).\n",
            handoff.reason.as_str()
        ));
        out.push_str(&format!(
            "Previous session: {}\n",
            handoff.ledger.session_id
        ));
        let body = handoff.ledger.human_readable();
        if !body.is_empty() {
            out.push_str(&body);
            out.push('\n');
        }
        out
    }
}
