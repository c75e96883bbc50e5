//! 智能体调用器
//!
//! 把一批消息连同上下文交给外部推理智能体（阻塞式子进程，带超时），
//! 处理恢复/重试协议并清洗输出。子进程契约：stdin 收提示词，stdout 输出
//! 单个 JSON 对象 `{result, session_id, is_error?, structured_output?}`。
//!
//! 重试语义：只有传输类失败按退避策略重试；网络类故障同时逐级降到更便宜的
//! 层级。解析失败与智能体自报错误一律直接上抛。远端会话被回收时透明地
//! 以全新会话重试一次，调用方察觉不到。

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::agent::error::InvokeError;
use crate::agent::fallback::{self, ModelTier};
use crate::agent::sanitize::{sanitize_response, StrippedFragment};
use crate::core::backoff::{Backoff, BackoffConfig};
use crate::ledger::{HandoffReason, LedgerManager, LedgerUpdate};
use crate::session::InboundMessage;

/// result 缺失时的兜底回复——故意的软失败，保证总有回复可发
pub const EMPTY_RESULT_PLACEHOLDER: &str =
    "Sorry, I lost my train of thought. Could you say that again?";

/// 发给后端的一次请求
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: String,
    /// 要恢复的远端会话 ID；None 表示全新会话
    pub resume_session_id: Option<String>,
    pub timeout_secs: u64,
}

/// 推理后端接口。任何按同一 JSON 契约输出的进程都可以替换进来，
/// 测试时换成脚本化实现，调用点无需改动。
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// 执行一次调用，返回原始 stdout
    async fn invoke(&self, request: &AgentRequest) -> Result<String, InvokeError>;
}

/// 子进程后端：阻塞调用外部 CLI，超时即杀
pub struct SubprocessBackend {
    binary: String,
}

impl SubprocessBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl AgentBackend for SubprocessBackend {
    async fn invoke(&self, request: &AgentRequest) -> Result<String, InvokeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&request.model);
        if let Some(session_id) = &request.resume_session_id {
            cmd.arg("--resume").arg(session_id);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            binary = %self.binary,
            model = %request.model,
            resume = request.resume_session_id.is_some(),
            "invoking agent subprocess"
        );

        let mut child = cmd.spawn().map_err(|e| InvokeError::Spawn(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| InvokeError::Spawn(e.to_string()))?;
            // drop 关闭 stdin，子进程才会收到 EOF
        }

        let output = tokio::time::timeout(
            Duration::from_secs(request.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| InvokeError::Timeout(request.timeout_secs))?
        .map_err(|e| InvokeError::Transport(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() && stdout.trim().is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InvokeError::Transport(format!(
                "exit {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        Ok(stdout)
    }
}

/// 子进程 stdout 的 JSON 契约
#[derive(Debug, Deserialize)]
struct AgentStdout {
    result: Option<String>,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
    structured_output: Option<StructuredOutput>,
}

/// 结构化输出：message 是用户可见回复，ledger 是账本增量
#[derive(Debug, Clone, Deserialize)]
pub struct StructuredOutput {
    pub message: Option<String>,
    pub ledger: Option<LedgerUpdate>,
}

/// 一次调用的结果
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub response: String,
    /// 新的远端会话 ID（调用方负责落账）
    pub session_id: Option<String>,
    pub structured: Option<StructuredOutput>,
    /// 清洗掉的片段，诊断用，不外发
    pub stripped: Vec<StrippedFragment>,
}

/// 调用器配置
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub timeout_secs: u64,
    pub primary_model: String,
    pub secondary_model: String,
    pub local_model: String,
    pub backoff: BackoffConfig,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            primary_model: "opus".to_string(),
            secondary_model: "sonnet".to_string(),
            local_model: "haiku".to_string(),
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct AgentInvoker {
    backend: Arc<dyn AgentBackend>,
    config: InvokerConfig,
    ledgers: Option<Arc<LedgerManager>>,
}

impl AgentInvoker {
    pub fn new(backend: Arc<dyn AgentBackend>, config: InvokerConfig) -> Self {
        Self {
            backend,
            config,
            ledgers: None,
        }
    }

    /// 接上账本管理器；结构化输出里的账本增量才会被应用
    pub fn with_ledger(mut self, ledgers: Arc<LedgerManager>) -> Self {
        self.ledgers = Some(ledgers);
        self
    }

    fn model_for(&self, tier: ModelTier) -> Option<&str> {
        match tier {
            ModelTier::Primary => Some(&self.config.primary_model),
            ModelTier::Secondary => Some(&self.config.secondary_model),
            ModelTier::Local => Some(&self.config.local_model),
            ModelTier::Queued => None,
        }
    }

    /// 单条消息调用
    pub async fn invoke(
        &self,
        prompt: &str,
        context: &str,
    ) -> Result<InvocationResult, InvokeError> {
        let full = if context.trim().is_empty() {
            prompt.to_string()
        } else {
            format!("{}\n\n{}", context.trim(), prompt)
        };
        self.run(prompt, full, None, None).await
    }

    /// 批量调用：消息按到达顺序拼接，可恢复既有远端会话
    pub async fn invoke_batch(
        &self,
        messages: &[InboundMessage],
        context: &str,
        resume_session_id: Option<String>,
        target_handles: Option<&[String]>,
        chat_id: Option<&str>,
    ) -> Result<InvocationResult, InvokeError> {
        let combined = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = build_prompt(context, messages, target_handles);
        self.run(&combined, prompt, resume_session_id, chat_id).await
    }

    async fn run(
        &self,
        classify_text: &str,
        prompt: String,
        resume_session_id: Option<String>,
        chat_id: Option<&str>,
    ) -> Result<InvocationResult, InvokeError> {
        let complexity = fallback::classify_task(classify_text);
        let mut tier = fallback::starting_tier(complexity);
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut resume = resume_session_id;
        let mut session_repaired = false;

        loop {
            let Some(model) = self.model_for(tier) else {
                return Err(InvokeError::Exhausted(
                    "no invokable tier left".to_string(),
                ));
            };
            let request = AgentRequest {
                prompt: prompt.clone(),
                model: model.to_string(),
                resume_session_id: resume.clone(),
                timeout_secs: self.config.timeout_secs,
            };

            match self.attempt(&request, chat_id).await {
                Ok(result) => return Ok(result),
                Err(InvokeError::SessionExpired(old)) if !session_repaired && resume.is_some() => {
                    // 远端会话已被回收：透明地以全新会话重试一次
                    tracing::warn!(session = %old, "remote session gone, retrying fresh");
                    resume = None;
                    session_repaired = true;
                }
                Err(err)
                    if matches!(
                        err,
                        InvokeError::Timeout(_) | InvokeError::Transport(_) | InvokeError::Spawn(_)
                    ) =>
                {
                    let detail = err.to_string();
                    if !fallback::is_retryable_error(&detail) {
                        return Err(err);
                    }
                    if !backoff.should_retry() {
                        return Err(err);
                    }
                    let delay = backoff.current_delay();
                    tracing::warn!(
                        error = %detail,
                        attempt = backoff.attempts() + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying agent call"
                    );
                    tokio::time::sleep(delay).await;
                    backoff.record_failure();
                    // 网络类故障额外降一级；其余传输故障留在原层级重试
                    if fallback::should_fallback_to_local(&detail) {
                        if let Some(next) = tier.next() {
                            tracing::warn!(from = ?tier, to = ?next, "dropping a model tier");
                            tier = next;
                        }
                    }
                }
                // Malformed / Execution / Ledger：不重试
                Err(err) => return Err(err),
            }
        }
    }

    /// 执行一次后端调用并按输出契约解析
    async fn attempt(
        &self,
        request: &AgentRequest,
        chat_id: Option<&str>,
    ) -> Result<InvocationResult, InvokeError> {
        let stdout = self.backend.invoke(request).await?;
        let parsed: AgentStdout = serde_json::from_str(stdout.trim()).map_err(|e| {
            InvokeError::Malformed(format!("{}: {}", e, truncate(stdout.trim(), 200)))
        })?;

        if let Some(result) = &parsed.result {
            if request.resume_session_id.is_some() && is_session_not_found(result) {
                return Err(InvokeError::SessionExpired(
                    request.resume_session_id.clone().unwrap_or_default(),
                ));
            }
            if parsed.is_error || is_error_signal(result) {
                return Err(InvokeError::Execution(result.clone()));
            }
        } else if parsed.is_error {
            return Err(InvokeError::Execution(
                "agent reported an error without detail".to_string(),
            ));
        }

        // 结构化 message 优先作为用户可见回复；result 整体缺失时降级为占位文案
        let mut structured_message = None;
        if let Some(structured) = &parsed.structured_output {
            structured_message = structured.message.clone();
            if let Some(update) = &structured.ledger {
                self.apply_ledger(chat_id, parsed.session_id.as_deref(), update)
                    .await?;
            }
        }
        let raw_response = structured_message
            .or_else(|| parsed.result.clone())
            .unwrap_or_else(|| EMPTY_RESULT_PLACEHOLDER.to_string());

        let cleaned = sanitize_response(&raw_response);
        Ok(InvocationResult {
            response: cleaned.text,
            session_id: parsed.session_id,
            structured: parsed.structured_output,
            stripped: cleaned.stripped,
        })
    }

    /// 应用账本增量；带交接原因时生成 Handoff 并删除在册账本
    async fn apply_ledger(
        &self,
        chat_id: Option<&str>,
        session_id: Option<&str>,
        update: &LedgerUpdate,
    ) -> Result<(), InvokeError> {
        let (Some(ledgers), Some(chat)) = (&self.ledgers, chat_id) else {
            return Ok(());
        };
        let session = session_id.unwrap_or("unknown");

        if let Some(reason) = &update.handoff_reason {
            let reason = HandoffReason::parse(reason);
            // 确保有账本可快照（懒创建）
            let _ = ledgers.get_ledger(chat, session).await;
            ledgers
                .create_handoff(chat, reason)
                .await
                .map_err(|e| InvokeError::Ledger(e.to_string()))?;
            return Ok(());
        }
        ledgers
            .apply_update(chat, session, update)
            .await
            .map_err(|e| InvokeError::Ledger(e.to_string()))
    }
}

/// 组装提示词：上下文在前，消息按到达顺序排列
fn build_prompt(
    context: &str,
    messages: &[InboundMessage],
    target_handles: Option<&[String]>,
) -> String {
    let mut prompt = String::new();
    if !context.trim().is_empty() {
        prompt.push_str(context.trim());
        prompt.push_str("\n\n");
    }
    if let Some(handles) = target_handles {
        if !handles.is_empty() {
            prompt.push_str(&format!("Reply to: {}\n\n", handles.join(", ")));
        }
    }
    for message in messages {
        match &message.sender {
            Some(sender) => prompt.push_str(&format!("{}: {}\n", sender, message.text)),
            None => {
                prompt.push_str(&message.text);
                prompt.push('\n');
            }
        }
    }
    prompt
}

/// 远端会话已被回收的回复特征
fn is_session_not_found(result: &str) -> bool {
    let lower = result.to_lowercase();
    lower.contains("no conversation found") || lower.contains("session not found")
}

/// result 文本本身就是错误信号
fn is_error_signal(result: &str) -> bool {
    let lower = result.to_lowercase();
    lower.starts_with("api error") || lower.starts_with("error:")
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
