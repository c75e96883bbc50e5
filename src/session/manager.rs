//! 会话管理器
//!
//! 按 chat 缓冲入站消息；`flush` 时把整批消息连同当前远端会话 ID 交给批处理回调，
//! 回调落账后由 `record_response` 登记新的会话 ID。同一 chat 的批次严格串行：
//! 上一批的回复未落账前，下一次 flush 对该 chat 不会开始。`add_message` 只进缓冲，
//! 绝不同步触发处理。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::session::cache::{SessionCache, SessionState};

/// 入站消息载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// 稳定标识（平台消息 guid；缺失时由接入层生成 uuid）
    pub id: String,
    pub chat_id: String,
    /// 发送者显示名
    pub sender: Option<String>,
    pub text: String,
    /// 接收时间（毫秒时间戳）
    pub received_at: i64,
}

impl InboundMessage {
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            chat_id: chat_id.into(),
            sender: None,
            text: text.into(),
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// 批处理回调：(chat_id, 按到达顺序的消息, 当前远端会话 ID)
pub type BatchHandler = dyn Fn(String, Vec<InboundMessage>, Option<String>) -> Pin<Box<dyn Future<Output = ()> + Send>>
    + Send
    + Sync;

/// 会话蒸馏回调：(远端会话 ID, 该会话累计的全部消息)
pub type SessionExpiredHandler =
    dyn Fn(String, Vec<InboundMessage>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync;

#[derive(Default)]
struct ChatRecords {
    /// 待 flush 的消息缓冲
    buffers: HashMap<String, Vec<InboundMessage>>,
    /// 会话状态（权威副本）
    states: HashMap<String, SessionState>,
    /// 已 flush 消息的累计（蒸馏用，跨多个 flush 周期）
    history: HashMap<String, Vec<InboundMessage>>,
    /// 每个 chat 的批次串行锁
    seq_locks: HashMap<String, Arc<Mutex<()>>>,
}

pub struct SessionManager {
    records: Mutex<ChatRecords>,
    cache: Arc<SessionCache>,
    batch_handler: RwLock<Option<Arc<BatchHandler>>>,
    expired_handler: RwLock<Option<Arc<SessionExpiredHandler>>>,
}

impl SessionManager {
    pub fn new(cache: Arc<SessionCache>) -> Self {
        Self {
            records: Mutex::new(ChatRecords::default()),
            cache,
            batch_handler: RwLock::new(None),
            expired_handler: RwLock::new(None),
        }
    }

    /// 注册批处理回调
    pub async fn set_batch_handler<F>(&self, handler: F)
    where
        F: Fn(String, Vec<InboundMessage>, Option<String>) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let handler: Arc<BatchHandler> = Arc::new(handler);
        *self.batch_handler.write().await = Some(handler);
    }

    /// 注册会话蒸馏回调
    pub async fn set_expired_handler<F>(&self, handler: F)
    where
        F: Fn(String, Vec<InboundMessage>) -> Pin<Box<dyn Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let handler: Arc<SessionExpiredHandler> = Arc::new(handler);
        *self.expired_handler.write().await = Some(handler);
    }

    /// 追加消息到该 chat 的缓冲；绝不在此处触发批处理
    pub async fn add_message(&self, message: InboundMessage) {
        let mut records = self.records.lock().await;
        let chat_id = message.chat_id.clone();
        let state = records
            .states
            .entry(chat_id.clone())
            .or_insert_with(|| SessionState::new(chat_id.clone()));
        state.last_read_at = Some(chrono::Utc::now().timestamp_millis());
        records.buffers.entry(chat_id).or_default().push(message);
    }

    /// 逐 chat 冲刷缓冲：有消息的 chat 各触发一次批处理回调，随后缓冲清空；
    /// 没有缓冲消息的 chat 不产生回调
    pub async fn flush(&self) {
        let handler = self.batch_handler.read().await.clone();

        let mut batches = Vec::new();
        {
            let mut guard = self.records.lock().await;
            let records = &mut *guard;
            let chats: Vec<String> = records
                .buffers
                .iter()
                .filter(|(_, msgs)| !msgs.is_empty())
                .map(|(chat, _)| chat.clone())
                .collect();
            for chat in chats {
                let msgs = records.buffers.remove(&chat).unwrap_or_default();
                let session_id = records
                    .states
                    .get(&chat)
                    .and_then(|s| s.session_id.clone());
                let seq = Arc::clone(
                    records
                        .seq_locks
                        .entry(chat.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(()))),
                );
                batches.push((chat, msgs, session_id, seq));
            }
        }

        for (chat, msgs, session_id, seq) in batches {
            // 同一 chat 串行：上一批未落账时在此等待
            let _guard = seq.lock().await;
            if let Some(handler) = &handler {
                handler(chat.clone(), msgs.clone(), session_id).await;
            }
            let mut records = self.records.lock().await;
            records.history.entry(chat).or_default().extend(msgs);
        }
    }

    /// 记录一次回复：登记远端会话 ID 并刷新缓存镜像
    pub async fn record_response(
        &self,
        session_id: &str,
        response_row_id: Option<&str>,
        chat_id: &str,
    ) {
        let state = {
            let mut records = self.records.lock().await;
            let state = records
                .states
                .entry(chat_id.to_string())
                .or_insert_with(|| SessionState::new(chat_id));
            state.session_id = Some(session_id.to_string());
            state.last_response_id = response_row_id.map(|s| s.to_string());
            state.last_response_at = Some(chrono::Utc::now().timestamp_millis());
            state.clone()
        };
        self.cache.set(chat_id, state).await;
    }

    /// 当前远端会话 ID；内存中没有时回落到缓存镜像
    pub async fn get_current_session_id(&self, chat_id: &str) -> Option<String> {
        {
            let records = self.records.lock().await;
            if let Some(state) = records.states.get(chat_id) {
                if state.session_id.is_some() {
                    return state.session_id.clone();
                }
            }
        }
        let cached = self.cache.get(chat_id).await?;
        if cached.session_id.is_some() {
            let mut records = self.records.lock().await;
            records.states.insert(chat_id.to_string(), cached.clone());
        }
        cached.session_id
    }

    /// 清除会话关联；需要蒸馏且该会话有累计消息时，先回调恰好一次再丢弃
    pub async fn clear_session(&self, chat_id: &str, trigger_distillation: bool) {
        let handler = self.expired_handler.read().await.clone();
        let (session_id, history) = {
            let mut records = self.records.lock().await;
            let session_id = records.states.remove(chat_id).and_then(|s| s.session_id);
            let history = records.history.remove(chat_id).unwrap_or_default();
            records.buffers.remove(chat_id);
            (session_id, history)
        };
        self.cache.remove(chat_id).await;

        if trigger_distillation && !history.is_empty() {
            if let (Some(handler), Some(session_id)) = (handler, session_id) {
                tracing::info!(
                    chat = %chat_id,
                    session = %session_id,
                    messages = history.len(),
                    "session cleared, handing history off for distillation"
                );
                handler(session_id, history).await;
            }
        }
    }

    /// 指定 chat 当前缓冲的消息数
    pub async fn buffered_count(&self, chat_id: &str) -> usize {
        self.records
            .lock()
            .await
            .buffers
            .get(chat_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}
