//! 入站消息队列
//!
//! 有界、按消息标识去重的 FIFO。消息监听方在任务锁被占用时把消息放到这里，
//! 队列处理器在锁空闲后统一排空。多个调用方可并发入队；排空在同一把锁内
//! 一次完成，保证既不丢消息也不会重复消费。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::session::InboundMessage;

/// 入队条目：载荷 + 入队时间 + 已确认标记
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub message: InboundMessage,
    /// 入队时间（毫秒时间戳）
    pub queued_at: i64,
    /// 是否已向发送方确认收到
    pub acknowledged: bool,
}

/// 有界去重队列
pub struct InboundQueue {
    entries: Mutex<VecDeque<QueuedMessage>>,
    max_size: usize,
}

impl InboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
        }
    }

    /// 入队；重复的消息标识直接拒绝（返回 false），容量满时先丢弃最旧的一条
    pub async fn enqueue(&self, message: InboundMessage, acknowledged: bool) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.message.id == message.id) {
            tracing::debug!(id = %message.id, "duplicate message ignored");
            return false;
        }
        if entries.len() >= self.max_size {
            if let Some(dropped) = entries.pop_front() {
                tracing::warn!(id = %dropped.message.id, "queue full, dropping oldest entry");
            }
        }
        entries.push_back(QueuedMessage {
            message,
            queued_at: chrono::Utc::now().timestamp_millis(),
            acknowledged,
        });
        true
    }

    /// 取出全部条目（到达顺序）并清空队列
    pub async fn dequeue_all(&self) -> Vec<QueuedMessage> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).collect()
    }

    /// 只取出指定会话的条目；其余条目保持原有顺序
    pub async fn dequeue_chat(&self, chat_id: &str) -> Vec<QueuedMessage> {
        let mut entries = self.entries.lock().await;
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(entries.len());
        for entry in entries.drain(..) {
            if entry.message.chat_id == chat_id {
                taken.push(entry);
            } else {
                rest.push_back(entry);
            }
        }
        *entries = rest;
        taken
    }

    /// 当前排队的会话标识（去重，保持首次出现顺序）
    pub async fn queued_chats(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut chats: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !chats.iter().any(|c| c == &entry.message.chat_id) {
                chats.push(entry.message.chat_id.clone());
            }
        }
        chats
    }

    /// 清空队列
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    /// 当前条目数
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
