//! 队列处理器
//!
//! 周期轮询任务锁：锁空闲（或持有进程已消亡）且入站队列非空时，持锁把排队
//! 消息灌入会话管理器并触发 flush。排空在队列锁内一次完成，并发的轮询者
//! 不会重复消费同一条消息。轮询而非阻塞等待：锁竞争退化为有界延迟，
//! 不会死锁。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::lock::TaskLock;
use crate::core::queue::InboundQueue;
use crate::session::SessionManager;

/// 排队消息处理在锁记录里登记的任务名
pub const PROCESS_TASK: &str = "message_exchange";

pub struct QueueProcessor {
    queue: Arc<InboundQueue>,
    lock: Arc<TaskLock>,
    sessions: Arc<SessionManager>,
    poll_interval: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<InboundQueue>,
        lock: Arc<TaskLock>,
        sessions: Arc<SessionManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            lock,
            sessions,
            poll_interval,
        }
    }

    /// 轮询主循环；令牌取消后退出
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("queue processor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let drained = self.process_once().await;
                    if drained > 0 {
                        tracing::info!(count = drained, "drained queued messages");
                    }
                }
            }
        }
    }

    /// 单次处理：锁可用时排空队列并 flush；返回处理的消息数
    pub async fn process_once(&self) -> usize {
        if self.queue.is_empty().await {
            return 0;
        }
        if self.lock.is_locked() && !self.lock.is_stale() {
            if let Some(record) = self.lock.current_task() {
                tracing::debug!(
                    task = %record.task,
                    holder = record.pid,
                    "deferring queue drain, lock busy with {}",
                    TaskLock::task_description(&record.task)
                );
            }
            return 0;
        }
        // 调用智能体的工作必须先持锁，守卫保证所有退出路径都释放
        let Some(_guard) = self.lock.acquire_scoped(PROCESS_TASK, None) else {
            return 0;
        };

        let entries = self.queue.dequeue_all().await;
        if entries.is_empty() {
            return 0;
        }
        let count = entries.len();
        for entry in entries {
            self.sessions.add_message(entry.message).await;
        }
        self.sessions.flush().await;
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::session::{InboundMessage, SessionCache};

    fn components() -> (Arc<InboundQueue>, Arc<TaskLock>, Arc<SessionManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InboundQueue::new(50));
        let lock = Arc::new(TaskLock::new(dir.path().join("task.lock")));
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60), 10));
        let sessions = Arc::new(SessionManager::new(cache));
        (queue, lock, sessions, dir)
    }

    #[tokio::test]
    async fn test_locked_queue_stays_untouched() {
        let (queue, lock, sessions, _dir) = components();
        queue
            .enqueue(InboundMessage::new("chat1", "hello"), false)
            .await;
        assert!(lock.acquire("autonomous_cycle", None));

        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&lock),
            sessions,
            Duration::from_millis(10),
        );
        assert_eq!(processor.process_once().await, 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_after_release_and_no_double_processing() {
        let (queue, lock, sessions, _dir) = components();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sessions
            .set_batch_handler(move |_chat, msgs, _session| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    let mut seen = sink.lock().unwrap();
                    for m in msgs {
                        seen.push(m.text);
                    }
                })
            })
            .await;

        for i in 0..3 {
            queue
                .enqueue(InboundMessage::new("chat1", format!("m{}", i)), false)
                .await;
        }
        assert!(lock.acquire("autonomous_cycle", None));

        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&lock),
            Arc::clone(&sessions),
            Duration::from_millis(10),
        );
        assert_eq!(processor.process_once().await, 0);

        lock.release();
        assert_eq!(processor.process_once().await, 3);
        assert!(queue.is_empty().await);
        // 处理完成后锁已释放
        assert!(!lock.is_locked());
        assert_eq!(*seen.lock().unwrap(), vec!["m0", "m1", "m2"]);

        // 第二次轮询没有新消息，也不会重复投递
        assert_eq!(processor.process_once().await, 0);
        assert_eq!(seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_holder_is_bypassed() {
        let (queue, lock, sessions, _dir) = components();
        queue
            .enqueue(InboundMessage::new("chat1", "hello"), false)
            .await;

        #[cfg(unix)]
        {
            // 伪造一个持有者已消亡的记录
            let record = serde_json::json!({
                "task": "autonomous_cycle",
                "chat_id": null,
                "pid": i32::MAX as u32 - 1,
                "acquired_at": chrono::Utc::now().timestamp_millis(),
            });
            std::fs::write(
                _dir.path().join("task.lock"),
                serde_json::to_string_pretty(&record).unwrap(),
            )
            .unwrap();
            assert!(lock.is_stale());
        }

        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&lock),
            sessions,
            Duration::from_millis(10),
        );
        assert_eq!(processor.process_once().await, 1);
        assert!(queue.is_empty().await);
    }
}
