//! 桥接端到端集成测试

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use courier::agent::{AgentBackend, AgentInvoker, AgentRequest, InvokerConfig};
    use courier::agent::InvokeError;
    use courier::core::{BackoffConfig, InboundQueue, QueueProcessor, TaskLock};
    use courier::session::{InboundMessage, SessionCache, SessionManager};

    /// 固定回放同一个 JSON 回复的后端，记录收到的请求
    struct EchoBackend {
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl EchoBackend {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AgentBackend for EchoBackend {
        async fn invoke(&self, request: &AgentRequest) -> Result<String, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(r#"{"result":"Got all three — on it.","session_id":"1700000000-55555"}"#.to_string())
        }
    }

    fn fast_invoker_config() -> InvokerConfig {
        InvokerConfig {
            timeout_secs: 5,
            backoff: BackoffConfig {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..InvokerConfig::default()
        }
    }

    /// 锁被别的任务占用时消息滞留队列；释放后一次轮询把三条消息
    /// 合成一个批次交给智能体，顺序保持到达顺序
    #[tokio::test]
    async fn test_queued_messages_drain_into_single_batch() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InboundQueue::new(50));
        let lock = Arc::new(TaskLock::new(dir.path().join("task.lock")));
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60), 10));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&cache)));

        let backend = Arc::new(EchoBackend::new());
        let invoker = Arc::new(AgentInvoker::new(
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            fast_invoker_config(),
        ));

        let batches: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let invoker = Arc::clone(&invoker);
            let sessions_for_handler = Arc::clone(&sessions);
            let sink = Arc::clone(&batches);
            sessions
                .set_batch_handler(move |chat, messages, session_id| {
                    let invoker = Arc::clone(&invoker);
                    let sessions = Arc::clone(&sessions_for_handler);
                    let sink = Arc::clone(&sink);
                    Box::pin(async move {
                        sink.lock()
                            .unwrap()
                            .push(messages.iter().map(|m| m.text.clone()).collect());
                        let result = invoker
                            .invoke_batch(&messages, "", session_id, None, Some(&chat))
                            .await
                            .expect("invocation should succeed");
                        if let Some(new_session) = &result.session_id {
                            sessions.record_response(new_session, None, &chat).await;
                        }
                    })
                })
                .await;
        }

        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&lock),
            Arc::clone(&sessions),
            Duration::from_millis(10),
        );

        // 别的任务（定时自主循环）持有锁
        assert!(lock.acquire("autonomous_cycle", None));

        for text in ["first", "second", "third"] {
            assert!(queue.enqueue(InboundMessage::new("C", text), false).await);
        }

        // 锁被占用：消息滞留
        assert_eq!(processor.process_once().await, 0);
        assert_eq!(queue.len().await, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // 释放后一次轮询全部排空
        lock.release();
        assert_eq!(processor.process_once().await, 3);
        assert!(queue.is_empty().await);

        // 批处理回调恰好一次，三条消息按到达顺序
        let seen = batches.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["first", "second", "third"]);
        drop(seen);

        // 智能体只被调用一次，提示词按顺序包含全部消息
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let prompts = backend.prompts.lock().unwrap();
        let first = prompts[0].find("first").unwrap();
        let second = prompts[0].find("second").unwrap();
        let third = prompts[0].find("third").unwrap();
        assert!(first < second && second < third);
        drop(prompts);

        // 回复落账：会话 ID 已记录，锁已释放
        assert_eq!(
            sessions.get_current_session_id("C").await.as_deref(),
            Some("1700000000-55555")
        );
        assert!(!lock.is_locked());
    }

    /// 第二批复用已落账的会话 ID 作为恢复令牌
    #[tokio::test]
    async fn test_second_batch_resumes_recorded_session() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InboundQueue::new(50));
        let lock = Arc::new(TaskLock::new(dir.path().join("task.lock")));
        let cache = Arc::new(SessionCache::new(Duration::from_secs(60), 10));
        let sessions = Arc::new(SessionManager::new(Arc::clone(&cache)));

        struct ResumeProbe {
            resumes: Mutex<Vec<Option<String>>>,
        }

        #[async_trait]
        impl AgentBackend for ResumeProbe {
            async fn invoke(&self, request: &AgentRequest) -> Result<String, InvokeError> {
                self.resumes
                    .lock()
                    .unwrap()
                    .push(request.resume_session_id.clone());
                Ok(r#"{"result":"ok","session_id":"1700000000-66666"}"#.to_string())
            }
        }

        let backend = Arc::new(ResumeProbe {
            resumes: Mutex::new(Vec::new()),
        });
        let invoker = Arc::new(AgentInvoker::new(
            Arc::clone(&backend) as Arc<dyn AgentBackend>,
            fast_invoker_config(),
        ));

        {
            let invoker = Arc::clone(&invoker);
            let sessions_for_handler = Arc::clone(&sessions);
            sessions
                .set_batch_handler(move |chat, messages, session_id| {
                    let invoker = Arc::clone(&invoker);
                    let sessions = Arc::clone(&sessions_for_handler);
                    Box::pin(async move {
                        if let Ok(result) = invoker
                            .invoke_batch(&messages, "", session_id, None, Some(&chat))
                            .await
                        {
                            if let Some(new_session) = &result.session_id {
                                sessions.record_response(new_session, None, &chat).await;
                            }
                        }
                    })
                })
                .await;
        }

        let processor = QueueProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&lock),
            Arc::clone(&sessions),
            Duration::from_millis(10),
        );

        queue.enqueue(InboundMessage::new("C", "start a session"), false).await;
        assert_eq!(processor.process_once().await, 1);

        queue.enqueue(InboundMessage::new("C", "and continue it"), false).await;
        assert_eq!(processor.process_once().await, 1);

        let resumes = backend.resumes.lock().unwrap();
        assert_eq!(resumes.len(), 2);
        assert!(resumes[0].is_none());
        assert_eq!(resumes[1].as_deref(), Some("1700000000-66666"));
    }
}
