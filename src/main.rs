//! courier 主程序
//!
//! 装配编排核心：入站队列 + 任务锁 + 会话管理器 + 智能体调用器，然后运行
//! 队列处理循环。消息接入与外发由外部协作进程完成——它们只需读写同一个
//! 队列与锁记录位置；这里把每批的回复交给日志/总线，自己绝不直接投递。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier::agent::{AgentInvoker, SubprocessBackend};
use courier::config::{load_config, AppConfig};
use courier::core::{InboundQueue, QueueProcessor, TaskLock};
use courier::ledger::LedgerManager;
use courier::session::{SessionCache, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let queue = Arc::new(InboundQueue::new(cfg.queue.max_size));
    let lock = Arc::new(TaskLock::new(&cfg.lock.path));
    let cache = Arc::new(SessionCache::new(
        Duration::from_secs(cfg.session.cache_ttl_secs),
        cfg.session.cache_max_entries,
    ));
    let sessions = Arc::new(SessionManager::new(Arc::clone(&cache)));
    let ledgers = Arc::new(LedgerManager::new(&cfg.ledger.dir, &cfg.ledger.handoff_dir));

    let backend = Arc::new(SubprocessBackend::new(cfg.agent.binary.clone()));
    let invoker = Arc::new(
        AgentInvoker::new(backend, cfg.invoker_config()).with_ledger(Arc::clone(&ledgers)),
    );

    // 批处理回调：整批消息交给智能体，回复与新会话 ID 落账
    {
        let invoker = Arc::clone(&invoker);
        let sessions_for_handler = Arc::clone(&sessions);
        let ledgers_for_handler = Arc::clone(&ledgers);
        sessions
            .set_batch_handler(move |chat, messages, session_id| {
                let invoker = Arc::clone(&invoker);
                let sessions = Arc::clone(&sessions_for_handler);
                let ledgers = Arc::clone(&ledgers_for_handler);
                Box::pin(async move {
                    // 没有会话可恢复时，用最近一次交接的回顾做接续上下文
                    let context = if session_id.is_none() {
                        ledgers
                            .most_recent_handoff(&chat)
                            .map(|handoff| ledgers.context_from_handoff(&handoff))
                            .unwrap_or_default()
                    } else {
                        String::new()
                    };

                    match invoker
                        .invoke_batch(&messages, &context, session_id, None, Some(&chat))
                        .await
                    {
                        Ok(result) => {
                            if let Some(new_session) = &result.session_id {
                                sessions.record_response(new_session, None, &chat).await;
                            }
                            // 外发传输是外部协作方：回复写日志，由总线投递
                            tracing::info!(chat = %chat, reply = %result.response, "batch processed");
                        }
                        Err(e) => {
                            // 完整诊断进日志；对外只应产生一条通用的重试提示
                            tracing::error!(chat = %chat, error = %e, "agent invocation failed");
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
        Duration::from_secs(cfg.queue.poll_interval_secs),
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            trigger.cancel();
        }
    });

    tracing::info!(
        queue_capacity = cfg.queue.max_size,
        poll_interval_secs = cfg.queue.poll_interval_secs,
        "courier orchestration core started"
    );
    processor.run(shutdown).await;
    Ok(())
}
