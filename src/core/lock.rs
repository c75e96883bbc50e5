//! 跨进程任务锁
//!
//! 互斥状态是一条公知路径上的 JSON 记录：任务名、可选的会话范围、持有进程 pid、
//! 获取时间。消息监听、定时自主循环、调用运行时等协作进程都读写同一条记录。
//! 过期判定看持有进程是否还活着，而不是持有了多久。
//!
//! 记录只有一个槽位，因此任何存活的持有者都会排斥后来者；会话范围记录在案，
//! 供诊断与 `current_task` 展示。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 锁记录（对所有协作进程可见）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// 任务名（如 message_exchange / autonomous_cycle）
    pub task: String,
    /// 会话范围；None 表示全局
    pub chat_id: Option<String>,
    /// 持有者进程 ID
    pub pid: u32,
    /// 获取时间（毫秒时间戳）
    pub acquired_at: i64,
}

/// 文件持久化的任务锁
pub struct TaskLock {
    path: PathBuf,
}

impl TaskLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_record(&self) -> Option<LockRecord> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&data).ok()
    }

    fn write_record(&self, record: &LockRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    /// 尝试获取锁；无存活持有者时写入自己的记录并返回 true。
    /// 持有进程已消亡的记录被直接接管（告警一次）。
    pub fn acquire(&self, task: &str, chat_id: Option<&str>) -> bool {
        if let Some(held) = self.read_record() {
            if pid_alive(held.pid) {
                return false;
            }
            tracing::warn!(
                pid = held.pid,
                task = %held.task,
                "lock holder no longer alive, taking over"
            );
        }
        let record = LockRecord {
            task: task.to_string(),
            chat_id: chat_id.map(|c| c.to_string()),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().timestamp_millis(),
        };
        match self.write_record(&record) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("failed to write lock record: {}", e);
                false
            }
        }
    }

    /// RAII 获取；守卫析构时释放（包括 panic 等提前退出路径）
    pub fn acquire_scoped(&self, task: &str, chat_id: Option<&str>) -> Option<LockGuard<'_>> {
        if self.acquire(task, chat_id) {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }

    /// 释放锁；未持有时为空操作，绝不报错
    pub fn release(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("failed to remove lock record: {}", e);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.read_record().is_some()
    }

    /// 当前持有者记录；未持有时为 None
    pub fn current_task(&self) -> Option<LockRecord> {
        self.read_record()
    }

    /// 持有进程已不存在即视为过期（与持有时长无关）
    pub fn is_stale(&self) -> bool {
        self.read_record()
            .map(|r| !pid_alive(r.pid))
            .unwrap_or(false)
    }

    /// 已知任务名映射为可读描述；未知名称原样返回
    pub fn task_description(task: &str) -> String {
        match task {
            "autonomous_cycle" => "a scheduled autonomous cycle".to_string(),
            "message_exchange" => "an interactive message exchange".to_string(),
            "distillation" => "a session distillation pass".to_string(),
            other => other.to_string(),
        }
    }
}

/// 锁守卫：析构时释放
pub struct LockGuard<'a> {
    lock: &'a TaskLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM：进程存在但无权限发信号，同样算活着
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // 没有可移植的探测手段时保守假定存活，让竞争退化为等待
    true
}
