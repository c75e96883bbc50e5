//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `COURIER__*` 覆盖
//! （双下划线表示嵌套，如 `COURIER__AGENT__BINARY=claude`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::InvokerConfig;
use crate::core::BackoffConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub lock: LockSection,
}

/// [app] 段：应用名与数据目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 运行数据根目录，未设置时用 ./data
    pub data_dir: Option<PathBuf>,
}

/// [agent] 段：智能体子进程与各层级模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 外部智能体可执行文件
    pub binary: String,
    /// 单次调用超时（秒）
    pub timeout_secs: u64,
    pub primary_model: String,
    pub secondary_model: String,
    pub local_model: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            timeout_secs: 300,
            primary_model: "opus".to_string(),
            secondary_model: "sonnet".to_string(),
            local_model: "haiku".to_string(),
        }
    }
}

/// [backoff] 段：重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// [queue] 段：入站队列容量与轮询间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_size: usize,
    pub poll_interval_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_size: 100,
            poll_interval_secs: 5,
        }
    }
}

/// [session] 段：会话缓存参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            cache_max_entries: 50,
        }
    }
}

/// [ledger] 段：账本与交接存储目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    pub dir: PathBuf,
    pub handoff_dir: PathBuf,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/ledgers"),
            handoff_dir: PathBuf::from("data/handoffs"),
        }
    }
}

/// [lock] 段：跨进程锁记录位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub path: PathBuf,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/courier.lock"),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            agent: AgentSection::default(),
            backoff: BackoffSection::default(),
            queue: QueueSection::default(),
            session: SessionSection::default(),
            ledger: LedgerSection::default(),
            lock: LockSection::default(),
        }
    }
}

impl AppConfig {
    /// 退避参数的运行时形态
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            max_retries: self.backoff.max_retries,
            base_delay: Duration::from_millis(self.backoff.base_delay_ms),
            max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            multiplier: self.backoff.multiplier,
            jitter: self.backoff.jitter,
        }
    }

    /// 调用器配置的运行时形态
    pub fn invoker_config(&self) -> InvokerConfig {
        InvokerConfig {
            timeout_secs: self.agent.timeout_secs,
            primary_model: self.agent.primary_model.clone(),
            secondary_model: self.agent.secondary_model.clone(),
            local_model: self.agent.local_model.clone(),
            backoff: self.backoff_config(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 COURIER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 COURIER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COURIER")
            .separator("__")
            .try_parsing(true),
    );

    let built = builder.build()?;
    built.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.binary, "claude");
        assert_eq!(cfg.queue.max_size, 100);
        assert_eq!(cfg.session.cache_max_entries, 50);
        assert_eq!(cfg.backoff.max_retries, 3);
    }

    #[test]
    fn test_backoff_config_conversion() {
        let cfg = AppConfig::default();
        let backoff = cfg.backoff_config();
        assert_eq!(backoff.base_delay, Duration::from_millis(1000));
        assert_eq!(backoff.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_invoker_config_carries_models() {
        let mut cfg = AppConfig::default();
        cfg.agent.primary_model = "custom-big".to_string();
        let invoker = cfg.invoker_config();
        assert_eq!(invoker.primary_model, "custom-big");
        assert_eq!(invoker.timeout_secs, 300);
    }
}
