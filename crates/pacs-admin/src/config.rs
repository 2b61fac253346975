//! 配置管理
//!
//! 网络层的全部可调参数，支持默认值、TOML文件和 `PACS_*` 环境变量三层覆盖

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use pacs_core::Protocol;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

/// 网络层配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// 启用DIMSE协议
    pub enable_dimse: bool,
    /// 启用DICOMweb协议
    pub enable_dicomweb: bool,
    /// 启用WADO-URI协议
    pub enable_wado: bool,
    /// 启用预取
    pub enable_prefetch: bool,
    /// 启用带宽监测
    pub enable_bandwidth_monitoring: bool,
    /// 并发请求上限
    pub max_concurrent_connections: usize,
    /// 连接探测超时（毫秒）
    pub connection_timeout_ms: u64,
    /// 数据请求超时（毫秒）
    pub request_timeout_ms: u64,
    /// 单个对象的重试次数
    pub retry_attempts: u32,
    /// 重试间隔基数（毫秒）
    pub retry_delay_ms: u64,
    /// 单个缓存容量（MB）
    pub cache_size_mb: u64,
    /// 全局内存预算（MB）
    pub max_memory_usage_mb: u64,
    /// 触发回收的用量比例
    pub gc_threshold: f64,
    /// 阈值检查间隔（毫秒）
    pub gc_check_interval_ms: u64,
    /// 无条件回收间隔（毫秒）
    pub gc_interval_ms: u64,
    /// 预取的后续对象数
    pub prefetch_distance: usize,
    /// 链路带宽上限（Mbps）
    pub max_bandwidth_mbps: f64,
    /// 调度器节拍（毫秒）
    pub scheduler_tick_ms: u64,
    /// 注册表自动保存间隔（毫秒）
    pub autosave_interval_ms: u64,
    /// 注册表在键值存储中的键
    pub registry_key: String,
    /// 注册表存储目录
    pub registry_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_dimse: true,
            enable_dicomweb: true,
            enable_wado: true,
            enable_prefetch: true,
            enable_bandwidth_monitoring: true,
            max_concurrent_connections: 6,
            connection_timeout_ms: 30_000,
            request_timeout_ms: 60_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            cache_size_mb: 512,
            max_memory_usage_mb: 1024,
            gc_threshold: 0.8,
            gc_check_interval_ms: 5_000,
            gc_interval_ms: 30_000,
            prefetch_distance: 5,
            max_bandwidth_mbps: 100.0,
            scheduler_tick_ms: 50,
            autosave_interval_ms: 60_000,
            registry_key: "pacs_connections".to_string(),
            registry_path: "./data/registry".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn gc_check_interval(&self) -> Duration {
        Duration::from_millis(self.gc_check_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_millis(self.autosave_interval_ms)
    }

    /// 已启用的协议族
    pub fn enabled_protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if self.enable_dimse {
            protocols.push(Protocol::Dimse);
        }
        if self.enable_dicomweb {
            protocols.push(Protocol::DicomWeb);
        }
        if self.enable_wado {
            protocols.push(Protocol::Wado);
        }
        protocols
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<NetworkConfig>>,
    config_path: Option<String>,
    validator: ConfigValidator,
}

impl ConfigManager {
    /// 加载配置；未给出路径时只使用默认值和环境变量
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.map(str::to_string),
            validator,
        })
    }

    /// 使用给定配置创建，不读取文件和环境变量
    pub fn from_config(config: NetworkConfig) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            validator,
        })
    }

    fn load_config(config_path: Option<&str>) -> Result<NetworkConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("PACS").try_parsing(true))
            .build()
            .context("Failed to build configuration")?;

        let config: NetworkConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        info!("Configuration loaded from: {}", config_path.unwrap_or("<defaults>"));
        Ok(config)
    }

    pub async fn get_config(&self) -> NetworkConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, new_config: NetworkConfig) -> Result<()> {
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;

        if self.config_path.is_some() {
            self.save_config().await?;
        }
        info!("Configuration updated successfully");
        Ok(())
    }

    /// 保存为TOML
    pub async fn save_config(&self) -> Result<()> {
        let path = self
            .config_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No configuration file path set"))?;
        let config = self.config.read().await;
        let content = toml::to_string_pretty(&*config).context("Failed to serialize configuration")?;

        tokio::fs::write(path, content)
            .await
            .context("Failed to write configuration file")?;
        info!("Configuration saved to: {}", path);
        Ok(())
    }

    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(self.config_path.as_deref())?;
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;
        Ok(())
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&NetworkConfig) -> bool,
    error_message: &'static str,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "max_concurrent_connections",
                validator: |c| c.max_concurrent_connections > 0,
                error_message: "Max concurrent connections cannot be 0",
            },
            ValidationRule {
                field_path: "connection_timeout_ms",
                validator: |c| c.connection_timeout_ms > 0 && c.request_timeout_ms > 0,
                error_message: "Timeouts must be positive",
            },
            ValidationRule {
                field_path: "gc_threshold",
                validator: |c| c.gc_threshold > 0.0 && c.gc_threshold <= 1.0,
                error_message: "GC threshold must be in (0, 1]",
            },
            ValidationRule {
                field_path: "cache_size_mb",
                validator: |c| c.cache_size_mb > 0 && c.cache_size_mb <= c.max_memory_usage_mb,
                error_message: "Cache size must be positive and not exceed max memory usage",
            },
            ValidationRule {
                field_path: "scheduler_tick_ms",
                validator: |c| c.scheduler_tick_ms > 0 && c.gc_check_interval_ms > 0 && c.gc_interval_ms > 0,
                error_message: "Background intervals must be positive",
            },
            ValidationRule {
                field_path: "enable_*",
                validator: |c| !c.enabled_protocols().is_empty(),
                error_message: "At least one protocol must be enabled",
            },
            ValidationRule {
                field_path: "registry_key",
                validator: |c| !c.registry_key.is_empty(),
                error_message: "Registry key cannot be empty",
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &NetworkConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if !(rule.validator)(config) {
                error!("Configuration validation failed for {}", rule.field_path);
                return Err(anyhow::anyhow!("{}: {}", rule.field_path, rule.error_message));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
