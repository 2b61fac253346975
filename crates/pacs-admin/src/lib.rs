//! # PACS管理模块
//!
//! 提供网络层的配置加载、验证与持久化

pub mod config;

pub use config::{ConfigManager, ConfigValidator, NetworkConfig};
