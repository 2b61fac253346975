//! # PACS网络层
//!
//! 提供面向远程PACS的客户端网络功能，包括：
//! - 连接注册表：端点的注册、校验、探测和持久化
//! - 查询引擎：按层级执行查询并归一化结果
//! - 检索引擎：逐个拉取对象，支持暂停、恢复和取消
//! - 请求调度器：按优先级限制所有出站请求的并发数
//! - 网络优化器：观测带宽和延迟，给出画质建议
//! - 服务门面：持有以上组件及其后台任务

pub mod delivery;
pub mod events;
pub mod optimizer;
pub mod query;
pub mod registry;
pub mod retrieval;
pub mod scheduler;
pub mod service;

// 重新导出主要类型
pub use delivery::{CloudDelivery, DeliveryRouter, DeliveryStrategy, LocalDelivery, PacsDelivery};
pub use events::{EventBus, PacsEvent};
pub use optimizer::{ImageQuality, NetworkOptimizer, NetworkStats};
pub use query::QueryEngine;
pub use registry::ConnectionRegistry;
pub use retrieval::{RetrievalEngine, RetrievalSettings};
pub use scheduler::{RequestFuture, RequestScheduler};
pub use service::{PacsNetworkService, ServiceBuilder};
