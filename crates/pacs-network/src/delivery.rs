//! 检索结果投递
//!
//! 每种目标类型一个 [`DeliveryStrategy`]，由 [`DeliveryRouter`] 按
//! [`DestinationKind`] 选择。新增目标只需注册新的策略。
//! 需要访问网络的策略由调用方放进请求调度器执行。

use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjectPath, ObjectStore};
use pacs_core::{Capability, Destination, DestinationKind, DicomQueryResult, PacsError, Result};
use pacs_storage::{CacheName, MemoryManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// 缓存中使用的对象键
pub fn cache_key(item: &DicomQueryResult) -> &str {
    item.sop_instance_uid().unwrap_or(item.uid.as_str())
}

/// 投递策略
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    async fn deliver(&self, destination: &Destination, item: &DicomQueryResult, data: Bytes) -> Result<()>;

    /// 是否发起网络请求
    fn uses_network(&self) -> bool {
        true
    }
}

/// 写入本地内存缓存
pub struct LocalDelivery {
    memory: Arc<MemoryManager>,
}

impl LocalDelivery {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl DeliveryStrategy for LocalDelivery {
    async fn deliver(&self, _destination: &Destination, item: &DicomQueryResult, data: Bytes) -> Result<()> {
        let key = cache_key(item);
        let metadata = serde_json::to_vec(&item.data)?;
        self.memory.put(CacheName::Image, key, data).await?;
        self.memory
            .put(CacheName::Metadata, key, Bytes::from(metadata))
            .await?;
        debug!("对象 {} 已写入本地缓存", key);
        Ok(())
    }

    fn uses_network(&self) -> bool {
        false
    }
}

/// 转发到另一个PACS连接
pub struct PacsDelivery {
    registry: Arc<ConnectionRegistry>,
}

impl PacsDelivery {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliveryStrategy for PacsDelivery {
    async fn deliver(&self, destination: &Destination, item: &DicomQueryResult, data: Bytes) -> Result<()> {
        let Destination::Pacs { connection_id } = destination else {
            return Err(PacsError::Config(format!("PACS投递收到了错误的目标: {:?}", destination)));
        };

        let connection = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| PacsError::Config(format!("连接 {} 不存在", connection_id)))?;
        if !connection.supports(Capability::StowRs) && !connection.supports(Capability::Store) {
            return Err(PacsError::Config(format!("连接 {} 不支持存储", connection_id)));
        }

        let transport = self.registry.transport(connection_id).await?;
        let started = Instant::now();
        match transport.store(data).await {
            Ok(()) => {
                self.registry.record_store(connection_id, started.elapsed()).await;
                debug!("对象 {} 已转发到连接 {}", cache_key(item), connection_id);
                Ok(())
            }
            Err(e) => {
                self.registry.record_error(connection_id, &e).await;
                Err(e)
            }
        }
    }
}

/// 上传到对象存储
pub struct CloudDelivery {
    store: Arc<dyn ObjectStore>,
}

impl CloudDelivery {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// `{path}/{study}/{series}/{sop}.dcm`
    pub fn object_path(base: &str, item: &DicomQueryResult) -> Result<ObjectPath> {
        let (study, series, sop) = item.object_uids()?;
        let base = base.trim_matches('/');
        let location = if base.is_empty() {
            format!("{}/{}/{}.dcm", study, series, sop)
        } else {
            format!("{}/{}/{}/{}.dcm", base, study, series, sop)
        };
        ObjectPath::parse(location).map_err(|e| PacsError::Storage(e.to_string()))
    }
}

#[async_trait]
impl DeliveryStrategy for CloudDelivery {
    async fn deliver(&self, destination: &Destination, item: &DicomQueryResult, data: Bytes) -> Result<()> {
        let Destination::Cloud { path } = destination else {
            return Err(PacsError::Config(format!("云投递收到了错误的目标: {:?}", destination)));
        };

        let location = Self::object_path(path, item)?;
        self.store
            .put(&location, data)
            .await
            .map_err(|e| PacsError::Storage(format!("上传 {} 失败: {}", location, e)))?;
        debug!("对象已上传: {}", location);
        Ok(())
    }
}

/// 按目标类型分派的投递路由
#[derive(Default)]
pub struct DeliveryRouter {
    strategies: HashMap<DestinationKind, Arc<dyn DeliveryStrategy>>,
}

impl DeliveryRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: DestinationKind, strategy: Arc<dyn DeliveryStrategy>) {
        self.strategies.insert(kind, strategy);
    }

    pub fn with_strategy(mut self, kind: DestinationKind, strategy: Arc<dyn DeliveryStrategy>) -> Self {
        self.register(kind, strategy);
        self
    }

    pub fn supports(&self, kind: DestinationKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    /// 该目标的投递是否走网络，未注册的目标按不走网络处理
    pub fn uses_network(&self, kind: DestinationKind) -> bool {
        self.strategies.get(&kind).is_some_and(|s| s.uses_network())
    }

    pub async fn deliver(&self, destination: &Destination, item: &DicomQueryResult, data: Bytes) -> Result<()> {
        let strategy = self.strategies.get(&destination.kind()).ok_or_else(|| {
            PacsError::Config(format!("没有 {:?} 目标的投递策略", destination.kind()))
        })?;
        strategy.deliver(destination, item, data).await
    }
}
