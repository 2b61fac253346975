//! 网络层服务
//!
//! [`PacsNetworkService`] 持有注册表、调度器、内存管理器、优化器和两个引擎，
//! 以及它们的后台任务。所有后台任务挂在同一个取消令牌下，关闭时统一停止。
//! 未启动或已关闭的服务上发起的查询和检索会立即失败。

use crate::delivery::{CloudDelivery, DeliveryRouter, LocalDelivery, PacsDelivery};
use crate::events::{EventBus, PacsEvent};
use crate::optimizer::NetworkOptimizer;
use crate::query::QueryEngine;
use crate::registry::ConnectionRegistry;
use crate::retrieval::{RetrievalEngine, RetrievalSettings};
use crate::scheduler::RequestScheduler;
use object_store::ObjectStore;
use pacs_admin::NetworkConfig;
use pacs_core::utils::megabytes;
use pacs_core::{DestinationKind, Result};
use pacs_dicom::{DefaultTransportFactory, TransportFactory, TransportSettings};
use pacs_storage::{FileKeyValueStore, KeyValueStore, MemoryConfig, MemoryManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 服务构建器
pub struct ServiceBuilder {
    config: NetworkConfig,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    key_value_store: Option<Arc<dyn KeyValueStore>>,
    cloud_store: Option<Arc<dyn ObjectStore>>,
}

impl ServiceBuilder {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            transport_factory: None,
            key_value_store: None,
            cloud_store: None,
        }
    }

    /// 替换协议传输工厂，默认按配置启用的协议创建
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// 替换注册表持久化存储，默认写入 `registry_path` 目录
    pub fn key_value_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.key_value_store = Some(store);
        self
    }

    /// 启用云投递目标
    pub fn cloud_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.cloud_store = Some(store);
        self
    }

    pub fn build(self) -> Result<PacsNetworkService> {
        let config = self.config;

        let transports: Arc<dyn TransportFactory> = match self.transport_factory {
            Some(factory) => factory,
            None => {
                let settings = TransportSettings {
                    connection_timeout: config.connection_timeout(),
                    request_timeout: config.request_timeout(),
                };
                Arc::new(DefaultTransportFactory::new(settings, config.enabled_protocols())?)
            }
        };
        let store: Arc<dyn KeyValueStore> = match self.key_value_store {
            Some(store) => store,
            None => Arc::new(FileKeyValueStore::new(&config.registry_path)),
        };

        let events = EventBus::default();
        let scheduler = Arc::new(RequestScheduler::new(config.max_concurrent_connections));
        let registry = Arc::new(ConnectionRegistry::new(transports, scheduler.clone(), events.clone()));
        let memory = Arc::new(MemoryManager::new(MemoryConfig {
            max_usage: megabytes(config.max_memory_usage_mb),
            cache_capacity: megabytes(config.cache_size_mb),
            gc_threshold: config.gc_threshold,
        }));
        let optimizer = Arc::new(NetworkOptimizer::new(
            config.max_bandwidth_mbps,
            config.enable_bandwidth_monitoring,
        ));

        let mut router = DeliveryRouter::new()
            .with_strategy(DestinationKind::Local, Arc::new(LocalDelivery::new(memory.clone())))
            .with_strategy(DestinationKind::Pacs, Arc::new(PacsDelivery::new(registry.clone())));
        if let Some(cloud) = self.cloud_store {
            router.register(DestinationKind::Cloud, Arc::new(CloudDelivery::new(cloud)));
        }

        let queries = QueryEngine::new(
            registry.clone(),
            scheduler.clone(),
            optimizer.clone(),
            events.clone(),
        );
        let retrieval = RetrievalEngine::new(
            registry.clone(),
            scheduler.clone(),
            memory.clone(),
            optimizer.clone(),
            Arc::new(router),
            events.clone(),
            RetrievalSettings::from(&config),
        );

        Ok(PacsNetworkService {
            config,
            events,
            registry,
            scheduler,
            memory,
            optimizer,
            queries,
            retrieval,
            store,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// PACS网络层服务
pub struct PacsNetworkService {
    config: NetworkConfig,
    events: EventBus,
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<RequestScheduler>,
    memory: Arc<MemoryManager>,
    optimizer: Arc<NetworkOptimizer>,
    queries: QueryEngine,
    retrieval: RetrievalEngine,
    store: Arc<dyn KeyValueStore>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PacsNetworkService {
    /// 使用默认组件创建服务
    pub fn new(config: NetworkConfig) -> Result<Self> {
        ServiceBuilder::new(config).build()
    }

    pub fn builder(config: NetworkConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    /// 加载注册表并启动后台任务
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        self.registry
            .load(self.store.as_ref(), &self.config.registry_key)
            .await?;

        tasks.push(
            self.scheduler
                .start(self.config.scheduler_tick(), self.shutdown.child_token()),
        );
        tasks.push(self.spawn_pressure_check());
        tasks.push(self.spawn_periodic_eviction());
        tasks.push(self.spawn_autosave());

        info!(
            "PACS网络服务已启动: 并发 {}, 内存预算 {} MB",
            self.config.max_concurrent_connections, self.config.max_memory_usage_mb
        );
        Ok(())
    }

    /// 取消进行中的任务，停止后台任务并保存注册表
    pub async fn shutdown(&self) -> Result<()> {
        let jobs = self.retrieval.cancel_all().await;
        let queries = self.queries.cancel_all().await;
        if jobs + queries > 0 {
            info!("关闭前取消了 {} 个检索任务和 {} 个查询", jobs, queries);
        }

        self.shutdown.cancel();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {}", e);
            }
        }
        // 未启动过的服务没有节拍任务
        self.scheduler.stop().await;

        self.registry
            .save(self.store.as_ref(), &self.config.registry_key)
            .await?;
        info!("PACS网络服务已停止");
        Ok(())
    }

    /// 用量超过阈值时回收
    fn spawn_pressure_check(&self) -> JoinHandle<()> {
        let memory = self.memory.clone();
        let events = self.events.clone();
        spawn_ticker(
            self.config.gc_check_interval(),
            self.shutdown.child_token(),
            move || {
                let memory = memory.clone();
                let events = events.clone();
                async move {
                    if let Some(report) = memory.check_pressure().await {
                        events.publish(PacsEvent::CacheEvicted { report });
                    }
                }
            },
        )
    }

    /// 无条件的定时回收
    fn spawn_periodic_eviction(&self) -> JoinHandle<()> {
        let memory = self.memory.clone();
        let events = self.events.clone();
        spawn_ticker(
            self.config.gc_interval(),
            self.shutdown.child_token(),
            move || {
                let memory = memory.clone();
                let events = events.clone();
                async move {
                    let report = memory.evict().await;
                    if report.entries_removed > 0 {
                        events.publish(PacsEvent::CacheEvicted { report });
                    }
                }
            },
        )
    }

    fn spawn_autosave(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let store = self.store.clone();
        let key = self.config.registry_key.clone();
        spawn_ticker(
            self.config.autosave_interval(),
            self.shutdown.child_token(),
            move || {
                let registry = registry.clone();
                let store = store.clone();
                let key = key.clone();
                async move {
                    if let Err(e) = registry.save(store.as_ref(), &key).await {
                        error!("注册表自动保存失败: {}", e);
                    }
                }
            },
        )
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queries(&self) -> &QueryEngine {
        &self.queries
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    pub fn scheduler(&self) -> &Arc<RequestScheduler> {
        &self.scheduler
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn optimizer(&self) -> &Arc<NetworkOptimizer> {
        &self.optimizer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PacsEvent> {
        self.events.subscribe()
    }
}

/// 按固定间隔执行任务，第一次执行在一个间隔之后
fn spawn_ticker<F, Fut>(period: Duration, token: CancellationToken, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => task().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pacs_core::{
        fields, Destination, DicomQuery, DicomQueryResult, DicomRetrievalJob, OperationStatus, PacsConnection,
        Protocol, QueryLevel, RequestPriority,
    };
    use pacs_dicom::PacsTransport;
    use pacs_storage::{CacheName, MemoryKeyValueStore};
    use std::collections::BTreeMap;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            max_memory_usage_mb: 10,
            cache_size_mb: 10,
            gc_check_interval_ms: 20,
            gc_interval_ms: 60_000,
            scheduler_tick_ms: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_shutdown_persists_registry() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let service = PacsNetworkService::builder(test_config())
            .key_value_store(store.clone())
            .build()
            .unwrap();
        service.start().await.unwrap();

        let conn = PacsConnection::new("main", "pacs.example.org", 443, Protocol::DicomWeb);
        let id = service.registry().add(conn).await.unwrap();
        service.shutdown().await.unwrap();

        let restored = PacsNetworkService::builder(test_config())
            .key_value_store(store)
            .build()
            .unwrap();
        restored.start().await.unwrap();
        assert!(restored.registry().get(&id).await.is_some());
        restored.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pressure_check_evicts_in_background() {
        let service = PacsNetworkService::builder(test_config())
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
            .build()
            .unwrap();
        let mut events = service.subscribe();
        service.start().await.unwrap();

        // 单个条目超过 8 MB 阈值时写入本身不会触发回收
        service
            .memory()
            .put(CacheName::Image, "large", Bytes::from(vec![0u8; 9 * 1024 * 1024]))
            .await
            .unwrap();
        let before = service.memory().current_usage().await;
        assert!(before > service.memory().threshold());

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(PacsEvent::CacheEvicted { report }) = events.recv().await {
                    return report;
                }
            }
        })
        .await
        .unwrap();
        assert!(event.bytes_freed > 0);
        assert!(service.memory().current_usage().await < before);

        service.shutdown().await.unwrap();
    }

    /// 每个请求都要等很久的传输
    struct StalledTransport;

    #[async_trait]
    impl PacsTransport for StalledTransport {
        fn protocol(&self) -> Protocol {
            Protocol::DicomWeb
        }

        async fn query(&self, _: QueryLevel, _: &BTreeMap<String, String>) -> Result<Vec<DicomQueryResult>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }

        async fn retrieve(&self, _: &DicomQueryResult) -> Result<Bytes> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Bytes::new())
        }

        async fn store(&self, _: Bytes) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
    }

    struct StalledFactory;

    impl TransportFactory for StalledFactory {
        fn create(&self, _: &PacsConnection) -> Result<Arc<dyn PacsTransport>> {
            Ok(Arc::new(StalledTransport))
        }
    }

    fn stalled_service() -> PacsNetworkService {
        PacsNetworkService::builder(test_config())
            .transport_factory(Arc::new(StalledFactory))
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
            .build()
            .unwrap()
    }

    fn instance(sop: &str) -> DicomQueryResult {
        let data: BTreeMap<String, String> = [
            (fields::STUDY_INSTANCE_UID, "1.2.3"),
            (fields::SERIES_INSTANCE_UID, "1.2.3.4"),
            (fields::SOP_INSTANCE_UID, sop),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        DicomQueryResult::from_attributes(QueryLevel::Image, data).unwrap()
    }

    async fn wait_for_terminal(service: &PacsNetworkService, job_id: uuid::Uuid) -> DicomRetrievalJob {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let job = service.retrieval().get_job(job_id).await.unwrap();
                if job.status.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    /// 查询失败而不是挂起，检索任务以全部失败结束
    async fn assert_requests_fail_fast(service: &PacsNetworkService) {
        let conn = PacsConnection::new("main", "pacs.example.org", 443, Protocol::DicomWeb);
        let id = service.registry().add(conn).await.unwrap();

        let query = tokio::time::timeout(
            Duration::from_secs(2),
            service.queries().execute(QueryLevel::Study, BTreeMap::new(), &id),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(query.status, OperationStatus::Failed);
        assert!(query.error.unwrap().contains("服务不可用"));

        let items = vec![instance("1.1"), instance("1.2")];
        let job = service
            .retrieval()
            .start(&query_for(&id), items, Destination::Local, RequestPriority::Normal)
            .await
            .unwrap();
        let job = wait_for_terminal(service, job.id).await;
        assert_eq!(job.status, OperationStatus::Completed);
        assert_eq!(job.progress.failed, 2);

        let conn = service.registry().get(&id).await.unwrap();
        assert_eq!(conn.statistics.error_count, 0);
    }

    fn query_for(connection_id: &str) -> DicomQuery {
        DicomQuery::new(connection_id, QueryLevel::Image, BTreeMap::new())
    }

    #[tokio::test]
    async fn test_requests_before_start_fail_fast() {
        let service = stalled_service();
        assert_requests_fail_fast(&service).await;
    }

    #[tokio::test]
    async fn test_requests_after_shutdown_fail_fast() {
        let service = stalled_service();
        service.start().await.unwrap();
        service.shutdown().await.unwrap();
        assert!(!service.scheduler().is_running());
        assert_requests_fail_fast(&service).await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_work() {
        let service = stalled_service();
        service.start().await.unwrap();
        let conn = PacsConnection::new("main", "pacs.example.org", 443, Protocol::DicomWeb);
        let id = service.registry().add(conn).await.unwrap();

        let items = vec![instance("2.1"), instance("2.2")];
        let job = service
            .retrieval()
            .start(&query_for(&id), items, Destination::Local, RequestPriority::Normal)
            .await
            .unwrap();

        let (query, shutdown) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(
                service.queries().execute(QueryLevel::Study, BTreeMap::new(), &id),
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    service.shutdown().await
                }
            )
        })
        .await
        .unwrap();
        shutdown.unwrap();

        assert_eq!(query.unwrap().status, OperationStatus::Cancelled);
        let job = wait_for_terminal(&service, job.id).await;
        assert_eq!(job.status, OperationStatus::Cancelled);
        assert_eq!(job.progress.processed(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let service = PacsNetworkService::builder(test_config())
            .key_value_store(Arc::new(MemoryKeyValueStore::new()))
            .build()
            .unwrap();
        service.start().await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.tasks.lock().await.len(), 4);
        service.shutdown().await.unwrap();
    }
}
