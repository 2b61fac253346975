//! 连接注册表
//!
//! 保存所有远程PACS端点，负责注册校验、连接探测和统计信息更新。
//! 探测请求同样经过请求调度器，以 `High` 优先级排队。
//! 查询和检索任务只持有连接ID，连接被移除后对它的统计更新会被静默忽略。

use crate::events::{EventBus, PacsEvent};
use crate::scheduler::RequestScheduler;
use chrono::Utc;
use pacs_core::utils::exponential_moving_average;
use pacs_core::{ConnectionStatus, ConnectionUpdate, PacsConnection, PacsError, RequestPriority, Result};
use pacs_dicom::{PacsTransport, TransportFactory};
use pacs_storage::KeyValueStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 连接注册表
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, PacsConnection>>,
    transports: Arc<dyn TransportFactory>,
    scheduler: Arc<RequestScheduler>,
    events: EventBus,
}

impl ConnectionRegistry {
    pub fn new(transports: Arc<dyn TransportFactory>, scheduler: Arc<RequestScheduler>, events: EventBus) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            transports,
            scheduler,
            events,
        }
    }

    /// 注册连接，返回连接ID
    pub async fn add(&self, connection: PacsConnection) -> Result<String> {
        connection.validate()?;

        let id = connection.id.clone();
        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(PacsError::Validation(format!("连接ID {} 已存在", id)));
        }
        info!("注册PACS连接: {} ({:?} {}:{})", connection.name, connection.protocol, connection.host, connection.port);
        connections.insert(id.clone(), connection);
        drop(connections);

        self.events.publish(PacsEvent::ConnectionAdded {
            connection_id: id.clone(),
        });
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<PacsConnection> {
        self.connections.read().await.get(id).cloned()
    }

    /// 部分更新；连接不存在或更新后校验失败时返回 false
    pub async fn update(&self, id: &str, update: ConnectionUpdate) -> bool {
        let mut connections = self.connections.write().await;
        let Some(current) = connections.get(id) else {
            return false;
        };

        let mut updated = current.clone();
        update.apply_to(&mut updated);
        if let Err(e) = updated.validate() {
            warn!("连接 {} 更新被拒绝: {}", id, e);
            return false;
        }
        connections.insert(id.to_string(), updated);
        true
    }

    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            info!("移除PACS连接: {}", id);
            self.events.publish(PacsEvent::ConnectionRemoved {
                connection_id: id.to_string(),
            });
        }
        removed
    }

    /// 按名称排序的全部连接
    pub async fn list(&self) -> Vec<PacsConnection> {
        let mut list: Vec<_> = self.connections.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// 为连接创建协议传输
    pub async fn transport(&self, id: &str) -> Result<Arc<dyn PacsTransport>> {
        let connection = self
            .get(id)
            .await
            .ok_or_else(|| PacsError::NotFound(format!("连接 {} 不存在", id)))?;
        self.transports.create(&connection)
    }

    /// 探测连接，失败只更新状态和统计，不返回错误
    pub async fn test_connection(&self, id: &str) -> bool {
        if !self.modify(id, |c| c.status = ConnectionStatus::Connecting).await {
            return false;
        }

        let started = Instant::now();
        let outcome = match self.transport(id).await {
            Ok(transport) => {
                self.scheduler
                    .run(RequestPriority::High, async move { transport.test_connection().await })
                    .await
            }
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        let success = match outcome {
            Ok(()) => {
                self.modify(id, |c| {
                    c.status = ConnectionStatus::Connected;
                    c.last_connected = Some(Utc::now());
                    record_response_time(c, elapsed);
                })
                .await;
                info!("连接 {} 探测成功 ({:?})", id, elapsed);
                true
            }
            Err(e) if !e.is_remote() => {
                warn!("连接 {} 未能探测: {}", id, e);
                self.modify(id, |c| c.status = ConnectionStatus::Disconnected).await;
                false
            }
            Err(e) => {
                warn!("连接 {} 探测失败: {}", id, e);
                self.modify(id, |c| {
                    c.status = ConnectionStatus::Error;
                    record_error(c, &e);
                })
                .await;
                false
            }
        };

        self.events.publish(PacsEvent::ConnectionTested {
            connection_id: id.to_string(),
            success,
        });
        success
    }

    pub async fn record_query(&self, id: &str, elapsed: Duration) {
        self.modify(id, |c| {
            c.statistics.total_queries += 1;
            record_response_time(c, elapsed);
        })
        .await;
    }

    pub async fn record_retrieval(&self, id: &str, elapsed: Duration) {
        self.modify(id, |c| {
            c.statistics.total_retrievals += 1;
            record_response_time(c, elapsed);
        })
        .await;
    }

    pub async fn record_store(&self, id: &str, elapsed: Duration) {
        self.modify(id, |c| {
            c.statistics.total_stores += 1;
            record_response_time(c, elapsed);
        })
        .await;
    }

    pub async fn record_error(&self, id: &str, error: &PacsError) {
        self.modify(id, |c| record_error(c, error)).await;
    }

    /// 在写锁内修改连接，连接不存在时返回 false
    async fn modify<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut PacsConnection),
    {
        match self.connections.write().await.get_mut(id) {
            Some(connection) => {
                f(connection);
                true
            }
            None => {
                debug!("连接 {} 已不存在，忽略更新", id);
                false
            }
        }
    }

    /// 从键值存储加载，已加载的连接状态一律重置为未连接
    pub async fn load(&self, store: &dyn KeyValueStore, key: &str) -> Result<usize> {
        let Some(content) = store.get(key).await? else {
            debug!("键值存储中没有 {}，跳过加载", key);
            return Ok(0);
        };
        let saved: Vec<PacsConnection> = serde_json::from_str(&content)?;
        let count = saved.len();

        let mut connections = self.connections.write().await;
        for mut connection in saved {
            connection.status = ConnectionStatus::Disconnected;
            connections.insert(connection.id.clone(), connection);
        }
        info!("已加载 {} 个PACS连接", count);
        Ok(count)
    }

    pub async fn save(&self, store: &dyn KeyValueStore, key: &str) -> Result<()> {
        let list = self.list().await;
        let content = serde_json::to_string_pretty(&list)?;
        store.set(key, content).await?;
        debug!("已保存 {} 个PACS连接", list.len());
        Ok(())
    }
}

fn record_response_time(connection: &mut PacsConnection, elapsed: Duration) {
    let stats = &mut connection.statistics;
    let sample = elapsed.as_secs_f64() * 1000.0;
    stats.average_response_time_ms =
        exponential_moving_average(stats.average_response_time_ms, sample, stats.response_samples);
    stats.response_samples += 1;
}

fn record_error(connection: &mut PacsConnection, error: &PacsError) {
    connection.statistics.error_count += 1;
    connection.statistics.last_error = Some(error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use pacs_core::{Authentication, DicomQueryResult, Protocol, QueryLevel};
    use pacs_storage::MemoryKeyValueStore;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    /// 按主机名决定探测结果的传输
    struct HostTransport {
        reachable: bool,
    }

    #[async_trait]
    impl PacsTransport for HostTransport {
        fn protocol(&self) -> Protocol {
            Protocol::DicomWeb
        }

        async fn query(&self, _: QueryLevel, _: &BTreeMap<String, String>) -> Result<Vec<DicomQueryResult>> {
            Ok(Vec::new())
        }

        async fn retrieve(&self, _: &DicomQueryResult) -> Result<Bytes> {
            Ok(Bytes::new())
        }

        async fn store(&self, _: Bytes) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> Result<()> {
            if self.reachable {
                Ok(())
            } else {
                Err(PacsError::Connectivity("connection refused".to_string()))
            }
        }
    }

    struct HostFactory;

    impl TransportFactory for HostFactory {
        fn create(&self, connection: &PacsConnection) -> Result<Arc<dyn PacsTransport>> {
            Ok(Arc::new(HostTransport {
                reachable: connection.host != "offline.example.org",
            }))
        }
    }

    fn registry() -> ConnectionRegistry {
        let scheduler = Arc::new(RequestScheduler::new(2));
        scheduler.start(Duration::from_millis(2), CancellationToken::new());
        ConnectionRegistry::new(Arc::new(HostFactory), scheduler, EventBus::default())
    }

    fn connection(host: &str) -> PacsConnection {
        PacsConnection::new("main", host, 443, Protocol::DicomWeb).with_secure(true)
    }

    #[tokio::test]
    async fn test_add_get_update_remove() {
        let registry = registry();
        let id = registry.add(connection("pacs.example.org")).await.unwrap();
        assert_eq!(registry.get(&id).await.unwrap().host, "pacs.example.org");

        let update = ConnectionUpdate {
            name: Some("archive".to_string()),
            ..Default::default()
        };
        assert!(registry.update(&id, update).await);
        assert_eq!(registry.get(&id).await.unwrap().name, "archive");

        assert!(!registry.update("missing", ConnectionUpdate::default()).await);
        assert!(registry.remove(&id).await);
        assert!(!registry.remove(&id).await);
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_connections_rejected() {
        let registry = registry();
        assert!(registry.add(connection("")).await.is_err());

        let bad_auth = connection("pacs.example.org").with_auth(Authentication::Basic {
            username: String::new(),
            password: "secret".to_string(),
        });
        assert!(registry.add(bad_auth).await.is_err());

        let id = registry.add(connection("pacs.example.org")).await.unwrap();
        let update = ConnectionUpdate {
            port: Some(0),
            ..Default::default()
        };
        assert!(!registry.update(&id, update).await);
        assert_eq!(registry.get(&id).await.unwrap().port, 443);
    }

    #[tokio::test]
    async fn test_connection_probe_updates_status() {
        let registry = registry();
        let online = registry.add(connection("pacs.example.org")).await.unwrap();
        let offline = registry.add(connection("offline.example.org")).await.unwrap();

        assert!(registry.test_connection(&online).await);
        let conn = registry.get(&online).await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert!(conn.last_connected.is_some());
        assert_eq!(conn.statistics.response_samples, 1);

        assert!(!registry.test_connection(&offline).await);
        let conn = registry.get(&offline).await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Error);
        assert_eq!(conn.statistics.error_count, 1);
        assert!(conn.statistics.last_error.unwrap().contains("connection refused"));

        assert!(!registry.test_connection("missing").await);
    }

    #[tokio::test]
    async fn test_response_time_uses_ema() {
        let registry = registry();
        let id = registry.add(connection("pacs.example.org")).await.unwrap();

        registry.record_query(&id, Duration::from_millis(100)).await;
        registry.record_query(&id, Duration::from_millis(200)).await;

        let stats = registry.get(&id).await.unwrap().statistics;
        assert_eq!(stats.total_queries, 2);
        // 0.2 * 200 + 0.8 * 100
        assert!((stats.average_response_time_ms - 120.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_updates_after_removal_are_ignored() {
        let registry = registry();
        let id = registry.add(connection("pacs.example.org")).await.unwrap();
        registry.remove(&id).await;

        registry.record_retrieval(&id, Duration::from_millis(5)).await;
        registry
            .record_error(&id, &PacsError::NotFound("gone".to_string()))
            .await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_save_and_load_reset_status() {
        let store = MemoryKeyValueStore::new();
        let registry = registry();
        let id = registry.add(connection("pacs.example.org")).await.unwrap();
        registry.test_connection(&id).await;
        registry.save(&store, "pacs_connections").await.unwrap();

        let restored = self::registry();
        assert_eq!(restored.load(&store, "pacs_connections").await.unwrap(), 1);
        let conn = restored.get(&id).await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Disconnected);
        assert_eq!(conn.statistics.response_samples, 1);

        assert_eq!(restored.load(&store, "other_key").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_check_runs_through_scheduler() {
        let scheduler = Arc::new(RequestScheduler::new(1));
        let registry = ConnectionRegistry::new(Arc::new(HostFactory), scheduler.clone(), EventBus::default());
        let id = registry.add(connection("pacs.example.org")).await.unwrap();

        // 调度器未启动时探测失败，但不算连接错误
        assert!(!registry.test_connection(&id).await);
        let conn = registry.get(&id).await.unwrap();
        assert_eq!(conn.status, ConnectionStatus::Disconnected);
        assert_eq!(conn.statistics.error_count, 0);

        let token = CancellationToken::new();
        scheduler.start(Duration::from_millis(2), token.clone());
        assert!(registry.test_connection(&id).await);
        token.cancel();
    }
}
