//! 查询引擎
//!
//! 每次查询都经过请求调度器发往连接对应的协议传输，失败不会向调用方抛出，
//! 而是记录在查询对象上。

use crate::events::{EventBus, PacsEvent};
use crate::optimizer::NetworkOptimizer;
use crate::registry::ConnectionRegistry;
use crate::scheduler::RequestScheduler;
use pacs_core::{
    DicomQuery, DicomQueryResult, OperationEvent, OperationStateMachine, OperationStatus, PacsError,
    QueryLevel, RequestPriority, Result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct QueryEntry {
    query: DicomQuery,
    cancel: CancellationToken,
}

/// 查询引擎
pub struct QueryEngine {
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<RequestScheduler>,
    optimizer: Arc<NetworkOptimizer>,
    events: EventBus,
    state_machine: OperationStateMachine,
    priority: RequestPriority,
    queries: RwLock<HashMap<Uuid, QueryEntry>>,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scheduler: Arc<RequestScheduler>,
        optimizer: Arc<NetworkOptimizer>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            scheduler,
            optimizer,
            events,
            state_machine: OperationStateMachine::for_query(),
            priority: RequestPriority::High,
            queries: RwLock::new(HashMap::new()),
        }
    }

    /// 修改查询请求的调度优先级，默认 `High`
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// 执行查询
    ///
    /// 返回终止状态的查询快照。网络和解析错误记录在 `error` 字段中，
    /// 只有状态机自身出错时才返回 `Err`。
    pub async fn execute(
        &self,
        level: QueryLevel,
        criteria: BTreeMap<String, String>,
        connection_id: &str,
    ) -> Result<DicomQuery> {
        let mut query = DicomQuery::new(connection_id, level, criteria.clone());
        let query_id = query.id;
        let cancel = CancellationToken::new();

        query.apply(&self.state_machine, OperationEvent::Start)?;
        self.queries.write().await.insert(
            query_id,
            QueryEntry {
                query,
                cancel: cancel.clone(),
            },
        );
        info!("开始 {:?} 级查询 {} (连接 {})", level, query_id, connection_id);
        self.events.publish(PacsEvent::QueryStarted {
            query_id,
            connection_id: connection_id.to_string(),
        });

        let started = Instant::now();
        let outcome = match self.registry.transport(connection_id).await {
            Ok(transport) => {
                let token = cancel.clone();
                self.scheduler
                    .run(self.priority, async move {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => Err(PacsError::Cancelled),
                            result = transport.query(level, &criteria) => result,
                        }
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(results) => {
                self.optimizer
                    .record_request(&query_id.to_string(), started, estimated_size(&results))
                    .await;
                self.registry.record_query(connection_id, elapsed).await;
                self.finish(query_id, Ok(results)).await
            }
            Err(e) => {
                if e.is_remote() {
                    self.registry.record_error(connection_id, &e).await;
                }
                self.finish(query_id, Err(e)).await
            }
        }
    }

    async fn finish(&self, query_id: Uuid, outcome: Result<Vec<DicomQueryResult>>) -> Result<DicomQuery> {
        let mut queries = self.queries.write().await;
        let entry = queries
            .get_mut(&query_id)
            .ok_or_else(|| PacsError::Internal(format!("查询 {} 丢失", query_id)))?;

        // 已被取消的查询保持原状
        if entry.query.status != OperationStatus::Running {
            debug!("查询 {} 已处于 {:?}，丢弃结果", query_id, entry.query.status);
            return Ok(entry.query.clone());
        }

        match outcome {
            Ok(results) => {
                entry.query.results = results;
                entry.query.progress = 100;
                entry.query.apply(&self.state_machine, OperationEvent::Complete)?;
                info!("查询 {} 完成，{} 条结果", query_id, entry.query.results.len());
                self.events.publish(PacsEvent::QueryCompleted {
                    query: entry.query.clone(),
                });
            }
            Err(e) => {
                let message = e.to_string();
                warn!("查询 {} 失败: {}", query_id, message);
                entry.query.error = Some(message.clone());
                entry.query.apply(&self.state_machine, OperationEvent::Fail)?;
                self.events.publish(PacsEvent::QueryFailed {
                    query_id,
                    error: message,
                });
            }
        }
        Ok(entry.query.clone())
    }

    /// 取消运行中的查询
    pub async fn cancel(&self, query_id: Uuid) -> bool {
        let mut queries = self.queries.write().await;
        let Some(entry) = queries.get_mut(&query_id) else {
            return false;
        };
        if entry.query.status != OperationStatus::Running {
            return false;
        }
        if entry
            .query
            .apply(&self.state_machine, OperationEvent::Cancel)
            .is_err()
        {
            return false;
        }

        entry.cancel.cancel();
        info!("查询 {} 已取消", query_id);
        self.events.publish(PacsEvent::QueryCancelled { query_id });
        true
    }

    /// 取消所有运行中的查询，返回取消数量
    pub async fn cancel_all(&self) -> usize {
        let running: Vec<Uuid> = self
            .queries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.query.status == OperationStatus::Running)
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = 0;
        for query_id in running {
            if self.cancel(query_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub async fn get_query(&self, query_id: Uuid) -> Option<DicomQuery> {
        self.queries.read().await.get(&query_id).map(|e| e.query.clone())
    }

    pub async fn list_queries(&self) -> Vec<DicomQuery> {
        let mut list: Vec<_> = self
            .queries
            .read()
            .await
            .values()
            .map(|e| e.query.clone())
            .collect();
        list.sort_by_key(|q| q.start_time);
        list
    }

    /// 清理已结束的查询，返回清理数量
    pub async fn clear_finished(&self) -> usize {
        let mut queries = self.queries.write().await;
        let before = queries.len();
        queries.retain(|_, e| !e.query.status.is_terminal());
        before - queries.len()
    }
}

/// 结果的近似传输量，用于带宽观测
fn estimated_size(results: &[DicomQueryResult]) -> u64 {
    serde_json::to_vec(results).map(|v| v.len() as u64).unwrap_or(0)
}
