//! 检索引擎
//!
//! 检索任务按结果列表顺序逐个拉取对象。每个任务同一时刻最多有一个拉取循环；
//! 暂停时循环在当前对象处理完后退出并保留 `next_index`，恢复时从该下标
//! 重新启动循环。单个对象失败只计入 `failed`，不影响整个任务。

use crate::delivery::{cache_key, DeliveryRouter};
use bytes::Bytes;
use crate::events::{EventBus, PacsEvent};
use crate::optimizer::NetworkOptimizer;
use crate::registry::ConnectionRegistry;
use crate::scheduler::{RequestFuture, RequestScheduler};
use pacs_admin::NetworkConfig;
use pacs_core::{
    Destination, DicomQuery, DicomQueryResult, DicomRetrievalJob, OperationEvent, OperationStateMachine,
    OperationStatus, PacsError, RequestPriority, Result,
};
use pacs_dicom::PacsTransport;
use pacs_storage::{CacheName, MemoryManager};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 检索引擎配置
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// 可重试错误的最大重试次数（不含首次请求）
    pub retry_attempts: u32,
    /// 第 n 次重试前等待 `retry_delay * n`
    pub retry_delay: Duration,
    pub enable_prefetch: bool,
    pub prefetch_distance: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for RetrievalSettings {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
            enable_prefetch: config.enable_prefetch,
            prefetch_distance: config.prefetch_distance,
        }
    }
}

struct JobEntry {
    job: DicomRetrievalJob,
    results: Arc<Vec<DicomQueryResult>>,
    transport: Arc<dyn PacsTransport>,
    cancel: CancellationToken,
    /// 拉取循环是否在运行
    loop_active: bool,
    /// 之前运行段累计的时长，不含暂停时间
    active_elapsed: Duration,
    running_since: Option<Instant>,
}

impl JobEntry {
    fn elapsed_secs(&self) -> f64 {
        let current = self.running_since.map(|t| t.elapsed()).unwrap_or_default();
        (self.active_elapsed + current).as_secs_f64()
    }

    fn stop_clock(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.active_elapsed += since.elapsed();
        }
    }
}

/// 一个待拉取的对象
struct WorkItem {
    index: usize,
    item: DicomQueryResult,
    transport: Arc<dyn PacsTransport>,
    connection_id: String,
    destination: Destination,
    priority: RequestPriority,
    cancel: CancellationToken,
}

/// 检索引擎
#[derive(Clone)]
pub struct RetrievalEngine {
    registry: Arc<ConnectionRegistry>,
    scheduler: Arc<RequestScheduler>,
    memory: Arc<MemoryManager>,
    optimizer: Arc<NetworkOptimizer>,
    router: Arc<DeliveryRouter>,
    events: EventBus,
    settings: RetrievalSettings,
    state_machine: Arc<OperationStateMachine>,
    jobs: Arc<RwLock<HashMap<Uuid, JobEntry>>>,
}

impl RetrievalEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        scheduler: Arc<RequestScheduler>,
        memory: Arc<MemoryManager>,
        optimizer: Arc<NetworkOptimizer>,
        router: Arc<DeliveryRouter>,
        events: EventBus,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            registry,
            scheduler,
            memory,
            optimizer,
            router,
            events,
            settings,
            state_machine: Arc::new(OperationStateMachine::for_job()),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 创建并启动检索任务，立即返回运行中的任务快照
    ///
    /// 任务持有创建时的协议传输，连接随后被移除也不会中断任务。
    pub async fn start(
        &self,
        query: &DicomQuery,
        results: Vec<DicomQueryResult>,
        destination: Destination,
        priority: RequestPriority,
    ) -> Result<DicomRetrievalJob> {
        let transport = self.registry.transport(&query.connection_id).await?;
        let mut job = DicomRetrievalJob::new(
            query.id,
            query.connection_id.clone(),
            destination,
            priority,
            results.len(),
        );
        job.apply(&self.state_machine, OperationEvent::Start)?;
        let job_id = job.id;
        let snapshot = job.clone();

        self.jobs.write().await.insert(
            job_id,
            JobEntry {
                job,
                results: Arc::new(results),
                transport,
                cancel: CancellationToken::new(),
                loop_active: true,
                active_elapsed: Duration::ZERO,
                running_since: Some(Instant::now()),
            },
        );
        info!("检索任务 {} 启动，共 {} 个对象", job_id, snapshot.progress.total);
        self.events.publish(PacsEvent::JobStarted {
            job_id,
            total: snapshot.progress.total,
        });

        self.spawn_drain(job_id);
        Ok(snapshot)
    }

    fn spawn_drain(&self, job_id: Uuid) {
        let engine = self.clone();
        tokio::spawn(async move { engine.drain(job_id).await });
    }

    /// 拉取循环：每个对象前检查状态，处理完后提交进度
    async fn drain(self, job_id: Uuid) {
        while let Some(work) = self.next_work(job_id).await {
            let outcome = self.fetch_and_deliver(&work).await;
            if matches!(outcome, Err(PacsError::Cancelled)) {
                debug!("任务 {} 的对象 {} 在拉取中被取消", job_id, work.index);
                continue;
            }
            self.commit(job_id, &work, outcome).await;
        }
    }

    /// 领取下一个对象；任务不再运行或已处理完时结束循环
    async fn next_work(&self, job_id: Uuid) -> Option<WorkItem> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(&job_id)?;

        if entry.job.status != OperationStatus::Running {
            entry.loop_active = false;
            debug!("任务 {} 拉取循环退出 ({:?})", job_id, entry.job.status);
            return None;
        }

        let index = entry.job.next_index;
        let Some(item) = entry.results.get(index).cloned() else {
            self.complete(job_id, entry);
            return None;
        };

        Some(WorkItem {
            index,
            item,
            transport: entry.transport.clone(),
            connection_id: entry.job.connection_id.clone(),
            destination: entry.job.destination.clone(),
            priority: entry.job.priority,
            cancel: entry.cancel.clone(),
        })
    }

    fn complete(&self, job_id: Uuid, entry: &mut JobEntry) {
        entry.loop_active = false;
        entry.stop_clock();
        if entry.job.progress.total == 0 {
            entry.job.progress.percentage = 100.0;
        }
        if let Err(e) = entry.job.apply(&self.state_machine, OperationEvent::Complete) {
            warn!("任务 {} 无法完成: {}", job_id, e);
            return;
        }
        info!(
            "检索任务 {} 完成: 成功 {}, 失败 {}",
            job_id, entry.job.progress.completed, entry.job.progress.failed
        );
        self.events.publish(PacsEvent::JobCompleted {
            job: entry.job.clone(),
        });
    }

    async fn commit(&self, job_id: Uuid, work: &WorkItem, outcome: Result<u64>) {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.status == OperationStatus::Cancelled || entry.job.next_index != work.index {
            return;
        }

        let elapsed = entry.elapsed_secs();
        match outcome {
            Ok(bytes) => entry.job.progress.record_success(bytes, elapsed),
            Err(e) => {
                warn!("任务 {} 的对象 {} 拉取失败: {}", job_id, work.item.uid, e);
                entry.job.progress.record_failure(elapsed);
            }
        }
        entry.job.next_index += 1;

        self.events.publish(PacsEvent::JobProgress {
            job_id,
            progress: entry.job.progress.clone(),
        });
    }

    /// 拉取一个对象并投递，可重试错误按配置退避重试
    async fn fetch_and_deliver(&self, work: &WorkItem) -> Result<u64> {
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let transport = work.transport.clone();
            let item = work.item.clone();
            let token = work.cancel.clone();
            let result = self
                .scheduler
                .run(work.priority, async move {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => Err(PacsError::Cancelled),
                        data = transport.retrieve(&item) => data,
                    }
                })
                .await;

            match result {
                Ok(data) => {
                    let bytes = data.len() as u64;
                    self.optimizer
                        .record_request(cache_key(&work.item), started, bytes)
                        .await;
                    self.registry
                        .record_retrieval(&work.connection_id, started.elapsed())
                        .await;
                    self.deliver(work, data).await?;
                    return Ok(bytes);
                }
                Err(PacsError::Cancelled) => return Err(PacsError::Cancelled),
                Err(e) if e.is_retryable() && attempt < self.settings.retry_attempts => {
                    attempt += 1;
                    let delay = self.settings.retry_delay * attempt;
                    debug!("对象 {} 第 {} 次重试，等待 {:?}: {}", work.item.uid, attempt, delay, e);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = work.cancel.cancelled() => return Err(PacsError::Cancelled),
                    }
                }
                Err(e) => {
                    if e.is_remote() {
                        self.registry.record_error(&work.connection_id, &e).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// 投递到目标，远端目标同样经过调度器
    async fn deliver(&self, work: &WorkItem, data: Bytes) -> Result<()> {
        if !self.router.uses_network(work.destination.kind()) {
            return self.router.deliver(&work.destination, &work.item, data).await;
        }

        let router = self.router.clone();
        let destination = work.destination.clone();
        let item = work.item.clone();
        let token = work.cancel.clone();
        self.scheduler
            .run(work.priority, async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(PacsError::Cancelled),
                    delivered = router.deliver(&destination, &item, data) => delivered,
                }
            })
            .await
    }

    /// 暂停运行中的任务
    pub async fn pause(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.job.status != OperationStatus::Running
            || entry.job.apply(&self.state_machine, OperationEvent::Pause).is_err()
        {
            return false;
        }
        entry.stop_clock();
        info!("检索任务 {} 暂停于第 {} 个对象", job_id, entry.job.next_index);
        self.events.publish(PacsEvent::JobPaused { job_id });
        true
    }

    /// 恢复暂停的任务，从第一个未处理的对象继续
    pub async fn resume(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.job.status != OperationStatus::Paused
            || entry.job.apply(&self.state_machine, OperationEvent::Resume).is_err()
        {
            return false;
        }
        entry.running_since = Some(Instant::now());
        info!("检索任务 {} 从第 {} 个对象恢复", job_id, entry.job.next_index);
        self.events.publish(PacsEvent::JobResumed { job_id });

        // 旧循环还没退出时会直接接着跑
        if !entry.loop_active {
            entry.loop_active = true;
            drop(jobs);
            self.spawn_drain(job_id);
        }
        true
    }

    /// 取消运行中或暂停的任务，在途请求随之中止
    pub async fn cancel(&self, job_id: Uuid) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };
        if !matches!(entry.job.status, OperationStatus::Running | OperationStatus::Paused)
            || entry.job.apply(&self.state_machine, OperationEvent::Cancel).is_err()
        {
            return false;
        }
        entry.stop_clock();
        entry.cancel.cancel();
        info!(
            "检索任务 {} 已取消，已处理 {}/{}",
            job_id,
            entry.job.progress.processed(),
            entry.job.progress.total
        );
        self.events.publish(PacsEvent::JobCancelled { job_id });
        true
    }

    /// 取消所有运行中或暂停的任务，返回取消数量
    pub async fn cancel_all(&self) -> usize {
        let active: Vec<Uuid> = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|(_, e)| matches!(e.job.status, OperationStatus::Running | OperationStatus::Paused))
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = 0;
        for job_id in active {
            if self.cancel(job_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<DicomRetrievalJob> {
        self.jobs.read().await.get(&job_id).map(|e| e.job.clone())
    }

    pub async fn list_jobs(&self) -> Vec<DicomRetrievalJob> {
        let mut list: Vec<_> = self.jobs.read().await.values().map(|e| e.job.clone()).collect();
        list.sort_by_key(|j| j.created_at);
        list
    }

    /// 清理已结束的任务
    pub async fn clear_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, e| !e.job.status.is_terminal());
        before - jobs.len()
    }

    /// 预取 `index` 之后的若干对象到影像缓存
    ///
    /// 以 `Low` 优先级入队，已缓存的对象跳过，返回入队的数量。
    pub async fn prefetch(&self, connection_id: &str, results: &[DicomQueryResult], index: usize) -> Result<usize> {
        if !self.settings.enable_prefetch {
            return Ok(0);
        }
        let transport = self.registry.transport(connection_id).await?;

        let mut scheduled = 0;
        for item in results.iter().skip(index + 1).take(self.settings.prefetch_distance) {
            let key = cache_key(item).to_string();
            if self.memory.contains(CacheName::Image, &key).await {
                continue;
            }

            let transport = transport.clone();
            let memory = self.memory.clone();
            let optimizer = self.optimizer.clone();
            let item = item.clone();
            let request: RequestFuture = Box::pin(async move {
                let started = Instant::now();
                let data = transport.retrieve(&item).await?;
                optimizer.record_request(&key, started, data.len() as u64).await;
                memory.put(CacheName::Image, key, data).await
            });
            self.scheduler.enqueue(request, RequestPriority::Low).await?;
            scheduled += 1;
        }
        debug!("连接 {} 预取 {} 个对象", connection_id, scheduled);
        Ok(scheduled)
    }
}
