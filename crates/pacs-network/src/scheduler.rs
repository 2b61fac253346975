//! 请求调度器
//!
//! 查询和检索引擎的所有出站请求都经过这里排队。后台节拍每次按优先级
//! 取出请求并发执行，同时在途的请求数不超过 `max_concurrent`。
//!
//! 节拍未启动时 [`RequestScheduler::run`] 直接失败；节拍停止后丢弃队列中的
//! 请求并拒绝新的请求，等待结果的调用方随之得到错误。

use pacs_core::{PacsError, RequestPriority, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 排队中的请求
pub type RequestFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

struct QueuedRequest {
    priority: RequestPriority,
    ticket: u64,
    future: RequestFuture,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.ticket == other.ticket
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // BinaryHeap 是最大堆：优先级数值小、票号小的排在堆顶
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.ticket).cmp(&(self.priority, self.ticket))
    }
}

/// 请求调度器
pub struct RequestScheduler {
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    next_ticket: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl RequestScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            next_ticket: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// 入队，返回票号；请求失败时只记录日志
    ///
    /// 节拍启动前入队的请求等到启动后执行，停止后入队会被拒绝。
    pub async fn enqueue(&self, request: RequestFuture, priority: RequestPriority) -> Result<u64> {
        self.push(request, priority, false).await
    }

    // 状态检查和入堆在同一把锁内，与 stop 的清空互斥
    async fn push(&self, request: RequestFuture, priority: RequestPriority, require_running: bool) -> Result<u64> {
        let mut queue = self.queue.lock().await;
        if self.stopped.load(AtomicOrdering::SeqCst) {
            return Err(PacsError::Unavailable("请求调度器已停止".to_string()));
        }
        if require_running && !self.running.load(AtomicOrdering::SeqCst) {
            return Err(PacsError::Unavailable("请求调度器未启动".to_string()));
        }

        let ticket = self.next_ticket.fetch_add(1, AtomicOrdering::Relaxed);
        queue.push(QueuedRequest {
            priority,
            ticket,
            future: request,
        });
        debug!("请求 #{} 入队 ({:?})", ticket, priority);
        Ok(ticket)
    }

    /// 入队并等待结果，错误交给调用方处理
    pub async fn run<T, F>(&self, priority: RequestPriority, request: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: RequestFuture = Box::pin(async move {
            let _ = tx.send(request.await);
            Ok(())
        });
        self.push(wrapped, priority, true).await?;

        rx.await
            .map_err(|_| PacsError::Unavailable("请求在执行前被丢弃".to_string()))?
    }

    /// 一个调度节拍：在并发上限内按优先级派发，返回派发的票号
    pub async fn tick(&self) -> Vec<u64> {
        let mut queue = self.queue.lock().await;
        let mut dispatched = Vec::new();

        while !queue.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(request) = queue.pop() else {
                break;
            };

            let ticket = request.ticket;
            dispatched.push(ticket);
            tokio::spawn(async move {
                if let Err(e) = request.future.await {
                    error!("请求 #{} 执行失败，已丢弃: {}", ticket, e);
                }
                drop(permit);
            });
        }
        dispatched
    }

    /// 启动后台节拍，令牌取消后停止调度器
    pub fn start(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        self.running.store(true, AtomicOrdering::SeqCst);
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("请求调度器已启动，并发上限 {}", scheduler.max_concurrent);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        scheduler.tick().await;
                    }
                }
            }
            scheduler.stop().await;
        })
    }

    /// 停止调度：拒绝新请求并丢弃排队中的请求，返回丢弃数量
    ///
    /// 已派发的请求不受影响。
    pub async fn stop(&self) -> usize {
        let mut queue = self.queue.lock().await;
        if self.stopped.swap(true, AtomicOrdering::SeqCst) {
            return 0;
        }
        self.running.store(false, AtomicOrdering::SeqCst);
        let dropped = queue.len();
        queue.clear();
        if dropped > 0 {
            warn!("请求调度器停止，丢弃 {} 个排队请求", dropped);
        }
        info!("请求调度器已停止");
        dropped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
