//! 网络层事件
//!
//! 所有状态变化以 [`PacsEvent`] 的形式广播，订阅方按变体匹配处理。

use pacs_core::{DicomQuery, DicomRetrievalJob, RetrievalProgress};
use pacs_storage::EvictionReport;
use tokio::sync::broadcast;
use uuid::Uuid;

/// 默认的事件缓冲长度
const DEFAULT_CAPACITY: usize = 256;

/// 网络层事件
#[derive(Debug, Clone)]
pub enum PacsEvent {
    ConnectionAdded { connection_id: String },
    ConnectionRemoved { connection_id: String },
    ConnectionTested { connection_id: String, success: bool },
    QueryStarted { query_id: Uuid, connection_id: String },
    QueryCompleted { query: DicomQuery },
    QueryFailed { query_id: Uuid, error: String },
    QueryCancelled { query_id: Uuid },
    JobStarted { job_id: Uuid, total: usize },
    JobProgress { job_id: Uuid, progress: RetrievalProgress },
    JobPaused { job_id: Uuid },
    JobResumed { job_id: Uuid },
    JobCompleted { job: DicomRetrievalJob },
    JobCancelled { job_id: Uuid },
    CacheEvicted { report: EvictionReport },
}

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PacsEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PacsEvent> {
        self.sender.subscribe()
    }

    /// 发布事件；没有订阅者时直接丢弃
    pub fn publish(&self, event: PacsEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
