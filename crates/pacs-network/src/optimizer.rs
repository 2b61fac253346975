//! 网络优化器
//!
//! 被动观测每个请求的带宽和延迟，只提供数据和画质建议，本身不做限流。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// 滚动窗口保留的样本数
pub const SAMPLE_WINDOW: usize = 100;

/// 建议的传输画质
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageQuality {
    Lossless,
    High,
    Medium,
    Low,
}

/// 单次请求的测量值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSample {
    pub image_id: String,
    pub bytes: u64,
    pub duration: Duration,
    pub bandwidth_mbps: f64,
    pub recorded_at: DateTime<Utc>,
}

/// 网络统计快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    pub current_bandwidth_mbps: f64,
    pub average_bandwidth_mbps: f64,
    pub average_latency_ms: f64,
    pub sample_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Default)]
struct OptimizerState {
    samples: VecDeque<RequestSample>,
    stats: NetworkStats,
}

/// 网络优化器
#[derive(Debug)]
pub struct NetworkOptimizer {
    max_bandwidth_mbps: f64,
    enabled: bool,
    state: RwLock<OptimizerState>,
}

impl NetworkOptimizer {
    pub fn new(max_bandwidth_mbps: f64, enabled: bool) -> Self {
        Self {
            max_bandwidth_mbps,
            enabled,
            state: RwLock::new(OptimizerState::default()),
        }
    }

    /// 记录一个从 `started` 开始、传输了 `bytes` 字节的请求
    pub async fn record_request(&self, image_id: &str, started: Instant, bytes: u64) -> Option<f64> {
        self.record_sample(image_id, started.elapsed(), bytes).await
    }

    /// 记录一个已知耗时的样本，返回本次测得的带宽 (Mbps)
    pub async fn record_sample(&self, image_id: &str, duration: Duration, bytes: u64) -> Option<f64> {
        if !self.enabled {
            return None;
        }
        let secs = duration.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }

        let mbps = bytes as f64 * 8.0 / secs / 1_000_000.0;
        let mut state = self.state.write().await;
        state.samples.push_back(RequestSample {
            image_id: image_id.to_string(),
            bytes,
            duration,
            bandwidth_mbps: mbps,
            recorded_at: Utc::now(),
        });
        while state.samples.len() > SAMPLE_WINDOW {
            state.samples.pop_front();
        }

        let count = state.samples.len() as f64;
        let bandwidth_sum: f64 = state.samples.iter().map(|s| s.bandwidth_mbps).sum();
        let latency_sum: f64 = state.samples.iter().map(|s| s.duration.as_secs_f64() * 1000.0).sum();

        state.stats.current_bandwidth_mbps = mbps;
        state.stats.average_bandwidth_mbps = bandwidth_sum / count;
        state.stats.average_latency_ms = latency_sum / count;
        state.stats.sample_count = state.samples.len();
        state.stats.total_bytes += bytes;

        debug!("请求 {}: {} bytes, {:.2} Mbps", image_id, bytes, mbps);
        Some(mbps)
    }

    pub async fn current_bandwidth(&self) -> f64 {
        self.state.read().await.stats.current_bandwidth_mbps
    }

    pub async fn average_bandwidth(&self) -> f64 {
        self.state.read().await.stats.average_bandwidth_mbps
    }

    pub async fn average_latency_ms(&self) -> f64 {
        self.state.read().await.stats.average_latency_ms
    }

    pub async fn stats(&self) -> NetworkStats {
        self.state.read().await.stats.clone()
    }

    /// 按平均带宽占链路上限的比例给出画质建议
    ///
    /// 还没有样本时返回 `High`。
    pub async fn recommended_quality(&self) -> ImageQuality {
        let state = self.state.read().await;
        if state.samples.is_empty() || self.max_bandwidth_mbps <= 0.0 {
            return ImageQuality::High;
        }

        let ratio = state.stats.average_bandwidth_mbps / self.max_bandwidth_mbps;
        if ratio >= 0.5 {
            ImageQuality::Lossless
        } else if ratio >= 0.25 {
            ImageQuality::High
        } else if ratio >= 0.1 {
            ImageQuality::Medium
        } else {
            ImageQuality::Low
        }
    }

    pub async fn reset(&self) {
        *self.state.write().await = OptimizerState::default();
    }
}
