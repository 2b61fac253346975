//! 影像内存管理
//!
//! 三个独立的LRU缓存（影像、元数据、压缩数据）共享一个字节预算。
//! 预算是软目标：插入前按阈值回收，后台定时任务周期性回收。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 每次回收移除的缓存条目比例
pub const EVICTION_FRACTION: f64 = 0.25;

/// 缓存名称
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheName {
    Image,
    Metadata,
    Compressed,
}

impl CacheName {
    pub const ALL: [CacheName; 3] = [CacheName::Image, CacheName::Metadata, CacheName::Compressed];
}

/// 内存管理配置
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// 全局字节预算
    pub max_usage: u64,
    /// 单个缓存的容量
    pub cache_capacity: u64,
    /// 超过 `max_usage * gc_threshold` 时触发回收
    pub gc_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_usage: 1024 * 1024 * 1024,
            cache_capacity: 512 * 1024 * 1024,
            gc_threshold: 0.8,
        }
    }
}

/// 缓存条目
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Bytes,
    pub size: u64,
    pub cache: CacheName,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    /// 单调递增的访问序号，决定LRU顺序
    access_seq: u64,
}

/// 单个LRU缓存
#[derive(Debug, Default)]
struct LruCache {
    entries: HashMap<String, CacheEntry>,
    /// 访问序号 → 键，最小的是最久未使用的
    order: BTreeMap<u64, String>,
    usage: u64,
}

impl LruCache {
    fn touch(&mut self, key: &str, seq: u64) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.access_seq);
        entry.access_seq = seq;
        entry.last_access = Utc::now();
        self.order.insert(seq, key.to_string());
        Some(entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.remove(&entry.key);
        self.usage += entry.size;
        self.order.insert(entry.access_seq, entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.access_seq);
        self.usage -= entry.size;
        Some(entry)
    }

    fn pop_lru(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.order.pop_first()?;
        let entry = self.entries.remove(&key)?;
        self.usage -= entry.size;
        Some(entry)
    }

    /// 移除最久未使用的四分之一（非空时至少一个）
    fn evict_fraction(&mut self) -> (usize, u64) {
        let count = (self.entries.len() as f64 * EVICTION_FRACTION).ceil() as usize;
        let mut freed = 0;
        let mut removed = 0;
        for _ in 0..count {
            match self.pop_lru() {
                Some(entry) => {
                    freed += entry.size;
                    removed += 1;
                }
                None => break,
            }
        }
        (removed, freed)
    }
}

/// 一次回收的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
    pub per_cache: BTreeMap<CacheName, usize>,
}

/// 内存使用统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub current_usage: u64,
    pub max_usage: u64,
    pub entries: BTreeMap<CacheName, usize>,
    pub usage_by_cache: BTreeMap<CacheName, u64>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_evicted: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    caches: HashMap<CacheName, LruCache>,
    seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    bytes_evicted: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn cache_mut(&mut self, name: CacheName) -> &mut LruCache {
        self.caches.entry(name).or_default()
    }

    fn usage(&self) -> u64 {
        self.caches.values().map(|c| c.usage).sum()
    }

    fn evict(&mut self) -> EvictionReport {
        let mut report = EvictionReport::default();
        for name in CacheName::ALL {
            let (removed, freed) = self.cache_mut(name).evict_fraction();
            if removed > 0 {
                report.per_cache.insert(name, removed);
            }
            report.entries_removed += removed;
            report.bytes_freed += freed;
        }
        self.evictions += report.entries_removed as u64;
        self.bytes_evicted += report.bytes_freed;
        report
    }
}

/// 内存管理器
#[derive(Debug)]
pub struct MemoryManager {
    config: MemoryConfig,
    state: Mutex<MemoryState>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// 回收阈值（字节）
    pub fn threshold(&self) -> u64 {
        (self.config.max_usage as f64 * self.config.gc_threshold) as u64
    }

    /// 写入缓存
    ///
    /// 先按单缓存容量淘汰同一缓存的LRU条目，再在全局用量将超过阈值时
    /// 反复执行 [`MemoryManager::evict`] 直到新条目可以放下。
    pub async fn put(&self, cache: CacheName, key: impl Into<String>, data: Bytes) -> Result<()> {
        let key = key.into();
        let size = data.len() as u64;
        if size > self.config.cache_capacity {
            return Err(PacsError::Storage(format!(
                "条目 {} ({} bytes) 超过缓存容量 {}",
                key, size, self.config.cache_capacity
            )));
        }

        let threshold = self.threshold();
        let mut state = self.state.lock().await;
        state.cache_mut(cache).remove(&key);

        while state.cache_mut(cache).usage + size > self.config.cache_capacity {
            let Some(entry) = state.cache_mut(cache).pop_lru() else {
                break;
            };
            state.evictions += 1;
            state.bytes_evicted += entry.size;
        }

        while state.usage() > 0 && state.usage() + size > threshold {
            let report = state.evict();
            debug!(
                "写入 {} 前触发回收: 移除 {} 项, 释放 {} bytes",
                key, report.entries_removed, report.bytes_freed
            );
            if report.bytes_freed == 0 {
                break;
            }
        }

        let seq = state.next_seq();
        let now = Utc::now();
        state.cache_mut(cache).insert(CacheEntry {
            key,
            data,
            size,
            cache,
            inserted_at: now,
            last_access: now,
            access_seq: seq,
        });
        Ok(())
    }

    /// 读取缓存并刷新访问时间
    pub async fn get(&self, cache: CacheName, key: &str) -> Option<Bytes> {
        let mut state = self.state.lock().await;
        let seq = state.next_seq();
        let data = state.cache_mut(cache).touch(key, seq).map(|e| e.data.clone());
        if data.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        data
    }

    /// 不刷新访问时间的存在性检查
    pub async fn contains(&self, cache: CacheName, key: &str) -> bool {
        let state = self.state.lock().await;
        state
            .caches
            .get(&cache)
            .map(|c| c.entries.contains_key(key))
            .unwrap_or(false)
    }

    pub async fn remove(&self, cache: CacheName, key: &str) -> bool {
        self.state.lock().await.cache_mut(cache).remove(key).is_some()
    }

    /// 压缩后写入压缩缓存
    pub async fn put_compressed(&self, key: impl Into<String>, data: &[u8]) -> Result<()> {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        self.put(CacheName::Compressed, key, Bytes::from(compressed)).await
    }

    /// 从压缩缓存读取并解压
    pub async fn get_compressed(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(compressed) = self.get(CacheName::Compressed, key).await else {
            return Ok(None);
        };
        let mut decoder = DeflateDecoder::new(compressed.as_ref());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(Some(Bytes::from(out)))
    }

    /// 从每个缓存移除约25%最久未使用的条目
    pub async fn evict(&self) -> EvictionReport {
        let report = self.state.lock().await.evict();
        if report.entries_removed > 0 {
            info!(
                "内存回收: 移除 {} 项, 释放 {} bytes",
                report.entries_removed, report.bytes_freed
            );
        }
        report
    }

    /// 用量超过阈值时回收
    pub async fn check_pressure(&self) -> Option<EvictionReport> {
        if self.current_usage().await > self.threshold() {
            Some(self.evict().await)
        } else {
            None
        }
    }

    pub async fn current_usage(&self) -> u64 {
        self.state.lock().await.usage()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.caches.clear();
    }

    pub async fn stats(&self) -> MemoryStats {
        let state = self.state.lock().await;
        let mut stats = MemoryStats {
            current_usage: state.usage(),
            max_usage: self.config.max_usage,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            bytes_evicted: state.bytes_evicted,
            ..Default::default()
        };
        for (name, cache) in &state.caches {
            stats.entries.insert(*name, cache.entries.len());
            stats.usage_by_cache.insert(*name, cache.usage);
        }
        stats
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}
