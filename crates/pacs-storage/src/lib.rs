//! # PACS存储模块
//!
//! 负责检索数据的内存缓存，以及连接注册表的键值持久化。

pub mod kv;
pub mod memory;

pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use memory::{CacheEntry, CacheName, EvictionReport, MemoryConfig, MemoryManager, MemoryStats};
