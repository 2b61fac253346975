//! # PACS Core
//!
//! PACS网络层的核心模块，提供连接、查询、检索任务等基础数据结构，
//! 统一错误定义、操作状态机和通用工具。

pub mod error;
pub mod models;
pub mod state_machine;
pub mod utils;

pub use error::{ErrorKind, PacsError, Result};
pub use models::*;
pub use state_machine::{OperationEvent, OperationStateMachine};
