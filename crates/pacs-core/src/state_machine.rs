//! 操作状态机
//!
//! 管理查询和检索任务的生命周期状态转换

use crate::{OperationStatus, PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationEvent {
    Start,
    Pause,
    Resume,
    Complete,
    Fail,
    Cancel,
}

/// 操作状态机
#[derive(Debug)]
pub struct OperationStateMachine {
    transitions: HashMap<(OperationStatus, OperationEvent), OperationStatus>,
}

impl OperationStateMachine {
    /// 查询状态机: pending → running → {completed|failed|cancelled}
    pub fn for_query() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((OperationStatus::Pending, OperationEvent::Start), OperationStatus::Running);
        transitions.insert((OperationStatus::Running, OperationEvent::Complete), OperationStatus::Completed);
        transitions.insert((OperationStatus::Running, OperationEvent::Fail), OperationStatus::Failed);
        transitions.insert((OperationStatus::Running, OperationEvent::Cancel), OperationStatus::Cancelled);

        Self { transitions }
    }

    /// 检索任务状态机，在查询状态机基础上增加暂停/恢复
    pub fn for_job() -> Self {
        let mut sm = Self::for_query();

        sm.transitions.insert((OperationStatus::Running, OperationEvent::Pause), OperationStatus::Paused);
        sm.transitions.insert((OperationStatus::Paused, OperationEvent::Resume), OperationStatus::Running);
        sm.transitions.insert((OperationStatus::Paused, OperationEvent::Cancel), OperationStatus::Cancelled);

        sm
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: OperationStatus, event: OperationEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: OperationStatus, event: OperationEvent) -> Result<OperationStatus> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(PacsError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current: OperationStatus) -> Vec<OperationEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current)
            .map(|(_, event)| *event)
            .collect()
    }
}
