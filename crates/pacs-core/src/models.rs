//! 核心数据模型定义

use crate::utils::is_valid_dicom_uid;
use crate::{OperationEvent, OperationStateMachine, PacsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// 归一化后的DICOM属性名
pub mod fields {
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_ID: &str = "PatientID";
    pub const PATIENT_BIRTH_DATE: &str = "PatientBirthDate";
    pub const PATIENT_SEX: &str = "PatientSex";
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const STUDY_ID: &str = "StudyID";
    pub const STUDY_DATE: &str = "StudyDate";
    pub const STUDY_TIME: &str = "StudyTime";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const ACCESSION_NUMBER: &str = "AccessionNumber";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SERIES_NUMBER: &str = "SeriesNumber";
    pub const SERIES_DESCRIPTION: &str = "SeriesDescription";
    pub const MODALITY: &str = "Modality";
    pub const SOP_CLASS_UID: &str = "SOPClassUID";
    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const INSTANCE_NUMBER: &str = "InstanceNumber";
}

/// 协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "DIMSE")]
    Dimse,
    #[serde(rename = "DICOMweb")]
    DicomWeb,
    #[serde(rename = "WADO")]
    Wado,
}

impl std::str::FromStr for Protocol {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dimse" => Ok(Self::Dimse),
            "dicomweb" => Ok(Self::DicomWeb),
            "wado" => Ok(Self::Wado),
            _ => Err(PacsError::Validation(format!("未知协议: {}", s))),
        }
    }
}

/// 连接支持的服务能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Find,
    Move,
    Get,
    Store,
    WadoRs,
    WadoUri,
    QidoRs,
    StowRs,
}

impl Capability {
    /// 协议族的默认能力集合
    pub fn defaults_for(protocol: Protocol) -> BTreeSet<Capability> {
        let caps: &[Capability] = match protocol {
            Protocol::Dimse => &[Self::Find, Self::Move, Self::Get, Self::Store],
            Protocol::DicomWeb => &[Self::QidoRs, Self::WadoRs, Self::StowRs],
            Protocol::Wado => &[Self::QidoRs, Self::WadoUri],
        };
        caps.iter().copied().collect()
    }
}

/// 认证方式
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authentication {
    #[default]
    None,
    Bearer { token: String },
    Basic { username: String, password: String },
}

/// 连接状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Connecting,
    Error,
}

/// 连接统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatistics {
    pub total_queries: u64,
    pub total_retrievals: u64,
    pub total_stores: u64,
    /// 平滑后的平均响应时间（毫秒）
    pub average_response_time_ms: f64,
    pub response_samples: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// 远程PACS连接
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacsConnection {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub calling_ae_title: String,       // 本地AE标题
    pub called_ae_title: String,        // 远程AE标题
    pub protocol: Protocol,
    pub secure: bool,
    pub path_prefix: Option<String>,    // 例如 "/dicom-web"
    pub auth: Authentication,
    pub capabilities: BTreeSet<Capability>,
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub statistics: ConnectionStatistics,
    pub created_at: DateTime<Utc>,
}

impl PacsConnection {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            host: host.into(),
            port,
            calling_ae_title: "PACS_CLIENT".to_string(),
            called_ae_title: "PACS_SERVER".to_string(),
            protocol,
            secure: false,
            path_prefix: None,
            auth: Authentication::None,
            capabilities: Capability::defaults_for(protocol),
            status: ConnectionStatus::Disconnected,
            last_connected: None,
            statistics: ConnectionStatistics::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_ae_titles(mut self, calling: impl Into<String>, called: impl Into<String>) -> Self {
        self.calling_ae_title = calling.into();
        self.called_ae_title = called.into();
        self
    }

    pub fn with_auth(mut self, auth: Authentication) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// HTTP类协议的基础URL
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let prefix = self
            .path_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .unwrap_or("");
        format!("{}://{}:{}{}", scheme, self.host, self.port, prefix)
    }

    /// 注册前的字段校验
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(PacsError::Validation("主机地址不能为空".to_string()));
        }
        if self.port == 0 {
            return Err(PacsError::Validation("端口不能为0".to_string()));
        }
        for ae in [&self.calling_ae_title, &self.called_ae_title] {
            if ae.is_empty() || ae.len() > 16 {
                return Err(PacsError::Validation(format!("无效的AE标题: '{}'", ae)));
            }
        }
        if let Authentication::Basic { username, .. } = &self.auth {
            if username.is_empty() {
                return Err(PacsError::Validation("Basic认证缺少用户名".to_string()));
            }
        }
        Ok(())
    }
}

/// 连接的部分更新
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub calling_ae_title: Option<String>,
    pub called_ae_title: Option<String>,
    pub secure: Option<bool>,
    pub path_prefix: Option<Option<String>>,
    pub auth: Option<Authentication>,
    pub capabilities: Option<BTreeSet<Capability>>,
}

impl ConnectionUpdate {
    pub fn apply_to(self, conn: &mut PacsConnection) {
        if let Some(name) = self.name {
            conn.name = name;
        }
        if let Some(host) = self.host {
            conn.host = host;
        }
        if let Some(port) = self.port {
            conn.port = port;
        }
        if let Some(ae) = self.calling_ae_title {
            conn.calling_ae_title = ae;
        }
        if let Some(ae) = self.called_ae_title {
            conn.called_ae_title = ae;
        }
        if let Some(secure) = self.secure {
            conn.secure = secure;
        }
        if let Some(prefix) = self.path_prefix {
            conn.path_prefix = prefix;
        }
        if let Some(auth) = self.auth {
            conn.auth = auth;
        }
        if let Some(caps) = self.capabilities {
            conn.capabilities = caps;
        }
    }
}

/// 查询层级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryLevel {
    /// 该层级结果的唯一标识字段
    pub fn identifier_field(self) -> &'static str {
        match self {
            Self::Patient => fields::PATIENT_ID,
            Self::Study => fields::STUDY_INSTANCE_UID,
            Self::Series => fields::SERIES_INSTANCE_UID,
            Self::Image => fields::SOP_INSTANCE_UID,
        }
    }

    /// 上一层级的标识字段
    pub fn parent_field(self) -> Option<&'static str> {
        match self {
            Self::Patient => None,
            Self::Study => Some(fields::PATIENT_ID),
            Self::Series => Some(fields::STUDY_INSTANCE_UID),
            Self::Image => Some(fields::SERIES_INSTANCE_UID),
        }
    }

    /// DIMSE查询/检索层级名称 (0008,0052)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "PATIENT",
            Self::Study => "STUDY",
            Self::Series => "SERIES",
            Self::Image => "IMAGE",
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(Self::Patient),
            "STUDY" => Ok(Self::Study),
            "SERIES" => Ok(Self::Series),
            "IMAGE" | "INSTANCE" => Ok(Self::Image),
            _ => Err(PacsError::Validation(format!("未知查询层级: {}", s))),
        }
    }
}

/// 查询或检索任务的状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 查询结果节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DicomQueryResult {
    pub level: QueryLevel,
    pub data: BTreeMap<String, String>,
    pub uid: String,
    pub parent_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DicomQueryResult>,
}

impl DicomQueryResult {
    /// 从归一化属性构造结果，标识字段缺失或为空时返回错误
    pub fn from_attributes(level: QueryLevel, data: BTreeMap<String, String>) -> Result<Self> {
        let field = level.identifier_field();
        let uid = match data.get(field) {
            Some(v) if !v.is_empty() => v.clone(),
            Some(_) => {
                return Err(PacsError::Protocol(format!("{} 字段存在但值为空", field)));
            }
            None => {
                return Err(PacsError::Protocol(format!("{:?} 级结果缺少 {}", level, field)));
            }
        };
        let parent_uid = level
            .parent_field()
            .and_then(|f| data.get(f))
            .filter(|v| !v.is_empty())
            .cloned();

        Ok(Self {
            level,
            data,
            uid,
            parent_uid,
            children: Vec::new(),
        })
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.data.get(field).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn study_uid(&self) -> Option<&str> {
        self.get(fields::STUDY_INSTANCE_UID)
    }

    pub fn series_uid(&self) -> Option<&str> {
        self.get(fields::SERIES_INSTANCE_UID)
    }

    pub fn sop_instance_uid(&self) -> Option<&str> {
        self.get(fields::SOP_INSTANCE_UID)
    }

    /// 对象级检索所需的三个UID，会拼进请求路径，所以必须是合法UID
    pub fn object_uids(&self) -> Result<(&str, &str, &str)> {
        let (study, series, sop) = match (self.study_uid(), self.series_uid(), self.sop_instance_uid()) {
            (Some(study), Some(series), Some(sop)) => (study, series, sop),
            _ => {
                return Err(PacsError::Validation(format!(
                    "结果 {} 缺少对象级检索所需的UID",
                    self.uid
                )))
            }
        };
        for uid in [study, series, sop] {
            if !is_valid_dicom_uid(uid) {
                return Err(PacsError::Validation(format!("非法的UID: {:?}", uid)));
            }
        }
        Ok((study, series, sop))
    }
}

/// DICOM查询
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DicomQuery {
    pub id: Uuid,
    pub connection_id: String,
    pub level: QueryLevel,
    pub criteria: BTreeMap<String, String>,
    pub status: OperationStatus,
    pub results: Vec<DicomQueryResult>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: u8,
    pub error: Option<String>,
}

impl DicomQuery {
    pub fn new(connection_id: impl Into<String>, level: QueryLevel, criteria: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id: connection_id.into(),
            level,
            criteria,
            status: OperationStatus::Pending,
            results: Vec::new(),
            start_time: None,
            end_time: None,
            progress: 0,
            error: None,
        }
    }

    /// 执行状态转换；进入终止状态时记录一次结束时间
    pub fn apply(&mut self, machine: &OperationStateMachine, event: OperationEvent) -> Result<()> {
        self.status = machine.transition(self.status, event)?;
        stamp_times(self.status, &mut self.start_time, &mut self.end_time);
        Ok(())
    }
}

fn stamp_times(status: OperationStatus, start: &mut Option<DateTime<Utc>>, end: &mut Option<DateTime<Utc>>) {
    if status == OperationStatus::Running && start.is_none() {
        *start = Some(Utc::now());
    }
    if status.is_terminal() && end.is_none() {
        *end = Some(Utc::now());
    }
}

/// 检索目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    /// 写入内存管理器的影像缓存
    Local,
    /// 转发到另一个PACS连接
    Pacs { connection_id: String },
    /// 上传到云存储路径
    Cloud { path: String },
}

/// 检索目标类型，用于选择投递策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Local,
    Pacs,
    Cloud,
}

impl Destination {
    pub fn kind(&self) -> DestinationKind {
        match self {
            Self::Local => DestinationKind::Local,
            Self::Pacs { .. } => DestinationKind::Pacs,
            Self::Cloud { .. } => DestinationKind::Cloud,
        }
    }
}

/// 请求优先级，urgent 最先被调度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

/// 检索进度
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub percentage: f64,
    pub bytes_transferred: u64,
    /// 字节/秒
    pub speed: f64,
    /// 剩余秒数，没有完成项时未知
    pub eta_seconds: Option<f64>,
}

impl RetrievalProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn processed(&self) -> usize {
        self.completed + self.failed
    }

    pub fn record_success(&mut self, bytes: u64, elapsed_secs: f64) {
        self.completed += 1;
        self.bytes_transferred += bytes;
        self.recompute(elapsed_secs);
    }

    pub fn record_failure(&mut self, elapsed_secs: f64) {
        self.failed += 1;
        self.recompute(elapsed_secs);
    }

    fn recompute(&mut self, elapsed_secs: f64) {
        self.percentage = if self.total == 0 {
            100.0
        } else {
            self.processed() as f64 / self.total as f64 * 100.0
        };

        if elapsed_secs > 0.0 {
            self.speed = self.bytes_transferred as f64 / elapsed_secs;
            let rate = self.completed as f64 / elapsed_secs;
            self.eta_seconds = if rate > 0.0 {
                Some(self.total.saturating_sub(self.processed()) as f64 / rate)
            } else {
                None
            };
        }
    }
}

/// 检索任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DicomRetrievalJob {
    pub id: Uuid,
    pub query_id: Uuid,
    pub connection_id: String,
    pub destination: Destination,
    pub priority: RequestPriority,
    pub status: OperationStatus,
    pub progress: RetrievalProgress,
    /// 下一个待处理结果的下标，暂停后从这里恢复
    pub next_index: usize,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DicomRetrievalJob {
    pub fn new(
        query_id: Uuid,
        connection_id: impl Into<String>,
        destination: Destination,
        priority: RequestPriority,
        total: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            query_id,
            connection_id: connection_id.into(),
            destination,
            priority,
            status: OperationStatus::Pending,
            progress: RetrievalProgress::new(total),
            next_index: 0,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error: None,
        }
    }

    pub fn apply(&mut self, machine: &OperationStateMachine, event: OperationEvent) -> Result<()> {
        self.status = machine.transition(self.status, event)?;
        stamp_times(self.status, &mut self.start_time, &mut self.end_time);
        Ok(())
    }
}
