//! DIMSE 传输
//!
//! 不实现上层协议的二进制编码，只建模 C-ECHO/C-FIND/C-GET/C-STORE 的请求与响应，
//! 真正的关联由 [`DimseBackend`] 负责。

use crate::transport::{PacsTransport, TransportSettings};
use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{fields, DicomQueryResult, PacsConnection, PacsError, Protocol, QueryLevel, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// 常用SOP类UID
pub mod sop_classes {
    pub const VERIFICATION: &str = "1.2.840.10008.1.1";
    pub const PATIENT_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
    pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
    pub const STUDY_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";
}

/// 查询/检索层级的标识键 (0008,0052)
pub const QUERY_RETRIEVE_LEVEL: &str = "QueryRetrieveLevel";

/// DICOM命令字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandField {
    CStore,
    CFind,
    CGet,
    CEcho,
}

impl CommandField {
    pub fn code(self) -> u16 {
        match self {
            Self::CStore => 0x0001,
            Self::CGet => 0x0010,
            Self::CFind => 0x0020,
            Self::CEcho => 0x0030,
        }
    }
}

/// DIMSE状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Success,
    Pending,
    Warning(u16),
    Failure(u16),
    Cancel,
}

/// DICOM消息服务元素请求
#[derive(Debug, Clone)]
pub struct DimseRequest {
    pub command_field: CommandField,
    pub message_id: u16,
    pub affected_sop_class_uid: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub host: String,
    pub port: u16,
    /// C-FIND/C-GET 的标识符
    pub identifier: BTreeMap<String, String>,
    pub dataset: Option<Bytes>,
}

/// DICOM消息服务元素响应
#[derive(Debug, Clone)]
pub struct DimseResponse {
    pub command_field: CommandField,
    pub message_id_being_responded_to: u16,
    pub status: DimseStatus,
    /// C-FIND 匹配项，已归一化为属性名
    pub matches: Vec<BTreeMap<String, String>>,
    /// C-GET 取回的对象
    pub dataset: Option<Bytes>,
}

impl DimseResponse {
    pub fn for_request(request: &DimseRequest, status: DimseStatus) -> Self {
        Self {
            command_field: request.command_field,
            message_id_being_responded_to: request.message_id,
            status,
            matches: Vec::new(),
            dataset: None,
        }
    }
}

/// DIMSE关联后端
#[async_trait]
pub trait DimseBackend: Send + Sync {
    async fn send(&self, request: DimseRequest) -> Result<DimseResponse>;
}

/// 默认后端：握手只做TCP连通性检查
///
/// C-FIND 返回空匹配集，C-GET/C-STORE 以 0x0122 (SOP类不支持) 拒绝。
pub struct TcpProbeBackend;

#[async_trait]
impl DimseBackend for TcpProbeBackend {
    async fn send(&self, request: DimseRequest) -> Result<DimseResponse> {
        match request.command_field {
            CommandField::CEcho => {
                TcpStream::connect((request.host.as_str(), request.port))
                    .await
                    .map_err(|e| {
                        PacsError::Connectivity(format!("{}:{} {}", request.host, request.port, e))
                    })?;
                debug!("C-ECHO 握手成功: {}@{}:{}", request.called_ae_title, request.host, request.port);
                Ok(DimseResponse::for_request(&request, DimseStatus::Success))
            }
            CommandField::CFind => {
                warn!("未配置DIMSE关联后端，C-FIND 返回空结果");
                Ok(DimseResponse::for_request(&request, DimseStatus::Success))
            }
            CommandField::CGet | CommandField::CStore => {
                Ok(DimseResponse::for_request(&request, DimseStatus::Failure(0x0122)))
            }
        }
    }
}

/// DIMSE 传输
pub struct DimseTransport {
    host: String,
    port: u16,
    calling_ae_title: String,
    called_ae_title: String,
    backend: Arc<dyn DimseBackend>,
    settings: TransportSettings,
    next_message_id: AtomicU16,
}

impl DimseTransport {
    pub fn new(connection: &PacsConnection, backend: Arc<dyn DimseBackend>, settings: TransportSettings) -> Self {
        Self {
            host: connection.host.clone(),
            port: connection.port,
            calling_ae_title: connection.calling_ae_title.clone(),
            called_ae_title: connection.called_ae_title.clone(),
            backend,
            settings,
            next_message_id: AtomicU16::new(1),
        }
    }

    fn request(
        &self,
        command_field: CommandField,
        sop_class: &str,
        identifier: BTreeMap<String, String>,
        dataset: Option<Bytes>,
    ) -> DimseRequest {
        DimseRequest {
            command_field,
            message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            affected_sop_class_uid: sop_class.to_string(),
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            host: self.host.clone(),
            port: self.port,
            identifier,
            dataset,
        }
    }

    async fn exchange(&self, request: DimseRequest, timeout: Duration) -> Result<DimseResponse> {
        let command = request.command_field;
        let response = tokio::time::timeout(timeout, self.backend.send(request))
            .await
            .map_err(|_| {
                PacsError::Timeout(format!("{:?} 超过 {:?} 未响应", command, timeout))
            })??;

        match response.status {
            DimseStatus::Success | DimseStatus::Pending | DimseStatus::Warning(_) => Ok(response),
            DimseStatus::Cancel => Err(PacsError::Cancelled),
            DimseStatus::Failure(code) => Err(PacsError::Protocol(format!(
                "{:?} 失败，状态码 0x{:04X}",
                command, code
            ))),
        }
    }
}

#[async_trait]
impl PacsTransport for DimseTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Dimse
    }

    async fn query(
        &self,
        level: QueryLevel,
        criteria: &BTreeMap<String, String>,
    ) -> Result<Vec<DicomQueryResult>> {
        let mut identifier = criteria.clone();
        identifier.insert(QUERY_RETRIEVE_LEVEL.to_string(), level.as_str().to_string());
        let sop_class = match level {
            QueryLevel::Patient => sop_classes::PATIENT_ROOT_FIND,
            _ => sop_classes::STUDY_ROOT_FIND,
        };

        let request = self.request(CommandField::CFind, sop_class, identifier, None);
        let response = self.exchange(request, self.settings.request_timeout).await?;

        response
            .matches
            .into_iter()
            .map(|data| DicomQueryResult::from_attributes(level, data))
            .collect()
    }

    async fn retrieve(&self, item: &DicomQueryResult) -> Result<Bytes> {
        let (study, series, sop) = item.object_uids()?;
        let identifier: BTreeMap<String, String> = [
            (QUERY_RETRIEVE_LEVEL, QueryLevel::Image.as_str()),
            (fields::STUDY_INSTANCE_UID, study),
            (fields::SERIES_INSTANCE_UID, series),
            (fields::SOP_INSTANCE_UID, sop),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let request = self.request(CommandField::CGet, sop_classes::STUDY_ROOT_GET, identifier, None);
        let response = self.exchange(request, self.settings.request_timeout).await?;
        response
            .dataset
            .ok_or_else(|| PacsError::NotFound(format!("C-GET 未返回对象 {}", sop)))
    }

    async fn store(&self, data: Bytes) -> Result<()> {
        // SOP类由后端从数据集中解析
        let request = self.request(CommandField::CStore, "", BTreeMap::new(), Some(data));
        self.exchange(request, self.settings.request_timeout).await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        let request = self.request(CommandField::CEcho, sop_classes::VERIFICATION, BTreeMap::new(), None);
        self.exchange(request, self.settings.connection_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// 记录请求并按命令返回脚本化响应
    #[derive(Default)]
    struct ScriptedBackend {
        requests: Mutex<Vec<DimseRequest>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl DimseBackend for ScriptedBackend {
        async fn send(&self, request: DimseRequest) -> Result<DimseResponse> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.requests.lock().await.push(request.clone());
            let mut response = DimseResponse::for_request(&request, DimseStatus::Success);
            match request.command_field {
                CommandField::CFind => {
                    let mut m = BTreeMap::new();
                    m.insert(fields::STUDY_INSTANCE_UID.to_string(), "1.2.3".to_string());
                    response.matches.push(m);
                }
                CommandField::CGet => response.dataset = Some(Bytes::from_static(b"DICM")),
                _ => {}
            }
            Ok(response)
        }
    }

    fn connection() -> PacsConnection {
        PacsConnection::new("dimse", "127.0.0.1", 11112, Protocol::Dimse).with_ae_titles("SCU", "SCP")
    }

    #[tokio::test]
    async fn test_find_sets_query_level() {
        let backend = Arc::new(ScriptedBackend::default());
        let transport = DimseTransport::new(&connection(), backend.clone(), TransportSettings::default());

        let results = transport.query(QueryLevel::Study, &BTreeMap::new()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].uid, "1.2.3");

        let requests = backend.requests.lock().await;
        assert_eq!(requests[0].identifier[QUERY_RETRIEVE_LEVEL], "STUDY");
        assert_eq!(requests[0].affected_sop_class_uid, sop_classes::STUDY_ROOT_FIND);
        assert_eq!(requests[0].called_ae_title, "SCP");
    }

    #[tokio::test]
    async fn test_echo_times_out() {
        let backend = Arc::new(ScriptedBackend {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let settings = TransportSettings {
            connection_timeout: Duration::from_millis(20),
            request_timeout: Duration::from_secs(1),
        };
        let transport = DimseTransport::new(&connection(), backend, settings);

        let err = transport.test_connection().await.unwrap_err();
        assert!(matches!(err, PacsError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_probe_backend_rejects_get() {
        let transport = DimseTransport::new(&connection(), Arc::new(TcpProbeBackend), TransportSettings::default());
        let mut data = BTreeMap::new();
        for (k, v) in [
            (fields::STUDY_INSTANCE_UID, "1"),
            (fields::SERIES_INSTANCE_UID, "1.1"),
            (fields::SOP_INSTANCE_UID, "1.1.1"),
        ] {
            data.insert(k.to_string(), v.to_string());
        }
        let item = DicomQueryResult::from_attributes(QueryLevel::Image, data).unwrap();

        let err = transport.retrieve(&item).await.unwrap_err();
        assert!(matches!(err, PacsError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_probe_backend_echo_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = PacsConnection::new("dimse", "127.0.0.1", port, Protocol::Dimse);
        let transport = DimseTransport::new(&conn, Arc::new(TcpProbeBackend), TransportSettings::default());

        transport.test_connection().await.unwrap();
    }
}
