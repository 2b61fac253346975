//! 协议传输层
//!
//! 每个协议族一个实现，查询/检索引擎只依赖 [`PacsTransport`]。

use crate::{dicomweb::DicomWebTransport, dimse::DimseTransport, wado::WadoTransport};
use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{
    Authentication, DicomQueryResult, PacsConnection, PacsError, Protocol, QueryLevel, Result,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// 协议传输接口
#[async_trait]
pub trait PacsTransport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// 层级查询 (QIDO-RS / C-FIND)
    async fn query(
        &self,
        level: QueryLevel,
        criteria: &BTreeMap<String, String>,
    ) -> Result<Vec<DicomQueryResult>>;

    /// 对象级检索 (WADO-RS / WADO-URI / C-GET)
    async fn retrieve(&self, item: &DicomQueryResult) -> Result<Bytes>;

    /// 存储一个DICOM对象 (STOW-RS / C-STORE)
    async fn store(&self, data: Bytes) -> Result<()>;

    /// 连接探测 (HTTP GET / C-ECHO)
    async fn test_connection(&self) -> Result<()>;
}

/// 传输层超时设置
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// 握手类探测的超时
    pub connection_timeout: Duration,
    /// 数据请求的超时
    pub request_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// 根据连接创建传输实例
pub trait TransportFactory: Send + Sync {
    fn create(&self, connection: &PacsConnection) -> Result<Arc<dyn PacsTransport>>;
}

/// 默认传输工厂，按协议族分派
pub struct DefaultTransportFactory {
    settings: TransportSettings,
    enabled: Vec<Protocol>,
    client: reqwest::Client,
    dimse_backend: Arc<dyn crate::dimse::DimseBackend>,
}

impl DefaultTransportFactory {
    pub fn new(settings: TransportSettings, enabled: Vec<Protocol>) -> Result<Self> {
        let client = build_http_client(&settings)?;
        Ok(Self {
            settings,
            enabled,
            client,
            dimse_backend: Arc::new(crate::dimse::TcpProbeBackend),
        })
    }

    /// 替换DIMSE后端
    pub fn with_dimse_backend(mut self, backend: Arc<dyn crate::dimse::DimseBackend>) -> Self {
        self.dimse_backend = backend;
        self
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, connection: &PacsConnection) -> Result<Arc<dyn PacsTransport>> {
        if !self.enabled.contains(&connection.protocol) {
            return Err(PacsError::Config(format!(
                "协议 {:?} 未启用",
                connection.protocol
            )));
        }

        let transport: Arc<dyn PacsTransport> = match connection.protocol {
            Protocol::DicomWeb => Arc::new(DicomWebTransport::new(
                self.client.clone(),
                connection,
                self.settings,
            )),
            Protocol::Wado => Arc::new(WadoTransport::new(
                self.client.clone(),
                connection,
                self.settings,
            )),
            Protocol::Dimse => Arc::new(DimseTransport::new(
                connection,
                self.dimse_backend.clone(),
                self.settings,
            )),
        };
        Ok(transport)
    }
}

pub(crate) fn build_http_client(settings: &TransportSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connection_timeout)
        .timeout(settings.request_timeout)
        .build()
        .map_err(|e| PacsError::Config(format!("无法创建HTTP客户端: {}", e)))
}

/// 添加认证头
pub(crate) fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &Authentication,
) -> reqwest::RequestBuilder {
    match auth {
        Authentication::None => request,
        Authentication::Bearer { token } => request.bearer_auth(token),
        Authentication::Basic { username, password } => request.basic_auth(username, Some(password)),
    }
}

/// reqwest错误映射到统一错误分类
pub(crate) fn map_http_error(error: reqwest::Error) -> PacsError {
    if error.is_timeout() {
        PacsError::Timeout(error.to_string())
    } else if error.is_connect() || error.is_request() {
        PacsError::Connectivity(error.to_string())
    } else if error.is_decode() || error.is_body() {
        PacsError::Protocol(error.to_string())
    } else if let Some(status) = error.status() {
        PacsError::from_status(status.as_u16(), error.to_string())
    } else {
        PacsError::Connectivity(error.to_string())
    }
}

/// 非2xx响应转为错误
pub(crate) async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let detail = if body.is_empty() {
        url
    } else {
        format!("{}: {}", url, body.chars().take(200).collect::<String>())
    };
    Err(PacsError::from_status(status.as_u16(), detail))
}
