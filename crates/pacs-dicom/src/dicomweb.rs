//! DICOMweb 传输 (QIDO-RS / WADO-RS / STOW-RS)

use crate::tags::parse_query_response;
use crate::transport::{apply_auth, ensure_success, map_http_error, PacsTransport, TransportSettings};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use pacs_core::utils::is_valid_dicom_uid;
use pacs_core::{
    fields, Authentication, DicomQueryResult, PacsConnection, PacsError, Protocol, QueryLevel, Result,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use tracing::debug;

pub const DICOM_JSON: &str = "application/dicom+json";
pub const DICOM: &str = "application/dicom";

const STOW_BOUNDARY: &str = "pacs-stow-boundary";

/// HTTP类协议共享的连接端点信息
#[derive(Debug, Clone)]
pub(crate) struct HttpEndpoint {
    pub base_url: String,
    pub auth: Authentication,
}

impl HttpEndpoint {
    pub fn from_connection(connection: &PacsConnection) -> Self {
        Self {
            base_url: connection.base_url(),
            auth: connection.auth.clone(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// 层级查询路径，以及被路径消耗掉的条件键
pub fn qido_path(level: QueryLevel, criteria: &BTreeMap<String, String>) -> Result<(String, Vec<&'static str>)> {
    let require = |field: &'static str| -> Result<String> {
        let uid = criteria
            .get(field)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PacsError::Validation(format!("{:?} 级查询需要 {}", level, field)))?;
        // 会拼进路径
        if !is_valid_dicom_uid(uid) {
            return Err(PacsError::Validation(format!("{} 不是合法的UID: {:?}", field, uid)));
        }
        Ok(uid.clone())
    };

    Ok(match level {
        QueryLevel::Patient => ("/patients".to_string(), vec![]),
        QueryLevel::Study => ("/studies".to_string(), vec![]),
        QueryLevel::Series => {
            let study = require(fields::STUDY_INSTANCE_UID)?;
            (format!("/studies/{}/series", study), vec![fields::STUDY_INSTANCE_UID])
        }
        QueryLevel::Image => {
            let study = require(fields::STUDY_INSTANCE_UID)?;
            let series = require(fields::SERIES_INSTANCE_UID)?;
            (
                format!("/studies/{}/series/{}/instances", study, series),
                vec![fields::STUDY_INSTANCE_UID, fields::SERIES_INSTANCE_UID],
            )
        }
    })
}

/// QIDO-RS 查询，DICOMweb 和 WADO 连接共用
pub(crate) async fn qido_search(
    client: &reqwest::Client,
    endpoint: &HttpEndpoint,
    level: QueryLevel,
    criteria: &BTreeMap<String, String>,
) -> Result<Vec<DicomQueryResult>> {
    let (path, consumed) = qido_path(level, criteria)?;
    let params: Vec<(&str, &str)> = criteria
        .iter()
        .filter(|(k, v)| !v.is_empty() && !consumed.iter().any(|c| *c == k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let url = endpoint.url(&path);
    debug!("QIDO-RS 查询: {} {:?}", url, params);

    let request = client
        .get(&url)
        .query(&params)
        .header(ACCEPT, DICOM_JSON)
        .header(CONTENT_TYPE, DICOM_JSON);
    let response = apply_auth(request, &endpoint.auth)
        .send()
        .await
        .map_err(map_http_error)?;
    let response = ensure_success(response).await?;

    // 无匹配时服务器可以返回 204
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(Vec::new());
    }

    let body = response.bytes().await.map_err(map_http_error)?;
    if body.is_empty() {
        return Ok(Vec::new());
    }
    let json: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| PacsError::Protocol(format!("无法解析查询响应: {}", e)))?;
    parse_query_response(level, &json)
}

/// 连接探测：对检查列表端点做一次轻量GET
pub(crate) async fn probe(
    client: &reqwest::Client,
    endpoint: &HttpEndpoint,
    settings: &TransportSettings,
) -> Result<()> {
    let request = client
        .get(endpoint.url("/studies"))
        .query(&[("limit", "1")])
        .header(ACCEPT, DICOM_JSON)
        .timeout(settings.connection_timeout);
    let response = apply_auth(request, &endpoint.auth)
        .send()
        .await
        .map_err(map_http_error)?;
    ensure_success(response).await?;
    Ok(())
}

/// DICOMweb 传输
pub struct DicomWebTransport {
    client: reqwest::Client,
    endpoint: HttpEndpoint,
    settings: TransportSettings,
}

impl DicomWebTransport {
    pub fn new(client: reqwest::Client, connection: &PacsConnection, settings: TransportSettings) -> Self {
        Self {
            client,
            endpoint: HttpEndpoint::from_connection(connection),
            settings,
        }
    }
}

#[async_trait]
impl PacsTransport for DicomWebTransport {
    fn protocol(&self) -> Protocol {
        Protocol::DicomWeb
    }

    async fn query(
        &self,
        level: QueryLevel,
        criteria: &BTreeMap<String, String>,
    ) -> Result<Vec<DicomQueryResult>> {
        qido_search(&self.client, &self.endpoint, level, criteria).await
    }

    async fn retrieve(&self, item: &DicomQueryResult) -> Result<Bytes> {
        let (study, series, sop) = item.object_uids()?;
        let url = self
            .endpoint
            .url(&format!("/studies/{}/series/{}/instances/{}", study, series, sop));
        debug!("WADO-RS 检索: {}", url);

        let request = self.client.get(&url).header(ACCEPT, DICOM);
        let response = apply_auth(request, &self.endpoint.auth)
            .send()
            .await
            .map_err(map_http_error)?;
        let response = ensure_success(response).await?;
        response.bytes().await.map_err(map_http_error)
    }

    async fn store(&self, data: Bytes) -> Result<()> {
        let url = self.endpoint.url("/studies");
        debug!("STOW-RS 存储: {} ({} bytes)", url, data.len());

        let content_type = format!(
            "multipart/related; type=\"{}\"; boundary={}",
            DICOM, STOW_BOUNDARY
        );
        let request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .header(ACCEPT, DICOM_JSON)
            .body(multipart_related(&data));
        let response = apply_auth(request, &self.endpoint.auth)
            .send()
            .await
            .map_err(map_http_error)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        probe(&self.client, &self.endpoint, &self.settings).await
    }
}

/// 单个部分的 multipart/related 请求体
fn multipart_related(data: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(data.len() + 128);
    body.put_slice(format!("--{}\r\nContent-Type: {}\r\n\r\n", STOW_BOUNDARY, DICOM).as_bytes());
    body.put_slice(data);
    body.put_slice(format!("\r\n--{}--\r\n", STOW_BOUNDARY).as_bytes());
    body.freeze()
}
