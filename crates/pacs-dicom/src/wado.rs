//! 传统 WADO-URI 传输
//!
//! 查询沿用 QIDO-RS，对象检索走 `/wado?requestType=WADO`。

use crate::dicomweb::{probe, qido_search, HttpEndpoint, DICOM};
use crate::transport::{apply_auth, ensure_success, map_http_error, PacsTransport, TransportSettings};
use async_trait::async_trait;
use bytes::Bytes;
use pacs_core::{DicomQueryResult, PacsConnection, PacsError, Protocol, QueryLevel, Result};
use reqwest::header::ACCEPT;
use std::collections::BTreeMap;
use tracing::debug;

/// WADO-URI 对象检索的查询参数
pub fn wado_uri_params<'a>(study: &'a str, series: &'a str, object: &'a str) -> [(&'static str, &'a str); 5] {
    [
        ("requestType", "WADO"),
        ("studyUID", study),
        ("seriesUID", series),
        ("objectUID", object),
        ("contentType", DICOM),
    ]
}

/// WADO 传输
pub struct WadoTransport {
    client: reqwest::Client,
    endpoint: HttpEndpoint,
    settings: TransportSettings,
}

impl WadoTransport {
    pub fn new(client: reqwest::Client, connection: &PacsConnection, settings: TransportSettings) -> Self {
        Self {
            client,
            endpoint: HttpEndpoint::from_connection(connection),
            settings,
        }
    }
}

#[async_trait]
impl PacsTransport for WadoTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Wado
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
        let url = self.endpoint.url("/wado");
        debug!("WADO-URI 检索: {} object={}", url, sop);

        let request = self
            .client
            .get(&url)
            .query(&wado_uri_params(study, series, sop))
            .header(ACCEPT, DICOM);
        let response = apply_auth(request, &self.endpoint.auth)
            .send()
            .await
            .map_err(map_http_error)?;
        let response = ensure_success(response).await?;
        response.bytes().await.map_err(map_http_error)
    }

    async fn store(&self, _data: Bytes) -> Result<()> {
        Err(PacsError::Protocol("WADO-URI 连接不支持存储".to_string()))
    }

    async fn test_connection(&self) -> Result<()> {
        probe(&self.client, &self.endpoint, &self.settings).await
    }
}
