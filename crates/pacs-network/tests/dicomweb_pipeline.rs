//! 针对进程内模拟档案服务器的端到端测试：查询、检索、暂停/恢复、取消、认证和超时。

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use pacs_admin::NetworkConfig;
use pacs_core::{
    fields, Authentication, ConnectionStatus, Destination, DicomQuery, DicomRetrievalJob,
    OperationStatus, PacsConnection, Protocol, QueryLevel, RequestPriority,
};
use pacs_network::PacsNetworkService;
use pacs_storage::{CacheName, MemoryKeyValueStore};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

const STUDY_A: &str = "1.2.840.10008.1";
const STUDY_B: &str = "1.2.840.10008.2";
const SERIES: &str = "1.2.840.10008.1.1";

/// 模拟档案的行为设置与请求记录
#[derive(Default)]
struct Archive {
    instance_count: usize,
    missing_instance: Option<usize>,
    /// 该实例在响应前额外等待 `stall`
    slow_instance: Option<usize>,
    stall: Duration,
    delay: Duration,
    query_delay: Duration,
    bearer_token: Option<String>,
    fetched: Mutex<Vec<String>>,
    query_headers: Mutex<Vec<HeaderMap>>,
    query_params: Mutex<Vec<HashMap<String, String>>>,
}

impl Archive {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.bearer_token {
            None => true,
            Some(token) => headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == format!("Bearer {}", token))
                .unwrap_or(false),
        }
    }

    fn instance_uid(n: usize) -> String {
        format!("{}.{}", SERIES, n)
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    async fn object(&self, instance: String) -> Response {
        self.fetched.lock().unwrap().push(instance.clone());
        tokio::time::sleep(self.delay).await;
        if self.slow_instance.map(Self::instance_uid).as_deref() == Some(instance.as_str()) {
            tokio::time::sleep(self.stall).await;
        }

        let missing = self.missing_instance.map(Self::instance_uid);
        if missing.as_deref() == Some(instance.as_str()) {
            return StatusCode::NOT_FOUND.into_response();
        }
        let mut body = b"DICM".to_vec();
        body.extend_from_slice(instance.as_bytes());
        ([(header::CONTENT_TYPE, "application/dicom")], body).into_response()
    }
}

fn study(uid: &str, patient_id: &str) -> Value {
    json!({
        "00100010": {"vr": "PN", "Value": [{"Alphabetic": "DOE^JOHN"}]},
        "00100020": {"vr": "LO", "Value": [patient_id]},
        "0020000D": {"vr": "UI", "Value": [uid]},
        "00080020": {"vr": "DA", "Value": ["20240105"]},
        "00080061": {"vr": "CS", "Value": ["CT"]}
    })
}

async fn search_studies(
    State(archive): State<Arc<Archive>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !archive.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    archive.query_headers.lock().unwrap().push(headers);
    archive.query_params.lock().unwrap().push(params.clone());
    tokio::time::sleep(archive.query_delay).await;

    match params.get("PatientID").map(String::as_str) {
        None | Some("12345") => Json(json!([study(STUDY_A, "12345"), study(STUDY_B, "12345")])).into_response(),
        Some(_) => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn search_instances(
    State(archive): State<Arc<Archive>>,
    headers: HeaderMap,
    Path((study, series)): Path<(String, String)>,
) -> Response {
    if !archive.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let instances: Vec<Value> = (1..=archive.instance_count)
        .map(|n| {
            json!({
                "0020000D": {"vr": "UI", "Value": [study]},
                "0020000E": {"vr": "UI", "Value": [series]},
                "00080018": {"vr": "UI", "Value": [Archive::instance_uid(n)]},
                "00200013": {"vr": "IS", "Value": [n]}
            })
        })
        .collect();
    Json(Value::Array(instances)).into_response()
}

async fn retrieve_instance(
    State(archive): State<Arc<Archive>>,
    headers: HeaderMap,
    Path((_study, _series, instance)): Path<(String, String, String)>,
) -> Response {
    if !archive.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    archive.object(instance).await
}

async fn wado_uri(State(archive): State<Arc<Archive>>, Query(params): Query<HashMap<String, String>>) -> Response {
    if params.get("requestType").map(String::as_str) != Some("WADO") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match params.get("objectUID") {
        Some(uid) => archive.object(uid.clone()).await,
        None => StatusCode::BAD_REQUEST.into_response(),
    }
}

/// 启动模拟档案服务器
async fn start_archive(archive: Archive) -> (SocketAddr, Arc<Archive>) {
    let archive = Arc::new(archive);
    let app = Router::new()
        .route("/studies", get(search_studies))
        .route("/studies/:study/series/:series/instances", get(search_instances))
        .route(
            "/studies/:study/series/:series/instances/:instance",
            get(retrieve_instance),
        )
        .route("/wado", get(wado_uri))
        .with_state(archive.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // 等待服务器就绪
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, archive)
}

fn test_config() -> NetworkConfig {
    NetworkConfig {
        scheduler_tick_ms: 5,
        retry_delay_ms: 10,
        connection_timeout_ms: 2_000,
        request_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn start_service() -> PacsNetworkService {
    start_service_with(test_config()).await
}

async fn start_service_with(config: NetworkConfig) -> PacsNetworkService {
    let service = PacsNetworkService::builder(config)
        .key_value_store(Arc::new(MemoryKeyValueStore::new()))
        .build()
        .unwrap();
    service.start().await.unwrap();
    service
}

async fn register(service: &PacsNetworkService, addr: SocketAddr, protocol: Protocol, auth: Authentication) -> String {
    let conn = PacsConnection::new("mock archive", addr.ip().to_string(), addr.port(), protocol).with_auth(auth);
    service.registry().add(conn).await.unwrap()
}

fn criteria(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

async fn instance_query(service: &PacsNetworkService, conn: &str) -> DicomQuery {
    let query = service
        .queries()
        .execute(
            QueryLevel::Image,
            criteria(&[
                (fields::STUDY_INSTANCE_UID, STUDY_A),
                (fields::SERIES_INSTANCE_UID, SERIES),
            ]),
            conn,
        )
        .await
        .unwrap();
    assert_eq!(query.status, OperationStatus::Completed, "{:?}", query.error);
    query
}

async fn wait_for_status(service: &PacsNetworkService, job_id: Uuid, status: OperationStatus) -> DicomRetrievalJob {
    for _ in 0..600 {
        let job = service.retrieval().get_job(job_id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {:?}", job_id, status);
}

async fn wait_for_processed(service: &PacsNetworkService, job_id: Uuid, count: usize) {
    for _ in 0..600 {
        if service.retrieval().get_job(job_id).await.unwrap().progress.processed() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never processed {} items", job_id, count);
}

#[tokio::test]
async fn study_query_returns_normalized_results() {
    let (addr, archive) = start_archive(Archive::default()).await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;

    let query = service
        .queries()
        .execute(QueryLevel::Study, criteria(&[(fields::PATIENT_ID, "12345")]), &conn)
        .await
        .unwrap();

    assert_eq!(query.status, OperationStatus::Completed);
    assert_eq!(query.progress, 100);
    assert_eq!(query.results.len(), 2);
    for result in &query.results {
        assert_eq!(result.get(fields::STUDY_INSTANCE_UID), Some(result.uid.as_str()));
        assert_eq!(result.get(fields::PATIENT_NAME), Some("DOE^JOHN"));
        assert_eq!(result.parent_uid.as_deref(), Some("12345"));
    }

    let headers = archive.query_headers.lock().unwrap()[0].clone();
    assert_eq!(headers[header::ACCEPT], "application/dicom+json");
    assert_eq!(
        archive.query_params.lock().unwrap()[0].get("PatientID").map(String::as_str),
        Some("12345")
    );

    let stats = service.registry().get(&conn).await.unwrap().statistics;
    assert_eq!(stats.total_queries, 1);
    assert!(stats.average_response_time_ms > 0.0);
    assert!(service.optimizer().stats().await.sample_count >= 1);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn empty_match_set_completes_query() {
    let (addr, _archive) = start_archive(Archive::default()).await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;

    let query = service
        .queries()
        .execute(QueryLevel::Study, criteria(&[(fields::PATIENT_ID, "99999")]), &conn)
        .await
        .unwrap();
    assert_eq!(query.status, OperationStatus::Completed);
    assert!(query.results.is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn retrieval_with_missing_instance_completes() {
    let (addr, archive) = start_archive(Archive {
        instance_count: 5,
        missing_instance: Some(3),
        ..Default::default()
    })
    .await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;

    let query = instance_query(&service, &conn).await;
    assert_eq!(query.results.len(), 5);

    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, RequestPriority::Normal)
        .await
        .unwrap();
    let job = wait_for_status(&service, job.id, OperationStatus::Completed).await;

    assert_eq!(job.progress.completed, 4);
    assert_eq!(job.progress.failed, 1);
    assert_eq!(job.progress.percentage, 100.0);
    assert!(job.progress.bytes_transferred > 0);

    let expected: Vec<String> = (1..=5).map(Archive::instance_uid).collect();
    assert_eq!(archive.fetched(), expected);

    let memory = service.memory();
    assert!(memory.contains(CacheName::Image, &Archive::instance_uid(1)).await);
    assert!(!memory.contains(CacheName::Image, &Archive::instance_uid(3)).await);
    assert!(memory.contains(CacheName::Metadata, &Archive::instance_uid(5)).await);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn pause_and_resume_fetch_each_instance_once() {
    let (addr, archive) = start_archive(Archive {
        instance_count: 8,
        delay: Duration::from_millis(30),
        ..Default::default()
    })
    .await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;
    let query = instance_query(&service, &conn).await;

    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, RequestPriority::Normal)
        .await
        .unwrap();
    wait_for_processed(&service, job.id, 2).await;
    assert!(service.retrieval().pause(job.id).await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let paused = service.retrieval().get_job(job.id).await.unwrap();
    assert_eq!(paused.status, OperationStatus::Paused);
    assert_eq!(archive.fetched().len(), paused.next_index);

    assert!(service.retrieval().resume(job.id).await);
    let done = wait_for_status(&service, job.id, OperationStatus::Completed).await;
    assert_eq!(done.progress.completed, 8);

    let expected: Vec<String> = (1..=8).map(Archive::instance_uid).collect();
    assert_eq!(archive.fetched(), expected);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_further_fetches() {
    let (addr, archive) = start_archive(Archive {
        instance_count: 10,
        delay: Duration::from_millis(30),
        ..Default::default()
    })
    .await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;
    let query = instance_query(&service, &conn).await;

    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, RequestPriority::Normal)
        .await
        .unwrap();
    wait_for_processed(&service, job.id, 2).await;
    assert!(service.retrieval().cancel(job.id).await);

    let fetched_at_cancel = archive.fetched().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(archive.fetched().len(), fetched_at_cancel);

    let job = service.retrieval().get_job(job.id).await.unwrap();
    assert_eq!(job.status, OperationStatus::Cancelled);
    assert!(job.progress.processed() <= fetched_at_cancel);
    assert!(job.progress.processed() < 10);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn bearer_token_is_sent_and_rejections_are_recorded() {
    let (addr, _archive) = start_archive(Archive {
        bearer_token: Some("secret-token".to_string()),
        ..Default::default()
    })
    .await;
    let service = start_service().await;

    let good = register(
        &service,
        addr,
        Protocol::DicomWeb,
        Authentication::Bearer {
            token: "secret-token".to_string(),
        },
    )
    .await;
    assert!(service.registry().test_connection(&good).await);
    assert_eq!(
        service.registry().get(&good).await.unwrap().status,
        ConnectionStatus::Connected
    );

    let bad = register(
        &service,
        addr,
        Protocol::DicomWeb,
        Authentication::Bearer {
            token: "expired".to_string(),
        },
    )
    .await;
    let query = service
        .queries()
        .execute(QueryLevel::Study, BTreeMap::new(), &bad)
        .await
        .unwrap();
    assert_eq!(query.status, OperationStatus::Failed);
    assert!(query.error.as_deref().unwrap().contains("401"));

    assert!(!service.registry().test_connection(&bad).await);
    let conn = service.registry().get(&bad).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert_eq!(conn.statistics.error_count, 2);
    assert!(conn.statistics.last_error.is_some());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn wado_uri_retrieval() {
    let (addr, archive) = start_archive(Archive {
        instance_count: 3,
        ..Default::default()
    })
    .await;
    let service = start_service().await;
    let conn = register(&service, addr, Protocol::Wado, Authentication::None).await;
    let query = instance_query(&service, &conn).await;

    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, RequestPriority::High)
        .await
        .unwrap();
    let job = wait_for_status(&service, job.id, OperationStatus::Completed).await;
    assert_eq!(job.progress.completed, 3);
    assert_eq!(archive.fetched().len(), 3);

    let cached = service
        .memory()
        .get(CacheName::Image, &Archive::instance_uid(2))
        .await
        .unwrap();
    assert!(cached.starts_with(b"DICM"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_archive_marks_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let service = start_service().await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;

    assert!(!service.registry().test_connection(&conn).await);
    let conn = service.registry().get(&conn).await.unwrap();
    assert_eq!(conn.status, ConnectionStatus::Error);
    assert_eq!(conn.statistics.error_count, 1);

    service.shutdown().await.unwrap();
}

/// 请求超时 200 ms，可重试错误只重试一次
fn short_timeout_config() -> NetworkConfig {
    NetworkConfig {
        request_timeout_ms: 200,
        retry_attempts: 1,
        ..test_config()
    }
}

#[tokio::test]
async fn slow_instance_times_out_and_job_continues() {
    let (addr, archive) = start_archive(Archive {
        instance_count: 4,
        slow_instance: Some(2),
        stall: Duration::from_secs(2),
        ..Default::default()
    })
    .await;
    let service = start_service_with(short_timeout_config()).await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;
    let query = instance_query(&service, &conn).await;

    let job = service
        .retrieval()
        .start(&query, query.results.clone(), Destination::Local, RequestPriority::Normal)
        .await
        .unwrap();
    let job = wait_for_status(&service, job.id, OperationStatus::Completed).await;

    assert_eq!(job.progress.completed, 3);
    assert_eq!(job.progress.failed, 1);
    assert!(!service
        .memory()
        .contains(CacheName::Image, &Archive::instance_uid(2))
        .await);

    // 超时可重试：首次请求加一次重试
    let slow = Archive::instance_uid(2);
    assert_eq!(archive.fetched().iter().filter(|uid| **uid == slow).count(), 2);

    let conn = service.registry().get(&conn).await.unwrap();
    assert_eq!(conn.statistics.error_count, 1);
    assert!(conn.statistics.last_error.unwrap().contains("超时"));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn slow_query_fails_with_timeout() {
    let (addr, _archive) = start_archive(Archive {
        query_delay: Duration::from_secs(2),
        ..Default::default()
    })
    .await;
    let service = start_service_with(short_timeout_config()).await;
    let conn = register(&service, addr, Protocol::DicomWeb, Authentication::None).await;

    let query = tokio::time::timeout(
        Duration::from_secs(2),
        service
            .queries()
            .execute(QueryLevel::Study, criteria(&[(fields::PATIENT_ID, "12345")]), &conn),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(query.status, OperationStatus::Failed);
    assert!(query.error.as_deref().unwrap().contains("超时"), "{:?}", query.error);
    assert!(query.results.is_empty());
    assert_eq!(service.registry().get(&conn).await.unwrap().statistics.error_count, 1);

    service.shutdown().await.unwrap();
}
