use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fetchkit_api::{
    ApiClient, ApiClientConfig, ApiErrorKind, ApiResponse, FsAttachmentSink,
    MemoryAttachmentSink, PromiseError, RequestOptions, StatsSource,
};
use serde_json::{json, Map, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ApiClientConfig {
    ApiClientConfig::new(server.uri())
        .task_url(format!("{}/tasks/", server.uri()))
        .task_wait_timeout(Duration::from_millis(10))
}

fn unused_local_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn test_not_found_error_from_error_object() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"error": {"code": 404, "message": "not found"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let err = client
        .get("/items", None, RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), 404);
    assert_eq!(err.code_type(), Some("NOT FOUND"));
    assert_eq!(err.message(), "not found");
    assert_eq!(
        err.details,
        Some(json!({"code": 404, "message": "not found"}))
    );
    let request = err.request.unwrap();
    assert_eq!(request.url, format!("{}/items", server.uri()));
}

#[tokio::test]
async fn test_network_failure_has_code_minus_one() {
    let client = ApiClient::new(ApiClientConfig::new(unused_local_url())).unwrap();
    let err = client
        .get("/items", None, RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), -1);
    assert_eq!(err.code_type(), Some("REQUEST ERROR"));
    assert!(err.is_network());
    assert!(err.request.is_some());
}

#[tokio::test]
async fn test_error_without_error_object_uses_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/items/1"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({"field_errors": {"name": "required"}})),
        )
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let err = client
        .put("/items/1", Some(json!({"name": ""})), RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), 422);
    assert_eq!(err.code_type(), Some("UNPROCESSABLE ENTITY"));
    assert_eq!(err.message(), "Unprocessable Entity");
    assert_eq!(err.details, Some(json!({"fieldErrors": {"name": "required"}})));
}

#[tokio::test]
async fn test_casing_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/counters"))
        .and(body_json(json!({"foo_bar": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"foo_bar": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let response = client
        .post("/counters", Some(json!({"fooBar": 1})), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response, ApiResponse::Json(json!({"fooBar": 2})));
}

#[tokio::test]
async fn test_casing_transform_can_be_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/raw"))
        .and(body_json(json!({"fooBar": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"foo_bar": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server).transform_keys(false)).unwrap();
    let response = client
        .post("/raw", Some(json!({"fooBar": 1})), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response, ApiResponse::Json(json!({"foo_bar": 2})));
}

#[tokio::test]
async fn test_access_token_header() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_name": "taro"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server).access_token("Bearer token-1")).unwrap();
    let response = client
        .get("/me", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.as_json(), Some(&json!({"userName": "taro"})));
}

#[tokio::test]
async fn test_attachment_is_handed_to_sink() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="report.csv""#)
                .set_body_raw("id,name\n1,apple\n", "text/csv"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let sink = Arc::new(MemoryAttachmentSink::new());
    let client = ApiClient::builder(config_for(&server))
        .attachment_sink(sink.clone())
        .build()
        .unwrap();
    let response = client
        .get("/export", None, RequestOptions::default())
        .await
        .unwrap();

    let blob = response.as_blob().unwrap();
    assert_eq!(blob.filename.as_deref(), Some("report.csv"));
    let saved = sink.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, "report.csv");
    assert_eq!(&saved[0].1.data[..], b"id,name\n1,apple\n");
}

#[tokio::test]
async fn test_attachment_written_to_directory() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=data.bin")
                .set_body_raw(vec![1u8, 2, 3], "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = ApiClient::builder(config_for(&server))
        .attachment_sink(Arc::new(FsAttachmentSink::new(dir.path())))
        .build()
        .unwrap();
    client
        .get("/export", None, RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), vec![1u8, 2, 3]);
}

#[tokio::test]
async fn test_task_polling_exhausts_with_code_600() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-1"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-1"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-1"})))
        .expect(3)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server).task_max_retries(3)).unwrap();
    let err = client
        .post("/jobs", None, RequestOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.code(), 600);
    assert_eq!(err.code_type(), Some("TASK TIMEOUT"));
    assert_eq!(
        err.kind,
        ApiErrorKind::TaskTimeout {
            task_id: "t-1".to_string()
        }
    );
    assert_eq!(client.task_retries_left("t-1"), None);
}

fn status_polls(requests: &[wiremock::Request], task_path: &str) -> usize {
    requests
        .iter()
        .filter(|request| request.url.path() == task_path)
        .count()
}

#[tokio::test]
async fn test_canceled_polling_releases_retry_counter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-9"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-9"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-9"})))
        .mount(&server)
        .await;

    let client = ApiClient::new(
        config_for(&server)
            .task_max_retries(3)
            .task_wait_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    // 2 回目の待機中にキャンセルする
    let handle = client.get_singular("/jobs", None, false);
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle.cancel();
    assert!(matches!(handle.await, Err(PromiseError::Canceled)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.task_retries_left("t-9"), None);

    let before = status_polls(&server.received_requests().await.unwrap(), "/tasks/t-9");
    let err = client
        .get("/jobs", None, RequestOptions::default())
        .await
        .unwrap_err();
    let after = status_polls(&server.received_requests().await.unwrap(), "/tasks/t-9");

    // 新しいリクエストは最大回数ぶん問い合わせてから 600 になる
    assert_eq!(err.code(), 600);
    assert_eq!(after - before, 3);
    assert_eq!(client.task_retries_left("t-9"), None);
}

#[tokio::test]
async fn test_task_polling_completes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"taskId": "t-2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-2"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-2"})))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result_value": 5})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let response = client
        .post("/jobs", None, RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response.as_json(), Some(&json!({"resultValue": 5})));
    assert_eq!(client.task_retries_left("t-2"), None);
}

#[tokio::test]
async fn test_accepted_body_overrides_call_options() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/jobs"))
        .respond_with(
            ResponseTemplate::new(202)
                .set_body_json(json!({"task_id": "t-3", "max_retries": 1, "wait_timeout": 5})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/tasks/t-3"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"task_id": "t-3"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let err = client
        .post(
            "/jobs",
            None,
            RequestOptions::default().task_max_retries(5),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), 600);
}

#[tokio::test]
async fn test_every_observer_sees_every_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_json(json!({"error": {"code": 500, "message": "boom"}})),
        )
        .mount(&server)
        .await;

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(AtomicU32::new(0));
    let first_sink = first.clone();
    let second_sink = second.clone();
    let client = ApiClient::builder(config_for(&server))
        .on_error(move |err| first_sink.lock().unwrap().push(err.code()))
        .on_error(move |_| {
            second_sink.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    for _ in 0..2 {
        let _ = client.get("/boom", None, RequestOptions::default()).await;
    }

    assert_eq!(*first.lock().unwrap(), vec![500, 500]);
    assert_eq!(second.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_get_cached_reuses_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/countries"))
        .and(query_param("lang", "ja"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["jp", "us"])))
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let payload = json!({"lang": "ja"});
    let first = client
        .get_cached("/countries", Some(payload.clone()), None)
        .await
        .unwrap();
    let second = client
        .get_cached("/countries", Some(payload), None)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first.as_json(), Some(&json!(["jp", "us"])));
}

#[tokio::test]
async fn test_get_cached_does_not_store_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    assert!(client.get_cached("/flaky", None, None).await.is_err());
    assert!(client.get_cached("/flaky", None, None).await.is_err());
}

#[tokio::test]
async fn test_get_singular_shares_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"value": 1}))
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| client.get_singular("/slow", None, false))
        .collect();
    let results = futures::future::join_all(handles).await;

    for result in results {
        assert_eq!(result.unwrap(), ApiResponse::Json(json!({"value": 1})));
    }
}

#[tokio::test]
async fn test_get_singular_cancel_others() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"page": "a"}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"page": "b"})))
        .mount(&server)
        .await;

    let client = ApiClient::new(config_for(&server)).unwrap();
    let a = client.get_singular("/a", None, false);
    let b = client.get_singular("/b", None, true);

    assert!(matches!(a.await, Err(PromiseError::Canceled)));
    assert_eq!(b.await.unwrap(), ApiResponse::Json(json!({"page": "b"})));
}

#[tokio::test]
async fn test_async_stats_from_url() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stats"))
        .and(query_param("ids", "1,2"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"1": {"view_count": 3}})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stats"))
        .and(query_param("ids", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let config = config_for(&server)
        .stats_max_retries(3)
        .stats_wait_timeout(Duration::from_millis(5));
    let client = ApiClient::new(config).unwrap();
    let mut received: Vec<(String, Result<Value, i32>)> = Vec::new();
    client
        .fetch_async_stats(
            vec!["1".to_string(), "2".to_string()],
            &StatsSource::url("/stats"),
            |id, stats| received.push((id.to_string(), stats.map_err(|e| e.code()))),
            false,
        )
        .await
        .unwrap();

    assert_eq!(
        received,
        vec![
            ("1".to_string(), Ok(json!({"viewCount": 3}))),
            ("2".to_string(), Err(600)),
        ]
    );
}

#[tokio::test]
async fn test_async_stats_for_skips_known_ids() {
    let client = ApiClient::new(
        ApiClientConfig::new("http://127.0.0.1:9").task_wait_timeout(Duration::from_millis(5)),
    )
    .unwrap();
    let asked = Arc::new(Mutex::new(Vec::new()));
    let asked_log = asked.clone();
    let source = StatsSource::custom(move |ids: Vec<String>| {
        asked_log.lock().unwrap().push(ids.clone());
        async move {
            let stats: Map<String, Value> = ids
                .into_iter()
                .map(|id| (id, json!({"ready": true})))
                .collect();
            Ok::<_, fetchkit_api::ApiError>(Value::Object(stats))
        }
    });
    let mut known = Map::new();
    known.insert("a".to_string(), json!({"ready": true}));

    let mut received = Vec::new();
    client
        .fetch_async_stats_for(
            vec!["a".to_string(), "b".to_string()],
            &known,
            &source,
            |id, stats| received.push((id.to_string(), stats.is_ok())),
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        received,
        vec![("a".to_string(), true), ("b".to_string(), true)]
    );
    assert_eq!(*asked.lock().unwrap(), vec![vec!["b".to_string()]]);
}

#[tokio::test]
async fn test_client_from_prefixed_vars() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let vars = vec![
        ("FETCHKIT_BASE_URL".to_string(), server.uri()),
        ("FETCHKIT_TASK_MAX_RETRIES".to_string(), "2".to_string()),
    ];
    let config = ApiClientConfig::from_prefixed_vars("FETCHKIT_", vars).unwrap();
    let client = ApiClient::new(config).unwrap();
    let response = client
        .get("ping", None, RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response.as_json(), Some(&json!({"ok": true})));
    assert_eq!(client.config().task_max_retries, 2);
}
