//! Wire-level tests driving the router directly (no bound port).

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use crawlspace_api::{router, AppState};
use crawlspace_core::{Principal, PrincipalId, StaticKeyAuthenticator};
use crawlspace_engine::{Engine, EngineConfig, MockRuntime};

const USER_KEY: &str = "cp_user_key_1";
const OTHER_KEY: &str = "cp_user_key_2";
const SERVICE_KEY: &str = "cp_service_key";

struct Harness {
    router: axum::Router,
}

impl Harness {
    fn new() -> Self {
        let engine = Engine::in_memory(Arc::new(MockRuntime::succeeding()), EngineConfig::default());
        let authenticator = StaticKeyAuthenticator::new()
            .with_key(USER_KEY, Principal::user(PrincipalId::generate()))
            .with_key(OTHER_KEY, Principal::user(PrincipalId::generate()))
            .with_key(SERVICE_KEY, Principal::service(PrincipalId::generate()));
        let state = AppState::new(engine, Arc::new(authenticator));
        Self {
            router: router(state),
        }
    }

    async fn call(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value, axum::http::HeaderMap) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value, headers)
    }

    async fn create_actor(&self, name: &str) -> Value {
        let (status, body, _) = self
            .call(
                "POST",
                "/v2/acts",
                Some(USER_KEY),
                Some(json!({
                    "name": name,
                    "defaultRunOptions": {
                        "image": "mock-image",
                        "memoryMbytes": 256,
                        "timeoutSecs": 300
                    }
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"].clone()
    }
}

#[tokio::test]
async fn unknown_token_is_unauthenticated() {
    let harness = Harness::new();
    let (status, body, _) = harness
        .call("GET", "/v2/actor-runs", Some("cp_bogus"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn actor_crud_roundtrip() {
    let harness = Harness::new();
    let actor = harness.create_actor("my-crawler").await;
    let actor_id = actor["id"].as_str().unwrap();

    let (status, body, _) = harness
        .call("GET", &format!("/v2/acts/{actor_id}"), Some(USER_KEY), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], "my-crawler");

    // Another principal cannot see it.
    let (status, _, _) = harness
        .call("GET", &format!("/v2/acts/{actor_id}"), Some(OTHER_KEY), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = harness
        .call(
            "DELETE",
            &format!("/v2/acts/{actor_id}"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn duplicate_actor_name_conflicts() {
    let harness = Harness::new();
    harness.create_actor("dup").await;
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/acts",
            Some(USER_KEY),
            Some(json!({"name": "dup"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "CONFLICT");
}

#[tokio::test]
async fn create_run_returns_full_shape_with_handles() {
    let harness = Harness::new();
    let actor = harness.create_actor("runner").await;
    let actor_id = actor["id"].as_str().unwrap();

    let (status, body, _) = harness
        .call(
            "POST",
            &format!("/v2/acts/{actor_id}/runs"),
            Some(USER_KEY),
            Some(json!({"input": {"startUrl": "https://a"}, "timeout": 60, "memory": 512})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let run = &body["data"];
    assert_eq!(run["status"], "READY");
    assert_eq!(run["actorId"], actor["id"]);
    assert_eq!(run["timeoutSecs"], 60);
    assert_eq!(run["memoryMbytes"], 512);
    for handle in [
        "defaultDatasetId",
        "defaultKeyValueStoreId",
        "defaultRequestQueueId",
    ] {
        assert!(run[handle].is_string(), "missing {handle}");
    }

    // Input landed in the run's key-value store.
    let store_id = run["defaultKeyValueStoreId"].as_str().unwrap();
    let (status, body, _) = harness
        .call(
            "GET",
            &format!("/v2/key-value-stores/{store_id}/records/INPUT"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["startUrl"], "https://a");
}

#[tokio::test]
async fn run_for_missing_actor_is_not_found() {
    let harness = Harness::new();
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/acts/AAAAAAAAAAAAAAAAAAAAA/runs",
            Some(USER_KEY),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NOT_FOUND");
}

#[tokio::test]
async fn trusted_update_requires_service_or_run_token() {
    let harness = Harness::new();
    let actor = harness.create_actor("guarded").await;
    let actor_id = actor["id"].as_str().unwrap();
    let (_, body, _) = harness
        .call(
            "POST",
            &format!("/v2/acts/{actor_id}/runs"),
            Some(USER_KEY),
            Some(json!({})),
        )
        .await;
    let run_id = body["data"]["id"].as_str().unwrap().to_string();

    // A plain user token may read but not drive.
    let (status, body, _) = harness
        .call(
            "PUT",
            &format!("/v2/actor-runs/{run_id}"),
            Some(USER_KEY),
            Some(json!({"status": "RUNNING"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["type"], "UNAUTHORIZED");

    // The service principal drives the full state machine.
    let (status, _, _) = harness
        .call(
            "PUT",
            &format!("/v2/actor-runs/{run_id}"),
            Some(SERVICE_KEY),
            Some(json!({"status": "RUNNING"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // Invalid transition is a 409.
    let (status, body, _) = harness
        .call(
            "PUT",
            &format!("/v2/actor-runs/{run_id}"),
            Some(SERVICE_KEY),
            Some(json!({"status": "RUNNING"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "INVALID_TRANSITION");

    // Abort the running run, then resurrect it.
    let (status, body, _) = harness
        .call(
            "POST",
            &format!("/v2/actor-runs/{run_id}/abort"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ABORTED");
    assert!(body["data"]["finishedAt"].is_string());

    let (status, body, _) = harness
        .call(
            "POST",
            &format!("/v2/actor-runs/{run_id}/resurrect"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "RUNNING");
    assert!(body["data"].get("finishedAt").is_none());

    // Aborting twice is an invalid state once terminal again.
    let (status, _, _) = harness
        .call(
            "POST",
            &format!("/v2/actor-runs/{run_id}/abort"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body, _) = harness
        .call(
            "POST",
            &format!("/v2/actor-runs/{run_id}/abort"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "INVALID_STATE");
}

#[tokio::test]
async fn dataset_push_and_list_with_pagination_headers() {
    let harness = Harness::new();

    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/datasets/results/items",
            Some(USER_KEY),
            Some(json!([{"n": 0}, {"n": 1}, {"n": 2}])),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["itemCount"], 3);

    // Single-object push appends one more.
    let (status, _, _) = harness
        .call(
            "POST",
            "/v2/datasets/results/items",
            Some(USER_KEY),
            Some(json!({"n": 3})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body, headers) = harness
        .call(
            "GET",
            "/v2/datasets/results/items?offset=1&limit=2",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-apify-pagination-total"], "4");
    assert_eq!(headers["x-apify-pagination-offset"], "1");
    assert_eq!(headers["x-apify-pagination-limit"], "2");
    assert_eq!(body["data"], json!([{"n": 1}, {"n": 2}]));

    // Offset past the end: empty page, correct total.
    let (status, body, headers) = harness
        .call(
            "GET",
            "/v2/datasets/results/items?offset=10&limit=5",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-apify-pagination-total"], "4");
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn kv_records_roundtrip_and_listing() {
    let harness = Harness::new();

    let (status, _, _) = harness
        .call(
            "PUT",
            "/v2/key-value-stores/default/records/OUTPUT",
            Some(USER_KEY),
            Some(json!({"ok": true})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body, headers) = harness
        .call(
            "GET",
            "/v2/key-value-stores/default/records/OUTPUT",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert_eq!(body["ok"], true);

    // Missing key on an existing store: 204, not 404.
    let (status, _, _) = harness
        .call(
            "GET",
            "/v2/key-value-stores/default/records/missing",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Missing store: 404.
    let (status, _, _) = harness
        .call(
            "GET",
            "/v2/key-value-stores/no-such-store/records/x",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body, _) = harness
        .call(
            "GET",
            "/v2/key-value-stores/default/keys?limit=10",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"][0]["key"], "OUTPUT");
    assert_eq!(body["data"]["isTruncated"], false);

    let (status, _, _) = harness
        .call(
            "DELETE",
            "/v2/key-value-stores/default/records/OUTPUT",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn request_queue_flow_over_the_wire() {
    let harness = Harness::new();

    // Create by name on first use.
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/request-queues/crawl/requests",
            Some(USER_KEY),
            Some(json!({"url": "https://a"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["wasAlreadyPresent"], false);
    let first_id = body["data"]["requestId"].as_str().unwrap().to_string();

    // Idempotent re-add.
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/request-queues/crawl/requests",
            Some(USER_KEY),
            Some(json!({"url": "https://a"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["wasAlreadyPresent"], true);
    assert_eq!(body["data"]["requestId"], first_id);

    // Forefront insertion goes first.
    let (_, _, _) = harness
        .call(
            "POST",
            "/v2/request-queues/crawl/requests?forefront=true",
            Some(USER_KEY),
            Some(json!({"url": "https://front"})),
        )
        .await;

    let (status, body, _) = harness
        .call(
            "GET",
            "/v2/request-queues/crawl/head?limit=10",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["items"][0]["url"], "https://front");
    assert_eq!(body["data"]["items"][1]["url"], "https://a");

    // Lock the head for w1.
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/request-queues/crawl/head/lock?lockSecs=60&limit=1&clientKey=w1",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let locked = body["data"]["items"][0].clone();
    let locked_id = locked["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["queueHasLockedRequests"], true);
    assert!(body["data"]["lockExpiresAt"].is_string());

    // A different client cannot complete the locked request.
    let (status, body, _) = harness
        .call(
            "PUT",
            &format!("/v2/request-queues/crawl/requests/{locked_id}?clientKey=w2"),
            Some(USER_KEY),
            Some(json!({"handledAt": "2025-01-01T00:00:00Z"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "LOCKED_BY_OTHER");

    // Wrong client cannot prolong either.
    let (status, body, _) = harness
        .call(
            "PUT",
            &format!(
                "/v2/request-queues/crawl/requests/{locked_id}/lock?lockSecs=60&clientKey=w2"
            ),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], "NOT_LOCK_OWNER");

    // The holder prolongs, then completes.
    let (status, body, _) = harness
        .call(
            "PUT",
            &format!(
                "/v2/request-queues/crawl/requests/{locked_id}/lock?lockSecs=120&clientKey=w1"
            ),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["lockExpiresAt"].is_string());

    let (status, body, _) = harness
        .call(
            "PUT",
            &format!("/v2/request-queues/crawl/requests/{locked_id}?clientKey=w1"),
            Some(USER_KEY),
            Some(json!({"handledAt": "2025-01-01T00:00:00Z"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["handledAt"].is_string());

    // Counters reflect the completion and the sticky multi-client flag.
    let (status, body, _) = harness
        .call("GET", "/v2/request-queues/crawl", Some(USER_KEY), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["totalRequestCount"], 2);
    assert_eq!(body["data"]["handledRequestCount"], 1);
    assert_eq!(body["data"]["pendingRequestCount"], 1);

    // Batch insert with dedup.
    let (status, body, _) = harness
        .call(
            "POST",
            "/v2/request-queues/crawl/requests/batch",
            Some(USER_KEY),
            Some(json!([
                {"url": "https://a"},
                {"url": "https://b"}
            ])),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    // "https://a" is still pending, so it dedups without being handled.
    assert_eq!(body["data"]["processed"][0]["wasAlreadyPresent"], true);
    assert_eq!(body["data"]["processed"][0]["wasAlreadyHandled"], false);
    assert_eq!(body["data"]["processed"][1]["wasAlreadyPresent"], false);

    let (_, body, _) = harness
        .call("GET", "/v2/request-queues/crawl", Some(USER_KEY), None)
        .await;
    assert_eq!(body["data"]["totalRequestCount"], 3);
    assert_eq!(body["data"]["pendingRequestCount"], 2);
    // Only w1 ever held a lock; lock-ownership checks alone do not count.
    assert_eq!(body["data"]["hadMultipleClients"], false);
}

#[tokio::test]
async fn lock_release_returns_request_to_head() {
    let harness = Harness::new();
    harness
        .call(
            "POST",
            "/v2/request-queues/q/requests",
            Some(USER_KEY),
            Some(json!({"url": "https://a"})),
        )
        .await;

    let (_, body, _) = harness
        .call(
            "POST",
            "/v2/request-queues/q/head/lock?lockSecs=60&limit=1&clientKey=w1",
            Some(USER_KEY),
            None,
        )
        .await;
    let locked_id = body["data"]["items"][0]["id"].as_str().unwrap().to_string();

    // Locked requests are invisible to a plain head peek.
    let (_, body, _) = harness
        .call("GET", "/v2/request-queues/q/head", Some(USER_KEY), None)
        .await;
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 0);

    let (status, _, _) = harness
        .call(
            "DELETE",
            &format!("/v2/request-queues/q/requests/{locked_id}/lock?clientKey=w1"),
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body, _) = harness
        .call("GET", "/v2/request-queues/q/head", Some(USER_KEY), None)
        .await;
    assert_eq!(body["data"]["items"][0]["id"], locked_id.as_str());
}

#[tokio::test]
async fn fetching_logs_of_missing_run_is_not_found() {
    let harness = Harness::new();
    let (status, body, _) = harness
        .call(
            "GET",
            "/v2/actor-runs/AAAAAAAAAAAAAAAAAAAAA/logs",
            Some(USER_KEY),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NOT_FOUND");
}
