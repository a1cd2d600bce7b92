//! Two-phase orchestration with the NIXL v2 connector.

mod support;

use axum::http::StatusCode;
use pd_sidecar::config::ProxyConfig;
use serde_json::{json, Value};
use support::{free_port, MockWorker, Proto, Role, TestSidecar};
use uuid::Uuid;

fn config(port: u16, decoder_port: u16) -> ProxyConfig {
    ProxyConfig {
        port,
        decoder_port,
        secure_proxy: false,
        ..ProxyConfig::default()
    }
}

fn chat_body() -> Value {
    json!({
        "model": "Qwen/Qwen2-0.5B",
        "messages": [{"role": "user", "content": "Hello"}],
        "max_tokens": 50
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_split() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let reply: Value = resp.json().await.unwrap();
    assert_eq!(reply["id"], "cmpl-decode");

    // Prefill leg: one request, pinned limits, outbound kv params.
    assert_eq!(prefiller.request_count(), 1);
    let prefill = &prefiller.requests()[0];
    assert_eq!(prefill.body["max_tokens"], json!(1));
    assert_eq!(prefill.body["max_completion_tokens"], json!(1));
    assert_eq!(prefill.body["stream"], json!(false));
    assert!(!prefill.body.contains_key("stream_options"));
    assert!(!prefill.body.contains_key("do_remote_decode"));

    let kv = prefill.body["kv_transfer_params"].as_object().unwrap();
    assert_eq!(kv["do_remote_decode"], json!(true));
    assert_eq!(kv["do_remote_prefill"], json!(false));
    assert_eq!(kv["remote_engine_id"], Value::Null);
    assert_eq!(kv["remote_block_ids"], Value::Null);
    assert_eq!(kv["remote_host"], Value::Null);
    assert_eq!(kv["remote_port"], Value::Null);

    // Decode leg: original limits, peer-echoed kv params.
    assert_eq!(decoder.request_count(), 1);
    let decode = &decoder.requests()[0];
    assert_eq!(decode.body["max_tokens"], json!(50));
    let kv = decode.body["kv_transfer_params"].as_object().unwrap();
    assert_eq!(kv["remote_engine_id"], json!("engine-1"));
    assert_eq!(kv["remote_block_ids"], json!([1, 2, 3]));
    assert_eq!(kv["remote_host"], json!("10.0.0.9"));
    assert_eq!(kv["remote_port"], json!(5600));

    // Same well-formed correlation id on both legs.
    let prefill_id = prefill.request_id.clone().unwrap();
    let decode_id = decode.request_id.clone().unwrap();
    assert_eq!(prefill_id, decode_id);
    Uuid::parse_str(&prefill_id).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_field_restoration() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let body = json!({
        "model": "Qwen/Qwen2-0.5B",
        "messages": [{"role": "user", "content": "Hello"}],
        "max_tokens": 50,
        "max_completion_tokens": 100,
        "stream": true,
        "stream_options": {"include_usage": true}
    });
    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let prefill = &prefiller.requests()[0];
    assert_eq!(prefill.body["max_tokens"], json!(1));
    assert_eq!(prefill.body["max_completion_tokens"], json!(1));
    assert_eq!(prefill.body["stream"], json!(false));
    assert!(!prefill.body.contains_key("stream_options"));

    let decode = &decoder.requests()[0];
    assert_eq!(decode.body["max_tokens"], json!(50));
    assert_eq!(decode.body["max_completion_tokens"], json!(100));
    assert_eq!(decode.body["stream"], json!(true));
    assert_eq!(decode.body["stream_options"], json!({"include_usage": true}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_omitted_fields_stay_absent() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let prefill = &prefiller.requests()[0];
    assert_eq!(prefill.body["max_completion_tokens"], json!(1));

    let decode = &decoder.requests()[0];
    assert!(!decode.body.contains_key("max_completion_tokens"));
    assert!(!decode.body.contains_key("stream"));
    assert!(!decode.body.contains_key("stream_options"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_fields_survive_the_rewrite() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let body = json!({
        "model": "m",
        "messages": [],
        "max_tokens": 50,
        "top_k": 40,
        "custom_extension": {"nested": [1, 2]}
    });
    reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .json(&body)
        .send()
        .await
        .unwrap();

    for recorded in [&prefiller.requests()[0], &decoder.requests()[0]] {
        assert_eq!(recorded.body["top_k"], json!(40));
        assert_eq!(recorded.body["custom_extension"], json!({"nested": [1, 2]}));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_legacy_url_header_with_scheme() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/completions"))
        .header("x-prefiller-url", prefiller.url())
        .json(&chat_body())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(prefiller.request_count(), 1);
    assert_eq!(decoder.request_count(), 1);
    assert_eq!(prefiller.requests()[0].path, "/v1/completions");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prefill_failure_mirrors_status_and_skips_decode() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn_failing(StatusCode::SERVICE_UNAVAILABLE).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .json(&chat_body())
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    assert_eq!(prefiller.request_count(), 1);
    assert_eq!(decoder.request_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_body_gets_error_envelope() {
    let decoder = MockWorker::spawn(Role::Decode, Proto::NixlV2).await;
    let prefiller = MockWorker::spawn(Role::Prefill, Proto::NixlV2).await;
    let sidecar = TestSidecar::start(config(free_port(), decoder.addr.port())).await;

    let resp = reqwest::Client::new()
        .post(sidecar.url("/v1/chat/completions"))
        .header("x-prefiller-host-port", prefiller.host_port())
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let envelope: Value = resp.json().await.unwrap();
    assert_eq!(envelope["object"], "error");
    assert_eq!(envelope["type"], "BadRequestError");
    assert_eq!(envelope["code"], 400);

    assert_eq!(prefiller.request_count(), 0);
    assert_eq!(decoder.request_count(), 0);
}
