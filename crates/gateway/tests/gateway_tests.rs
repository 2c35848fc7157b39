//! Integration tests for the HTTP dispatch surface

use alloy_primitives::{address, Bytes, U256};
use palisade_gateway::error::GatewayError;
use palisade_gateway::tx::{DecodedTransaction, TxDecoder};
use palisade_gateway::{GatewayServerBuilder, RulesConfig};
use reqwest::Client;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Canned decoder so the admission pipeline can be driven without
/// crafting signed payloads
struct StubDecoder(DecodedTransaction);

impl TxDecoder for StubDecoder {
    fn decode(&self, _raw: &str) -> Result<DecodedTransaction, GatewayError> {
        Ok(self.0.clone())
    }
}

fn transfer_tx() -> DecodedTransaction {
    DecodedTransaction {
        from: address!("00000000000000000000000000000000000000aa"),
        to: Some(address!("00000000000000000000000000000000000000bb")),
        value: U256::from(1_000u64),
        input: Bytes::new(),
    }
}

fn deploy_tx() -> DecodedTransaction {
    DecodedTransaction {
        from: address!("00000000000000000000000000000000000000aa"),
        to: None,
        value: U256::ZERO,
        input: Bytes::from(vec![0x60, 0x80, 0x60, 0x40]),
    }
}

/// Mocks a healthy upstream node: gas estimation succeeds, raw
/// transactions are accepted, block number is 0x10.
async fn healthy_upstream() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "eth_estimateGas"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": "0x5208"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "eth_sendRawTransaction"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "result": "0x88df016429689c079f3b2f6ad39fa052532c56795b733da78a91ebe6a713944b"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "eth_chainId"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": "0x1"
        })))
        .mount(&server)
        .await;

    server
}

fn admission_rules(limit: u64) -> RulesConfig {
    serde_json::from_value(json!({
        "txAllowRules": [
            {
                "fromList": ["*"],
                "toList": ["*"],
                "rateLimit": {"name": "w", "interval": 60, "limit": limit}
            }
        ],
        "deployAllowList": ["0x00000000000000000000000000000000000000aa"]
    }))
    .unwrap()
}

/// Builds the gateway over the mock upstream and serves it on a random port
async fn start_gateway(upstream: &MockServer, rules: RulesConfig, tx: DecodedTransaction) -> SocketAddr {
    let server = GatewayServerBuilder::new(upstream.uri())
        .rules(rules)
        .fixed_workers(1)
        .tx_decoder(Arc::new(StubDecoder(tx)))
        .build()
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    tokio::spawn(async move {
        server.serve(addr).await.unwrap();
    });
    sleep(Duration::from_millis(200)).await;

    addr
}

async fn post(addr: SocketAddr, body: Value) -> Value {
    Client::new()
        .post(format!("http://{addr}"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_service_methods_answered_locally() {
    let upstream = healthy_upstream().await;
    let addr = start_gateway(&upstream, admission_rules(10), transfer_tx()).await;

    let body = post(addr, json!({"jsonrpc": "2.0", "id": 1, "method": "pal_ping"})).await;
    assert_eq!(body["result"], "pong");

    let body = post(addr, json!({"jsonrpc": "2.0", "id": 2, "method": "pal_info"})).await;
    assert_eq!(body["result"]["service"], "palisade-gateway");

    let body = post(addr, json!({"jsonrpc": "2.0", "id": 3, "method": "pal_sessions"})).await;
    assert_eq!(body["result"]["active_sessions"], 0);
}

#[tokio::test]
async fn test_disallowed_method_rejected() {
    let upstream = healthy_upstream().await;
    let addr = start_gateway(&upstream, admission_rules(10), transfer_tx()).await;

    let body =
        post(addr, json!({"jsonrpc": "2.0", "id": 4, "method": "admin_stopNode"})).await;
    assert_eq!(body["id"], 4);
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn test_passthrough_preserves_request_id() {
    let upstream = healthy_upstream().await;
    let addr = start_gateway(&upstream, admission_rules(10), transfer_tx()).await;

    let body =
        post(addr, json!({"jsonrpc": "2.0", "id": 99, "method": "eth_chainId", "params": []}))
            .await;
    assert_eq!(body["id"], 99);
    assert_eq!(body["result"], "0x1");
}

#[tokio::test]
async fn test_send_raw_transaction_admitted_then_rate_limited() {
    let upstream = healthy_upstream().await;
    let addr = start_gateway(&upstream, admission_rules(1), transfer_tx()).await;

    let request = json!({
        "jsonrpc": "2.0", "id": 1,
        "method": "eth_sendRawTransaction", "params": ["0xf8ac"]
    });

    // First transaction: full budget, admitted and forwarded.
    let body = post(addr, request.clone()).await;
    assert!(body["error"].is_null(), "unexpected error: {body}");
    assert!(body["result"].as_str().unwrap().starts_with("0x"));

    // Second transaction in the same interval: the stock slice is spent
    // and the refill finds the shared budget exhausted.
    let body = post(addr, request).await;
    assert_eq!(body["error"]["code"], -32602);
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("rate limit"), "unexpected message: {message}");
    assert!(message.contains("60"), "wait interval missing: {message}");
}

#[tokio::test]
async fn test_unmatched_transaction_rejected() {
    let upstream = healthy_upstream().await;
    let rules: RulesConfig = serde_json::from_value(json!({
        "txAllowRules": [
            {"fromList": ["*"], "toList": ["0x00000000000000000000000000000000000000cc"]}
        ]
    }))
    .unwrap();
    let addr = start_gateway(&upstream, rules, transfer_tx()).await;

    let body = post(
        addr,
        json!({
            "jsonrpc": "2.0", "id": 6,
            "method": "eth_sendRawTransaction", "params": ["0xf8ac"]
        }),
    )
    .await;

    assert_eq!(body["id"], 6);
    assert_eq!(body["error"]["code"], -32602);
    assert_eq!(body["error"]["message"], "transaction is not allowed");
}

#[tokio::test]
async fn test_deploy_allow_list_gates_deploys() {
    let upstream = healthy_upstream().await;

    // Sender on the deploy list: forwarded.
    let addr = start_gateway(&upstream, admission_rules(10), deploy_tx()).await;
    let request = json!({
        "jsonrpc": "2.0", "id": 7,
        "method": "eth_sendRawTransaction", "params": ["0xf8ac"]
    });
    let body = post(addr, request.clone()).await;
    assert!(body["error"].is_null(), "unexpected error: {body}");

    // Empty deploy list: rejected before any upstream traffic.
    let rules: RulesConfig =
        serde_json::from_value(json!({"txAllowRules": [{"fromList": ["*"], "toList": ["*"]}]}))
            .unwrap();
    let addr = start_gateway(&upstream, rules, deploy_tx()).await;
    let body = post(addr, request).await;
    assert_eq!(body["error"]["code"], -32602);
    assert_eq!(body["error"]["message"], "deploy is not allowed");
}

#[tokio::test]
async fn test_gas_simulation_failure_propagates_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "eth_estimateGas"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": {"code": -32000, "message": "execution reverted: balance too low"}
        })))
        .mount(&server)
        .await;

    let addr = start_gateway(&server, admission_rules(10), transfer_tx()).await;

    let body = post(
        addr,
        json!({
            "jsonrpc": "2.0", "id": 8,
            "method": "eth_sendRawTransaction", "params": ["0xf8ac"]
        }),
    )
    .await;

    assert_eq!(body["error"]["code"], -32602);
    assert!(body["error"]["message"].as_str().unwrap().contains("execution reverted"));
}

#[tokio::test]
async fn test_block_number_served_from_shared_cache() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({"method": "eth_blockNumber"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0", "id": 1, "result": "0x10"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let addr = start_gateway(&server, admission_rules(10), transfer_tx()).await;

    for id in [1, 2, 3] {
        let body = post(
            addr,
            json!({"jsonrpc": "2.0", "id": id, "method": "eth_blockNumber", "params": []}),
        )
        .await;
        assert_eq!(body["id"], id);
        assert_eq!(body["result"], "0x10");
    }
    // The mock's expect(1) verifies only the first request reached upstream.
}

#[tokio::test]
async fn test_batch_preserves_order() {
    let upstream = healthy_upstream().await;
    let addr = start_gateway(&upstream, admission_rules(10), transfer_tx()).await;

    let body = post(
        addr,
        json!([
            {"jsonrpc": "2.0", "id": 1, "method": "eth_chainId", "params": []},
            {"jsonrpc": "2.0", "id": 2, "method": "admin_stopNode"},
        ]),
    )
    .await;

    let responses = body.as_array().unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"], "0x1");
    assert_eq!(responses[1]["id"], 2);
    assert_eq!(responses[1]["error"]["code"], -32601);
}
