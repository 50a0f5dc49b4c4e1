//! Integration tests for the claim protocol against a fake Host API,
//! covering the properties that matter most for worker-pool safety: a
//! worker wins when it's the only staker, and loses cleanly (leaving its
//! own stake comment deleted) when an earlier comment already exists.

use chrono::Utc;
use claimd::claim::ClaimProtocol;
use claimd::config::{Config, PrivateKeySource};
use claimd::host_api::HostApiClient;
use claimd::identity::TokenCache;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_key_path() -> String {
    format!("{}/tests/fixtures/test_app_key.pem", env!("CARGO_MANIFEST_DIR"))
}

fn test_config() -> Config {
    Config {
        repo: "acme/widgets".to_string(),
        base_branch: "main".to_string(),
        trigger_label: "agent-ready".to_string(),
        poll_interval: std::time::Duration::from_secs(60),
        max_open_change_sets: 3,
        auto_fix_conflicts: true,
        auto_fix_go_mod: true,
        auto_fix_precommit: true,
        app_id: 1,
        app_installation_id: 2,
        private_key: PrivateKeySource::Path(test_key_path()),
        worker_id: Some("worker-a".to_string()),
        branch_prefix: "claude/".to_string(),
        workspace_dir: "./workspace".to_string(),
        subprocess_binary: "claude".to_string(),
        mcp_server_name: "github".to_string(),
    }
}

async fn mount_token_exchange(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/app/installations/2/access_tokens"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "token": "ghs_fake",
            "expires_at": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        })))
        .mount(server)
        .await;
}

async fn make_client(server: &MockServer) -> HostApiClient {
    let config = test_config();
    let http = reqwest::Client::new();
    let tokens = TokenCache::with_base_url(&config, http.clone(), server.uri())
        .expect("token cache builds from a valid test key");
    HostApiClient::with_base_url(
        http,
        "acme".to_string(),
        "widgets".to_string(),
        tokens,
        server.uri(),
    )
}

#[tokio::test]
async fn claim_work_item_wins_when_sole_staker() {
    let server = MockServer::start().await;
    mount_token_exchange(&server).await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": 42,
            "title": "bug",
            "body": "steps",
            "labels": [],
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 5001,
            "body": "CLAIM:worker-a:1",
            "created_at": Utc::now().to_rfc3339(),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "id": 5001,
            "body": "CLAIM:worker-a:1",
            "created_at": Utc::now().to_rfc3339(),
        }])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/comments/5001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 5001,
            "body": "CLAIM:worker-a:1",
            "created_at": Utc::now().to_rfc3339(),
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/issues/42/labels"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/repos/acme/widgets/issues/comments/5001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 5001,
            "body": "claimed",
            "created_at": Utc::now().to_rfc3339(),
        })))
        .mount(&server)
        .await;

    let mut client = make_client(&server).await;
    let protocol = ClaimProtocol::new("worker-a".to_string());

    let result = protocol.claim_work_item(&mut client, 42).await;
    assert!(result.is_ok(), "sole staker should win the claim: {result:?}");
}

#[tokio::test]
async fn claim_work_item_loses_to_earlier_comment_and_deletes_own_stake() {
    let server = MockServer::start().await;
    mount_token_exchange(&server).await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": 77,
            "title": "bug",
            "body": "steps",
            "labels": [],
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/issues/77/comments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 9002,
            "body": "CLAIM:worker-a:2",
            "created_at": Utc::now().to_rfc3339(),
        })))
        .mount(&server)
        .await;

    let earlier = Utc::now() - chrono::Duration::seconds(1);
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/77/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 9001, "body": "CLAIM:worker-b:1", "created_at": earlier.to_rfc3339() },
            { "id": 9002, "body": "CLAIM:worker-a:2", "created_at": Utc::now().to_rfc3339() },
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/comments/9001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 9001,
            "body": "CLAIM:worker-b:1",
            "created_at": earlier.to_rfc3339(),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/comments/9002"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 9002,
            "body": "CLAIM:worker-a:2",
            "created_at": Utc::now().to_rfc3339(),
        })))
        .mount(&server)
        .await;

    Mock::given(method("DELETE"))
        .and(path("/repos/acme/widgets/issues/comments/9002"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut client = make_client(&server).await;
    let protocol = ClaimProtocol::new("worker-a".to_string());

    let result = protocol.claim_work_item(&mut client, 77).await;
    assert!(
        matches!(result, Err(claimd::error::ClaimError::LostRace)),
        "later staker should lose the race: {result:?}"
    );
}
