//! Auto-registration protocol tests: the setup-code flow end to end,
//! deduplication order (DHCP moves, agent hostname preservation, cluster
//! merges) and the rejection paths.

mod common;

use std::collections::HashMap;
use std::net::IpAddr;

use axum::http::{StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    TestStateOptions, bare_request, body_json, build_test_state, json_request, login,
    remote_peer, send,
};
use pulse::enroll::cluster::{ClusterInfo, ClusterNode};
use pulse::persist::nodes::{EnrollSource, MonitorFlags, NodeInstance};
use pulse::server::router::create_router;

fn seed_instance(name: &str, host_url: &str) -> NodeInstance {
    NodeInstance {
        name: name.to_string(),
        host_url: host_url.to_string(),
        token_id: "pulse-monitor@pam!pulse".to_string(),
        token_value: "old-secret".to_string(),
        verify_tls: false,
        monitor: MonitorFlags::default(),
        is_cluster: false,
        cluster_name: None,
        cluster_endpoints: Vec::new(),
        fingerprint: None,
        source: EnrollSource::Manual,
        auto_registered: false,
    }
}

/// Issue a setup code through the admin API and return it.
async fn issue_setup_code(app: &axum::Router, node_type: &str, host: &str) -> String {
    let peer = remote_peer();
    let (session, csrf) = login(app, peer).await;

    let mut request = json_request(
        "POST",
        "/api/setup-script-url",
        peer,
        json!({"type": node_type, "host": host}),
    );
    let headers = request.headers_mut();
    headers.insert(
        header::COOKIE,
        format!("pulse_session={session}").parse().unwrap(),
    );
    headers.insert("x-csrf-token", csrf.parse().unwrap());

    let response = send(app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["command"].as_str().unwrap().contains("curl"));
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn setup_code_registers_a_node_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());
    let peer = remote_peer();

    let code = issue_setup_code(&app, "pve", "https://192.0.2.10:8006").await;

    // The issued code fetches the install script
    let response = send(
        &app,
        bare_request(
            "GET",
            &format!("/api/setup-script?type=pve&token={code}&host=192.0.2.10"),
            peer,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let script = String::from_utf8(common::body_bytes(response).await).unwrap();
    assert!(script.starts_with("#!/bin/sh"));
    assert!(script.contains(&code));

    // The node posts its credentials with the code
    let register = json!({
        "type": "pve",
        "host": "https://192.0.2.10:8006",
        "serverName": "pve-a",
        "tokenId": "pulse-monitor@pam!pulse",
        "tokenValue": "s3cret",
        "source": "script",
    });
    let mut request = json_request("POST", "/api/auto-register", peer, register.clone());
    request
        .headers_mut()
        .insert("x-setup-token", code.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["action"], json!("created"));

    let count = state.store.read(|c| c.pve_instances.len()).await;
    assert_eq!(count, 1);

    // Replaying the same code after success is rejected
    let mut request = json_request("POST", "/api/auto-register", peer, register);
    request
        .headers_mut()
        .insert("x-setup-token", code.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let count = state.store.read(|c| c.pve_instances.len()).await;
    assert_eq!(count, 1);
}

#[tokio::test]
async fn type_mismatched_setup_code_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());

    let code = issue_setup_code(&app, "pbs", "https://192.0.2.11:8007").await;

    let mut request = json_request(
        "POST",
        "/api/auto-register",
        remote_peer(),
        json!({
            "type": "pve",
            "host": "https://192.0.2.11:8006",
            "tokenId": "t",
            "tokenValue": "v",
        }),
    );
    request
        .headers_mut()
        .insert("x-setup-token", code.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.store.read(|c| c.pve_instances.len()).await, 0);
}

#[tokio::test]
async fn unknown_credentials_never_mutate_state() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());

    let response = send(
        &app,
        json_request(
            "POST",
            "/api/auto-register",
            remote_peer(),
            json!({
                "type": "pve",
                "host": "https://192.0.2.10:8006",
                "tokenId": "t",
                "tokenValue": "v",
                "authToken": "pulse_0000000000000000000000000000000000000000000000000000000000000000",
            }),
        ),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.store.read(|c| c.pve_instances.len()).await, 0);
}

#[tokio::test]
async fn scoped_api_token_authorizes_enrollment() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());

    let created = state
        .tokens
        .create("reporter", &["host:report".to_string()])
        .await
        .unwrap();

    let mut request = json_request(
        "POST",
        "/api/auto-register",
        remote_peer(),
        json!({
            "type": "pve",
            "host": "192.0.2.40",
            "serverName": "pve-d",
            "tokenId": "pulse-monitor@pam!pulse",
            "tokenValue": "v",
        }),
    );
    request
        .headers_mut()
        .insert("x-api-token", created.plaintext.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Host normalization added scheme and default port
    let host = state
        .store
        .read(|c| c.pve_instances[0].host_url.clone())
        .await;
    assert_eq!(host, "https://192.0.2.40:8006");
}

#[tokio::test]
async fn token_without_required_scope_is_forbidden() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());

    let created = state
        .tokens
        .create("viewer", &["monitoring:read".to_string()])
        .await
        .unwrap();

    let mut request = json_request(
        "POST",
        "/api/auto-register",
        remote_peer(),
        json!({
            "type": "pve",
            "host": "192.0.2.41",
            "tokenId": "t",
            "tokenValue": "v",
        }),
    );
    request
        .headers_mut()
        .insert("x-api-token", created.plaintext.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("missing_scope"));
}

#[tokio::test]
async fn same_name_and_token_id_is_a_dhcp_move() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state.clone());
    let peer = remote_peer();

    let register = |host: &str| {
        json!({
            "type": "pve",
            "host": host,
            "serverName": "pve-a",
            "tokenId": "pulse-monitor@pam!pulse",
            "tokenValue": "s3cret",
        })
    };

    for host in ["https://192.0.2.10:8006", "https://192.0.2.20:8006"] {
        let code = issue_setup_code(&app, "pve", host).await;
        let mut request = json_request("POST", "/api/auto-register", peer, register(host));
        request
            .headers_mut()
            .insert("x-setup-token", code.parse().unwrap());
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // One instance, moved to the new address
    let instances = state.store.read(|c| c.pve_instances.clone()).await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].host_url, "https://192.0.2.20:8006");
    assert_eq!(instances[0].name, "pve-a");
}

#[tokio::test]
async fn agent_report_preserves_configured_hostname() {
    let dir = tempfile::tempdir().unwrap();

    let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
    table.insert(
        "pve-a.lan".to_string(),
        vec!["192.0.2.10".parse().unwrap()],
    );

    let state = build_test_state(
        dir.path(),
        TestStateOptions {
            resolver_table: table,
            ..TestStateOptions::default()
        },
    )
    .await;

    // The admin configured this instance by hostname
    state
        .store
        .update(|config| {
            config
                .pve_instances
                .push(seed_instance("pve-a", "https://pve-a.lan:8006"));
            Ok(())
        })
        .await
        .unwrap();

    let app = create_router(state.clone());
    let created = state
        .tokens
        .create("agent", &["host:report".to_string()])
        .await
        .unwrap();

    // The agent only knows its IP
    let mut request = json_request(
        "POST",
        "/api/auto-register",
        remote_peer(),
        json!({
            "type": "pve",
            "host": "https://192.0.2.10:8006",
            "tokenId": "pulse-monitor@pam!agent",
            "tokenValue": "agent-secret",
            "source": "agent",
        }),
    );
    request
        .headers_mut()
        .insert("x-api-token", created.plaintext.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let instances = state.store.read(|c| c.pve_instances.clone()).await;
    assert_eq!(instances.len(), 1);
    // Hostname preserved, credentials refreshed
    assert_eq!(instances[0].host_url, "https://pve-a.lan:8006");
    assert_eq!(instances[0].token_value, "agent-secret");
    assert_eq!(instances[0].source, EnrollSource::Agent);
}

#[tokio::test]
async fn two_nodes_of_one_cluster_become_one_instance() {
    let dir = tempfile::tempdir().unwrap();

    let cluster = ClusterInfo {
        name: "prod".to_string(),
        nodes: vec![
            ClusterNode {
                name: "pve-a".to_string(),
                ip: Some("192.0.2.10".to_string()),
            },
            ClusterNode {
                name: "pve-b".to_string(),
                ip: Some("192.0.2.20".to_string()),
            },
        ],
    };

    let state = build_test_state(
        dir.path(),
        TestStateOptions {
            cluster: Some(cluster),
            ..TestStateOptions::default()
        },
    )
    .await;
    let app = create_router(state.clone());
    let peer = remote_peer();

    // First node creates the cluster instance
    let code = issue_setup_code(&app, "pve", "https://192.0.2.10:8006").await;
    let mut request = json_request(
        "POST",
        "/api/auto-register",
        peer,
        json!({
            "type": "pve",
            "host": "https://192.0.2.10:8006",
            "serverName": "pve-a",
            "tokenId": "pulse-monitor@pam!pulse",
            "tokenValue": "s3cret",
        }),
    );
    request
        .headers_mut()
        .insert("x-setup-token", code.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["action"], json!("created"));

    // Second node of the same cluster merges instead of duplicating
    let code = issue_setup_code(&app, "pve", "https://192.0.2.20:8006").await;
    let mut request = json_request(
        "POST",
        "/api/auto-register",
        peer,
        json!({
            "type": "pve",
            "host": "https://192.0.2.20:8006",
            "serverName": "pve-b",
            "tokenId": "pulse-monitor@pam!pulse-b",
            "tokenValue": "s3cret-b",
        }),
    );
    request
        .headers_mut()
        .insert("x-setup-token", code.parse().unwrap());
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["merged"], json!(true));
    assert_eq!(body["cluster"], json!("prod"));
    assert_eq!(body["totalEndpoints"], json!(2));

    let instances = state.store.read(|c| c.pve_instances.clone()).await;
    assert_eq!(instances.len(), 1);
    assert!(instances[0].is_cluster);
    assert_eq!(instances[0].cluster_endpoints.len(), 2);
}

#[tokio::test]
async fn expired_or_bogus_script_token_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state);

    let response = send(
        &app,
        bare_request(
            "GET",
            "/api/setup-script?type=pve&token=00000000000000000000000000000000",
            remote_peer(),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn invalid_body_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_test_state(dir.path(), TestStateOptions::default()).await;
    let app = create_router(state);

    let mut request = bare_request("POST", "/api/auto-register", remote_peer());
    *request.body_mut() = axum::body::Body::from("{not json");
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], json!("invalid_json"));
}
