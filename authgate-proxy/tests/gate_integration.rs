//! End-to-end behaviour of the gate through `ProxyService`.
//!
//! Upstreams are wiremock servers; the policy service is either the
//! recording double or, where the wire matters, a wiremock IAM.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use authgate_core::audit::MemoryAuditSink;
use authgate_core::policy::{IamPolicyClient, PolicyOutcome, RecordingPolicyClient};
use helpers::*;
use hyper::StatusCode;
use bytes::Bytes;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ACL routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_acl_route_without_credential_is_401() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    let response = proxy.send(get("/exhibitor/foo/bar", None)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "acsjwt");
    assert_eq!(proxy.policy.call_count(), 0);

    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("result=deny"));
    assert!(lines[0].contains("reason=\"not authenticated\""));
}

#[tokio::test]
async fn test_acl_route_queries_policy_once_with_route_resource() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .and(path("/foo/bar"))
        .respond_with(ResponseTemplate::new(200).set_body_string("exhibitor ok"))
        .expect(1)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    let response = proxy.send(get("/exhibitor/foo/bar", Some("bozydar"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "exhibitor ok");

    let calls = proxy.policy.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].uid, "bozydar");
    assert_eq!(calls[0].resource_id, "dcos:adminrouter:ops:exhibitor");
    assert_eq!(calls[0].timeout, Duration::from_secs(1));
}

#[tokio::test]
async fn test_policy_deny_forwards_nothing() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    let response = proxy.send(get("/exhibitor/foo", Some("bozydar"))).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_string(response).await;
    assert!(!body.contains("Bouncer"));

    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("result=deny"));
    assert!(lines[0].contains("reason=\"Bouncer PQ response\""));
}

#[tokio::test]
async fn test_policy_failure_is_fail_closed() {
    for outcome in [PolicyOutcome::Timeout, PolicyOutcome::Unreachable] {
        let proxy = TestProxy::start(RecordingPolicyClient::new(outcome)).await;
        let response = proxy.send(get("/exhibitor/foo", Some("bozydar"))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{outcome:?}");
        assert_eq!(proxy.policy.call_count(), 1, "no retries on {outcome:?}");
    }
}

#[tokio::test]
async fn test_service_resource_is_rendered_from_path() {
    let proxy = TestProxy::start(
        RecordingPolicyClient::deny_all().with_rule(
            "bozydar",
            "dcos:adminrouter:service:marathon",
            PolicyOutcome::Allow,
        ),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/service/marathon/v2/apps"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.ui)
        .await;

    let allowed = proxy
        .send(get("/service/marathon/v2/apps", Some("bozydar")))
        .await;
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = proxy
        .send(get("/service/metronome/v1/jobs", Some("bozydar")))
        .await;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let rids: Vec<String> = proxy
        .policy
        .calls()
        .into_iter()
        .map(|c| c.resource_id)
        .collect();
    assert_eq!(
        rids,
        [
            "dcos:adminrouter:service:marathon",
            "dcos:adminrouter:service:metronome"
        ]
    );
}

#[tokio::test]
async fn test_repeated_requests_are_decided_independently() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    for _ in 0..2 {
        let response = proxy.send(get("/exhibitor/foo", Some("bozydar"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert_eq!(proxy.policy.call_count(), 2);
    assert_eq!(proxy.audit.audit_lines().len(), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Forwarded request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_legacy_upstream_receives_basic_credential() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .and(path("/exhibitor/v1/cluster/status"))
        .and(header("authorization", EXHIBITOR_BASIC))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    let response = proxy
        .send(get("/exhibitor/exhibitor/v1/cluster/status", Some("bozydar")))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "[]");
}

#[tokio::test]
async fn test_forwarded_request_is_sanitized() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .and(path("/secrets/v1/x"))
        .and(query_param("version", "2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy
        .send(get("/secrets/v1/x?version=2", Some("bozydar")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = proxy
        .upstreams
        .iam
        .received_requests()
        .await
        .expect("request recording enabled");
    assert_eq!(received.len(), 1);
    let headers = &received[0].headers;
    assert!(headers.get("authorization").is_none());
    assert!(headers.get("x-custom").is_none());
    assert_eq!(
        headers.get("accept").map(|v| v.to_str().unwrap_or_default()),
        Some("application/json")
    );
}

#[tokio::test]
async fn test_method_body_and_query_reach_upstream() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    let payload = Bytes::from_static(b"{\"value\":\"c2VjcmV0\"}\n\x00\xff");
    Mock::given(method("POST"))
        .and(path("/secrets/v1/secret/default/db"))
        .and(query_param("version", "3"))
        .and(body_bytes(payload.to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy
        .send(request(
            "POST",
            "/secrets/v1/secret/default/db?version=3",
            Some("bozydar"),
            payload.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let received = proxy
        .upstreams
        .iam
        .received_requests()
        .await
        .expect("request recording enabled");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].method.as_str(), "POST");
    assert_eq!(received[0].url.query(), Some("version=3"));
    assert_eq!(received[0].body, payload.to_vec());
}

#[tokio::test]
async fn test_forwarded_path_is_canonical() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .and(path("/secrets/v1/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy
        .send(get("/secrets/v1//a/./b/%2e%2e/../x", Some("bozydar")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_upstream_status_and_body_propagate() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(418)
                .insert_header("content-type", "text/plain")
                .set_body_string("short and stout"),
        )
        .mount(&proxy.upstreams.ca)
        .await;

    let response = proxy
        .send(get("/ca/api/v2/certificates", Some("bozydar")))
        .await;

    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(body_string(response).await, "short and stout");
}

#[tokio::test]
async fn test_unreachable_upstream_is_502() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    let response = proxy.send(get("/offline/index.html", None)).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Open and unmatched paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_open_route_skips_auth_and_audit() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    Mock::given(method("GET"))
        .and(path("/static/app.js"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.ui)
        .await;

    let response = proxy.send(get("/static/app.js", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(proxy.audit.lines().is_empty());
    assert_eq!(proxy.policy.call_count(), 0);
}

#[tokio::test]
async fn test_dot_segments_cannot_skip_the_acl() {
    for raw in [
        "/secrets/v1/../../acs/api/v1/users/root/permissions",
        "/secrets/v1/%2e%2e/%2e%2e/acs/api/v1/users/root/permissions",
    ] {
        let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&proxy.upstreams.iam)
            .await;

        let response = proxy.send(get(raw, Some("bozydar"))).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{raw}");
        let calls = proxy.policy.calls();
        assert_eq!(calls.len(), 1, "{raw}");
        assert_eq!(calls[0].resource_id, "dcos:adminrouter:acs");
        let lines = proxy.audit.audit_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("object=dcos:adminrouter:acs"), "{}", lines[0]);
    }
}

#[tokio::test]
async fn test_path_above_root_is_400() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.upstreams.ui)
        .await;

    for raw in ["/static/../../etc/passwd", "/static/a%2f..%2f..%2fetc"] {
        let response = proxy.send(get(raw, Some("bozydar"))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{raw}");
    }
    assert!(proxy.audit.lines().is_empty());
}

#[tokio::test]
async fn test_unmatched_path_is_404_without_audit() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    let response = proxy.send(get("/nowhere", Some("bozydar"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(proxy.audit.lines().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cluster scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_scenario_exhibitor_gets_basic_auth() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;
    Mock::given(method("GET"))
        .and(path("/exhibitor/v1/ui/index.html"))
        .and(header("authorization", EXHIBITOR_BASIC))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.exhibitor)
        .await;

    let response = proxy
        .send(get("/exhibitor/exhibitor/v1/ui/index.html", Some("bozydar")))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let lines = proxy.audit.lines();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "UID from valid JWT: `bozydar`");
    assert!(lines[1].contains("object=dcos:adminrouter:ops:exhibitor"));
    assert!(lines[1].contains("result=allow"));
    assert!(lines[1].contains("reason=\"Bouncer PQ response\""));
    assert!(lines[1].contains("srcip=10.0.0.7"));
    assert!(lines[1].contains("request_uri=/exhibitor/exhibitor/v1/ui/index.html"));
}

#[tokio::test]
async fn test_scenario_secrets_authenticated_only() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    Mock::given(method("GET"))
        .and(path("/secrets/v1/x"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy.send(get("/secrets/v1/x", Some("bozydar"))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(proxy.policy.call_count(), 0);
    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("object=dcos:adminrouter:secrets"));
    assert!(lines[0].contains("result=allow"));
    assert!(lines[0].contains("reason=\"authenticated (all users are allowed to access)\""));
}

#[tokio::test]
async fn test_scenario_own_permissions_under_deny_all() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    Mock::given(method("GET"))
        .and(path("/acs/api/v1/users/bozydar/permissions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy
        .send(get("/acs/api/v1/users/bozydar/permissions", Some("bozydar")))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(proxy.policy.call_count(), 0);
    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("object=dcos:iam:users:bozydar:permissions"));
    assert!(lines[0].contains("reason=\"user requests his/her own permissions\""));
}

#[tokio::test]
async fn test_scenario_other_users_permissions_under_deny_all() {
    let proxy = TestProxy::start(RecordingPolicyClient::deny_all()).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&proxy.upstreams.iam)
        .await;

    let response = proxy
        .send(get("/acs/api/v1/users/alice/permissions", Some("bozydar")))
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let calls = proxy.policy.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].uid, "bozydar");
    assert_eq!(calls[0].resource_id, "dcos:adminrouter:acs");

    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("object=dcos:adminrouter:acs"));
    assert!(lines[0].contains("result=deny"));
}

#[tokio::test]
async fn test_scenario_ca_newcert_without_credential() {
    let proxy = TestProxy::start(RecordingPolicyClient::allow_all()).await;

    let response = proxy.send(get("/ca/api/v2/newcert", None)).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers()["www-authenticate"], "acsjwt");
    let lines = proxy.audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("object=dcos:adminrouter:ops:ca:rw"));
    assert!(lines[0].contains("reason=\"not authenticated\""));
    assert!(lines[0].contains("request_uri=/ca/api/v2/newcert"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire-level policy queries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn test_decision_completes_after_client_goes_away() {
    let upstreams = Upstreams::start().await;
    let iam_service = wiremock::MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/acs/api/v1/internal/policyquery"))
        .and(query_param("rid", "dcos:adminrouter:ops:exhibitor"))
        .and(query_param("uid", "bozydar"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"allowed": true}))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&iam_service)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstreams.exhibitor)
        .await;

    let config = cluster_config(&upstreams, &iam_service.uri());
    let policy = Arc::new(IamPolicyClient::new(&config.iam).expect("client builds"));
    let audit = Arc::new(MemoryAuditSink::new());
    let service = build_service(&config, policy, audit.clone());

    // Dropping the handler future models hyper abandoning a disconnected
    // client's request.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        service.handle_request(get("/exhibitor/foo", Some("bozydar"))),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(audit.audit_lines().is_empty());

    tokio::time::sleep(Duration::from_millis(800)).await;

    let lines = audit.audit_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("result=allow"));

    let queries = iam_service
        .received_requests()
        .await
        .expect("request recording enabled");
    assert_eq!(queries.len(), 1);
    assert!(queries[0].headers.get("authorization").is_none());
    assert!(queries[0].headers.get("x-custom").is_none());
}
