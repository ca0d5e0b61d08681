//! Provider clients against mocked Hetzner APIs.

use fleet::providers::hetzner::Hetzner;
use fleet::providers::hetzner_cloud::HetznerCloud;
use fleet::{Provider, ProviderError, ProviderKind};
use serde_json::json;
use wiremock::matchers::{
    basic_auth, bearer_token, body_json, body_string_contains, method, path, query_param,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn robot_server(number: i64, name: &str, ip: &str, cancelled: bool) -> serde_json::Value {
    json!({
        "server": {
            "server_number": number,
            "server_name": name,
            "server_ip": ip,
            "server_ipv6_net": "2a01:4f8:10a:1::",
            "product": "AX52",
            "dc": "FSN1-DC14",
            "status": "ready",
            "cancelled": cancelled
        }
    })
}

fn robot(server: &MockServer) -> Hetzner {
    Hetzner::new("#ws+user", "secret")
        .unwrap()
        .with_base_url(server.uri())
}

#[tokio::test]
async fn test_robot_lists_servers_with_vswitch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/server"))
        .and(basic_auth("#ws+user", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            robot_server(321, "node-a", "203.0.113.1", false),
            robot_server(322, "node-b", "203.0.113.2", false),
            robot_server(323, "gone", "203.0.113.3", true),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vswitch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 4711, "name": "private", "vlan": 4000, "cancelled": false}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vswitch/4711"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 4711,
            "server": [{"server_number": 322, "status": "ready"}]
        })))
        .mount(&server)
        .await;

    let servers = robot(&server).list_servers().await.unwrap();

    assert_eq!(servers.len(), 2);
    assert_eq!(servers[0].provider_id, "321");
    assert_eq!(servers[0].ipv4.as_deref(), Some("203.0.113.1"));
    assert_eq!(servers[0].network_segment, None);
    assert_eq!(servers[1].network_segment.as_deref(), Some("4711"));
    assert_eq!(servers[1].product, "AX52");
}

#[tokio::test]
async fn test_robot_not_found_means_no_servers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/server"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"status": 404, "code": "SERVER_NOT_FOUND", "message": "No server found"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vswitch"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(robot(&server).list_servers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_robot_rescue_activates_then_resets() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/boot/321/rescue"))
        .and(body_string_contains("os=linux"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rescue": {"server_number": 321, "active": true, "password": "hunter2"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reset/321"))
        .and(body_string_contains("type=hw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reset": {"server_number": 321, "type": "hw"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    robot(&server).rescue("321").await.unwrap();
}

#[tokio::test]
async fn test_robot_rescue_installs_authorized_keys() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/boot/321/rescue"))
        .and(body_string_contains("os=linux"))
        .and(body_string_contains("authorized_key%5B%5D=d7%3A2b%3A8c"))
        .and(body_string_contains("authorized_key%5B%5D=0e%3A91%3A44"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "rescue": {"server_number": 321, "active": true, "password": null}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/reset/321"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reset": {"server_number": 321, "type": "hw"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    robot(&server)
        .with_authorized_keys(vec!["d7:2b:8c".into(), "0e:91:44".into()])
        .rescue("321")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_robot_api_error_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/server"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let err = robot(&server).list_servers().await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 401, .. }));
}

fn cloud_server(id: i64, name: &str, ip: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "status": "running",
        "server_type": {"name": "cx22"},
        "datacenter": {"name": "nbg1-dc3"},
        "public_net": {"ipv4": {"ip": ip}, "ipv6": {"ip": "2a01:4f8:c012::/64"}},
        "private_net": [{"network": 9001, "ip": "10.0.0.2"}]
    })
}

#[tokio::test]
async fn test_cloud_follows_pagination() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/servers"))
        .and(query_param("page", "1"))
        .and(query_param("per_page", "50"))
        .and(bearer_token("token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": [cloud_server(1, "web-1", "198.51.100.1")],
            "meta": {"pagination": {"page": 1, "next_page": 2}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/servers"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "servers": [cloud_server(2, "web-2", "198.51.100.2")],
            "meta": {"pagination": {"page": 2, "next_page": null}}
        })))
        .mount(&server)
        .await;

    let cloud = HetznerCloud::new("token").unwrap().with_base_url(server.uri());
    assert_eq!(cloud.kind(), ProviderKind::HetznerCloud);
    let servers = cloud.list_servers().await.unwrap();

    let ids: Vec<_> = servers.iter().map(|s| s.provider_id.as_str()).collect();
    assert_eq!(ids, ["1", "2"]);
    assert_eq!(servers[1].product, "cx22");
    assert_eq!(servers[1].network_segment.as_deref(), Some("9001"));
}

#[tokio::test]
async fn test_cloud_rescue_enables_then_resets() {
    let server = MockServer::start().await;
    let action =
        |command: &str| json!({"action": {"id": 13, "command": command, "status": "running"}});
    Mock::given(method("POST"))
        .and(path("/v1/servers/42/actions/enable_rescue"))
        .and(body_json(json!({"type": "linux64", "ssh_keys": [1401, 1402]})))
        .respond_with(ResponseTemplate::new(201).set_body_json(action("enable_rescue")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/servers/42/actions/reset"))
        .respond_with(ResponseTemplate::new(201).set_body_json(action("reset_server")))
        .expect(1)
        .mount(&server)
        .await;

    HetznerCloud::new("token")
        .unwrap()
        .with_base_url(server.uri())
        .with_rescue_ssh_keys(vec![1401, 1402])
        .rescue("42")
        .await
        .unwrap();
}
