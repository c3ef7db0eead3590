//! End-to-end tests over real sockets: routing, response discipline,
//! scheduler control, and registry fan-out.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use gantry::http::HttpServer;
use gantry::queue::{TaskQueue, register_queue_service};
use gantry::registry::{ServiceRegistry, register_registry_service};
use gantry::schedule::{ScheduleRegistry, register_schedule_service};

async fn spawn(server: &HttpServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = server.clone();
    tokio::spawn(async move {
        server.serve(listener, std::future::pending()).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn parameterized_routing_echoes_path_params() {
    let server = HttpServer::new(false);
    server.register_handler("/users/{id}/posts/{pid}", |ctx| async move {
        let _ = ctx.api_response(
            0,
            "",
            json!({
                "id": ctx.path_param("id").unwrap_or_default(),
                "pid": ctx.path_param("pid").unwrap_or_default(),
            }),
        );
    });
    let addr = spawn(&server).await;

    let body: Value = reqwest::get(format!("http://{addr}/users/42/posts/7"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"code": 0, "message": "", "data": {"id": "42", "pid": "7"}}));
}

#[tokio::test]
async fn second_terminal_write_loses() {
    let server = HttpServer::new(false);
    server.register_handler("/once", |ctx| async move {
        assert!(ctx.ok("text/plain", "a").is_ok());
        assert!(ctx.ok("text/plain", "b").is_err());
    });
    let addr = spawn(&server).await;

    let response = reqwest::get(format!("http://{addr}/once")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "a");
}

#[tokio::test]
async fn schedule_control_endpoints_pause_and_resume() {
    let server = HttpServer::new(false);
    let schedules = ScheduleRegistry::new();
    register_schedule_service(&server, &schedules, "/_service/schedule");
    schedules.schedule("heartbeat", Duration::from_millis(20), None, || async {});
    let addr = spawn(&server).await;
    let client = reqwest::Client::new();

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(schedules.counter("heartbeat").unwrap() >= 2);

    let paused = client
        .post(format!("http://{addr}/_service/schedule/pause"))
        .body(r#"{"name": "heartbeat"}"#)
        .send()
        .await
        .unwrap();
    let envelope: Value = paused.json().await.unwrap();
    assert_eq!(envelope["code"], 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let frozen = schedules.counter("heartbeat").unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(schedules.counter("heartbeat").unwrap(), frozen);

    client
        .post(format!("http://{addr}/_service/schedule/continue"))
        .body(r#"{"name": "heartbeat"}"#)
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(schedules.counter("heartbeat").unwrap() > frozen);

    // the listing endpoint exposes the registered task
    let listing: Value = client
        .get(format!("http://{addr}/_service/schedule"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["data"][0]["name"], "heartbeat");
}

#[tokio::test]
async fn schedule_control_requires_a_name() {
    let server = HttpServer::new(false);
    let schedules = ScheduleRegistry::new();
    register_schedule_service(&server, &schedules, "/_service/schedule");
    let addr = spawn(&server).await;

    let envelope: Value = reqwest::Client::new()
        .post(format!("http://{addr}/_service/schedule/stop"))
        .body("{}")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(envelope["code"], -1);
    assert_eq!(envelope["message"], "no name");
}

#[tokio::test]
async fn queue_service_reports_snapshots_and_starts_runs() {
    let server = HttpServer::new(false);
    let queue = TaskQueue::new();
    register_queue_service(&server, &queue, "/_service/queue");
    queue.add_task("warmup", Duration::from_secs(5), || async { Ok(()) });
    let addr = spawn(&server).await;
    let client = reqwest::Client::new();

    let before: Value = client
        .get(format!("http://{addr}/_service/queue"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["data"]["queueLength"], 1);
    assert_eq!(before["data"]["status"], "new");
    assert_eq!(before["data"]["tasks"][0]["name"], "warmup");

    let started: Value = client
        .post(format!("http://{addr}/_service/queue/start"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(started["code"], 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after: Value = client
        .get(format!("http://{addr}/_service/queue"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["data"]["status"], "done");
    assert_eq!(after["data"]["done"][0], "warmup");
}

#[tokio::test]
async fn registry_fan_out_is_single_hop() {
    // C has no peers; B fans to C; A fans to B. A registration landing on
    // A must reach B but never C.
    let server_c = HttpServer::new(false);
    let registry_c = ServiceRegistry::new(Vec::new(), None);
    register_registry_service(&server_c, &registry_c, true);
    let addr_c = spawn(&server_c).await;

    let server_b = HttpServer::new(false);
    let registry_b = ServiceRegistry::new(vec![format!("http://{addr_c}")], None);
    register_registry_service(&server_b, &registry_b, true);
    let addr_b = spawn(&server_b).await;

    let server_a = HttpServer::new(false);
    let registry_a = ServiceRegistry::new(vec![format!("http://{addr_b}")], None);
    register_registry_service(&server_a, &registry_a, true);
    let addr_a = spawn(&server_a).await;

    let client = reqwest::Client::new();
    let envelope: Value = client
        .post(format!("http://{addr_a}/_service/endpoint/registry"))
        .json(&json!({"name": "svc-a", "properties": {"zone": "eu"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(envelope["code"], 0);

    tokio::time::sleep(Duration::from_millis(300)).await;

    for addr in [addr_a, addr_b] {
        let listing: Value = client
            .get(format!("http://{addr}/_service/endpoints"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let endpoints = listing["data"].as_object().unwrap();
        assert_eq!(endpoints.len(), 1, "expected one endpoint on {addr}");
        assert_eq!(endpoints["svc-a"]["status"], "online");
    }

    // single hop: the forwarded registration carried noSpread=true
    let listing: Value = client
        .get(format!("http://{addr_c}/_service/endpoints"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing["data"].as_object().unwrap().len(), 0);
}

#[tokio::test]
async fn heartbeat_announces_the_process_with_runtime_info() {
    use gantry::registry::{ServiceEndpoint, spawn_heartbeat};
    use tokio_util::sync::CancellationToken;

    let server = HttpServer::new(false);
    let registry = ServiceRegistry::new(Vec::new(), None);
    register_registry_service(&server, &registry, true);
    let addr = spawn(&server).await;

    let endpoint: ServiceEndpoint = serde_json::from_value(json!({"name": "beater"})).unwrap();
    let stop = CancellationToken::new();
    spawn_heartbeat(
        &format!("http://{addr}"),
        endpoint,
        None,
        Duration::from_millis(40),
        stop.clone(),
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stored = registry.get("beater").expect("heartbeat should have registered");
    assert_eq!(stored.status, "online");
    let runtime = stored.runtime_info.expect("heartbeat carries a runtime snapshot");
    assert!(runtime.cpu_count > 0);
    stop.cancel();
}

#[tokio::test]
async fn registry_rejects_a_bad_preshared_key() {
    let server = HttpServer::new(false);
    let registry = ServiceRegistry::new(Vec::new(), Some("hunter2".to_string()));
    register_registry_service(&server, &registry, true);
    let addr = spawn(&server).await;
    let client = reqwest::Client::new();

    let denied: Value = client
        .post(format!("http://{addr}/_service/endpoint/registry"))
        .json(&json!({"name": "svc"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(denied["code"], -1);
    assert!(registry.endpoints().is_empty());

    let accepted: Value = client
        .post(format!("http://{addr}/_service/endpoint/registry"))
        .header("registry-key", "hunter2")
        .json(&json!({"name": "svc"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(accepted["code"], 0);
    assert_eq!(registry.endpoints().len(), 1);
}

#[tokio::test]
async fn malformed_registration_payload_is_an_input_fault() {
    let server = HttpServer::new(false);
    let registry = ServiceRegistry::new(Vec::new(), None);
    register_registry_service(&server, &registry, false);
    let addr = spawn(&server).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/_service/endpoint/registry"))
        .body("not json")
        .send()
        .await
        .unwrap();
    // input faults report through the envelope with HTTP 200
    assert_eq!(response.status().as_u16(), 200);
    let envelope: Value = response.json().await.unwrap();
    assert_eq!(envelope["code"], -1);

    // query endpoint disabled on this server
    let query = reqwest::get(format!("http://{addr}/_service/endpoints")).await.unwrap();
    assert_eq!(query.status().as_u16(), 404);
}
