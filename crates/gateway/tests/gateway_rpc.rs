#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    clawgate_agents::ModelReply,
    clawgate_config::{ClawgateConfig, ConfigStore},
    clawgate_gateway::{
        AgentExecutor, GatewayOptions, GatewayServer, TurnError, TurnInput, exit_codes,
    },
    clawgate_protocol::ResponseFrame,
    clawgate_tools::sandbox::HostBackend,
    futures::{SinkExt, StreamExt},
    serde_json::{Value, json},
    tokio::sync::watch,
    tokio_tungstenite::{connect_async, tungstenite::Message},
};

struct Echo;

#[async_trait]
impl AgentExecutor for Echo {
    async fn execute(&self, input: &TurnInput) -> Result<ModelReply, TurnError> {
        Ok(ModelReply {
            text: format!("echo: {}", input.prompt),
            model: "test/echo".into(),
            profile_id: None,
            usage: None,
        })
    }
}

struct Running {
    stop: tokio_util::sync::CancellationToken,
    bound: watch::Receiver<Option<SocketAddr>>,
    task: tokio::task::JoinHandle<Result<(), clawgate_gateway::GatewayError>>,
    _dir: tempfile::TempDir,
}

fn options() -> GatewayOptions {
    GatewayOptions {
        executor: Some(Arc::new(Echo)),
        sandbox_backend: Some(Arc::new(HostBackend)),
        log_level_hook: None,
    }
}

async fn start(mut cfg: ClawgateConfig) -> Running {
    let dir = tempfile::tempdir().unwrap();
    cfg.gateway.bind = "127.0.0.1".into();
    cfg.gateway.port = free_port();
    cfg.gateway.state_dir = Some(dir.path().to_path_buf());
    cfg.gateway.shutdown_grace_ms = 200;
    let server = GatewayServer::new(Arc::new(ConfigStore::new(cfg, None)), options());
    let stop = server.stop_token();
    let bound = server.bound();
    let task = tokio::spawn(server.run());
    Running {
        stop,
        bound,
        task,
        _dir: dir,
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_bound(bound: &mut watch::Receiver<Option<SocketAddr>>, not: Option<SocketAddr>) -> SocketAddr {
    let addr = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let current = *bound.borrow_and_update();
            if let Some(addr) = current
                && Some(addr) != not
            {
                return addr;
            }
            bound.changed().await.unwrap();
        }
    })
    .await
    .expect("gateway did not bind");
    addr
}

async fn rpc(addr: SocketAddr, token: Option<&str>, method: &str, params: Value) -> ResponseFrame {
    let mut req = reqwest::Client::new()
        .post(format!("http://{addr}/rpc"))
        .json(&json!({ "id": "t", "method": method, "params": params }));
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    req.send().await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn websocket_round_trip_with_events() {
    let mut cfg = ClawgateConfig::default();
    cfg.gateway.auth.token = Some("tok".into());
    let mut gw = start(cfg).await;
    let addr = wait_bound(&mut gw.bound, None).await;

    // Missing token is refused before the upgrade.
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());

    let (mut socket, _) = connect_async(format!("ws://{addr}/ws?token=tok")).await.unwrap();
    let req = json!({
        "type": "req",
        "id": "c1",
        "method": "chat.send",
        "params": { "text": "hello", "agentId": "main" },
    });
    socket.send(Message::Text(req.to_string().into())).await.unwrap();

    let mut saw_turn_started = false;
    let response = loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("no frame")
            .unwrap()
            .unwrap();
        let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        match frame["type"].as_str() {
            Some("event") if frame["event"] == "turn.started" => saw_turn_started = true,
            Some("res") => break frame,
            _ => {},
        }
    };
    assert!(saw_turn_started);
    assert_eq!(response["id"], "c1");
    assert_eq!(response["ok"], true);
    assert_eq!(response["payload"]["results"][0]["reply"], "echo: hello");

    // Garbage frames get an error response, the connection survives.
    socket.send(Message::Text("nope".into())).await.unwrap();
    let msg = socket.next().await.unwrap().unwrap();
    let frame: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
    assert_eq!(frame["ok"], false);
    assert_eq!(frame["error"]["code"], "INVALID_REQUEST");

    let status = rpc(addr, Some("tok"), "status", json!({})).await;
    assert!(status.ok);
    assert_eq!(status.payload.unwrap()["connections"], 1);

    gw.stop.cancel();
    gw.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn second_gateway_on_the_same_port_fails_with_lock_held() {
    let mut first = start(ClawgateConfig::default()).await;
    let addr = wait_bound(&mut first.bound, None).await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ClawgateConfig::default();
    cfg.gateway.bind = "127.0.0.1".into();
    cfg.gateway.port = addr.port();
    cfg.gateway.state_dir = Some(dir.path().to_path_buf());
    let err = GatewayServer::new(Arc::new(ConfigStore::new(cfg, None)), options())
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), exit_codes::LOCK_HELD);

    first.stop.cancel();
    first.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn port_change_restarts_on_the_new_port() {
    let mut gw = start(ClawgateConfig::default()).await;
    let old = wait_bound(&mut gw.bound, None).await;

    let current = rpc(old, None, "config.get", json!({})).await.payload.unwrap();
    let mut next = current["config"].clone();
    let new_port = free_port();
    next["gateway"]["port"] = json!(new_port);
    let applied = rpc(old, None, "config.apply", json!({ "config": next })).await;
    assert!(applied.ok, "{:?}", applied.error);
    assert_eq!(applied.payload.unwrap()["step"], "restart");

    let new = wait_bound(&mut gw.bound, Some(old)).await;
    assert_eq!(new.port(), new_port);
    let health = reqwest::get(format!("http://{new}/health")).await.unwrap();
    assert_eq!(health.status(), 200);

    gw.stop.cancel();
    gw.task.await.unwrap().unwrap();
}
