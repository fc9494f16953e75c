//! Probe protocol end to end: engine callbacks in, Socket.IO frames out

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use robot_sim::probe::packet::{Handshake, Packet};
use robot_sim::probe::{Callback, ProtocolState, StepProtocol};
use robot_sim::{SimConfig, StepMode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn config(addr: std::net::SocketAddr) -> SimConfig {
    let mut config = SimConfig::default();
    config.reporting.ws_url = format!("http://{}", addr);
    config.reporting.reconnect_attempts = 2;
    config.reporting.reconnect_delay_ms = 20;
    config
}

fn callbacks(steps: usize) -> Vec<Callback> {
    let mut out = vec![
        json!({"callback": "suite_start", "name": "", "source": "/ws/robot_P1.json"}),
        json!({"callback": "test_start", "name": "Main", "tags": ["smoke"]}),
    ];
    for i in 0..steps {
        out.push(json!({"callback": "keyword_start", "name": format!("Step {i}"), "libname": "BuiltIn", "args": [i]}));
        out.push(json!({"callback": "log_message", "level": "INFO", "message": format!("log {i}")}));
        out.push(json!({"callback": "keyword_end", "name": format!("Step {i}"), "status": "PASS", "args": [i]}));
    }
    out.push(json!({"callback": "test_end", "name": "Main", "status": "PASS", "message": ""}));
    out.push(json!({"callback": "suite_end", "name": "", "source": "/ws/robot_P1.json", "status": "PASS"}));
    out.into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect()
}

/// Socket.IO observer that optionally answers every STEP_END with continueStep
///
/// Returns the received events as `{"event", "data"}` objects.
async fn observer(listener: TcpListener, answer_steps: bool) -> Vec<Value> {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

    let open = Packet::Open(Handshake {
        sid: "observer".into(),
        upgrades: vec![],
        ping_interval: 25000,
        ping_timeout: 20000,
    });
    ws.send(Message::Text(open.encode())).await.unwrap();
    let connect = ws.next().await.unwrap().unwrap();
    assert_eq!(Packet::decode(connect.to_text().unwrap()).unwrap(), Packet::Connect);
    ws.send(Message::Text(r#"40{"sid":"ns"}"#.into())).await.unwrap();

    let mut frames = Vec::new();
    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Packet::Event { name, data } = Packet::decode(&text).unwrap() else {
            continue;
        };
        let is_step_end = data["type"] == "STEP_END";
        frames.push(json!({ "event": name, "data": data }));
        if answer_steps && is_step_end {
            let reply = Packet::event("continueStep", json!({"processId": "P1"}));
            ws.send(Message::Text(reply.encode())).await.unwrap();
        }
    }
    frames
}

fn robot_events(frames: &[Value]) -> Vec<&Value> {
    frames
        .iter()
        .filter(|f| f["event"] == "robotEvent")
        .map(|f| &f["data"])
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn step_mode_run_is_driven_by_observer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config(listener.local_addr().unwrap());
    let server = tokio::spawn(observer(listener, true));

    let state = tokio::task::spawn_blocking(move || {
        let mut protocol = StepProtocol::connect(&config, "P1", StepMode::Step);
        assert_eq!(protocol.state(), ProtocolState::Streaming);
        for callback in callbacks(3) {
            protocol.handle(callback);
        }
        protocol.state()
    });
    let state = tokio::time::timeout(Duration::from_secs(10), state)
        .await
        .expect("run stalled")
        .unwrap();
    assert_eq!(state, ProtocolState::Terminated);

    let frames = server.await.unwrap();
    assert_eq!(frames[0]["event"], "joinProcess");
    assert_eq!(frames[0]["data"]["processId"], "P1");

    let events = robot_events(&frames);
    let seqs: Vec<u64> = events.iter().map(|e| e["seq"].as_u64().unwrap()).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());

    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(types.first(), Some(&"RUN_START"));
    assert_eq!(types.last(), Some(&"RUN_END"));
    assert_eq!(types.iter().filter(|t| **t == "STEP_END").count(), 3);

    assert_eq!(events[0]["suite"]["name"], "robot_P1");
    assert_eq!(events[1]["test"]["tags"], json!(["smoke"]));
    let first_end = events.iter().find(|e| e["type"] == "STEP_END").unwrap();
    assert_eq!(first_end["data"]["message"], "log 0");
    assert_eq!(first_end["data"]["logs"], json!([{"level": "INFO", "message": "log 0"}]));
    assert!(first_end["data"]["durationMs"].as_u64().is_some());
    assert!(events.iter().all(|e| e["ts"].as_str().unwrap().ends_with('Z')));
}

#[tokio::test(flavor = "multi_thread")]
async fn all_mode_needs_no_signals() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = config(listener.local_addr().unwrap());
    let server = tokio::spawn(observer(listener, false));

    let run = tokio::task::spawn_blocking(move || {
        let mut protocol = StepProtocol::connect(&config, "P1", StepMode::All);
        for callback in callbacks(10) {
            protocol.handle(callback);
        }
    });
    tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("all mode blocked")
        .unwrap();

    let frames = server.await.unwrap();
    let events = robot_events(&frames);
    // RUN_START, TEST_START, 10 x (START, LOG, END), TEST_END, RUN_END
    assert_eq!(events.len(), 34);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_observer_still_runs_locally() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let config = config(addr);

    let state = tokio::task::spawn_blocking(move || {
        let mut protocol = StepProtocol::connect(&config, "P1", StepMode::All);
        assert_eq!(protocol.state(), ProtocolState::Degraded);
        for callback in callbacks(2) {
            protocol.handle(callback);
        }
        protocol.state()
    })
    .await
    .unwrap();
    assert_eq!(state, ProtocolState::Terminated);
}
