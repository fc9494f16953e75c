//! Reporting channel
//!
//! Socket.IO client link to the observer (Engine.IO v4 over a WebSocket).
//! Runs on its own thread with a current-thread runtime so the engine's
//! callback thread never touches async code: outbound frames go through an
//! unbounded queue, the only inbound event acted on is `continueStep`,
//! which signals the step gate. Server pings are answered on the same
//! thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::event::Event;
use super::gate::StepGate;
use super::packet::{Packet, EIO_VERSION};
use crate::config::SimConfig;
use crate::error::{Result, SimError};

pub const JOIN_EVENT: &str = "joinProcess";
pub const ROBOT_EVENT: &str = "robotEvent";
pub const CONTINUE_EVENT: &str = "continueStep";

/// Upper bound for the Engine.IO open + namespace connect exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Destination for probe events
pub trait Reporter: Send {
    /// Queue an event for delivery; never blocks on the network
    fn report(&mut self, event: &Event);

    /// Close the link, waiting at most `grace` for queued frames
    fn disconnect(&mut self, grace: Duration);

    fn is_connected(&self) -> bool;
}

/// Local-only reporter (no observer)
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineReporter;

impl Reporter for OfflineReporter {
    fn report(&mut self, _event: &Event) {}

    fn disconnect(&mut self, _grace: Duration) {}

    fn is_connected(&self) -> bool {
        false
    }
}

/// Connection settings for one probe
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub base_url: String,
    pub socket_path: String,
    pub process_id: String,
    pub attempts: u32,
    pub delay: Duration,
}

impl ChannelConfig {
    pub fn from_config(config: &SimConfig, process_id: impl Into<String>) -> Self {
        Self {
            base_url: config.reporting.ws_url.clone(),
            socket_path: config.reporting.socket_path.clone(),
            process_id: process_id.into(),
            attempts: config.reporting.reconnect_attempts,
            delay: config.reconnect_delay(),
        }
    }
}

/// `http(s)://host` + `/path` → `ws(s)://host/path/?EIO=4&transport=websocket`
pub fn endpoint_url(base_url: &str, socket_path: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(|e| SimError::Connection {
        reason: format!("invalid reporting URL '{}': {}", base_url, e),
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SimError::Connection {
                reason: format!("unsupported reporting URL scheme '{}'", other),
            })
        }
    };
    url.set_scheme(scheme).map_err(|_| SimError::Connection {
        reason: format!("cannot use scheme '{}' for '{}'", scheme, base_url),
    })?;

    let socket_path = socket_path.trim_matches('/');
    let path = if socket_path.is_empty() {
        format!("{}/", url.path().trim_end_matches('/'))
    } else {
        format!("{}/{}/", url.path().trim_end_matches('/'), socket_path)
    };
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("EIO", EIO_VERSION)
        .append_pair("transport", "websocket");
    Ok(url)
}

fn connection_error(reason: impl std::fmt::Display) -> SimError {
    SimError::Connection {
        reason: reason.to_string(),
    }
}

enum Outbound {
    Frame(String),
    Close,
}

enum SessionEnd {
    Closed,
    Lost,
}

/// Live Socket.IO reporter
pub struct ReportingChannel {
    process_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    done: std_mpsc::Receiver<()>,
    connected: Arc<AtomicBool>,
    closed: bool,
}

impl ReportingChannel {
    /// Connect, blocking until the first attempt cycle settles
    ///
    /// An unreachable observer is not an error: the channel comes back
    /// degraded (`is_connected() == false`) and drops frames.
    pub fn connect(config: ChannelConfig, gate: Arc<StepGate>) -> Result<Self> {
        let url = endpoint_url(&config.base_url, &config.socket_path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = std_mpsc::channel();
        let connected = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            url: url.to_string(),
            process_id: config.process_id.clone(),
            attempts: config.attempts.max(1),
            delay: config.delay,
            gate,
            connected: Arc::clone(&connected),
        };
        thread::Builder::new()
            .name("probe-channel".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(error = %e, "Failed to start reporting runtime");
                        let _ = ready_tx.send(false);
                        return;
                    }
                };
                runtime.block_on(worker.run(rx, ready_tx));
                let _ = done_tx.send(());
            })?;

        // A worker that died before answering counts as not connected
        let _ = ready_rx.recv();

        Ok(Self {
            process_id: config.process_id,
            tx,
            done: done_rx,
            connected,
            closed: false,
        })
    }
}

impl Reporter for ReportingChannel {
    fn report(&mut self, event: &Event) {
        if self.closed {
            return;
        }
        match serde_json::to_value(event) {
            Ok(data) => {
                let frame = Packet::event(ROBOT_EVENT, data).encode();
                let _ = self.tx.send(Outbound::Frame(frame));
            }
            Err(e) => warn!(seq = event.seq, error = %e, "Failed to encode event"),
        }
    }

    fn disconnect(&mut self, grace: Duration) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.tx.send(Outbound::Close).is_err() {
            return;
        }
        if self.done.recv_timeout(grace).is_err() {
            debug!(process_id = %self.process_id, "Reporting channel did not flush within grace");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for ReportingChannel {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

struct Worker {
    url: String,
    process_id: String,
    attempts: u32,
    delay: Duration,
    gate: Arc<StepGate>,
    connected: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Outbound>, ready: std_mpsc::Sender<bool>) {
        let mut ready = Some(ready);
        loop {
            let ws = match self.connect_with_retry().await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(error = %e, "Reporting channel degraded, events stay local");
                    self.connected.store(false, Ordering::SeqCst);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(false);
                    }
                    drain(&mut rx).await;
                    return;
                }
            };
            self.connected.store(true, Ordering::SeqCst);
            if let Some(ready) = ready.take() {
                let _ = ready.send(true);
            }

            match self.session(ws, &mut rx).await {
                SessionEnd::Closed => return,
                SessionEnd::Lost => {
                    self.connected.store(false, Ordering::SeqCst);
                    warn!(url = %self.url, "Reporting connection lost, reconnecting");
                }
            }
        }
    }

    async fn connect_with_retry(&self) -> Result<WsStream> {
        let mut last_error = String::new();
        for attempt in 1..=self.attempts {
            match self.connect_once().await {
                Ok(ws) => {
                    info!(url = %self.url, attempt, "Reporting channel connected");
                    return Ok(ws);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "Connect attempt failed");
                    last_error = match e {
                        SimError::Connection { reason } => reason,
                        other => other.to_string(),
                    };
                    if attempt < self.attempts {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
        Err(SimError::Connection {
            reason: format!(
                "{} after {} attempt(s) to {}",
                last_error, self.attempts, self.url
            ),
        })
    }

    /// WebSocket connect plus the Engine.IO open and namespace connect
    async fn connect_once(&self) -> Result<WsStream> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(connection_error)?;
        tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut ws))
            .await
            .map_err(|_| connection_error("Socket.IO handshake timed out"))??;
        Ok(ws)
    }

    async fn session(&self, ws: WsStream, rx: &mut mpsc::UnboundedReceiver<Outbound>) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let join = Packet::event(JOIN_EVENT, json!({ "processId": self.process_id })).encode();
        if let Err(e) = sink.send(Message::Text(join)).await {
            warn!(error = %e, "Failed to join process room");
            return SessionEnd::Lost;
        }
        debug!(process_id = %self.process_id, "Joined process room");

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(Outbound::Frame(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(error = %e, "Failed to send event frame");
                            return SessionEnd::Lost;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = sink.send(Message::Text(Packet::Disconnect.encode())).await;
                        let _ = sink.send(Message::Close(None)).await;
                        return SessionEnd::Closed;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match Packet::decode(&text) {
                        Ok(Packet::Ping) => {
                            if let Err(e) = sink.send(Message::Text(Packet::Pong.encode())).await {
                                warn!(error = %e, "Failed to answer ping");
                                return SessionEnd::Lost;
                            }
                        }
                        Ok(Packet::Event { name, data }) => self.on_event(&name, &data),
                        Ok(Packet::Close | Packet::Disconnect) => return SessionEnd::Lost,
                        Ok(_) => {}
                        Err(e) => debug!(error = %e, "Ignoring inbound frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Reporting channel read failed");
                        return SessionEnd::Lost;
                    }
                },
            }
        }
    }

    fn on_event(&self, name: &str, data: &Value) {
        if name != CONTINUE_EVENT {
            return;
        }
        // Room semantics: a signal addressed to another process is not ours
        match data.get("processId").and_then(Value::as_str) {
            Some(target) if target != self.process_id => {
                debug!(target, "Ignoring continueStep for other process");
            }
            _ => {
                info!(process_id = %self.process_id, "Received continueStep");
                self.gate.signal();
            }
        }
    }
}

/// Engine.IO open, then connect to the default namespace
async fn handshake(ws: &mut WsStream) -> Result<()> {
    let mut opened = false;
    while let Some(message) = ws.next().await {
        let Message::Text(text) = message.map_err(connection_error)? else {
            continue;
        };
        match Packet::decode(&text)? {
            Packet::Open(open) => {
                debug!(sid = %open.sid, ping_interval = open.ping_interval, "Engine.IO open");
                ws.send(Message::Text(Packet::Connect.encode()))
                    .await
                    .map_err(connection_error)?;
                opened = true;
            }
            Packet::Ping => ws
                .send(Message::Text(Packet::Pong.encode()))
                .await
                .map_err(connection_error)?,
            Packet::Connect if opened => return Ok(()),
            Packet::ConnectError(reason) => {
                return Err(connection_error(format!("namespace refused: {}", reason)))
            }
            Packet::Close => break,
            _ => {}
        }
    }
    Err(connection_error("closed during Socket.IO handshake"))
}

async fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        if matches!(outbound, Outbound::Close) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::event::{EventKind, SuiteRef};
    use crate::probe::packet::Handshake;
    use crate::types::StepMode;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    #[test]
    fn endpoint_maps_scheme_and_appends_path() {
        let url = endpoint_url("http://127.0.0.1:8080", "/robot-report-logs-realtime").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://127.0.0.1:8080/robot-report-logs-realtime/?EIO=4&transport=websocket"
        );

        let url = endpoint_url("https://example.com/base/", "socket").unwrap();
        assert_eq!(url.as_str(), "wss://example.com/base/socket/?EIO=4&transport=websocket");

        let url = endpoint_url("ws://h:1", "").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/");
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!(matches!(
            endpoint_url("ftp://h", "/x"),
            Err(SimError::Connection { .. })
        ));
        assert!(endpoint_url("not a url", "/x").is_err());
    }

    fn config(base_url: String) -> ChannelConfig {
        ChannelConfig {
            base_url,
            socket_path: "/robot-report-logs-realtime".into(),
            process_id: "P1".into(),
            attempts: 1,
            delay: Duration::from_millis(10),
        }
    }

    fn run_start() -> Event {
        Event::new(
            1,
            "P1",
            EventKind::RunStart {
                suite: SuiteRef { name: "S".into() },
            },
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_observer_degrades() {
        let gate = Arc::new(StepGate::new(StepMode::Step));
        let mut channel = tokio::task::spawn_blocking(move || {
            ReportingChannel::connect(config("http://127.0.0.1:9".into()), gate)
        })
        .await
        .unwrap()
        .unwrap();

        assert!(!channel.is_connected());
        channel.report(&run_start());
        tokio::task::spawn_blocking(move || channel.disconnect(Duration::from_millis(200)))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refused_namespace_degrades() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let open = Packet::Open(Handshake {
                sid: "s1".into(),
                upgrades: vec![],
                ping_interval: 25000,
                ping_timeout: 20000,
            });
            ws.send(Message::Text(open.encode())).await.unwrap();
            let _connect = ws.next().await;
            let refused = Packet::ConnectError("Not authorized".into());
            ws.send(Message::Text(refused.encode())).await.unwrap();
            let _ = ws.next().await;
        });

        let gate = Arc::new(StepGate::new(StepMode::All));
        let channel = tokio::task::spawn_blocking(move || {
            ReportingChannel::connect(config(format!("http://{}", addr)), gate)
        })
        .await
        .unwrap()
        .unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn joins_room_sends_events_and_receives_continue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (uri_tx, uri_rx) = std_mpsc::channel();
            let record_uri = move |req: &Request, resp: Response| {
                let _ = uri_tx.send(req.uri().to_string());
                Ok::<Response, ErrorResponse>(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, record_uri).await.unwrap();
            let uri = uri_rx.recv().unwrap();

            let open = Packet::Open(Handshake {
                sid: "s1".into(),
                upgrades: vec![],
                ping_interval: 25000,
                ping_timeout: 20000,
            });
            ws.send(Message::Text(open.encode())).await.unwrap();
            let connect = ws.next().await.unwrap().unwrap();
            assert_eq!(connect.to_text().unwrap(), "40");
            ws.send(Message::Text(r#"40{"sid":"n1"}"#.into())).await.unwrap();

            ws.send(Message::Text(Packet::Ping.encode())).await.unwrap();
            // Addressed elsewhere first; must not open the gate
            let other = Packet::event(CONTINUE_EVENT, json!({ "processId": "P2" }));
            ws.send(Message::Text(other.encode())).await.unwrap();
            let ours = Packet::event(CONTINUE_EVENT, json!({ "processId": "P1" }));
            ws.send(Message::Text(ours.encode())).await.unwrap();

            let mut packets = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Text(text) => packets.push(Packet::decode(&text).unwrap()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            (uri, packets)
        });

        let gate = Arc::new(StepGate::new(StepMode::Step));
        let channel_gate = Arc::clone(&gate);
        let mut channel = tokio::task::spawn_blocking(move || {
            ReportingChannel::connect(config(format!("http://{}", addr)), channel_gate)
        })
        .await
        .unwrap()
        .unwrap();
        assert!(channel.is_connected());

        channel.report(&run_start());

        let signalled = {
            let gate = Arc::clone(&gate);
            tokio::task::spawn_blocking(move || gate.wait_timeout(Duration::from_secs(5)))
                .await
                .unwrap()
        };
        assert!(signalled);
        // Exactly one signal was for us
        assert!(!gate.wait_timeout(Duration::from_millis(50)));

        tokio::task::spawn_blocking(move || channel.disconnect(Duration::from_secs(2)))
            .await
            .unwrap();

        let (uri, packets) = server.await.unwrap();
        assert_eq!(uri, "/robot-report-logs-realtime/?EIO=4&transport=websocket");
        assert!(packets.contains(&Packet::Pong));
        assert_eq!(packets.last(), Some(&Packet::Disconnect));

        let events: Vec<(String, Value)> = packets
            .into_iter()
            .filter_map(|p| match p {
                Packet::Event { name, data } => Some((name, data)),
                _ => None,
            })
            .collect();
        assert_eq!(events[0].0, JOIN_EVENT);
        assert_eq!(events[0].1["processId"], "P1");
        assert_eq!(events[1].0, ROBOT_EVENT);
        assert_eq!(events[1].1["seq"], 1);
        assert_eq!(events[1].1["type"], "RUN_START");
    }
}
