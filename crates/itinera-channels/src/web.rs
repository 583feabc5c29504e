use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use itinera_config::GatewayConfig;
use itinera_core::session::TranscriptEntry;
use itinera_core::{
    AgentError, ChatSession, Presenter, ResetScope, SessionFactory, TranscriptBuffer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::web_assets;

type WsSender = mpsc::UnboundedSender<Message>;

/// Browser chat widget served over HTTP with a WebSocket per visitor.
///
/// Every connection gets its own [`ChatSession`]; nothing conversational is
/// shared between connections.
pub struct WebChannel {
    gateway_config: GatewayConfig,
    factory: Arc<SessionFactory>,
    connections: Arc<DashMap<String, WsSender>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[derive(Clone)]
struct AppState {
    password: String,
    factory: Arc<SessionFactory>,
    connections: Arc<DashMap<String, WsSender>>,
}

#[derive(Deserialize)]
struct WsParams {
    password: Option<String>,
}

#[derive(Serialize, Default)]
struct WsOutMsg {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recoverable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<ResetScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    messages: Option<Vec<HistoryMessage>>,
}

impl WsOutMsg {
    fn new(msg_type: &str) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            ..Self::default()
        }
    }

    fn error(content: impl Into<String>, recoverable: bool) -> Self {
        Self {
            content: Some(content.into()),
            recoverable: Some(recoverable),
            ..Self::new("error")
        }
    }
}

#[derive(Serialize, Clone)]
struct HistoryMessage {
    role: String,
    content: String,
    timestamp: String,
}

impl From<&TranscriptEntry> for HistoryMessage {
    fn from(entry: &TranscriptEntry) -> Self {
        Self {
            role: entry.role.as_str().to_string(),
            content: entry.content.clone(),
            timestamp: entry.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Deserialize)]
struct WsInMsg {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    scope: Option<String>,
}

impl WebChannel {
    pub fn new(gateway_config: GatewayConfig, factory: Arc<SessionFactory>) -> Self {
        Self {
            gateway_config,
            factory,
            connections: Arc::new(DashMap::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Bind and serve in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let state = AppState {
            password: self.gateway_config.password.clone(),
            factory: self.factory.clone(),
            connections: self.connections.clone(),
        };

        let router = Router::new()
            .route("/", get(serve_index))
            .route("/style.css", get(serve_css))
            .route("/app.js", get(serve_js))
            .route("/ws", get(ws_upgrade))
            .route("/api/health", get(api_health))
            .with_state(state);

        let addr: SocketAddr = format!("{}:{}", self.gateway_config.host, self.gateway_config.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid gateway listen address: {e}"))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Web channel listening on http://{local_addr}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let connections = self.connections.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });

            if let Err(e) = server.await {
                error!("Web server error: {e}");
            }

            // Close all connections on shutdown
            connections.clear();
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        self.connections.clear();
        Ok(())
    }
}

/// Streams a reply into `token` frames carrying the accumulated text, so
/// the browser can replace rather than append.
struct WsPresenter {
    tx: WsSender,
    buffer: TranscriptBuffer,
}

impl WsPresenter {
    fn new(tx: WsSender) -> Self {
        Self {
            tx,
            buffer: TranscriptBuffer::new(),
        }
    }
}

impl Presenter for WsPresenter {
    fn on_token(&mut self, fragment: &str) {
        let text = self.buffer.push(fragment).to_string();
        send_json(
            &self.tx,
            &WsOutMsg {
                content: Some(text),
                ..WsOutMsg::new("token")
            },
        );
    }

    fn on_tool_call(&mut self, name: &str, query: &str) {
        self.buffer.reset();
        send_json(
            &self.tx,
            &WsOutMsg {
                name: Some(name.to_string()),
                query: Some(query.to_string()),
                ..WsOutMsg::new("tool")
            },
        );
    }

    fn on_complete(&mut self, full_text: &str) {
        let text = self.buffer.finish(full_text).to_string();
        send_json(
            &self.tx,
            &WsOutMsg {
                content: Some(text),
                timestamp: Some(chrono::Utc::now().to_rfc3339()),
                ..WsOutMsg::new("done")
            },
        );
    }

    fn on_error(&mut self, error: &AgentError) {
        send_json(&self.tx, &WsOutMsg::error(error.to_string(), error.is_recoverable()));
    }
}

fn send_json(tx: &WsSender, msg: &WsOutMsg) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json.into()));
        }
        Err(e) => warn!("Failed to serialize WebSocket frame: {e}"),
    }
}

// --- Axum Handlers ---

async fn serve_index() -> Html<&'static str> {
    Html(web_assets::INDEX_HTML)
}

async fn serve_css() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/css")], web_assets::STYLE_CSS)
}

async fn serve_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        web_assets::APP_JS,
    )
}

async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "model": state.factory.agent().model_name(),
        "connections": state.connections.len(),
        "chunks": state.factory.index().map(|i| i.len()).unwrap_or(0),
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    // Validate password
    if !state.password.is_empty() {
        let provided = params.password.as_deref().unwrap_or("");
        if provided != state.password {
            return ws
                .on_upgrade(|mut socket| async move {
                    let frame = WsOutMsg::error("Authentication failed", false);
                    if let Ok(json) = serde_json::to_string(&frame) {
                        let _ = socket.send(Message::Text(json.into())).await;
                    }
                    let _ = socket.close().await;
                })
                .into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
        .into_response()
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let short_conn = &conn_id[..8];
    info!("WebSocket connected: conn={short_conn}");

    let (ws_write, mut ws_read) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    let write_conn_id = conn_id.clone();
    let write_handle = tokio::spawn(ws_write_loop(ws_write, rx, write_conn_id));

    let session = match state.factory.new_session(format!("web:{short_conn}")) {
        Ok(s) => Arc::new(Mutex::new(s)),
        Err(e) => {
            error!("Failed to create session for conn={short_conn}: {e:#}");
            send_json(&tx, &WsOutMsg::error(format!("Session setup failed: {e}"), false));
            drop(tx);
            let _ = write_handle.await;
            return;
        }
    };
    let in_flight: Arc<std::sync::Mutex<Option<CancellationToken>>> =
        Arc::new(std::sync::Mutex::new(None));

    state.connections.insert(conn_id.clone(), tx.clone());
    send_json(&tx, &WsOutMsg::new("connected"));

    // Read loop
    while let Some(result) = ws_read.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket read error for conn={short_conn}: {e}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let parsed: WsInMsg = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(_) => continue,
                };

                match parsed.msg_type.as_str() {
                    "message" => {
                        if parsed.content.trim().is_empty() {
                            continue;
                        }
                        start_turn(&session, &in_flight, &tx, parsed.content);
                    }
                    "cancel" => {
                        if let Some(token) = lock_slot(&in_flight).take() {
                            info!("Cancelling turn for conn={short_conn}");
                            token.cancel();
                        }
                    }
                    "reset" => {
                        let requested = parsed.scope.as_deref().unwrap_or("all");
                        let scope = match requested.parse::<ResetScope>() {
                            Ok(s) => s,
                            Err(e) => {
                                send_json(&tx, &WsOutMsg::error(e.to_string(), true));
                                continue;
                            }
                        };
                        match session.try_lock() {
                            Ok(mut s) => {
                                s.reset(scope);
                                send_json(
                                    &tx,
                                    &WsOutMsg {
                                        scope: Some(scope),
                                        ..WsOutMsg::new("reset")
                                    },
                                );
                            }
                            Err(_) => send_busy(&tx),
                        }
                    }
                    "get_history" => match session.try_lock() {
                        Ok(s) => send_history(&s, &tx),
                        Err(_) => send_busy(&tx),
                    },
                    _ => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Cleanup
    if let Some(token) = lock_slot(&in_flight).take() {
        token.cancel();
    }
    state.connections.remove(&conn_id);
    write_handle.abort();
    info!("WebSocket disconnected: conn={short_conn}");
}

/// Run a turn in the background so the read loop stays free for `cancel`.
/// A session runs one turn at a time; a second message while busy is
/// rejected.
fn start_turn(
    session: &Arc<Mutex<ChatSession>>,
    in_flight: &Arc<std::sync::Mutex<Option<CancellationToken>>>,
    tx: &WsSender,
    content: String,
) {
    let Ok(mut guard) = session.clone().try_lock_owned() else {
        send_busy(tx);
        return;
    };

    let token = CancellationToken::new();
    *lock_slot(in_flight) = Some(token.clone());

    let in_flight = in_flight.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let mut presenter = WsPresenter::new(tx);
        // Errors were already reported to the presenter
        let _ = guard.send(&content, &mut presenter, &token).await;
        // Cleared while the session lock is still held, so no newer turn
        // can own the slot yet
        *lock_slot(&in_flight) = None;
    });
}

fn lock_slot(
    slot: &std::sync::Mutex<Option<CancellationToken>>,
) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn send_busy(tx: &WsSender) {
    send_json(tx, &WsOutMsg::error("A reply is still in progress", true));
}

fn send_history(session: &ChatSession, tx: &WsSender) {
    let messages: Vec<HistoryMessage> = session
        .transcript()
        .iter()
        .map(HistoryMessage::from)
        .collect();
    send_json(
        tx,
        &WsOutMsg {
            messages: Some(messages),
            ..WsOutMsg::new("history")
        },
    );
}

async fn ws_write_loop(
    mut ws_write: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    conn_id: String,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = ws_write.send(msg).await {
            warn!("WebSocket write error for conn={conn_id}: {e}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itinera_core::agent::{ModelEvent, ModelRequest, ModelStream};
    use itinera_core::ModelError;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    use super::*;

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn out_msg_omits_empty_fields() {
        let json = serde_json::to_string(&WsOutMsg::new("connected")).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);
    }

    #[test]
    fn error_frame_carries_recoverable_flag() {
        let json = serde_json::to_value(WsOutMsg::error("busy", true)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["content"], "busy");
        assert_eq!(json["recoverable"], true);
    }

    #[test]
    fn reset_frame_scope_is_lowercase() {
        let json = serde_json::to_value(WsOutMsg {
            scope: Some(ResetScope::Transcript),
            ..WsOutMsg::new("reset")
        })
        .unwrap();
        assert_eq!(json["scope"], "transcript");
    }

    #[test]
    fn in_msg_defaults() {
        let msg: WsInMsg = serde_json::from_str(r#"{"type":"message"}"#).unwrap();
        assert_eq!(msg.msg_type, "message");
        assert_eq!(msg.content, "");
        assert!(msg.scope.is_none());

        let msg: WsInMsg = serde_json::from_str(r#"{"type":"reset","scope":"memory"}"#).unwrap();
        assert_eq!(msg.scope.as_deref(), Some("memory"));
    }

    #[test]
    fn presenter_sends_accumulated_text() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = WsPresenter::new(tx);
        presenter.on_token("Ro");
        presenter.on_token("me");
        presenter.on_complete("Rome");

        let frames = frames(&mut rx);
        let contents: Vec<&str> = frames.iter().map(|f| f["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["Ro", "Rome", "Rome"]);
        assert_eq!(frames[2]["type"], "done");
    }

    #[test]
    fn presenter_tool_call_starts_new_segment() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = WsPresenter::new(tx);
        presenter.on_token("Checking");
        presenter.on_tool_call("travel_docs", "Uffizi tickets");
        presenter.on_token("Book");

        let frames = frames(&mut rx);
        assert_eq!(frames[1]["type"], "tool");
        assert_eq!(frames[1]["name"], "travel_docs");
        assert_eq!(frames[1]["query"], "Uffizi tickets");
        assert_eq!(frames[2]["content"], "Book");
    }

    #[test]
    fn presenter_error_frame() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut presenter = WsPresenter::new(tx);
        presenter.on_error(&AgentError::Stalled { attempts: 5 });

        let frames = frames(&mut rx);
        assert_eq!(frames[0]["type"], "error");
        assert_eq!(frames[0]["recoverable"], true);
        assert!(frames[0]["content"].as_str().unwrap().contains("rephrase"));
    }

    struct SilentModel;

    #[async_trait::async_trait]
    impl itinera_core::LanguageModel for SilentModel {
        fn name(&self) -> &str {
            "silent"
        }

        async fn stream(
            &self,
            _request: itinera_core::agent::ModelRequest,
        ) -> Result<itinera_core::agent::ModelStream, itinera_core::ModelError> {
            Ok(futures::stream::empty().boxed())
        }
    }

    #[tokio::test]
    async fn serves_widget_and_health() {
        let mut config = itinera_config::Config::default();
        config.tools.web.search.enabled = false;
        let agent = Arc::new(itinera_core::AgentLoop::from_config(
            Arc::new(SilentModel),
            &config.agent,
        ));
        let factory = Arc::new(SessionFactory::new(agent, &config, None));
        let channel = WebChannel::new(
            GatewayConfig {
                port: 0,
                ..GatewayConfig::default()
            },
            factory,
        );

        let addr = channel.start().await.unwrap();
        let index = reqwest::get(format!("http://{addr}/")).await.unwrap();
        assert!(index.status().is_success());
        assert!(index.text().await.unwrap().contains("app.js"));

        let health: serde_json::Value = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["model"], "silent");
        assert_eq!(health["chunks"], 0);

        channel.stop().await.unwrap();
    }

    /// Replies "Buon viaggio" in two tokens, except to utterances mentioning
    /// "slow", which never produce anything. Records every request's size.
    struct TripModel {
        request_sizes: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait::async_trait]
    impl itinera_core::LanguageModel for TripModel {
        fn name(&self) -> &str {
            "trip"
        }

        async fn stream(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
            self.request_sizes.lock().unwrap().push(request.messages.len());
            let slow = request
                .messages
                .last()
                .is_some_and(|m| m.content.contains("slow"));
            if slow {
                return Ok(futures::stream::pending::<Result<ModelEvent, ModelError>>().boxed());
            }
            let events = vec![
                Ok(ModelEvent::Token("Buon".into())),
                Ok(ModelEvent::Token(" viaggio".into())),
            ];
            Ok(futures::stream::iter(events).boxed())
        }
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn next_frame(ws: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame within 5s")
                .expect("socket closed")
                .unwrap();
            if msg.is_text() {
                return serde_json::from_str(msg.to_text().unwrap()).unwrap();
            }
        }
    }

    async fn send(ws: &mut Client, frame: serde_json::Value) {
        ws.send(ClientMessage::text(frame.to_string())).await.unwrap();
    }

    /// Wait until no turn holds the session, returning the transcript.
    async fn idle_history(ws: &mut Client) -> Vec<serde_json::Value> {
        for _ in 0..100 {
            send(ws, json!({"type": "get_history"})).await;
            let frame = next_frame(ws).await;
            if frame["type"] == "history" {
                return frame["messages"].as_array().cloned().unwrap_or_default();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never became idle");
    }

    /// Frames of one turn, through `done` or `error`.
    async fn turn_frames(ws: &mut Client, content: &str) -> Vec<serde_json::Value> {
        send(ws, json!({"type": "message", "content": content})).await;
        let mut frames = Vec::new();
        loop {
            let frame = next_frame(ws).await;
            let last = frame["type"] == "done" || frame["type"] == "error";
            frames.push(frame);
            if last {
                return frames;
            }
        }
    }

    #[tokio::test]
    async fn websocket_turns_stream_reject_overlap_and_cancel() {
        let mut config = itinera_config::Config::default();
        config.tools.web.search.enabled = false;
        let request_sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let model = Arc::new(TripModel {
            request_sizes: request_sizes.clone(),
        });
        let agent = Arc::new(itinera_core::AgentLoop::from_config(model, &config.agent));
        let factory = Arc::new(SessionFactory::new(agent, &config, None));
        let channel = WebChannel::new(
            GatewayConfig {
                port: 0,
                ..GatewayConfig::default()
            },
            factory,
        );
        let addr = channel.start().await.unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        assert_eq!(next_frame(&mut ws).await["type"], "connected");

        // A normal turn streams accumulated text, then completes
        let frames = turn_frames(&mut ws, "Two days in Rome?").await;
        let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["token", "token", "done"]);
        assert_eq!(frames[0]["content"], "Buon");
        assert_eq!(frames[1]["content"], "Buon viaggio");
        assert_eq!(frames[2]["content"], "Buon viaggio");
        assert_eq!(idle_history(&mut ws).await.len(), 2);

        // While a turn hangs, another message is refused
        send(&mut ws, json!({"type": "message", "content": "a slow question"})).await;
        send(&mut ws, json!({"type": "message", "content": "are you there?"})).await;
        let busy = next_frame(&mut ws).await;
        assert_eq!(busy["type"], "error");
        assert_eq!(busy["recoverable"], true);
        assert_eq!(busy["content"], "A reply is still in progress");

        send(&mut ws, json!({"type": "cancel"})).await;
        let cancelled = next_frame(&mut ws).await;
        assert_eq!(cancelled["type"], "error");
        assert_eq!(cancelled["content"], "turn cancelled");
        assert_eq!(cancelled["recoverable"], true);

        // The cancelled turn left no trace in transcript or memory
        assert_eq!(idle_history(&mut ws).await.len(), 2);
        let frames = turn_frames(&mut ws, "Back to Rome").await;
        assert_eq!(frames.last().unwrap()["type"], "done");

        let sizes = request_sizes.lock().unwrap().clone();
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes[1], sizes[0] + 2);
        assert_eq!(sizes[2], sizes[1]);

        channel.stop().await.unwrap();
    }
}
