use std::{sync::Arc, time::Instant};

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::{signal, sync::Mutex as AsyncMutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod chat;
mod config;
mod embeddings;
mod error;
mod feedback;
mod graph;
mod llm;
mod meta_prompt;
mod session;
mod store;
mod vector_index;

use chat::TurnRecorder;
use embeddings::Embedder;
use error::ServiceError;
use feedback::{FeedbackClassifier, FeedbackSignal};
use llm::{ChatMessage, ChatProvider, CompletionRequest, OpenAiClient};
use meta_prompt::MetaPromptAgent;
use session::Session;
use store::{Candidate, SessionStore, SessionSummary};

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Parser, Debug)]
#[command(name = "session-memory-server", version, about = "Chat proxy with session memory and retrieval")]
struct Cli {
    /// Bind address for the HTTP server
    #[arg(long, env = "HTTP_BIND")]
    bind: Option<String>,

    /// Directory holding session memory and the meta prompt
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<String>,
}

struct AppState {
    start_time: Instant,
    config: config::Config,
    llm: Arc<dyn ChatProvider>,
    embedder: Arc<dyn Embedder>,
    store: Arc<AsyncMutex<SessionStore>>,
    classifier: Arc<FeedbackClassifier>,
    meta: Arc<MetaPromptAgent>,
}

#[derive(Serialize)]
struct Health { status: &'static str }

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    memory: bool,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Deserialize)]
struct EndSessionRequest {
    session_id: String,
    #[serde(default)]
    final_code: String,
    #[serde(default)]
    final_output: String,
}

#[derive(Deserialize)]
struct RetrieveRequest { question: String, #[serde(default)] top_k: Option<usize> }

#[derive(Serialize)]
struct RetrieveResponse { candidates: Vec<Candidate>, session: Option<Session> }

#[derive(Deserialize)]
struct ClassifyRequest { text: String }

#[derive(Serialize)]
struct ClassifyResponse {
    #[serde(flatten)]
    signal: FeedbackSignal,
    threshold: f32,
}

#[derive(Deserialize)]
struct FeedbackRequest {
    user_prompt: String,
    assistant_response: String,
    #[serde(default)]
    user_feedback: Option<String>,
}

#[derive(Serialize)]
struct FeedbackResponse { instruction: String, meta_prompt: String }

#[derive(Deserialize, Default)]
struct InitializeRequest { #[serde(default)] path: Option<String> }

#[derive(Serialize)]
struct StatusResponse {
    uptime_ms: u128,
    active_sessions: usize,
    stored_sessions: usize,
    indexed: usize,
    embedding_dim: usize,
    memory_file: String,
    meta_prompt_chars: usize,
    health: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let env_cfg = config::Config::load()?;
    let bind = match cli.bind.as_deref() {
        Some(b) if !b.is_empty() => b.parse()?,
        _ => env_cfg.bind,
    };
    let data_dir = cli.data_dir.map(std::path::PathBuf::from).unwrap_or_else(|| env_cfg.data_dir.clone());
    let cfg = if bind != env_cfg.bind || data_dir != env_cfg.data_dir { config::Config::from_env(bind, data_dir) } else { env_cfg };
    cfg.ensure_dirs()?;
    if cfg.chat.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; upstream calls will be rejected");
    }

    let embedder = embeddings::default_embedder()?;
    let classifier = Arc::new(FeedbackClassifier::new(embedder.clone(), cfg.feedback_threshold)?);
    let store = SessionStore::open(&cfg.memory_file, embedder.clone(), classifier.clone())?;
    let llm: Arc<dyn ChatProvider> = Arc::new(OpenAiClient::new(cfg.chat.clone(), cfg.llm_timeout)?);
    let meta_llm: Arc<dyn ChatProvider> = Arc::new(OpenAiClient::new(cfg.meta.clone(), cfg.llm_timeout)?);
    let meta = MetaPromptAgent::open(meta_llm, cfg.meta.model.clone(), &cfg.meta_prompt_file).await?;

    let state = Arc::new(AppState {
        start_time: Instant::now(),
        config: cfg,
        llm,
        embedder,
        store: Arc::new(AsyncMutex::new(store)),
        classifier,
        meta: Arc::new(meta),
    });

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.config.bind).await?;
    info!(bind = %state.config.bind, "Starting HTTP server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Shutdown signal received");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/api/chat", post(chat_completion))
        .route("/api/end_session", post(end_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/retrieve", post(retrieve))
        .route("/api/classify", post(classify))
        .route("/api/feedback", post(feedback))
        .route("/api/meta_prompt", get(meta_prompt))
        .route("/api/graph", get(session_graph))
        .route("/api/initialize", post(initialize))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Health> { Json(Health { status: "ok" }) }

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let (active_sessions, stored_sessions, indexed, embedding_dim, memory_file) = {
        let store = state.store.lock().await;
        (store.active_count(), store.memory().len(), store.index().len(), store.index().dim(), store.path().display().to_string())
    };
    let meta_prompt_chars = state.meta.meta_prompt().await.chars().count();
    Json(StatusResponse {
        uptime_ms: state.start_time.elapsed().as_millis(),
        active_sessions,
        stored_sessions,
        indexed,
        embedding_dim,
        memory_file,
        meta_prompt_chars,
        health: "ok",
    })
}

async fn chat_completion(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Result<Response, ServiceError> {
    let question = chat::last_user_question(&req.messages)
        .ok_or_else(|| ServiceError::InvalidInput("messages must contain a non-empty user message".to_string()))?
        .to_string();
    let session_id = req
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let needs_context = req.memory && {
        let mut store = state.store.lock().await;
        let missing = store.get_or_create(&session_id, &question).hidden_context.is_none();
        missing
    };
    let query = if needs_context {
        Some(embeddings::embed_blocking(state.embedder.clone(), question.clone()).await?)
    } else {
        None
    };

    let (hidden_context, previous_turn) = {
        let mut store = state.store.lock().await;
        if let Some(query) = query.as_deref() {
            let rendered = store.retrieve(query, state.config.retrieval_top_k).map(|prior| {
                debug!(session_id = %session_id, prior = %prior.session_id, score = prior.score, "injecting prior session");
                chat::render_hidden_context(prior)
            });
            let session = store.get_or_create(&session_id, &question);
            if session.hidden_context.is_none() {
                session.hidden_context = rendered;
            }
        }
        let session = store.get_or_create(&session_id, &question);
        (session.hidden_context.clone(), session.last_turn().cloned())
    };

    if state.config.auto_meta_feedback {
        if let Some(prev) = previous_turn {
            spawn_auto_feedback(&state, prev, question.clone());
        }
    }

    let meta_prompt = state.meta.meta_prompt().await;
    let messages = chat::compose_messages(req.system_prompt.as_deref(), &meta_prompt, hidden_context.as_deref(), &req.messages);
    let model = req.model.clone().unwrap_or_else(|| state.llm.default_model().to_string());
    let upstream = state.llm.stream(&CompletionRequest { model, messages }).await?;

    let recorder = TurnRecorder { store: state.store.clone(), session_id: session_id.clone(), question };
    let body = Body::from_stream(chat::char_stream(upstream, state.config.stream_delay, recorder));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, session_id)
        .body(body)
        .map_err(|e| ServiceError::Internal(e.into()))
}

/// Hands the previous turn to the meta-prompt agent when the new question
/// reads as a complaint. Runs in the background.
fn spawn_auto_feedback(state: &Arc<AppState>, prev: session::Turn, question: String) {
    let classifier = state.classifier.clone();
    let meta = state.meta.clone();
    tokio::spawn(async move {
        let signal = match classifier.classify_blocking(question.clone()).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "feedback classification failed");
                return;
            }
        };
        if !signal.negative {
            return;
        }
        debug!(similarity = signal.negative_similarity, "negative follow-up, updating meta prompt");
        if let Err(e) = meta.handle_feedback(&prev.q, &prev.a, Some(&question)).await {
            warn!(error = %e, "automatic meta prompt update failed");
        }
    });
}

async fn end_session(State(state): State<Arc<AppState>>, Json(req): Json<EndSessionRequest>) -> Result<Json<SessionSummary>, ServiceError> {
    let summary = state.store.lock().await.end_session(&req.session_id, &req.final_code, &req.final_output)?;
    Ok(Json(summary))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.store.lock().await;
    let stored: Vec<serde_json::Value> = store
        .memory()
        .iter()
        .map(|s| serde_json::json!({ "summary": SessionSummary::from(s), "initial_question": s.initial_question }))
        .collect();
    Json(serde_json::json!({ "active": store.active_ids(), "stored": stored }))
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<Session>, ServiceError> {
    let store = state.store.lock().await;
    store
        .active(&id)
        .or_else(|| store.stored(&id))
        .cloned()
        .map(Json)
        .ok_or_else(|| ServiceError::session_not_found(&id))
}

async fn retrieve(State(state): State<Arc<AppState>>, Json(req): Json<RetrieveRequest>) -> Result<Json<RetrieveResponse>, ServiceError> {
    if req.question.trim().is_empty() {
        return Err(ServiceError::InvalidInput("question must not be empty".to_string()));
    }
    let top_k = req.top_k.unwrap_or(state.config.retrieval_top_k);
    let query = embeddings::embed_blocking(state.embedder.clone(), req.question).await?;
    let store = state.store.lock().await;
    let candidates = store.search(&query, top_k);
    let session = candidates.first().and_then(|c| store.memory().get(c.position)).cloned();
    Ok(Json(RetrieveResponse { candidates, session }))
}

async fn classify(State(state): State<Arc<AppState>>, Json(req): Json<ClassifyRequest>) -> Result<Json<ClassifyResponse>, ServiceError> {
    let signal = state.classifier.clone().classify_blocking(req.text).await?;
    Ok(Json(ClassifyResponse { signal, threshold: state.classifier.threshold() }))
}

async fn feedback(State(state): State<Arc<AppState>>, Json(req): Json<FeedbackRequest>) -> Result<Json<FeedbackResponse>, ServiceError> {
    let instruction = state
        .meta
        .handle_feedback(&req.user_prompt, &req.assistant_response, req.user_feedback.as_deref())
        .await?;
    let meta_prompt = state.meta.meta_prompt().await;
    Ok(Json(FeedbackResponse { instruction, meta_prompt }))
}

async fn meta_prompt(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let text = state.meta.meta_prompt().await;
    Json(serde_json::json!({ "meta_prompt": text, "path": state.meta.path().display().to_string() }))
}

async fn session_graph(State(state): State<Arc<AppState>>) -> Json<graph::GraphData> {
    let store = state.store.lock().await;
    Json(graph::session_graph(store.memory(), store.index(), state.config.graph_link_threshold))
}

async fn initialize(State(state): State<Arc<AppState>>, body: Option<Json<InitializeRequest>>) -> Result<Json<serde_json::Value>, ServiceError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let path = req
        .path
        .filter(|p| !p.trim().is_empty())
        .map(std::path::PathBuf::from)
        .or_else(|| state.config.seed_dataset.clone())
        .ok_or_else(|| ServiceError::InvalidInput("no dataset path given and SEED_DATASET is not set".to_string()))?;
    if !path.exists() {
        return Err(ServiceError::NotFound(format!("dataset {} not found", path.display())));
    }
    let records = store::load_memory(&path).map_err(|e| ServiceError::InvalidInput(format!("{e:#}")))?;
    let mut store = state.store.lock().await;
    let imported = store.import(records)?;
    Ok(Json(serde_json::json!({ "imported": imported, "total": store.memory().len(), "path": path.display().to_string() })))
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, Request, StatusCode};
    use embeddings::HashingEmbedder;
    use llm::testing::ScriptedProvider;
    use rand::{distributions::Alphanumeric, Rng};
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        _dir: tempfile::TempDir,
    }

    async fn harness_with(llm: Arc<ScriptedProvider>, meta_llm: Arc<ScriptedProvider>, configure: impl FnOnce(&mut config::Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config::Config::from_env("127.0.0.1:0".parse().unwrap(), dir.path().to_path_buf());
        cfg.memory_file = dir.path().join("session_memory.json");
        cfg.meta_prompt_file = dir.path().join("meta_prompt.txt");
        cfg.seed_dataset = None;
        cfg.stream_delay = std::time::Duration::ZERO;
        cfg.retrieval_top_k = 5;
        cfg.feedback_threshold = feedback::DEFAULT_THRESHOLD;
        cfg.graph_link_threshold = 0.5;
        cfg.auto_meta_feedback = false;
        configure(&mut cfg);
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let classifier = Arc::new(FeedbackClassifier::new(embedder.clone(), cfg.feedback_threshold).unwrap());
        let store = SessionStore::open(&cfg.memory_file, embedder.clone(), classifier.clone()).unwrap();
        let meta = MetaPromptAgent::new(meta_llm, "meta-model", &cfg.meta_prompt_file);
        let state = Arc::new(AppState {
            start_time: Instant::now(),
            config: cfg,
            llm,
            embedder,
            store: Arc::new(AsyncMutex::new(store)),
            classifier,
            meta: Arc::new(meta),
        });
        Harness { app: build_router(state.clone()), state, _dir: dir }
    }

    async fn harness(reply: &str) -> (Harness, Arc<ScriptedProvider>) {
        let llm = ScriptedProvider::replying(reply);
        (harness_with(llm.clone(), ScriptedProvider::failing(), |_| {}).await, llm)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&json).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_str(&body_text(resp).await).unwrap()
    }

    async fn chat(app: &Router, session_id: Option<&str>, content: &str, memory: bool) -> (String, String) {
        let body = serde_json::json!({
            "messages": [{ "role": "user", "content": content }],
            "session_id": session_id.unwrap_or(""),
            "memory": memory,
        });
        let resp = send(app, Method::POST, "/api/chat", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        let id = resp.headers()[SESSION_HEADER].to_str().unwrap().to_string();
        (id, body_text(resp).await)
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (h, _) = harness("hi").await;
        for uri in ["/", "/health"] {
            let resp = send(&h.app, Method::GET, uri, None).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["status"], "ok");
        }
    }

    #[tokio::test]
    async fn test_chat_streams_reply_and_records_turn() {
        let (h, llm) = harness("Use serde_json::from_str.").await;
        let (id, text) = chat(&h.app, Some("s1"), "How do I parse JSON in Rust?", false).await;
        assert_eq!(id, "s1");
        assert_eq!(text, "Use serde_json::from_str.");

        let store = h.state.store.lock().await;
        let session = store.active("s1").unwrap();
        assert_eq!(session.initial_question, "How do I parse JSON in Rust?");
        assert_eq!(session.chain_length, 1);
        assert_eq!(session.last_turn().unwrap().a, "Use serde_json::from_str.");
        assert_eq!(llm.requests()[0].model, "scripted-model");
    }

    #[tokio::test]
    async fn test_chat_assigns_session_id_when_missing() {
        let (h, _) = harness("ok").await;
        let (id, _) = chat(&h.app, None, "hello", false).await;
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(h.state.store.lock().await.active(&id).is_some());
    }

    #[tokio::test]
    async fn test_chat_requires_user_message() {
        let (h, _) = harness("ok").await;
        let body = serde_json::json!({ "messages": [{ "role": "system", "content": "be nice" }] });
        let resp = send(&h.app, Method::POST, "/api/chat", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_server_error() {
        let h = harness_with(ScriptedProvider::failing(), ScriptedProvider::failing(), |_| {}).await;
        let body = serde_json::json!({ "messages": [{ "role": "user", "content": "hi" }] });
        let resp = send(&h.app, Method::POST, "/api/chat", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = body_json(resp).await;
        assert_eq!(err["error"]["code"], "LLM_ERROR");
        assert!(err["error"]["message"].as_str().unwrap().contains("model unavailable"));
    }

    #[tokio::test]
    async fn test_end_session_persists_exactly_one_record() {
        let (h, _) = harness("Try this.").await;
        chat(&h.app, Some("s1"), "How do I parse JSON in Rust?", false).await;
        chat(&h.app, Some("s1"), "It works now", false).await;

        let body = serde_json::json!({ "session_id": "s1", "final_code": "serde_json::from_str(s)?" });
        let resp = send(&h.app, Method::POST, "/api/end_session", Some(body.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let summary = body_json(resp).await;
        assert_eq!(summary["score"], 1.0);
        assert_eq!(summary["outcome"], "success");
        assert_eq!(summary["tests_passed"], true);
        assert_eq!(summary["chain_length"], 2);

        let path = h.state.config.memory_file.clone();
        let persisted = store::load_memory(&path).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].final_code, "serde_json::from_str(s)?");

        let again = send(&h.app, Method::POST, "/api/end_session", Some(body)).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
        assert_eq!(store::load_memory(&path).unwrap().len(), 1);

        let listed = body_json(send(&h.app, Method::GET, "/api/sessions", None).await).await;
        assert!(listed["active"].as_array().unwrap().is_empty());
        assert_eq!(listed["stored"][0]["summary"]["session_id"], "s1");

        let one = send(&h.app, Method::GET, "/api/sessions/s1", None).await;
        assert_eq!(body_json(one).await["initial_question"], "How do I parse JSON in Rust?");
        let missing = send(&h.app, Method::GET, "/api/sessions/nope", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_memory_injects_prior_session_as_hidden_context() {
        let (h, llm) = harness("Use a BufReader.").await;
        chat(&h.app, Some("old"), "how do I read a file line by line in rust", false).await;
        chat(&h.app, Some("old"), "perfect, that fixed it", false).await;
        let body = serde_json::json!({ "session_id": "old", "final_code": "for line in reader.lines() {}" });
        assert_eq!(send(&h.app, Method::POST, "/api/end_session", Some(body)).await.status(), StatusCode::OK);

        chat(&h.app, Some("new"), "read a file line by line in rust", true).await;
        let last = llm.requests().pop().unwrap();
        let hidden = last.messages.iter().find(|m| m.role == "system").expect("hidden context message");
        assert!(hidden.content.contains("how do I read a file line by line in rust"));
        assert!(hidden.content.contains("for line in reader.lines() {}"));
        assert_eq!(last.messages.last().unwrap().role, "user");

        // Without memory no context is added.
        chat(&h.app, Some("plain"), "read a file line by line in rust", false).await;
        let plain = llm.requests().pop().unwrap();
        assert!(plain.messages.iter().all(|m| m.role != "system"));
    }

    #[tokio::test]
    async fn test_feedback_extends_meta_prompt_for_later_chats() {
        let llm = ScriptedProvider::replying("Here you go.");
        let meta_llm = ScriptedProvider::with_replies(&["- User prefers Python over JavaScript"]);
        let h = harness_with(llm.clone(), meta_llm, |_| {}).await;

        let body = serde_json::json!({
            "user_prompt": "write a script to rename files",
            "assistant_response": "const fs = require('fs')",
            "user_feedback": "I wanted python"
        });
        let resp = send(&h.app, Method::POST, "/api/feedback", Some(body)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let out = body_json(resp).await;
        assert_eq!(out["instruction"], "- User prefers Python over JavaScript");

        let meta = body_json(send(&h.app, Method::GET, "/api/meta_prompt", None).await).await;
        assert_eq!(meta["meta_prompt"], "\n- User prefers Python over JavaScript");

        chat(&h.app, Some("s1"), "write a script to list files", false).await;
        let sent = llm.requests().pop().unwrap();
        assert_eq!(sent.messages[0].role, "system");
        assert!(sent.messages[0].content.contains("User prefers Python"));
    }

    async fn wait_for_meta_prompt(state: &AppState) -> String {
        for _ in 0..200 {
            let text = state.meta.meta_prompt().await;
            if !text.is_empty() {
                return text;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        String::new()
    }

    #[tokio::test]
    async fn test_negative_follow_up_updates_meta_prompt_automatically() {
        let llm = ScriptedProvider::replying("Use std::net::UdpSocket.");
        let meta_llm = ScriptedProvider::with_replies(&["- Show a complete runnable example"]);
        let h = harness_with(llm, meta_llm.clone(), |cfg| cfg.auto_meta_feedback = true).await;

        chat(&h.app, Some("s1"), "how do I open a socket in rust", false).await;
        chat(&h.app, Some("s1"), "what about udp sockets", false).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(meta_llm.requests().is_empty());
        assert!(h.state.meta.meta_prompt().await.is_empty());

        chat(&h.app, Some("s1"), "that didn't work", false).await;
        assert_eq!(wait_for_meta_prompt(&h.state).await, "\n- Show a complete runnable example");

        let seen = meta_llm.requests();
        assert_eq!(seen.len(), 1);
        let prompt = &seen[0].messages.last().unwrap().content;
        assert!(prompt.contains("User prompt: what about udp sockets"));
        assert!(prompt.contains("Assistant response: Use std::net::UdpSocket."));
        assert!(prompt.contains("User feedback: that didn't work"));
    }

    #[tokio::test]
    async fn test_negative_follow_up_is_ignored_when_disabled() {
        let llm = ScriptedProvider::replying("Use std::net::UdpSocket.");
        let meta_llm = ScriptedProvider::with_replies(&["- Show a complete runnable example"]);
        let h = harness_with(llm, meta_llm.clone(), |_| {}).await;

        chat(&h.app, Some("s1"), "how do I open a socket in rust", false).await;
        chat(&h.app, Some("s1"), "that didn't work", false).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(meta_llm.requests().is_empty());
        assert!(h.state.meta.meta_prompt().await.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_and_classify_endpoints() {
        let (h, _) = harness("answer").await;
        let empty = body_json(send(&h.app, Method::POST, "/api/retrieve", Some(serde_json::json!({ "question": "anything" }))).await).await;
        assert!(empty["candidates"].as_array().unwrap().is_empty());
        assert!(empty["session"].is_null());

        for id in ["a", "b"] {
            chat(&h.app, Some(id), "center a div with css", false).await;
            send(&h.app, Method::POST, "/api/end_session", Some(serde_json::json!({ "session_id": id }))).await;
        }
        let out = body_json(send(&h.app, Method::POST, "/api/retrieve", Some(serde_json::json!({ "question": "center a div", "top_k": 10 }))).await).await;
        assert_eq!(out["candidates"].as_array().unwrap().len(), 2);
        assert!(out["session"]["session_id"].is_string());

        let c = body_json(send(&h.app, Method::POST, "/api/classify", Some(serde_json::json!({ "text": "that didn't work" }))).await).await;
        assert_eq!(c["negative"], true);
        assert_eq!(c["positive"], false);
        assert!((c["threshold"].as_f64().unwrap() - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_initialize_dataset_and_graph() {
        let (h, _) = harness("answer").await;
        let missing = send(&h.app, Method::POST, "/api/initialize", None).await;
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let dataset = h._dir.path().join("seed.json");
        std::fs::write(&dataset, serde_json::to_vec(&serde_json::json!([
            { "session_id": "seed-1", "initial_question": "how do I read a file in rust",
              "question_chain": [{ "q": "how do I read a file in rust", "a": "fs::read_to_string" }, { "q": "it works now", "a": "nice" }] },
            { "session_id": "seed-2", "initial_question": "how do I read a file in rust quickly",
              "question_chain": [{ "q": "how do I read a file in rust quickly", "a": "mmap" }] },
            { "session_id": "seed-3", "initial_question": "center a div with css grid",
              "question_chain": [{ "q": "center a div with css grid", "a": "place-items: center" }] }
        ])).unwrap()).unwrap();

        let resp = send(&h.app, Method::POST, "/api/initialize", Some(serde_json::json!({ "path": dataset.display().to_string() }))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let out = body_json(resp).await;
        assert_eq!(out["imported"], 3);
        assert_eq!(out["total"], 3);

        let again = body_json(send(&h.app, Method::POST, "/api/initialize", Some(serde_json::json!({ "path": dataset.display().to_string() }))).await).await;
        assert_eq!(again["imported"], 0);

        let graph = body_json(send(&h.app, Method::GET, "/api/graph", None).await).await;
        let nodes = graph["nodes"].as_array().unwrap();
        assert_eq!(nodes.iter().filter(|n| n["type"] == "category").count(), 2);
        assert_eq!(nodes.iter().filter(|n| n["type"] == "question").count(), 3);
        assert!(graph["links"].as_array().unwrap().iter().any(|l| l["source"] == "seed-1" && l["target"] == "seed-2"));

        let status = body_json(send(&h.app, Method::GET, "/status", None).await).await;
        assert_eq!(status["stored_sessions"], 3);
        assert_eq!(status["indexed"], 3);
        assert_eq!(status["embedding_dim"], 384);
    }

    #[tokio::test]
    async fn test_concurrent_chats_record_every_session() {
        let (h, _) = harness("reply").await;
        let mut tasks = Vec::new();
        for i in 0..20 {
            let app = h.app.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("session-{i}");
                chat(&app, Some(&id), &format!("question number {i}"), false).await;
            }));
        }
        for t in tasks { t.await.unwrap(); }
        let store = h.state.store.lock().await;
        assert_eq!(store.active_count(), 20);
        assert!(store.active_ids().iter().all(|id| store.active(id).unwrap().chain_length == 1));
    }

    #[tokio::test]
    async fn test_fuzz_end_unknown_sessions() {
        let (h, _) = harness("reply").await;
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let len: usize = rng.gen_range(1..64);
            let id: String = (0..len).map(|_| rng.sample(Alphanumeric) as char).collect();
            let resp = send(&h.app, Method::POST, "/api/end_session", Some(serde_json::json!({ "session_id": id }))).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
        assert!(!h.state.config.memory_file.exists());
    }
}
