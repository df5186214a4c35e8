use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use relay_core::{RemoteAgentConfig, RemoteAgentHandler, RemoteAgentRequest, RetryConfig};
use relay_remote::{classify_transport_error, AgentPlatform, HttpAgentPlatform, RemoteAgent};
use relay_types::{CanonicalEvent, ErrorCode, Message};

const KNOWN_THREAD: &str = "6f1c1b0e-8d2a-4a5e-9a51-0f7f6a2b3c4d";

#[derive(Default)]
struct Recorded {
    auth: Vec<String>,
    created: Vec<Value>,
    updates: Vec<Value>,
    runs: Vec<Value>,
    cancels: Vec<String>,
}

type Shared = Arc<Mutex<Recorded>>;

fn record_auth(state: &Shared, headers: &HeaderMap) {
    if let Some(value) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        state.lock().expect("lock").auth.push(value.to_string());
    }
}

async fn get_thread(Path(id): Path<String>) -> Response {
    if id == KNOWN_THREAD {
        Json(json!({"thread_id": id})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn create_thread(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().expect("lock").created.push(body.clone());
    Json(body)
}

async fn thread_state(Path(id): Path<String>) -> Json<Value> {
    Json(json!({
        "values": {"x": 1, "messages": [
            {"id": "h0", "type": "human", "content": "earlier question"}
        ]},
        "next": [],
        "metadata": {"writes": {"plan": {"x": 1}}, "thread_id": id},
        "tasks": []
    }))
}

async fn update_state(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().expect("lock").updates.push(body);
    Json(json!({"checkpoint": {}}))
}

async fn search_assistants(State(state): State<Shared>, headers: HeaderMap) -> Json<Value> {
    record_auth(&state, &headers);
    Json(json!([
        {"assistant_id": "asst-1", "name": "planner", "config": {"configurable": {}}},
        {"assistant_id": "asst-2", "name": "writer", "config": {}}
    ]))
}

async fn schemas() -> Json<Value> {
    Json(json!({
        "input_schema": {"properties": {"x": {}}},
        "output_schema": {"properties": {"x": {}}},
        "config_schema": {"properties": {}}
    }))
}

async fn graph() -> Json<Value> {
    Json(json!({"nodes": [{"id": "__start__"}, {"id": "plan"}, {"id": "__end__"}]}))
}

async fn stream_run(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    record_auth(&state, &headers);
    state.lock().expect("lock").runs.push(body);
    // The multi-byte character is split across chunks.
    let chunks: Vec<Result<&'static [u8], std::io::Error>> = vec![
        Ok(&b"{\"event\":\"metadata\",\"data\":{\"run_id\":\"r1\"}}\n{\"event\":\"values\",\"data\":{\"x\":1}}\n"[..]),
        Ok(&b"{\"event\":\"events\",\"data\":{\"event\":\"on_chain_start\",\"name\":\"plan\",\"data\":{},"[..]),
        Ok(&b"\"metadata\":{\"langgraph_node\":\"plan\",\"run_id\":\"r1\"}}}\n"[..]),
        Ok(&b"{\"event\":\"events\",\"data\":{\"event\":\"on_chat_model_stream\",\"data\":{\"chunk\":{\"id\":\"m1\",\"content\":\"Ol\xC3"[..]),
        Ok(&b"\xA1\"}},\"metadata\":{\"langgraph_node\":\"plan\",\"run_id\":\"r1\"}}}\n"[..]),
        Ok(&b"{\"event\":\"events\",\"data\":{\"event\":\"on_chat_model_stream\",\"data\":{\"chunk\":{\"id\":\"m1\",\"content\":\"\",\"response_metadata\":{\"finish_reason\":\"stop\"}}},\"metadata\":{\"langgraph_node\":\"plan\",\"run_id\":\"r1\"}}}"[..]),
    ];
    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn cancel_run(
    State(state): State<Shared>,
    Path((_thread, run)): Path<(String, String)>,
) -> StatusCode {
    state.lock().expect("lock").cancels.push(run);
    StatusCode::NO_CONTENT
}

async fn spawn_platform() -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(Recorded::default()));
    let app = Router::new()
        .route("/threads", post(create_thread))
        .route("/threads/{id}", get(get_thread))
        .route("/threads/{id}/state", get(thread_state).post(update_state))
        .route("/threads/{id}/runs/stream", post(stream_run))
        .route("/threads/{id}/runs/{run}/cancel", post(cancel_run))
        .route("/assistants/search", post(search_assistants))
        .route("/assistants/{id}/schemas", get(schemas))
        .route("/assistants/{id}/graph", get(graph))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}/"), state)
}

#[tokio::test]
async fn creates_missing_thread_and_reads_assistant_metadata() {
    let (url, recorded) = spawn_platform().await;
    let platform = HttpAgentPlatform::new(url, Some("secret".to_string()));

    let fresh = platform
        .get_or_create_thread("a6c1e4d8-0000-4000-8000-000000000001")
        .await
        .expect("create thread");
    assert_eq!(fresh.values, json!({}));
    let known = platform
        .get_or_create_thread(KNOWN_THREAD)
        .await
        .expect("known thread");
    assert_eq!(known.values["x"], json!(1));
    assert_eq!(known.last_written_node(), Some("plan"));

    let assistant = platform
        .find_assistant(None, "writer")
        .await
        .expect("assistant");
    assert_eq!(assistant.assistant_id, "asst-2");
    let missing = platform
        .find_assistant(Some("nope"), "critic")
        .await
        .expect_err("missing assistant");
    assert!(missing.to_string().contains("No agent id found"));

    let keys = platform.schema_keys("asst-1").await.expect("schemas");
    assert_eq!(
        keys.output,
        Some(vec!["x".to_string(), "messages".to_string(), "copilotkit".to_string()])
    );
    let nodes = platform.graph_nodes("asst-1").await.expect("graph");
    assert_eq!(nodes, vec!["__start__", "plan", "__end__"]);

    platform.cancel_run(KNOWN_THREAD, "r1").await.expect("cancel");

    let recorded = recorded.lock().expect("lock");
    assert_eq!(
        recorded.created,
        vec![json!({"thread_id": "a6c1e4d8-0000-4000-8000-000000000001", "if_exists": "do_nothing"})]
    );
    assert_eq!(recorded.cancels, vec!["r1".to_string()]);
    assert!(recorded.auth.iter().all(|value| value == "Bearer secret"));
}

#[tokio::test]
async fn remote_agent_streams_ndjson_run_end_to_end() {
    let (url, recorded) = spawn_platform().await;
    let platform = Arc::new(HttpAgentPlatform::new(url, Some("secret".to_string())));
    let agent = RemoteAgent::new(
        platform,
        RemoteAgentConfig {
            name: "planner".to_string(),
            assistant_id: None,
            description: None,
        },
        RetryConfig::default(),
    );

    let bus = agent
        .start(RemoteAgentRequest {
            action_name: "planner".to_string(),
            args: json!({}),
            thread_id: Some(format!("ck-{KNOWN_THREAD}")),
            node_name: Some("plan".to_string()),
            messages: vec![Message::user("u1", "plan a trip")],
            additional_messages: Vec::new(),
            actions: Vec::new(),
            resume: None,
            cancel: CancellationToken::new(),
        })
        .await
        .expect("start");
    let events = bus.collect().await.expect("run completes");

    let kinds = events.iter().map(CanonicalEvent::kind).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec!["AgentStateSync", "TextStart", "TextContent", "TextEnd", "AgentStateSync"]
    );
    assert_eq!(
        events[2],
        CanonicalEvent::TextContent {
            message_id: "m1".to_string(),
            content: "Olá".to_string(),
        }
    );
    let CanonicalEvent::AgentStateSync { thread_id, node_name, state, active, .. } = &events[4] else {
        panic!("expected final state sync");
    };
    assert_eq!(thread_id, KNOWN_THREAD);
    assert_eq!(node_name, "__end__");
    assert!(!active);
    assert_eq!(state["messages"][0]["content"], json!("earlier question"));

    let recorded = recorded.lock().expect("lock");
    assert_eq!(recorded.updates.len(), 1, "continue mode pushes merged state");
    assert_eq!(recorded.updates[0]["as_node"], json!("plan"));
    let pushed = recorded.updates[0]["values"]["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|message| message["id"].clone())
        .collect::<Vec<_>>();
    assert_eq!(pushed, vec![json!("h0"), json!("u1")]);
    assert_eq!(recorded.runs.len(), 1);
    assert_eq!(recorded.runs[0]["input"], Value::Null);
    assert_eq!(recorded.runs[0]["stream_mode"], json!(["events", "values", "updates"]));
}

#[tokio::test]
async fn refused_connection_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let platform = HttpAgentPlatform::new(format!("http://{addr}"), None);
    let err = platform
        .thread_state(KNOWN_THREAD)
        .await
        .expect_err("nothing listening");
    assert_eq!(classify_transport_error(&err).code, ErrorCode::NetworkError);
}
