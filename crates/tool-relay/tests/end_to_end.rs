//! End-to-end scenarios driving a real relay over a real TCP listener,
//! using the peer multiplexer on both the provider and caller sides —
//! the same way a provider and an agent would actually talk to it.

use std::time::Duration;

use tool_relay::config::{PeerConfig, RelayConfig};
use tool_relay::peer::{HandlerValue, PeerMultiplexer, Role};
use tool_relay::relay::{transport, Relay};

async fn spawn_relay() -> String {
    let config = RelayConfig { request_timeout: Duration::from_millis(300), ..RelayConfig::default() };
    let relay = Relay::new(config);
    let router = transport::create_router(relay);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    // Give the accept loop a moment to start listening.
    tokio::time::sleep(Duration::from_millis(20)).await;
    format!("http://{addr}")
}

fn peer(server_url: &str, session_id: &str, role: Role) -> PeerMultiplexer {
    PeerMultiplexer::new(PeerConfig::new(server_url).with_session_id(session_id), role)
}

#[tokio::test]
async fn echo_round_trip_through_a_provider() {
    let server_url = spawn_relay().await;
    let session_id = "session-echo";

    let provider = peer(&server_url, session_id, Role::Provider);
    provider.attach().await.unwrap();
    provider.register_handler(
        "echo",
        None,
        |params: serde_json::Value| async move { Ok(HandlerValue::Json(params)) },
    );
    provider.register_tools(None).await.unwrap();

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let result = caller
        .request("tools/call", Some(serde_json::json!({"name": "echo", "arguments": {"text": "hi"}})))
        .await
        .unwrap();

    assert_eq!(result["isError"], false);
    assert_eq!(result["content"][0]["text"], serde_json::json!({"text": "hi"}).to_string());
}

#[tokio::test]
async fn tools_call_with_no_provider_attached_returns_session_error() {
    let server_url = spawn_relay().await;
    let caller = peer(&server_url, "session-no-provider", Role::Caller);
    caller.attach().await.unwrap();

    let err = caller
        .request("tools/call", Some(serde_json::json!({"name": "anything"})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, tool_relay::ErrorKind::Session);
}

#[tokio::test]
async fn calling_an_unregistered_tool_reports_tool_not_found() {
    let server_url = spawn_relay().await;
    let session_id = "session-unknown-tool";

    let provider = peer(&server_url, session_id, Role::Provider);
    provider.attach().await.unwrap();
    provider.register_tools(Some(vec![])).await.unwrap();

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let result = caller
        .request("tools/call", Some(serde_json::json!({"name": "missing"})))
        .await
        .unwrap();

    assert_eq!(result["isError"], true);
}

/// A bare SSE client that attaches as a provider and then reads its
/// channel without ever posting a reply — the multiplexer always answers
/// inbound requests, so genuinely simulating a hung provider means going
/// beneath it to the wire.
async fn attach_silent_provider(server_url: &str, session_id: &str) {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{server_url}/events?sessionId={session_id}&role=provider"))
        .send()
        .await
        .unwrap();
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        while futures::StreamExt::next(&mut stream).await.is_some() {
            // Drain the stream to keep the connection open; never reply.
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Read one SSE frame's JSON payload off a raw byte stream, skipping
/// keep-alive comment lines. Returns `None` once the stream itself ends
/// (the server closed the channel).
async fn next_sse_message(
    buffer: &mut String,
    stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
) -> Option<serde_json::Value> {
    loop {
        if let Some(pos) = buffer.find("\n\n") {
            let frame = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            if frame.starts_with(':') {
                continue;
            }
            let data = frame
                .lines()
                .find_map(|l| l.strip_prefix("data: ").or_else(|| l.strip_prefix("data:")));
            if let Some(data) = data {
                return serde_json::from_str(data).ok();
            }
            continue;
        }
        match futures::StreamExt::next(stream).await {
            Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
            _ => return None,
        }
    }
}

#[tokio::test]
async fn a_request_forwarded_to_a_silent_provider_times_out() {
    let server_url = spawn_relay().await;
    let session_id = "session-timeout";

    attach_silent_provider(&server_url, session_id).await;

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let err = caller
        .request("tools/call", Some(serde_json::json!({"name": "slow"})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, tool_relay::ErrorKind::Timeout);
}

/// The relay's forward timeout (300ms here) and the provider's eventual
/// reply are racing independently; whichever resolves the pending route
/// first wins, and `HashMap::remove`'s at-most-once semantics mean the
/// loser is silently ignored rather than double-delivered or crashing.
#[tokio::test]
async fn late_provider_reply_after_relay_timeout_is_silently_dropped() {
    let server_url = spawn_relay().await;
    let session_id = "session-late-reply";

    let provider = peer(&server_url, session_id, Role::Provider);
    provider.attach().await.unwrap();
    provider.register_handler(
        "slow",
        None,
        |_: serde_json::Value| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(HandlerValue::Text("too-late".to_string()))
        },
    );
    provider.register_tools(None).await.unwrap();

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let err = caller
        .request("tools/call", Some(serde_json::json!({"name": "slow"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind, tool_relay::ErrorKind::Timeout);

    // Give the provider's late reply time to land after the route it would
    // have resolved is already gone, then confirm the session still routes
    // fine for a later, well-behaved call.
    tokio::time::sleep(Duration::from_millis(300)).await;

    provider.register_handler(
        "ping-back",
        None,
        |_: serde_json::Value| async move { Ok(HandlerValue::Text("alive".to_string())) },
    );
    provider.register_tools(None).await.unwrap();
    let result = caller
        .request("tools/call", Some(serde_json::json!({"name": "ping-back"})))
        .await
        .unwrap();
    assert_eq!(result["isError"], false);
}

/// `tools/list` is the one method the relay answers from cache on forward
/// timeout instead of failing (spec's availability fallback); every other
/// forwarded method just times out, as the sibling test above confirms.
#[tokio::test]
async fn a_silent_providers_tools_list_falls_back_to_the_cached_catalogue() {
    let server_url = spawn_relay().await;
    let session_id = "session-tools-list-timeout";

    attach_silent_provider(&server_url, session_id).await;

    let tool = serde_json::json!({
        "name": "sample",
        "description": "a cached tool",
        "inputSchema": {"type": "object"},
    });
    let client = reqwest::Client::new();
    client
        .post(format!("{server_url}/message?sessionId={session_id}"))
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/register",
            "params": { "tools": [tool] },
        }))
        .send()
        .await
        .unwrap();
    // Let the registration land before the caller's tools/list races it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let result = caller.request("tools/list", None).await.unwrap();
    let tools = result["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "sample");
}

#[tokio::test]
async fn a_second_provider_takes_over_and_evicts_the_first() {
    let server_url = spawn_relay().await;
    let session_id = "session-takeover";

    let client = reqwest::Client::new();
    let incumbent_response = client
        .get(format!("{server_url}/events?sessionId={session_id}&role=provider"))
        .send()
        .await
        .unwrap();
    let mut incumbent_stream = incumbent_response.bytes_stream();
    let mut incumbent_buffer = String::new();
    let connected = next_sse_message(&mut incumbent_buffer, &mut incumbent_stream).await.unwrap();
    assert_eq!(connected["method"], "connected");

    let challenger = peer(&server_url, session_id, Role::Provider);
    challenger.attach().await.unwrap();
    challenger.register_handler(
        "ready",
        None,
        |_: serde_json::Value| async move { Ok(HandlerValue::Text("ready".to_string())) },
    );
    challenger.register_tools(None).await.unwrap();

    let takeover_error = next_sse_message(&mut incumbent_buffer, &mut incumbent_stream).await.unwrap();
    assert_eq!(takeover_error["error"]["code"], -32002);
    assert!(
        next_sse_message(&mut incumbent_buffer, &mut incumbent_stream).await.is_none(),
        "incumbent's channel should close once the terminal error has been delivered"
    );

    let caller = peer(&server_url, session_id, Role::Caller);
    caller.attach().await.unwrap();

    let result = caller
        .request("tools/call", Some(serde_json::json!({"name": "ready"})))
        .await
        .unwrap();
    assert_eq!(result["isError"], false);

    let joiner = peer(&server_url, "session-takeover-home", Role::Caller);
    joiner.attach().await.unwrap();
    let join_result = joiner
        .request("session/join", Some(serde_json::json!({"sessionId": session_id})))
        .await
        .unwrap();
    assert_eq!(join_result["success"], true);

    let ping_result = joiner.request("ping", None).await.unwrap();
    assert_eq!(ping_result["pong"], true);
}

#[tokio::test]
async fn concurrent_callers_fan_in_to_one_provider() {
    let server_url = spawn_relay().await;
    let session_id = "session-fan-in";

    let provider = peer(&server_url, session_id, Role::Provider);
    provider.attach().await.unwrap();
    provider.register_handler(
        "double",
        None,
        |params: serde_json::Value| async move {
            let n = params.get("n").and_then(serde_json::Value::as_i64).unwrap_or(0);
            Ok(HandlerValue::Json(serde_json::json!({ "doubled": n * 2 })))
        },
    );
    provider.register_tools(None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let server_url = server_url.clone();
        let session_id = session_id.to_string();
        handles.push(tokio::spawn(async move {
            let caller = peer(&server_url, &session_id, Role::Caller);
            caller.attach().await.unwrap();
            caller
                .request("tools/call", Some(serde_json::json!({"name": "double", "arguments": {"n": i}})))
                .await
                .unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap();
        let doubled_text = result["content"][0]["text"].as_str().unwrap();
        let doubled: serde_json::Value = serde_json::from_str(doubled_text).unwrap();
        assert_eq!(doubled["doubled"], (i as i64) * 2);
    }
}

#[tokio::test]
async fn caller_can_join_a_different_session() {
    let server_url = spawn_relay().await;

    let provider = peer(&server_url, "session-target", Role::Provider);
    provider.attach().await.unwrap();
    provider.register_tools(Some(vec![])).await.unwrap();

    let caller = peer(&server_url, "session-home", Role::Caller);
    caller.attach().await.unwrap();

    let result = caller
        .request("session/join", Some(serde_json::json!({"sessionId": "session-target"})))
        .await
        .unwrap();

    assert_eq!(result["success"], true);
    assert_eq!(result["sessionId"], "session-target");
}

#[tokio::test]
async fn joining_an_unknown_session_reports_a_session_error() {
    let server_url = spawn_relay().await;
    let caller = peer(&server_url, "session-home-2", Role::Caller);
    caller.attach().await.unwrap();

    let err = caller
        .request("session/join", Some(serde_json::json!({"sessionId": "no-such-session"})))
        .await
        .unwrap_err();

    assert_eq!(err.kind, tool_relay::ErrorKind::Session);
}

#[tokio::test]
async fn health_and_sessions_probes_reflect_live_state() {
    let server_url = spawn_relay().await;
    let session_id = "session-probe";

    let provider = peer(&server_url, session_id, Role::Provider);
    provider.attach().await.unwrap();

    let client = reqwest::Client::new();
    let health: serde_json::Value =
        client.get(format!("{server_url}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert!(health["sessions"].as_u64().unwrap() >= 1);

    let sessions: serde_json::Value =
        client.get(format!("{server_url}/sessions")).send().await.unwrap().json().await.unwrap();
    let found = sessions["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["id"] == session_id && s["hasProvider"] == true);
    assert!(found, "expected session-probe to show a connected provider");
}
