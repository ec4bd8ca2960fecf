//! HTTP transport tests against a mock chat-completions server.

use std::fmt::Write as _;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use parley_client::{
    chat_completion, ChatConfig, ChatError, CompletionOptions, CompletionRequest,
    ConversationController, HttpTransport, RequestOutcome, RequestPhase, Transport,
    TransportError,
};
use parley_core::Message;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(records: &[serde_json::Value]) -> String {
    let mut body = String::new();
    for record in records {
        write!(body, "data: {record}\n\n").unwrap();
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn delta(content: &str) -> serde_json::Value {
    json!({ "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }] })
}

async fn mount_stream(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({ "stream": true })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(server)
        .await;
}

fn config_for(server: &MockServer) -> ChatConfig {
    ChatConfig::default()
        .with_base_url(server.uri())
        .with_body_field("model", "llama3")
}

#[tokio::test]
async fn open_stream_delivers_body() {
    let server = MockServer::start().await;
    let body = sse(&[delta("Hello"), delta(" there")]);
    mount_stream(&server, body.clone()).await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).unwrap();
    let request = CompletionRequest::streaming(
        config.completions_url(),
        &config.body,
        &[Message::user("Hi")],
    )
    .unwrap();

    let mut stream = transport.open_stream(request).await.unwrap();
    let mut received = Vec::new();
    while let Some(chunk) = stream.next().await {
        received.extend(chunk.unwrap());
    }

    assert_eq!(String::from_utf8(received).unwrap(), body);
}

#[tokio::test]
async fn error_status_becomes_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": { "message": "model 'llama3' not found", "type": "invalid_request_error" }
        })))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).unwrap();
    let request =
        CompletionRequest::streaming(config.completions_url(), &config.body, &[]).unwrap();

    let err = transport.open_stream(request).await.err().unwrap();
    assert_eq!(
        err,
        TransportError::Api {
            status: 404,
            message: "model 'llama3' not found".into()
        }
    );
}

#[tokio::test]
async fn plain_text_error_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway\n"))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).unwrap();
    let request =
        CompletionRequest::streaming(config.completions_url(), &config.body, &[]).unwrap();

    match transport.open_stream(request).await {
        Err(TransportError::Api { status, message }) => {
            assert_eq!(status, 502);
            assert_eq!(message, "bad gateway");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected an error"),
    }
}

#[tokio::test]
async fn unreachable_server_is_http_error() {
    let config = ChatConfig::default().with_base_url("http://127.0.0.1:1");
    let transport = HttpTransport::new(&config).unwrap();
    let request =
        CompletionRequest::streaming(config.completions_url(), &config.body, &[]).unwrap();

    assert!(matches!(
        transport.open_stream(request).await,
        Err(TransportError::Http(_))
    ));
}

#[tokio::test]
async fn one_shot_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({
            "model": "llama3",
            "temperature": 0.35,
            "max_tokens": 32,
            "messages": [{ "role": "user", "content": "Name a colour" }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": " Teal.\n" } }],
            "usage": { "prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = HttpTransport::new(&config).unwrap();

    let reply = chat_completion(
        &transport,
        &config,
        CompletionOptions::new(vec![Message::user("Name a colour")]).with_max_tokens(32),
    )
    .await
    .unwrap();

    assert_eq!(reply, "Teal.");
}

#[tokio::test]
async fn conversation_end_to_end() {
    let server = MockServer::start().await;
    mount_stream(&server, sse(&[delta("Hello"), delta(" there")])).await;

    let config = config_for(&server);
    let transport = Arc::new(HttpTransport::new(&config).unwrap());
    let finished = Arc::new(Mutex::new(0_usize));

    let controller = ConversationController::builder(transport)
        .with_config(config)
        .with_initial_messages(vec![Message::system("Be brief")])
        .with_on_finish({
            let finished = Arc::clone(&finished);
            move |messages: &[Message]| *finished.lock() = messages.len()
        })
        .build()
        .unwrap();

    let handle = controller.submit("Hi").await.unwrap();
    assert!(matches!(handle.wait().await, RequestOutcome::Completed));

    let messages = controller.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[2].content, "Hello there");
    assert!(!controller.is_loading());
    assert_eq!(controller.phase(), RequestPhase::Completed);
    assert_eq!(*finished.lock(), 3);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = requests[0].body_json().unwrap();
    assert_eq!(body["model"], "llama3");
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "Hi");
    assert_eq!(body["messages"][2]["content"], "");
}

#[tokio::test]
async fn conversation_reports_rejected_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "out of memory" })))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let transport = Arc::new(HttpTransport::new(&config).unwrap());
    let controller = ConversationController::new(transport, config);

    let err = controller.submit("Hi").await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Transport(TransportError::Api { status: 500, ref message }) if message == "out of memory"
    ));
    assert_eq!(controller.messages().len(), 2);
    assert!(!controller.is_loading());
}
