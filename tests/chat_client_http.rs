//! Chat client transport against a mock OpenAI-compatible server.
//!
//! The client shells out to `curl`; tests are skipped when it is missing.

use std::process::Command;

use droid_repro::llm::judge::judge_with_retry;
use droid_repro::llm::{ChatClient, ChatConfig, Judge, JudgeRequest, LlmError, Purpose, RetryPolicy, check_health};
use httpmock::Method;
use httpmock::prelude::*;
use serde_json::json;

const PATH: &str = "/v1/chat/completions";

fn curl_available() -> bool {
    Command::new("curl").arg("--version").output().is_ok()
}

fn client(server: &MockServer, stream: bool) -> ChatClient {
    ChatClient::new(
        ChatConfig::new(server.url(PATH))
            .model("test-model")
            .api_key(Some("sk-test".to_string()))
            .timeout(10)
            .stream(stream),
    )
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128 }
    })
}

#[test]
fn test_blocking_completion_and_usage() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path(PATH);
        then.status(200)
            .header("content-type", "application/json")
            .json_body(completion(r#"{"ranked": [2, 0]}"#));
    });

    let client = client(&server, false);
    let text = client.judge(&JudgeRequest::new(Purpose::Filter, "rank these")).unwrap();
    assert_eq!(text, r#"{"ranked": [2, 0]}"#);
    mock.assert();

    let usage = client.usage();
    assert_eq!(usage.model, "test-model");
    assert_eq!(usage.total.calls, 1);
    assert_eq!(usage.total.prompt_tokens, 120);
    assert_eq!(usage.by_purpose["filter"].completion_tokens, 8);
}

#[test]
fn test_http_errors_map_to_llm_errors() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/limited");
        then.status(429).body(r#"{"error": {"message": "rate limit reached"}}"#);
    });
    server.mock(|when, then| {
        when.method(POST).path("/broken");
        then.status(500).body("upstream exploded");
    });
    server.mock(|when, then| {
        when.method(POST).path("/empty");
        then.status(200).json_body(completion("   "));
    });

    let request = JudgeRequest::new(Purpose::Validate, "done?");
    let at = |path: &str| ChatClient::new(ChatConfig::new(server.url(path)).api_key(None).timeout(10).stream(false));

    assert_eq!(at("/limited").judge(&request), Err(LlmError::RateLimited));
    match at("/broken").judge(&request) {
        Err(LlmError::Transport(message)) => assert!(message.contains("HTTP 500"), "{}", message),
        other => panic!("expected a transport error, got {:?}", other),
    }
    assert_eq!(at("/empty").judge(&request), Err(LlmError::Empty));
}

#[test]
fn test_streaming_completion_concatenates_deltas() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    let events = [
        json!({"choices": [{"delta": {"role": "assistant"}}]}),
        json!({"choices": [{"delta": {"content": "{\"reproduced\": "}}]}),
        json!({"choices": [{"delta": {"content": "true}"}}]}),
        json!({"choices": [], "usage": {"prompt_tokens": 50, "completion_tokens": 6}}),
    ];
    let mut body: String = events.iter().map(|e| format!("data: {}\n\n", e)).collect();
    body.push_str("data: [DONE]\n\n");
    let mock = server.mock(|when, then| {
        when.method(POST).path(PATH);
        then.status(200).header("content-type", "text/event-stream").body(body);
    });

    let client = client(&server, true);
    let text = client.judge(&JudgeRequest::new(Purpose::Validate, "done?")).unwrap();
    assert_eq!(text, r#"{"reproduced": true}"#);
    mock.assert();
    assert_eq!(client.usage().by_purpose["validate"].prompt_tokens, 50);
}

#[test]
fn test_streaming_falls_back_when_server_ignores_stream() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path(PATH);
        then.status(200).json_body(completion(r#"{"input": "Groceries"}"#));
    });

    let text = client(&server, true).judge(&JudgeRequest::new(Purpose::Input, "value?")).unwrap();
    assert_eq!(text, r#"{"input": "Groceries"}"#);
    mock.assert_calls(2);
}

#[test]
fn test_retry_reads_fenced_json() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path(PATH);
        then.status(200)
            .json_body(completion("Here you go:\n```json\n{\"promising\": [1], \"completed\": []}\n```"));
    });

    let client = client(&server, false);
    let request = JudgeRequest::new(Purpose::Evaluate, "which paths?");
    let judgment = judge_with_retry(&client, &request, &RetryPolicy::default(), "JSON only", |value| {
        value["promising"].as_array().map(|a| a.len()).ok_or_else(|| "missing".to_string())
    });
    assert_eq!(judgment.value, Some(1));
    assert_eq!(judgment.attempts.len(), 1);
}

#[test]
fn test_health_check() {
    if !curl_available() {
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(Method::HEAD);
        then.status(404);
    });

    assert_eq!(check_health(&server.url(PATH), 5), Ok(true));
    assert_eq!(check_health("http://127.0.0.1:1/v1/chat/completions", 2), Ok(false));
}
