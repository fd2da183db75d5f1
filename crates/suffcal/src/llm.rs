//! Chat completions against an OpenAI-compatible server (llama.cpp's
//! `llama-server` by default, started on demand with the cached GGUF model).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Send one system + user exchange, returning the assistant message
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    r#type: &'static str,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `/v1/chat/completions`
pub struct LlmClient {
    http: Client,
    base_url: String,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_tokens: 1024,
        })
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            messages: vec![
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: 0.0,
            top_p: 0.95,
            response_format: ResponseFormat {
                r#type: "json_object",
            },
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("status {}: {}", status, body)));
        }

        let response: ChatResponse = response.json().await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| Error::Llm("response contained no message".to_string()))
    }
}

/// A `llama-server` child process serving one model.
///
/// The process is killed when this value is dropped.
pub struct LlamaServer {
    child: Child,
    url: String,
}

impl LlamaServer {
    /// Start the server and wait until its health endpoint reports ready
    pub async fn spawn(binary: &str, model: &Path, port: u16, timeout: Duration) -> Result<Self> {
        tracing::info!(
            "Starting {} with model {} on port {}",
            binary,
            model.display(),
            port
        );

        let child = Command::new(binary)
            .arg("--model")
            .arg(model)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--chat-template")
            .arg("llama2")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Llm(format!("Failed to start {}: {}", binary, e)))?;

        let mut server = Self {
            child,
            url: format!("http://127.0.0.1:{}", port),
        };
        server.wait_until_ready(timeout).await?;
        Ok(server)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn wait_until_ready(&mut self, timeout: Duration) -> Result<()> {
        let http = Client::new();
        let health = format!("{}/health", self.url);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(Error::Llm(format!("llama-server exited early with {}", status)));
            }

            match http.get(&health).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!("llama-server ready at {}", self.url);
                    return Ok(());
                }
                // 503 while the model is loading
                Ok(_) | Err(_) => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Llm(format!(
                    "llama-server not ready after {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_complete_sends_json_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "temperature": 0.0,
                "max_tokens": 1024,
                "response_format": {"type": "json_object"},
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hello"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"Titel\": \"Fest\"}"}}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(&format!("{}/", server.uri())).unwrap();
        let answer = client.complete("sys", "hello").await.unwrap();
        assert_eq!(answer, "{\"Titel\": \"Fest\"}");
    }

    #[tokio::test]
    async fn test_empty_choices_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let client = LlmClient::new(&server.uri()).unwrap();
        let err = client.complete("sys", "hello").await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading model"))
            .mount(&server)
            .await;

        let client = LlmClient::new(&server.uri()).unwrap();
        let err = client.complete("sys", "hello").await.unwrap_err();
        assert!(err.to_string().contains("loading model"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = LlamaServer::spawn(
            "suffcal-no-such-llama-server",
            Path::new("model.gguf"),
            18080,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(Error::Llm(_))));
    }
}
