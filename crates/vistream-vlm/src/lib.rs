// vistream-vlm/src/lib.rs
// ============================================================
// vistream-vlm  –  Inference client boundary
// Sends one frame + prompt to an OpenAI-compatible VLM endpoint
// (vLLM, SGLang, Ollama, ...) and returns the caption text plus
// token usage.  The relay's worker is the only caller.
// ------------------------------------------------------------
// Public API
//   * VlmClient            – trait the scheduler dispatches on
//   * HttpVlmClient::new() – reqwest-backed implementation
//   * MockVlmClient        – scripted client for tests/demos
// ------------------------------------------------------------
// Build notes
//   * The HTTP timeout lives on the reqwest client, so every
//     call resolves: success, API error, or timeout.  Nothing
//     upstream ever waits on a hung request forever.
// ============================================================

//! vistream – inference client layer
//!
//! This crate provides a backend-agnostic [`VlmClient`] trait plus a
//! concrete **`HttpVlmClient`** that speaks the OpenAI chat-completions
//! dialect with the frame embedded as a base64 JPEG data URL.  Swapping
//! in another backend is a matter of implementing the trait – the relay
//! never sees past it.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use vistream_frame::Frame;

#[derive(Error, Debug)]
pub enum VlmError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP transport error: {0}")]
    Http(#[source] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("{0}")]
    Scripted(String),
}

pub type Result<T> = std::result::Result<T, VlmError>;

/// Everything captured atomically at submission time.
///
/// The frame is held by value but its pixel buffer is shared, so an
/// in-flight request costs one `Arc` bump, not a pixel copy.
#[derive(Debug, Clone)]
pub struct VlmRequest {
    pub frame: Frame,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
}

/// Successful backend reply.  Token counts are whatever the backend
/// reported; local servers sometimes omit `usage` entirely.
#[derive(Debug, Clone)]
pub struct VlmOutput {
    pub text: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Trait for VLM backends.
#[async_trait]
pub trait VlmClient: Send + Sync {
    async fn describe(&self, req: &VlmRequest) -> Result<VlmOutput>;
}

// ------------------------------------------------------------
// HTTP implementation (OpenAI chat-completions dialect)
// ------------------------------------------------------------

pub struct HttpVlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    timeout: Duration,
}

impl HttpVlmClient {
    /// Build a client against `api_base` (e.g. `http://localhost:8000/v1`).
    /// Use `"EMPTY"` as the key for local servers.
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(VlmError::Http)?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        })
    }
}

#[async_trait]
impl VlmClient for HttpVlmClient {
    async fn describe(&self, req: &VlmRequest) -> Result<VlmOutput> {
        let jpeg = encode_jpeg(&req.frame)?;
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&jpeg)
        );

        let body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": req.prompt },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
        });

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VlmError::Timeout(self.timeout)
                } else {
                    VlmError::Http(e)
                }
            })?;

        let status = resp.status();
        let text = resp.text().await.map_err(VlmError::Http)?;
        if !status.is_success() {
            return Err(VlmError::Api { status: status.as_u16(), body: text });
        }
        parse_chat_response(&text)
    }
}

/// JPEG-encode an RGB24 frame without copying the pixel buffer.
fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let expected = frame.width as usize * frame.height as usize * 3;
    if frame.pixels.len() != expected {
        return Err(VlmError::Encode(format!(
            "pixel buffer is {} bytes, expected {}",
            frame.pixels.len(),
            expected
        )));
    }
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 80)
        .encode(
            frame.pixels.as_slice(),
            frame.width,
            frame.height,
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| VlmError::Encode(e.to_string()))?;
    Ok(buf)
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

fn parse_chat_response(body: &str) -> Result<VlmOutput> {
    let parsed: ChatResponse =
        serde_json::from_str(body).map_err(|e| VlmError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| VlmError::Decode("response has no choices".into()))?;
    let text = choice
        .message
        .content
        .ok_or_else(|| VlmError::Decode("choice has no message content".into()))?;
    let (pt, ct) = match parsed.usage {
        Some(u) => (u.prompt_tokens, u.completion_tokens),
        None => (None, None),
    };
    Ok(VlmOutput { text, prompt_tokens: pt, completion_tokens: ct })
}

// ------------------------------------------------------------
// Scripted client for tests and the offline demo
// ------------------------------------------------------------

/// Replies from a script, then from a fixed fallback.  Each call sleeps
/// for `delay` first, so tests can model a slow backend.
pub struct MockVlmClient {
    delay: Duration,
    script: Mutex<VecDeque<std::result::Result<String, String>>>,
    fallback: String,
    calls: AtomicUsize,
    seen: Mutex<Vec<u64>>,
}

impl MockVlmClient {
    pub fn new(delay: Duration, fallback: impl Into<String>) -> Self {
        Self {
            delay,
            script: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue one scripted reply (`Ok` text or `Err` message).
    pub fn push(&self, reply: std::result::Result<String, String>) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Number of `describe` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sequence numbers of the frames submitted so far, in call order.
    pub fn seen_seqs(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl VlmClient for MockVlmClient {
    async fn describe(&self, req: &VlmRequest) -> Result<VlmOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(req.frame.seq);
        tokio::time::sleep(self.delay).await;
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => Ok(VlmOutput { text, prompt_tokens: None, completion_tokens: None }),
            Some(Err(msg)) => Err(VlmError::Scripted(msg)),
            None => Ok(VlmOutput {
                text: self.fallback.clone(),
                prompt_tokens: None,
                completion_tokens: None,
            }),
        }
    }
}
