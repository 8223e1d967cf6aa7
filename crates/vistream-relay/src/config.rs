// vistream-relay/src/config.rs
// Runtime configuration plus the inbound control-message boundary.
// Validation is synchronous and all-or-nothing: a rejected message
// leaves the prior configuration untouched.

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("process_every_n_frames must be positive, got {0}")]
    InvalidInterval(i64),
    #[error("max_tokens must be positive, got {0}")]
    InvalidMaxTokens(i64),
    #[error("model must not be empty")]
    EmptyModel,
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("malformed control message: {0}")]
    Malformed(String),
}

/// Live-tunable scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Offer every Nth frame to the inference slot.
    pub every_n: u32,
    pub prompt: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            every_n: 30,
            prompt: "Describe what you see in this image in one sentence.".into(),
            model: "llava:7b".into(),
            max_tokens: 128,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.every_n == 0 {
            return Err(ConfigError::InvalidInterval(0));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::InvalidMaxTokens(0));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        if self.prompt.trim().is_empty() {
            return Err(ConfigError::EmptyPrompt);
        }
        Ok(())
    }

    pub fn with_every_n(mut self, n: u32) -> Self {
        self.every_n = n;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

/// Inbound control message.  Fields are independent; absent fields
/// leave the current value alone, unknown fields are ignored by serde.
/// Integers deserialize as `i64` so negative values are rejected with a
/// proper error instead of a type mismatch.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ControlMsg {
    pub prompt: Option<String>,
    pub max_tokens: Option<i64>,
    pub model: Option<String>,
    pub process_every_n_frames: Option<i64>,
}

impl ControlMsg {
    /// Merge this message into `current`, validating the result.
    /// Returns the candidate config without mutating anything.
    pub fn applied_to(&self, current: &RelayConfig) -> Result<RelayConfig, ConfigError> {
        let mut next = current.clone();

        if let Some(n) = self.process_every_n_frames {
            next.every_n =
                u32::try_from(n).ok().filter(|&n| n > 0).ok_or(ConfigError::InvalidInterval(n))?;
        }
        if let Some(t) = self.max_tokens {
            next.max_tokens =
                u32::try_from(t).ok().filter(|&t| t > 0).ok_or(ConfigError::InvalidMaxTokens(t))?;
        }
        if let Some(model) = &self.model {
            if model.trim().is_empty() {
                return Err(ConfigError::EmptyModel);
            }
            next.model = model.clone();
        }
        if let Some(prompt) = &self.prompt {
            if prompt.trim().is_empty() {
                return Err(ConfigError::EmptyPrompt);
            }
            next.prompt = prompt.clone();
        }

        next.validate()?;
        Ok(next)
    }
}
