use std::fmt;
use std::future::Future;
use std::time::Instant;

pub mod extract;
pub mod openai;

pub use extract::{ExtractError, extract_script};
pub use openai::{OpenAiChatModel, OpenAiConfig};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert in OpenSCAD. Given a user prompt describing a 3D printable model, \
generate a parametric OpenSCAD script that fulfills the description. \
Only return the raw .scad code without any explanations or markdown formatting.";

pub fn default_system_prompt() -> &'static str {
    DEFAULT_SYSTEM_PROMPT
}

/// Secret used to authenticate against the text-generation service.
///
/// Only ever held in memory; `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Returns `None` for blank input so an empty form field falls back to
    /// the process default.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest<'a> {
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub api_key: &'a ApiKey,
}

/// Transport to a text-generation service. Returns the raw completion text;
/// script extraction happens in [`ScriptGenerator`].
pub trait LanguageModel: Send + Sync {
    fn complete(
        &self,
        request: GenerationRequest<'_>,
    ) -> impl Future<Output = Result<String, GenerationError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("no API key was provided; enter one in the sidebar or set OPENAI_API_KEY")]
    MissingCredential,
    #[error("{}", transport_message(.status, .message))]
    Transport {
        status: Option<u16>,
        message: String,
    },
    #[error("{0}")]
    EmptyOrMalformed(String),
}

fn transport_message(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("text-generation service returned HTTP {status}: {message}"),
        None => format!("text-generation service unreachable: {message}"),
    }
}

impl GenerationError {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::EmptyPrompt => "empty_prompt",
            GenerationError::MissingCredential => "missing_credential",
            GenerationError::Transport { .. } => "transport",
            GenerationError::EmptyOrMalformed(_) => "empty_or_malformed",
        }
    }
}

impl From<ExtractError> for GenerationError {
    fn from(value: ExtractError) -> Self {
        GenerationError::EmptyOrMalformed(value.detail().to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedScript {
    pub source: String,
    pub elapsed_ms: f64,
}

pub struct ScriptGenerator<M: LanguageModel> {
    model: M,
    system_prompt: String,
}

impl<M: LanguageModel> ScriptGenerator<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Turns a prompt into an OpenSCAD program. Performs exactly one model
    /// call; re-prompting is left to the caller.
    pub async fn generate(
        &self,
        prompt: &str,
        api_key: Option<&ApiKey>,
    ) -> Result<GeneratedScript, GenerationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        let api_key = api_key.ok_or(GenerationError::MissingCredential)?;

        let start = Instant::now();
        let response = self
            .model
            .complete(GenerationRequest {
                system_prompt: &self.system_prompt,
                user_prompt: prompt,
                api_key,
            })
            .await?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let source = extract_script(&response).inspect_err(|err| {
            tracing::warn!(
                response_len = response.len(),
                reason = err.detail(),
                "discarding model response"
            );
        })?;
        tracing::debug!(script_len = source.len(), elapsed_ms, "generated OpenSCAD script");

        Ok(GeneratedScript { source, elapsed_ms })
    }
}
