//! OpenAI-compatible chat completions over HTTP.

use std::time::Duration;

use {
    clawgate_config::schema::ProviderEntry,
    serde_json::{Value, json},
    tracing::debug,
};

use crate::{
    auth_profiles::Credential,
    model::{ModelReply, ModelRequest, ProviderError, Usage},
};

/// Base URLs for providers usable without an explicit `models.providers` entry.
pub fn default_base_url(provider: &str) -> Option<&'static str> {
    Some(match provider {
        "openai" => "https://api.openai.com/v1",
        "anthropic" => "https://api.anthropic.com/v1",
        "openrouter" => "https://openrouter.ai/api/v1",
        "groq" => "https://api.groq.com/openai/v1",
        "mistral" => "https://api.mistral.ai/v1",
        "ollama" => "http://127.0.0.1:11434/v1",
        _ => return None,
    })
}

/// `OPENAI_API_KEY`-style fallback when a provider has no profiles.
fn ambient_key(provider: &str) -> Option<String> {
    let var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
    std::env::var(var).ok().filter(|k| !k.is_empty())
}

pub struct HttpProvider {
    name: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, name: &str, entry: &ProviderEntry) -> Self {
        let base_url = if entry.base_url.is_empty() {
            default_base_url(name).unwrap_or_default().to_string()
        } else {
            entry.base_url.trim_end_matches('/').to_string()
        };
        Self {
            name: name.to_string(),
            base_url,
            timeout: Duration::from_millis(entry.timeout_ms),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn body(model: &str, req: &ModelRequest) -> Value {
        let mut messages = Vec::with_capacity(req.messages.len() + 2);
        if let Some(system) = req.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for m in &req.messages {
            messages.push(json!({ "role": m.role, "content": m.content }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));
        json!({ "model": model, "messages": messages, "stream": false })
    }

    pub async fn complete(
        &self,
        model: &str,
        credential: Option<&Credential>,
        req: &ModelRequest,
    ) -> Result<ModelReply, ProviderError> {
        if self.base_url.is_empty() {
            return Err(ProviderError::failed(None, format!("provider '{}' has no baseUrl", self.name)));
        }
        if model.is_empty() {
            return Err(ProviderError::failed(None, format!("no model given for provider '{}'", self.name)));
        }

        let timeout = if self.timeout.is_zero() {
            req.timeout
        } else {
            self.timeout.min(req.timeout)
        };
        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .json(&Self::body(model, req));
        let key = credential.map(|c| c.bearer().to_string()).or_else(|| ambient_key(&self.name));
        if let Some(key) = key {
            request = request.bearer_auth(key);
        }

        debug!(provider = %self.name, model, "sending completion");
        let send = async {
            let resp = request.send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            Ok::<_, reqwest::Error>((status, text))
        };
        let (status, text) = tokio::select! {
            res = send => res.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(timeout)
                } else {
                    ProviderError::failed(e.status().map(|s| s.as_u16()), e.to_string())
                }
            })?,
            () = req.cancel.cancelled() => return Err(ProviderError::cancelled()),
        };

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .or_else(|| body["error"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}: {}", text.trim()));
            return Err(ProviderError::failed(Some(status.as_u16()), message));
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::failed(None, "response carried no message content"))?;
        let usage = body.get("usage").map(|u| Usage {
            input_tokens: u["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });

        Ok(ModelReply {
            text: content.to_string(),
            model: format!("{}/{model}", self.name),
            profile_id: None,
            usage,
        })
    }
}
