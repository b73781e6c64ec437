//! Model failover: rotate auth profiles within a provider, then walk the
//! configured fallback models, before giving up with [`FailoverError::AllModelsFailed`].

use std::{collections::HashSet, fmt};

use {
    async_trait::async_trait,
    serde::Serialize,
    tracing::{info, warn},
};

use crate::{
    auth_profiles::{AuthProfileStore, Credential, FailureReason, Selection, SkipReason},
    model::{ModelRef, ModelRegistry, ModelReply, ModelRequest, ProviderError, ProviderErrorKind},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Failed { reason: FailureReason, message: String },
    Skipped { skip: SkipReason },
    Unavailable { message: String },
}

/// One step of a failover run, kept for the terminal error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.model)?;
        if let Some(p) = &self.profile_id {
            write!(f, " [{p}]")?;
        }
        match &self.outcome {
            AttemptOutcome::Failed { reason, message } => write!(f, " {reason}: {message}"),
            AttemptOutcome::Skipped { skip } => write!(f, " skipped: {skip}"),
            AttemptOutcome::Unavailable { message } => write!(f, " unavailable: {message}"),
        }
    }
}

fn summarize(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "no candidates configured".into();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("all models failed: {}", summarize(attempts))]
    AllModelsFailed { attempts: Vec<Attempt> },
    #[error("cancelled")]
    Cancelled,
}

/// What failover needs from the model layer.
#[async_trait]
pub trait ModelCaller: Send + Sync {
    /// `None` when the provider is unknown; otherwise whether it rotates auth profiles.
    fn uses_profiles(&self, model: &ModelRef) -> Option<bool>;

    async fn call(
        &self,
        model: &ModelRef,
        credential: Option<&Credential>,
        req: &ModelRequest,
    ) -> Result<ModelReply, ProviderError>;
}

#[async_trait]
impl ModelCaller for ModelRegistry {
    fn uses_profiles(&self, model: &ModelRef) -> Option<bool> {
        self.resolve(&model.provider).map(|b| b.uses_profiles())
    }

    async fn call(
        &self,
        model: &ModelRef,
        credential: Option<&Credential>,
        req: &ModelRequest,
    ) -> Result<ModelReply, ProviderError> {
        let backend = self
            .resolve(&model.provider)
            .ok_or_else(|| ProviderError::failed(None, format!("unknown provider '{}'", model.provider)))?;
        backend.complete(&model.model, credential, req).await
    }
}

fn failed(model: &ModelRef, profile_id: Option<String>, e: &ProviderError) -> Attempt {
    Attempt {
        model: model.to_string(),
        profile_id,
        outcome: AttemptOutcome::Failed {
            reason: e.reason(),
            message: e.message.clone(),
        },
    }
}

/// Try each candidate (`provider/model`) in order until one answers.
pub async fn run_with_failover(
    caller: &dyn ModelCaller,
    profiles: &AuthProfileStore,
    candidates: &[String],
    req: &ModelRequest,
) -> Result<ModelReply, FailoverError> {
    let mut attempts = Vec::new();

    for raw in candidates {
        if req.cancel.is_cancelled() {
            return Err(FailoverError::Cancelled);
        }
        let model = ModelRef::parse(raw);
        let Some(rotates) = caller.uses_profiles(&model) else {
            attempts.push(Attempt {
                model: model.to_string(),
                profile_id: None,
                outcome: AttemptOutcome::Unavailable {
                    message: format!("unknown provider '{}'", model.provider),
                },
            });
            continue;
        };

        if !rotates {
            match caller.call(&model, None, req).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.kind == ProviderErrorKind::Cancelled => return Err(FailoverError::Cancelled),
                Err(e) => {
                    warn!(model = %model, error = %e, "model call failed");
                    attempts.push(failed(&model, None, &e));
                },
            }
            continue;
        }

        let mut tried = HashSet::new();
        loop {
            match profiles.next_usable(&model.provider).await {
                Selection::NoProfiles => {
                    match caller.call(&model, None, req).await {
                        Ok(reply) => return Ok(reply),
                        Err(e) if e.kind == ProviderErrorKind::Cancelled => {
                            return Err(FailoverError::Cancelled);
                        },
                        Err(e) => {
                            warn!(model = %model, error = %e, "model call failed");
                            attempts.push(failed(&model, None, &e));
                        },
                    }
                    break;
                },
                Selection::Exhausted(skipped) => {
                    attempts.extend(skipped.into_iter().filter(|s| !tried.contains(&s.id)).map(|s| {
                        Attempt {
                            model: model.to_string(),
                            profile_id: Some(s.id),
                            outcome: AttemptOutcome::Skipped { skip: s.reason },
                        }
                    }));
                    break;
                },
                Selection::Profile(profile) => {
                    // A zero cooldown would hand the same profile back forever.
                    if !tried.insert(profile.id.clone()) {
                        break;
                    }
                    match caller.call(&model, Some(&profile.credential), req).await {
                        Ok(mut reply) => {
                            if let Err(e) = profiles.mark_success(&profile.id).await {
                                warn!(profile = %profile.id, error = %e, "failed to record success");
                            }
                            reply.profile_id = Some(profile.id);
                            return Ok(reply);
                        },
                        Err(e) if e.kind == ProviderErrorKind::Cancelled => {
                            return Err(FailoverError::Cancelled);
                        },
                        Err(e) => {
                            if let Err(err) = profiles.mark_failure(&profile.id, e.reason()).await {
                                warn!(profile = %profile.id, error = %err, "failed to record failure");
                            }
                            attempts.push(failed(&model, Some(profile.id), &e));
                        },
                    }
                },
            }
        }
        info!(model = %model, "falling back to next model");
    }

    Err(FailoverError::AllModelsFailed { attempts })
}
