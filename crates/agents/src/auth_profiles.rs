//! Credential profiles per agent with cooldown-based rotation.
//!
//! Profiles live in `<stateDir>/agents/<agentId>/auth-profiles.json`. Every
//! selection and every success/failure mark is one locked read-check-write,
//! so concurrent turns never pick from stale rotation state.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    clawgate_config::schema::{CooldownConfig, ModelsConfig},
    dashmap::DashMap,
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::{debug, info, warn},
};

pub const PROFILES_FILE: &str = "auth-profiles.json";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("auth profile not found: {0}")]
    NotFound(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

mod secret_str {
    use {
        secrecy::{ExposeSecret, Secret},
        serde::Serializer,
    };

    pub fn serialize<S: Serializer>(secret: &Secret<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            secret: &Option<Secret<String>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match secret {
                Some(v) => s.serialize_some(v.expose_secret()),
                None => s.serialize_none(),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        #[serde(serialize_with = "secret_str::serialize")]
        key: Secret<String>,
    },
    Token {
        #[serde(serialize_with = "secret_str::serialize")]
        token: Secret<String>,
    },
    Oauth {
        #[serde(serialize_with = "secret_str::serialize")]
        access: Secret<String>,
        #[serde(default, serialize_with = "secret_str::option::serialize")]
        refresh: Option<Secret<String>>,
        #[serde(default)]
        expires: Option<u64>,
    },
}

impl Credential {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: Secret::new(key.into()),
        }
    }

    /// The value sent as a bearer token.
    pub fn bearer(&self) -> &str {
        match self {
            Self::ApiKey { key } => key.expose_secret(),
            Self::Token { token } => token.expose_secret(),
            Self::Oauth { access, .. } => access.expose_secret(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "api_key",
            Self::Token { .. } => "token",
            Self::Oauth { .. } => "oauth",
        }
    }
}

/// Why a provider call failed, as far as rotation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RateLimit,
    Auth,
    Billing,
    Timeout,
    Unknown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Billing => "billing",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        })
    }
}

/// Map an HTTP status and/or error text to a failure reason.
pub fn classify_failure(status: Option<u16>, message: &str) -> FailureReason {
    let lower = message.to_lowercase();
    match status {
        Some(429) => return FailureReason::RateLimit,
        Some(401 | 403) => return FailureReason::Auth,
        Some(402) => return FailureReason::Billing,
        Some(408 | 504) => return FailureReason::Timeout,
        _ => {},
    }
    if lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("too many requests") {
        FailureReason::RateLimit
    } else if lower.contains("billing") || lower.contains("insufficient credits") || lower.contains("quota") {
        FailureReason::Billing
    } else if lower.contains("unauthorized") || lower.contains("invalid api key") || lower.contains("forbidden") {
        FailureReason::Auth
    } else if lower.contains("timed out") || lower.contains("timeout") {
        FailureReason::Timeout
    } else {
        FailureReason::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    pub id: String,
    pub provider: String,
    pub credential: Credential,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub cooldown_until: Option<u64>,
    #[serde(default)]
    pub disabled_until: Option<u64>,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_used: Option<u64>,
    #[serde(default)]
    pub last_failure_reason: Option<FailureReason>,
    /// Seeded from config; never written to disk.
    #[serde(default, skip_serializing)]
    pub ephemeral: bool,
}

impl AuthProfile {
    pub fn new(id: impl Into<String>, provider: impl Into<String>, credential: Credential) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            credential,
            expires_at: None,
            cooldown_until: None,
            disabled_until: None,
            failure_count: 0,
            last_used: None,
            last_failure_reason: None,
            ephemeral: false,
        }
    }

    fn expiry(&self) -> Option<u64> {
        match &self.credential {
            Credential::Oauth {
                expires: Some(e), ..
            } => Some(self.expires_at.map_or(*e, |x| x.min(*e))),
            _ => self.expires_at,
        }
    }

    fn unusable(&self, now: u64) -> Option<SkipReason> {
        if let Some(until) = self.disabled_until.filter(|u| *u > now) {
            return Some(SkipReason::Disabled { until });
        }
        if let Some(until) = self.cooldown_until.filter(|u| *u > now) {
            return Some(SkipReason::Cooldown {
                until,
                reason: self.last_failure_reason.unwrap_or(FailureReason::Unknown),
            });
        }
        if self.expiry().is_some_and(|e| e <= now) {
            return Some(SkipReason::Expired);
        }
        None
    }
}

/// Operator-facing view without the secret.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub id: String,
    pub provider: String,
    pub kind: &'static str,
    pub expires_at: Option<u64>,
    pub cooldown_until: Option<u64>,
    pub disabled_until: Option<u64>,
    pub failure_count: u32,
    pub last_used: Option<u64>,
    pub last_failure_reason: Option<FailureReason>,
    pub ephemeral: bool,
}

impl From<&AuthProfile> for ProfileSummary {
    fn from(p: &AuthProfile) -> Self {
        Self {
            id: p.id.clone(),
            provider: p.provider.clone(),
            kind: p.credential.kind(),
            expires_at: p.expiry(),
            cooldown_until: p.cooldown_until,
            disabled_until: p.disabled_until,
            failure_count: p.failure_count,
            last_used: p.last_used,
            last_failure_reason: p.last_failure_reason,
            ephemeral: p.ephemeral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Cooldown { until: u64, reason: FailureReason },
    Disabled { until: u64 },
    Expired,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cooldown { until, reason } => write!(f, "cooling down after {reason} until {until}"),
            Self::Disabled { until } => write!(f, "billing-disabled until {until}"),
            Self::Expired => f.write_str("credential expired"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedProfile {
    pub id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone)]
pub enum Selection {
    Profile(AuthProfile),
    /// The provider has no profiles at all; callers fall back to ambient credentials.
    NoProfiles,
    /// Every profile is unusable right now.
    Exhausted(Vec<SkippedProfile>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileFile {
    #[serde(default = "file_version")]
    version: u32,
    #[serde(default)]
    profiles: Vec<AuthProfile>,
    /// Explicit per-provider order set by operators; outranks config.
    #[serde(default)]
    order: BTreeMap<String, Vec<String>>,
}

fn file_version() -> u32 {
    1
}

/// `min(base × factor^(n−1), ceiling)`.
pub fn backoff(failures: u32, base: Duration, factor: u32, ceiling: Duration) -> Duration {
    let exp = failures.saturating_sub(1);
    let mult = u64::from(factor.max(1)).saturating_pow(exp);
    let ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX).saturating_mul(mult);
    Duration::from_millis(ms).min(ceiling)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Rotation state for one agent.
pub struct AuthProfileStore {
    path: Option<PathBuf>,
    state: Mutex<ProfileFile>,
    config_order: RwLock<BTreeMap<String, Vec<String>>>,
    cooldowns: RwLock<CooldownConfig>,
}

impl AuthProfileStore {
    pub fn in_memory(cooldowns: CooldownConfig, order: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            path: None,
            state: Mutex::new(ProfileFile {
                version: file_version(),
                ..Default::default()
            }),
            config_order: RwLock::new(order),
            cooldowns: RwLock::new(cooldowns),
        }
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn open(
        path: PathBuf,
        cooldowns: CooldownConfig,
        order: BTreeMap<String, Vec<String>>,
    ) -> Result<Self, AuthError> {
        let file = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<ProfileFile>(&raw).map_err(|source| {
                AuthError::Parse {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProfileFile {
                version: file_version(),
                ..Default::default()
            },
            Err(source) => return Err(AuthError::Read { path, source }),
        };
        debug!(path = %path.display(), profiles = file.profiles.len(), "auth profiles loaded");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(file),
            config_order: RwLock::new(order),
            cooldowns: RwLock::new(cooldowns),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn apply_config(&self, cooldowns: CooldownConfig, order: BTreeMap<String, Vec<String>>) {
        *self.cooldowns.write().unwrap_or_else(PoisonError::into_inner) = cooldowns;
        *self.config_order.write().unwrap_or_else(PoisonError::into_inner) = order;
    }

    fn cooldowns(&self) -> CooldownConfig {
        self.cooldowns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn persist(&self, file: &ProfileFile) -> Result<(), AuthError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let durable = ProfileFile {
            version: file.version,
            profiles: file.profiles.iter().filter(|p| !p.ephemeral).cloned().collect(),
            order: file.order.clone(),
        };
        let data = serde_json::to_vec_pretty(&durable).map_err(|source| AuthError::Parse {
            path: path.clone(),
            source,
        })?;
        tokio::task::spawn_blocking(move || write_private(&path, &data))
            .await
            .unwrap_or_else(|e| {
                Err(AuthError::Write {
                    path: PathBuf::new(),
                    source: std::io::Error::other(e),
                })
            })
    }

    /// Ranking key: explicit order, then configured order, then the rest.
    fn rank(file: &ProfileFile, config_order: &BTreeMap<String, Vec<String>>, p: &AuthProfile) -> (u8, usize) {
        let position = |order: &BTreeMap<String, Vec<String>>| {
            order
                .get(&p.provider)
                .and_then(|ids| ids.iter().position(|id| *id == p.id))
        };
        if let Some(i) = position(&file.order) {
            (0, i)
        } else if let Some(i) = position(config_order) {
            (1, i)
        } else {
            (2, 0)
        }
    }

    pub async fn next_usable(&self, provider: &str) -> Selection {
        self.next_usable_at(provider, now_ms()).await
    }

    /// Pick the best usable profile for `provider` and stamp `lastUsed`.
    ///
    /// Ties in rank go to the least recently used profile.
    pub async fn next_usable_at(&self, provider: &str, now: u64) -> Selection {
        let mut file = self.state.lock().await;
        let config_order = self
            .config_order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut skipped = Vec::new();
        let mut best: Option<(usize, (u8, usize), u64)> = None;
        let mut seen = false;
        for (idx, p) in file.profiles.iter().enumerate() {
            if p.provider != provider {
                continue;
            }
            seen = true;
            if let Some(reason) = p.unusable(now) {
                skipped.push(SkippedProfile {
                    id: p.id.clone(),
                    reason,
                });
                continue;
            }
            let rank = Self::rank(&file, &config_order, p);
            let used = p.last_used.unwrap_or(0);
            let better = match best {
                None => true,
                Some((_, best_rank, best_used)) => (rank, used) < (best_rank, best_used),
            };
            if better {
                best = Some((idx, rank, used));
            }
        }

        let Some((idx, ..)) = best else {
            return if seen {
                debug!(provider, skipped = skipped.len(), "no usable auth profile");
                Selection::Exhausted(skipped)
            } else {
                Selection::NoProfiles
            };
        };

        file.profiles[idx].last_used = Some(now);
        let chosen = file.profiles[idx].clone();
        if let Err(e) = self.persist(&file).await {
            warn!(error = %e, "failed to persist auth profile selection");
        }
        debug!(provider, profile = %chosen.id, "auth profile selected");
        Selection::Profile(chosen)
    }

    pub async fn mark_success(&self, id: &str) -> Result<(), AuthError> {
        let mut file = self.state.lock().await;
        let p = find_mut(&mut file, id)?;
        if p.failure_count == 0 && p.cooldown_until.is_none() && p.disabled_until.is_none() {
            return Ok(());
        }
        p.failure_count = 0;
        p.cooldown_until = None;
        p.disabled_until = None;
        p.last_failure_reason = None;
        info!(profile = id, "auth profile recovered");
        self.persist(&file).await
    }

    pub async fn mark_failure(&self, id: &str, reason: FailureReason) -> Result<Duration, AuthError> {
        self.mark_failure_at(id, reason, now_ms()).await
    }

    /// Record a failure and put the profile on cooldown. Returns the cooldown.
    pub async fn mark_failure_at(
        &self,
        id: &str,
        reason: FailureReason,
        now: u64,
    ) -> Result<Duration, AuthError> {
        let cfg = self.cooldowns();
        let mut file = self.state.lock().await;
        let p = find_mut(&mut file, id)?;
        p.failure_count = p.failure_count.saturating_add(1);
        p.last_failure_reason = Some(reason);

        let cooldown = if reason == FailureReason::Billing {
            let d = backoff(
                p.failure_count,
                Duration::from_secs(cfg.billing_base_hours.saturating_mul(3600)),
                cfg.multiplier,
                Duration::from_secs(cfg.billing_max_hours.saturating_mul(3600)),
            );
            p.disabled_until = Some(now.saturating_add(millis(d)));
            d
        } else {
            let d = backoff(
                p.failure_count,
                Duration::from_secs(cfg.base_secs),
                cfg.multiplier,
                Duration::from_secs(cfg.max_secs),
            );
            p.cooldown_until = Some(now.saturating_add(millis(d)));
            d
        };
        warn!(
            profile = id,
            %reason,
            failures = p.failure_count,
            cooldown_secs = cooldown.as_secs(),
            "auth profile cooling down"
        );
        self.persist(&file).await?;
        Ok(cooldown)
    }

    pub async fn list(&self) -> Vec<ProfileSummary> {
        self.state
            .lock()
            .await
            .profiles
            .iter()
            .map(ProfileSummary::from)
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<AuthProfile> {
        self.state
            .lock()
            .await
            .profiles
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Insert or replace by id. Rotation state is kept when the provider is unchanged.
    pub async fn upsert(&self, mut profile: AuthProfile) -> Result<(), AuthError> {
        let mut file = self.state.lock().await;
        match file.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => {
                if existing.provider == profile.provider {
                    profile.cooldown_until = existing.cooldown_until;
                    profile.disabled_until = existing.disabled_until;
                    profile.failure_count = existing.failure_count;
                    profile.last_used = existing.last_used;
                    profile.last_failure_reason = existing.last_failure_reason;
                }
                *existing = profile;
            },
            None => file.profiles.push(profile),
        }
        self.persist(&file).await
    }

    pub async fn remove(&self, id: &str) -> Result<(), AuthError> {
        let mut file = self.state.lock().await;
        let before = file.profiles.len();
        file.profiles.retain(|p| p.id != id);
        if file.profiles.len() == before {
            return Err(AuthError::NotFound(id.to_string()));
        }
        for ids in file.order.values_mut() {
            ids.retain(|i| i != id);
        }
        self.persist(&file).await
    }

    /// Set the explicit order for `provider`. An empty list clears it.
    pub async fn set_order(&self, provider: &str, ids: Vec<String>) -> Result<(), AuthError> {
        let mut file = self.state.lock().await;
        if ids.is_empty() {
            file.order.remove(provider);
        } else {
            file.order.insert(provider.to_string(), ids);
        }
        self.persist(&file).await
    }

    pub async fn order(&self) -> BTreeMap<String, Vec<String>> {
        self.state.lock().await.order.clone()
    }

    pub async fn clear_cooldown(&self, id: &str) -> Result<(), AuthError> {
        let mut file = self.state.lock().await;
        let p = find_mut(&mut file, id)?;
        p.cooldown_until = None;
        p.disabled_until = None;
        p.failure_count = 0;
        self.persist(&file).await
    }

    /// Add `<provider>:config` profiles for providers that carry an `apiKey`.
    pub async fn seed_from_config(&self, models: &ModelsConfig) {
        let mut file = self.state.lock().await;
        file.profiles.retain(|p| !p.ephemeral);
        for (provider, entry) in &models.providers {
            let Some(key) = entry.api_key.as_ref().filter(|k| !k.is_empty()) else {
                continue;
            };
            let id = format!("{provider}:config");
            if file.profiles.iter().any(|p| p.id == id) {
                continue;
            }
            let mut profile = AuthProfile::new(id, provider.clone(), Credential::api_key(key.clone()));
            profile.ephemeral = true;
            file.profiles.push(profile);
        }
    }
}

fn find_mut<'a>(file: &'a mut ProfileFile, id: &str) -> Result<&'a mut AuthProfile, AuthError> {
    file.profiles
        .iter_mut()
        .find(|p| p.id == id)
        .ok_or_else(|| AuthError::NotFound(id.to_string()))
}

/// Atomic write with owner-only permissions.
pub(crate) fn write_private(path: &Path, data: &[u8]) -> Result<(), AuthError> {
    let err = |source| AuthError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).map_err(err)?;
    }
    std::fs::rename(&tmp, path).map_err(err)
}

/// One store per agent, opened lazily.
pub struct AuthProfileRegistry {
    state_dir: PathBuf,
    cooldowns: RwLock<CooldownConfig>,
    order: RwLock<BTreeMap<String, Vec<String>>>,
    models: RwLock<ModelsConfig>,
    stores: DashMap<String, Arc<AuthProfileStore>>,
}

impl AuthProfileRegistry {
    pub fn new(
        state_dir: PathBuf,
        cooldowns: CooldownConfig,
        order: BTreeMap<String, Vec<String>>,
        models: ModelsConfig,
    ) -> Self {
        Self {
            state_dir,
            cooldowns: RwLock::new(cooldowns),
            order: RwLock::new(order),
            models: RwLock::new(models),
            stores: DashMap::new(),
        }
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        self.state_dir.join("agents").join(agent_id).join(PROFILES_FILE)
    }

    pub async fn for_agent(&self, agent_id: &str) -> Result<Arc<AuthProfileStore>, AuthError> {
        if let Some(store) = self.stores.get(agent_id) {
            return Ok(Arc::clone(store.value()));
        }
        let cooldowns = self.cooldowns.read().unwrap_or_else(PoisonError::into_inner).clone();
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner).clone();
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner).clone();
        let store = AuthProfileStore::open(self.path_for(agent_id), cooldowns, order)?;
        store.seed_from_config(&models).await;
        let store = Arc::new(store);
        // Another task may have opened it concurrently; keep the first.
        Ok(Arc::clone(
            self.stores
                .entry(agent_id.to_string())
                .or_insert(store)
                .value(),
        ))
    }

    /// Hot-apply `auth` and `models` edits to every open store.
    pub async fn apply_config(
        &self,
        cooldowns: CooldownConfig,
        order: BTreeMap<String, Vec<String>>,
        models: ModelsConfig,
    ) {
        *self.cooldowns.write().unwrap_or_else(PoisonError::into_inner) = cooldowns.clone();
        *self.order.write().unwrap_or_else(PoisonError::into_inner) = order.clone();
        *self.models.write().unwrap_or_else(PoisonError::into_inner) = models.clone();
        let stores: Vec<_> = self.stores.iter().map(|s| Arc::clone(s.value())).collect();
        for store in stores {
            store.apply_config(cooldowns.clone(), order.clone());
            store.seed_from_config(&models).await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, rstest::rstest};

    const MIN: u64 = 60_000;

    fn store() -> AuthProfileStore {
        AuthProfileStore::in_memory(CooldownConfig::default(), BTreeMap::new())
    }

    async fn add(store: &AuthProfileStore, id: &str, provider: &str) {
        store
            .upsert(AuthProfile::new(id, provider, Credential::api_key(format!("sk-{id}"))))
            .await
            .unwrap();
    }

    fn chosen(sel: Selection) -> String {
        match sel {
            Selection::Profile(p) => p.id,
            other => panic!("expected a profile, got {other:?}"),
        }
    }

    #[rstest]
    #[case(1, 60)]
    #[case(2, 300)]
    #[case(3, 1500)]
    #[case(4, 3600)]
    #[case(40, 3600)]
    fn backoff_grows_to_ceiling(#[case] failures: u32, #[case] secs: u64) {
        let d = backoff(failures, Duration::from_secs(60), 5, Duration::from_secs(3600));
        assert_eq!(d, Duration::from_secs(secs));
    }

    #[rstest]
    #[case(Some(429), "", FailureReason::RateLimit)]
    #[case(None, "Rate limit exceeded", FailureReason::RateLimit)]
    #[case(Some(401), "", FailureReason::Auth)]
    #[case(Some(403), "", FailureReason::Auth)]
    #[case(Some(402), "", FailureReason::Billing)]
    #[case(None, "insufficient credits on account", FailureReason::Billing)]
    #[case(None, "request timed out", FailureReason::Timeout)]
    #[case(Some(500), "boom", FailureReason::Unknown)]
    fn failures_are_classified(
        #[case] status: Option<u16>,
        #[case] message: &str,
        #[case] expected: FailureReason,
    ) {
        assert_eq!(classify_failure(status, message), expected);
    }

    #[tokio::test]
    async fn cooldown_grows_then_resets_after_success() {
        let s = store();
        add(&s, "p1", "openai").await;

        let mut previous = Duration::ZERO;
        for _ in 0..3 {
            let d = s.mark_failure_at("p1", FailureReason::RateLimit, 0).await.unwrap();
            assert!(d > previous);
            previous = d;
        }
        s.mark_success("p1").await.unwrap();
        let d = s.mark_failure_at("p1", FailureReason::RateLimit, 0).await.unwrap();
        assert_eq!(d, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn oversized_billing_hours_saturate() {
        let s = AuthProfileStore::in_memory(
            CooldownConfig {
                billing_base_hours: u64::MAX,
                billing_max_hours: u64::MAX,
                ..Default::default()
            },
            BTreeMap::new(),
        );
        add(&s, "p1", "openai").await;
        let d = s.mark_failure_at("p1", FailureReason::Billing, 1).await.unwrap();
        assert_eq!(d, Duration::from_millis(u64::MAX));
        let p = s.get("p1").await.unwrap();
        assert_eq!(p.disabled_until, Some(u64::MAX));
    }

    #[tokio::test]
    async fn rotation_skips_cooling_profiles_and_reports_why() {
        let s = store();
        add(&s, "a", "openai").await;
        add(&s, "b", "openai").await;

        s.mark_failure_at("a", FailureReason::RateLimit, 0).await.unwrap();
        assert_eq!(chosen(s.next_usable_at("openai", 1).await), "b");

        s.mark_failure_at("b", FailureReason::Billing, 0).await.unwrap();
        match s.next_usable_at("openai", 1).await {
            Selection::Exhausted(skipped) => {
                assert_eq!(skipped.len(), 2);
                assert!(matches!(skipped[0].reason, SkipReason::Cooldown { reason: FailureReason::RateLimit, .. }));
                assert!(matches!(skipped[1].reason, SkipReason::Disabled { .. }));
            },
            other => panic!("expected exhaustion, got {other:?}"),
        }

        // `a` comes back once its minute is up; `b` stays billing-disabled.
        assert_eq!(chosen(s.next_usable_at("openai", MIN).await), "a");
        assert!(matches!(s.next_usable_at("anthropic", 0).await, Selection::NoProfiles));
    }

    #[tokio::test]
    async fn order_explicit_then_config_then_lru() {
        let order = BTreeMap::from([("openai".to_string(), vec!["c".to_string()])]);
        let s = AuthProfileStore::in_memory(CooldownConfig::default(), order);
        for id in ["a", "b", "c", "d"] {
            add(&s, id, "openai").await;
        }
        assert_eq!(chosen(s.next_usable_at("openai", 1).await), "c");

        s.set_order("openai", vec!["d".into()]).await.unwrap();
        assert_eq!(chosen(s.next_usable_at("openai", 2).await), "d");
        s.mark_failure_at("d", FailureReason::Auth, 2).await.unwrap();
        assert_eq!(chosen(s.next_usable_at("openai", 3).await), "c");
        s.mark_failure_at("c", FailureReason::Auth, 3).await.unwrap();

        // Unranked profiles rotate least-recently-used first.
        assert_eq!(chosen(s.next_usable_at("openai", 4).await), "a");
        assert_eq!(chosen(s.next_usable_at("openai", 5).await), "b");
        assert_eq!(chosen(s.next_usable_at("openai", 6).await), "a");
    }

    #[tokio::test]
    async fn expired_credentials_are_skipped() {
        let s = store();
        let mut p = AuthProfile::new("o", "anthropic", Credential::Oauth {
            access: Secret::new("at".into()),
            refresh: None,
            expires: Some(100),
        });
        p.expires_at = None;
        s.upsert(p).await.unwrap();
        assert!(matches!(s.next_usable_at("anthropic", 50).await, Selection::Profile(_)));
        match s.next_usable_at("anthropic", 100).await {
            Selection::Exhausted(skipped) => assert_eq!(skipped[0].reason, SkipReason::Expired),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_selection_round_robins() {
        let s = Arc::new(store());
        add(&s, "a", "openai").await;
        add(&s, "b", "openai").await;
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let s = Arc::clone(&s);
                tokio::spawn(async move { chosen(s.next_usable_at("openai", 10).await) })
            })
            .collect();
        let mut picked = Vec::new();
        for t in tasks {
            picked.push(t.await.unwrap());
        }
        picked.sort();
        assert_eq!(picked, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn persists_atomically_with_private_mode_and_skips_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agents/main").join(PROFILES_FILE);
        let s = AuthProfileStore::open(path.clone(), CooldownConfig::default(), BTreeMap::new()).unwrap();
        add(&s, "p1", "openai").await;
        let mut models = ModelsConfig::default();
        models.providers.insert("anthropic".into(), clawgate_config::schema::ProviderEntry {
            api_key: Some("sk-cfg".into()),
            ..Default::default()
        });
        s.seed_from_config(&models).await;
        s.mark_failure_at("p1", FailureReason::RateLimit, 0).await.unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = AuthProfileStore::open(path, CooldownConfig::default(), BTreeMap::new()).unwrap();
        let list = reopened.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].failure_count, 1);
        assert_eq!(reopened.get("p1").await.unwrap().credential.bearer(), "sk-p1");
    }

    #[tokio::test]
    async fn registry_opens_one_store_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = AuthProfileRegistry::new(
            dir.path().to_path_buf(),
            CooldownConfig::default(),
            BTreeMap::new(),
            ModelsConfig::default(),
        );
        let a = reg.for_agent("main").await.unwrap();
        let b = reg.for_agent("main").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.path().unwrap(), dir.path().join("agents/main/auth-profiles.json"));
    }
}
