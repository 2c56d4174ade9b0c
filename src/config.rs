use std::collections::BTreeMap;

pub const MAX_ACCOUNTS: u32 = 10;
pub const MAX_INPUT_IMAGES: usize = 4;

pub const DEFAULT_MODEL: &str = "@cf/black-forest-labs/flux-2-dev";
pub const DEFAULT_API_BASE_URL: &str = "https://api.cloudflare.com/client/v4";
pub const AUTH_DISABLED_SENTINEL: &str = "1";

const DEFAULT_STEPS: u32 = 25;
const DEFAULT_WIDTH: u32 = 1024;
const DEFAULT_HEIGHT: u32 = 1024;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Values substituted when a request omits a generation parameter or sends one
/// that does not parse as a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationDefaults {
    pub steps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

/// One numbered credential slot as found in the environment. Either half may be
/// missing; the account pool decides whether the slot is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSlot {
    pub token: Option<String>,
    pub account_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub api_master_key: Option<String>,
    pub api_base_url: String,
    pub model: String,
    pub request_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub defaults: GenerationDefaults,
    pub credential_slots: BTreeMap<u32, CredentialSlot>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            api_master_key: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            defaults: GenerationDefaults::default(),
            credential_slots: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Blank values are
    /// treated as absent.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let fallback = Self::default();

        let defaults = GenerationDefaults {
            steps: parse_positive(get("DEFAULT_STEPS")).unwrap_or(fallback.defaults.steps),
            width: parse_positive(get("DEFAULT_WIDTH")).unwrap_or(fallback.defaults.width),
            height: parse_positive(get("DEFAULT_HEIGHT")).unwrap_or(fallback.defaults.height),
        };

        let mut credential_slots = BTreeMap::new();
        for slot in 1..=MAX_ACCOUNTS {
            let mut token = get(&format!("CF_API_TOKEN_{slot}"));
            let mut account_id = get(&format!("CF_ACCOUNT_ID_{slot}"));
            if slot == 1 {
                token = token.or_else(|| get("CF_API_TOKEN"));
                account_id = account_id.or_else(|| get("CF_ACCOUNT_ID"));
            }
            if token.is_some() || account_id.is_some() {
                credential_slots.insert(slot, CredentialSlot { token, account_id });
            }
        }

        Self {
            listen: get("FLUXGATE_LISTEN").unwrap_or(fallback.listen),
            metrics_path: get("FLUXGATE_METRICS_PATH")
                .filter(|path| is_mountable_metrics_path(path))
                .unwrap_or(fallback.metrics_path),
            api_master_key: get("API_MASTER_KEY"),
            api_base_url: get("CF_API_BASE_URL").unwrap_or(fallback.api_base_url),
            model: get("CF_FLUX_MODEL").unwrap_or(fallback.model),
            request_timeout_ms: parse_positive(get("FLUXGATE_REQUEST_TIMEOUT_MS"))
                .unwrap_or(fallback.request_timeout_ms),
            max_body_bytes: parse_positive(get("FLUXGATE_MAX_BODY_BYTES"))
                .unwrap_or(fallback.max_body_bytes),
            defaults,
            credential_slots,
        }
    }

    pub fn with_account(
        mut self,
        slot: u32,
        token: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        self.credential_slots.insert(
            slot,
            CredentialSlot {
                token: Some(token.into()),
                account_id: Some(account_id.into()),
            },
        );
        self
    }
}

/// Routes owned by the API itself. The metrics endpoint may not shadow them.
const RESERVED_PATHS: &[&str] = &["/health", "/v1/models", "/v1/images/generations"];

fn is_mountable_metrics_path(path: &str) -> bool {
    path.starts_with('/') && path.len() > 1 && !RESERVED_PATHS.contains(&path)
}

fn parse_positive<T>(raw: Option<String>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|v| v.parse::<T>().ok())
        .filter(|v| *v > T::default())
}
