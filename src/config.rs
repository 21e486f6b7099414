use anyhow::{bail, Context, Result};
use std::collections::HashMap;

/// Which translation backend serves detect+translate calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Hosted chat-completions API (OpenAI-compatible).
    OpenAi,
    /// LibreTranslate-style detect/translate HTTP API.
    Libre,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "libretranslate" | "libre" => Ok(Self::Libre),
            other => bail!("Unknown translation provider: '{}'", other),
        }
    }
}

/// Ceilings and window for one limit type.
///
/// The community ceiling covers the aggregate of all users in a community and
/// must never be below the per-user ceiling.
#[derive(Debug, Clone, Copy)]
pub struct LimitSettings {
    pub user_limit: i64,
    pub community_limit: i64,
    pub window_secs: i64,
}

/// Rate limiter configuration: a default table entry plus per-type overrides.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub default: LimitSettings,
    pub overrides: HashMap<String, LimitSettings>,
    /// Reported as limit/remaining when both backends are down and the
    /// request is admitted anyway. Lets callers tell "normal allowance" from
    /// "limiter unavailable".
    pub fail_open_sentinel: i64,
}

impl RateLimitConfig {
    pub fn settings_for(&self, limit_type: &str) -> LimitSettings {
        self.overrides
            .get(limit_type)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub port: u16,
    pub api_key: Option<String>,

    // Stores
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub store_timeout_secs: u64,

    // Translation
    pub provider: ProviderKind,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_api_url: String,
    pub libre_api_url: String,
    pub libre_api_key: Option<String>,
    pub provider_timeout_secs: u64,
    pub target_lang: String,
    pub min_translation_words: usize,
    pub confidence_threshold: f32,
    pub translation_cache_size: usize,

    // Rate limiting
    pub rate_limits: RateLimitConfig,

    // Dispatch
    pub downstream_url: String,
    pub downstream_timeout_secs: u64,
    pub batch_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let provider = ProviderKind::from_name(
            &std::env::var("TRANSLATION_PROVIDER").unwrap_or_else(|_| "openai".to_string()),
        )?;

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        if provider == ProviderKind::OpenAi && openai_api_key.is_none() {
            bail!("OPENAI_API_KEY not set (required when TRANSLATION_PROVIDER=openai)");
        }

        Ok(Self {
            // Server
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            api_key: std::env::var("API_KEY").ok().filter(|v| !v.is_empty()),

            // Stores
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            store_timeout_secs: std::env::var("STORE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),

            // Translation
            provider,
            openai_api_key,
            openai_model: std::env::var("OPENAI_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_api_url: std::env::var("OPENAI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
            libre_api_url: std::env::var("LIBRETRANSLATE_URL")
                .unwrap_or_else(|_| "https://libretranslate.com".to_string()),
            libre_api_key: std::env::var("LIBRETRANSLATE_API_KEY").ok(),
            provider_timeout_secs: std::env::var("PROVIDER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            target_lang: std::env::var("TARGET_LANG").unwrap_or_else(|_| "en".to_string()),
            min_translation_words: std::env::var("MIN_TRANSLATION_WORDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            confidence_threshold: std::env::var("CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.70),
            translation_cache_size: std::env::var("TRANSLATION_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),

            // Rate limiting
            rate_limits: parse_rate_limits()?,

            // Dispatch
            downstream_url: std::env::var("DOWNSTREAM_URL").context("DOWNSTREAM_URL not set")?,
            downstream_timeout_secs: std::env::var("DOWNSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            batch_concurrency: std::env::var("BATCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(100),
        })
    }
}

/// Parse rate-limit configuration from environment.
///
/// `RATE_LIMITS` holds per-type overrides as a comma list of
/// `type=user_limit:community_limit:window_secs`, for example:
/// `RATE_LIMITS="research=5:50:3600,command=30:300:3600"`.
fn parse_rate_limits() -> Result<RateLimitConfig> {
    let default = LimitSettings {
        user_limit: std::env::var("RATE_LIMIT_USER_DEFAULT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60),
        community_limit: std::env::var("RATE_LIMIT_COMMUNITY_DEFAULT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(600),
        window_secs: std::env::var("RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600),
    };
    validate_settings("default", &default)?;

    let mut overrides = HashMap::new();
    if let Ok(spec) = std::env::var("RATE_LIMITS") {
        for entry in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (limit_type, settings) = parse_limit_entry(entry)
                .with_context(|| format!("Invalid RATE_LIMITS entry: '{}'", entry))?;
            validate_settings(&limit_type, &settings)?;
            overrides.insert(limit_type, settings);
        }
    }

    Ok(RateLimitConfig {
        default,
        overrides,
        fail_open_sentinel: std::env::var("RATE_LIMIT_FAIL_OPEN_SENTINEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(999),
    })
}

fn parse_limit_entry(entry: &str) -> Result<(String, LimitSettings)> {
    let (limit_type, rest) = entry
        .split_once('=')
        .context("Expected 'type=user:community:window'")?;

    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 3 {
        bail!("Expected three ':'-separated values, got {}", parts.len());
    }

    Ok((
        limit_type.trim().to_string(),
        LimitSettings {
            user_limit: parts[0].parse().context("Invalid user limit")?,
            community_limit: parts[1].parse().context("Invalid community limit")?,
            window_secs: parts[2].parse().context("Invalid window")?,
        },
    ))
}

fn validate_settings(limit_type: &str, settings: &LimitSettings) -> Result<()> {
    if settings.user_limit < 1 || settings.community_limit < 1 || settings.window_secs < 1 {
        bail!("Rate limit settings for '{}' must be positive", limit_type);
    }
    if settings.community_limit < settings.user_limit {
        bail!(
            "Community limit ({}) must be >= user limit ({}) for '{}'",
            settings.community_limit,
            settings.user_limit,
            limit_type
        );
    }
    Ok(())
}
