//! Configuration management for the subject-line service
//!
//! All configurable parameters in one place with environment variable overrides.
//! Sensible defaults, configurable in production.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

use crate::bandit::BanditConfig;
use crate::constants::{
    DEFAULT_VARIANTS_PER_TEST, GENERATION_CACHE_CAPACITY, GENERATION_CACHE_TTL_SECS,
};

/// Overwrite `target` when `key` is set and parses
fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.trim().parse() {
            *target = parsed;
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    env::var(key).ok().map(|v| {
        let v = v.trim().to_lowercase();
        v == "true" || v == "1" || v == "yes"
    })
}

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    /// Allowed origins (empty = allow all)
    pub allowed_origins: Vec<String>,
    /// Allowed HTTP methods
    pub allowed_methods: Vec<String>,
    /// Allowed headers
    pub allowed_headers: Vec<String>,
    /// Whether to allow credentials
    pub allow_credentials: bool,
    /// Max age for preflight cache (seconds)
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "DELETE".to_string(),
                "OPTIONS".to_string(),
            ],
            allowed_headers: vec!["Content-Type".to_string(), "X-Request-ID".to_string()],
            allow_credentials: false,
            max_age_seconds: 86400,
        }
    }
}

impl CorsConfig {
    pub fn from_env(is_production: bool) -> Self {
        let split = |s: String| -> Vec<String> {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };

        let mut config = Self::default();
        if let Ok(origins) = env::var("SUBJECT_CORS_ORIGINS") {
            config.allowed_origins = split(origins);
        }
        if let Ok(methods) = env::var("SUBJECT_CORS_METHODS") {
            config.allowed_methods = split(methods.to_uppercase());
        }
        if let Ok(headers) = env::var("SUBJECT_CORS_HEADERS") {
            config.allowed_headers = split(headers);
        }
        if let Some(flag) = env_flag("SUBJECT_CORS_CREDENTIALS") {
            config.allow_credentials = flag;
        }
        env_override("SUBJECT_CORS_MAX_AGE", &mut config.max_age_seconds);

        if is_production && config.allowed_origins.is_empty() {
            tracing::warn!(
                "PRODUCTION WARNING: CORS allows all origins. Set SUBJECT_CORS_ORIGINS to restrict."
            );
        }

        config
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed_origins.is_empty()
    }

    /// Convert to tower-http CorsLayer
    pub fn to_layer(&self) -> tower_http::cors::CorsLayer {
        use tower_http::cors::{AllowOrigin, Any, CorsLayer};

        let mut layer = CorsLayer::new();

        if self.allowed_origins.is_empty() {
            layer = layer.allow_origin(Any);
        } else {
            let mut valid_origins = Vec::new();
            for origin in &self.allowed_origins {
                match origin.parse::<axum::http::HeaderValue>() {
                    Ok(value) => valid_origins.push(value),
                    Err(_) => tracing::warn!("CORS: Invalid origin '{}' - skipping", origin),
                }
            }

            if valid_origins.is_empty() {
                // Every configured origin was invalid: deny rather than fall open
                tracing::error!(
                    "CORS: All {} configured origin(s) failed to parse. Rejecting all cross-origin requests.",
                    self.allowed_origins.len()
                );
            }
            layer = layer.allow_origin(AllowOrigin::list(valid_origins));
        }

        let methods: Vec<axum::http::Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer = if methods.is_empty() {
            layer.allow_methods(Any)
        } else {
            layer.allow_methods(methods)
        };

        let headers: Vec<axum::http::HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = if headers.is_empty() {
            layer.allow_headers(Any)
        } else {
            layer.allow_headers(headers)
        };

        if self.allow_credentials {
            layer = layer.allow_credentials(true);
        }

        layer.max_age(std::time::Duration::from_secs(self.max_age_seconds))
    }
}

/// Which persistence backend to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    RocksDb,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// RocksDB directory (default: ./subject_optimizer_data)
    pub storage_path: PathBuf,
    /// Max wait for a row lock before a transaction fails (default: 1000ms)
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::RocksDb,
            storage_path: PathBuf::from("./subject_optimizer_data"),
            lock_timeout_ms: 1000,
        }
    }
}

/// Subject line generation and caching
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible API
    pub llm_endpoint: String,
    pub llm_model: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Total attempts per generation, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub variants_per_test: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            llm_endpoint: "https://api.openai.com".to_string(),
            llm_model: "gpt-3.5-turbo".to_string(),
            api_key: None,
            request_timeout_secs: 30,
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            variants_per_test: DEFAULT_VARIANTS_PER_TEST,
            cache_ttl_secs: GENERATION_CACHE_TTL_SECS,
            cache_capacity: GENERATION_CACHE_CAPACITY,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match env::var("SUBJECT_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Server configuration loaded from environment with defaults
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1, use 0.0.0.0 in containers)
    pub host: String,

    /// Server port (default: 8000)
    pub port: u16,

    /// Maximum concurrent requests (default: 200)
    pub max_concurrent_requests: usize,

    pub is_production: bool,

    pub cors: CorsConfig,

    pub bandit: BanditConfig,

    pub generation: GenerationConfig,

    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_concurrent_requests: 200,
            is_production: false,
            cors: CorsConfig::default(),
            bandit: BanditConfig::default(),
            generation: GenerationConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults
    #[allow(clippy::field_reassign_with_default)]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.is_production = env::var("SUBJECT_ENV")
            .map(|v| {
                let v = v.to_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false);

        if let Ok(val) = env::var("SUBJECT_HOST") {
            config.host = val;
        }
        env_override("SUBJECT_PORT", &mut config.port);
        env_override("SUBJECT_MAX_CONCURRENT", &mut config.max_concurrent_requests);

        config.cors = CorsConfig::from_env(config.is_production);

        // Bandit
        env_override(
            "SUBJECT_EXPLORATION_THRESHOLD",
            &mut config.bandit.exploration_threshold,
        );
        env_override("SUBJECT_CONFIDENCE_Z", &mut config.bandit.confidence_z);
        if let Some(flag) = env_flag("SUBJECT_ENFORCE_CAUSAL_ORDER") {
            config.bandit.enforce_causal_order = flag;
        }
        if let Ok(val) = env::var("SUBJECT_RNG_SEED") {
            config.bandit.seed = val.trim().parse().ok();
        }

        // Store
        env_override("SUBJECT_STORE", &mut config.store.backend);
        if let Ok(val) = env::var("SUBJECT_DATA_PATH") {
            config.store.storage_path = PathBuf::from(val);
        }
        env_override("SUBJECT_LOCK_TIMEOUT_MS", &mut config.store.lock_timeout_ms);

        // Generation
        let generation = &mut config.generation;
        if let Ok(val) = env::var("SUBJECT_LLM_ENDPOINT") {
            generation.llm_endpoint = val;
        }
        if let Ok(val) = env::var("SUBJECT_LLM_MODEL") {
            generation.llm_model = val;
        }
        generation.api_key = env::var("SUBJECT_LLM_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        env_override("SUBJECT_LLM_TIMEOUT", &mut generation.request_timeout_secs);
        env_override("SUBJECT_LLM_MAX_ATTEMPTS", &mut generation.max_attempts);
        env_override("SUBJECT_LLM_INITIAL_BACKOFF_MS", &mut generation.initial_backoff_ms);
        env_override("SUBJECT_LLM_MAX_BACKOFF_MS", &mut generation.max_backoff_ms);
        env_override("SUBJECT_VARIANTS_PER_TEST", &mut generation.variants_per_test);
        generation.variants_per_test = generation.variants_per_test.clamp(1, 20);
        env_override("SUBJECT_CACHE_TTL", &mut generation.cache_ttl_secs);
        env_override("SUBJECT_CACHE_CAPACITY", &mut generation.cache_capacity);

        config
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "   Mode: {}",
            if self.is_production {
                "PRODUCTION"
            } else {
                "Development"
            }
        );
        info!("   Bind: {}:{}", self.host, self.port);
        match self.store.backend {
            StoreBackend::RocksDb => info!(
                "   Store: rocksdb at {:?} (lock timeout {}ms)",
                self.store.storage_path, self.store.lock_timeout_ms
            ),
            StoreBackend::Memory => info!("   Store: in-memory (state is lost on restart)"),
        }
        info!("   Max concurrent: {}", self.max_concurrent_requests);
        info!(
            "   Bandit: exploration threshold {}, z {:.2}, causal order {}",
            self.bandit.exploration_threshold,
            self.bandit.confidence_z,
            if self.bandit.enforce_causal_order {
                "enforced"
            } else {
                "permissive"
            }
        );
        info!(
            "   Generator: {} ({}), api key {}",
            self.generation.llm_endpoint,
            self.generation.llm_model,
            if self.generation.api_key.is_some() {
                "set"
            } else {
                "not set"
            }
        );
        info!(
            "   Generation cache: ttl {}s, capacity {}",
            self.generation.cache_ttl_secs, self.generation.cache_capacity
        );
        if self.cors.is_restricted() {
            info!("   CORS origins: {:?}", self.cors.allowed_origins);
        } else {
            info!("   CORS: Permissive (all origins allowed)");
        }
    }
}

/// Environment variable documentation
pub fn print_env_help() {
    println!("Subject Optimizer Configuration Environment Variables:");
    println!();
    println!("  SUBJECT_ENV                  - Set to 'production' or 'prod' for production mode");
    println!("  SUBJECT_HOST                 - Bind address (default: 127.0.0.1)");
    println!("  SUBJECT_PORT                 - Server port (default: 8000)");
    println!("  SUBJECT_MAX_CONCURRENT       - Max concurrent requests (default: 200)");
    println!("  SUBJECT_LOG_FORMAT           - 'json' for JSON logs (default: human-readable)");
    println!();
    println!("Storage:");
    println!("  SUBJECT_STORE                - 'rocksdb' or 'memory' (default: rocksdb)");
    println!("  SUBJECT_DATA_PATH            - RocksDB directory (default: ./subject_optimizer_data)");
    println!("  SUBJECT_LOCK_TIMEOUT_MS      - Row lock timeout (default: 1000)");
    println!();
    println!("Bandit:");
    println!("  SUBJECT_EXPLORATION_THRESHOLD - Selections before Thompson sampling (default: 5000)");
    println!("  SUBJECT_CONFIDENCE_Z         - z for Wilson intervals (default: 1.96)");
    println!("  SUBJECT_ENFORCE_CAUSAL_ORDER - Reject opens/clicks/conversions beyond sends (default: false)");
    println!("  SUBJECT_RNG_SEED             - Fixed seed for Thompson draws (default: random)");
    println!();
    println!("Generation:");
    println!("  SUBJECT_LLM_ENDPOINT         - OpenAI-compatible base URL (default: https://api.openai.com)");
    println!("  SUBJECT_LLM_MODEL            - Model name (default: gpt-3.5-turbo)");
    println!("  SUBJECT_LLM_API_KEY          - API key (falls back to OPENAI_API_KEY)");
    println!("  SUBJECT_LLM_TIMEOUT          - Request timeout in seconds (default: 30)");
    println!("  SUBJECT_LLM_MAX_ATTEMPTS     - Attempts per generation (default: 5)");
    println!("  SUBJECT_VARIANTS_PER_TEST    - Subject lines per test (default: 5)");
    println!("  SUBJECT_CACHE_TTL            - Generation cache TTL seconds (default: 3600)");
    println!("  SUBJECT_CACHE_CAPACITY       - Generation cache entries (default: 10000)");
    println!();
    println!("CORS:");
    println!("  SUBJECT_CORS_ORIGINS         - Comma-separated allowed origins (default: all)");
    println!("  SUBJECT_CORS_METHODS         - Comma-separated allowed methods");
    println!("  SUBJECT_CORS_HEADERS         - Comma-separated allowed headers");
    println!("  SUBJECT_CORS_CREDENTIALS     - Allow credentials true/false (default: false)");
    println!("  SUBJECT_CORS_MAX_AGE         - Preflight cache seconds (default: 86400)");
    println!();
    println!("  RUST_LOG                     - Log level (e.g., info, debug, trace)");
    println!();
}
