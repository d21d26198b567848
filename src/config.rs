//! Static configuration for suppliers, retries, the circuit breakers and the
//! session pool.
//!
//! Everything here is loaded once at startup, either from JSON or from a
//! [`ConfigProvider`] such as environment variables, and is read-only
//! afterwards.

use crate::error::ClientError;
use crate::lookup::MealFilterStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const RATE_HAWK: &str = "rate_hawk";
pub const GOGLOBAL: &str = "goglobal";
pub const TBO: &str = "tbo";

pub const DEFAULT_CURRENCY: &str = "EUR";
pub const DEFAULT_NATIONALITY: &str = "PL";

// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub call_timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            call_timeout_ms: 30000,
            reset_timeout_ms: 60000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.failure_threshold == 0 {
            return Err(ClientError::ConfigError(
                "failure_threshold must be positive".to_string(),
            ));
        }
        if self.call_timeout_ms == 0 {
            return Err(ClientError::ConfigError(
                "call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.reset_timeout_ms == 0 {
            return Err(ClientError::ConfigError(
                "reset_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// Retry configuration. `max_retries` counts attempts after the first one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry `k` (1-based): `base_delay * 2^(k-1)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32);
        let factor = 1u64 << exponent;
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

// HTTP connection pool settings, applied to every pooled client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub dns_cache_ttl_secs: u64,
    pub keepalive_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_connections_per_host: 20,
            dns_cache_ttl_secs: 300,
            keepalive_secs: 30,
            connect_timeout_ms: 30000,
        }
    }
}

/// How a supplier authenticates.
///
/// `Basic` credentials travel on every request, so suppliers using it get a
/// dedicated client. `ApiKey` credentials are embedded in the request body.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMode {
    None,
    Basic {
        username: String,
        password: String,
    },
    ApiKey {
        agency_id: String,
        username: String,
        password: String,
    },
}

// Keep credentials out of logs
impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::None => write!(f, "None"),
            AuthMode::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
            AuthMode::ApiKey {
                agency_id,
                username,
                ..
            } => f
                .debug_struct("ApiKey")
                .field("agency_id", agency_id)
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

impl AuthMode {
    pub fn needs_dedicated_session(&self) -> bool {
        matches!(self, AuthMode::Basic { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierConfig {
    pub id: String,
    pub base_url: String,
    pub auth: AuthMode,
    #[serde(default = "default_supplier_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub breaker: CircuitBreakerConfig,
    #[serde(default = "default_meal_strategy")]
    pub meal_strategy: MealFilterStrategy,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_supplier_timeout_ms() -> u64 {
    30000
}

fn default_meal_strategy() -> MealFilterStrategy {
    MealFilterStrategy::NotSupported
}

fn default_active() -> bool {
    true
}

impl SupplierConfig {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            auth: AuthMode::None,
            timeout_ms: default_supplier_timeout_ms(),
            breaker: CircuitBreakerConfig::default(),
            meal_strategy: default_meal_strategy(),
            active: true,
        }
    }

    pub fn rate_hawk() -> Self {
        Self {
            auth: AuthMode::Basic {
                username: String::new(),
                password: String::new(),
            },
            timeout_ms: 30000,
            meal_strategy: MealFilterStrategy::ResponseLevel,
            ..Self::new(
                RATE_HAWK,
                "https://api.worldota.net/api/b2b/v3/search/serp/hotels/",
            )
        }
    }

    pub fn goglobal() -> Self {
        Self {
            auth: AuthMode::ApiKey {
                agency_id: String::new(),
                username: String::new(),
                password: String::new(),
            },
            timeout_ms: 45000,
            meal_strategy: MealFilterStrategy::RequestLevel,
            ..Self::new(GOGLOBAL, "https://carter.xml.goglobal.travel/xmlwebservice.asmx")
        }
    }

    pub fn tbo() -> Self {
        Self {
            auth: AuthMode::Basic {
                username: String::new(),
                password: String::new(),
            },
            timeout_ms: 25000,
            meal_strategy: MealFilterStrategy::ResponseLevel,
            ..Self::new(TBO, "http://api.tbotechnology.in/TBOHolidays_HotelAPI/search")
        }
    }

    /// Built-in defaults for a known supplier id.
    pub fn builtin(id: &str) -> Option<Self> {
        match id {
            RATE_HAWK => Some(Self::rate_hawk()),
            GOGLOBAL => Some(Self::goglobal()),
            TBO => Some(Self::tbo()),
            _ => None,
        }
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Breaker settings for this supplier. The call timeout never undercuts
    /// the HTTP timeout, since the breaker wraps the whole exchange.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            call_timeout_ms: self.breaker.call_timeout_ms.max(self.timeout_ms),
            ..self.breaker.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.id.trim().is_empty() {
            return Err(ClientError::ConfigError("supplier id is empty".to_string()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ClientError::ConfigError(format!(
                "{}: base_url is empty",
                self.id
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ClientError::ConfigError(format!(
                "{}: timeout_ms must be positive",
                self.id
            )));
        }
        self.breaker
            .validate()
            .map_err(|e| ClientError::ConfigError(format!("{}: {}", self.id, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub suppliers: Vec<SupplierConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
}

fn default_search_timeout_ms() -> u64 {
    10000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            suppliers: vec![
                SupplierConfig::rate_hawk(),
                SupplierConfig::goglobal(),
                SupplierConfig::tbo(),
            ],
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            search_timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl AggregatorConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn supplier(&self, id: &str) -> Option<&SupplierConfig> {
        self.suppliers.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.search_timeout_ms == 0 {
            return Err(ClientError::ConfigError(
                "search_timeout_ms must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for supplier in &self.suppliers {
            supplier.validate()?;
            if !seen.insert(supplier.id.as_str()) {
                return Err(ClientError::ConfigError(format!(
                    "duplicate supplier id: {}",
                    supplier.id
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ClientError> {
        let config: AggregatorConfig =
            serde_json::from_str(json).map_err(|e| ClientError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build the configuration from a key/value source, starting from the
    /// built-in supplier defaults.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self, ClientError> {
        let defaults = AggregatorConfig::default();

        let ids: Vec<String> = match provider.get_string("suppliers") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.suppliers.iter().map(|s| s.id.clone()).collect(),
        };

        let mut suppliers = Vec::with_capacity(ids.len());
        for id in ids {
            suppliers.push(supplier_from_provider(provider, &id)?);
        }

        let mut retry = defaults.retry;
        if let Some(max_retries) = provider.get_parsed("max_retries")? {
            retry.max_retries = max_retries;
        }
        if let Some(base_delay_ms) = provider.get_parsed("retry_base_delay_ms")? {
            retry.base_delay_ms = base_delay_ms;
        }

        let config = AggregatorConfig {
            suppliers,
            retry,
            pool: defaults.pool,
            search_timeout_ms: provider
                .get_parsed("search_timeout_ms")?
                .unwrap_or(defaults.search_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

fn supplier_from_provider(
    provider: &dyn ConfigProvider,
    id: &str,
) -> Result<SupplierConfig, ClientError> {
    let key = |name: &str| format!("{}_{}", id, name);

    let mut supplier = match SupplierConfig::builtin(id) {
        Some(builtin) => builtin,
        None => {
            let base_url = provider.get_string(&key("base_url")).ok_or_else(|| {
                ClientError::ConfigError(format!("{}: base_url is required", id))
            })?;
            SupplierConfig::new(id, base_url)
        }
    };

    if let Some(base_url) = provider.get_string(&key("base_url")) {
        supplier.base_url = base_url;
    }
    if let Some(timeout_ms) = provider.get_parsed(&key("timeout_ms"))? {
        supplier.timeout_ms = timeout_ms;
    }
    if let Some(active) = provider.get_parsed(&key("active"))? {
        supplier.active = active;
    }
    if let Some(threshold) = provider.get_parsed(&key("failure_threshold"))? {
        supplier.breaker.failure_threshold = threshold;
    }
    if let Some(reset_timeout_ms) = provider.get_parsed(&key("reset_timeout_ms"))? {
        supplier.breaker.reset_timeout_ms = reset_timeout_ms;
    }
    if let Some(strategy) = provider.get_parsed::<MealFilterStrategy>(&key("meal_strategy"))? {
        supplier.meal_strategy = strategy;
    }

    let username = provider.get_string(&key("username"));
    let password = provider.get_string(&key("password")).unwrap_or_default();
    match (provider.get_string(&key("agency_id")), username) {
        (Some(agency_id), username) => {
            supplier.auth = AuthMode::ApiKey {
                agency_id,
                username: username.unwrap_or_default(),
                password,
            };
        }
        (None, Some(username)) => {
            supplier.auth = AuthMode::Basic { username, password };
        }
        (None, None) => {}
    }

    Ok(supplier)
}

/// Source of raw configuration values.
pub trait ConfigProvider: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;
}

pub trait ConfigProviderExt {
    /// Parse a value; a missing key is `Ok(None)`, a malformed one an error.
    fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ClientError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::fmt::Display;
}

impl<P: ConfigProvider + ?Sized> ConfigProviderExt for P {
    fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ClientError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::fmt::Display,
    {
        match self.get_string(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
                ClientError::ConfigError(format!("invalid value for {}: {}", key, e))
            }),
        }
    }
}

/// Environment variables, e.g. `AGGREGATOR_RATE_HAWK_USERNAME`.
#[derive(Debug, Clone, Default)]
pub struct EnvConfigProvider {
    prefix: Option<String>,
}

impl EnvConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn format_key(&self, key: &str) -> String {
        let key = key
            .to_uppercase()
            .replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        match &self.prefix {
            Some(prefix) => format!("{}_{}", prefix, key),
            None => key,
        }
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn get_string(&self, key: &str) -> Option<String> {
        env::var(self.format_key(key)).ok()
    }
}

// In-memory provider for tests and static setups
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigProvider {
    values: HashMap<String, String>,
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.values.insert(key.into(), value.to_string());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}
