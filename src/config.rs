use crate::dispatch::{RerouteMode, RetryPolicy};
use crate::engine::{RuleSettings, Ruleset};
use crate::errors::ConfigError;
use crate::firehose::FirehoseStart;
use crate::identity::is_valid_did;
use crate::identity::memory::CacheConfig;
use crate::scheduler::{ScalingPolicy, SchedulerConfig};
use deadpool_redis::{Pool, Runtime};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

const RATELIMIT_BYPASS_HEADER: &str = "x-ratelimit-bypass";

/// Diagnostics listen address.
///
/// Accepts `host:port` or the `:port` shorthand, which binds every interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenAddr(SocketAddr);

/// Per-request timeout applied to every outbound HTTP call.
#[derive(Clone, Debug)]
pub struct HttpClientTimeout(Duration);

/// DID under which this service writes moderation events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorDid(String);

/// Identity cache capacity, in entries.
#[derive(Clone, Debug)]
pub struct IdentityCacheSize(usize);

impl Default for IdentityCacheSize {
    fn default() -> Self {
        Self(1_500_000)
    }
}

impl TryFrom<String> for IdentityCacheSize {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        let size = value
            .trim()
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidValue {
                var_name: "IDENTITY_CACHE_SIZE".to_string(),
                details: format!("not a number: {}", value),
            })?;

        if size == 0 {
            return Err(ConfigError::InvalidValue {
                var_name: "IDENTITY_CACHE_SIZE".to_string(),
                details: "cache size must be greater than 0".to_string(),
            });
        }

        Ok(Self(size))
    }
}

impl AsRef<usize> for IdentityCacheSize {
    fn as_ref(&self) -> &usize {
        &self.0
    }
}

/// One remote moderation service that receives rerouted events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RerouteDestination {
    pub host: String,
    pub did: String,
    pub token: String,
}

impl FromStr for RerouteDestination {
    type Err = ConfigError;

    /// Parses `host|did|token`.
    fn from_str(value: &str) -> Result<Self> {
        let invalid = || ConfigError::InvalidRerouteDestination {
            value: redact_token(value),
        };
        let mut parts = value.trim().splitn(3, '|').map(str::trim);
        let host = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let did = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let token = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

        if !has_scheme(host, &["http", "https"]) {
            return Err(invalid());
        }
        if !is_valid_did(did) {
            return Err(ConfigError::InvalidDid {
                did: did.to_string(),
            });
        }

        Ok(Self {
            host: host.trim_end_matches('/').to_string(),
            did: did.to_string(),
            token: token.to_string(),
        })
    }
}

fn has_scheme(value: &str, schemes: &[&str]) -> bool {
    url::Url::parse(value)
        .map(|parsed| schemes.contains(&parsed.scheme()) && parsed.host_str().is_some())
        .unwrap_or(false)
}

fn redact_token(value: &str) -> String {
    match value.rsplit_once('|') {
        Some((head, _)) => format!("{}|***", head),
        None => value.to_string(),
    }
}

/// Parse `REROUTE_DESTINATIONS`: `host|did|token` entries separated by `;`.
pub fn parse_reroute_destinations(value: &str) -> Result<Vec<RerouteDestination>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(RerouteDestination::from_str)
        .collect()
}

/// Parse `<n>ms`, `<n>s`, `<n>m`, `<n>h`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidDuration {
        value: value.to_string(),
    };

    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(index) => value.split_at(index),
        None => (value, "s"),
    };
    let number: u64 = number.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(number.saturating_mul(3600))),
        _ => Err(invalid()),
    }
}

/// Which cache sits in front of the identity resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityBackend {
    Memory,
    Redis,
}

impl FromStr for IdentityBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::InvalidValue {
                var_name: "IDENTITY_DIRECTORY".to_string(),
                details: format!("expected memory or redis, got {}", other),
            }),
        }
    }
}

/// Outbound HTTP client settings shared by every downstream client.
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: HttpClientTimeout,
    pub ratelimit_bypass: Option<String>,
}

impl HttpClientConfig {
    pub fn from_env(version: &str) -> Result<Self> {
        let default_user_agent = format!("automod/{}", version);
        Ok(Self {
            user_agent: default_env("USER_AGENT", &default_user_agent),
            timeout: default_env("HTTP_CLIENT_TIMEOUT", "15s").try_into()?,
            ratelimit_bypass: non_empty(optional_env("RATELIMIT_BYPASS")),
        })
    }

    /// Build the client, attaching the rate-limit bypass header when configured.
    pub fn build(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        if let Some(bypass) = &self.ratelimit_bypass {
            let value = HeaderValue::from_str(bypass).map_err(|e| ConfigError::InvalidValue {
                var_name: "RATELIMIT_BYPASS".to_string(),
                details: e.to_string(),
            })?;
            headers.insert(HeaderName::from_static(RATELIMIT_BYPASS_HEADER), value);
        }

        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(*self.timeout.as_ref())
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                var_name: "HTTP_CLIENT_TIMEOUT".to_string(),
                details: format!("failed to build HTTP client: {}", e),
            })
    }
}

#[derive(Clone, Debug)]
pub struct IdentityConfig {
    pub plc_host: String,
    pub appview_host: String,
    pub plc_rate_limit: u32,
    pub backend: IdentityBackend,
    pub cache_size: IdentityCacheSize,
    pub cache_ttl: Duration,
    pub negative_ttl: Duration,
    /// Bound on one lookup from the worker path.
    pub lookup_timeout: Duration,
}

impl IdentityConfig {
    pub fn from_env(redis_configured: bool) -> Result<Self> {
        let cache_size: IdentityCacheSize = {
            let env_value = optional_env("IDENTITY_CACHE_SIZE");
            if env_value.is_empty() {
                IdentityCacheSize::default()
            } else {
                env_value.try_into()?
            }
        };

        let backend = match non_empty(optional_env("IDENTITY_DIRECTORY")) {
            Some(value) => value.parse()?,
            None if redis_configured => IdentityBackend::Redis,
            None => IdentityBackend::Memory,
        };

        Ok(Self {
            plc_host: default_env("ATP_PLC_HOST", "https://plc.directory"),
            appview_host: default_env("ATP_BSKY_HOST", "https://public.api.bsky.app"),
            plc_rate_limit: parse_number("PLC_RATE_LIMIT", "100")?,
            backend,
            cache_size,
            cache_ttl: Duration::from_secs(
                parse_number::<u64>("IDENTITY_CACHE_TTL_MINUTES", "1440")? * 60,
            ),
            negative_ttl: Duration::from_secs(parse_number(
                "IDENTITY_NEGATIVE_TTL_SECONDS",
                "120",
            )?),
            lookup_timeout: env_duration("IDENTITY_TIMEOUT", "10s")?,
        })
    }

    pub fn validate(&self, redis_configured: bool) -> Result<()> {
        if self.plc_rate_limit == 0 {
            return Err(ConfigError::InvalidValue {
                var_name: "PLC_RATE_LIMIT".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        if self.backend == IdentityBackend::Redis && !redis_configured {
            return Err(ConfigError::EnvVarRequired {
                var_name: "REDIS_URL".to_string(),
            });
        }
        if self.cache_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                var_name: "IDENTITY_CACHE_TTL_MINUTES".to_string(),
                details: "TTL must be greater than 0 minutes".to_string(),
            });
        }
        Ok(())
    }

    /// Registry host as the identity resolver expects it: no scheme, no path.
    pub fn plc_hostname(&self) -> String {
        match url::Url::parse(&self.plc_host) {
            Ok(url) if url.host_str().is_some() => {
                let host = url.host_str().unwrap_or_default();
                match url.port() {
                    Some(port) => format!("{}:{}", host, port),
                    None => host.to_string(),
                }
            }
            _ => self.plc_host.trim_end_matches('/').to_string(),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: *self.cache_size.as_ref(),
            ttl: chrono::Duration::from_std(self.cache_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            negative_ttl: chrono::Duration::from_std(self.negative_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(2)),
        }
    }
}

/// Worker pool sizing and scheduler bounds.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Fixed worker count; `0` hands sizing to the auto-scaler.
    pub parallelism: usize,
    pub scaling: ScalingPolicy,
    pub scale_interval: Duration,
    pub scheduler: SchedulerConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            parallelism: parse_number("FIREHOSE_PARALLELISM", "0")?,
            scaling: ScalingPolicy {
                min_workers: parse_number("WORKERS_MIN", "4")?,
                max_workers: parse_number("WORKERS_MAX", "256")?,
                high_water: parse_number("SCALE_HIGH_WATER", "64")?,
                step: parse_number("SCALE_STEP", "4")?,
                idle_cooldown: env_duration("SCALE_IDLE_COOLDOWN", "30s")?,
            },
            scale_interval: env_duration("SCALE_INTERVAL", "1s")?,
            scheduler: SchedulerConfig {
                max_pending: parse_number("MAX_PENDING_EVENTS", "10000")?,
                max_repo_depth: parse_number("MAX_REPO_QUEUE_DEPTH", "500")?,
                event_timeout: env_duration("EVENT_TIMEOUT", "60s")?,
                ..SchedulerConfig::default()
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            self.scaling
                .validate()
                .map_err(|e| ConfigError::InvalidValue {
                    var_name: "WORKERS_MIN".to_string(),
                    details: e.to_string(),
                })?;
        }
        if self.scheduler.max_pending == 0 || self.scheduler.max_repo_depth == 0 {
            return Err(ConfigError::InvalidValue {
                var_name: "MAX_PENDING_EVENTS".to_string(),
                details: "queue bounds must be at least 1".to_string(),
            });
        }
        if self.scale_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                var_name: "SCALE_INTERVAL".to_string(),
                details: "interval must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Workers started before the first scaling decision.
    pub fn initial_workers(&self) -> usize {
        if self.parallelism > 0 {
            self.parallelism
        } else {
            self.scaling.min_workers
        }
    }
}

/// Credentials for the local moderation service.
#[derive(Clone, Debug)]
pub struct OzoneConfig {
    pub host: String,
    pub operator_did: OperatorDid,
    pub admin_token: String,
}

/// Credentials for the account host.
#[derive(Clone, Debug)]
pub struct PdsConfig {
    pub host: String,
    pub admin_token: String,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    pub reroute_mode: RerouteMode,
    pub reroute_destinations: Vec<RerouteDestination>,
    pub ozone: Option<OzoneConfig>,
    pub pds: Option<PdsConfig>,
    pub slack_webhook_url: Option<String>,
}

impl DispatchConfig {
    pub fn from_env(attempt_timeout: Duration) -> Result<Self> {
        let ozone = match non_empty(optional_env("OZONE_ADMIN_TOKEN")) {
            Some(admin_token) => Some(OzoneConfig {
                host: default_env("ATP_OZONE_HOST", "https://mod.bsky.app"),
                operator_did: require_env("OZONE_DID").and_then(|value| value.try_into())?,
                admin_token,
            }),
            None => None,
        };

        let pds = non_empty(optional_env("PDS_ADMIN_TOKEN")).map(|admin_token| PdsConfig {
            host: default_env("ATP_PDS_HOST", "https://bsky.social"),
            admin_token,
        });

        Ok(Self {
            retry: RetryPolicy {
                max_attempts: parse_number("DISPATCH_MAX_ATTEMPTS", "5")?,
                base_delay: env_duration("DISPATCH_RETRY_DELAY", "500ms")?,
                max_delay: env_duration("DISPATCH_MAX_RETRY_DELAY", "30s")?,
                attempt_timeout,
            },
            reroute_mode: default_env("REROUTE_EVENTS", "off").parse()?,
            reroute_destinations: parse_reroute_destinations(&optional_env(
                "REROUTE_DESTINATIONS",
            ))?,
            ozone,
            pds,
            slack_webhook_url: non_empty(optional_env("SLACK_WEBHOOK_URL")),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                var_name: "DISPATCH_MAX_ATTEMPTS".to_string(),
                details: "must be at least 1".to_string(),
            });
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidValue {
                var_name: "DISPATCH_RETRY_DELAY".to_string(),
                details: "first delay exceeds DISPATCH_MAX_RETRY_DELAY".to_string(),
            });
        }
        if self.reroute_mode != RerouteMode::Off && self.reroute_destinations.is_empty() {
            return Err(ConfigError::EnvVarRequired {
                var_name: "REROUTE_DESTINATIONS".to_string(),
            });
        }
        if self.pds.is_some() && self.ozone.is_none() {
            tracing::warn!("PDS_ADMIN_TOKEN is set without OZONE_ADMIN_TOKEN; takedowns stay in dry run");
        }
        Ok(())
    }

    /// Operator DIDs whose moderation events are never replayed.
    pub fn excluded_creators(&self) -> Vec<String> {
        self.ozone
            .iter()
            .map(|ozone| ozone.operator_did.as_str().to_string())
            .chain(self.reroute_destinations.iter().map(|d| d.did.clone()))
            .collect()
    }
}

/// Service configuration, loaded from the environment.
///
/// ```rust,ignore
/// let config = automod::config::Config::new()?;
/// println!("relay: {}", config.relay_host);
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub relay_host: String,
    pub firehose_start: FirehoseStart,
    pub redis_url: Option<String>,
    pub cursor_file: Option<String>,
    pub sets_json_path: Option<String>,
    pub ruleset: Ruleset,
    pub rules: RuleSettings,
    pub http: HttpClientConfig,
    pub identity: IdentityConfig,
    pub workers: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub metrics_listen: ListenAddr,
    pub statsd_host: Option<String>,
    pub cursor_persist_interval: Duration,
    pub ozone_poll_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load and validate every setting. Any invalid value is fatal.
    pub fn new() -> Result<Self> {
        let version = version()?;
        let redis_url = non_empty(optional_env("REDIS_URL"));

        let http = HttpClientConfig::from_env(&version)?;
        let identity = IdentityConfig::from_env(redis_url.is_some())?;
        let workers = WorkerConfig::from_env()?;
        let dispatch = DispatchConfig::from_env(*http.timeout.as_ref())?;

        let config = Self {
            relay_host: default_env("ATP_RELAY_HOST", "wss://bsky.network"),
            firehose_start: default_env("FIREHOSE_START", "latest").parse()?,
            cursor_file: non_empty(optional_env("CURSOR_FILE")),
            sets_json_path: non_empty(optional_env("SETS_JSON_PATH")),
            ruleset: default_env("RULESET", "default").try_into()?,
            rules: RuleSettings {
                burst_threshold: parse_number("RULE_BURST_THRESHOLD", "30")?,
                burst_window: env_duration("RULE_BURST_WINDOW", "1h")?,
            },
            metrics_listen: default_env("METRICS_LISTEN", ":3989").try_into()?,
            statsd_host: non_empty(optional_env("METRICS_STATSD_HOST")),
            cursor_persist_interval: env_duration("CURSOR_PERSIST_INTERVAL", "5s")?,
            ozone_poll_interval: env_duration("OZONE_POLL_INTERVAL", "5s")?,
            shutdown_timeout: env_duration("SHUTDOWN_TIMEOUT", "30s")?,
            version,
            redis_url,
            http,
            identity,
            workers,
            dispatch,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !has_scheme(&self.relay_host, &["ws", "wss"]) {
            return Err(ConfigError::InvalidValue {
                var_name: "ATP_RELAY_HOST".to_string(),
                details: format!("expected a ws:// or wss:// URL, got {}", self.relay_host),
            });
        }
        for (var_name, interval) in [
            ("CURSOR_PERSIST_INTERVAL", self.cursor_persist_interval),
            ("OZONE_POLL_INTERVAL", self.ozone_poll_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    var_name: var_name.to_string(),
                    details: "interval must be greater than 0".to_string(),
                });
            }
        }
        self.identity.validate(self.redis_url.is_some())?;
        self.workers.validate()?;
        self.dispatch.validate()?;
        Ok(())
    }
}

/// Create a Redis connection pool from a Redis URL.
pub fn create_redis_pool(redis_url: &str) -> Result<Pool> {
    deadpool_redis::Config::from_url(redis_url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|err| ConfigError::InvalidValue {
            var_name: "REDIS_URL".to_string(),
            details: format!("failed to create Redis pool: {}", err),
        })
}

fn require_env(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarRequired {
        var_name: name.to_string(),
    })
}

/// Retrieves an optional environment variable, returning an empty string if not set.
fn optional_env(name: &str) -> String {
    std::env::var(name).unwrap_or("".to_string())
}

/// Retrieves an environment variable with a default value if not set.
fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or(default_value.to_string())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn env_duration(name: &str, default_value: &str) -> Result<Duration> {
    parse_duration(&default_env(name, default_value))
}

fn parse_number<T: FromStr>(name: &str, default_value: &str) -> Result<T> {
    let value = default_env(name, default_value);
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            var_name: name.to_string(),
            details: format!("not a number: {}", value),
        })
}

/// Retrieves the service version from compile-time environment variables.
///
/// `GIT_HASH` wins over `CARGO_PKG_VERSION` when both are set.
pub fn version() -> Result<String> {
    option_env!("GIT_HASH")
        .or(option_env!("CARGO_PKG_VERSION"))
        .map(|val| val.to_string())
        .ok_or(ConfigError::VersionNotAvailable)
}

impl TryFrom<String> for ListenAddr {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        let trimmed = value.trim();
        let candidate = if trimmed.starts_with(':') {
            format!("0.0.0.0{}", trimmed)
        } else {
            trimmed.to_string()
        };
        candidate
            .parse::<SocketAddr>()
            .map(Self)
            .map_err(|_| ConfigError::InvalidListenAddress { value })
    }
}

impl AsRef<SocketAddr> for ListenAddr {
    fn as_ref(&self) -> &SocketAddr {
        &self.0
    }
}

impl AsRef<Duration> for HttpClientTimeout {
    fn as_ref(&self) -> &Duration {
        &self.0
    }
}

impl TryFrom<String> for HttpClientTimeout {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        if value.trim().is_empty() {
            return Ok(Self(Duration::from_secs(15)));
        }
        let timeout = parse_duration(&value)?;
        if timeout.is_zero() {
            return Err(ConfigError::InvalidDuration { value });
        }
        Ok(Self(timeout))
    }
}

impl AsRef<String> for OperatorDid {
    fn as_ref(&self) -> &String {
        &self.0
    }
}

impl OperatorDid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OperatorDid {
    type Error = ConfigError;
    fn try_from(value: String) -> Result<Self> {
        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(ConfigError::InvalidDid {
                did: "(empty)".to_string(),
            });
        }
        if !is_valid_did(&value) {
            return Err(ConfigError::InvalidDid { did: value });
        }
        Ok(Self(value))
    }
}
