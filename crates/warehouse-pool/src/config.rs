//! Pool configuration.

use std::fmt;
use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection pool.
///
/// The value is immutable once handed to [`Pool::new`](crate::Pool::new);
/// every field has a default suitable for a small interactive workload.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of connections the pool keeps open.
    pub min_size: usize,

    /// Maximum number of connections the pool may open.
    pub max_size: usize,

    /// Maximum time a caller waits for a lease.
    pub acquire_timeout: Duration,

    /// Age after which a lease is considered stale and is evicted.
    pub idle_timeout: Duration,

    /// Interval between background reaper runs.
    pub validation_interval: Duration,

    /// Number of factory calls made per connection creation.
    pub retry_attempts: u32,

    /// Base delay for exponential creation backoff.
    pub retry_base_delay: Duration,

    /// Upper bound for a single backoff delay.
    pub retry_max_delay: Duration,

    /// Deadline for a single factory call.
    pub connect_timeout: Duration,

    /// Deadline for a single liveness ping.
    pub validation_timeout: Duration,

    /// Circuit breaker guarding connection creation, if enabled.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Resolved warehouse endpoint, passed through to the factory.
    pub endpoint: EndpointConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(1800),
            validation_interval: Duration::from_secs(60),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            validation_timeout: Duration::from_secs(5),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set the number of creation attempts.
    #[must_use]
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set the base backoff delay.
    #[must_use]
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Set the per-call connect deadline.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-ping validation deadline.
    #[must_use]
    pub fn validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Configure or disable the creation circuit breaker.
    #[must_use]
    pub fn circuit_breaker(mut self, breaker: Option<CircuitBreakerConfig>) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Set the warehouse endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_size == 0 {
            return Err(PoolError::Config("min_size must be greater than 0".into()));
        }
        if self.max_size == 0 {
            return Err(PoolError::Config("max_size must be greater than 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Config(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.retry_attempts == 0 {
            return Err(PoolError::Config(
                "retry_attempts must be at least 1".into(),
            ));
        }

        let durations = [
            ("acquire_timeout", self.acquire_timeout),
            ("idle_timeout", self.idle_timeout),
            ("validation_interval", self.validation_interval),
            ("connect_timeout", self.connect_timeout),
            ("validation_timeout", self.validation_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(PoolError::Config(format!("{name} must be non-zero")));
            }
        }

        if let Some(breaker) = &self.circuit_breaker {
            if breaker.failure_threshold == 0 {
                return Err(PoolError::Config(
                    "circuit breaker failure_threshold must be at least 1".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Settings for the connection-creation circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed creations that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial creation.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Credentials used to authenticate a warehouse session.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No credentials (e.g. local development endpoints).
    None,
    /// Username/password authentication.
    Password(String),
    /// Key-pair authentication using a private key file.
    KeyPair {
        /// Path to the PEM-encoded private key.
        private_key_path: String,
        /// Passphrase for an encrypted private key.
        passphrase: Option<String>,
    },
    /// Pre-issued bearer token (OAuth or programmatic access token).
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyPair {
                private_key_path, ..
            } => f
                .debug_struct("KeyPair")
                .field("private_key_path", private_key_path)
                .field("passphrase", &"<redacted>")
                .finish(),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Resolved connection details for the warehouse endpoint.
///
/// The pool never inspects these fields; they are handed unchanged to the
/// [`ConnectionFactory`](crate::ConnectionFactory) on every creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Account identifier.
    pub account: String,
    /// Host name (derived from the account when empty).
    pub host: Option<String>,
    /// Port (default: 443).
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Authentication credentials.
    pub credentials: Credentials,
    /// Compute warehouse to run sessions on.
    pub warehouse: Option<String>,
    /// Default database.
    pub database: Option<String>,
    /// Default schema.
    pub schema: Option<String>,
    /// Session role.
    pub role: Option<String>,
    /// Application name reported to the service.
    pub application: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            host: None,
            port: 443,
            user: String::new(),
            credentials: Credentials::None,
            warehouse: None,
            database: None,
            schema: None,
            role: None,
            application: "warehouse-pool".to_string(),
        }
    }
}

impl EndpointConfig {
    /// Parse a `key=value;key=value` connection string.
    ///
    /// ```text
    /// account=acme-eu1;user=etl;password=secret;warehouse=REPORTING;database=ANALYTICS
    /// ```
    ///
    /// Unknown keys are ignored for forward compatibility.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();
        let mut private_key_path = None;
        let mut passphrase = None;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "account" => config.account = value.to_string(),
                "host" | "server" => config.host = Some(value.to_string()),
                "port" => {
                    config.port = value
                        .parse()
                        .map_err(|_| PoolError::Config(format!("invalid port: {value}")))?;
                }
                "user" | "username" | "uid" => config.user = value.to_string(),
                "password" | "pwd" => config.credentials = Credentials::Password(value.to_string()),
                "token" => config.credentials = Credentials::Token(value.to_string()),
                "private_key_file" | "private_key_path" => {
                    private_key_path = Some(value.to_string());
                }
                "private_key_passphrase" => passphrase = Some(value.to_string()),
                "warehouse" => config.warehouse = Some(value.to_string()),
                "database" | "db" => config.database = Some(value.to_string()),
                "schema" => config.schema = Some(value.to_string()),
                "role" => config.role = Some(value.to_string()),
                "application" | "app" => config.application = value.to_string(),
                _ => {
                    tracing::debug!(key = key, "ignoring unknown connection string option");
                }
            }
        }

        if let Some(private_key_path) = private_key_path {
            config.credentials = Credentials::KeyPair {
                private_key_path,
                passphrase,
            };
        }

        if config.account.is_empty() && config.host.is_none() {
            return Err(PoolError::Config(
                "connection string must name an account or host".into(),
            ));
        }

        Ok(config)
    }

    /// Host name to connect to.
    #[must_use]
    pub fn resolved_host(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!("{}.warehouse.cloud", self.account),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        PoolConfig::default().validate().unwrap();
    }

    #[test]
    fn test_size_rules() {
        assert!(PoolConfig::new().min_size(0).validate().is_err());
        assert!(PoolConfig::new().max_size(0).min_size(0).validate().is_err());
        assert!(PoolConfig::new().min_size(5).max_size(2).validate().is_err());
        assert!(PoolConfig::new().min_size(2).max_size(2).validate().is_ok());
    }

    #[test]
    fn test_retry_and_duration_rules() {
        assert!(PoolConfig::new().retry_attempts(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .acquire_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        // Zero base delay means retry immediately.
        assert!(
            PoolConfig::new()
                .retry_base_delay(Duration::ZERO)
                .validate()
                .is_ok()
        );

        let err = PoolConfig::new()
            .circuit_breaker(Some(CircuitBreakerConfig {
                failure_threshold: 0,
                cooldown: Duration::from_secs(1),
            }))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[test]
    fn test_parse_connection_string() {
        let endpoint = EndpointConfig::from_connection_string(
            "account=acme-eu1; user=etl; password=secret; warehouse=REPORTING; \
             database=ANALYTICS; schema=PUBLIC; role=LOADER; port=8443",
        )
        .unwrap();

        assert_eq!(endpoint.account, "acme-eu1");
        assert_eq!(endpoint.user, "etl");
        assert_eq!(endpoint.credentials, Credentials::Password("secret".into()));
        assert_eq!(endpoint.warehouse.as_deref(), Some("REPORTING"));
        assert_eq!(endpoint.database.as_deref(), Some("ANALYTICS"));
        assert_eq!(endpoint.schema.as_deref(), Some("PUBLIC"));
        assert_eq!(endpoint.role.as_deref(), Some("LOADER"));
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.resolved_host(), "acme-eu1.warehouse.cloud");
    }

    #[test]
    fn test_parse_key_pair_credentials() {
        let endpoint = EndpointConfig::from_connection_string(
            "host=wh.internal;user=svc;private_key_file=/keys/svc.p8;private_key_passphrase=pp",
        )
        .unwrap();

        assert_eq!(endpoint.resolved_host(), "wh.internal");
        assert_eq!(
            endpoint.credentials,
            Credentials::KeyPair {
                private_key_path: "/keys/svc.p8".into(),
                passphrase: Some("pp".into()),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_input() {
        assert!(EndpointConfig::from_connection_string("account").is_err());
        assert!(EndpointConfig::from_connection_string("account=a;port=abc").is_err());
        assert!(EndpointConfig::from_connection_string("user=etl").is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let rendered = format!("{:?}", Credentials::Password("hunter2".into()));
        assert!(!rendered.contains("hunter2"));

        let rendered = format!(
            "{:?}",
            Credentials::KeyPair {
                private_key_path: "/k".into(),
                passphrase: Some("hunter2".into()),
            }
        );
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("/k"));
    }
}
