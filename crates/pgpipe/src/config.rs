//! PostgreSQL connection configuration.
//!
//! Describes how to reach the server and how the pipeline names its
//! prepared statements. The session layer consumes it as a libpq
//! keyword/value connection string (see [`PgConfig::to_conninfo`]).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Prefix of every generated prepared-statement handle name.
pub const STATEMENT_NAME_PREFIX: &str = "pgpipe_";

/// Default number of random characters after the handle prefix.
pub const DEFAULT_STATEMENT_NAME_LEN: usize = 8;

/// SSL mode for PostgreSQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    Disable,
    /// Try SSL, fall back to non-SSL if unavailable
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
    /// Require SSL and verify server certificate
    VerifyCa,
    /// Require SSL and verify server certificate matches hostname
    VerifyFull,
}

impl SslMode {
    /// The libpq `sslmode` keyword value.
    pub const fn as_libpq(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Prefer => "prefer",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull
        )
    }
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// Hostname, IP address or socket directory
    pub host: String,
    /// Port number (default: 5432)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication (optional for trust auth)
    pub password: Option<String>,
    /// Database name to connect to
    pub database: String,
    /// Application name (visible in pg_stat_activity)
    pub application_name: Option<String>,
    /// Connection timeout, rounded to whole seconds for libpq
    pub connect_timeout: Duration,
    /// SSL mode
    pub ssl_mode: SslMode,
    /// Additional libpq keywords
    pub options: BTreeMap<String, String>,
    /// Verbatim connection string; when set, every field above is ignored
    pub conninfo: Option<String>,
    /// Random characters per generated statement handle name
    pub statement_name_len: usize,
}

impl Default for PgConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: String::new(),
            password: None,
            database: String::new(),
            application_name: None,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            options: BTreeMap::new(),
            conninfo: None,
            statement_name_len: DEFAULT_STATEMENT_NAME_LEN,
        }
    }
}

impl PgConfig {
    /// Create a new configuration with the given connection string components.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Use a ready-made libpq connection string (`"host=... dbname=..."` or a
    /// `postgresql://` URI) instead of the individual fields.
    pub fn from_conninfo(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: Some(conninfo.into()),
            ..Default::default()
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the SSL mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Set an additional connection option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Set the number of random characters in statement handle names.
    ///
    /// Clamped to at least 1.
    pub fn statement_name_len(mut self, len: usize) -> Self {
        self.statement_name_len = len.max(1);
        self
    }

    /// Render the libpq keyword/value connection string.
    pub fn to_conninfo(&self) -> String {
        if let Some(raw) = &self.conninfo {
            return raw.clone();
        }

        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            if !out.is_empty() {
                out.push(' ');
            }
            let _ = write!(out, "{}={}", key, quote_conninfo_value(value));
        };

        push("host", &self.host);
        push("port", &self.port.to_string());
        if !self.user.is_empty() {
            push("user", &self.user);
        }
        if let Some(password) = &self.password {
            push("password", password);
        }
        if !self.database.is_empty() {
            push("dbname", &self.database);
        }
        if let Some(app_name) = &self.application_name {
            push("application_name", app_name);
        }
        // libpq treats 0 as "wait forever", so round sub-second timeouts up.
        let secs = self.connect_timeout.as_secs().max(1);
        push("connect_timeout", &secs.to_string());
        push("sslmode", self.ssl_mode.as_libpq());
        push("client_encoding", "UTF8");

        for (k, v) in &self.options {
            push(k, v);
        }

        out
    }

    /// Get the socket address string, for logging.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Quote a conninfo value when it is empty or contains whitespace, quotes
/// or backslashes.
fn quote_conninfo_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = PgConfig::new("localhost", "postgres", "testdb")
            .port(5433)
            .password("secret")
            .application_name("myapp")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Require)
            .option("options", "-c search_path=app")
            .statement_name_len(12);

        assert_eq!(config.port, 5433);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.ssl_mode, SslMode::Require);
        assert_eq!(config.statement_name_len, 12);
        assert_eq!(config.socket_addr(), "localhost:5433");
    }

    #[test]
    fn test_conninfo_rendering() {
        let config = PgConfig::new("db.internal", "app", "orders")
            .password("p@ss word")
            .connect_timeout(Duration::from_secs(5))
            .ssl_mode(SslMode::VerifyFull);

        assert_eq!(
            config.to_conninfo(),
            "host=db.internal port=5432 user=app password='p@ss word' dbname=orders \
             connect_timeout=5 sslmode=verify-full client_encoding=UTF8"
        );
    }

    #[test]
    fn test_conninfo_quoting() {
        assert_eq!(quote_conninfo_value("plain"), "plain");
        assert_eq!(quote_conninfo_value(""), "''");
        assert_eq!(quote_conninfo_value("it's"), r"'it\'s'");
        assert_eq!(quote_conninfo_value(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn test_raw_conninfo_wins() {
        let config = PgConfig::from_conninfo("postgresql://u@h/db").port(1);
        assert_eq!(config.to_conninfo(), "postgresql://u@h/db");
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        let config = PgConfig::default().connect_timeout(Duration::from_millis(200));
        assert!(config.to_conninfo().contains("connect_timeout=1"));
    }

    #[test]
    fn test_statement_name_len_clamped() {
        assert_eq!(PgConfig::default().statement_name_len, 8);
        assert_eq!(PgConfig::default().statement_name_len(0).statement_name_len, 1);
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert_eq!(SslMode::default(), SslMode::Prefer);
        assert_eq!(SslMode::VerifyCa.as_libpq(), "verify-ca");
        assert!(!SslMode::Disable.is_required());
        assert!(!SslMode::Prefer.is_required());
        assert!(SslMode::Require.is_required());
        assert!(SslMode::VerifyFull.is_required());
    }
}
