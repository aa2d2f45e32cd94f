//! Connection-string parsing and typed driver options.
//!
//! The connection string is a case-insensitive, synonym-tolerant
//! `Key=Value;` list in the ADO style. Keys are canonicalized by folding
//! case and dropping spaces, then dispatched through an explicit match so
//! every supported key and its validation lives in one place.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

use crate::errors::ConfigError;


/// TLS negotiation policy, ordered by strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "Disable",
            Self::Allow => "Allow",
            Self::Prefer => "Prefer",
            Self::Require => "Require",
            Self::VerifyCa => "VerifyCA",
            Self::VerifyFull => "VerifyFull",
        }
    }

    /// TLS is mandatory; a server refusing the SSLRequest is a hard failure.
    pub fn required(&self) -> bool {
        *self >= SslMode::Require
    }

    /// Server certificate chain must validate.
    pub fn verifies_ca(&self) -> bool {
        *self >= SslMode::VerifyCa
    }

    /// Server hostname must match the certificate.
    pub fn verifies_hostname(&self) -> bool {
        *self == SslMode::VerifyFull
    }
}

/// Selector over reachable hosts by their primary/standby role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSessionAttrs {
    #[default]
    Any,
    Primary,
    Standby,
    PreferPrimary,
    PreferStandby,
    ReadWrite,
    ReadOnly,
}

impl TargetSessionAttrs {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Primary => "primary",
            Self::Standby => "standby",
            Self::PreferPrimary => "prefer-primary",
            Self::PreferStandby => "prefer-standby",
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerCompatibilityMode {
    #[default]
    None,
    Redshift,
    NoTypeLoading,
}

/// One host out of the comma-separated `Host` list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    /// Path-rooted hosts and `@`-prefixed (abstract namespace) hosts select a
    /// unix-domain socket instead of TCP.
    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/') || self.host.starts_with('@')
    }

    /// Socket filename for unix-domain hosts: `<dir>/.s.PGSQL.<port>`.
    /// A leading `@` stands for a NUL byte in the abstract namespace and is
    /// resolved by the stream layer.
    pub fn socket_path(&self) -> String {
        format!("{}/.s.PGSQL.{}", self.host, self.port)
    }
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parsed, validated driver options. Built once from a connection string and
/// immutable afterwards; the pool clones it into its key.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub hosts: Vec<HostSpec>,
    pub port: u16,
    pub database: Option<String>,
    pub username: String,
    pub password: Option<String>,
    pub passfile: Option<String>,

    pub ssl_mode: SslMode,
    pub trust_server_certificate: bool,
    pub ssl_certificate: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_password: Option<String>,
    pub root_certificate: Option<String>,
    pub check_certificate_revocation: bool,

    /// Connect and pool-rent deadline, seconds.
    pub timeout: u64,
    /// Per-command deadline, seconds. 0 disables.
    pub command_timeout: u64,
    /// Milliseconds to await a cancel ack. -1 skips the wait, 0 waits forever.
    pub cancellation_timeout: i32,
    /// Deadline for reset/keepalive/probe queries, seconds. 0 derives from
    /// `command_timeout` with a 3 s floor.
    pub internal_command_timeout: u64,
    /// Seconds of idleness before an application-level ping. 0 disables.
    pub keep_alive: u64,
    pub tcp_keepalive: bool,
    pub tcp_keepalive_time: u64,
    pub tcp_keepalive_interval: u64,

    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub socket_receive_buffer_size: Option<usize>,
    pub socket_send_buffer_size: Option<usize>,

    pub pooling: bool,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub connection_idle_lifetime: u64,
    pub connection_pruning_interval: u64,
    /// Seconds before a connector is retired outright. 0 = infinite.
    pub connection_lifetime: u64,

    pub max_auto_prepare: usize,
    pub auto_prepare_min_usages: u32,
    pub no_reset_on_close: bool,

    pub multiplexing: bool,
    pub write_coalescing_buffer_threshold_bytes: usize,

    pub load_balance_hosts: bool,
    /// Host-role cache TTL, seconds. 0 = never recheck.
    pub host_recheck_seconds: u64,
    pub target_session_attributes: TargetSessionAttrs,
    pub server_compatibility_mode: ServerCompatibilityMode,

    pub include_error_detail: bool,
    pub log_parameters: bool,

    pub application_name: Option<String>,
    pub client_encoding: Option<String>,
    pub search_path: Option<String>,
    pub timezone: Option<String>,
    pub options: Option<String>,

    /// Canonicalized `Key=Value;` rendering, used as the pool key.
    normalized: String,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            hosts: Vec::new(),
            port: 5432,
            database: None,
            username: String::new(),
            password: None,
            passfile: None,
            ssl_mode: SslMode::default(),
            trust_server_certificate: false,
            ssl_certificate: None,
            ssl_key: None,
            ssl_password: None,
            root_certificate: None,
            check_certificate_revocation: false,
            timeout: 15,
            command_timeout: 30,
            cancellation_timeout: 2000,
            internal_command_timeout: 0,
            keep_alive: 0,
            tcp_keepalive: false,
            tcp_keepalive_time: 0,
            tcp_keepalive_interval: 0,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            socket_receive_buffer_size: None,
            socket_send_buffer_size: None,
            pooling: true,
            min_pool_size: 0,
            max_pool_size: 100,
            connection_idle_lifetime: 300,
            connection_pruning_interval: 10,
            connection_lifetime: 0,
            max_auto_prepare: 0,
            auto_prepare_min_usages: 5,
            no_reset_on_close: false,
            multiplexing: false,
            write_coalescing_buffer_threshold_bytes: 1000,
            load_balance_hosts: false,
            host_recheck_seconds: 10,
            target_session_attributes: TargetSessionAttrs::default(),
            server_compatibility_mode: ServerCompatibilityMode::default(),
            include_error_detail: false,
            log_parameters: false,
            application_name: None,
            client_encoding: None,
            search_path: None,
            timezone: None,
            options: None,
            normalized: String::new(),
        }
    }
}

impl Options {
    /// Parse and validate a connection string.
    pub fn parse(connection_string: &str) -> Result<Options, ConfigError> {
        let mut opts = Options::default();
        let mut raw_host: Option<String> = None;
        let mut seen: BTreeMap<&'static str, String> = BTreeMap::new();

        for segment in connection_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                return Err(ConfigError::Malformed(segment.to_string()));
            };
            let value = value.trim();
            let canonical = opts.apply(&canonical_key(key), key, value, &mut raw_host)?;
            seen.insert(canonical, value.to_string());
        }

        let raw_host = raw_host.ok_or(ConfigError::MissingHost)?;
        opts.hosts = parse_hosts(&raw_host, opts.port)?;
        opts.validate()?;

        let mut normalized = String::new();
        for (key, value) in &seen {
            let _ = write!(normalized, "{key}={value};");
        }
        opts.normalized = normalized;

        Ok(opts)
    }

    /// Dispatch a single canonicalized key. Returns the display-cased key used
    /// in the normalized rendering.
    fn apply(
        &mut self,
        canonical: &str,
        raw_key: &str,
        value: &str,
        raw_host: &mut Option<String>,
    ) -> Result<&'static str, ConfigError> {
        Ok(match canonical {
            "host" | "server" => {
                *raw_host = Some(value.to_string());
                "Host"
            }
            "port" => {
                self.port = parse_number(value, "Port")?;
                "Port"
            }
            "database" | "db" => {
                self.database = Some(value.to_string());
                "Database"
            }
            "username" | "user" | "userid" | "uid" => {
                self.username = value.to_string();
                "Username"
            }
            "password" | "pwd" | "psw" => {
                self.password = Some(value.to_string());
                "Password"
            }
            "passfile" => {
                self.passfile = Some(value.to_string());
                "Passfile"
            }
            "sslmode" => {
                self.ssl_mode = parse_ssl_mode(value)?;
                "SslMode"
            }
            "trustservercertificate" => {
                self.trust_server_certificate = parse_bool(value, "TrustServerCertificate")?;
                "TrustServerCertificate"
            }
            "sslcertificate" | "sslcert" => {
                self.ssl_certificate = Some(value.to_string());
                "SslCertificate"
            }
            "sslkey" => {
                self.ssl_key = Some(value.to_string());
                "SslKey"
            }
            "sslpassword" => {
                self.ssl_password = Some(value.to_string());
                "SslPassword"
            }
            "rootcertificate" | "rootcert" => {
                self.root_certificate = Some(value.to_string());
                "RootCertificate"
            }
            "checkcertificaterevocation" => {
                self.check_certificate_revocation = parse_bool(value, "CheckCertificateRevocation")?;
                "CheckCertificateRevocation"
            }
            "timeout" => {
                self.timeout = parse_number(value, "Timeout")?;
                "Timeout"
            }
            "commandtimeout" => {
                self.command_timeout = parse_number(value, "CommandTimeout")?;
                "CommandTimeout"
            }
            "cancellationtimeout" => {
                self.cancellation_timeout = parse_signed(value, "CancellationTimeout")?;
                if self.cancellation_timeout < -1 {
                    return Err(invalid("CancellationTimeout", value, "must be >= -1"));
                }
                "CancellationTimeout"
            }
            "internalcommandtimeout" => {
                self.internal_command_timeout = parse_number(value, "InternalCommandTimeout")?;
                "InternalCommandTimeout"
            }
            "keepalive" => {
                self.keep_alive = parse_number(value, "KeepAlive")?;
                "KeepAlive"
            }
            "tcpkeepalive" => {
                self.tcp_keepalive = parse_bool(value, "TcpKeepAlive")?;
                "TcpKeepAlive"
            }
            "tcpkeepalivetime" => {
                self.tcp_keepalive_time = parse_number(value, "TcpKeepAliveTime")?;
                "TcpKeepAliveTime"
            }
            "tcpkeepaliveinterval" => {
                self.tcp_keepalive_interval = parse_number(value, "TcpKeepAliveInterval")?;
                "TcpKeepAliveInterval"
            }
            "readbuffersize" => {
                self.read_buffer_size = parse_buffer_size(value, "ReadBufferSize")?;
                "ReadBufferSize"
            }
            "writebuffersize" => {
                self.write_buffer_size = parse_buffer_size(value, "WriteBufferSize")?;
                "WriteBufferSize"
            }
            "socketreceivebuffersize" => {
                self.socket_receive_buffer_size = Some(parse_number(value, "SocketReceiveBufferSize")?);
                "SocketReceiveBufferSize"
            }
            "socketsendbuffersize" => {
                self.socket_send_buffer_size = Some(parse_number(value, "SocketSendBufferSize")?);
                "SocketSendBufferSize"
            }
            "pooling" => {
                self.pooling = parse_bool(value, "Pooling")?;
                "Pooling"
            }
            "minpoolsize" => {
                self.min_pool_size = parse_number(value, "MinPoolSize")?;
                "MinPoolSize"
            }
            "maxpoolsize" => {
                self.max_pool_size = parse_number(value, "MaxPoolSize")?;
                if self.max_pool_size == 0 {
                    return Err(invalid("MaxPoolSize", value, "must be at least 1"));
                }
                "MaxPoolSize"
            }
            "connectionidlelifetime" => {
                self.connection_idle_lifetime = parse_number(value, "ConnectionIdleLifetime")?;
                "ConnectionIdleLifetime"
            }
            "connectionpruninginterval" => {
                self.connection_pruning_interval = parse_number(value, "ConnectionPruningInterval")?;
                if self.connection_pruning_interval == 0 {
                    return Err(invalid("ConnectionPruningInterval", value, "must be at least 1"));
                }
                "ConnectionPruningInterval"
            }
            "connectionlifetime" | "loadbalancetimeout" => {
                self.connection_lifetime = parse_number(value, "ConnectionLifetime")?;
                "ConnectionLifetime"
            }
            "maxautoprepare" => {
                self.max_auto_prepare = parse_number(value, "MaxAutoPrepare")?;
                "MaxAutoPrepare"
            }
            "autoprepareminusages" => {
                self.auto_prepare_min_usages = parse_number(value, "AutoPrepareMinUsages")?;
                if self.auto_prepare_min_usages == 0 {
                    return Err(invalid("AutoPrepareMinUsages", value, "must be at least 1"));
                }
                "AutoPrepareMinUsages"
            }
            "noresetonclose" => {
                self.no_reset_on_close = parse_bool(value, "NoResetOnClose")?;
                "NoResetOnClose"
            }
            "multiplexing" => {
                self.multiplexing = parse_bool(value, "Multiplexing")?;
                "Multiplexing"
            }
            "writecoalescingbufferthresholdbytes" => {
                self.write_coalescing_buffer_threshold_bytes =
                    parse_number(value, "WriteCoalescingBufferThresholdBytes")?;
                "WriteCoalescingBufferThresholdBytes"
            }
            "loadbalancehosts" => {
                self.load_balance_hosts = parse_bool(value, "LoadBalanceHosts")?;
                "LoadBalanceHosts"
            }
            "hostrecheckseconds" => {
                self.host_recheck_seconds = parse_number(value, "HostRecheckSeconds")?;
                "HostRecheckSeconds"
            }
            "targetsessionattributes" | "targetsessionattrs" => {
                self.target_session_attributes = parse_target_session_attrs(value)?;
                "TargetSessionAttributes"
            }
            "servercompatibilitymode" => {
                self.server_compatibility_mode = match value.to_ascii_lowercase().as_str() {
                    "none" => ServerCompatibilityMode::None,
                    "redshift" => ServerCompatibilityMode::Redshift,
                    "notypeloading" => ServerCompatibilityMode::NoTypeLoading,
                    _ => return Err(invalid("ServerCompatibilityMode", value, "expected None, Redshift or NoTypeLoading")),
                };
                "ServerCompatibilityMode"
            }
            "includeerrordetail" => {
                self.include_error_detail = parse_bool(value, "IncludeErrorDetail")?;
                "IncludeErrorDetail"
            }
            "logparameters" => {
                self.log_parameters = parse_bool(value, "LogParameters")?;
                "LogParameters"
            }
            "applicationname" => {
                self.application_name = Some(value.to_string());
                "ApplicationName"
            }
            "clientencoding" => {
                self.client_encoding = Some(value.to_string());
                "ClientEncoding"
            }
            "searchpath" => {
                self.search_path = Some(value.to_string());
                "SearchPath"
            }
            "timezone" => {
                self.timezone = Some(value.to_string());
                "TimeZone"
            }
            "options" => {
                self.options = Some(value.to_string());
                "Options"
            }
            _ => return Err(ConfigError::UnknownKey(raw_key.trim().to_string())),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.multiplexing && !self.pooling {
            return Err(ConfigError::MultiplexingRequiresPooling);
        }
        if self.ssl_mode == SslMode::Require && !self.trust_server_certificate {
            return Err(ConfigError::RequireWithoutTrust);
        }
        if self.trust_server_certificate
            && matches!(
                self.ssl_mode,
                SslMode::Allow | SslMode::VerifyCa | SslMode::VerifyFull
            )
        {
            return Err(ConfigError::TrustIncompatible(
                self.ssl_mode.as_str().to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::PoolSizeOrder {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        Ok(())
    }

    /// Database to request at startup; the protocol defaults it to the user.
    pub fn database_or_username(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.username)
    }

    /// Canonicalized connection string, suitable as a pool key.
    pub fn pool_key(&self) -> &str {
        &self.normalized
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.timeout)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        nonzero_secs(self.command_timeout)
    }

    /// Reset/keepalive/probe queries run under this deadline; derived from
    /// `CommandTimeout` with a 3 second floor when left unset.
    pub fn internal_command_timeout(&self) -> Duration {
        if self.internal_command_timeout > 0 {
            Duration::from_secs(self.internal_command_timeout)
        } else {
            Duration::from_secs(self.command_timeout.max(3))
        }
    }

    pub fn keepalive_after(&self) -> Option<Duration> {
        nonzero_secs(self.keep_alive)
    }

    pub fn idle_lifetime(&self) -> Duration {
        Duration::from_secs(self.connection_idle_lifetime)
    }

    pub fn pruning_interval(&self) -> Duration {
        Duration::from_secs(self.connection_pruning_interval)
    }

    pub fn lifetime(&self) -> Option<Duration> {
        nonzero_secs(self.connection_lifetime)
    }

    pub fn host_recheck(&self) -> Option<Duration> {
        nonzero_secs(self.host_recheck_seconds)
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Fold case and drop spaces so `User Id`, `user id` and `UserId` collide.
fn canonical_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_hosts(raw: &str, default_port: u16) -> Result<Vec<HostSpec>, ConfigError> {
    let mut hosts = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        // Unix-socket paths contain no port suffix; `:` only splits TCP hosts.
        let (host, port) = if part.starts_with('/') || part.starts_with('@') {
            (part.to_string(), default_port)
        } else if let Some((host, port)) = part.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid("Host", part, "bad port suffix"))?;
            (host.to_string(), port)
        } else {
            (part.to_string(), default_port)
        };
        if host.is_empty() {
            return Err(invalid("Host", raw, "empty host entry"));
        }
        hosts.push(HostSpec { host, port });
    }
    if hosts.is_empty() {
        return Err(ConfigError::MissingHost);
    }
    Ok(hosts)
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(key, value, "expected a non-negative number"))
}

fn parse_signed(value: &str, key: &'static str) -> Result<i32, ConfigError> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| invalid(key, value, "expected an integer"))
}

fn parse_buffer_size(value: &str, key: &'static str) -> Result<usize, ConfigError> {
    let n: usize = parse_number(value, key)?;
    if n < 1024 {
        return Err(invalid(key, value, "must be at least 1024 bytes"));
    }
    Ok(n)
}

fn parse_ssl_mode(value: &str) -> Result<SslMode, ConfigError> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "disable" => SslMode::Disable,
        "allow" => SslMode::Allow,
        "prefer" => SslMode::Prefer,
        "require" => SslMode::Require,
        "verifyca" | "verify-ca" => SslMode::VerifyCa,
        "verifyfull" | "verify-full" => SslMode::VerifyFull,
        _ => return Err(invalid("SslMode", value, "expected Disable, Allow, Prefer, Require, VerifyCA or VerifyFull")),
    })
}

fn parse_target_session_attrs(value: &str) -> Result<TargetSessionAttrs, ConfigError> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "any" => TargetSessionAttrs::Any,
        "primary" => TargetSessionAttrs::Primary,
        "standby" => TargetSessionAttrs::Standby,
        "prefer-primary" | "preferprimary" => TargetSessionAttrs::PreferPrimary,
        "prefer-standby" | "preferstandby" => TargetSessionAttrs::PreferStandby,
        "read-write" | "readwrite" => TargetSessionAttrs::ReadWrite,
        "read-only" | "readonly" => TargetSessionAttrs::ReadOnly,
        _ => return Err(invalid("TargetSessionAttributes", value, "unknown selector")),
    })
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
