//! Communicator configuration.
//!
//! [`Properties`] is an opaque string map, typically filled from command
//! line arguments of the form `--Key=Value` or deserialized from any serde
//! source. [`CommunicatorConfig::from_properties`] turns the keys this crate
//! understands into typed settings; everything else stays available to the
//! application through [`Properties::get`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::acm::{AcmConfig, ClosePolicy, HeartbeatPolicy};
use crate::batch::DEFAULT_AUTO_FLUSH_SIZE;
use crate::endpoint::TransportKind;
use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MESSAGE_SIZE_MAX;
use crate::reference::EndpointSelection;
use crate::retry::RetryConfig;
use crate::transport::{NetworkProxy, TlsConfig};
use crate::version::{EncodingVersion, ENCODING_1_1};

/// String key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    /// An empty property set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds properties from `--Key=Value` arguments; other arguments are
    /// ignored.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut properties = Properties::new();
        properties.parse_args(args);
        properties
    }

    /// Consumes `--Key=Value` arguments (a bare `--Key` sets `1`) and returns
    /// the arguments that are not properties.
    pub fn parse_args<I, S>(&mut self, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rest = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            match arg.strip_prefix("--") {
                Some(body) if !body.is_empty() => {
                    let (key, value) = body.split_once('=').unwrap_or((body, "1"));
                    self.set(key.trim(), value.trim());
                }
                _ => rest.push(arg.to_string()),
            }
        }
        rest
    }

    /// Sets a property; an empty value removes it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.values.remove(&key);
        } else {
            self.values.insert(key, value);
        }
    }

    /// The value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The value of `key`, or `default` when unset.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parses a property with `FromStr`; malformed values are errors.
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::InvalidProperty {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    /// The value of `key` parsed as an integer, or `default` when unset.
    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.get_parsed::<i64>(key)?.unwrap_or(default))
    }

    /// `0`/`1` (also `false`/`true`).
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(str::trim) {
            None => Ok(default),
            Some("1") | Some("true") => Ok(true),
            Some("0") | Some("false") => Ok(false),
            Some(other) => Err(Error::InvalidProperty {
                key: key.to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// All properties whose key starts with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of properties set.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the batch holds no request.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

fn invalid(key: &str, value: impl ToString) -> Error {
    Error::InvalidProperty {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// Milliseconds where a negative value means "none".
fn optional_millis(properties: &Properties, key: &str, default: Option<Duration>) -> Result<Option<Duration>> {
    match properties.get_parsed::<i64>(key)? {
        None => Ok(default),
        Some(ms) if ms < 0 => Ok(None),
        Some(0) => Err(invalid(key, 0)),
        Some(ms) => Ok(Some(Duration::from_millis(ms as u64))),
    }
}

/// Settings read from the `Floe.*` properties, with documented defaults.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Protocol for endpoints written as `default` (`Floe.Default.Protocol`, tcp).
    pub default_protocol: TransportKind,
    /// Host filled into endpoints without `-h` (`Floe.Default.Host`).
    pub default_host: String,
    /// Encoding of new proxies (`Floe.Default.EncodingVersion`, 1.1).
    pub default_encoding: EncodingVersion,
    /// Overall invocation timeout of new proxies, in ms; -1 means none
    /// (`Floe.Default.InvocationTimeout`).
    pub invocation_timeout: i32,
    /// Dispatch directly to adapters in this process
    /// (`Floe.Default.CollocationOptimized`, 1).
    pub collocation_optimized: bool,
    /// `Floe.Default.EndpointSelection` (Ordered).
    pub endpoint_selection: EndpointSelection,
    /// Seconds a locator answer stays cached; -1 forever, 0 never
    /// (`Floe.Default.LocatorCacheTimeout`, -1).
    pub locator_cache_timeout: i32,
    /// Overrides endpoint timeouts when connecting (`Floe.ConnectTimeout`).
    pub connect_timeout: Option<Duration>,
    /// Per-attempt wait for a reply (`Floe.ReplyTimeout`); none by default.
    pub reply_timeout: Option<Duration>,
    /// Graceful close waits at most this long for outstanding work before
    /// closing forcefully (`Floe.CloseTimeout`, ms, 10000).
    pub close_timeout: Duration,
    /// `Floe.Retry.*`
    pub retry: RetryConfig,
    /// `Floe.ACM.*`
    pub acm: AcmConfig,
    /// Largest accepted message (`Floe.MessageSizeMax`, KiB, 1024).
    pub message_size_max: usize,
    /// Batch auto-flush threshold (`Floe.BatchAutoFlushSize`, KiB, 1024).
    pub batch_auto_flush_size: usize,
    /// Proxy for outgoing stream connections (`Floe.SOCKSProxyHost` and
    /// `Floe.SOCKSProxyPort`, else `Floe.HTTPProxyHost` and
    /// `Floe.HTTPProxyPort`; ports default to 1080).
    pub network_proxy: Option<NetworkProxy>,
    /// Certificates for the ssl and wss transports; not read from properties.
    pub tls: Option<TlsConfig>,
    /// The properties this configuration was read from.
    pub properties: Properties,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            default_protocol: TransportKind::Tcp,
            default_host: String::new(),
            default_encoding: ENCODING_1_1,
            invocation_timeout: -1,
            collocation_optimized: true,
            endpoint_selection: EndpointSelection::Ordered,
            locator_cache_timeout: -1,
            connect_timeout: None,
            reply_timeout: None,
            close_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
            acm: AcmConfig::default(),
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            batch_auto_flush_size: DEFAULT_AUTO_FLUSH_SIZE,
            network_proxy: None,
            tls: None,
            properties: Properties::new(),
        }
    }
}

impl CommunicatorConfig {
    /// Reads the recognised keys; unset keys keep their defaults.
    pub fn from_properties(properties: Properties) -> Result<Self> {
        let mut config = CommunicatorConfig::default();
        let p = &properties;

        if let Some(name) = p.get("Floe.Default.Protocol") {
            config.default_protocol = TransportKind::from_name(name.trim())
                .ok_or_else(|| invalid("Floe.Default.Protocol", name))?;
        }
        if let Some(host) = p.get("Floe.Default.Host") {
            config.default_host = host.trim().to_string();
        }
        if let Some(encoding) = p.get_parsed::<EncodingVersion>("Floe.Default.EncodingVersion")? {
            if !encoding.is_supported() {
                return Err(invalid("Floe.Default.EncodingVersion", encoding));
            }
            config.default_encoding = encoding;
        }
        config.invocation_timeout = p
            .get_parsed::<i32>("Floe.Default.InvocationTimeout")?
            .map(|t| if t < 0 { -1 } else { t })
            .unwrap_or(-1);
        if config.invocation_timeout == 0 {
            return Err(invalid("Floe.Default.InvocationTimeout", 0));
        }
        config.collocation_optimized = p.get_bool_or("Floe.Default.CollocationOptimized", true)?;
        if let Some(selection) = p.get_parsed::<EndpointSelection>("Floe.Default.EndpointSelection")? {
            config.endpoint_selection = selection;
        }
        config.locator_cache_timeout = p
            .get_parsed::<i32>("Floe.Default.LocatorCacheTimeout")?
            .map(|t| t.max(-1))
            .unwrap_or(-1);

        config.connect_timeout = optional_millis(p, "Floe.ConnectTimeout", None)?;
        config.reply_timeout = optional_millis(p, "Floe.ReplyTimeout", None)?;
        if let Some(close) = optional_millis(p, "Floe.CloseTimeout", Some(config.close_timeout))? {
            config.close_timeout = close;
        }

        let retry = &mut config.retry;
        if let Some(n) = p.get_parsed::<u32>("Floe.Retry.MaxRetries")? {
            retry.max_retries = n;
        }
        if let Some(ms) = p.get_parsed::<u64>("Floe.Retry.InitialBackoff")? {
            retry.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = p.get_parsed::<u64>("Floe.Retry.MaxBackoff")? {
            retry.max_backoff = Duration::from_millis(ms);
        }
        retry.jitter = p.get_bool_or("Floe.Retry.Jitter", retry.jitter)?;

        if let Some(secs) = p.get_parsed::<i64>("Floe.ACM.Timeout")? {
            config.acm.timeout = (secs > 0).then(|| Duration::from_secs(secs as u64));
        }
        if let Some(raw) = p.get("Floe.ACM.Heartbeat") {
            config.acm.heartbeat = raw
                .parse::<HeartbeatPolicy>()
                .map_err(|_| invalid("Floe.ACM.Heartbeat", raw))?;
        }
        if let Some(raw) = p.get("Floe.ACM.Close") {
            config.acm.close = raw
                .parse::<ClosePolicy>()
                .map_err(|_| invalid("Floe.ACM.Close", raw))?;
        }

        if let Some(kib) = p.get_parsed::<usize>("Floe.MessageSizeMax")? {
            if kib == 0 {
                return Err(invalid("Floe.MessageSizeMax", kib));
            }
            config.message_size_max = kib.saturating_mul(1024);
        }
        if let Some(kib) = p.get_parsed::<usize>("Floe.BatchAutoFlushSize")? {
            config.batch_auto_flush_size = kib.saturating_mul(1024);
        }

        config.network_proxy = network_proxy(p)?;

        config.properties = properties;
        Ok(config)
    }
}

/// SOCKS wins when both proxies are configured.
fn network_proxy(p: &Properties) -> Result<Option<NetworkProxy>> {
    let port = |key: &str| -> Result<u16> {
        let port = p.get_int_or(key, 1080)?;
        u16::try_from(port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| invalid(key, port))
    };
    if let Some(host) = p.get("Floe.SOCKSProxyHost") {
        return Ok(Some(NetworkProxy::Socks {
            host: host.trim().to_string(),
            port: port("Floe.SOCKSProxyPort")?,
        }));
    }
    if let Some(host) = p.get("Floe.HTTPProxyHost") {
        return Ok(Some(NetworkProxy::Http {
            host: host.trim().to_string(),
            port: port("Floe.HTTPProxyPort")?,
        }));
    }
    Ok(None)
}

/// Settings of one object adapter, read from `<name>.*` properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Colon-separated endpoints to listen on (`<name>.Endpoints`).
    pub endpoints: String,
    /// Endpoints put into proxies instead of the bound ones
    /// (`<name>.PublishedEndpoints`).
    pub published_endpoints: Option<String>,
    /// Makes proxies created by the adapter indirect (`<name>.AdapterId`).
    pub adapter_id: String,
    /// Reject re-registration of servants (`<name>.Strict`).
    pub strict: bool,
    /// How long deactivation waits for running dispatches
    /// (`<name>.DrainTimeout`, milliseconds).
    pub drain_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            endpoints: String::new(),
            published_endpoints: None,
            adapter_id: String::new(),
            strict: false,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl AdapterConfig {
    /// Reads the `<name>.*` keys; the empty name yields the defaults.
    pub fn from_properties(name: &str, properties: &Properties) -> Result<Self> {
        if name.is_empty() {
            return Ok(AdapterConfig::default());
        }
        let key = |suffix: &str| format!("{name}.{suffix}");
        Ok(AdapterConfig {
            endpoints: properties.get_or(&key("Endpoints"), "").trim().to_string(),
            published_endpoints: properties
                .get(&key("PublishedEndpoints"))
                .map(|s| s.trim().to_string()),
            adapter_id: properties.get_or(&key("AdapterId"), "").trim().to_string(),
            strict: properties.get_bool_or(&key("Strict"), false)?,
            drain_timeout: Duration::from_millis(properties.get_int_or(&key("DrainTimeout"), 30_000)?.max(0) as u64),
        })
    }
}
