//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::NonZeroU32,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{
    ConfigValidationError, DEFAULT_AUTOMATION_USER_AGENTS, DEFAULT_CONTENT_VERSION,
    DEFAULT_COOKIE_NAME, DEFAULT_MARKER_TTL_SECS, RawViewport, ViewportTable,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "abovefold";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_SITE_BASE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_SITE_MAP_FILE: &str = "site-map.toml";
const DEFAULT_ASSET_ROOT: &str = "public";
const DEFAULT_STORAGE_DIR: &str = "critical-css";
const DEFAULT_EXTRACTOR_BIN: &str = "critical";
const DEFAULT_EXTRACTOR_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_QUEUE_CONCURRENCY: u32 = 2;
const DEFAULT_QUEUE_CAPACITY: u32 = 256;
const DEFAULT_GENERATE_CONCURRENCY: usize = 4;

/// Command-line arguments for the abovefold binary.
#[derive(Debug, Parser)]
#[command(name = "abovefold", version, about = "Critical-path CSS cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ABOVEFOLD_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the proxy and admin HTTP services.
    Serve(Box<ServeArgs>),
    /// Generate critical CSS for one URL or for the whole site.
    Generate(GenerateArgs),
    /// Remove every stored critical CSS artifact.
    Clear(ClearArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct GenerateArgs {
    /// Regenerate only this URL; it must belong to `site.base_url`.
    #[arg(long, value_name = "URL", value_hint = ValueHint::Url)]
    pub uri: Option<String>,

    /// Maximum number of URLs processed at once.
    #[arg(
        long,
        default_value_t = DEFAULT_GENERATE_CONCURRENCY,
        value_parser = clap::value_parser!(usize)
    )]
    pub concurrency: usize,

    #[command(flatten)]
    pub overrides: GenerateOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub storage: StorageOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StorageOverrides {
    /// Override the artifact storage directory.
    #[arg(long = "storage-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub storage_directory: Option<PathBuf>,

    /// Toggle pretend mode (no reads, writes or inlining).
    #[arg(
        long = "storage-pretend",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub storage_pretend: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SiteOverrides {
    /// Override the public site origin.
    #[arg(long = "site-base-url", value_name = "URL")]
    pub site_base_url: Option<String>,

    /// Override the site map file.
    #[arg(long = "site-map-file", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub site_map_file: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ExtractorOverrides {
    /// Override the critical CSS extractor executable.
    #[arg(long = "extractor-bin", value_name = "PATH")]
    pub extractor_bin: Option<PathBuf>,

    /// Override the extractor timeout in milliseconds.
    #[arg(long = "extractor-timeout-ms", value_name = "MILLIS")]
    pub extractor_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GenerateOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub site: SiteOverrides,

    #[command(flatten)]
    pub extractor: ExtractorOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub storage: StorageOverrides,

    #[command(flatten)]
    pub site: SiteOverrides,

    #[command(flatten)]
    pub extractor: ExtractorOverrides,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the upstream the proxy forwards to.
    #[arg(long = "site-upstream-url", value_name = "URL")]
    pub site_upstream_url: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the regeneration worker concurrency.
    #[arg(long = "queue-concurrency", value_name = "COUNT")]
    pub queue_concurrency: Option<u32>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub site: SiteSettings,
    pub assets: AssetSettings,
    pub storage: StorageSettings,
    pub extractor: ExtractorSettings,
    pub marker: GateSettings,
    pub queue: QueueSettings,
    pub viewports: ViewportTable,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct SiteSettings {
    /// Public origin; pages outside it are never generated.
    pub base_url: Url,
    /// Origin the proxy forwards requests to.
    pub upstream_url: Url,
    pub map_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AssetSettings {
    pub public_url: Url,
    pub root_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub directory: PathBuf,
    pub pretend: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractorSettings {
    pub bin: PathBuf,
    pub ignore: Vec<String>,
    pub timeout: Duration,
}

/// Version marker and automation detection.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub cookie_name: String,
    pub marker_ttl: Duration,
    pub content_version: String,
    pub automation_user_agents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: NonZeroU32,
    pub capacity: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid viewport configuration: {0}")]
    Viewports(#[from] ConfigValidationError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("ABOVEFOLD").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Generate(args)) => raw.apply_generate_overrides(&args.overrides),
        Some(Command::Clear(args)) => raw.apply_storage_overrides(&args.storage),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    site: RawSiteSettings,
    assets: RawAssetSettings,
    storage: RawStorageSettings,
    extractor: RawExtractorSettings,
    marker: RawMarkerSettings,
    gate: RawGateSettings,
    queue: RawQueueSettings,
    viewports: BTreeMap<String, RawViewport>,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(url) = overrides.site_upstream_url.as_ref() {
            self.site.upstream_url = Some(url.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(value) = overrides.queue_concurrency {
            self.queue.concurrency = Some(value);
        }

        self.apply_storage_overrides(&overrides.storage);
        self.apply_site_overrides(&overrides.site);
        self.apply_extractor_overrides(&overrides.extractor);
    }

    fn apply_generate_overrides(&mut self, overrides: &GenerateOverrides) {
        self.apply_storage_overrides(&overrides.storage);
        self.apply_site_overrides(&overrides.site);
        self.apply_extractor_overrides(&overrides.extractor);
    }

    fn apply_storage_overrides(&mut self, overrides: &StorageOverrides) {
        if let Some(directory) = overrides.storage_directory.as_ref() {
            self.storage.directory = Some(directory.clone());
        }
        if let Some(pretend) = overrides.storage_pretend {
            self.storage.pretend = Some(pretend);
        }
    }

    fn apply_site_overrides(&mut self, overrides: &SiteOverrides) {
        if let Some(url) = overrides.site_base_url.as_ref() {
            self.site.base_url = Some(url.clone());
        }
        if let Some(path) = overrides.site_map_file.as_ref() {
            self.site.map_file = Some(path.clone());
        }
    }

    fn apply_extractor_overrides(&mut self, overrides: &ExtractorOverrides) {
        if let Some(bin) = overrides.extractor_bin.as_ref() {
            self.extractor.bin = Some(bin.clone());
        }
        if let Some(timeout) = overrides.extractor_timeout_ms {
            self.extractor.timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            site,
            assets,
            storage,
            extractor,
            marker,
            gate,
            queue,
            viewports,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let site = build_site_settings(site)?;
        let assets = build_asset_settings(assets, &site)?;
        let storage = build_storage_settings(storage)?;
        let extractor = build_extractor_settings(extractor)?;
        let marker = build_gate_settings(marker, gate)?;
        let queue = build_queue_settings(queue)?;
        let viewports = ViewportTable::from_raw(&viewports)?;

        Ok(Self {
            server,
            logging,
            site,
            assets,
            storage,
            extractor,
            marker,
            queue,
            viewports,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_site_settings(site: RawSiteSettings) -> Result<SiteSettings, LoadError> {
    let base_url = parse_origin(
        site.base_url.as_deref().unwrap_or(DEFAULT_SITE_BASE_URL),
        "site.base_url",
    )?;
    let upstream_url = match site.upstream_url.as_deref() {
        Some(raw) => parse_origin(raw, "site.upstream_url")?,
        None => base_url.clone(),
    };

    let map_file = site
        .map_file
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SITE_MAP_FILE));
    if map_file.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "site.map_file",
            "path must not be empty",
        ));
    }

    Ok(SiteSettings {
        base_url,
        upstream_url,
        map_file,
    })
}

fn build_asset_settings(
    assets: RawAssetSettings,
    site: &SiteSettings,
) -> Result<AssetSettings, LoadError> {
    let public_url = match assets.public_url.as_deref() {
        Some(raw) => parse_origin(raw, "assets.public_url")?,
        None => site.base_url.clone(),
    };
    let root_dir = assets
        .root_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ASSET_ROOT));
    if root_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "assets.root_dir",
            "path must not be empty",
        ));
    }

    Ok(AssetSettings {
        public_url,
        root_dir,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let directory = storage
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.directory",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings {
        directory,
        pretend: storage.pretend.unwrap_or(false),
    })
}

fn build_extractor_settings(
    extractor: RawExtractorSettings,
) -> Result<ExtractorSettings, LoadError> {
    let bin = extractor
        .bin
        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXTRACTOR_BIN));
    if bin.as_os_str().is_empty() {
        return Err(LoadError::invalid("extractor.bin", "path must not be empty"));
    }

    let timeout_ms = extractor
        .timeout_ms
        .unwrap_or(DEFAULT_EXTRACTOR_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "extractor.timeout_ms",
            "must be greater than zero",
        ));
    }

    let ignore = extractor
        .ignore
        .into_iter()
        .map(|rule| rule.trim().to_string())
        .filter(|rule| !rule.is_empty())
        .collect();

    Ok(ExtractorSettings {
        bin,
        ignore,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_gate_settings(
    marker: RawMarkerSettings,
    gate: RawGateSettings,
) -> Result<GateSettings, LoadError> {
    let cookie_name = marker
        .cookie_name
        .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string());
    if !is_cookie_token(&cookie_name) {
        return Err(LoadError::invalid(
            "marker.cookie_name",
            format!("`{cookie_name}` is not a valid cookie name"),
        ));
    }

    let ttl_seconds = marker.ttl_seconds.unwrap_or(DEFAULT_MARKER_TTL_SECS);
    if ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "marker.ttl_seconds",
            "must be greater than zero",
        ));
    }

    let content_version = marker
        .version
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CONTENT_VERSION.to_string());
    if content_version.is_empty() || !content_version.chars().all(is_cookie_value_char) {
        return Err(LoadError::invalid(
            "marker.version",
            "must be a non-empty cookie-safe string",
        ));
    }

    let automation_user_agents = match gate.automation_user_agents {
        Some(tokens) => tokens
            .into_iter()
            .map(|token| token.trim().to_ascii_lowercase())
            .filter(|token| !token.is_empty())
            .collect(),
        None => DEFAULT_AUTOMATION_USER_AGENTS
            .iter()
            .map(|token| token.to_string())
            .collect(),
    };

    Ok(GateSettings {
        cookie_name,
        marker_ttl: Duration::from_secs(ttl_seconds),
        content_version,
        automation_user_agents,
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let concurrency = queue.concurrency.unwrap_or(DEFAULT_QUEUE_CONCURRENCY);
    let capacity = queue.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

    Ok(QueueSettings {
        concurrency: non_zero_u32(concurrency.into(), "queue.concurrency")?,
        capacity: non_zero_u32(capacity.into(), "queue.capacity")?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSiteSettings {
    base_url: Option<String>,
    upstream_url: Option<String>,
    map_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAssetSettings {
    public_url: Option<String>,
    root_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    directory: Option<PathBuf>,
    pretend: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawExtractorSettings {
    bin: Option<PathBuf>,
    ignore: Vec<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMarkerSettings {
    cookie_name: Option<String>,
    ttl_seconds: Option<u64>,
    version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGateSettings {
    automation_user_agents: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    concurrency: Option<u32>,
    capacity: Option<u32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Absolute http(s) URL whose path ends with `/`, so joins stay beneath it.
fn parse_origin(raw: &str, key: &'static str) -> Result<Url, LoadError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{raw}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "URL must use http or https"));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn is_cookie_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
        })
}

fn is_cookie_value_char(ch: char) -> bool {
    ch.is_ascii_graphic() && !matches!(ch, '"' | ',' | ';' | '\\')
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.server.public_addr.port(), DEFAULT_PUBLIC_PORT);
        assert_eq!(settings.storage.directory, PathBuf::from("critical-css"));
        assert!(!settings.storage.pretend);
        assert_eq!(settings.extractor.bin, PathBuf::from("critical"));
        assert_eq!(settings.extractor.timeout, Duration::from_secs(30));
        assert_eq!(settings.marker.cookie_name, "abovefold-css");
        assert_eq!(settings.marker.content_version, "1.0.0");
        assert_eq!(settings.marker.marker_ttl, Duration::from_secs(2_419_200));
        assert_eq!(settings.queue.concurrency.get(), 2);
        assert_eq!(settings.queue.capacity.get(), 256);
        assert_eq!(settings.viewports, ViewportTable::default());
        assert_eq!(settings.site.upstream_url, settings.site.base_url);
        assert_eq!(settings.assets.public_url, settings.site.base_url);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.server.public_port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.storage.directory = Some(PathBuf::from("from-file"));

        let overrides = ServeOverrides {
            public_port: Some(4321),
            log_level: Some("debug".to_string()),
            storage: StorageOverrides {
                storage_directory: Some(PathBuf::from("from-cli")),
                storage_pretend: None,
            },
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.public_addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.storage.directory, PathBuf::from("from-cli"));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let mut raw = RawSettings::default();
        raw.site.base_url = Some("https://example.test/blog".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.site.base_url.as_str(), "https://example.test/blog/");
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut raw = RawSettings::default();
        raw.site.base_url = Some("ftp://example.test/".to_string());
        let err = Settings::from_raw(raw).expect_err("ftp rejected");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "site.base_url",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_queue_concurrency() {
        let mut raw = RawSettings::default();
        raw.queue.concurrency = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero rejected");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "queue.concurrency",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unsafe_marker_values() {
        let mut raw = RawSettings::default();
        raw.marker.cookie_name = Some("bad name".to_string());
        assert!(Settings::from_raw(raw).is_err());

        let mut raw = RawSettings::default();
        raw.marker.version = Some("1;2".to_string());
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn incomplete_viewport_table_is_rejected() {
        let mut raw = RawSettings::default();
        raw.viewports.insert(
            "mobile".to_string(),
            RawViewport {
                width: Some(320),
                height: Some(640),
            },
        );
        let err = Settings::from_raw(raw).expect_err("tablet and desktop missing");
        assert!(matches!(err, LoadError::Viewports(_)));
    }

    #[test]
    fn automation_tokens_are_lowercased() {
        let mut raw = RawSettings::default();
        raw.gate.automation_user_agents = Some(vec!["PageSpeed".to_string(), " ".to_string()]);
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.marker.automation_user_agents, vec!["pagespeed"]);
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["abovefold"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_generate_arguments() {
        let args = CliArgs::parse_from([
            "abovefold",
            "generate",
            "--uri",
            "https://example.test/about/",
            "--concurrency",
            "8",
            "--extractor-bin",
            "/usr/local/bin/critical",
        ]);

        match args.command.expect("generate command") {
            Command::Generate(generate) => {
                assert_eq!(generate.uri.as_deref(), Some("https://example.test/about/"));
                assert_eq!(generate.concurrency, 8);
                assert_eq!(
                    generate.overrides.extractor.extractor_bin.as_deref(),
                    Some(std::path::Path::new("/usr/local/bin/critical"))
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn generate_defaults_to_whole_site() {
        let args = CliArgs::parse_from(["abovefold", "generate"]);
        match args.command.expect("generate command") {
            Command::Generate(generate) => {
                assert!(generate.uri.is_none());
                assert_eq!(generate.concurrency, DEFAULT_GENERATE_CONCURRENCY);
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_clear_arguments() {
        let args = CliArgs::parse_from([
            "abovefold",
            "clear",
            "--storage-directory",
            "/var/cache/css",
        ]);

        match args.command.expect("clear command") {
            Command::Clear(clear) => {
                assert_eq!(
                    clear.storage.storage_directory.as_deref(),
                    Some(std::path::Path::new("/var/cache/css"))
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "abovefold",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--site-upstream-url",
            "http://backend:8080",
            "--storage-pretend",
            "true",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(
                    serve.overrides.site_upstream_url.as_deref(),
                    Some("http://backend:8080")
                );
                assert_eq!(serve.overrides.storage.storage_pretend, Some(true));
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
