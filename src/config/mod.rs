use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::path::Path;

use miette::{miette, Context, IntoDiagnostic, Result};
use schematic::{Config, ConfigEnum, ConfigLoader};
use serde::{Deserialize, Serialize};

pub mod runtime;

pub use runtime::{ConfigHandle, RuntimeConfig};

/// Generate a new config file at the provided location. Will error if the file already exists.
/// If the path is a directory, a new file called `config.toml` will be created inside.
pub(crate) fn generate(file: impl AsRef<Path>) -> Result<()> {
    let path = file.as_ref();
    let file = match path.is_dir() {
        true => path.join("config.toml"),
        false => {
            if path.exists() {
                return Err(
                    miette!("Could not create file {:?}", path).context("File already exists")
                );
            }
            path.to_path_buf()
        }
    };

    let mut config = AppConfig::default();

    // Seed one pattern and one origin so the generated file shows the format
    config.patterns.push(PathPatternConfig {
        name: "videos".into(),
        matcher: "^/videos/(.+\\.mp4)$".into(),
        origin_url: Some("https://videos.example.com".into()),
        capture_groups: vec!["videoId".into()],
        ..Default::default()
    });
    config.origins.push(OriginConfig {
        name: "default".into(),
        matcher: ".*".into(),
        sources: vec![SourceConfig {
            source_type: SourceType::Remote,
            priority: 0,
            url: Some("https://media.example.com".into()),
            ..Default::default()
        }],
        ..Default::default()
    });

    // Create file handle
    let mut f = File::create(file.as_path())
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open file {:?}", file))?;

    // stringify config
    let config_str = toml::to_string_pretty(&config)
        .into_diagnostic()
        .wrap_err_with(|| "Failed to serialize default configuration")?;

    // write config to file
    f.write_all(config_str.as_bytes())
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to write file {:?}", file))?;

    Ok(())
}

/// Load config from file
pub(crate) fn load(file: impl AsRef<Path>) -> Result<AppConfig> {
    let path = file.as_ref();

    let file = match path.is_dir() {
        true => path.join("config.toml"),
        _ => path.to_path_buf(),
    };

    let config = ConfigLoader::<AppConfig>::new()
        .file(file.as_path())?
        .load()?
        .config;

    Ok(config)
}

/// Load config from file or generate a new config at the location if the file does not exists.
pub(crate) fn load_or_generate(file: impl AsRef<Path>) -> Result<AppConfig> {
    let path = file.as_ref();

    let file = match path.is_dir() {
        true => path.join("config.toml"),
        _ => path.to_path_buf(),
    };

    if path.exists() && path.is_file() {
        return load(file);
    }

    generate(file.as_path())?;
    load(file.as_path())
}

/// Top-Level configuration
#[derive(Config, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub security: SecurityMode,
    pub server: ServerConfig,
    pub transform: TransformEndpointConfig,
    pub cache: CacheSettings,
    pub kv: KvBindings,
    /// Named transform presets. Empty means "use the built-in set".
    pub derivatives: HashMap<String, DerivativeConfig>,
    /// Object-store bucket bindings, by binding name.
    pub buckets: HashMap<String, BucketBindingConfig>,
    /// Ordered; first match wins.
    pub patterns: Vec<PathPatternConfig>,
    /// Ordered; first matching origin supplies the source list.
    pub origins: Vec<OriginConfig>,
}

/// Log Level for the application
#[derive(ConfigEnum, Clone, Default, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Warn,
    Error,
    Off,
}

/// Credential resolution mode: `strict` fails the auth attempt when a named
/// environment variable is missing, `permissive` sends the request unsigned.
#[derive(ConfigEnum, Clone, Default, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityMode {
    #[default]
    Strict,
    Permissive,
}

/// Configuration for the inbound HTTP server
#[derive(Config, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[setting(default = "127.0.0.1")]
    pub host: String,
    #[setting(default = 4380)]
    pub port: u16,
}

/// Where transformation requests are sent
#[derive(Config, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformEndpointConfig {
    #[setting(default = "https")]
    pub scheme: String,
    /// Host of the transformation endpoint. Empty means "same host as the request".
    #[setting(default = "")]
    pub host: String,
    #[setting(default = "/cdn-cgi/media")]
    pub base_path: String,
    #[setting(default = 30)]
    pub timeout_secs: u64,
}

/// Cache behavior shared by the edge cache and the variant store
#[derive(Config, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSettings {
    pub ttl: CacheTtlPolicyConfig,
    /// Query parameters that force a cache bypass when present.
    /// Empty means "use the built-in set" (`nocache`, `bypass`, `debug`).
    pub bypass_params: Vec<String>,
    /// Total in-memory edge cache capacity, in bytes.
    #[setting(default = 536_870_912)]
    pub edge_capacity: u64,
    /// Fraction of the variant TTL after which a read triggers a background
    /// re-write with extended TTL.
    #[setting(default = 0.5)]
    pub refresh_age_fraction: f64,
    /// Multiplier applied to the TTL on background refresh.
    #[setting(default = 2.0)]
    pub refresh_ttl_multiplier: f64,
}

/// Status-class TTLs, in seconds
#[derive(Config, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheTtlPolicyConfig {
    #[setting(default = 86_400)]
    pub ok: u64,
    #[setting(default = 3_600)]
    pub redirects: u64,
    #[setting(default = 60)]
    pub client_error: u64,
    #[setting(default = 10)]
    pub server_error: u64,
}

/// Logical KV namespace bindings
#[derive(Config, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KvBindings {
    #[setting(default = "VIDEO_TRANSFORMATIONS_CACHE")]
    pub variants: String,
    #[setting(default = "VIDEO_CONFIGURATION_STORE")]
    pub configuration: String,
    #[setting(default = "VIDEO_CACHE_KEY_VERSIONS")]
    pub versions: String,
}

/// An object-store bucket reachable through a binding name
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketBindingConfig {
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_var: Option<String>,
    pub secret_key_var: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

/// A named transform preset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeConfig {
    pub width: u32,
    pub height: u32,
    pub quality: Option<String>,
    pub compression: Option<String>,
    pub duration: Option<String>,
    pub fps: Option<u32>,
    pub audio: Option<bool>,
}

/// A prioritized request-path pattern
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPatternConfig {
    pub name: String,
    /// Regular expression matched against the request path.
    pub matcher: String,
    /// Authenticated origin base URL used by the pattern fallback step.
    pub origin_url: Option<String>,
    /// Names for positional captures, in order.
    #[serde(default)]
    pub capture_groups: Vec<String>,
    pub cache_ttl: Option<u64>,
    pub quality: Option<String>,
    /// Options forced onto every request matching this pattern.
    #[serde(default)]
    pub transformation_overrides: HashMap<String, String>,
    pub auth: Option<AuthConfig>,
}

/// An origin with its ordered content sources
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginConfig {
    pub name: String,
    /// Regular expression matched against the request path.
    pub matcher: String,
    pub sources: Vec<SourceConfig>,
    pub ttl: Option<CacheTtlPolicyConfig>,
    #[serde(default)]
    pub use_ttl_by_status: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SourceType {
    ObjectStore,
    #[default]
    Remote,
    Fallback,
}

/// One content source within an origin
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub priority: i32,
    /// Bucket binding name, required for `objectStore` sources.
    pub bucket_binding: Option<String>,
    /// Base URL, required for `remote` and `fallback` sources.
    pub url: Option<String>,
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub path_transforms: Vec<PathTransformConfig>,
}

/// Per-source path rewrite. At most one transform fires per resolution: the
/// first entry whose `segment` equals a leading path segment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathTransformConfig {
    pub segment: String,
    #[serde(default)]
    pub remove_prefix: bool,
    #[serde(default)]
    pub prefix: String,
}

/// Authentication for a source or pattern origin. Credential material is
/// referenced by environment-variable name, never stored in the config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    #[serde(rename = "aws-s3")]
    AwsS3 {
        access_key_var: String,
        secret_key_var: String,
        session_token_var: Option<String>,
        region: String,
        service: String,
    },
    #[serde(rename = "aws-s3-presigned-url")]
    AwsS3PresignedUrl {
        access_key_var: String,
        secret_key_var: String,
        session_token_var: Option<String>,
        region: String,
        service: String,
        /// Presign validity window, seconds.
        expires_in_secs: Option<u64>,
    },
    Bearer {
        token_var: String,
    },
    Header {
        headers: HashMap<String, String>,
    },
}

impl AuthConfig {
    /// Tag used in diagnostic headers and presign cache keys.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AwsS3 { .. } => "aws-s3",
            Self::AwsS3PresignedUrl { .. } => "aws-s3-presigned-url",
            Self::Bearer { .. } => "bearer",
            Self::Header { .. } => "header",
        }
    }
}

#[cfg(test)]
mod tests {
    use ctor::ctor;
    use miette::{Context, IntoDiagnostic, Result};
    use schematic::ConfigLoader;
    use tempfile::tempdir;
    use tracing::debug;

    use super::*;

    #[ctor]
    fn prepare() {
        let _ = crate::try_init_tracing();
    }

    #[test]
    fn generate_and_read_config() -> Result<()> {
        let temp_dir = tempdir()
            .into_diagnostic()
            .wrap_err_with(|| "Failed to create temporary directory")?;

        let config_file = temp_dir.path().join("config.toml");

        generate(config_file.as_path())?;

        let config = ConfigLoader::<AppConfig>::new()
            .file(config_file)?
            .load()?
            .config;

        debug!("{:#?}", config);

        assert_eq!(config.transform.base_path, "/cdn-cgi/media");
        assert_eq!(config.kv.variants, "VIDEO_TRANSFORMATIONS_CACHE");
        assert_eq!(config.patterns.len(), 1);

        Ok(())
    }

    #[test]
    fn auth_config_is_tagged() -> Result<()> {
        let toml_src = r#"
type = "aws-s3-presigned-url"
accessKeyVar = "VIDEOS_AWS_ACCESS_KEY_ID"
secretKeyVar = "VIDEOS_AWS_SECRET_ACCESS_KEY"
region = "us-east-1"
service = "s3"
"#;
        let auth: AuthConfig = toml::from_str(toml_src).into_diagnostic()?;
        assert_eq!(auth.type_name(), "aws-s3-presigned-url");
        Ok(())
    }
}
