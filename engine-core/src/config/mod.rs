//! Immutable merged configuration.
//!
//! Load order: built-in defaults, then an optional YAML or JSON file (format
//! picked by extension), then `ENGINE_CI_*` environment overrides, then the
//! CLI flags that were actually set. Right-most wins. Readers take an atomic
//! snapshot; `set` publishes a new one without disturbing in-flight
//! operations.

use crate::build::spec::{BuildType, EnvType};
use crate::runtime::RuntimeKind;
use crate::{EngineError, ErrContext, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub static ENV_PREFIX: &str = "ENGINE_CI_";

lazy_static! {
    static ref SNAPSHOT: RwLock<Arc<AppConfig>> = RwLock::new(Arc::new(AppConfig::default()));
}

/// The snapshot the calling operation observed; later `set` calls do not
/// affect it.
pub fn snapshot() -> Arc<AppConfig> {
    SNAPSHOT.read().unwrap().clone()
}

/// Atomically publishes a new snapshot for subsequent readers.
pub fn set(config: AppConfig) {
    *SNAPSHOT.write().unwrap() = Arc::new(config);
}

/// Suffix grammar for durations: `500ms`, `10s`, `2m`, `1h`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| EngineError::InvalidSpec(format!("duration `{}` has no unit", value)))?;
    let (num, unit) = value.split_at(split);
    let num: u64 = num
        .parse()
        .map_err(|_| EngineError::InvalidSpec(format!("invalid duration `{}`", value)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        "h" => Ok(Duration::from_secs(num * 60 * 60)),
        _ => Err(EngineError::InvalidSpec(format!("invalid duration unit `{}`", unit)).into()),
    }
}

fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();
    if duration.subsec_millis() != 0 {
        format!("{}ms", duration.as_millis())
    } else if secs % 3600 == 0 && secs != 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 && secs != 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// How eagerly images are pulled before container creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl FromStr for PullPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "never" => Ok(PullPolicy::Never),
            "if_not_present" => Ok(PullPolicy::IfNotPresent),
            other => {
                Err(EngineError::InvalidSpec(format!("unknown pull policy `{}`", other)).into())
            }
        }
    }
}

/// Per-build-type parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    pub base_image: String,
    pub lint_image: String,
    pub version: String,
    pub mount_path: String,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    pub variants: Vec<String>,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            base_image: String::new(),
            lint_image: String::new(),
            version: String::new(),
            mount_path: "/src".to_string(),
            timeout: Duration::from_secs(30 * 60),
            variants: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    #[serde(with = "duration_str")]
    pub container: Duration,
    #[serde(with = "duration_str")]
    pub container_start: Duration,
    #[serde(with = "duration_str")]
    pub container_stop: Duration,
    #[serde(with = "duration_str")]
    pub build: Duration,
    #[serde(with = "duration_str")]
    pub test: Duration,
    #[serde(with = "duration_str")]
    pub pull: Duration,
    #[serde(with = "duration_str")]
    pub push: Duration,
    #[serde(with = "duration_str")]
    pub script: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            container: Duration::from_secs(2 * 60 * 60),
            container_start: Duration::from_secs(15),
            container_stop: Duration::from_secs(15),
            build: Duration::from_secs(60 * 60),
            test: Duration::from_secs(30 * 60),
            pull: Duration::from_secs(15 * 60),
            push: Duration::from_secs(15 * 60),
            script: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub registry: String,
    pub pull_policy: PullPolicy,
    pub timeouts: Timeouts,
    pub resources: Resources,
    pub volumes: Vec<String>,
    pub runtime: Option<RuntimeKind>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            registry: "containifyci".to_string(),
            pull_policy: PullPolicy::default(),
            timeouts: Timeouts::default(),
            resources: Resources::default(),
            volumes: Vec::new(),
            runtime: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/engine-ci"),
            enabled: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub image: String,
    pub severity: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub create_non_root_user: bool,
    pub verify_tls: bool,
    pub secret_provider: Option<String>,
    pub scanner: Option<ScannerConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
            username: "build".to_string(),
            create_non_root_user: false,
            verify_tls: true,
            secret_provider: None,
            scanner: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub no_color: bool,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            no_color: false,
            file: None,
        }
    }
}

/// CLI overrides; only flags the user actually set are applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlagOverrides {
    pub environment: Option<EnvType>,
    pub registry: Option<String>,
    pub runtime: Option<RuntimeKind>,
    pub log_level: Option<String>,
    pub no_color: Option<bool>,
    pub pull_policy: Option<PullPolicy>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub environment: EnvType,
    pub language: HashMap<BuildType, LanguageConfig>,
    pub container: ContainerConfig,
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut language = HashMap::new();
        language.insert(
            BuildType::GoLang,
            LanguageConfig {
                base_image: "golang:1.22".to_string(),
                lint_image: "golangci/golangci-lint:v1.59".to_string(),
                version: "1.22.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::Rust,
            LanguageConfig {
                base_image: "rust:1.79".to_string(),
                lint_image: "rust:1.79".to_string(),
                version: "1.79.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::Python,
            LanguageConfig {
                base_image: "python:3.12".to_string(),
                lint_image: "python:3.12".to_string(),
                version: "3.12.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::Maven,
            LanguageConfig {
                base_image: "maven:3.9-eclipse-temurin-21".to_string(),
                lint_image: "maven:3.9-eclipse-temurin-21".to_string(),
                version: "3.9.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::NodeJS,
            LanguageConfig {
                base_image: "node:20".to_string(),
                lint_image: "node:20".to_string(),
                version: "20.0.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::Typescript,
            LanguageConfig {
                base_image: "node:20".to_string(),
                lint_image: "node:20".to_string(),
                version: "20.0.0".to_string(),
                ..Default::default()
            },
        );
        language.insert(
            BuildType::Zig,
            LanguageConfig {
                base_image: "ziglang/zig:0.13".to_string(),
                lint_image: "ziglang/zig:0.13".to_string(),
                version: "0.13.0".to_string(),
                ..Default::default()
            },
        );

        Self {
            environment: EnvType::Build,
            language,
            container: ContainerConfig::default(),
            cache: CacheConfig::default(),
            security: SecurityConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, optionally overlaid with a config file, environment
    /// overrides and changed CLI flags.
    pub fn load(file: Option<&Path>, flags: &FlagOverrides) -> Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.apply_flags(flags);
        Ok(config)
    }

    /// Reads a full config file; the extension decides the format.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read config `{}`", path.display()))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => {
                serde_yaml::from_slice(&raw).context("invalid yaml configuration")
            }
            Some("json") => serde_json::from_slice(&raw).context("invalid json configuration"),
            other => Err(EngineError::InvalidSpec(format!(
                "unsupported config format `{}`",
                other.unwrap_or("")
            ))
            .into()),
        }
    }

    /// Overrides keyed by the fixed `ENGINE_CI_` prefix.
    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(format!("{}ENV", ENV_PREFIX)) {
            self.environment = value.parse()?;
        }
        if let Ok(value) = std::env::var(format!("{}REGISTRY", ENV_PREFIX)) {
            self.container.registry = value;
        }
        if let Ok(value) = std::env::var(format!("{}RUNTIME", ENV_PREFIX)) {
            self.container.runtime = Some(value.parse()?);
        }
        if let Ok(value) = std::env::var(format!("{}PULL_POLICY", ENV_PREFIX)) {
            self.container.pull_policy = value.parse()?;
        }
        if let Ok(value) = std::env::var(format!("{}LOG_LEVEL", ENV_PREFIX)) {
            self.logging.level = value;
        }
        if let Ok(value) = std::env::var(format!("{}NO_COLOR", ENV_PREFIX)) {
            self.logging.no_color = value == "true";
        }
        if let Ok(value) = std::env::var(format!("{}BUILD_TIMEOUT", ENV_PREFIX)) {
            self.container.timeouts.build = parse_duration(&value)?;
        }
        if let Ok(value) = std::env::var(format!("{}PULL_TIMEOUT", ENV_PREFIX)) {
            self.container.timeouts.pull = parse_duration(&value)?;
        }
        if let Ok(value) = std::env::var(format!("{}VERIFY_TLS", ENV_PREFIX)) {
            self.security.verify_tls = value == "true";
        }
        if let Ok(value) = std::env::var(format!("{}VOLUMES", ENV_PREFIX)) {
            self.container.volumes = value
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(())
    }

    fn apply_flags(&mut self, flags: &FlagOverrides) {
        if let Some(environment) = flags.environment {
            self.environment = environment;
        }
        if let Some(registry) = &flags.registry {
            self.container.registry = registry.clone();
        }
        if let Some(runtime) = flags.runtime {
            self.container.runtime = Some(runtime);
        }
        if let Some(level) = &flags.log_level {
            self.logging.level = level.clone();
        }
        if let Some(no_color) = flags.no_color {
            self.logging.no_color = no_color;
        }
        if let Some(policy) = flags.pull_policy {
            self.container.pull_policy = policy;
        }
    }

    pub fn language(&self, build_type: BuildType) -> LanguageConfig {
        self.language.get(&build_type).cloned().unwrap_or_default()
    }

    /// Collects every violation instead of stopping at the first.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::new();

        if self.container.registry.is_empty() {
            violations.push("container.registry must not be empty".to_string());
        }
        if !matches!(self.logging.level.as_str(), "debug" | "info" | "warn" | "error") {
            violations.push(format!("logging.level `{}` is invalid", self.logging.level));
        }
        if !self.cache.dir.is_absolute() {
            violations.push(format!(
                "cache.dir `{}` must be absolute",
                self.cache.dir.display()
            ));
        }

        check_duration(
            "container.timeouts.pull",
            self.container.timeouts.pull,
            Duration::from_secs(30),
            Duration::from_secs(30 * 60),
            &mut violations,
        );
        check_duration(
            "container.timeouts.push",
            self.container.timeouts.push,
            Duration::from_secs(30),
            Duration::from_secs(30 * 60),
            &mut violations,
        );
        check_duration(
            "container.timeouts.build",
            self.container.timeouts.build,
            Duration::from_secs(60),
            Duration::from_secs(4 * 60 * 60),
            &mut violations,
        );
        check_duration(
            "container.timeouts.container_start",
            self.container.timeouts.container_start,
            Duration::from_secs(1),
            Duration::from_secs(60),
            &mut violations,
        );
        check_duration(
            "container.timeouts.container_stop",
            self.container.timeouts.container_stop,
            Duration::from_secs(1),
            Duration::from_secs(60),
            &mut violations,
        );

        for (build_type, language) in &self.language {
            if !language.version.is_empty() && !is_version(&language.version) {
                violations.push(format!(
                    "language.{}.version `{}` is not a version",
                    build_type.as_ref(),
                    language.version
                ));
            }
            if !language.base_image.is_empty() && !is_image_ref(&language.base_image) {
                violations.push(format!(
                    "language.{}.base_image `{}` is not an image reference",
                    build_type.as_ref(),
                    language.base_image
                ));
            }
        }

        if self.environment == EnvType::Production {
            if !self.security.create_non_root_user {
                violations
                    .push("production requires security.create_non_root_user=true".to_string());
            }
            if !self.security.verify_tls {
                violations.push("production requires security.verify_tls=true".to_string());
            }
            if self.container.resources.cpu_limit.is_none()
                || self.container.resources.memory_limit.is_none()
            {
                violations.push("production requires explicit resource limits".to_string());
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidSpec(violations.join("; ")).into())
        }
    }
}

fn check_duration(
    name: &str,
    value: Duration,
    min: Duration,
    max: Duration,
    violations: &mut Vec<String>,
) {
    if value < min || value > max {
        violations.push(format!(
            "{} must be between {} and {}",
            name,
            format_duration(&min),
            format_duration(&max)
        ));
    }
}

/// `v?MAJOR.MINOR.PATCH` with optional pre-release/build suffix.
fn is_version(value: &str) -> bool {
    let value = value.strip_prefix('v').unwrap_or(value);
    let core = value
        .split_once(|c| c == '-' || c == '+')
        .map(|(core, _)| core)
        .unwrap_or(value);
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// `name[:tag]` with an optional registry path.
fn is_image_ref(value: &str) -> bool {
    if value.is_empty() || value.contains(char::is_whitespace) {
        return false;
    }
    match value.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => !name.is_empty() && !tag.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        config.validate().unwrap();
    }

    #[test]
    fn yaml_overlay_wins_over_defaults() {
        let dir = std::env::temp_dir().join("engine-ci-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yml");
        std::fs::write(
            &path,
            "container:\n  registry: ghcr.io/acme\n  timeouts:\n    build: 30m\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.container.registry, "ghcr.io/acme");
        assert_eq!(
            config.container.timeouts.build,
            Duration::from_secs(30 * 60)
        );
        assert_eq!(config.logging.level, "debug");
        // untouched sections keep their defaults
        assert_eq!(config.container.pull_policy, PullPolicy::IfNotPresent);
    }

    #[test]
    fn changed_flags_win_last() {
        let mut config = AppConfig::default();
        config.apply_flags(&FlagOverrides {
            registry: Some("registry.internal".into()),
            log_level: Some("warn".into()),
            ..Default::default()
        });
        assert_eq!(config.container.registry, "registry.internal");
        assert_eq!(config.logging.level, "warn");
        // unset flags change nothing
        assert_eq!(config.environment, EnvType::Build);
    }

    #[test]
    fn production_overlay_requires_hardening() {
        let mut config = AppConfig::default();
        config.environment = EnvType::Production;
        let err = config.validate().unwrap_err();
        let message = format!("{}", err);
        assert!(message.contains("create_non_root_user"));
        assert!(message.contains("resource limits"));

        config.security.create_non_root_user = true;
        config.security.verify_tls = true;
        config.container.resources.cpu_limit = Some(2.0);
        config.container.resources.memory_limit = Some("2Gi".into());
        config.validate().unwrap();
    }

    #[test]
    fn validation_lists_every_violation() {
        let mut config = AppConfig::default();
        config.logging.level = "loud".into();
        config.cache.dir = PathBuf::from("relative/cache");
        config.container.timeouts.pull = Duration::from_secs(1);
        let err = config.validate().unwrap_err();
        let message = format!("{}", err);
        assert!(message.contains("logging.level"));
        assert!(message.contains("cache.dir"));
        assert!(message.contains("timeouts.pull"));
    }

    #[test]
    fn version_and_image_checks() {
        assert!(is_version("1.22.0"));
        assert!(is_version("v0.13.0"));
        assert!(is_version("1.2.3-rc.1"));
        assert!(!is_version("1.22"));
        assert!(!is_version("latest"));

        assert!(is_image_ref("golang:1.22"));
        assert!(is_image_ref("ghcr.io/acme/tool:v1"));
        assert!(is_image_ref("alpine"));
        assert!(!is_image_ref("bad image"));
        assert!(!is_image_ref("name:"));
    }

    #[test]
    fn snapshot_publishes_atomically() {
        let before = snapshot();
        let mut next = AppConfig::default();
        next.container.registry = "snapshot.test".to_string();
        set(next);

        let after = snapshot();
        assert_eq!(after.container.registry, "snapshot.test");
        // the old snapshot is untouched
        assert_ne!(before.container.registry, "snapshot.test");
        set(AppConfig::default());
    }
}
