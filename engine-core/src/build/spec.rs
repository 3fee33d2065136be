//! The canonical build descriptor and its defaulting rules.

use crate::runtime::auth::RegistryCredential;
use crate::runtime::{Platform, RuntimeKind};
use crate::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

pub static DEFAULT_REGISTRY: &str = "containifyci";
pub static COMMIT_SHA_VAR: &str = "COMMIT_SHA";

/// Per-language builder selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildType {
    GoLang,
    Maven,
    Python,
    NodeJS,
    Typescript,
    Zig,
    Rust,
    AI,
    Generic,
}

impl AsRef<str> for BuildType {
    fn as_ref(&self) -> &str {
        match self {
            BuildType::GoLang => "golang",
            BuildType::Maven => "maven",
            BuildType::Python => "python",
            BuildType::NodeJS => "nodejs",
            BuildType::Typescript => "typescript",
            BuildType::Zig => "zig",
            BuildType::Rust => "rust",
            BuildType::AI => "ai",
            BuildType::Generic => "generic",
        }
    }
}

impl FromStr for BuildType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "golang" | "go" => Ok(BuildType::GoLang),
            "maven" => Ok(BuildType::Maven),
            "python" => Ok(BuildType::Python),
            "nodejs" => Ok(BuildType::NodeJS),
            "typescript" => Ok(BuildType::Typescript),
            "zig" => Ok(BuildType::Zig),
            "rust" => Ok(BuildType::Rust),
            "ai" => Ok(BuildType::AI),
            "generic" => Ok(BuildType::Generic),
            other => {
                Err(EngineError::InvalidSpec(format!("unknown build type `{}`", other)).into())
            }
        }
    }
}

/// Environment profile of a build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvType {
    Local,
    #[default]
    Build,
    Production,
}

impl AsRef<str> for EnvType {
    fn as_ref(&self) -> &str {
        match self {
            EnvType::Local => "local",
            EnvType::Build => "build",
            EnvType::Production => "production",
        }
    }
}

impl FromStr for EnvType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(EnvType::Local),
            "build" => Ok(EnvType::Build),
            "production" => Ok(EnvType::Production),
            other => {
                Err(EngineError::InvalidSpec(format!("unknown environment `{}`", other)).into())
            }
        }
    }
}

/// A user-supplied dockerfile for one stage of a build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFile {
    pub name: String,
    pub content: String,
}

/// One unit of work, ending in a pushed application image. Immutable once
/// [`Build::defaults`] ran; the latch makes that initialization idempotent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub app: String,
    pub build_type: Option<BuildType>,
    #[serde(default)]
    pub env: EnvType,
    pub image: String,
    #[serde(default)]
    pub image_tag: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub containify_registry: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub runtime: Option<RuntimeKind>,
    #[serde(default)]
    pub registries: HashMap<String, RegistryCredential>,
    #[serde(default)]
    pub custom: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub container_files: HashMap<String, ContainerFile>,
    #[serde(default)]
    pub source_packages: Vec<String>,
    #[serde(default)]
    pub source_files: Vec<String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(skip)]
    defaults: bool,
}

impl Build {
    pub fn new(app: impl Into<String>, build_type: BuildType, image: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            build_type: Some(build_type),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Service-build constructor: the image tag falls back to the commit the
    /// CI run is building.
    pub fn service(
        app: impl Into<String>,
        build_type: BuildType,
        image: impl Into<String>,
    ) -> Self {
        let mut build = Self::new(app, build_type, image);
        if build.image_tag.is_empty() {
            build.image_tag = env::var(COMMIT_SHA_VAR).unwrap_or_default();
        }
        build
    }

    /// Fills every zero-valued field with its documented default. Idempotent
    /// and latch-guarded; the descriptor is immutable afterwards.
    pub fn defaults(&mut self) -> &mut Self {
        if self.defaults {
            return self;
        }
        self.defaults = true;

        if self.folder.is_empty() {
            self.folder = ".".to_string();
        }
        if self.repository.is_empty() {
            self.repository = self.image.clone();
        }
        if self.registry.is_empty() {
            self.registry = DEFAULT_REGISTRY.to_string();
        }
        if self.containify_registry.is_empty() {
            self.containify_registry = DEFAULT_REGISTRY.to_string();
        }
        if self.organization.is_empty() {
            self.organization = DEFAULT_REGISTRY.to_string();
        }
        if self.platform.is_none() {
            self.platform = Some(Platform::auto());
        }
        if self.registries.is_empty() {
            self.registries.insert(
                "docker.io".to_string(),
                RegistryCredential::new("env:DOCKER_USERNAME", "env:DOCKER_PASSWORD"),
            );
        }

        self
    }

    pub fn defaults_applied(&self) -> bool {
        self.defaults
    }

    /// `image:tag`, including the trailing colon for an empty tag.
    pub fn image_uri(&self) -> String {
        format!("{}:{}", self.image, self.image_tag)
    }

    /// The stable CLI contract between the engine and child invocations.
    pub fn as_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "--app".to_string(),
            self.app.clone(),
            "--env".to_string(),
            self.env.as_ref().to_string(),
            "--image".to_string(),
            self.image.clone(),
            "--tag".to_string(),
            self.image_tag.clone(),
            "--repo".to_string(),
            self.repository.clone(),
            "--file".to_string(),
            self.file.clone(),
            "--folder".to_string(),
            self.folder.clone(),
            "--type".to_string(),
            self.build_type
                .map(|t| t.as_ref().to_string())
                .unwrap_or_default(),
        ];
        if self.verbose {
            flags.push("--verbose".to_string());
        }
        for package in &self.source_packages {
            flags.push("--protobuf-packages".to_string());
            flags.push(package.clone());
        }
        for file in &self.source_files {
            flags.push("--protobuf-files".to_string());
            flags.push(file.clone());
        }
        flags
    }

    /// Validates the descriptor after defaulting.
    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(EngineError::InvalidSpec("app must not be empty".into()).into());
        }
        if self.image.is_empty() {
            return Err(EngineError::InvalidSpec("image must not be empty".into()).into());
        }
        if self.build_type.is_none() {
            return Err(EngineError::InvalidSpec("build type must be set".into()).into());
        }
        Ok(())
    }

    // typed accessors over the free-form properties

    pub fn custom_string(&self, key: &str) -> Option<&str> {
        self.custom
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn custom_strings(&self, key: &str) -> &[String] {
        self.custom.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn custom_bool(&self, key: &str, default: bool) -> bool {
        match self.custom_string(key) {
            Some(value) => value == "true",
            None => default,
        }
    }

    pub fn custom_uint(&self, key: &str) -> u64 {
        self.custom_string(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}
