//! Wire messages of the plugin RPC.
//!
//! Frames are length-delimited JSON envelopes; every message type tolerates
//! schema evolution - unknown fields are ignored and missing fields default.

use crate::build::group::{BuildGroup, BuildGroups};
use crate::build::spec::{Build, BuildType, ContainerFile, EnvType};
use crate::runtime::auth::RegistryCredential;
use crate::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub static MAGIC_COOKIE_KEY: &str = "BASIC_PLUGIN";
pub static MAGIC_COOKIE_VALUE: &str = "hello";
/// The baseline protocol every plugin must speak.
pub static PROTOCOL_VERSION: u32 = 1;
/// Interface versions this host implements, v2 subsumes v1.
pub static SUPPORTED_VERSIONS: [u32; 2] = [1, 2];

/// A typed structured property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ListValue>),
    Struct(HashMap<String, ListValue>),
}

impl ListValue {
    /// Flattens the value into the descriptor's string-list property shape.
    pub fn into_strings(self) -> Vec<String> {
        match self {
            ListValue::Bool(b) => vec![b.to_string()],
            ListValue::Number(n) => vec![n.to_string()],
            ListValue::String(s) => vec![s],
            ListValue::List(values) => values
                .into_iter()
                .flat_map(ListValue::into_strings)
                .collect(),
            ListValue::Struct(map) => {
                let mut entries: Vec<_> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
                    .into_iter()
                    .flat_map(|(k, v)| {
                        v.into_strings()
                            .into_iter()
                            .map(move |v| format!("{}={}", k, v))
                    })
                    .collect()
            }
        }
    }
}

/// Mirror of the build descriptor as plugins deliver it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArgs {
    pub app: String,
    pub build_type: String,
    pub env: String,
    pub image: String,
    pub image_tag: String,
    pub file: String,
    pub folder: String,
    pub registry: String,
    pub containify_registry: String,
    pub organization: String,
    pub repository: String,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub registries: HashMap<String, RegistryCredential>,
    pub properties: HashMap<String, ListValue>,
    pub container_files: HashMap<String, ContainerFile>,
    pub source_packages: Vec<String>,
    pub source_files: Vec<String>,
    pub verbose: bool,
}

impl BuildArgs {
    /// Converts the wire mirror into the canonical descriptor.
    pub fn into_build(self) -> Result<Build> {
        let build_type: BuildType = self.build_type.parse()?;
        let env = if self.env.is_empty() {
            EnvType::default()
        } else {
            self.env.parse()?
        };

        let mut build = Build::new(self.app, build_type, self.image);
        build.env = env;
        build.image_tag = self.image_tag;
        build.file = self.file;
        build.folder = self.folder;
        build.registry = self.registry;
        build.containify_registry = self.containify_registry;
        build.organization = self.organization;
        build.repository = self.repository;
        build.registries = self.registries;
        build.container_files = self.container_files;
        build.source_packages = self.source_packages;
        build.source_files = self.source_files;
        build.verbose = self.verbose;

        if let Some(platform) = self.platform {
            let container = platform.parse()?;
            build.platform = Some(crate::runtime::Platform {
                host: crate::runtime::PlatformSpec::host(),
                container,
            });
        }
        if let Some(runtime) = self.runtime {
            build.runtime = Some(runtime.parse()?);
        }

        build.custom = self
            .properties
            .into_iter()
            .map(|(key, value)| (key, value.into_strings()))
            .collect();

        Ok(build)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArgsGroup {
    pub args: Vec<BuildArgs>,
}

/// v1 answer: a flat list of builds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArgsResponse {
    pub args: Vec<BuildArgs>,
}

/// v2 answer: ordered groups.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArgsGroupResponse {
    pub args: Vec<BuildArgsGroup>,
}

impl BuildArgsResponse {
    /// v1 results run as one parallel group.
    pub fn into_groups(self) -> Result<BuildGroups> {
        let builds = self
            .args
            .into_iter()
            .map(BuildArgs::into_build)
            .collect::<Result<Vec<_>>>()?;
        Ok(BuildGroups::single(builds))
    }
}

impl BuildArgsGroupResponse {
    pub fn into_groups(self) -> Result<BuildGroups> {
        let groups = self
            .args
            .into_iter()
            .map(|group| {
                group
                    .args
                    .into_iter()
                    .map(BuildArgs::into_build)
                    .collect::<Result<Vec<_>>>()
                    .map(BuildGroup::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(BuildGroups::new(groups))
    }
}

/// Host-to-plugin call envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Plugin-to-host answer envelope.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// First message on the wire, in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    pub protocol_version: u32,
    #[serde(default)]
    pub supported_versions: Vec<u32>,
}

impl Handshake {
    pub fn host() -> Self {
        Self {
            magic_cookie_key: MAGIC_COOKIE_KEY.to_string(),
            magic_cookie_value: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
        }
    }

    pub fn cookie_matches(&self) -> bool {
        self.magic_cookie_key == MAGIC_COOKIE_KEY
            && self.magic_cookie_value == MAGIC_COOKIE_VALUE
    }

    /// Picks the highest interface version both sides speak.
    pub fn negotiate(&self, plugin: &Handshake) -> Result<u32> {
        if !plugin.cookie_matches() {
            return Err(
                EngineError::PluginHandshake("magic cookie mismatch".to_string()).into(),
            );
        }
        let plugin_versions = if plugin.supported_versions.is_empty() {
            vec![plugin.protocol_version]
        } else {
            plugin.supported_versions.clone()
        };
        SUPPORTED_VERSIONS
            .iter()
            .rev()
            .find(|v| plugin_versions.contains(v))
            .copied()
            .ok_or_else(|| {
                EngineError::PluginHandshake(format!(
                    "no common protocol version, plugin speaks {:?}",
                    plugin_versions
                ))
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn negotiates_highest_common_version() {
        let host = Handshake::host();

        let mut plugin = Handshake::host();
        plugin.supported_versions = vec![1, 2];
        assert_eq!(host.negotiate(&plugin).unwrap(), 2);

        plugin.supported_versions = vec![1];
        assert_eq!(host.negotiate(&plugin).unwrap(), 1);

        plugin.supported_versions = vec![3];
        assert!(host.negotiate(&plugin).is_err());
    }

    #[test]
    fn cookie_mismatch_is_fatal() {
        let host = Handshake::host();
        let mut plugin = Handshake::host();
        plugin.magic_cookie_value = "goodbye".to_string();
        let err = host.negotiate(&plugin).unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::PluginHandshake(_))
        ));
    }

    #[test]
    fn list_values_flatten_into_properties() {
        let value = ListValue::List(vec![
            ListValue::String("a".into()),
            ListValue::Number(2.0),
            ListValue::Bool(true),
        ]);
        assert_eq!(value.into_strings(), vec!["a", "2", "true"]);

        let mut map = HashMap::new();
        map.insert("k".to_string(), ListValue::String("v".into()));
        assert_eq!(ListValue::Struct(map).into_strings(), vec!["k=v"]);
    }

    #[test]
    fn build_args_convert_to_descriptor() {
        let mut properties = HashMap::new();
        properties.insert(
            "secrets".to_string(),
            ListValue::List(vec![ListValue::String("API_TOKEN".into())]),
        );

        let args = BuildArgs {
            app: "svc".into(),
            build_type: "golang".into(),
            env: "production".into(),
            image: "svc".into(),
            image_tag: "abc".into(),
            platform: Some("linux/arm64".into()),
            properties,
            ..Default::default()
        };

        let build = args.into_build().unwrap();
        assert_eq!(build.build_type, Some(BuildType::GoLang));
        assert_eq!(build.env, EnvType::Production);
        assert_eq!(build.image_uri(), "svc:abc");
        assert_eq!(
            build.platform.as_ref().unwrap().container.to_string(),
            "linux/arm64"
        );
        assert_eq!(build.custom_strings("secrets"), &["API_TOKEN"]);
    }

    #[test]
    fn unknown_build_type_is_invalid_spec() {
        let args = BuildArgs {
            app: "svc".into(),
            build_type: "fortran".into(),
            image: "svc".into(),
            ..Default::default()
        };
        let err = args.into_build().unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::InvalidSpec(_))
        ));
    }

    #[test]
    fn envelopes_tolerate_unknown_fields() {
        let raw = r#"{"id": 7, "result": {"args": []}, "error": null, "future_field": 1}"#;
        let response: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(response.id, 7);
        assert!(response.error.is_none());
    }
}
