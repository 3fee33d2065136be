//! Registry authentication.
//!
//! Credentials come from the build descriptor's registry map. A value may be
//! a literal or an `env:NAME` indirection resolved against the process
//! environment at use time. Raw secrets never reach the log output.

use crate::log::debug;
use crate::EngineError;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

static ENV_PREFIX: &str = "env:";
pub static DEFAULT_REGISTRY_HOST: &str = "docker.io";

/// An image reference split into its addressing parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub server: String,
    pub name: String,
    pub tag: String,
}

impl ImageRef {
    /// Parses `[server/]name[:tag]`. The first path segment counts as a
    /// server only when it looks like a host (contains `.` or `:`, or is
    /// `localhost`), mirroring the daemon's own resolution rules.
    pub fn parse(reference: &str) -> Self {
        let (rest, tag) = match reference.rsplit_once(':') {
            // a colon inside the last path segment is a tag separator,
            // a colon before a slash belongs to a server port
            Some((rest, tag)) if !tag.contains('/') => (rest, tag.to_string()),
            _ => (reference, "latest".to_string()),
        };

        match rest.split_once('/') {
            Some((first, _))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                let (server, name) = rest.split_once('/').unwrap();
                Self {
                    server: server.to_string(),
                    name: name.to_string(),
                    tag,
                }
            }
            _ => Self {
                server: DEFAULT_REGISTRY_HOST.to_string(),
                name: rest.to_string(),
                tag,
            },
        }
    }

    pub fn uri(&self) -> String {
        if self.server == DEFAULT_REGISTRY_HOST {
            format!("{}:{}", self.name, self.tag)
        } else {
            format!("{}/{}:{}", self.server, self.name, self.tag)
        }
    }
}

/// A registry entry as supplied by the build descriptor; both fields may be
/// env-indirected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl RegistryCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Resolves indirections against the process environment. A missing
    /// environment variable resolves to an empty value, which callers treat
    /// as "no auth configured".
    pub fn resolve(&self) -> (String, String) {
        (resolve_value(&self.username), resolve_value(&self.password))
    }
}

fn resolve_value(value: &str) -> String {
    match value.strip_prefix(ENV_PREFIX) {
        Some(name) => env::var(name).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Resolved credentials for one registry host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthHeader<'a> {
    username: &'a str,
    password: &'a str,
    server_address: &'a str,
}

impl RegistryAuth {
    /// Looks up and resolves the credentials matching `reference` in the
    /// descriptor's registry map.
    pub fn find(
        registries: &HashMap<String, RegistryCredential>,
        reference: &ImageRef,
    ) -> Option<Self> {
        let credential = registries.get(&reference.server)?;
        let (username, password) = credential.resolve();
        if username.is_empty() || password.is_empty() {
            debug!(
                "no usable credentials for registry {}, auth configured: false",
                reference.server
            );
            return None;
        }
        debug!(
            "registry {}, user {}, auth configured: true",
            reference.server, username
        );
        Some(Self {
            username,
            password,
            server_address: reference.server.clone(),
        })
    }

    /// The base64-URL-encoded JSON header both daemons accept.
    pub fn encoded(&self) -> String {
        let header = AuthHeader {
            username: &self.username,
            password: &self.password,
            server_address: &self.server_address,
        };
        // serialization of three strings cannot fail
        let json = serde_json::to_string(&header).unwrap_or_default();
        base64::encode_config(json, base64::URL_SAFE)
    }

    pub fn build_docker(&self) -> docker_api::opts::RegistryAuth {
        docker_api::opts::RegistryAuth::builder()
            .username(&self.username)
            .password(&self.password)
            .server_address(&self.server_address)
            .build()
    }

    pub fn build_podman(&self) -> podman_api::opts::RegistryAuth {
        podman_api::opts::RegistryAuth::builder()
            .username(&self.username)
            .password(&self.password)
            .server_address(&self.server_address)
            .build()
    }

    /// Error for operations that need credentials but found none.
    pub fn required(reference: &ImageRef) -> crate::Error {
        EngineError::AuthRequired {
            registry: reference.server.clone(),
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_image_references() {
        let r = ImageRef::parse("alpine:3.19");
        assert_eq!(r.server, "docker.io");
        assert_eq!(r.name, "alpine");
        assert_eq!(r.tag, "3.19");

        let r = ImageRef::parse("ghcr.io/containifyci/app");
        assert_eq!(r.server, "ghcr.io");
        assert_eq!(r.name, "containifyci/app");
        assert_eq!(r.tag, "latest");

        let r = ImageRef::parse("localhost:5000/app:v1");
        assert_eq!(r.server, "localhost:5000");
        assert_eq!(r.name, "app");
        assert_eq!(r.tag, "v1");

        let r = ImageRef::parse("library/nginx");
        assert_eq!(r.server, "docker.io");
        assert_eq!(r.name, "library/nginx");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn resolves_env_indirection() {
        std::env::set_var("ENGINE_TEST_REGISTRY_USER", "robot");
        let cred = RegistryCredential::new("env:ENGINE_TEST_REGISTRY_USER", "hunter2");
        let (user, pass) = cred.resolve();
        assert_eq!(user, "robot");
        assert_eq!(pass, "hunter2");

        let cred = RegistryCredential::new("env:ENGINE_TEST_MISSING_VAR_XYZ", "x");
        let (user, _) = cred.resolve();
        assert_eq!(user, "");
    }

    #[test]
    fn encodes_auth_header() {
        let auth = RegistryAuth {
            username: "user".into(),
            password: "pass".into(),
            server_address: "docker.io".into(),
        };
        let decoded = base64::decode_config(auth.encoded(), base64::URL_SAFE).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["Username"], "user");
        assert_eq!(value["Password"], "pass");
        assert_eq!(value["ServerAddress"], "docker.io");
    }

    #[test]
    fn find_skips_unresolvable_credentials() {
        let mut registries = HashMap::new();
        registries.insert(
            "docker.io".to_string(),
            RegistryCredential::new("env:ENGINE_TEST_NO_SUCH_USER", "env:ENGINE_TEST_NO_SUCH_PASS"),
        );
        let reference = ImageRef::parse("alpine");
        assert_eq!(RegistryAuth::find(&registries, &reference), None);
    }
}
