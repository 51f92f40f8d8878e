// SPDX-License-Identifier: Apache-2.0

//! The image configuration document and the edits the append pipeline
//! performs on it: timestamps, history drops, user patches and layer
//! bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::docker::v2::Descriptor;
use super::{empty_layer_diff_id, media, Digest, GZIPPED_EMPTY_LAYER};
use crate::error::Error;

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// The parts of the configuration the container runtime consumes.
///
/// Field names are capitalized on the wire; nullable lists stay `Option` so
/// that a merge patch with an explicit `null` clears them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Hostname", default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(rename = "Domainname", default, skip_serializing_if = "String::is_empty")]
    pub domainname: String,

    #[serde(rename = "User", default, skip_serializing_if = "String::is_empty")]
    pub user: String,

    #[serde(rename = "ExposedPorts", skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<HashMap<String, Value>>,

    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "Image", default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(rename = "Volumes", skip_serializing_if = "Option::is_none")]
    pub volumes: Option<HashMap<String, Value>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "OnBuild", skip_serializing_if = "Option::is_none")]
    pub on_build: Option<Vec<String>>,

    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,

    #[serde(rename = "StopSignal", default, skip_serializing_if = "String::is_empty")]
    pub stop_signal: String,

    /// Members not modeled here (Healthcheck, Shell, ArgsEscaped, ...) pass
    /// through to the output image untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The fixed-type root-filesystem descriptor: one content digest per layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl RootFs {
    fn layers() -> Self {
        Self {
            kind: "layers".into(),
            diff_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(default, skip_serializing_if = "is_false")]
    pub empty_layer: bool,
}

/// The image configuration blob referenced by a modern manifest.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<RuntimeConfig>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<RootFs>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,

    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(rename = "os.features", default, skip_serializing_if = "Vec::is_empty")]
    pub os_features: Vec<String>,

    /// Members not modeled here (variant, builder annotations, ...) pass
    /// through to the output image untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The per-layer compatibility document carried by legacy manifests. Also
/// serialized back out when a destination only accepts the legacy schema.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct V1Image {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<RuntimeConfig>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub architecture: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os: String,

    #[serde(rename = "size", default, skip_serializing_if = "is_zero")]
    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub throwaway: Option<bool>,
}

impl V1Image {
    /// A synthesized history line, the way build tools record one.
    pub fn created_by(&self) -> String {
        self.container_config
            .as_ref()
            .and_then(|c| c.cmd.as_ref())
            .map(|cmd| cmd.join(" "))
            .unwrap_or_default()
    }
}

impl ImageConfig {
    /// The configuration shell a scratch base starts from. The creation
    /// time must be non-zero for some registries to accept the config.
    pub fn empty() -> Self {
        let (os, architecture) = host_platform();
        Self {
            created: Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 1).single(),
            os: os.into(),
            architecture: architecture.into(),
            ..Self::default()
        }
    }

    pub fn from_v1(v1: V1Image) -> Self {
        Self {
            id: v1.id,
            parent: v1.parent,
            comment: v1.comment,
            created: v1.created,
            container: v1.container,
            container_config: v1.container_config,
            docker_version: v1.docker_version,
            author: v1.author,
            config: v1.config,
            architecture: v1.architecture,
            os: v1.os,
            size: v1.size,
            ..Self::default()
        }
    }

    /// The runtime sub-config, created on demand so it is never null in the
    /// published document.
    pub fn runtime_mut(&mut self) -> &mut RuntimeConfig {
        self.config.get_or_insert_with(RuntimeConfig::default)
    }

    pub fn diff_ids(&self) -> &[String] {
        self.rootfs.as_ref().map(|r| &r.diff_ids[..]).unwrap_or(&[])
    }

    pub fn set_diff_id(&mut self, index: usize, diff_id: &Digest) {
        let rootfs = self.rootfs.get_or_insert_with(RootFs::layers);
        if index < rootfs.diff_ids.len() {
            rootfs.diff_ids[index] = diff_id.to_string();
        }
    }

    /// Accounts for one more layer: a root-filesystem entry (empty when the
    /// content digest is not yet known), the layer's size, and one history
    /// entry.
    pub fn add_layer(&mut self, size: u64, diff_id: Option<&Digest>, history: History) {
        let rootfs = self.rootfs.get_or_insert_with(RootFs::layers);
        rootfs
            .diff_ids
            .push(diff_id.map(|d| d.to_string()).unwrap_or_default());
        self.size += size;
        self.history.push(history);
    }

    /// Adds the synthetic empty layer a scratch base consists of.
    pub fn add_scratch_layer(&mut self) -> Descriptor {
        let layer = Descriptor {
            media_type: media::LAYER_GZIP.into(),
            size: GZIPPED_EMPTY_LAYER.len() as u64,
            digest: super::gzipped_empty_layer_digest(),
            urls: Vec::new(),
        };

        self.add_layer(
            layer.size,
            Some(&empty_layer_diff_id()),
            History {
                created: self.created,
                comment: "empty base layer".into(),
                ..History::default()
            },
        );

        layer
    }

    /// Clears every field that records how the base image was built.
    pub fn drop_history(&mut self) {
        self.container_config = None;
        self.history.clear();
        self.container.clear();
        self.docker_version.clear();
        if let Some(config) = self.config.as_mut() {
            config.image.clear();
        }
    }

    /// Applies a JSON merge overlay to the runtime sub-config.
    pub fn patch_runtime(&mut self, patch: &str) -> Result<(), Error> {
        let patched = apply(self.runtime_mut().clone(), patch)?;
        *self.runtime_mut() = patched;
        Ok(())
    }

    /// Applies a JSON merge overlay to the whole document.
    pub fn patch(&mut self, patch: &str) -> Result<(), Error> {
        *self = apply(self.clone(), patch)?;
        Ok(())
    }

    /// Whether the layer list, the root-filesystem list and the history are
    /// still in agreement. The history may run short of the layer list, the
    /// way a dropped history leaves it; it must never run long.
    pub fn aligned_with(&self, layers: usize) -> bool {
        if self.diff_ids().len() != layers {
            return false;
        }

        let real = self.history.iter().filter(|h| !h.empty_layer).count();
        real <= layers
    }
}

fn apply<T>(doc: T, patch: &str) -> Result<T, Error>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let patch: Value =
        serde_json::from_str(patch).map_err(|e| Error::InvalidPatch(e.to_string()))?;
    let mut value = serde_json::to_value(&doc)?;
    merge(&mut value, patch);
    serde_json::from_value(value).map_err(|e| Error::InvalidPatch(e.to_string()))
}

/// JSON merge overlay: objects merge member-wise, an explicit null removes
/// the member, everything else replaces wholesale.
fn merge(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            if let Some(map) = target.as_object_mut() {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(&key);
                    } else {
                        merge(map.entry(key).or_insert(Value::Null), value);
                    }
                }
            }
        }
        other => *target = other,
    }
}

/// The host platform in the identifiers registries use.
pub fn host_platform() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        os => os,
    };

    let architecture = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        arch => arch,
    };

    (os, architecture)
}

#[cfg(test)]
mod test {
    use super::*;

    fn config_with_entrypoint() -> ImageConfig {
        let mut config = ImageConfig::empty();
        config.runtime_mut().entrypoint = Some(vec!["/bin/mysqld".into()]);
        config.runtime_mut().env = Some(vec!["PATH=/usr/bin".into()]);
        config
    }

    #[test]
    fn empty_config_has_nonzero_created() {
        let config = ImageConfig::empty();
        let created = config.created.unwrap();
        assert!(created.timestamp() != 0);
    }

    #[test]
    fn runtime_patch_clears_entrypoint() {
        let mut config = config_with_entrypoint();
        config.patch_runtime(r#"{"Entrypoint":null}"#).unwrap();
        assert!(config.config.as_ref().unwrap().entrypoint.is_none());
        assert_eq!(
            config.config.as_ref().unwrap().env.as_ref().unwrap().len(),
            1
        );
    }

    #[test]
    fn runtime_patch_replaces_lists_wholesale() {
        let mut config = config_with_entrypoint();
        config
            .patch_runtime(r#"{"Env":["HOME=/root"],"User":"nobody"}"#)
            .unwrap();
        let runtime = config.config.as_ref().unwrap();
        assert_eq!(runtime.env.as_deref().unwrap(), ["HOME=/root"]);
        assert_eq!(runtime.user, "nobody");
        assert!(runtime.entrypoint.is_some());
    }

    #[test]
    fn whole_document_patch() {
        let mut config = config_with_entrypoint();
        config
            .patch(r#"{"author":"someone","os":"windows"}"#)
            .unwrap();
        assert_eq!(config.author, "someone");
        assert_eq!(config.os, "windows");
    }

    #[test]
    fn syntactically_bad_patch_is_rejected() {
        let mut config = ImageConfig::empty();
        assert!(matches!(
            config.patch_runtime("{not json"),
            Err(Error::InvalidPatch(..))
        ));
    }

    #[test]
    fn patch_with_wrong_shape_is_rejected() {
        let mut config = ImageConfig::empty();
        assert!(matches!(
            config.patch(r#"{"history":"not a list"}"#),
            Err(Error::InvalidPatch(..))
        ));
    }

    #[test]
    fn drop_history_clears_provenance() {
        let mut config = config_with_entrypoint();
        config.container = "deadbeef".into();
        config.docker_version = "20.10".into();
        config.container_config = Some(RuntimeConfig::default());
        config.runtime_mut().image = "sha256:base".into();
        config.history.push(History::default());

        config.drop_history();

        assert!(config.container_config.is_none());
        assert!(config.history.is_empty());
        assert!(config.container.is_empty());
        assert!(config.docker_version.is_empty());
        assert!(config.config.as_ref().unwrap().image.is_empty());
    }

    #[test]
    fn scratch_layer_alignment() {
        let mut config = ImageConfig::empty();
        let layer = config.add_scratch_layer();
        assert_eq!(layer.size, 32);
        assert_eq!(config.diff_ids().len(), 1);
        assert!(config.aligned_with(1));
        assert!(!config.aligned_with(2));
    }

    #[test]
    fn alignment_counts_only_real_layers() {
        let mut config = ImageConfig::empty();
        config.add_scratch_layer();
        config.history.push(History {
            empty_layer: true,
            ..History::default()
        });
        assert!(config.aligned_with(1));

        config.history.push(History::default());
        assert!(!config.aligned_with(1));
    }

    #[test]
    fn dropped_history_still_aligns() {
        let mut config = ImageConfig::empty();
        config.add_scratch_layer();
        config.drop_history();

        config.add_layer(
            10,
            Some(&Digest::of(b"new layer")),
            History {
                created_by: "appended layer".into(),
                ..History::default()
            },
        );

        assert_eq!(config.diff_ids().len(), 2);
        assert_eq!(config.history.len(), 1);
        assert!(config.aligned_with(2));
    }

    #[test]
    fn v1_round_trip_keeps_runtime_config() {
        let v1 = V1Image {
            id: "abc".into(),
            architecture: "amd64".into(),
            os: "linux".into(),
            config: Some(RuntimeConfig {
                cmd: Some(vec!["mysqld".into()]),
                ..RuntimeConfig::default()
            }),
            container_config: Some(RuntimeConfig {
                cmd: Some(vec!["/bin/sh".into(), "-c".into(), "apt install".into()]),
                ..RuntimeConfig::default()
            }),
            ..V1Image::default()
        };

        assert_eq!(v1.created_by(), "/bin/sh -c apt install");

        let config = ImageConfig::from_v1(v1);
        assert_eq!(config.architecture, "amd64");
        assert_eq!(
            config.config.as_ref().unwrap().cmd.as_deref().unwrap(),
            ["mysqld"]
        );
        assert!(config.rootfs.is_none());
    }

    #[test]
    fn config_serializes_wire_names() {
        let mut config = ImageConfig::empty();
        config.add_scratch_layer();
        config.runtime_mut().entrypoint = Some(vec!["/init".into()]);

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["rootfs"]["type"], "layers");
        assert_eq!(value["config"]["Entrypoint"][0], "/init");
        assert!(value["rootfs"]["diff_ids"][0]
            .as_str()
            .unwrap()
            .starts_with("sha256:"));
    }

    #[test]
    fn unmodeled_config_members_round_trip() {
        let raw = r#"{
            "created": "2021-01-01T00:00:00Z",
            "architecture": "arm64",
            "variant": "v8",
            "os": "linux",
            "config": {
                "Entrypoint": ["/init"],
                "Tty": false,
                "ArgsEscaped": true,
                "Shell": ["/bin/sh", "-c"],
                "Healthcheck": {"Test": ["CMD", "curl", "localhost"], "Interval": 30000000000}
            },
            "rootfs": {"type": "layers", "diff_ids": []}
        }"#;

        let mut config: ImageConfig = serde_json::from_str(raw).unwrap();
        config.patch_runtime(r#"{"Entrypoint":null}"#).unwrap();

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["variant"], "v8");
        assert_eq!(value["config"]["ArgsEscaped"], true);
        assert_eq!(value["config"]["Tty"], false);
        assert_eq!(value["config"]["Shell"][1], "-c");
        assert_eq!(value["config"]["Healthcheck"]["Test"][0], "CMD");
        assert!(value["config"].get("Entrypoint").is_none());
    }
}
