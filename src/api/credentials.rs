// SPDX-License-Identifier: Apache-2.0

//! Lookup of registry credentials in the Docker credential store on disk.
//! Anything missing or unreadable degrades to anonymous access.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
struct Store {
    #[serde(default)]
    auths: HashMap<String, Entry>,
}

#[derive(Debug, Default, Deserialize)]
struct Entry {
    #[serde(default)]
    auth: String,

    #[serde(default)]
    username: String,

    #[serde(default)]
    password: String,
}

impl Entry {
    fn credential(&self) -> Option<Credential> {
        if !self.username.is_empty() {
            return Some(Credential {
                username: self.username.clone(),
                password: self.password.clone(),
            });
        }

        let decoded = STANDARD.decode(&self.auth).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;

        Some(Credential {
            username: username.into(),
            password: password.into(),
        })
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        return Some(PathBuf::from(dir).join("config.json"));
    }

    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".docker").join("config.json"))
}

/// The keys the store may file a registry's entry under. The default
/// registry historically appears under several names.
fn candidates(registry: &str) -> Vec<String> {
    let mut keys = vec![registry.to_owned(), format!("https://{}", registry)];

    if registry == "docker.io" {
        keys.push("index.docker.io".into());
        keys.push("registry.hub.docker.com".into());
        keys.push("https://index.docker.io/v1/".into());
    }

    keys
}

fn lookup_in(store: &Store, registry: &str) -> Option<Credential> {
    candidates(registry)
        .iter()
        .find_map(|key| store.auths.get(key).and_then(Entry::credential))
}

pub fn lookup(registry: &str) -> Option<Credential> {
    let path = config_path()?;
    let data = std::fs::read(&path).ok()?;

    match serde_json::from_slice::<Store>(&data) {
        Ok(store) => lookup_in(&store, registry),
        Err(err) => {
            debug!("ignoring unreadable {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::{lookup_in, Store};

    fn store(json: &str) -> Store {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn base64_auth_entry() {
        // "user:s3cret"
        let store = store(r#"{"auths": {"r.example": {"auth": "dXNlcjpzM2NyZXQ="}}}"#);
        let cred = lookup_in(&store, "r.example").unwrap();
        assert_eq!(cred.username, "user");
        assert_eq!(cred.password, "s3cret");
    }

    #[test]
    fn explicit_fields_win_over_auth() {
        let store = store(
            r#"{"auths": {"r.example": {"auth": "ignored", "username": "u", "password": "p"}}}"#,
        );
        let cred = lookup_in(&store, "r.example").unwrap();
        assert_eq!(cred.username, "u");
        assert_eq!(cred.password, "p");
    }

    #[test]
    fn default_registry_aliases() {
        let store = store(r#"{"auths": {"https://index.docker.io/v1/": {"auth": "dXNlcjpzM2NyZXQ="}}}"#);
        assert!(lookup_in(&store, "docker.io").is_some());
        assert!(lookup_in(&store, "quay.io").is_none());
    }

    #[test]
    fn unknown_or_malformed_entries_are_skipped() {
        let store = store(r#"{"auths": {"r.example": {"auth": "not base64!!"}}}"#);
        assert!(lookup_in(&store, "r.example").is_none());
    }
}
