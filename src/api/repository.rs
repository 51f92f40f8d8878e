// SPDX-License-Identifier: Apache-2.0

//! A minimal registry v2 client over blocking HTTP: token authentication,
//! manifest get/put, blob stat/open, and the create/mount/stream/commit
//! upload protocol. One instance serves one repository and is safe to use
//! from several transfer workers at once.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;
use regex::Regex;
use serde::Deserialize;

use super::credentials::{self, Credential};
use super::{BlobSource, Reference};
use crate::error::Error;
use crate::formats::docker::v2::Descriptor;
use crate::formats::{media, Digest, Manifest};
use crate::iotools::Counter;

#[derive(Copy, Clone, Debug)]
pub enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn actions(self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::Push => "pull,push",
        }
    }
}

#[derive(Clone, Debug)]
struct Challenge {
    realm: String,
    service: Option<String>,
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    const RE: &str = "([a-z]+)=\"([^\"]+)\"";

    let re = Regex::new(RE).unwrap();
    let mut map = HashMap::new();
    for caps in re.captures_iter(header) {
        map.insert(caps[1].to_owned(), caps[2].to_owned());
    }

    Some(Challenge {
        realm: map.remove("realm")?,
        service: map.remove("service"),
    })
}

/// Resolves a possibly relative `Location` header against the API base.
fn absolute_location(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.into()
    } else if location.starts_with('/') {
        format!("{}{}", base, location)
    } else {
        format!("{}/{}", base, location)
    }
}

fn with_query(url: &str, key: &str, value: &str) -> String {
    let join = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}={}", url, join, key, value)
}

/// A manifest as fetched, along with the digest the registry knows it by.
pub struct FetchedManifest {
    pub manifest: Manifest,
    pub digest: Digest,
}

/// A cross-repository mount request: the layer already lives in another
/// repository on the same registry.
pub struct MountFrom<'a> {
    pub repository: &'a str,
    pub digest: &'a Digest,
}

pub struct Repository {
    base: String,
    path: String,
    agent: ureq::Agent,
    scope: Scope,
    credential: Option<Credential>,
    token: Mutex<Option<String>>,
    challenge: Mutex<Option<Challenge>>,
}

impl Repository {
    /// Opens a repository handle, probing the API endpoint and obtaining a
    /// bearer token when the registry demands one. With `insecure`, a
    /// registry unreachable over TLS is retried over plain HTTP.
    pub fn connect(reference: &Reference, scope: Scope, insecure: bool) -> Result<Self, Error> {
        let mut repo = Self {
            base: String::new(),
            path: reference.repository.clone(),
            agent: ureq::agent(),
            scope,
            credential: credentials::lookup(&reference.registry),
            token: Mutex::new(None),
            challenge: Mutex::new(None),
        };

        let schemes: &[&str] = if insecure { &["https", "http"] } else { &["https"] };

        let mut last = None;
        for scheme in schemes {
            repo.base = format!("{}://{}", scheme, reference.api_host());
            match repo.ping() {
                Ok(()) => return Ok(repo),
                Err(err) => {
                    debug!("no {} endpoint at {}: {}", scheme, repo.base, err);
                    last = Some(err);
                }
            }
        }

        Err(last.unwrap_or_else(|| Error::network("no usable registry endpoint")))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn ping(&self) -> Result<(), Error> {
        let url = format!("{}/v2/", self.base);
        match self.agent.get(&url).call() {
            Ok(..) => Ok(()),
            Err(ureq::Error::Status(401, rep)) => {
                let challenge = rep
                    .header("Www-Authenticate")
                    .and_then(parse_challenge)
                    .ok_or_else(|| {
                        Error::network("registry requires authentication but sent no challenge")
                    })?;

                self.refresh_token(&challenge)?;
                if let Ok(mut slot) = self.challenge.lock() {
                    *slot = Some(challenge);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn refresh_token(&self, challenge: &Challenge) -> Result<(), Error> {
        #[derive(Deserialize)]
        struct Auth {
            #[serde(default)]
            token: String,

            #[serde(default)]
            access_token: String,
        }

        let scope = format!("repository:{}:{}", self.path, self.scope.actions());
        let mut req = self.agent.get(&challenge.realm).query("scope", &scope);
        if let Some(service) = &challenge.service {
            req = req.query("service", service);
        }
        if let Some(cred) = &self.credential {
            let basic = STANDARD.encode(format!("{}:{}", cred.username, cred.password));
            req = req.set("Authorization", &format!("Basic {}", basic));
        }

        let auth: Auth = req.call()?.into_json()?;
        let token = match auth.token.is_empty() {
            false => auth.token,
            true => auth.access_token,
        };
        if token.is_empty() {
            return Err(Error::network("token service returned no token"));
        }

        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }

        Ok(())
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut req = self.agent.request(method, url);
        if let Ok(token) = self.token.lock() {
            if let Some(token) = token.as_deref() {
                req = req.set("Authorization", &format!("Bearer {}", token));
            }
        }
        req
    }

    /// Issues a replayable request, refreshing an expired token once.
    fn call<F>(&self, send: F) -> Result<ureq::Response, Error>
    where
        F: Fn(&Self) -> Result<ureq::Response, ureq::Error>,
    {
        match send(self) {
            Ok(rep) => Ok(rep),
            Err(ureq::Error::Status(401, rep)) => {
                let challenge = self
                    .challenge
                    .lock()
                    .ok()
                    .and_then(|c| c.clone())
                    .or_else(|| rep.header("Www-Authenticate").and_then(parse_challenge));

                match challenge {
                    Some(challenge) => {
                        self.refresh_token(&challenge)?;
                        send(self).map_err(Into::into)
                    }
                    None => Err(ureq::Error::Status(401, rep).into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Fetches a manifest by tag or digest, preferring the manifest-list
    /// and modern media types.
    pub fn manifest(&self, reference: &str) -> Result<FetchedManifest, Error> {
        let accept = [
            media::MANIFEST_LIST_V2,
            media::MANIFEST_V2,
            media::MANIFEST_V1_SIGNED,
        ]
        .join(", ");

        let url = format!("{}/v2/{}/manifests/{}", self.base, self.path, reference);
        let rep = self.call(|r| r.request("GET", &url).set("Accept", &accept).call())?;

        let header = rep
            .header("Docker-Content-Digest")
            .and_then(|h| h.parse::<Digest>().ok());

        let mut body = Vec::new();
        rep.into_reader().read_to_end(&mut body)?;

        let digest = header.unwrap_or_else(|| Digest::of(&body));
        if let Ok(expected) = reference.parse::<Digest>() {
            if expected != digest {
                return Err(Error::CorruptTransfer {
                    expected,
                    returned: digest,
                });
            }
        }

        let manifest = serde_json::from_slice(&body)
            .map_err(|e| Error::UnsupportedManifest(format!("{}: {}", url, e)))?;

        Ok(FetchedManifest { manifest, digest })
    }

    /// Puts a manifest under a tag, returning the digest the destination
    /// recorded for it.
    pub fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<Digest, Error> {
        let url = format!("{}/v2/{}/manifests/{}", self.base, self.path, reference);
        let rep = self.call(|r| {
            r.request("PUT", &url)
                .set("Content-Type", media_type)
                .send_bytes(body)
        })?;

        Ok(rep
            .header("Docker-Content-Digest")
            .and_then(|h| h.parse().ok())
            .unwrap_or_else(|| Digest::of(body)))
    }

    /// Whether the destination already holds a blob; `None` when it does
    /// not.
    pub fn stat_blob(&self, digest: &Digest) -> Result<Option<Descriptor>, Error> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.path, digest);
        match self.call(|r| r.request("HEAD", &url).call()) {
            Ok(rep) => {
                let size = rep
                    .header("Content-Length")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);

                Ok(Some(Descriptor {
                    media_type: media::LAYER_GZIP.into(),
                    size,
                    digest: digest.clone(),
                    urls: Vec::new(),
                }))
            }
            Err(Error::Network {
                status: Some(404), ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn open_blob(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, Error> {
        let url = format!("{}/v2/{}/blobs/{}", self.base, self.path, digest);
        match self.call(|r| r.request("GET", &url).call()) {
            Ok(rep) => Ok(Box::new(rep.into_reader())),
            Err(Error::Network {
                status: Some(404), ..
            }) => Err(Error::BlobUnknown(digest.clone())),
            Err(err) => Err(err),
        }
    }

    /// Reads a small blob, the config, wholesale and verifies its digest.
    pub fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        self.open_blob(digest)?.read_to_end(&mut body)?;

        let returned = Digest::of(&body);
        if returned != *digest {
            return Err(Error::CorruptTransfer {
                expected: digest.clone(),
                returned,
            });
        }

        Ok(body)
    }

    /// Starts a blob upload. With a mount request the registry may instead
    /// link the existing blob and answer that it is already there.
    pub fn create_blob(&self, mount: Option<MountFrom>) -> Result<BlobCreate, Error> {
        let mut url = format!("{}/v2/{}/blobs/uploads/", self.base, self.path);
        if let Some(mount) = &mount {
            url = with_query(&url, "mount", &mount.digest.to_string());
            url = with_query(&url, "from", mount.repository);
        }

        let rep = self.call(|r| r.request("POST", &url).send_bytes(&[]))?;
        match rep.status() {
            201 => Ok(BlobCreate::Mounted(
                rep.header("Docker-Content-Digest")
                    .and_then(|h| h.parse().ok()),
            )),
            202 => {
                let location = rep.header("Location").ok_or_else(|| {
                    Error::network("registry opened an upload session without a location")
                })?;

                Ok(BlobCreate::Writer(BlobWriter {
                    repo: self,
                    location: absolute_location(&self.base, location),
                }))
            }
            status => Err(Error::Network {
                status: Some(status),
                message: format!("{}: unexpected upload status {}", url, status),
            }),
        }
    }
}

impl BlobSource for Repository {
    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, Error> {
        self.open_blob(digest)
    }
}

pub enum BlobCreate<'r> {
    /// The registry satisfied a mount request; no bytes need to move.
    Mounted(Option<Digest>),
    Writer(BlobWriter<'r>),
}

/// An open upload session.
pub struct BlobWriter<'r> {
    repo: &'r Repository,
    location: String,
}

impl<'r> BlobWriter<'r> {
    /// Streams the blob content into the session. The body is consumed
    /// once; an expired token aborts rather than replays.
    pub fn stream(self, body: &mut dyn Read) -> Result<PendingBlob<'r>, Error> {
        let mut counted = Counter::new(body);
        let rep = self
            .repo
            .request("PATCH", &self.location)
            .set("Content-Type", "application/octet-stream")
            .send(&mut counted)?;

        let location = rep
            .header("Location")
            .map(|l| absolute_location(&self.repo.base, l))
            .unwrap_or(self.location);

        Ok(PendingBlob {
            repo: self.repo,
            location,
            size: counted.count(),
        })
    }
}

/// A fully streamed upload awaiting its commit.
pub struct PendingBlob<'r> {
    repo: &'r Repository,
    location: String,
    size: u64,
}

impl PendingBlob<'_> {
    /// Commits the upload under its digest and reports what the registry
    /// recorded: the committed digest and the byte count streamed.
    pub fn commit(self, expect: &Digest) -> Result<(Digest, u64), Error> {
        let url = with_query(&self.location, "digest", &expect.to_string());
        let rep = self.repo.call(|r| r.request("PUT", &url).send_bytes(&[]))?;

        let returned = rep
            .header("Docker-Content-Digest")
            .and_then(|h| h.parse().ok())
            .unwrap_or_else(|| expect.clone());

        Ok((returned, self.size))
    }
}
