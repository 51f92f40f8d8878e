// SPDX-License-Identifier: Apache-2.0

use std::cmp::max;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::Error;
use crate::formats::Digest;

/// A parsed image name: registry host, repository path, and an optional tag
/// or digest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Reference {
    const DEFAULT_REGISTRY: &'static str = "docker.io";
    const DEFAULT_PREFIX: &'static str = "library";

    const LOCALHOST: &'static str = "localhost";
    const ALIASES: &'static [(&'static str, &'static str)] =
        &[("docker.io", "registry.hub.docker.com")];

    /// The host the v2 API endpoint actually lives on.
    pub fn api_host(&self) -> &str {
        for (from, into) in Self::ALIASES {
            if self.registry == *from {
                return into;
            }
        }

        &self.registry
    }

    /// What to ask the manifest endpoint for: the digest when one is known,
    /// the tag otherwise.
    pub fn manifest_reference(&self) -> Option<String> {
        self.digest
            .as_ref()
            .map(|d| d.to_string())
            .or_else(|| self.tag.clone())
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |what: &str| Error::InvalidInput(format!("{}: {:?}", what, s));

        if s.is_empty() {
            return Err(bad("empty image reference"));
        }

        // Split off a digest
        let (mut name, digest) = match s.find('@') {
            Some(at) => {
                let digest = s[at + 1..]
                    .parse()
                    .map_err(|_| bad("bad digest in image reference"))?;
                (&s[..at], Some(digest))
            }
            None => (s, None),
        };

        // Split off a tag
        let sep = name.rfind('/').unwrap_or_default();
        let lbl = name.rfind(':').unwrap_or_default();
        let mut tag = None;
        if lbl > max(sep, 0) {
            let (lhs, rhs) = name.split_at(lbl);
            name = lhs;
            tag = Some(rhs[1..].to_owned());
        }

        // Extract the registry
        let mut registry = Self::DEFAULT_REGISTRY;
        if let Some((lhs, rhs)) = name.find('/').map(|n| name.split_at(n)) {
            if lhs.contains('.') || lhs.contains(':') || lhs == Self::LOCALHOST {
                name = &rhs[1..];
                registry = lhs;
            }
        }

        if name.is_empty() {
            return Err(bad("image reference has no repository"));
        }

        // Add the default prefix if necessary.
        let repository = match (registry, name.find('/')) {
            (Self::DEFAULT_REGISTRY, None) => format!("{}/{}", Self::DEFAULT_PREFIX, name),
            _ => name.into(),
        };

        Ok(Self {
            registry: registry.into(),
            repository,
            tag,
            digest,
        })
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;

        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }

        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }

        Ok(())
    }
}
