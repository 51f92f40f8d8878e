// SPDX-License-Identifier: Apache-2.0

//! Resolving what a source reference actually points at: a concrete
//! manifest, possibly selected out of a multi-architecture manifest list.

use log::debug;
use regex::Regex;

use super::Repository;
use crate::error::Error;
use crate::formats::config::host_platform;
use crate::formats::docker::v2::{Item, ManifestList};
use crate::formats::{Digest, Manifest};

/// The platform filter applied to manifest lists. Without an explicit
/// pattern it matches the host platform literally, with one escape hatch: a
/// list with a single entry is taken as-is rather than rejected by the
/// implicit default.
pub struct PlatformFilter {
    regex: Regex,
    implicit: bool,
}

impl PlatformFilter {
    pub fn new(pattern: Option<&str>) -> Result<Self, Error> {
        match pattern {
            Some(pattern) => Ok(Self {
                regex: Regex::new(pattern).map_err(|e| {
                    Error::InvalidInput(format!("bad platform filter pattern: {}", e))
                })?,
                implicit: false,
            }),
            None => {
                let (os, architecture) = host_platform();
                let literal = regex::escape(&format!("{}/{}", os, architecture));
                Ok(Self {
                    // an escaped literal always compiles
                    regex: Regex::new(&literal).unwrap(),
                    implicit: true,
                })
            }
        }
    }

    fn matches(&self, item: &Item, sole: bool) -> bool {
        if self.implicit && sole {
            return true;
        }

        self.regex.is_match(&item.platform.label())
    }

    /// Picks the entry to consume and reports everything that passed. Ties
    /// break deterministically on list order.
    pub fn select<'a>(&self, list: &'a ManifestList) -> Result<Vec<&'a Item>, Error> {
        let sole = list.manifests.len() == 1;
        let matched: Vec<&Item> = list
            .manifests
            .iter()
            .filter(|item| self.matches(item, sole))
            .collect();

        if matched.is_empty() {
            return Err(Error::NoMatchingImage);
        }

        Ok(matched)
    }
}

/// A concrete manifest to consume, and the digest it lives under.
pub struct ResolvedManifest {
    pub manifest: Manifest,
    pub digest: Digest,
}

/// Fetches the manifest behind `reference` and, when it is a list, follows
/// the filter's selection down to the concrete image manifest.
pub fn resolve_source(
    repo: &Repository,
    reference: &str,
    filter: &PlatformFilter,
) -> Result<ResolvedManifest, Error> {
    let fetched = repo.manifest(reference)?;

    let list = match fetched.manifest {
        Manifest::List(list) => list,
        manifest => {
            return Ok(ResolvedManifest {
                manifest,
                digest: fetched.digest,
            })
        }
    };

    let matched = filter.select(&list)?;
    let winner = matched[0];
    debug!(
        "selected manifest {} ({}) out of {} matching entries in list {}",
        winner.digest,
        winner.platform.label(),
        matched.len(),
        fetched.digest,
    );

    let child = repo.manifest(&winner.digest.to_string())?;
    match child.manifest {
        Manifest::List(..) => Err(Error::UnsupportedManifest(format!(
            "manifest list {} nests another list",
            fetched.digest
        ))),
        manifest => Ok(ResolvedManifest {
            manifest,
            digest: child.digest,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::PlatformFilter;
    use crate::error::Error;
    use crate::formats::docker::v2::{Item, ManifestList, Platform};
    use crate::formats::Digest;

    fn item(os: &str, arch: &str, variant: Option<&str>) -> Item {
        Item {
            media_type: None,
            size: 7,
            digest: Digest::of(format!("{}/{}/{:?}", os, arch, variant).as_bytes()),
            platform: Platform {
                architecture: arch.into(),
                os: os.into(),
                os_version: None,
                os_features: Vec::new(),
                variant: variant.map(Into::into),
                features: Vec::new(),
            },
        }
    }

    fn list(items: Vec<Item>) -> ManifestList {
        ManifestList {
            schema_version: 2,
            media_type: None,
            manifests: items,
        }
    }

    #[test]
    fn explicit_pattern_filters_and_orders() {
        let filter = PlatformFilter::new(Some("linux/.*")).unwrap();
        let list = list(vec![
            item("linux", "amd64", None),
            item("linux", "arm64", None),
            item("windows", "amd64", None),
        ]);

        let matched = filter.select(&list).unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].platform.architecture, "amd64");
    }

    #[test]
    fn variant_takes_part_in_the_label() {
        let filter = PlatformFilter::new(Some("linux/arm64/v8")).unwrap();
        let list = list(vec![
            item("linux", "arm64", Some("v8")),
            item("linux", "arm64", Some("v7")),
        ]);

        let matched = filter.select(&list).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].platform.variant.as_deref(), Some("v8"));
    }

    #[test]
    fn no_match_is_an_error() {
        let filter = PlatformFilter::new(Some("plan9/.*")).unwrap();
        let list = list(vec![item("linux", "amd64", None)]);
        assert!(matches!(filter.select(&list), Err(Error::NoMatchingImage)));
    }

    #[test]
    fn implicit_default_accepts_a_sole_mismatching_entry() {
        let filter = PlatformFilter::new(None).unwrap();
        let sole = list(vec![item("plan9", "mips", None)]);
        assert_eq!(filter.select(&sole).unwrap().len(), 1);
    }

    #[test]
    fn explicit_pattern_rejects_a_sole_mismatching_entry() {
        let filter = PlatformFilter::new(Some("linux/.*")).unwrap();
        let sole = list(vec![item("plan9", "mips", None)]);
        assert!(matches!(filter.select(&sole), Err(Error::NoMatchingImage)));
    }

    #[test]
    fn implicit_default_still_filters_multiple_entries() {
        use crate::formats::config::host_platform;

        let (os, arch) = host_platform();
        let filter = PlatformFilter::new(None).unwrap();
        let list = list(vec![item("plan9", "mips", None), item(os, arch, None)]);

        let matched = filter.select(&list).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].platform.os, os);
    }

    #[test]
    fn bad_pattern_is_invalid_input() {
        assert!(matches!(
            PlatformFilter::new(Some("(")),
            Err(Error::InvalidInput(..))
        ));
    }
}
