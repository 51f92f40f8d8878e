// SPDX-License-Identifier: Apache-2.0

pub mod config;
mod digest;
pub mod docker;

pub use self::digest::{Digest, Hasher};

use serde::Deserialize;

/// Media types of the registry v2 protocol.
pub mod media {
    pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
    pub const IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

/// A gzip wrapping of an empty tar archive (1024 zero bytes).
pub const GZIPPED_EMPTY_LAYER: &[u8] = &[
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

/// The blob digest of [`GZIPPED_EMPTY_LAYER`].
pub const GZIPPED_EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// The content digest of the empty tar archive inside it.
pub const EMPTY_LAYER_DIFF_ID: &str =
    "sha256:5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef";

pub fn gzipped_empty_layer_digest() -> Digest {
    GZIPPED_EMPTY_LAYER_DIGEST.parse().unwrap()
}

pub fn empty_layer_diff_id() -> Digest {
    EMPTY_LAYER_DIFF_ID.parse().unwrap()
}

/// A manifest as fetched from a source repository. The three shapes carry
/// disjoint required members, so the payload decides which arm applies.
/// `Modern` also covers OCI image manifests, which share the member layout.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum Manifest {
    List(docker::v2::ManifestList),
    Modern(docker::v2::Manifest),
    Legacy(docker::v1::Manifest),
}
