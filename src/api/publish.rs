// SPDX-License-Identifier: Apache-2.0

//! Publication of the finished image: the config blob, the modern manifest,
//! and the fallback to the legacy signed schema for destinations that
//! reject schema version 2.

use log::debug;

use super::{BlobCreate, Reference, Repository};
use crate::error::Error;
use crate::formats::config::ImageConfig;
use crate::formats::docker::v2::Descriptor;
use crate::formats::docker::{v1, v2};
use crate::formats::{media, Digest};

/// Uploads the config, then the manifest, falling back to the legacy
/// schema if the destination refuses the modern one. Returns the digest
/// the destination recorded for the manifest.
pub fn put_image(
    to: &Repository,
    reference: &Reference,
    config: &ImageConfig,
    layers: &[Descriptor],
) -> Result<Digest, Error> {
    if !config.aligned_with(layers.len()) {
        return Err(Error::Fatal(format!(
            "config bookkeeping out of step: {} layers, {} content digests, {} history entries",
            layers.len(),
            config.diff_ids().len(),
            config.history.len(),
        )));
    }

    if let Some(index) = config.diff_ids().iter().position(|d| d.is_empty()) {
        return Err(Error::Fatal(format!(
            "content digest of layer {} was never resolved",
            index
        )));
    }

    if let Some(layer) = layers.iter().find(|l| l.size == 0) {
        return Err(Error::Fatal(format!(
            "size of layer {} was never resolved",
            layer.digest
        )));
    }

    let body = serde_json::to_vec(config)?;
    let config_desc = Descriptor {
        media_type: media::IMAGE_CONFIG.into(),
        size: body.len() as u64,
        digest: Digest::of(&body),
        urls: Vec::new(),
    };

    debug!("uploading config {} ({} bytes)", config_desc.digest, body.len());
    upload_bytes(to, &config_desc.digest, &body)?;

    let manifest = v2::Manifest {
        schema_version: 2,
        media_type: Some(media::MANIFEST_V2.into()),
        config: config_desc,
        layers: layers.to_vec(),
    };

    let tag = reference.tag.as_deref().unwrap_or("latest");
    let body = serde_json::to_vec(&manifest)?;

    match to.put_manifest(tag, media::MANIFEST_V2, &body) {
        Ok(digest) => Ok(digest),
        Err(err) if schema_rejected(&err) => {
            debug!("destination rejected the modern schema ({}), converting", err);
            let legacy = v1::Manifest::from_image(to.path(), tag, config, &manifest.layers)?;
            to.put_manifest(tag, media::MANIFEST_V1_SIGNED, &legacy.sign()?)
        }
        Err(err) => Err(err),
    }
}

fn upload_bytes(to: &Repository, digest: &Digest, bytes: &[u8]) -> Result<(), Error> {
    if to.stat_blob(digest)?.is_some() {
        debug!("blob {} already present, skipping upload", digest);
        return Ok(());
    }

    match to.create_blob(None)? {
        BlobCreate::Mounted(..) => Ok(()),
        BlobCreate::Writer(writer) => {
            let pending = writer.stream(&mut &bytes[..])?;
            let (returned, ..) = pending.commit(digest)?;
            if returned != *digest {
                return Err(Error::CorruptTransfer {
                    expected: digest.clone(),
                    returned,
                });
            }
            Ok(())
        }
    }
}

/// Whether a manifest put failed because the destination does not speak the
/// schema, as opposed to any other failure.
fn schema_rejected(err: &Error) -> bool {
    match err {
        Error::Network {
            status: Some(415), ..
        } => true,
        Error::Network {
            status: Some(400),
            message,
        } => {
            message.contains("MANIFEST_INVALID")
                || message.contains("manifest invalid")
                || message.contains("TAG_INVALID")
                || message.contains("UNSUPPORTED")
        }
        _ => false,
    }
}
