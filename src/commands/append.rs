// SPDX-License-Identifier: Apache-2.0

use super::Command;
use crate::api::{
    put_image, resolve_source, BlobCreate, BlobSource, BlobWriter, MountFrom, PlatformFilter,
    Reference, Repository, Scope, Scratch,
};
use crate::error::Error;
use crate::formats::config::{History, ImageConfig};
use crate::formats::docker::v2::Descriptor;
use crate::formats::{gzipped_empty_layer_digest, media, Manifest};
use crate::iotools::{Outcome, Tee};
use crate::queue::{Cancellation, WorkQueue};

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use indicatif::HumanBytes;
use log::debug;
use structopt::StructOpt;

/// Adds layers to a container image and pushes the result to a registry
///
/// Inherited layers are moved from registry to registry without touching
/// the local disk: present blobs are skipped, blobs shared within one
/// registry are mounted across repositories, everything else is streamed.
#[derive(StructOpt, Debug)]
pub struct Append {
    /// The image to use as a base. If empty, a new scratch image is created
    #[structopt(long)]
    from: Option<String>,

    /// The repository tag to upload the appended image to
    #[structopt(long)]
    to: String,

    /// A JSON merge overlay applied to the runtime config of the image
    #[structopt(long = "image")]
    image_patch: Option<String>,

    /// A JSON merge overlay applied to the whole image metadata document
    #[structopt(long = "meta")]
    meta_patch: Option<String>,

    /// Remove the fields recording how the base image was built
    #[structopt(long)]
    drop_history: bool,

    /// The creation date, RFC3339 or milliseconds since the Unix epoch
    #[structopt(long)]
    created_at: Option<String>,

    /// A regular expression selecting manifest list entries by os/arch[/variant]
    #[structopt(long)]
    filter_by_os: Option<String>,

    /// Allow plain-HTTP registry endpoints
    #[structopt(long)]
    insecure: bool,

    /// Upload every inherited layer instead of skipping present ones
    #[structopt(long)]
    force: bool,

    /// Concurrent requests allowed per registry
    #[structopt(long, default_value = "3")]
    max_per_registry: usize,

    /// Compute and print the resulting config without writing anything
    #[structopt(long)]
    dry_run: bool,

    /// Gzipped tar archives appended as new layers, in order
    #[structopt(parse(from_os_str))]
    layers: Vec<PathBuf>,
}

impl Command for Append {
    fn execute(self) -> anyhow::Result<()> {
        check_layer_paths(&self.layers)?;
        let created_at = self.created_at.as_deref().map(parse_created_at).transpose()?;
        let filter = PlatformFilter::new(self.filter_by_os.as_deref())?;

        let to: Reference = self.to.parse()?;
        if to.digest.is_some() {
            return Err(Error::InvalidInput("--to may not point to an image by digest".into()).into());
        }

        let from = match self.from.as_deref().filter(|s| !s.is_empty()) {
            None => None,
            Some(s) => {
                let reference: Reference = s.parse()?;
                let manifest = reference.manifest_reference().ok_or_else(|| {
                    Error::InvalidInput("--from must point to an image tag or digest".into())
                })?;
                Some((reference, manifest))
            }
        };

        let to_repo = Repository::connect(&to, Scope::Push, self.insecure)?;

        let (mut base, mut layers, from_repo) = match &from {
            Some((reference, manifest)) => {
                let repo = Repository::connect(reference, Scope::Pull, self.insecure)?;
                let resolved = resolve_source(&repo, manifest, &filter)?;
                let (base, layers) = base_of(&repo, reference, resolved.manifest)?;
                debug!("consuming manifest {} from {}", resolved.digest, reference);
                (base, layers, Some(repo))
            }
            None => {
                let mut base = ImageConfig::empty();
                let layer = base.add_scratch_layer();
                (base, vec![layer], None)
            }
        };

        // the runtime sub-config must never be null in the output
        base.runtime_mut();

        base.created = Some(created_at.unwrap_or_else(Utc::now));
        if self.drop_history {
            base.drop_history();
        }
        if let Some(patch) = &self.image_patch {
            base.patch_runtime(patch)?;
        }
        if let Some(patch) = &self.meta_patch {
            base.patch(patch)?;
        }

        debug!("assembled config:\n{}", serde_json::to_string_pretty(&base)?);

        // new layers first, sequentially: their order defines the history
        let inherited = layers.len();
        for path in &self.layers {
            let upload = (!self.dry_run).then_some(&to_repo);
            let outcome = append_layer(upload, path)?;

            base.add_layer(
                outcome.size,
                Some(&outcome.content),
                History {
                    created: base.created,
                    created_by: "appended layer".into(),
                    ..History::default()
                },
            );
            layers.push(Descriptor {
                media_type: media::LAYER_GZIP.into(),
                size: outcome.size,
                digest: outcome.blob,
                urls: Vec::new(),
            });

            // the tar modtime replaces only the implicit timestamp; an
            // explicit --created-at stands
            if created_at.is_none() {
                if let Some(modified) = outcome.modified {
                    base.created = Some(modified);
                }
            }
        }

        if self.dry_run {
            println!("{}", serde_json::to_string_pretty(&base)?);
            return Ok(());
        }

        // inherited layers in parallel; each task owns its index
        let source: &dyn BlobSource = match &from_repo {
            Some(repo) => repo,
            None => &Scratch,
        };
        let mount_source = from
            .as_ref()
            .filter(|(reference, ..)| reference.registry == to.registry)
            .map(|(reference, ..)| reference.repository.clone());

        let state = Mutex::new(Bookkeeping { base, layers });
        let cancel = Cancellation::new();
        let force = self.force;

        WorkQueue::new(self.max_per_registry).batch(&cancel, |batch| {
            for index in 0..inherited {
                let state = &state;
                let to_repo = &to_repo;
                let mount = mount_source.as_deref();
                batch.submit(Box::new(move |cancel| {
                    transfer_layer(index, state, source, to_repo, mount, force, cancel)
                }));
            }
        })?;

        let Bookkeeping { base, layers } = state
            .into_inner()
            .map_err(|_| Error::Fatal("transfer bookkeeping poisoned".into()))?;

        let digest = put_image(&to_repo, &to, &base, &layers)?;
        println!("Pushed image {} to {}", digest, to);
        Ok(())
    }
}

fn check_layer_paths(paths: &[PathBuf]) -> Result<(), Error> {
    for path in paths {
        let meta = std::fs::metadata(path)
            .map_err(|e| Error::InvalidInput(format!("invalid argument {:?}: {}", path, e)))?;
        if meta.is_dir() {
            return Err(Error::InvalidInput(format!(
                "invalid argument: {:?} is a directory",
                path
            )));
        }
    }

    Ok(())
}

fn parse_created_at(s: &str) -> Result<DateTime<Utc>, Error> {
    if let Ok(millis) = s.parse::<i64>() {
        return Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
            Error::InvalidInput(format!("--created-at is out of range: {}", s))
        });
    }

    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            Error::InvalidInput(
                "--created-at must be an RFC3339 date or milliseconds since the Unix epoch".into(),
            )
        })
}

/// Materializes the base config and layer list out of the selected source
/// manifest.
fn base_of(
    repo: &Repository,
    reference: &Reference,
    manifest: Manifest,
) -> Result<(ImageConfig, Vec<Descriptor>), Error> {
    match manifest {
        Manifest::Modern(manifest) => {
            if manifest.config.media_type != media::IMAGE_CONFIG {
                return Err(Error::UnsupportedManifest(format!(
                    "cannot append layers to an image with config type {}",
                    manifest.config.media_type
                )));
            }

            let raw = repo.fetch_blob(&manifest.config.digest).map_err(|e| match e {
                Error::BlobUnknown(..) => Error::UnsupportedManifest(format!(
                    "config blob of {} is missing",
                    reference
                )),
                e => e,
            })?;
            debug!("raw image config:\n{}", String::from_utf8_lossy(&raw));

            let mut base: ImageConfig = serde_json::from_slice(&raw).map_err(|e| {
                Error::UnsupportedManifest(format!("config of {} could not be parsed: {}", reference, e))
            })?;

            base.size = manifest.layers.iter().map(|l| l.size).sum();
            Ok((base, manifest.layers))
        }

        Manifest::Legacy(manifest) => {
            if manifest.history.len() != manifest.fs_layers.len() {
                return Err(Error::UnsupportedManifest(format!(
                    "legacy manifest of {} has {} layers but {} history records",
                    reference,
                    manifest.fs_layers.len(),
                    manifest.history.len()
                )));
            }

            let records = manifest.records()?;
            let newest = records.first().ok_or_else(|| {
                Error::UnsupportedManifest(format!("legacy manifest of {} has no history", reference))
            })?;
            let mut base = ImageConfig::from_v1(newest.clone());

            // legacy blob sums are newest first, and carry no sizes; the
            // sizes are reconstructed from the destination later
            let mut layers = Vec::with_capacity(manifest.fs_layers.len());
            for (fs, record) in manifest.fs_layers.iter().zip(records.iter()).rev() {
                base.add_layer(
                    0,
                    None,
                    History {
                        created: record.created,
                        author: record.author.clone(),
                        created_by: record.created_by(),
                        comment: record.comment.clone(),
                        ..History::default()
                    },
                );
                layers.push(Descriptor {
                    media_type: media::LAYER_GZIP.into(),
                    size: 0,
                    digest: fs.blob_sum.clone(),
                    urls: Vec::new(),
                });
            }

            Ok((base, layers))
        }

        Manifest::List(..) => Err(Error::UnsupportedManifest(
            "manifest list selection did not yield a concrete image".into(),
        )),
    }
}

/// Digests one local layer file and, unless `to` is absent (dry run),
/// uploads it along the way.
fn append_layer(to: Option<&Repository>, path: &Path) -> Result<Outcome, Error> {
    let file = File::open(path)
        .map_err(|e| Error::InvalidInput(format!("invalid argument {:?}: {}", path, e)))?;
    let mut tee = Tee::new(file);

    let to = match to {
        Some(to) => to,
        None => return tee.finish(),
    };

    print!("Uploading ... ");
    let _ = std::io::stdout().flush();
    let start = Instant::now();

    let writer = match to.create_blob(None)? {
        BlobCreate::Writer(writer) => writer,
        BlobCreate::Mounted(..) => {
            return Err(Error::Fatal("registry answered an upload with a mount".into()))
        }
    };

    let pending = match writer.stream(&mut tee) {
        Ok(pending) => pending,
        Err(err) => {
            println!("failed");
            return Err(prefer_malformed(tee, err));
        }
    };

    let outcome = tee.finish()?;
    let (returned, ..) = pending.commit(&outcome.blob)?;
    if returned != outcome.blob {
        return Err(Error::CorruptTransfer {
            expected: outcome.blob,
            returned,
        });
    }

    let rate = outcome.size as f64 / start.elapsed().as_secs_f64().max(1e-9);
    println!("{}/s", HumanBytes(rate as u64));
    Ok(outcome)
}

/// An upload abort may stem from the tee noticing a malformed archive; that
/// diagnosis beats the transport's view of the broken pipe.
fn prefer_malformed<R: Read>(tee: Tee<R>, err: Error) -> Error {
    match tee.finish() {
        Err(inner @ Error::MalformedLayer(..)) => inner,
        _ => err,
    }
}

/// The state the parallel phase updates: each task only ever touches its
/// own layer index.
struct Bookkeeping {
    base: ImageConfig,
    layers: Vec<Descriptor>,
}

fn lock(state: &Mutex<Bookkeeping>) -> Result<MutexGuard<'_, Bookkeeping>, Error> {
    state
        .lock()
        .map_err(|_| Error::Fatal("transfer bookkeeping poisoned".into()))
}

fn transfer_layer(
    index: usize,
    state: &Mutex<Bookkeeping>,
    source: &dyn BlobSource,
    to: &Repository,
    mount_from: Option<&str>,
    force: bool,
    cancel: &Cancellation,
) -> Result<(), Error> {
    let (layer, mut missing) = {
        let guard = lock(state)?;
        let missing = guard
            .base
            .diff_ids()
            .get(index)
            .map_or(true, |d| d.is_empty());
        (guard.layers[index].clone(), missing)
    };

    cancel.check()?;

    if !force {
        if let Some(found) = to.stat_blob(&layer.digest)? {
            debug!("layer {} already exists in the destination", layer.digest);
            if layer.size == 0 {
                lock(state)?.layers[index].size = found.size;
            }

            if missing {
                // only the bytes themselves can tell us the content digest
                debug!("streaming layer {} for its content digest", layer.digest);
                let tee = Tee::new(cancel.guard(source.open(&layer.digest)?));
                let outcome = tee.finish()?;
                lock(state)?.base.set_diff_id(index, &outcome.content);
                missing = false;
            }

            // a known registry bug reports the empty layer as present yet
            // rejects manifests referencing it unless it is pushed again
            if layer.digest != gzipped_empty_layer_digest() {
                return Ok(());
            }
        }
    }

    cancel.check()?;

    // A mount moves nothing through us, so it cannot resolve a missing
    // content digest; stream instead in that case.
    if !missing {
        if let Some(repository) = mount_from {
            let mount = MountFrom {
                repository,
                digest: &layer.digest,
            };
            match to.create_blob(Some(mount))? {
                BlobCreate::Mounted(..) => {
                    debug!("mounted layer {} from {}", layer.digest, repository);
                    if layer.size == 0 {
                        if let Some(found) = to.stat_blob(&layer.digest)? {
                            lock(state)?.layers[index].size = found.size;
                        }
                    }
                    return Ok(());
                }
                BlobCreate::Writer(writer) => {
                    debug!("mount of {} declined, streaming instead", layer.digest);
                    return stream_layer(index, state, source, writer, &layer, missing, cancel);
                }
            }
        }
    }

    let writer = match to.create_blob(None)? {
        BlobCreate::Writer(writer) => writer,
        BlobCreate::Mounted(..) => {
            return Err(Error::Fatal("registry answered an upload with a mount".into()))
        }
    };

    stream_layer(index, state, source, writer, &layer, missing, cancel)
}

fn stream_layer(
    index: usize,
    state: &Mutex<Bookkeeping>,
    source: &dyn BlobSource,
    writer: BlobWriter<'_>,
    layer: &Descriptor,
    missing: bool,
    cancel: &Cancellation,
) -> Result<(), Error> {
    let reader = cancel.guard(source.open(&layer.digest)?);

    if layer.size > 0 {
        println!("Uploading {} ...", HumanBytes(layer.size));
    } else {
        println!("Uploading ...");
    }

    let (returned, size) = if missing {
        let mut tee = Tee::new(reader);
        let pending = match writer.stream(&mut tee) {
            Ok(pending) => pending,
            Err(err) => return Err(prefer_malformed(tee, err)),
        };
        let outcome = tee.finish()?;
        let committed = pending.commit(&layer.digest)?;
        lock(state)?.base.set_diff_id(index, &outcome.content);
        committed
    } else {
        let mut reader = reader;
        writer.stream(&mut reader)?.commit(&layer.digest)?
    };

    if returned != layer.digest {
        return Err(Error::CorruptTransfer {
            expected: layer.digest.clone(),
            returned,
        });
    }

    if layer.size == 0 {
        lock(state)?.layers[index].size = size;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::{append_layer, check_layer_paths, parse_created_at};
    use crate::error::Error;
    use crate::formats::Digest;

    #[test]
    fn created_at_accepts_both_spellings() {
        let t = parse_created_at("2021-06-01T12:00:00Z").unwrap();
        assert_eq!(t.timestamp(), 1_622_548_800);

        let t = parse_created_at("1622548800000").unwrap();
        assert_eq!(t.timestamp(), 1_622_548_800);

        assert!(matches!(
            parse_created_at("yesterday"),
            Err(Error::InvalidInput(..))
        ));
    }

    #[test]
    fn layer_path_validation() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("layer.tar.gz");
        std::fs::write(&file, b"x").unwrap();

        assert!(check_layer_paths(&[file]).is_ok());
        assert!(matches!(
            check_layer_paths(&[dir.path().to_path_buf()]),
            Err(Error::InvalidInput(..))
        ));
        assert!(matches!(
            check_layer_paths(&[dir.path().join("missing")]),
            Err(Error::InvalidInput(..))
        ));
    }

    #[test]
    fn dry_run_digests_a_local_layer() {
        let mut archive = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("app/bin").unwrap();
        header.set_size(3);
        header.set_mode(0o755);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        archive.append(&header, &b"run"[..]).unwrap();
        let tar = archive.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        let gzipped = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.tar.gz");
        std::fs::write(&path, &gzipped).unwrap();

        let outcome = append_layer(None, &path).unwrap();
        assert_eq!(outcome.blob, Digest::of(&gzipped));
        assert_eq!(outcome.content, Digest::of(&tar));
        assert_eq!(outcome.size, gzipped.len() as u64);
        assert_eq!(outcome.modified.unwrap().timestamp(), 1_600_000_000);
    }

    #[test]
    fn garbage_local_layer_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layer.tar.gz");
        std::fs::write(&path, b"definitely not gzip").unwrap();

        assert!(matches!(
            append_layer(None, &path),
            Err(Error::MalformedLayer(..))
        ));
    }
}
