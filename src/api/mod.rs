// SPDX-License-Identifier: Apache-2.0

mod credentials;
mod image;
mod publish;
mod reference;
mod repository;
mod scratch;

pub use self::image::{resolve_source, PlatformFilter, ResolvedManifest};
pub use self::publish::put_image;
pub use self::reference::Reference;
pub use self::repository::{BlobCreate, BlobWriter, MountFrom, Repository, Scope};
pub use self::scratch::Scratch;

use std::io::Read;

use crate::error::Error;
use crate::formats::Digest;

/// The read side of a blob store. The transfer engine only ever opens
/// source blobs (destination probing happens on the concrete repository),
/// so the contract is a single method and the scratch source needs no
/// stub implementations.
pub trait BlobSource: Send + Sync {
    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, Error>;
}
