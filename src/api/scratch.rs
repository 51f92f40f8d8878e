// SPDX-License-Identifier: Apache-2.0

use std::io::{Cursor, Read};

use super::BlobSource;
use crate::error::Error;
use crate::formats::{gzipped_empty_layer_digest, Digest, GZIPPED_EMPTY_LAYER};

/// The source behind a scratch base: a store holding exactly one blob, the
/// canonical empty gzipped tar layer.
pub struct Scratch;

impl BlobSource for Scratch {
    fn open(&self, digest: &Digest) -> Result<Box<dyn Read + Send>, Error> {
        if *digest != gzipped_empty_layer_digest() {
            return Err(Error::BlobUnknown(digest.clone()));
        }

        Ok(Box::new(Cursor::new(GZIPPED_EMPTY_LAYER)))
    }
}
