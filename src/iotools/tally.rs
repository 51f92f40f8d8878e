// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Result};

use crate::formats::{Digest, Hasher};

/// A reader that counts the bytes read through it.
#[derive(Debug)]
pub struct Counter<R: Read> {
    inner: R,
    count: u64,
}

impl<R: Read> Counter<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for Counter<R> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.inner.read(buf)?;
        self.count += size as u64;
        Ok(size)
    }
}

/// A reader that digests and counts the bytes read through it.
pub struct Tally<R: Read> {
    inner: R,
    hasher: Hasher,
    count: u64,
}

impl<R: Read> Tally<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            count: 0,
        }
    }

    pub fn finish(self) -> (Digest, u64) {
        (self.hasher.finish(), self.count)
    }
}

impl<R: Read> Read for Tally<R> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.inner.read(buf)?;
        self.hasher.update(&buf[..size]);
        self.count += size as u64;
        Ok(size)
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::{Counter, Tally};
    use crate::formats::Digest;

    #[test]
    fn counter() {
        let mut out = Vec::new();
        let mut counter = Counter::new(&b"0123456789"[..]);
        counter.read_to_end(&mut out).unwrap();
        assert_eq!(counter.count(), 10);
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn tally() {
        let mut out = Vec::new();
        let mut tally = Tally::new(&b"0123456789"[..]);
        tally.read_to_end(&mut out).unwrap();
        let (digest, count) = tally.finish();
        assert_eq!(count, 10);
        assert_eq!(digest, Digest::of(b"0123456789"));
    }
}
