// SPDX-License-Identifier: Apache-2.0

//! A reader wrapper that establishes a layer's identity in a single pass:
//! while the gzipped bytes flow through to whatever consumes the reader, a
//! side thread decompresses them, walks the tar stream and digests the
//! uncompressed content.

use std::cmp::min;
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{spawn, JoinHandle};

use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use tar::Archive;

use super::Tally;
use crate::error::Error;
use crate::formats::{Digest, Hasher};

/// Everything learned from one pass over a layer stream.
#[derive(Clone, Debug)]
pub struct Outcome {
    /// Digest of the gzipped bytes as transferred.
    pub blob: Digest,

    /// Digest of the uncompressed tar bytes inside.
    pub content: Digest,

    /// Compressed byte count.
    pub size: u64,

    /// The newest modification time seen in any tar entry header.
    pub modified: Option<DateTime<Utc>>,
}

struct Scan {
    content: Digest,
    modified: Option<DateTime<Utc>>,
}

/// The forwarding side. Reads pull from the wrapped source, feed the blob
/// digest, and mirror every chunk to the scanning thread.
pub struct Tee<R: Read> {
    inner: R,
    hasher: Hasher,
    size: u64,
    tx: Option<SyncSender<Vec<u8>>>,
    scanner: Option<JoinHandle<Result<Scan, Error>>>,
    scan: Option<Result<Scan, Error>>,
}

impl<R: Read> Tee<R> {
    pub fn new(inner: R) -> Self {
        let (tx, rx) = sync_channel(16);
        let scanner = spawn(move || scan(rx));

        Self {
            inner,
            hasher: Hasher::new(),
            size: 0,
            tx: Some(tx),
            scanner: Some(scanner),
            scan: None,
        }
    }

    fn settle(&mut self) {
        self.tx.take();
        if let Some(handle) = self.scanner.take() {
            self.scan = Some(match handle.join() {
                Ok(result) => result,
                Err(..) => Err(Error::Fatal("layer scan thread panicked".into())),
            });
        }
    }

    /// Consumes whatever is left of the stream and reports the digests,
    /// size and modification time, all from the one pass.
    pub fn finish(mut self) -> Result<Outcome, Error> {
        let drained = std::io::copy(&mut self, &mut std::io::sink());
        self.settle();

        match self.scan.take() {
            Some(Ok(found)) => {
                drained?;
                Ok(Outcome {
                    blob: self.hasher.finish(),
                    content: found.content,
                    size: self.size,
                    modified: found.modified,
                })
            }
            Some(Err(err)) => Err(err),
            None => Err(Error::Fatal("layer scan never ran".into())),
        }
    }
}

impl<R: Read> Read for Tee<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.inner.read(buf)?;
        if size == 0 {
            self.settle();
            return Ok(0);
        }

        self.hasher.update(&buf[..size]);
        self.size += size as u64;

        if let Some(tx) = &self.tx {
            if tx.send(buf[..size].to_vec()).is_err() {
                // The scanner bailed out; its error is reported by finish().
                self.tx = None;
                return Err(ErrorKind::InvalidData.into());
            }
        }

        Ok(size)
    }
}

fn scan(rx: Receiver<Vec<u8>>) -> Result<Scan, Error> {
    let malformed = |e: std::io::Error| Error::MalformedLayer(e.to_string());

    let mut chan = ChannelReader { rx, current: None };
    let mut tally = Tally::new(GzDecoder::new(&mut chan));

    let mut modified = None;
    {
        let mut archive = Archive::new(&mut tally);
        for entry in archive.entries().map_err(malformed)? {
            let entry = entry.map_err(malformed)?;
            if let Ok(mtime) = entry.header().mtime() {
                if mtime > 0 && modified.map_or(true, |seen| mtime > seen) {
                    modified = Some(mtime);
                }
            }
        }
    }

    // The content digest covers the whole archive, trailing padding blocks
    // included.
    std::io::copy(&mut tally, &mut std::io::sink()).map_err(malformed)?;
    let (content, _) = tally.finish();

    // Leave no producer blocked on a full channel.
    let _ = std::io::copy(&mut chan, &mut std::io::sink());

    Ok(Scan {
        content,
        modified: modified.and_then(|m| Utc.timestamp_opt(m as i64, 0).single()),
    })
}

/// A reader over the chunk channel; a disconnected sender is end-of-file.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    current: Option<(Vec<u8>, usize)>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut mark = 0;

        while mark < buf.len() {
            let (buffer, mut start) = match self.current.take() {
                Some(x) => x,
                None => match self.rx.recv() {
                    Ok(chunk) => (chunk, 0),
                    Err(..) => break,
                },
            };

            let input = &buffer[start..];
            let output = &mut buf[mark..];
            let len = min(input.len(), output.len());
            output[..len].copy_from_slice(&input[..len]);
            start += len;
            mark += len;

            if start < buffer.len() {
                self.current = Some((buffer, start));
            }
        }

        Ok(mark)
    }
}
