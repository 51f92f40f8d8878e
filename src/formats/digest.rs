// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::str::FromStr;

use ring::digest::{Context, SHA256, SHA256_OUTPUT_LEN};
use serde::{Deserialize, Serialize};

#[inline(always)]
fn dehex(byte: u8) -> Result<u8, Invalid> {
    Ok(match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => return Err(Invalid::Encoding),
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    fn name(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn output_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub enum Invalid {
    Algorithm,
    Encoding,
    Length,
}

impl std::error::Error for Invalid {}
impl std::fmt::Display for Invalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Invalid::Algorithm => f.write_str("invalid digest algorithm"),
            Invalid::Encoding => f.write_str("invalid digest encoding"),
            Invalid::Length => f.write_str("invalid digest length"),
        }
    }
}

/// A parsed cryptographic digest in the form `ALGORITHM:HEX_BYTES`.
///
/// A bare 64-character hex string is accepted as sha256 for compatibility
/// with older image references.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: Algorithm,
    bytes: Vec<u8>,
}

impl Digest {
    /// The canonical (sha256) digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn algorithm(&self) -> &str {
        self.algorithm.name()
    }

    /// The hex half alone, without the algorithm prefix.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.bytes.len() * 2);
        for byte in self.bytes.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl FromStr for Digest {
    type Err = Invalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = if let Some((lhs, rhs)) = s.find(':').map(|x| s.split_at(x)) {
            let algorithm = if lhs.eq_ignore_ascii_case("sha256") {
                Algorithm::Sha256
            } else if lhs.eq_ignore_ascii_case("sha384") {
                Algorithm::Sha384
            } else if lhs.eq_ignore_ascii_case("sha512") {
                Algorithm::Sha512
            } else {
                return Err(Invalid::Algorithm);
            };

            (algorithm, &rhs[1..])
        } else if s.len() == SHA256_OUTPUT_LEN * 2 {
            (Algorithm::Sha256, s)
        } else {
            return Err(Invalid::Algorithm);
        };

        if hex.len() != algorithm.output_len() * 2 {
            return Err(Invalid::Length);
        }

        let mut bytes = vec![0; algorithm.output_len()];
        let mut chars = hex.as_bytes().iter();
        for b in bytes.iter_mut() {
            let l = *chars.next().ok_or(Invalid::Length)?;
            let r = *chars.next().ok_or(Invalid::Length)?;
            *b = dehex(l)? << 4 | dehex(r)?;
        }

        Ok(Self { algorithm, bytes })
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.algorithm.name())?;

        for byte in self.bytes.iter().cloned() {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct Visitor;
impl<'de> serde::de::Visitor<'de> for Visitor {
    type Value = Digest;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a string in the format `ALGO:HASH`")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(|e| E::custom(format!("{}", e)))
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Self::Value, E> {
        self.visit_str(&v)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(Visitor)
    }
}

/// An incremental canonical (sha256) digest computation.
#[derive(Clone)]
pub struct Hasher(Context);

impl Hasher {
    pub fn new() -> Self {
        Self(Context::new(&SHA256))
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest {
            algorithm: Algorithm::Sha256,
            bytes: self.0.finish().as_ref().to_vec(),
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Digest;
    use super::Hasher;

    #[test]
    fn parse_and_display() {
        let s = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest: Digest = s.parse().unwrap();
        assert_eq!(digest.algorithm(), "sha256");
        assert_eq!(digest.to_string(), s);
    }

    #[test]
    fn bare_hex_is_sha256() {
        let hex = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest: Digest = hex.parse().unwrap();
        assert_eq!(digest.to_string(), format!("sha256:{}", hex));
    }

    #[test]
    fn rejects_garbage() {
        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!("sha256:abcd".parse::<Digest>().is_err());
        assert!("sha256:zzb0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            .parse::<Digest>()
            .is_err());
    }

    #[test]
    fn of_empty_input() {
        // sha256 of zero bytes
        let expect = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(Digest::of(b"").to_string(), expect);
    }

    #[test]
    fn hasher_matches_one_shot() {
        let mut hasher = Hasher::new();
        hasher.update(b"01234");
        hasher.update(b"56789");
        assert_eq!(hasher.finish(), Digest::of(b"0123456789"));
    }

    #[test]
    fn serde_round_trip() {
        let s = "\"sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855\"";
        let digest: Digest = serde_json::from_str(s).unwrap();
        assert_eq!(serde_json::to_string(&digest).unwrap(), s);
    }
}
