// SPDX-License-Identifier: Apache-2.0

//! The legacy signed manifest schema: reverse-ordered blob sums, one
//! v1-compatibility JSON document per layer, and a JWS signature spliced
//! into the pretty-printed body.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::super::config::{History, ImageConfig, RuntimeConfig, V1Image};
use super::super::Digest;
use super::v2::Descriptor;
use crate::error::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: Digest,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "v1Compatibility")]
    pub v1_compatibility: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: usize,

    pub name: String,

    pub tag: String,

    pub architecture: String,

    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,

    #[serde(default)]
    pub history: Vec<HistoryRecord>,
}

impl Manifest {
    /// Decodes the newest v1-compatibility record, the one describing the
    /// whole image.
    pub fn base_image(&self) -> Result<V1Image, Error> {
        let record = self.history.first().ok_or_else(|| {
            Error::UnsupportedManifest("legacy manifest carries no history".into())
        })?;

        serde_json::from_str(&record.v1_compatibility)
            .map_err(|e| Error::UnsupportedManifest(format!("bad v1 compatibility record: {}", e)))
    }

    /// Decodes every v1-compatibility record, newest first, like the wire
    /// carries them.
    pub fn records(&self) -> Result<Vec<V1Image>, Error> {
        self.history
            .iter()
            .map(|r| {
                serde_json::from_str(&r.v1_compatibility).map_err(|e| {
                    Error::UnsupportedManifest(format!("bad v1 compatibility record: {}", e))
                })
            })
            .collect()
    }

    /// Translates a finalized image into the legacy shape: layers reversed,
    /// one synthesized compatibility record per layer. Layer identifiers are
    /// derived from the blob digest chain, so the same image always yields
    /// the same identifiers.
    pub fn from_image(
        name: &str,
        tag: &str,
        config: &ImageConfig,
        layers: &[Descriptor],
    ) -> Result<Self, Error> {
        if layers.is_empty() {
            return Err(Error::Fatal("cannot publish an image with no layers".into()));
        }

        let mut ids = Vec::with_capacity(layers.len());
        let mut parent = String::new();
        for layer in layers {
            let id = Digest::of(format!("{} {}", layer.digest, parent).as_bytes()).hex();
            ids.push(id.clone());
            parent = id;
        }

        // History entries line up with layers only through the entries that
        // actually carry a layer.
        let real: Vec<&History> = config.history.iter().filter(|h| !h.empty_layer).collect();
        let aligned = real.len() == layers.len();

        let mut fs_layers = Vec::with_capacity(layers.len());
        let mut history = Vec::with_capacity(layers.len());
        for i in (0..layers.len()).rev() {
            fs_layers.push(FsLayer {
                blob_sum: layers[i].digest.clone(),
            });

            let parent = if i > 0 { ids[i - 1].clone() } else { String::new() };
            let record = if i == layers.len() - 1 {
                V1Image {
                    id: ids[i].clone(),
                    parent,
                    comment: config.comment.clone(),
                    created: config.created,
                    container: config.container.clone(),
                    container_config: config.container_config.clone(),
                    docker_version: config.docker_version.clone(),
                    author: config.author.clone(),
                    config: config.config.clone(),
                    architecture: config.architecture.clone(),
                    os: config.os.clone(),
                    size: 0,
                    throwaway: None,
                }
            } else {
                let entry = aligned.then(|| real[i]);
                V1Image {
                    id: ids[i].clone(),
                    parent,
                    created: entry.and_then(|e| e.created).or(config.created),
                    author: entry.map(|e| e.author.clone()).unwrap_or_default(),
                    container_config: entry.and_then(|e| {
                        (!e.created_by.is_empty()).then(|| RuntimeConfig {
                            cmd: Some(vec![e.created_by.clone()]),
                            ..RuntimeConfig::default()
                        })
                    }),
                    ..V1Image::default()
                }
            };

            history.push(HistoryRecord {
                v1_compatibility: serde_json::to_string(&record)?,
            });
        }

        Ok(Self {
            schema_version: 1,
            name: name.into(),
            tag: tag.into(),
            architecture: config.architecture.clone(),
            fs_layers,
            history,
        })
    }

    /// Serializes and signs the manifest with an ephemeral P-256 key in the
    /// pretty JWS form the legacy protocol expects.
    pub fn sign(&self) -> Result<Vec<u8>, Error> {
        const TAIL: &str = "\n}";

        let body = serde_json::to_string_pretty(self)?;
        let format_length = body.len() - TAIL.len();

        let protected = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&json!({
            "formatLength": format_length,
            "formatTail": URL_SAFE_NO_PAD.encode(TAIL),
            "time": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }))?);

        let message = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(&body));

        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| Error::Fatal("manifest signing key generation failed".into()))?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| Error::Fatal(format!("manifest signing key rejected: {}", e)))?;
        let signature = key
            .sign(&rng, message.as_bytes())
            .map_err(|_| Error::Fatal("manifest signing failed".into()))?;

        // An uncompressed point: 0x04, then 32 bytes each of x and y.
        let public = key.public_key().as_ref();
        let signature = json!({
            "header": {
                "jwk": {
                    "crv": "P-256",
                    "kty": "EC",
                    "x": URL_SAFE_NO_PAD.encode(&public[1..33]),
                    "y": URL_SAFE_NO_PAD.encode(&public[33..65]),
                },
                "alg": "ES256",
            },
            "signature": URL_SAFE_NO_PAD.encode(signature.as_ref()),
            "protected": protected,
        });

        let mut out = String::with_capacity(body.len() + 512);
        out.push_str(&body[..format_length]);
        out.push_str(",\"signatures\":[");
        out.push_str(&serde_json::to_string(&signature)?);
        out.push(']');
        out.push_str(TAIL);

        Ok(out.into_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::formats::media;

    fn layer(digest: &str, size: u64) -> Descriptor {
        Descriptor {
            media_type: media::LAYER_GZIP.into(),
            size,
            digest: format!("sha256:{}", digest.repeat(64)).parse().unwrap(),
            urls: Vec::new(),
        }
    }

    fn image() -> (ImageConfig, Vec<Descriptor>) {
        let mut config = ImageConfig::empty();
        let layers = vec![layer("a", 10), layer("b", 20), layer("c", 30)];
        for (i, l) in layers.iter().enumerate() {
            config.add_layer(
                l.size,
                Some(&Digest::of(&[i as u8])),
                History {
                    created_by: format!("step {}", i),
                    ..History::default()
                },
            );
        }
        (config, layers)
    }

    #[test]
    fn blob_sums_are_reversed() {
        let (config, layers) = image();
        let manifest = Manifest::from_image("ns/out", "v1", &config, &layers).unwrap();

        let reversed: Vec<_> = manifest.fs_layers.iter().rev().map(|f| &f.blob_sum).collect();
        let modern: Vec<_> = layers.iter().map(|l| &l.digest).collect();
        assert_eq!(reversed, modern);
        assert_eq!(manifest.history.len(), layers.len());
        assert_eq!(manifest.schema_version, 1);
    }

    #[test]
    fn layer_identifiers_are_stable_and_chained() {
        let (config, layers) = image();
        let one = Manifest::from_image("ns/out", "v1", &config, &layers).unwrap();
        let two = Manifest::from_image("ns/out", "v1", &config, &layers).unwrap();

        let records = one.records().unwrap();
        assert_eq!(records[0].id, two.records().unwrap()[0].id);
        // newest first: each record's parent is the next record's id
        for pair in records.windows(2) {
            assert_eq!(pair[0].parent, pair[1].id);
        }
        assert!(records.last().unwrap().parent.is_empty());
    }

    #[test]
    fn top_record_carries_the_runtime_config() {
        let (mut config, layers) = image();
        config.runtime_mut().cmd = Some(vec!["run".into()]);
        let manifest = Manifest::from_image("ns/out", "v1", &config, &layers).unwrap();

        let top = manifest.base_image().unwrap();
        assert_eq!(top.config.unwrap().cmd.unwrap(), ["run"]);

        let records = manifest.records().unwrap();
        assert_eq!(records[1].created_by(), "step 1");
    }

    #[test]
    fn signature_verifies_against_the_embedded_key() {
        use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED};

        let (config, layers) = image();
        let manifest = Manifest::from_image("ns/out", "v1", &config, &layers).unwrap();
        let signed = manifest.sign().unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&signed).unwrap();
        let sig = &doc["signatures"][0];
        let protected = sig["protected"].as_str().unwrap();

        let claims: serde_json::Value = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(protected).unwrap(),
        )
        .unwrap();
        let format_length = claims["formatLength"].as_u64().unwrap() as usize;
        let tail = URL_SAFE_NO_PAD
            .decode(claims["formatTail"].as_str().unwrap())
            .unwrap();

        let mut payload = signed[..format_length].to_vec();
        payload.extend_from_slice(&tail);
        let message = format!("{}.{}", protected, URL_SAFE_NO_PAD.encode(&payload));

        let mut public = vec![4u8];
        public.extend(
            URL_SAFE_NO_PAD
                .decode(sig["header"]["jwk"]["x"].as_str().unwrap())
                .unwrap(),
        );
        public.extend(
            URL_SAFE_NO_PAD
                .decode(sig["header"]["jwk"]["y"].as_str().unwrap())
                .unwrap(),
        );

        let raw = URL_SAFE_NO_PAD.decode(sig["signature"].as_str().unwrap()).unwrap();
        UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, &public)
            .verify(message.as_bytes(), &raw)
            .unwrap();

        // the reconstructed payload is the manifest that was signed
        let original: Manifest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(original.fs_layers.len(), layers.len());
    }
}
