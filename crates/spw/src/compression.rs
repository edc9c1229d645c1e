//! 🗜️ Compression: squeezing failed batches before they go into cold storage.
//!
//! The backup store accepts opaque bytes. What those bytes look like is decided
//! here, once per backup object, by the configured [`CompressionFormat`]:
//!
//! | Format | Crate | Object suffix |
//! |---|---|---|
//! | `UNCOMPRESSED` | none | (none) |
//! | `GZIP` | `flate2` | `.gz` |
//! | `ZIP` | `zip` (single deflated entry) | `.zip` |
//! | `Snappy` | `snap` (framed) | `.snappy` |
//!
//! 🧠 `decompress(compress(x)) == x` for every format, including the boring one.
//! The backup path depends on it: an operator replays a backup by undoing
//! exactly this step and nothing else.

use std::io::{Cursor, Read, Write};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Deserialize;

/// 📄 Name of the one entry inside a `ZIP` backup object.
const ZIP_ENTRY_NAME: &str = "records.ndjson";

/// 🗜️ How a backup object body is encoded.
///
/// Deserializes from the upper-case spellings the delivery-stream world uses
/// (`UNCOMPRESSED`, `GZIP`, `ZIP`, `Snappy`) and from the lower-case ones humans
/// type at 3am (`none`, `gzip`, `zip`, `snappy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CompressionFormat {
    #[default]
    #[serde(rename = "UNCOMPRESSED", alias = "none", alias = "None", alias = "uncompressed")]
    Uncompressed,
    #[serde(rename = "GZIP", alias = "gzip", alias = "Gzip")]
    Gzip,
    #[serde(rename = "ZIP", alias = "zip", alias = "Zip")]
    Zip,
    #[serde(rename = "Snappy", alias = "snappy", alias = "SNAPPY")]
    Snappy,
}

impl CompressionFormat {
    /// 🏷️ Suffix appended to backup keys so a human can tell what they're holding.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Uncompressed => "",
            Self::Gzip => ".gz",
            Self::Zip => ".zip",
            Self::Snappy => ".snappy",
        }
    }

    /// 🗜️ Encode `raw` in this format.
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Uncompressed => Ok(raw.to_vec()),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
                encoder
                    .write_all(raw)
                    .context("💀 gzip encoder refused the bytes. The bytes were fine. The encoder was not.")?;
                encoder
                    .finish()
                    .context("💀 gzip encoder could not write its trailer. So close, yet so uncompressed.")
            }
            Self::Zip => {
                let mut writer = zip::ZipWriter::new(Cursor::new(Vec::with_capacity(raw.len() / 2)));
                let options = zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Deflated);
                writer
                    .start_file(ZIP_ENTRY_NAME, options)
                    .context("💀 could not open the zip entry for backup records")?;
                writer
                    .write_all(raw)
                    .context("💀 could not write backup records into the zip entry")?;
                let cursor = writer
                    .finish()
                    .context("💀 could not write the zip central directory. The archive is homeless.")?;
                Ok(cursor.into_inner())
            }
            Self::Snappy => {
                let mut encoder = snap::write::FrameEncoder::new(Vec::with_capacity(raw.len() / 2));
                encoder
                    .write_all(raw)
                    .context("💀 snappy encoder choked on the backup payload")?;
                encoder.into_inner().map_err(|e| {
                    anyhow::anyhow!("💀 snappy encoder could not flush its final frame: {}", e.error())
                })
            }
        }
    }

    /// 🔓 Undo [`compress`](Self::compress). Used by replay tooling and tests.
    pub fn decompress(&self, encoded: &[u8]) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        match self {
            Self::Uncompressed => raw.extend_from_slice(encoded),
            Self::Gzip => {
                GzDecoder::new(encoded)
                    .read_to_end(&mut raw)
                    .context("💀 this does not gunzip. Either it was never gzip, or it was truncated.")?;
            }
            Self::Zip => {
                let mut archive = zip::ZipArchive::new(Cursor::new(encoded))
                    .context("💀 not a zip archive, or a zip archive with trust issues")?;
                let mut entry = archive
                    .by_index(0)
                    .context("💀 zip archive has no entries. Backup objects always have exactly one.")?;
                entry
                    .read_to_end(&mut raw)
                    .context("💀 failed to inflate the zip entry")?;
            }
            Self::Snappy => {
                snap::read::FrameDecoder::new(encoded)
                    .read_to_end(&mut raw)
                    .context("💀 snappy frames did not decode. Somebody fed us the wrong bytes.")?;
            }
        }
        Ok(raw)
    }
}

/// 🏷️ Same spellings as the config file accepts, for command-line flags.
impl FromStr for CompressionFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNCOMPRESSED" | "uncompressed" | "none" | "None" => Ok(Self::Uncompressed),
            "GZIP" | "gzip" | "Gzip" => Ok(Self::Gzip),
            "ZIP" | "zip" | "Zip" => Ok(Self::Zip),
            "Snappy" | "snappy" | "SNAPPY" => Ok(Self::Snappy),
            other => bail!("💀 unknown compression format '{}'. Try none, gzip, zip or snappy.", other),
        }
    }
}

impl CompressionFormat {
    /// 🔎 Guess the format from a backup key's suffix. No known suffix means uncompressed.
    pub fn from_key(key: &str) -> Self {
        [Self::Gzip, Self::Zip, Self::Snappy]
            .into_iter()
            .find(|format| key.ends_with(format.extension()))
            .unwrap_or(Self::Uncompressed)
    }
}
