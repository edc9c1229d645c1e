use anyhow::{Context, Result, bail};

use crate::common::SealedBatch;
use crate::compression::CompressionFormat;

/// 🧯 A sealed batch, serialized for the backup store.
///
/// Key: `{prefix}{batch-id}{ext}`. Body: one frame per record, in arrival
/// order, then compressed. A frame is the record's byte length in ASCII
/// decimal, `\n`, the record bytes untouched, `\n`:
///
/// ```text
/// 7
/// {"n":1}
/// 20
/// {
///   "pretty": true
/// }
/// ```
///
/// Records are opaque bytes and may contain newlines of their own (the index
/// likes to refuse exactly those), so the length decides where a record ends,
/// never the newline. The object still reads fine in `less`.
#[derive(Debug, Clone)]
pub struct BackupObject {
    key: String,
    body: Vec<u8>,
    records: usize,
}

impl BackupObject {
    pub(crate) fn from_batch(batch: &SealedBatch, prefix: &str, compression: CompressionFormat) -> Result<Self> {
        let framed = Self::encode_records(batch.records().iter().map(|record| record.body()));
        let body = compression
            .compress(&framed)
            .with_context(|| format!("💀 could not {:?}-compress batch {} for backup", compression, batch.id()))?;
        Ok(Self {
            key: format!("{prefix}{}{}", batch.id(), compression.extension()),
            body,
            records: batch.len(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// 📦 Frame record bodies the way backup objects hold them, before compression.
    pub fn encode_records<'a>(bodies: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
        let mut framed = Vec::new();
        for body in bodies {
            framed.extend_from_slice(body.len().to_string().as_bytes());
            framed.push(b'\n');
            framed.extend_from_slice(body);
            framed.push(b'\n');
        }
        framed
    }

    /// 🔓 Undo a backup body: decompress, then walk the frames back into record bodies.
    ///
    /// A torn or tampered object is an error, never a shorter list.
    pub fn decode_records(compression: CompressionFormat, body: &[u8]) -> Result<Vec<Vec<u8>>> {
        let raw = compression
            .decompress(body)
            .context("💀 backup object body did not decompress")?;
        let mut records = Vec::new();
        let mut rest: &[u8] = &raw;
        while !rest.is_empty() {
            let frame = records.len();
            let header_end = memchr::memchr(b'\n', rest)
                .with_context(|| format!("💀 frame {frame} has no length header. The object is torn."))?;
            let len: usize = std::str::from_utf8(&rest[..header_end])
                .ok()
                .and_then(|header| header.parse().ok())
                .with_context(|| format!("💀 frame {frame} does not start with a byte length. Not a backup object?"))?;
            let body_start = header_end + 1;
            let body_end = body_start.saturating_add(len);
            if rest.len() <= body_end || rest[body_end] != b'\n' {
                bail!(
                    "💀 frame {} promises {} bytes but the object ends or misaligns before that. The object is torn.",
                    frame,
                    len
                );
            }
            records.push(rest[body_start..body_end].to_vec());
            rest = &rest[body_end + 1..];
        }
        Ok(records)
    }
}
