//! Zip archive decomposition.
//!
//! Every file entry of an archive becomes an independent blob; directory
//! entries are skipped. The gzip variant compresses each entry and keeps the
//! compressed form only when it is strictly smaller than the original.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{Cursor, Read, Write};

use coffer_types::ContentKey;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zip::ZipArchive;

use crate::blob::Blob;
use crate::error::{StoreError, StoreResult};
use crate::traits::Bucket;

/// A value tagged with whether its payload was stored gzip-compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaybeCompressed<T> {
    pub compressed: bool,
    pub payload: T,
}

impl<T> MaybeCompressed<T> {
    pub fn plain(payload: T) -> Self {
        Self {
            compressed: false,
            payload,
        }
    }

    pub fn gzipped(payload: T) -> Self {
        Self {
            compressed: true,
            payload,
        }
    }

    /// Transform the payload, keeping the compression flag.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MaybeCompressed<U> {
        MaybeCompressed {
            compressed: self.compressed,
            payload: f(self.payload),
        }
    }
}

/// Read every file entry of a zip archive, in archive order.
pub fn entries(archive: &[u8]) -> StoreResult<Vec<(String, Vec<u8>)>> {
    let mut zip = ZipArchive::new(Cursor::new(archive)).map_err(invalid)?;
    let mut out = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut file = zip.by_index(index).map_err(invalid)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let mut data = Vec::with_capacity(file.size().min(64 * 1024 * 1024) as usize);
        file.read_to_end(&mut data)
            .map_err(|e| StoreError::Archive(format!("{name}: {e}")))?;
        out.push((name, data));
    }
    Ok(out)
}

/// Gzip `data` at the default compression level.
pub fn gzip(data: &[u8]) -> StoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Gzip `data`, keeping the result only if it is strictly smaller.
pub fn maybe_gzip(data: Vec<u8>) -> StoreResult<MaybeCompressed<Vec<u8>>> {
    let packed = gzip(&data)?;
    Ok(if packed.len() < data.len() {
        MaybeCompressed::gzipped(packed)
    } else {
        MaybeCompressed::plain(data)
    })
}

/// Store each file entry of `archive` in `bucket` as one batch.
pub fn put_archive<B>(bucket: &B, archive: &[u8]) -> StoreResult<BTreeMap<String, ContentKey>>
where
    B: Bucket + ?Sized,
{
    let (names, blobs): (Vec<String>, Vec<Blob>) = entries(archive)?
        .into_iter()
        .map(|(name, data)| (name, Blob::from_vec(data)))
        .unzip();
    let keys = bucket.put_many(blobs)?;
    debug!(entries = names.len(), "decomposed archive");
    Ok(names.into_iter().zip(keys).collect())
}

/// Like [`put_archive`], compressing entries where that saves space.
pub fn put_archive_gzip<B>(
    bucket: &B,
    archive: &[u8],
) -> StoreResult<BTreeMap<String, MaybeCompressed<ContentKey>>>
where
    B: Bucket + ?Sized,
{
    let mut names = Vec::new();
    let mut flags = Vec::new();
    let mut blobs = Vec::new();
    for (name, data) in entries(archive)? {
        let packed = maybe_gzip(data)?;
        names.push(name);
        flags.push(packed.compressed);
        blobs.push(Blob::from_vec(packed.payload));
    }
    let keys = bucket.put_many(blobs)?;
    debug!(
        entries = names.len(),
        compressed = flags.iter().filter(|c| **c).count(),
        "decomposed archive with gzip"
    );
    Ok(names
        .into_iter()
        .zip(flags.into_iter().zip(keys))
        .map(|(name, (compressed, key))| (name, MaybeCompressed { compressed, payload: key }))
        .collect())
}

/// Render a decomposition as newline-terminated `digest:name` lines.
pub fn format_listing(listing: &BTreeMap<String, ContentKey>) -> String {
    let mut out = String::new();
    for (name, key) in listing {
        let _ = writeln!(out, "{key}:{name}");
    }
    out
}

fn invalid(e: zip::result::ZipError) -> StoreError {
    StoreError::Archive(e.to_string())
}
