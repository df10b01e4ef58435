//! Blob payloads and their three memory representations.
//!
//! - **Lazy** wraps a re-openable [`ByteSource`]; its size may be unknown and
//!   nothing is buffered until the blob is converted.
//! - **Loaded** holds the payload in a shared heap buffer.
//! - **Direct** holds the payload in a read-only anonymous memory map outside
//!   the allocator, which keeps large cached payloads from fragmenting the heap.
//!
//! Conversions are explicit and lossless. Identity is always derived from the
//! bytes, so every representation of the same content yields the same key.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;
use memmap2::{Mmap, MmapMut};

use crate::error::{StoreError, StoreResult};

/// A re-openable source of payload bytes.
///
/// Every call to [`ByteSource::open`] starts a fresh read from the beginning.
pub trait ByteSource: Send + Sync {
    /// Open a new reader over the whole payload.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Payload size, when the source knows it without reading.
    fn size_hint(&self) -> Option<u64> {
        None
    }
}

/// A file on disk, re-opened for every read.
#[derive(Clone, Debug)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn size_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

/// A source backed by a closure that opens a reader.
pub struct FnSource<F> {
    open: F,
}

impl<F> FnSource<F>
where
    F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync,
{
    pub fn new(open: F) -> Self {
        Self { open }
    }
}

impl<F> ByteSource for FnSource<F>
where
    F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync,
{
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        (self.open)()
    }
}

impl ByteSource for Vec<u8> {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.clone())))
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.len() as u64)
    }
}

/// Off-heap, read-only payload buffer.
///
/// Empty payloads carry no mapping, since anonymous maps cannot be empty.
#[derive(Clone)]
pub struct DirectBuffer {
    map: Option<Arc<Mmap>>,
}

impl DirectBuffer {
    /// Copy `data` into a fresh anonymous mapping.
    pub fn copy_from(data: &[u8]) -> io::Result<Self> {
        if data.is_empty() {
            return Ok(Self { map: None });
        }
        let mut map = MmapMut::map_anon(data.len())?;
        map.copy_from_slice(data);
        Ok(Self {
            map: Some(Arc::new(map.make_read_only()?)),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_none()
    }
}

impl AsRef<[u8]> for DirectBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// The representation a blob currently uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Lazy,
    Loaded,
    Direct,
}

/// Where materialized payloads should live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Materialization {
    /// Shared heap buffers ([`BlobKind::Loaded`]).
    #[default]
    Heap,
    /// Off-heap anonymous maps ([`BlobKind::Direct`]).
    Direct,
}

impl Materialization {
    /// Convert a blob into this materialization.
    pub fn apply(self, blob: &Blob) -> StoreResult<Blob> {
        match self {
            Self::Heap => blob.to_loaded(),
            Self::Direct => blob.to_direct(),
        }
    }
}

/// Heap payload. The bytes live in their own allocation behind the shared
/// header, so a weak handle on the header (the digest memo keeps one) does
/// not keep the bytes alive.
#[derive(Clone)]
struct HeapBuffer(Arc<Vec<u8>>);

impl AsRef<[u8]> for HeapBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone)]
enum Repr {
    Lazy {
        source: Arc<dyn ByteSource>,
        size: Option<u64>,
    },
    Loaded(HeapBuffer),
    Direct(DirectBuffer),
}

/// An immutable byte payload.
///
/// Cloning a blob never copies its bytes.
#[derive(Clone)]
pub struct Blob {
    repr: Repr,
}

impl Blob {
    /// A loaded blob owning `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            repr: Repr::Loaded(HeapBuffer(Arc::new(data))),
        }
    }

    /// A loaded blob copied from `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// A loaded blob sharing an existing buffer.
    pub fn from_shared(data: Arc<Vec<u8>>) -> Self {
        Self {
            repr: Repr::Loaded(HeapBuffer(data)),
        }
    }

    /// A direct blob holding a copy of `data` off-heap.
    pub fn direct(data: &[u8]) -> StoreResult<Self> {
        Ok(Self {
            repr: Repr::Direct(DirectBuffer::copy_from(data)?),
        })
    }

    /// A lazy blob over `source`. When `size` is `None` the source's own
    /// size hint is used, if any.
    pub fn lazy(source: Arc<dyn ByteSource>, size: Option<u64>) -> Self {
        let size = size.or_else(|| source.size_hint());
        Self {
            repr: Repr::Lazy { source, size },
        }
    }

    /// A lazy blob reading the file at `path`.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::lazy(Arc::new(FileSource::new(path)), None)
    }

    pub fn kind(&self) -> BlobKind {
        match self.repr {
            Repr::Lazy { .. } => BlobKind::Lazy,
            Repr::Loaded(_) => BlobKind::Loaded,
            Repr::Direct(_) => BlobKind::Direct,
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.kind() == BlobKind::Lazy
    }

    pub fn is_loaded(&self) -> bool {
        self.kind() == BlobKind::Loaded
    }

    pub fn is_direct(&self) -> bool {
        self.kind() == BlobKind::Direct
    }

    /// Payload size in bytes. Only a lazy blob may not know it.
    pub fn size(&self) -> Option<u64> {
        match &self.repr {
            Repr::Lazy { size, .. } => *size,
            Repr::Loaded(data) => Some(data.0.len() as u64),
            Repr::Direct(buf) => Some(buf.len() as u64),
        }
    }

    /// Open an independent reader over the payload.
    pub fn open_reader(&self) -> StoreResult<Box<dyn Read + Send>> {
        match &self.repr {
            Repr::Lazy { source, .. } => Ok(source.open()?),
            Repr::Loaded(data) => Ok(Box::new(Cursor::new(data.clone()))),
            Repr::Direct(buf) => Ok(Box::new(Cursor::new(buf.clone()))),
        }
    }

    /// Read the whole payload into a fresh vector.
    pub fn read_all(&self) -> StoreResult<Vec<u8>> {
        match &self.repr {
            Repr::Lazy { source, size } => read_source(source.as_ref(), *size),
            Repr::Loaded(data) => Ok(data.0.to_vec()),
            Repr::Direct(buf) => Ok(buf.as_slice().to_vec()),
        }
    }

    /// Convert to a heap-resident blob. Loaded blobs are returned as is.
    pub fn to_loaded(&self) -> StoreResult<Blob> {
        match &self.repr {
            Repr::Loaded(_) => Ok(self.clone()),
            Repr::Lazy { source, size } => {
                Ok(Self::from_vec(read_source(source.as_ref(), *size)?))
            }
            Repr::Direct(buf) => Ok(Self::from_slice(buf.as_slice())),
        }
    }

    /// Convert to an off-heap blob. Direct blobs are returned as is.
    pub fn to_direct(&self) -> StoreResult<Blob> {
        match &self.repr {
            Repr::Direct(_) => Ok(self.clone()),
            Repr::Loaded(data) => Self::direct(data.as_ref()),
            Repr::Lazy { source, size } => {
                Self::direct(&read_source(source.as_ref(), *size)?)
            }
        }
    }

    /// Compute the key of this blob.
    ///
    /// Materialized payloads go through the function's memo; lazy sources
    /// are streamed without buffering.
    pub fn digest(&self, function: &HashFunction) -> StoreResult<ContentKey> {
        match &self.repr {
            Repr::Lazy { source, size } => {
                let mut counted = CountingReader::new(source.open()?);
                let key = function.digest_reader(&mut counted)?;
                check_size(*size, counted.count)?;
                Ok(key)
            }
            Repr::Loaded(data) => Ok(function.digest_shared(&data.0)),
            Repr::Direct(buf) => Ok(match &buf.map {
                Some(map) => function.digest_shared(map),
                None => function.digest_bytes(&[]),
            }),
        }
    }

    /// Materialize (if lazy) and pair the payload with its key in one pass.
    pub fn to_entry(&self, function: &HashFunction) -> StoreResult<BlobEntry> {
        let blob = match self.repr {
            Repr::Lazy { .. } => self.to_loaded()?,
            _ => self.clone(),
        };
        let key = blob.digest(function)?;
        Ok(BlobEntry { key, blob })
    }

    /// Compare payload bytes regardless of representation.
    pub fn content_eq(&self, other: &Blob) -> StoreResult<bool> {
        if let (Some(a), Some(b)) = (self.size(), other.size()) {
            if a != b {
                return Ok(false);
            }
        }
        Ok(self.read_all()? == other.read_all()?)
    }

    /// Borrow the bytes of a materialized blob.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Lazy { .. } => None,
            Repr::Loaded(data) => Some(data.as_ref()),
            Repr::Direct(buf) => Some(buf.as_slice()),
        }
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

impl From<&[u8]> for Blob {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("kind", &self.kind())
            .field("size", &self.size())
            .finish()
    }
}

/// A materialized blob paired with its key.
#[derive(Clone, Debug)]
pub struct BlobEntry {
    pub key: ContentKey,
    pub blob: Blob,
}

impl BlobEntry {
    /// Re-home the payload without recomputing the key.
    pub fn materialize(self, materialization: Materialization) -> StoreResult<BlobEntry> {
        Ok(BlobEntry {
            key: self.key,
            blob: materialization.apply(&self.blob)?,
        })
    }
}

fn read_source(source: &dyn ByteSource, declared: Option<u64>) -> StoreResult<Vec<u8>> {
    let mut data = Vec::with_capacity(declared.unwrap_or(0).min(64 * 1024 * 1024) as usize);
    source.open()?.read_to_end(&mut data)?;
    check_size(declared, data.len() as u64)?;
    Ok(data)
}

fn check_size(declared: Option<u64>, actual: u64) -> StoreResult<()> {
    match declared {
        Some(declared) if declared != actual => Err(StoreError::SizeMismatch { declared, actual }),
        _ => Ok(()),
    }
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}
