//! The byte-source capability: a random-access view of the bytes being
//! uploaded, plus the range-restricting wrapper the parallel engine uses to
//! give each part its own logical source.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// One slice of the byte source: the bytes themselves, and whether the
/// source is exhausted at the requested end (i.e. no more bytes exist past
/// this slice).
#[derive(Debug, Clone)]
pub struct Slice {
    pub body: Bytes,
    pub done: bool,
}

/// A random-access byte source. `start`/`end` are absolute offsets into the
/// logical upload; `end: None` means "read until exhausted" (used for an
/// unbounded chunk size).
pub trait ByteSource: Send + Sync {
    /// The total size, if known. `None` means deferred length.
    fn size(&self) -> Option<u64>;

    /// Slice out `[start, end)` (or `[start, ..)` if `end` is `None`).
    fn slice(&self, start: u64, end: Option<u64>) -> impl Future<Output = io::Result<Slice>> + Send;

    /// Release any underlying resources. Not called on abort — only once
    /// the upload has actually finished, so a later `start()` can resume.
    fn close(&self);

    /// Stable bytes identifying this source's content, fed to the
    /// fingerprinter. Returning `None` opts this source out of
    /// fingerprinting (and therefore persistent resumption by fingerprint)
    /// entirely.
    fn identity(&self) -> Option<Vec<u8>> {
        None
    }
}

/// A byte source backed by a file on disk, read lazily and out of order
/// (hence the internal lock): retries and parallel parts all seek
/// independently.
pub struct FileByteSource {
    file: tokio::sync::Mutex<tokio::fs::File>,
    size: u64,
    path: std::path::PathBuf,
}

impl FileByteSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await?;
        let size = file.metadata().await?.len();
        Ok(Self { file: tokio::sync::Mutex::new(file), size, path })
    }
}

impl ByteSource for FileByteSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn slice(&self, start: u64, end: Option<u64>) -> impl Future<Output = io::Result<Slice>> + Send + '_ {
        async move {
            let mut file = self.file.lock().await;
            file.seek(io::SeekFrom::Start(start)).await?;
            match end {
                Some(end) => {
                    let want = end.saturating_sub(start) as usize;
                    let mut buf = vec![0u8; want];
                    let mut filled = 0;
                    while filled < want {
                        let n = file.read(&mut buf[filled..]).await?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }
                    buf.truncate(filled);
                    let done = filled < want;
                    Ok(Slice { body: Bytes::from(buf), done })
                }
                None => {
                    let mut buf = Vec::new();
                    file.read_to_end(&mut buf).await?;
                    Ok(Slice { body: Bytes::from(buf), done: true })
                }
            }
        }
    }

    fn close(&self) {}

    fn identity(&self) -> Option<Vec<u8>> {
        let mut id = self.path.as_os_str().as_encoded_bytes().to_vec();
        id.push(b':');
        id.extend_from_slice(self.size.to_string().as_bytes());
        Some(id)
    }
}

/// A byte source backed by an in-memory buffer. Useful for small uploads
/// and for tests.
pub struct MemoryByteSource {
    data: Bytes,
}

impl MemoryByteSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for MemoryByteSource {
    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn slice(&self, start: u64, end: Option<u64>) -> impl Future<Output = io::Result<Slice>> + Send + '_ {
        let data = self.data.clone();
        async move {
            let len = data.len() as u64;
            let start = start.min(len);
            let end = end.map(|e| e.min(len)).unwrap_or(len).max(start);
            let body = data.slice(start as usize..end as usize);
            Ok(Slice { body, done: end >= len })
        }
    }

    fn close(&self) {}

    fn identity(&self) -> Option<Vec<u8>> {
        Some(self.data.to_vec())
    }
}

/// Restricts another byte source to the absolute range `[base, limit)`,
/// re-basing offsets so the wrapped source sees `0..limit-base`. Used by the
/// parallel-upload engine to hand each part its own logical source without
/// copying bytes.
pub struct RangeByteSource<S> {
    inner: Arc<S>,
    base: u64,
    limit: u64,
}

impl<S: ByteSource> RangeByteSource<S> {
    pub fn new(inner: Arc<S>, base: u64, limit: u64) -> Self {
        assert!(base <= limit, "range base must not exceed its limit");
        Self { inner, base, limit }
    }
}

impl<S: ByteSource> ByteSource for RangeByteSource<S> {
    fn size(&self) -> Option<u64> {
        Some(self.limit - self.base)
    }

    fn slice(&self, start: u64, end: Option<u64>) -> impl Future<Output = io::Result<Slice>> + Send + '_ {
        async move {
            let abs_start = (self.base + start).min(self.limit);
            let abs_end = match end {
                Some(e) => (self.base + e).min(self.limit),
                None => self.limit,
            };
            let mut slice = self.inner.slice(abs_start, Some(abs_end)).await?;
            slice.done = abs_end >= self.limit;
            Ok(slice)
        }
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_slices_and_reports_done() {
        let source = MemoryByteSource::new(Bytes::from_static(b"hello world"));
        assert_eq!(source.size(), Some(11));

        let slice = source.slice(0, Some(5)).await.unwrap();
        assert_eq!(&slice.body[..], b"hello");
        assert!(!slice.done);

        let slice = source.slice(5, None).await.unwrap();
        assert_eq!(&slice.body[..], b" world");
        assert!(slice.done);
    }

    #[tokio::test]
    async fn range_source_rebases_offsets() {
        let inner = Arc::new(MemoryByteSource::new(Bytes::from_static(b"0123456789")));
        let part = RangeByteSource::new(inner, 3, 7); // "3456"
        assert_eq!(part.size(), Some(4));

        let slice = part.slice(0, Some(2)).await.unwrap();
        assert_eq!(&slice.body[..], b"34");
        assert!(!slice.done);

        let slice = part.slice(2, Some(4)).await.unwrap();
        assert_eq!(&slice.body[..], b"67");
        assert!(slice.done);
    }

    #[tokio::test]
    async fn file_source_reports_short_read_as_done() {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abcdefghij").unwrap();
        tmp.flush().unwrap();

        let source = FileByteSource::open(tmp.path()).await.unwrap();
        assert_eq!(source.size(), Some(10));

        let slice = source.slice(0, Some(4)).await.unwrap();
        assert_eq!(&slice.body[..], b"abcd");
        assert!(!slice.done);

        // Ask for more than remains: the short read signals `done`.
        let slice = source.slice(8, Some(100)).await.unwrap();
        assert_eq!(&slice.body[..], b"ij");
        assert!(slice.done);
    }
}
