//! The file handed to an upload: a name, a MIME type, a size and somewhere to
//! read the bytes from.

use crate::policy::guess_content_type;
use bytes::Bytes;
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::io::ReaderStream;

/// Slice size used when streaming an in-memory body.
const STREAM_SLICE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Disk(PathBuf),
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub source: FileSource,
}

impl UploadFile {
    pub fn from_bytes(
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            content_type: content_type.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    /// Describe a file on disk. The MIME type is guessed from the extension
    /// when not given.
    pub async fn open(path: impl AsRef<Path>, content_type: Option<&str>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| guess_content_type(&name).to_string());
        Ok(Self {
            name,
            content_type,
            size: meta.len(),
            source: FileSource::Disk(path.to_path_buf()),
        })
    }

    /// Read `len` bytes starting at `offset`.
    pub async fn read_range(&self, offset: u64, len: u64) -> io::Result<Bytes> {
        let end = offset.checked_add(len).filter(|end| *end <= self.size);
        let Some(end) = end else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}+{} is past the end of {}", offset, len, self.name),
            ));
        };
        match &self.source {
            FileSource::Memory(data) => Ok(data.slice(offset as usize..end as usize)),
            FileSource::Disk(path) => {
                let mut file = File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// The whole body as a stream of byte slices.
    pub fn byte_stream(&self) -> BoxStream<'static, io::Result<Bytes>> {
        match &self.source {
            FileSource::Memory(data) => {
                let data = data.clone();
                let slices: Vec<io::Result<Bytes>> = (0..data.len())
                    .step_by(STREAM_SLICE)
                    .map(|start| Ok(data.slice(start..(start + STREAM_SLICE).min(data.len()))))
                    .collect();
                stream::iter(slices).boxed()
            }
            FileSource::Disk(path) => stream::once(File::open(path.clone()))
                .map_ok(ReaderStream::new)
                .try_flatten()
                .boxed(),
        }
    }
}
