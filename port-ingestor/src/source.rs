use std::fmt;
use std::future::Future;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{IngestError, ValidationError};

/// A byte stream already opened by the caller, such as a request body.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// The caller's choice of where to read a document from.
/// Exactly one of a path or a stream must be set for the selection to be valid.
#[derive(Default)]
pub struct SourceSelection {
    path: Option<PathBuf>,
    stream: Option<ByteStream>,
}

impl SourceSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new().with_path(path)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: AsyncRead + Send + Unpin + 'static,
    {
        Self::new().with_stream(stream)
    }

    /// An empty path counts as no path at all.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.path = (!path.as_os_str().is_empty()).then_some(path);
        self
    }

    pub fn with_stream<S>(mut self, stream: S) -> Self
    where
        S: AsyncRead + Send + Unpin + 'static,
    {
        self.stream = Some(Box::new(stream));
        self
    }

    /// Check that exactly one source was selected, resolving relative paths against `data_dir`.
    pub fn validate(self, data_dir: &Path) -> Result<Source, ValidationError> {
        match (self.path, self.stream) {
            (Some(_), Some(_)) => Err(ValidationError::ConflictingSources),
            (None, None) => Err(ValidationError::MissingSource),
            (Some(path), None) if path.is_absolute() => Ok(Source::File(path)),
            (Some(path), None) => Ok(Source::File(data_dir.join(path))),
            (None, Some(stream)) => Ok(Source::Stream(stream)),
        }
    }
}

impl fmt::Debug for SourceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSelection")
            .field("path", &self.path)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

/// A validated, not yet opened source.
pub enum Source {
    File(PathBuf),
    Stream(ByteStream),
}

impl Source {
    /// Open the source as a blocking reader the decoder can pull from.
    /// Streams are bridged to blocking reads, so the reader must be consumed off the async runtime.
    /// A stream read pending when `cancel` fires fails instead of waiting for more bytes.
    pub async fn open(
        self,
        cancel: CancellationToken,
    ) -> Result<Box<dyn Read + Send>, IngestError> {
        match self {
            Source::File(path) => {
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(error) => return Err(IngestError::OpenSource { path, error }),
                };

                Ok(Box::new(BufReader::new(file.into_std().await)))
            }
            Source::Stream(stream) => {
                let stream = CancellableStream::new(stream, cancel);
                Ok(Box::new(BufReader::new(SyncIoBridge::new(stream))))
            }
        }
    }
}

/// Fails reads with `io::ErrorKind::Other` once its token is cancelled, so a stalled client
/// cannot keep the decoder blocked.
struct CancellableStream {
    inner: ByteStream,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CancellableStream {
    fn new(inner: ByteStream, cancel: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancel.cancelled_owned()),
        }
    }
}

impl AsyncRead for CancellableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::other("ingestion was cancelled")));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
