use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::PartSource;

/// Implements [`PartSource`] for any [`AsyncRead`], constructed with a fixed content length.
#[pin_project]
pub struct SizedSource<R> {
    content_length: u64,
    content_type: Option<String>,
    #[pin]
    body: R,
}

impl<R> fmt::Debug for SizedSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizedSource")
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl SizedSource<tokio::fs::File> {
    /// Calls [`tokio::fs::File::metadata`] to determine the content length.
    pub async fn file(file: tokio::fs::File) -> io::Result<SizedSource<tokio::fs::File>> {
        let content_length = file.metadata().await?.len();
        Ok(SizedSource { content_length, content_type: None, body: file })
    }

    /// Opens the file at `path`, guessing the content type from its extension.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<SizedSource<tokio::fs::File>> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let mut source = SizedSource::file(file).await?;
        source.content_type = mime_guess::from_path(path).first().map(|mime| mime.to_string());
        Ok(source)
    }
}

impl<R: AsyncRead> SizedSource<R> {
    /// Construct a [`SizedSource`] with a content length supplied manually.
    pub fn sized(body: R, content_length: u64) -> Self {
        SizedSource { content_length, content_type: None, body }
    }
}

impl<R> SizedSource<R> {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn into_inner(self) -> R {
        self.body
    }
}

impl<R: AsyncRead> AsyncRead for SizedSource<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        this.body.poll_read(cx, buf)
    }
}

impl<R: AsyncRead> PartSource for SizedSource<R> {
    fn content_length(&self) -> u64 {
        self.content_length
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}
