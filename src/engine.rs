//! Bridge from a channel byte stream into the SFTP protocol engine

use crate::sftp_handler::FsHandler;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Something that serves a subsystem over a bidirectional stream
///
/// `serve` returns `Ok(())` when the peer ended the stream cleanly. Each call
/// is a fresh engine instance.
///
/// For [`SftpEngine`], "cleanly" is judged at the transport: a client that
/// sends a truncated packet and then EOF is reported as `Ok(())`, because
/// russh-sftp treats a short read as end of stream and no I/O error reaches
/// the channel.
#[async_trait]
pub trait SubsystemEngine: Send + Sync + 'static {
    async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// russh-sftp over the local filesystem
#[derive(Debug, Clone)]
pub struct SftpEngine {
    working_dir: PathBuf,
}

impl SftpEngine {
    /// Relative SFTP paths resolve against `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Use the process working directory, falling back to `/`
    pub fn current_dir() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/")))
    }
}

impl Default for SftpEngine {
    fn default() -> Self {
        Self::current_dir()
    }
}

#[async_trait]
impl SubsystemEngine for SftpEngine {
    async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stream, outcome) = TrackedStream::new(stream);
        let handler = FsHandler::new(self.working_dir.clone());

        russh_sftp::server::run(stream, handler).await;

        // Resolves once the engine has let go of the stream.
        match outcome.await {
            Ok(Some(err)) => Err(err),
            Ok(None) | Err(_) => {
                debug!("sftp stream ended");
                Ok(())
            }
        }
    }
}

/// Stream wrapper that remembers the first I/O failure
///
/// The outcome is sent when the wrapper is dropped. After a read failure the
/// stream reads as end-of-file so the engine's read loop stops.
pub struct TrackedStream<S> {
    inner: S,
    failure: Option<io::Error>,
    report: Option<oneshot::Sender<Option<io::Error>>>,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S) -> (Self, oneshot::Receiver<Option<io::Error>>) {
        let (tx, rx) = oneshot::channel();
        let stream = Self {
            inner,
            failure: None,
            report: Some(tx),
        };
        (stream, rx)
    }

    fn record(&mut self, err: &io::Error) {
        if self.failure.is_none() {
            warn!(error = %err, "sftp stream failed");
            self.failure = Some(io::Error::new(err.kind(), err.to_string()));
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.failure.is_some() {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Err(err)) => {
                self.record(&err);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(ref err)) = poll {
            self.record(err);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_flush(cx);
        if let Poll::Ready(Err(ref err)) = poll {
            self.record(err);
        }
        poll
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        if let Some(report) = self.report.take() {
            let _ = report.send(self.failure.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_err, assert_ok};

    /// Reader that always fails
    struct Broken;

    impl AsyncRead for Broken {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for Broken {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_clean_eof_reports_no_failure() {
        let (client, server) = tokio::io::duplex(64);
        let (mut tracked, outcome) = TrackedStream::new(server);
        drop(client);

        let mut buf = Vec::new();
        tracked.read_to_end(&mut buf).await.unwrap();
        drop(tracked);

        assert!(outcome.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_failure_is_reported_and_reads_as_eof() {
        let (mut tracked, outcome) = TrackedStream::new(Broken);

        let mut buf = [0u8; 8];
        assert_eq!(tracked.read(&mut buf).await.unwrap(), 0);
        assert_eq!(tracked.read(&mut buf).await.unwrap(), 0);
        drop(tracked);

        let failure = outcome.await.unwrap().unwrap();
        assert_eq!(failure.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let (mut tracked, outcome) = TrackedStream::new(Broken);
        assert_err!(tracked.write_all(b"data").await);
        drop(tracked);

        let failure = outcome.await.unwrap().unwrap();
        assert_eq!(failure.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_sftp_engine_answers_init_and_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SftpEngine::new(dir.path());
        let (mut client, server) = tokio::io::duplex(4096);

        let serve = tokio::spawn(async move { engine.serve(server).await });

        // SSH_FXP_INIT, version 3
        client
            .write_all(&[0, 0, 0, 5, 1, 0, 0, 0, 3])
            .await
            .unwrap();
        let len = client.read_u32().await.unwrap();
        let kind = client.read_u8().await.unwrap();
        assert!(len >= 5);
        assert_eq!(kind, 2); // SSH_FXP_VERSION
        drop(client);

        assert_ok!(serve.await.unwrap());
    }
}
