//! Channel multiplexing for one negotiated SSH connection
//!
//! The orchestrator consumes the channel-open and global-request streams a
//! connection handler produces. Non-session channels are refused, each
//! accepted session channel gets its own task, and a channel that asks for
//! the `sftp` subsystem is bridged into a [`SubsystemEngine`].

use crate::channel::{
    is_sftp_subsystem, ChannelOpen, ChannelRequest, GlobalRequest, OpenOutcome, RejectReason,
};
use crate::engine::SubsystemEngine;
use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, trace};

type Bridge = BoxFuture<'static, io::Result<()>>;

/// Drives the channels of one connection
pub struct Orchestrator<E: SubsystemEngine> {
    engine: Arc<E>,
}

impl<E: SubsystemEngine> Clone for Orchestrator<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<E: SubsystemEngine> Orchestrator<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Run until the peer stops opening channels or something fails
    ///
    /// Returns `Ok(())` once `channels` is exhausted and every channel task
    /// has finished. The first error from any channel task ends the run and
    /// aborts the others.
    pub async fn run<S>(
        &self,
        mut channels: mpsc::Receiver<ChannelOpen<S>>,
        requests: mpsc::Receiver<GlobalRequest>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let discard = tokio::spawn(discard_requests(requests));
        let mut handlers = JoinSet::new();

        let result = loop {
            tokio::select! {
                open = channels.recv() => match open {
                    Some(open) => {
                        if let Err(err) = self.dispatch(open, &mut handlers) {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                Some(joined) = handlers.join_next() => {
                    if let Err(err) = flatten(joined) {
                        break Err(err);
                    }
                }
            }
        };

        let result = match result {
            Ok(()) => drain(&mut handlers).await,
            Err(err) => Err(err),
        };

        handlers.abort_all();
        discard.abort();
        result
    }

    fn dispatch<S>(
        &self,
        open: ChannelOpen<S>,
        handlers: &mut JoinSet<Result<()>>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let seq = open.seq;
        if !open.is_session() {
            debug!(channel = seq, kind = %open.kind, "Rejecting channel");
            let (stream, requests, outcome) = open.into_parts();
            drop(stream);
            drop(requests);
            let _ = outcome.send(OpenOutcome::Rejected(RejectReason::UnknownChannelType));
            return Ok(());
        }

        let (stream, requests, outcome) = open.into_parts();
        outcome
            .send(OpenOutcome::Accepted)
            .map_err(|_| Error::ChannelAccept { channel: seq })?;

        debug!(channel = seq, "Accepted session channel");
        handlers.spawn(serve_channel(self.engine.clone(), seq, stream, requests));
        Ok(())
    }
}

/// Handle the requests of one session channel
///
/// Requests are answered in order, one reply each, including while an engine
/// is running. Only the first `sftp` subsystem request on a channel is
/// accepted.
pub async fn serve_channel<E, S>(
    engine: Arc<E>,
    seq: u64,
    stream: S,
    mut requests: mpsc::Receiver<ChannelRequest>,
) -> Result<()>
where
    E: SubsystemEngine,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = Some(stream);
    let mut bridge: Option<Bridge> = None;
    let mut open = true;

    while open || bridge.is_some() {
        tokio::select! {
            request = requests.recv(), if open => match request {
                Some(request) => {
                    if let Some(started) = decide(&engine, seq, request, &mut stream) {
                        bridge = Some(started);
                    }
                }
                None => open = false,
            },
            outcome = finish(&mut bridge) => {
                return match outcome {
                    Ok(()) => {
                        info!(channel = seq, "sftp subsystem finished");
                        Ok(())
                    }
                    Err(source) => Err(Error::SubsystemServe { channel: seq, source }),
                };
            }
        }
    }

    debug!(channel = seq, "Channel requests exhausted");
    Ok(())
}

/// Reply to one request, starting the engine if it is the first `sftp` one
fn decide<E, S>(
    engine: &Arc<E>,
    seq: u64,
    request: ChannelRequest,
    stream: &mut Option<S>,
) -> Option<Bridge>
where
    E: SubsystemEngine,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let accept = stream.is_some() && is_sftp_subsystem(&request.kind, &request.payload);
    debug!(channel = seq, kind = %request.kind, accept, "Channel request");
    request.reply(accept);

    if !accept {
        return None;
    }
    let stream = stream.take()?;
    info!(channel = seq, "Starting sftp subsystem");
    let engine = engine.clone();
    Some(async move { engine.serve(stream).await }.boxed())
}

async fn finish(bridge: &mut Option<Bridge>) -> io::Result<()> {
    match bridge {
        Some(running) => running.await,
        None => std::future::pending().await,
    }
}

/// Consume global requests without acting on them
pub async fn discard_requests(mut requests: mpsc::Receiver<GlobalRequest>) {
    while let Some(request) = requests.recv().await {
        trace!(kind = %request.kind, want_reply = request.wants_reply(), "Discarding global request");
        request.discard();
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    joined?
}

async fn drain(handlers: &mut JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = handlers.join_next().await {
        flatten(joined)?;
    }
    Ok(())
}
