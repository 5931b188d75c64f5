//! Frame relay: one task per tunnel.
//!
//! # Data Flow
//! ```text
//! client reader ──→ events (bounded mpsc) ──→ relay loop ──→ upstream writer ──→ upstream sink
//!                         ↑                       │
//! upstream reader ────────┘ (close, error)        └──→ client writer ──→ client sink
//!        │                                                 ↑
//!        └──────────── frames (bounded mpsc) ──────────────┘
//! ```
//!
//! The relay loop owns the [`TunnelSession`], so queueing, forwarding and
//! close propagation are decided in one place, in event order. Each sink has
//! its own writer task fed by a bounded channel, and upstream frames go to the
//! client writer directly. A socket that stops reading only stalls the
//! direction that writes to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::SendError};
use tokio::task::{AbortHandle, JoinHandle};

use crate::error::TunnelError;
use crate::tunnel::frame::{
    CloseInfo, Frame, FrameSink, FrameStream, Inbound, Outbound, UpstreamConnector,
};
use crate::tunnel::session::{ClientFrameAction, TunnelSession, UpstreamPhase};

/// Events buffered between the readers and the relay loop.
const EVENT_BUFFER: usize = 64;
/// Outbound items buffered in front of each socket writer.
const WRITE_BUFFER: usize = 64;

enum RelayEvent {
    Client(Inbound),
    Upstream(Inbound),
    UpstreamOpened(FrameSink),
    UpstreamFailed(TunnelError),
    ClientWriteFailed(TunnelError),
}

/// Counters reported when a tunnel ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub frames_to_upstream: u64,
    pub frames_to_client: u64,
    pub dropped_frames: u64,
    /// Frames still queued when the tunnel closed (undelivered).
    pub residual_pending: usize,
}

/// Shared between the relay loop, the upstream reader and both writers.
#[derive(Debug, Default)]
struct Counters {
    to_upstream: AtomicU64,
    to_client: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn drop_frames(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Upstream,
}

impl Side {
    fn delivered(self, counters: &Counters) -> &AtomicU64 {
        match self {
            Side::Client => &counters.to_client,
            Side::Upstream => &counters.to_upstream,
        }
    }

    fn failed(self, err: TunnelError) -> RelayEvent {
        match self {
            Side::Client => RelayEvent::ClientWriteFailed(err),
            Side::Upstream => RelayEvent::UpstreamFailed(err),
        }
    }
}

/// Handle on a writer task: the loop only ever enqueues.
struct Writer {
    tx: mpsc::Sender<Outbound>,
    task: JoinHandle<()>,
}

impl Writer {
    fn spawn(
        sink: FrameSink,
        side: Side,
        counters: Arc<Counters>,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_BUFFER);
        let task = tokio::spawn(write(sink, rx, side, counters, events));
        Self { tx, task }
    }
}

pub struct FrameRelay {
    session: TunnelSession,
    client: Writer,
    upstream: Option<Writer>,
    upstream_task: AbortHandle,
    events_tx: mpsc::Sender<RelayEvent>,
    counters: Arc<Counters>,
    close_grace: Duration,
}

impl FrameRelay {
    /// Relay between an upgraded client socket and an upstream that is still
    /// connecting, until both sides have been closed.
    pub async fn run(
        session: TunnelSession,
        client: (FrameSink, FrameStream),
        connector: UpstreamConnector,
        close_grace: Duration,
    ) -> RelaySummary {
        let (client_sink, client_rx) = client;
        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let counters = Arc::new(Counters::default());

        let client = Writer::spawn(
            client_sink,
            Side::Client,
            Arc::clone(&counters),
            events_tx.clone(),
        );
        let client_reader = tokio::spawn(pump(client_rx, events_tx.clone()));
        let upstream_task = tokio::spawn(connect_and_forward(
            connector,
            events_tx.clone(),
            client.tx.clone(),
            Arc::clone(&counters),
        ));

        let mut relay = FrameRelay {
            session,
            client,
            upstream: None,
            upstream_task: upstream_task.abort_handle(),
            events_tx,
            counters,
            close_grace,
        };

        while !relay.session.is_closed() {
            let Some(event) = events.recv().await else {
                break;
            };
            match event {
                RelayEvent::Client(inbound) => relay.on_client(inbound).await,
                RelayEvent::Upstream(inbound) => relay.on_upstream(inbound).await,
                RelayEvent::UpstreamOpened(sink) => relay.on_upstream_opened(sink).await,
                RelayEvent::UpstreamFailed(err) => relay.on_upstream_failed(err).await,
                RelayEvent::ClientWriteFailed(err) => relay.on_client_write_failed(err).await,
            }
        }

        client_reader.abort();
        upstream_task.abort();
        // Writers report failures through `events`; they must not block on it now.
        drop(events);
        relay.finish().await
    }

    async fn on_client(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame(frame) => match self.session.on_client_frame(frame) {
                ClientFrameAction::Forward(frame) => self.send_upstream(frame).await,
                ClientFrameAction::Queued => {
                    tracing::trace!(
                        pending = self.session.pending_len(),
                        "Queued client frame while upstream connects"
                    );
                }
                ClientFrameAction::Dropped => {
                    self.counters.drop_frames(1);
                    tracing::warn!("Client frame dropped: upstream is not open or connecting");
                }
                ClientFrameAction::Overflow => {
                    tracing::warn!(
                        pending = self.session.pending_len(),
                        "Pending frame limit exceeded, failing tunnel"
                    );
                    self.counters.drop_frames(1);
                    self.close_upstream(None).await;
                    self.close_client(Some(CloseInfo::pending_overflow())).await;
                }
            },
            Inbound::Close(info) => {
                if self.session.close_client() {
                    tracing::debug!(close = ?info, "Client closed");
                    self.close_upstream(info).await;
                }
            }
            Inbound::Error(err) => {
                if self.session.close_client() {
                    tracing::warn!(error = %err, "Client WebSocket error");
                    self.close_upstream(Some(CloseInfo::client_error())).await;
                }
            }
        }
    }

    /// Only terminal upstream items reach the loop; frames go to the client
    /// writer directly.
    async fn on_upstream(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Frame(_) => {}
            Inbound::Close(info) => {
                if self.session.close_upstream() != UpstreamPhase::Done {
                    tracing::debug!(close = ?info, "Upstream closed");
                    self.close_client(info).await;
                }
            }
            Inbound::Error(err) => {
                self.upstream_failed(TunnelError::Upstream(err)).await;
            }
        }
    }

    async fn on_upstream_opened(&mut self, sink: FrameSink) {
        let writer = Writer::spawn(
            sink,
            Side::Upstream,
            Arc::clone(&self.counters),
            self.events_tx.clone(),
        );
        if !self.session.upstream_opened() {
            tracing::debug!("Upstream connected after tunnel closed, discarding");
            let _ = writer.tx.try_send(Outbound::Close(None));
            return;
        }
        tracing::info!(pending = self.session.pending_len(), "Upstream WebSocket connected");
        self.upstream = Some(writer);
        self.drain_pending().await;
    }

    async fn on_upstream_failed(&mut self, err: TunnelError) {
        let discarded = self.session.discard_pending();
        if discarded > 0 {
            tracing::warn!(discarded, "Dropping frames queued for failed upstream");
            self.counters.drop_frames(discarded as u64);
        }
        self.upstream_failed(err).await;
    }

    async fn on_client_write_failed(&mut self, err: TunnelError) {
        if self.session.close_client() {
            tracing::warn!(error = %err, "Failed to write to client");
            self.close_upstream(Some(CloseInfo::client_error())).await;
        }
    }

    /// Flush frames queued during the handshake, oldest first. A stopped
    /// writer puts the frame back and ends the drain.
    async fn drain_pending(&mut self) {
        while let Some(frame) = self.session.next_pending() {
            let Some(upstream) = self.upstream.as_ref() else {
                self.session.requeue_front(frame);
                break;
            };
            if let Err(SendError(out)) = upstream.tx.send(Outbound::Frame(frame)).await {
                if let Outbound::Frame(frame) = out {
                    self.session.requeue_front(frame);
                }
                self.upstream_failed(TunnelError::Upstream("upstream writer stopped".into()))
                    .await;
                break;
            }
        }
    }

    /// Waits for room in the upstream writer: a slow upstream holds back
    /// client frames, nothing else.
    async fn send_upstream(&mut self, frame: Frame) {
        let Some(upstream) = self.upstream.as_ref() else {
            self.counters.drop_frames(1);
            return;
        };
        if upstream.tx.send(Outbound::Frame(frame)).await.is_err() {
            self.counters.drop_frames(1);
            self.upstream_failed(TunnelError::Upstream("upstream writer stopped".into()))
                .await;
        }
    }

    async fn upstream_failed(&mut self, err: TunnelError) {
        if self.session.close_upstream() == UpstreamPhase::Done {
            return;
        }
        tracing::warn!(error = %err, "Upstream WebSocket error");
        self.close_client(Some(CloseInfo::upstream_error())).await;
    }

    /// Tell the upstream side to close, whatever phase it is in.
    async fn close_upstream(&mut self, info: Option<CloseInfo>) {
        match self.session.close_upstream() {
            UpstreamPhase::Connecting => {
                self.upstream_task.abort();
                let discarded = self.session.discard_pending();
                self.counters.drop_frames(discarded as u64);
            }
            UpstreamPhase::Open => {
                if let Some(upstream) = self.upstream.as_ref() {
                    enqueue_close(&upstream.tx, info, self.close_grace, "upstream").await;
                }
            }
            UpstreamPhase::Done => {}
        }
    }

    async fn close_client(&mut self, info: Option<CloseInfo>) {
        if !self.session.close_client() {
            return;
        }
        enqueue_close(&self.client.tx, info, self.close_grace, "client").await;
    }

    /// Let each writer flush and close its sink, bounded by the close grace.
    async fn finish(self) -> RelaySummary {
        let FrameRelay {
            session,
            client,
            upstream,
            counters,
            close_grace,
            ..
        } = self;

        for writer in std::iter::once(client).chain(upstream) {
            let Writer { tx, mut task } = writer;
            drop(tx);
            if tokio::time::timeout(close_grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        RelaySummary {
            frames_to_upstream: counters.to_upstream.load(Ordering::Relaxed),
            frames_to_client: counters.to_client.load(Ordering::Relaxed),
            dropped_frames: counters.dropped.load(Ordering::Relaxed),
            residual_pending: session.pending_len(),
        }
    }
}

async fn enqueue_close(
    tx: &mpsc::Sender<Outbound>,
    info: Option<CloseInfo>,
    grace: Duration,
    side: &'static str,
) {
    match tokio::time::timeout(grace, tx.send(Outbound::Close(info))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::debug!(side, "Writer already stopped, close not sent"),
        Err(_) => tracing::debug!(side, "Writer stalled, close not sent"),
    }
}

/// Drive one sink. Frames after a close are dropped. The first write error
/// is reported once, after the receiver is dropped so the relay never blocks
/// on a dead writer.
async fn write(
    mut sink: FrameSink,
    mut outbound: mpsc::Receiver<Outbound>,
    side: Side,
    counters: Arc<Counters>,
    events: mpsc::Sender<RelayEvent>,
) {
    let mut closed = false;
    while let Some(out) = outbound.recv().await {
        let is_frame = matches!(out, Outbound::Frame(_));
        if closed {
            if is_frame {
                counters.drop_frames(1);
            }
            continue;
        }
        match sink.send(out).await {
            Ok(()) if is_frame => {
                side.delivered(&counters).fetch_add(1, Ordering::Relaxed);
            }
            Ok(()) => closed = true,
            Err(err) => {
                drop(outbound);
                let _ = events.send(side.failed(err)).await;
                return;
            }
        }
    }
    if let Err(err) = sink.close().await {
        tracing::debug!(?side, error = %err, "Failed to close sink");
    }
}

/// Forward the client socket as events, ending after the first terminal
/// item. A stream that ends silently counts as a close without code.
async fn pump(mut rx: FrameStream, events: mpsc::Sender<RelayEvent>) {
    while let Some(inbound) = rx.next().await {
        let terminal = !matches!(inbound, Inbound::Frame(_));
        if events.send(RelayEvent::Client(inbound)).await.is_err() || terminal {
            return;
        }
    }
    let _ = events.send(RelayEvent::Client(Inbound::Close(None))).await;
}

/// Connect upstream, then copy its frames into the client writer. Close and
/// error go to the relay loop, after every frame read before them.
async fn connect_and_forward(
    connector: UpstreamConnector,
    events: mpsc::Sender<RelayEvent>,
    client: mpsc::Sender<Outbound>,
    counters: Arc<Counters>,
) {
    let mut rx = match connector.await {
        Ok((sink, rx)) => {
            if events.send(RelayEvent::UpstreamOpened(sink)).await.is_err() {
                return;
            }
            rx
        }
        Err(err) => {
            let _ = events.send(RelayEvent::UpstreamFailed(err)).await;
            return;
        }
    };

    while let Some(inbound) = rx.next().await {
        match inbound {
            Inbound::Frame(frame) => {
                if client.send(Outbound::Frame(frame)).await.is_err() {
                    counters.drop_frames(1);
                }
            }
            terminal => {
                let _ = events.send(RelayEvent::Upstream(terminal)).await;
                return;
            }
        }
    }
    let _ = events.send(RelayEvent::Upstream(Inbound::Close(None))).await;
}
