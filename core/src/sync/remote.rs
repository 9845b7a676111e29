//! Memory ⇄ remote replication over a [`Transport`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{PatchBatch, WireMessage};
use super::transport::{Transport, WireSink, WireSource};
use crate::actions::{Action, Dispatcher};
use crate::error::SyncError;
use crate::state::{EntityStateStore, PatchEvent, PatchOrigin, StreamKey, Subscription};
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkOptions {
    /// Pending outbound patch events before falling back to a full resync.
    pub queue_capacity: usize,
    /// Send every stream as a whole-stream replacement right after connecting.
    pub snapshot_on_connect: bool,
    /// Route received `{action, args}` envelopes to the dispatcher.
    pub accept_dispatch: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            snapshot_on_connect: false,
            accept_dispatch: true,
        }
    }
}

#[derive(Default)]
struct LinkCounters {
    sent_batches: AtomicU64,
    received_batches: AtomicU64,
    dispatched: AtomicU64,
    dropped_events: AtomicU64,
    resyncs: AtomicU64,
    closed: AtomicBool,
}

/// Counters of one link for status reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub peer_id: String,
    pub sent_batches: u64,
    pub received_batches: u64,
    pub dispatched: u64,
    pub dropped_events: u64,
    pub resyncs: u64,
    pub closed: bool,
}

/// One replication link to a peer.
///
/// Local patch events are queued (bounded) and pushed as [`PatchBatch`]es;
/// events that originated from this peer are not echoed back. When the queue
/// overflows, the pending events are discarded and every stream is resent as
/// a whole-stream replacement. Received batches are applied with origin
/// `Remote(peer_id)`; received envelopes are dispatched concurrently.
pub struct RemoteLink {
    peer_id: String,
    counters: Arc<LinkCounters>,
    direct_tx: mpsc::UnboundedSender<WireMessage>,
    _subscription: Subscription,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RemoteLink {
    pub fn start(
        store: EntityStateStore,
        dispatcher: Option<Dispatcher>,
        transport: Box<dyn Transport>,
        options: LinkOptions,
    ) -> Self {
        let peer_id = transport.peer_id().to_string();
        let (sink, source) = transport.split();
        let counters = Arc::new(LinkCounters::default());
        let resync = Arc::new(AtomicBool::new(options.snapshot_on_connect));

        let (event_tx, event_rx) = mpsc::channel::<PatchEvent>(options.queue_capacity.max(1));
        let subscription = {
            let own_origin = PatchOrigin::Remote(peer_id.clone());
            let resync = resync.clone();
            let counters = counters.clone();
            let peer = peer_id.clone();
            store.subscribe_patches(move |event| {
                if event.origin == own_origin {
                    return;
                }
                if let Err(mpsc::error::TrySendError::Full(_)) = event_tx.try_send(event.clone()) {
                    counters.dropped_events.fetch_add(1, Ordering::Relaxed);
                    if !resync.swap(true, Ordering::SeqCst) {
                        tracing::warn!(peer = %peer, "push queue full, scheduling full resync");
                    }
                }
            })
        };

        let (direct_tx, direct_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            store.clone(),
            sink,
            event_rx,
            direct_rx,
            resync,
            counters.clone(),
            peer_id.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            store,
            dispatcher.filter(|_| options.accept_dispatch),
            source,
            counters.clone(),
            peer_id.clone(),
        ));

        tracing::info!(peer = %peer_id, "remote link started");
        Self {
            peer_id,
            counters,
            direct_tx,
            _subscription: subscription,
            writer,
            reader,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Ask the peer to run an action.
    pub fn send_action(&self, action: &Action) -> Result<(), SyncError> {
        let envelope = action.to_envelope()?;
        self.direct_tx
            .send(WireMessage::Dispatch(envelope))
            .map_err(|_| SyncError::ChannelClosed(self.peer_id.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.counters.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }

    pub fn report(&self) -> LinkReport {
        let c = &self.counters;
        LinkReport {
            peer_id: self.peer_id.clone(),
            sent_batches: c.sent_batches.load(Ordering::Relaxed),
            received_batches: c.received_batches.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped_events: c.dropped_events.load(Ordering::Relaxed),
            resyncs: c.resyncs.load(Ordering::Relaxed),
            closed: self.is_closed(),
        }
    }

    /// Wait until the peer closes its side.
    pub async fn closed(&mut self) {
        let _ = (&mut self.reader).await;
    }
}

impl Drop for RemoteLink {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}

async fn write_loop(
    store: EntityStateStore,
    mut sink: Box<dyn WireSink>,
    mut events: mpsc::Receiver<PatchEvent>,
    mut direct: mpsc::UnboundedReceiver<WireMessage>,
    resync: Arc<AtomicBool>,
    counters: Arc<LinkCounters>,
    peer_id: String,
) {
    loop {
        if resync.swap(false, Ordering::SeqCst) {
            // Everything still queued is covered by the snapshot.
            while events.try_recv().is_ok() {}
            counters.resyncs.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %peer_id, "sending full resync");
            for stream in StreamKey::all() {
                let msg = WireMessage::Patches(PatchBatch::resync(&store, stream));
                if let Err(e) = sink.send(&msg).await {
                    tracing::warn!(peer = %peer_id, error = %e, "remote push failed");
                    counters.closed.store(true, Ordering::SeqCst);
                    return;
                }
                counters.sent_batches.fetch_add(1, Ordering::Relaxed);
            }
            continue;
        }

        let msg = tokio::select! {
            biased;
            Some(msg) = direct.recv() => msg,
            event = events.recv() => match event {
                Some(event) => WireMessage::Patches(PatchBatch::from_event(&event)),
                None => break,
            },
        };

        if let Err(e) = sink.send(&msg).await {
            tracing::warn!(peer = %peer_id, error = %e, "remote push failed");
            counters.closed.store(true, Ordering::SeqCst);
            return;
        }
        if matches!(msg, WireMessage::Patches(_)) {
            counters.sent_batches.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn read_loop(
    store: EntityStateStore,
    dispatcher: Option<Dispatcher>,
    mut source: Box<dyn WireSource>,
    counters: Arc<LinkCounters>,
    peer_id: String,
) {
    let origin = PatchOrigin::Remote(peer_id.clone());
    loop {
        let msg = match source.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer_id, error = %e, "remote receive failed");
                break;
            }
        };

        match msg {
            WireMessage::Patches(batch) => {
                counters.received_batches.fetch_add(1, Ordering::Relaxed);
                match batch.apply(&store, origin.clone()) {
                    Ok(applied) => tracing::trace!(
                        peer = %peer_id,
                        stream = %batch.stream(),
                        applied,
                        "applied remote patches"
                    ),
                    Err(e) => tracing::warn!(
                        peer = %peer_id,
                        stream = %batch.stream(),
                        error = %e,
                        "rejected remote patches"
                    ),
                }
            }
            WireMessage::Dispatch(envelope) => {
                let Some(dispatcher) = dispatcher.clone() else {
                    tracing::warn!(peer = %peer_id, action = %envelope.action, "ignoring remote dispatch");
                    continue;
                };
                counters.dispatched.fetch_add(1, Ordering::Relaxed);
                let peer = peer_id.clone();
                tokio::spawn(async move {
                    let name = envelope.action.clone();
                    match dispatcher.dispatch_wire(&name, envelope.args).await {
                        Ok(outcome) => {
                            tracing::debug!(peer = %peer, action = %name, outcome = ?outcome, "remote action done")
                        }
                        Err(e) => {
                            tracing::warn!(peer = %peer, action = %name, error = %e, "remote action rejected")
                        }
                    }
                });
            }
        }
    }
    counters.closed.store(true, Ordering::SeqCst);
    store.forget_peer(&peer_id);
    tracing::info!(peer = %peer_id, "remote link closed");
}

/// Set of live links sharing one store.
#[derive(Clone)]
pub struct RemoteHub {
    store: EntityStateStore,
    dispatcher: Option<Dispatcher>,
    options: LinkOptions,
    links: Arc<Mutex<Vec<RemoteLink>>>,
}

impl RemoteHub {
    pub fn new(store: EntityStateStore, dispatcher: Option<Dispatcher>, options: LinkOptions) -> Self {
        Self {
            store,
            dispatcher,
            options,
            links: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Start a link over `transport`; returns the peer id.
    pub fn attach(&self, transport: Box<dyn Transport>) -> String {
        let link = RemoteLink::start(
            self.store.clone(),
            self.dispatcher.clone(),
            transport,
            self.options,
        );
        let peer_id = link.peer_id().to_string();
        let mut links = lock(&self.links);
        links.retain(|l| !l.is_closed());
        links.push(link);
        peer_id
    }

    pub fn reports(&self) -> Vec<LinkReport> {
        lock(&self.links).iter().map(RemoteLink::report).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.links).iter().filter(|l| !l.is_closed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every link.
    pub fn close_all(&self) {
        lock(&self.links).clear();
    }
}
