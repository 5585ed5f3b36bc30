//! Test doubles: a scriptable upstream and a recording delivery.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, watch};

use crate::delivery::Delivery;
use crate::error::{RelayError, Result};
use crate::item::{item_url, DestinationId, Item, ItemId, SourceId, StreamEvent};
use crate::upstream::{
    FetchMode, SourceProfile, SourceRef, SourceSummary, Subscription, Upstream,
};

/// Item `id` published by `source`, handle derived from the id.
pub fn item(source: SourceId, id: u64) -> Item {
    let handle = format!("user{}", source.0);
    Item {
        id: ItemId(id),
        source_id: source,
        url: item_url("https://twitter.com", &handle, ItemId(id)),
    }
}

/// Poll `cond` until it holds or a second passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// Drop guard counting live subscriptions.
struct LiveSubscription {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    live: Arc<AtomicUsize>,
}

impl Stream for LiveSubscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct StubUpstream {
    profiles: Mutex<HashMap<String, SourceProfile>>,
    protected: Mutex<HashSet<String>>,
    timelines: Mutex<HashMap<SourceId, Vec<Item>>>,
    senders: Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>,
    opened: Mutex<Vec<Vec<SourceId>>>,
    live: Arc<AtomicUsize>,
    fetches: AtomicUsize,
    failing_opens: AtomicUsize,
    connect_on_open: bool,
}

impl StubUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `Connected` as the first event of every subscription, as real
    /// providers do.
    pub fn connecting() -> Self {
        Self {
            connect_on_open: true,
            ..Self::default()
        }
    }

    pub fn add_source(&self, id: SourceId, handle: &str, latest: Option<u64>) {
        self.profiles.lock().unwrap().insert(
            handle.to_string(),
            SourceProfile {
                id,
                handle: handle.to_string(),
                latest_item: latest.map(ItemId),
            },
        );
    }

    pub fn add_protected(&self, handle: &str) {
        self.protected.lock().unwrap().insert(handle.to_string());
    }

    /// Append published items (any order) to a source's timeline.
    pub fn publish(&self, source: SourceId, ids: &[u64]) {
        let mut timelines = self.timelines.lock().unwrap();
        let timeline = timelines.entry(source).or_default();
        timeline.extend(ids.iter().map(|id| item(source, *id)));
        timeline.sort_by_key(|item| item.id);
    }

    /// Make the next `n` `open_subscription` calls fail.
    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Push an event into every open subscription.
    pub fn emit(&self, event: StreamEvent) {
        self.senders
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Close every open subscription from the provider side.
    pub fn drop_connections(&self) {
        self.senders.lock().unwrap().clear();
    }

    pub fn live_subscriptions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> Vec<Vec<SourceId>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for StubUpstream {
    async fn resolve_source(&self, handle: &str) -> Result<SourceProfile> {
        if self.protected.lock().unwrap().contains(handle) {
            return Err(RelayError::SourceProtected {
                handle: handle.to_string(),
            });
        }
        self.profiles
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or_else(|| RelayError::SourceNotFound {
                handle: handle.to_string(),
            })
    }

    async fn search_sources(&self, query: &str, limit: usize) -> Result<Vec<SourceSummary>> {
        let query = query.to_lowercase();
        let mut hits: Vec<SourceSummary> = self
            .profiles
            .lock()
            .unwrap()
            .values()
            .filter(|p| p.handle.contains(&query))
            .map(|p| SourceSummary {
                id: p.id,
                handle: p.handle.clone(),
                name: p.handle.clone(),
                description: None,
                items: 0,
                followers: 0,
            })
            .collect();
        hits.sort_by(|a, b| a.handle.cmp(&b.handle));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn fetch_timeline(&self, source: &SourceRef, mode: FetchMode) -> Result<Vec<Item>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let id = match source {
            SourceRef::Id(id) => *id,
            SourceRef::Handle(handle) => self.resolve_source(handle).await?.id,
        };

        let mut items = self
            .timelines
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default();
        items.reverse();

        Ok(match mode {
            FetchMode::Since(since) => items.into_iter().filter(|i| i.id > since).collect(),
            FetchMode::Latest(n) => items.into_iter().take(n).collect(),
        })
    }

    async fn open_subscription(&self, sources: &[SourceId]) -> Result<Subscription> {
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(RelayError::upstream("stub refused connection"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.connect_on_open {
            let _ = tx.send(StreamEvent::Connected);
        }
        self.senders.lock().unwrap().push(tx);
        self.opened.lock().unwrap().push(sources.to_vec());
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(Box::pin(LiveSubscription {
            rx,
            live: Arc::clone(&self.live),
        }))
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

pub struct RecordingDelivery {
    sent: Mutex<Vec<(DestinationId, String)>>,
    failing: Mutex<HashSet<DestinationId>>,
    /// While `true`, deliveries wait before recording.
    held: watch::Sender<bool>,
    waiting: AtomicUsize,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self {
            sent: Mutex::default(),
            failing: Mutex::default(),
            held: watch::Sender::new(false),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Block every delivery until [`RecordingDelivery::release`].
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Deliveries currently blocked by [`RecordingDelivery::hold`].
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn fail_for(&self, destination: DestinationId) {
        self.failing.lock().unwrap().insert(destination);
    }

    pub fn recover(&self, destination: DestinationId) {
        self.failing.lock().unwrap().remove(&destination);
    }

    pub fn all(&self) -> Vec<(DestinationId, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Item ids delivered to `destination`, in delivery order.
    pub fn ids_for(&self, destination: DestinationId) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| *d == destination)
            .filter_map(|(_, url)| url.rsplit('/').next()?.parse().ok())
            .collect()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, destination: DestinationId, text: &str) -> Result<()> {
        let mut held = self.held.subscribe();
        let is_held = *held.borrow();
        if is_held {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _ = held.wait_for(|held| !*held).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        if self.failing.lock().unwrap().contains(&destination) {
            return Err(RelayError::delivery(destination, "stub failure"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination, text.to_string()));
        Ok(())
    }
}
