use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use spacesync_core::{
    config::CardMapConfig, geometry::Rect, ids::CardId, model::Card, CoreError, Debouncer,
};
use tracing::{debug, trace};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardMapEntry {
    pub id: CardId,
    pub bounds: Rect,
}

/// Render-culling data: the cards near the viewport, bottom-most first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardMap {
    pub generation: u64,
    pub entries: Vec<CardMapEntry>,
}

impl CardMap {
    pub fn contains(&self, id: CardId) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable input for one rebuild.
#[derive(Debug, Clone)]
struct CardMapRequest {
    generation: u64,
    cards: Vec<Card>,
    viewport: Rect,
    zoom: f64,
}

/// Keeps the cards whose bounds fall within one viewport of the visible
/// area, ordered by z and then by creation order.
pub fn build_card_map(generation: u64, cards: &[Card], viewport: Rect, zoom: f64) -> CardMap {
    let visible = viewport.to_canvas(zoom);
    let area = visible.expand(visible.width, visible.height);

    let mut entries: Vec<(u64, CardMapEntry)> = cards
        .iter()
        .filter_map(|card| {
            let bounds = Rect::of_card(card);
            bounds
                .intersects(&area)
                .then_some((card.z, CardMapEntry { id: card.id, bounds }))
        })
        .collect();
    entries.sort_by_key(|(z, _)| *z);

    CardMap {
        generation,
        entries: entries.into_iter().map(|(_, entry)| entry).collect(),
    }
}

fn run_worker(requests: Receiver<CardMapRequest>, results: Sender<CardMap>) {
    while let Ok(mut request) = requests.recv() {
        // only the newest queued request matters
        while let Ok(newer) = requests.try_recv() {
            request = newer;
        }
        let map = build_card_map(request.generation, &request.cards, request.viewport, request.zoom);
        trace!(generation = map.generation, entries = map.len(), "card map built");
        if results.send(map).is_err() {
            break;
        }
    }
}

/// Rebuilds the card map off the interaction path. Requests are debounced,
/// then handed to a worker thread; results older than the newest request
/// are discarded. Dropping the builder stops the worker.
pub struct CardMapBuilder {
    requests: Option<Sender<CardMapRequest>>,
    results: Receiver<CardMap>,
    worker: Option<JoinHandle<()>>,
    pending: Debouncer<(Vec<Card>, Rect, f64)>,
    issued: u64,
    current: CardMap,
}

impl CardMapBuilder {
    pub fn new(config: &CardMapConfig) -> Result<Self, EngineError> {
        let (request_tx, request_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("card-map".into())
            .spawn(move || run_worker(request_rx, result_tx))
            .map_err(CoreError::from)?;
        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            worker: Some(worker),
            pending: Debouncer::new(config.debounce_ms),
            issued: 0,
            current: CardMap::default(),
        })
    }

    pub fn current(&self) -> &CardMap {
        &self.current
    }

    /// Generation of the most recent request sent to the worker.
    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_pending()
    }

    /// Schedules a rebuild; later calls within the window supersede it.
    pub fn schedule(&mut self, cards: Vec<Card>, viewport: Rect, zoom: f64, now: i64) {
        self.pending.schedule(now, (cards, viewport, zoom));
    }

    /// Sends a due request to the worker and installs the newest finished
    /// map. Returns true when the current map changed.
    pub fn tick(&mut self, now: i64) -> bool {
        if let Some(input) = self.pending.poll(now) {
            self.send(input);
        }
        self.collect()
    }

    /// Sends the pending request immediately, if any.
    pub fn flush(&mut self) {
        if let Some(input) = self.pending.flush() {
            self.send(input);
        }
    }

    /// Blocks until the map for the newest request has arrived or `timeout`
    /// elapses. Returns true when the current map is up to date.
    pub fn wait_for_latest(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.current.generation < self.issued {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results.recv_timeout(remaining) {
                Ok(map) => self.install(map),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.current.generation == self.issued
    }

    fn send(&mut self, (cards, viewport, zoom): (Vec<Card>, Rect, f64)) {
        let Some(requests) = &self.requests else {
            return;
        };
        self.issued += 1;
        let request = CardMapRequest {
            generation: self.issued,
            cards,
            viewport,
            zoom,
        };
        if requests.send(request).is_err() {
            debug!("card map worker is gone");
        }
    }

    fn collect(&mut self) -> bool {
        let before = self.current.generation;
        while let Ok(map) = self.results.try_recv() {
            self.install(map);
        }
        self.current.generation != before
    }

    fn install(&mut self, map: CardMap) {
        if map.generation == self.issued && map.generation > self.current.generation {
            self.current = map;
        } else {
            trace!(generation = map.generation, latest = self.issued, "discarding stale card map");
        }
    }
}

impl Drop for CardMapBuilder {
    fn drop(&mut self) {
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
