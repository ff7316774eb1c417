// ========================================================================================
//
//                     THE SLIDING GENOTYPE WINDOW: BUFFERING & DELIVERY
//
// ========================================================================================
//
// One forward-only stream feeds many worker threads. Records are delivered in stream
// order through a lock-free queue, and every record stays reachable by position for as
// long as some worker may still ask for its neighbourhood. Pulling from the stream and
// evicting old positions happen in one exclusive section; everything else is lock-free
// or sharded.

use super::stream::{GenotypeRecord, GenotypeStream, StreamError};
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use log::debug;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

pub const DEFAULT_LOADING_FACTOR: f64 = 2.0;
pub const DEFAULT_BATCH_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("genotype stream failed: {0}")]
    Stream(#[from] StreamError),
    #[error("the genotype window is closed")]
    Closed,
    #[error("the exclusive section of the genotype window was poisoned by a panicking thread")]
    Poisoned,
    #[error("invalid window settings: {0}")]
    InvalidSettings(String),
    #[error("contig {0} is not buffered")]
    ContigNotBuffered(String),
    #[error("positions below {low_water} on contig {contig} were evicted (requested {start})")]
    Evicted {
        contig: String,
        start: u32,
        low_water: u32,
    },
    #[error("invalid range {start}-{end}")]
    InvalidRange { start: u32, end: u32 },
}

/// Distances, in base pairs, that the window keeps available around delivered records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSettings {
    /// How far ahead of a delivered record must stay buffered.
    pub upstream: u32,
    /// How far behind a delivered record must stay buffered.
    pub downstream: u32,
    /// Refills top up to `loading_factor × upstream` ahead; eviction waits until
    /// `loading_factor × downstream` of unused trailing margin has built up.
    pub loading_factor: f64,
    /// Records pulled from the stream per refill step.
    pub batch_size: usize,
}

impl WindowSettings {
    pub fn new(upstream: u32, downstream: u32) -> Self {
        Self {
            upstream,
            downstream,
            loading_factor: DEFAULT_LOADING_FACTOR,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_loading_factor(mut self, loading_factor: f64) -> Self {
        self.loading_factor = loading_factor;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn validate(&self) -> Result<(), WindowError> {
        if !(self.loading_factor.is_finite() && self.loading_factor >= 1.0) {
            return Err(WindowError::InvalidSettings(format!(
                "loading factor {} must be finite and at least 1",
                self.loading_factor
            )));
        }
        if self.batch_size == 0 {
            return Err(WindowError::InvalidSettings(
                "batch size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WindowState {
    Uninitialized = 0,
    /// The first record has been pulled.
    Primed = 1,
    /// Records are being delivered.
    Streaming = 2,
    /// The stream returned its last record and the delivery queue is empty.
    Exhausted = 3,
    Closed = 4,
}

impl WindowState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WindowState::Uninitialized,
            1 => WindowState::Primed,
            2 => WindowState::Streaming,
            3 => WindowState::Exhausted,
            _ => WindowState::Closed,
        }
    }
}

/// Predicate deciding which pulled records enter the window.
pub type RecordFilter<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;

struct ContigBuffer<R> {
    // Order in which the stream reached this contig.
    rank: usize,
    records: BTreeMap<u32, Vec<Arc<R>>>,
    high_water: u32,
    low_water: u32,
    // Position → number of delivered records at that position still held by workers.
    pins: BTreeMap<u32, usize>,
}

impl<R> ContigBuffer<R> {
    fn new(rank: usize) -> Self {
        Self {
            rank,
            records: BTreeMap::new(),
            high_water: 0,
            low_water: 0,
            pins: BTreeMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}

struct Feed<S> {
    stream: S,
    // Contig of the last record pulled from the stream.
    current_contig: Option<String>,
    exhausted: bool,
}

/// A concurrent sliding window over one [`GenotypeStream`].
///
/// Workers call [`BufferedGenotypeWindow::next`] to receive records in stream order and
/// [`BufferedGenotypeWindow::records_in_range`] to read the neighbourhood of a record.
pub struct BufferedGenotypeWindow<S: GenotypeStream> {
    feed: Mutex<Feed<S>>,
    queue: SegQueue<Arc<S::Record>>,
    contigs: DashMap<String, ContigBuffer<S::Record>>,
    next_rank: AtomicUsize,
    settings: WindowSettings,
    refill_span: u64,
    evict_slack: u64,
    filter: Option<RecordFilter<S::Record>>,
    state: AtomicU8,
    exhausted: AtomicBool,
    // Records popped from the queue whose position is not pinned yet.
    in_transit: AtomicUsize,
    delivered: AtomicUsize,
}

impl<S: GenotypeStream> fmt::Debug for BufferedGenotypeWindow<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedGenotypeWindow")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .field("buffered", &self.buffered_len())
            .field("delivered", &self.delivered())
            .finish()
    }
}

impl<S: GenotypeStream> BufferedGenotypeWindow<S> {
    pub fn new(stream: S, settings: WindowSettings) -> Result<Self, WindowError> {
        Self::build(stream, settings, None)
    }

    /// Like [`BufferedGenotypeWindow::new`], dropping records for which `filter` returns
    /// false before they are buffered or delivered.
    pub fn with_filter(
        stream: S,
        settings: WindowSettings,
        filter: RecordFilter<S::Record>,
    ) -> Result<Self, WindowError> {
        Self::build(stream, settings, Some(filter))
    }

    fn build(
        stream: S,
        settings: WindowSettings,
        filter: Option<RecordFilter<S::Record>>,
    ) -> Result<Self, WindowError> {
        settings.validate()?;
        let window = Self {
            feed: Mutex::new(Feed {
                stream,
                current_contig: None,
                exhausted: false,
            }),
            queue: SegQueue::new(),
            contigs: DashMap::new(),
            next_rank: AtomicUsize::new(0),
            settings,
            refill_span: (settings.loading_factor * f64::from(settings.upstream)).ceil() as u64,
            evict_slack: (settings.loading_factor * f64::from(settings.downstream)).ceil() as u64,
            filter,
            state: AtomicU8::new(WindowState::Uninitialized as u8),
            exhausted: AtomicBool::new(false),
            in_transit: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        };
        window.prime()?;
        Ok(window)
    }

    fn prime(&self) -> Result<(), WindowError> {
        let mut feed = self.lock_feed()?;
        while self.queue.is_empty() && !feed.exhausted {
            self.pull_batch(&mut feed)?;
        }
        let state = if self.queue.is_empty() {
            WindowState::Exhausted
        } else {
            WindowState::Primed
        };
        self.set_state(state);
        Ok(())
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub fn state(&self) -> WindowState {
        WindowState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WindowState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of records handed out by [`BufferedGenotypeWindow::next`].
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of records currently buffered for range queries.
    pub fn buffered_len(&self) -> usize {
        self.contigs.iter().map(|entry| entry.len()).sum()
    }

    /// `(low_water, high_water)` of a buffered contig.
    pub fn watermarks(&self, contig: &str) -> Option<(u32, u32)> {
        self.contigs
            .get(contig)
            .map(|buffer| (buffer.low_water, buffer.high_water))
    }

    /// Smallest position still buffered on `contig`.
    pub fn min_buffered_position(&self, contig: &str) -> Option<u32> {
        self.contigs
            .get(contig)
            .and_then(|buffer| buffer.records.keys().next().copied())
    }

    fn lock_feed(&self) -> Result<MutexGuard<'_, Feed<S>>, WindowError> {
        self.feed.lock().map_err(|_| WindowError::Poisoned)
    }

    // ------------------------------------------------------------------------------------
    //                                   Delivery
    // ------------------------------------------------------------------------------------

    /// Hands out the earliest undelivered record, then maintains the window around it.
    /// Returns `None` once the stream and the queue are both empty.
    ///
    /// The record's position stays pinned until the returned item is dropped, so its
    /// downstream neighbourhood is not evicted while a worker still uses it.
    pub fn next(&self) -> Result<Option<WindowItem<'_, S>>, WindowError> {
        loop {
            if self.state() == WindowState::Closed {
                return Err(WindowError::Closed);
            }

            self.in_transit.fetch_add(1, Ordering::SeqCst);
            let item = self.queue.pop().map(|record| WindowItem::pin(self, record));
            self.in_transit.fetch_sub(1, Ordering::SeqCst);

            if let Some(item) = item {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                if self.state() == WindowState::Primed {
                    self.set_state(WindowState::Streaming);
                }
                self.check_buffer(item.contig(), item.position())?;
                return Ok(Some(item));
            }

            let mut feed = self.lock_feed()?;
            if !self.queue.is_empty() {
                continue;
            }
            if feed.exhausted {
                if self.state() != WindowState::Closed {
                    self.set_state(WindowState::Exhausted);
                }
                return Ok(None);
            }
            self.pull_batch(&mut feed)?;
        }
    }

    /// Window maintenance for a record just delivered at `(contig, position)`: refill when
    /// the high-water mark is within `upstream`, evict when the trailing margin exceeds
    /// `loading_factor × downstream`. Both checks are repeated under the lock.
    fn check_buffer(&self, contig: &str, position: u32) -> Result<(), WindowError> {
        let Some((needs_refill, needs_eviction)) = self.maintenance_needed(contig, position)
        else {
            return Ok(());
        };
        if !needs_refill && !needs_eviction {
            return Ok(());
        }

        let mut feed = self.lock_feed()?;
        if needs_refill {
            let high_water = self.contigs.get(contig).map(|buffer| buffer.high_water);
            if high_water.is_some_and(|high| self.refill_due(position, high)) {
                let target = u64::from(position) + self.refill_span;
                self.refill_locked(&mut feed, contig, target)?;
            }
        }
        if needs_eviction {
            self.evict_locked(contig);
        }
        Ok(())
    }

    fn refill_due(&self, position: u32, high_water: u32) -> bool {
        !self.exhausted.load(Ordering::Acquire)
            && u64::from(position) + u64::from(self.settings.upstream) >= u64::from(high_water)
    }

    fn eviction_due(&self, buffer: &ContigBuffer<S::Record>) -> bool {
        buffer.pins.keys().next().is_some_and(|&anchor| {
            u64::from(anchor.saturating_sub(buffer.low_water)) > self.evict_slack
        })
    }

    fn maintenance_needed(&self, contig: &str, position: u32) -> Option<(bool, bool)> {
        let buffer = self.contigs.get(contig)?;
        Some((
            self.refill_due(position, buffer.high_water),
            self.eviction_due(&buffer),
        ))
    }

    /// Pulls until the contig's high-water mark passes `target`, the stream moves on to
    /// another contig, or the stream ends. Caller holds the feed lock.
    fn refill_locked(
        &self,
        feed: &mut Feed<S>,
        contig: &str,
        target: u64,
    ) -> Result<(), WindowError> {
        let mut pulled = 0usize;
        loop {
            if feed.exhausted || feed.current_contig.as_deref() != Some(contig) {
                break;
            }
            let high_water = self
                .contigs
                .get(contig)
                .map_or(0, |buffer| u64::from(buffer.high_water));
            if high_water > target {
                break;
            }
            pulled += self.pull_batch(feed)?;
        }
        if pulled > 0 {
            debug!("Window refill on contig {contig} pulled {pulled} records (target {target})");
        }
        Ok(())
    }

    /// Drops entries more than `downstream` behind the smallest pinned position.
    fn evict_locked(&self, contig: &str) {
        // A popped record that is not pinned yet may sit below every pinned position.
        if self.in_transit.load(Ordering::SeqCst) > 0 {
            return;
        }
        let Some(mut buffer) = self.contigs.get_mut(contig) else {
            return;
        };
        if !self.eviction_due(&buffer) {
            return;
        }
        let Some(&anchor) = buffer.pins.keys().next() else {
            return;
        };

        let boundary = anchor.saturating_sub(self.settings.downstream);
        let before = buffer.len();
        let retained = buffer.records.split_off(&boundary);
        buffer.records = retained;
        buffer.low_water = boundary;
        debug!(
            "Window eviction on contig {contig}: dropped {} records below {boundary}",
            before - buffer.len()
        );
    }

    /// Pulls up to one batch from the stream into the buffer and the delivery queue.
    /// Returns the number of records accepted.
    fn pull_batch(&self, feed: &mut Feed<S>) -> Result<usize, WindowError> {
        let mut batch = Vec::with_capacity(self.settings.batch_size);
        while batch.len() < self.settings.batch_size {
            match feed.stream.next_record()? {
                Some(record) => batch.push(record),
                None => {
                    feed.exhausted = true;
                    self.exhausted.store(true, Ordering::Release);
                    break;
                }
            }
        }

        let keep: Vec<bool> = match &self.filter {
            Some(filter) => batch.par_iter().map(|record| filter(record)).collect(),
            None => vec![true; batch.len()],
        };

        let mut accepted = 0;
        for (record, keep) in batch.into_iter().zip(keep) {
            // The stream has moved on even when a record is filtered out.
            if feed.current_contig.as_deref() != Some(record.contig()) {
                feed.current_contig = Some(record.contig().to_string());
            }
            if keep {
                self.insert(record);
                accepted += 1;
            }
        }
        Ok(accepted)
    }

    fn insert(&self, record: S::Record) {
        let record = Arc::new(record);
        let position = record.position();
        {
            let mut buffer = self
                .contigs
                .entry(record.contig().to_string())
                .or_insert_with(|| {
                    ContigBuffer::new(self.next_rank.fetch_add(1, Ordering::Relaxed))
                });
            buffer
                .records
                .entry(position)
                .or_default()
                .push(Arc::clone(&record));
            buffer.high_water = buffer.high_water.max(position);
        }
        self.queue.push(record);
    }

    fn pin_position(&self, contig: &str, position: u32) {
        if let Some(mut buffer) = self.contigs.get_mut(contig) {
            *buffer.pins.entry(position).or_insert(0) += 1;
        }
    }

    fn release_position(&self, contig: &str, position: u32) {
        if let Some(mut buffer) = self.contigs.get_mut(contig) {
            if let Some(count) = buffer.pins.get_mut(&position) {
                *count -= 1;
                if *count == 0 {
                    buffer.pins.remove(&position);
                }
            }
        }
    }

    // ------------------------------------------------------------------------------------
    //                                Range queries
    // ------------------------------------------------------------------------------------

    /// Buffered records of `contig` with `start <= position <= end`, pulling further
    /// records first if `end` lies beyond what the stream has produced for the contig.
    pub fn records_in_range(
        &self,
        contig: &str,
        start: u32,
        end: u32,
    ) -> Result<Vec<Arc<S::Record>>, WindowError> {
        if start > end {
            return Err(WindowError::InvalidRange { start, end });
        }
        let (low_water, high_water) = self
            .watermarks(contig)
            .ok_or_else(|| WindowError::ContigNotBuffered(contig.to_string()))?;
        if start < low_water {
            return Err(WindowError::Evicted {
                contig: contig.to_string(),
                start,
                low_water,
            });
        }
        if end >= high_water && !self.exhausted.load(Ordering::Acquire) {
            let mut feed = self.lock_feed()?;
            self.refill_locked(&mut feed, contig, u64::from(end))?;
        }

        let buffer = self
            .contigs
            .get(contig)
            .ok_or_else(|| WindowError::ContigNotBuffered(contig.to_string()))?;
        Ok(buffer
            .records
            .range(start..=end)
            .flat_map(|(_, records)| records.iter().cloned())
            .collect())
    }

    /// Releases every buffered record of `contig`. Returns how many were dropped.
    /// Records of the contig still waiting in the delivery queue are delivered normally.
    pub fn clear_buffer(&self, contig: &str) -> usize {
        match self.contigs.remove(contig) {
            Some((_, buffer)) => {
                debug!("Cleared window buffer of contig {contig}");
                buffer.len()
            }
            None => 0,
        }
    }

    /// Releases the buffers of contigs the stream reached before `contig`. Call it with the
    /// contig of a record just returned by `next`: the queue is in stream order, so every
    /// record of an earlier contig has already been handed out. Contigs still pinned by a
    /// worker are kept for a later call. Returns the number of records dropped.
    pub fn release_contigs_before(&self, contig: &str) -> usize {
        if self.in_transit.load(Ordering::SeqCst) > 0 || self.contigs.len() < 2 {
            return 0;
        }
        let Some(rank) = self.contigs.get(contig).map(|buffer| buffer.rank) else {
            return 0;
        };
        let finished: Vec<String> = self
            .contigs
            .iter()
            .filter(|entry| entry.rank < rank && entry.pins.is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut released = 0;
        for name in finished {
            if let Some((_, buffer)) = self
                .contigs
                .remove_if(&name, |_, buffer| buffer.pins.is_empty())
            {
                debug!("Released window buffer of finished contig {name}");
                released += buffer.len();
            }
        }
        released
    }

    /// Closes the underlying stream. Further calls to `next` fail.
    pub fn close(&self) -> Result<(), WindowError> {
        let mut feed = self.lock_feed()?;
        self.set_state(WindowState::Closed);
        feed.stream.close()?;
        feed.exhausted = true;
        self.exhausted.store(true, Ordering::Release);
        self.contigs.clear();
        while self.queue.pop().is_some() {}
        Ok(())
    }

    /// Number of records pulled from the underlying stream so far.
    pub fn stream_record_count(&self) -> Result<usize, WindowError> {
        Ok(self.lock_feed()?.stream.record_count())
    }
}

/// A record handed out by the window. Its position stays pinned while the item lives.
pub struct WindowItem<'w, S: GenotypeStream> {
    window: &'w BufferedGenotypeWindow<S>,
    record: Arc<S::Record>,
}

impl<'w, S: GenotypeStream> WindowItem<'w, S> {
    fn pin(window: &'w BufferedGenotypeWindow<S>, record: Arc<S::Record>) -> Self {
        window.pin_position(record.contig(), record.position());
        Self { window, record }
    }

    pub fn record(&self) -> &Arc<S::Record> {
        &self.record
    }
}

impl<S: GenotypeStream> Deref for WindowItem<'_, S> {
    type Target = S::Record;

    fn deref(&self) -> &S::Record {
        &self.record
    }
}

impl<S: GenotypeStream> Drop for WindowItem<'_, S> {
    fn drop(&mut self) {
        self.window
            .release_position(self.record.contig(), self.record.position());
    }
}
