//! Sync Client: one operator session's view of the Ticket Store.
//!
//! The view is replaced wholesale on every successful reconciliation and
//! written through to a [`FallbackCache`] as a truncated projection. When the
//! store is unreachable the session keeps its last view, or loads the cached
//! projection if it has none. Store change events wake reconciliation early;
//! the timer stays armed as the fallback path.
//!
//! `pause()` suspends delivery of updates (timer disarmed, events ignored)
//! so an interactive edit is never disturbed. `resume()` fetches once and
//! re-arms.

pub mod cache;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::client::TicketSource;
use crate::error::{Error, Result};
use crate::event::TicketEvent;
use crate::model::{Ticket, TicketFilter, TicketId, queue_order};
use crate::notify::email::truncate;
use crate::store::TransitionRequest;
use crate::telemetry::metrics;

pub use cache::{CacheEntry, CacheError, FallbackCache, MemoryCache};
pub use scheduler::SchedulerHandle;

/// Successively smaller projections tried when the cache pushes back:
/// (history entries kept per ticket, message characters kept).
pub const PROJECTION_LEVELS: [(usize, usize); 3] = [(5, 200), (2, 80), (0, 0)];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub interval: Duration,
    /// Deadline for one reconciliation fetch.
    pub fetch_timeout: Duration,
    pub filter: TicketFilter,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(5),
            filter: TicketFilter::default(),
        }
    }
}

/// Where the current view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewSource {
    /// Nothing fetched yet.
    Empty,
    Live,
    /// Last live view kept while the store is unreachable.
    Stale,
    /// Loaded from the fallback cache projection.
    Cache,
}

#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub tickets: Vec<Ticket>,
    pub source: ViewSource,
    pub as_of: Option<DateTime<Utc>>,
}

impl ViewSnapshot {
    pub fn get(&self, id: TicketId) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    Live(usize),
    Stale,
    Cached(usize),
    /// Store unreachable and nothing to fall back to.
    Unavailable,
    /// Paused; nothing fetched.
    Skipped,
}

impl Reconciled {
    fn label(self) -> &'static str {
        match self {
            Reconciled::Live(_) => "live",
            Reconciled::Stale => "stale",
            Reconciled::Cached(_) => "cached",
            Reconciled::Unavailable => "unavailable",
            Reconciled::Skipped => "skipped",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CachedView {
    tickets: Vec<Ticket>,
}

struct Inner {
    source: Arc<dyn TicketSource>,
    cache: Option<Arc<dyn FallbackCache>>,
    config: SyncConfig,
    view: RwLock<ViewSnapshot>,
    paused: AtomicBool,
    fetches: AtomicU64,
    shutdown: Notify,
}

/// Per-session reconciler. Cheap to share behind an `Arc`.
pub struct SyncClient {
    inner: Arc<Inner>,
    scheduler: Mutex<SchedulerHandle>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(source: Arc<dyn TicketSource>, config: SyncConfig) -> Self {
        let scheduler = SchedulerHandle::new(config.interval);
        Self {
            inner: Arc::new(Inner {
                source,
                cache: None,
                config,
                view: RwLock::new(ViewSnapshot {
                    tickets: Vec::new(),
                    source: ViewSource::Empty,
                    as_of: None,
                }),
                paused: AtomicBool::new(false),
                fetches: AtomicU64::new(0),
                shutdown: Notify::new(),
            }),
            scheduler: Mutex::new(scheduler),
            listener: Mutex::new(None),
        }
    }

    /// Attach a fallback cache. Must be called before `start`.
    pub fn with_cache(mut self, cache: Arc<dyn FallbackCache>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cache = Some(cache);
        }
        self
    }

    /// Fetch once and arm the timer.
    pub async fn start(&self) -> Reconciled {
        let outcome = self.inner.reconcile().await;
        self.arm();
        outcome
    }

    /// Wake reconciliation on store change events, in addition to the timer.
    pub fn subscribe(&self, mut events: broadcast::Receiver<TicketEvent>) {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = inner.shutdown.notified() => return,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if inner.paused.load(Ordering::SeqCst) {
                                continue;
                            }
                            debug!(seq = event.seq, ticket_id = %event.kind.ticket_id(), "change event, reconciling");
                            inner.reconcile().await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            debug!(missed, "change events lagged, reconciling");
                            if !inner.paused.load(Ordering::SeqCst) {
                                inner.reconcile().await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("change stream closed, polling only");
                            return;
                        }
                    },
                }
            }
        });
        let mut listener = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = listener.replace(task) {
            old.abort();
        }
    }

    /// Suspend updates. Idempotent.
    pub fn pause(&self) {
        let mut scheduler = self.scheduler();
        self.inner.paused.store(true, Ordering::SeqCst);
        scheduler.disarm();
    }

    /// Fetch immediately, then re-arm the timer. Idempotent while running.
    pub async fn resume(&self) -> Reconciled {
        if !self.inner.paused.swap(false, Ordering::SeqCst) && self.is_armed() {
            return Reconciled::Skipped;
        }
        let outcome = self.inner.reconcile().await;
        self.arm();
        outcome
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.scheduler().is_armed()
    }

    /// Reconciliation fetches issued so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Reconcile now, regardless of the timer.
    pub async fn refresh(&self) -> Reconciled {
        self.inner.reconcile().await
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        self.inner.view.read().await.clone()
    }

    /// Send a transition to the store; the view changes only once it is
    /// acknowledged.
    pub async fn transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket> {
        let ticket = self.inner.source.apply_transition(id, req).await?;
        self.inner.merge(ticket.clone()).await;
        Ok(ticket)
    }

    /// Append a note through the store, merged on acknowledgement.
    pub async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket> {
        let ticket = self.inner.source.annotate(id, author, message).await?;
        self.inner.merge(ticket.clone()).await;
        Ok(ticket)
    }

    /// Stop timer and event listener.
    pub fn stop(&self) {
        self.scheduler().disarm();
        self.inner.shutdown.notify_waiters();
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            listener.abort();
        }
    }

    /// Arm the timer unless paused. The flag is checked under the scheduler
    /// lock, so a `pause` that lands while a fetch is in flight wins.
    fn arm(&self) {
        let mut scheduler = self.scheduler();
        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        scheduler.arm(move || {
            let inner = Arc::clone(&inner);
            async move {
                inner.reconcile().await;
            }
        });
    }

    fn scheduler(&self) -> std::sync::MutexGuard<'_, SchedulerHandle> {
        self.scheduler.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    async fn reconcile(&self) -> Reconciled {
        if self.paused.load(Ordering::SeqCst) {
            return Reconciled::Skipped;
        }
        let start = Instant::now();
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let fetched = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.source.list(&self.config.filter),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::StorageUnavailable(format!(
                "fetch timed out after {:?}",
                self.config.fetch_timeout
            ))),
        };

        let outcome = match fetched {
            Ok(mut tickets) => {
                tickets.sort_by(queue_order);
                let count = tickets.len();
                self.write_through(&tickets);
                *self.view.write().await = ViewSnapshot {
                    tickets,
                    source: ViewSource::Live,
                    as_of: Some(Utc::now()),
                };
                Reconciled::Live(count)
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "ticket store unreachable, serving fallback view");
                self.fall_back().await
            }
            Err(e) => {
                warn!(error = %e, "reconciliation failed");
                Reconciled::Unavailable
            }
        };

        metrics::sync_reconciliations().add(1, &[KeyValue::new("result", outcome.label())]);
        metrics::operation_duration_ms().record(
            start.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "sync.reconcile")],
        );
        outcome
    }

    async fn fall_back(&self) -> Reconciled {
        let mut view = self.view.write().await;
        if matches!(view.source, ViewSource::Live | ViewSource::Stale) {
            view.source = ViewSource::Stale;
            return Reconciled::Stale;
        }
        match self.read_cache() {
            Some((tickets, stored_at)) => {
                let count = tickets.len();
                *view = ViewSnapshot {
                    tickets,
                    source: ViewSource::Cache,
                    as_of: Some(stored_at),
                };
                Reconciled::Cached(count)
            }
            None => Reconciled::Unavailable,
        }
    }

    fn read_cache(&self) -> Option<(Vec<Ticket>, DateTime<Utc>)> {
        let cache = self.cache.as_ref()?;
        let entry = match cache.get(&self.config.filter.cache_key()) {
            Ok(entry) => entry?,
            Err(e) => {
                debug!(error = %e, "fallback cache read failed");
                return None;
            }
        };
        match serde_json::from_slice::<CachedView>(&entry.bytes) {
            Ok(view) => Some((view.tickets, entry.stored_at)),
            Err(e) => {
                debug!(error = %e, "discarding unreadable cache entry");
                let _ = cache.clear();
                None
            }
        }
    }

    /// Store the smallest projection that fits. Failures degrade silently.
    fn write_through(&self, tickets: &[Ticket]) {
        let Some(cache) = &self.cache else { return };
        let key = self.config.filter.cache_key();

        for (level, (entries, chars)) in PROJECTION_LEVELS.into_iter().enumerate() {
            let bytes = match serde_json::to_vec(&CachedView {
                tickets: project(tickets, entries, chars),
            }) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, "cannot serialize cache projection");
                    return;
                }
            };
            match cache.put(&key, bytes) {
                Ok(()) => {
                    if level > 0 {
                        debug!(level, "cached reduced projection");
                    }
                    return;
                }
                Err(CacheError::QuotaExceeded { needed, quota }) => {
                    debug!(level, needed, quota, "cache quota exceeded, clearing and shrinking");
                    if cache.clear().is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "fallback cache write failed");
                    return;
                }
            }
        }
        debug!("no projection fits the fallback cache, serving authoritative data only");
    }

    /// Fold an acknowledged write into the view. Never regresses a ticket
    /// the view already knows at a later ledger position.
    async fn merge(&self, ticket: Ticket) {
        let mut view = self.view.write().await;
        match view.tickets.iter_mut().find(|t| t.id == ticket.id) {
            Some(existing) if existing.history.len() > ticket.history.len() => {}
            Some(existing) => *existing = ticket,
            None if self.config.filter.matches(&ticket) => view.tickets.push(ticket),
            None => {}
        }
        view.tickets.retain(|t| self.config.filter.matches(t));
        view.tickets.sort_by(queue_order);
    }
}

/// Cache projection: ledger tail of `entries` items, messages cut to `chars`.
pub fn project(tickets: &[Ticket], entries: usize, chars: usize) -> Vec<Ticket> {
    tickets
        .iter()
        .map(|t| {
            let mut t = t.clone();
            let skip = t.history.len().saturating_sub(entries);
            t.history.drain(..skip);
            for entry in &mut t.history {
                entry.message = if chars == 0 {
                    String::new()
                } else {
                    truncate(&entry.message, chars)
                };
            }
            t
        })
        .collect()
}
