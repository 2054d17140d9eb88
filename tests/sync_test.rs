use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certdesk::client::TicketSource;
use certdesk::error::Result;
use certdesk::model::*;
use certdesk::store::{MemoryRepository, TicketStore, TransitionRequest};
use certdesk::sync::{
    FallbackCache, MemoryCache, PROJECTION_LEVELS, Reconciled, SyncClient, SyncConfig,
    ViewSource, project,
};

const PERIOD: Duration = Duration::from_secs(10);

fn config() -> SyncConfig {
    SyncConfig {
        interval: PERIOD,
        ..SyncConfig::default()
    }
}

fn draft(name: &str) -> NewTicket {
    NewTicket::new(PersonType::Individual, "e-CPF A1", name, "123.456.789-00")
}

async fn seeded() -> (Arc<MemoryRepository>, Arc<TicketStore>) {
    let repo = Arc::new(MemoryRepository::new());
    let store = Arc::new(TicketStore::new(repo.clone()));
    store.create(draft("Maria Silva")).await.unwrap();
    store.create(draft("João Souza")).await.unwrap();
    (repo, store)
}

#[tokio::test(start_paused = true)]
async fn one_fetch_per_period() {
    let (_, store) = seeded().await;
    let sync = SyncClient::new(store, config());

    assert_eq!(sync.start().await, Reconciled::Live(2));
    assert_eq!(sync.fetch_count(), 1);

    tokio::time::sleep(PERIOD * 3 + Duration::from_secs(1)).await;
    assert_eq!(sync.fetch_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn pause_is_idempotent_and_resume_arms_once() {
    let (_, store) = seeded().await;
    let sync = SyncClient::new(store, config());
    sync.start().await;

    sync.pause();
    sync.pause();
    assert!(sync.is_paused());
    assert!(!sync.is_armed());

    tokio::time::sleep(PERIOD * 3).await;
    assert_eq!(sync.fetch_count(), 1, "no fetches while paused");

    assert_eq!(sync.resume().await, Reconciled::Live(2));
    assert_eq!(sync.fetch_count(), 2);
    assert!(sync.is_armed());

    // A second resume while running is a no-op.
    assert_eq!(sync.resume().await, Reconciled::Skipped);
    assert_eq!(sync.fetch_count(), 2);

    // Exactly one timer: one fetch per period.
    tokio::time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
    assert_eq!(sync.fetch_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn paused_session_ignores_change_events() {
    let (_, store) = seeded().await;
    let sync = SyncClient::new(store.clone(), config());
    sync.start().await;
    sync.subscribe(store.subscribe());

    sync.pause();
    store.create(draft("Ana Lima")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sync.snapshot().await.tickets.len(), 2);

    sync.resume().await;
    assert_eq!(sync.snapshot().await.tickets.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn change_event_wakes_reconciliation_early() {
    let (_, store) = seeded().await;
    let sync = SyncClient::new(store.clone(), config());
    sync.start().await;
    sync.subscribe(store.subscribe());

    store.create(draft("Ana Lima")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sync.snapshot().await.tickets.len(), 3);
    assert_eq!(sync.fetch_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn outage_keeps_last_view_as_stale() {
    let (repo, store) = seeded().await;
    let sync = SyncClient::new(store, config());
    sync.start().await;

    repo.set_available(false);
    assert_eq!(sync.refresh().await, Reconciled::Stale);
    let view = sync.snapshot().await;
    assert_eq!(view.source, ViewSource::Stale);
    assert_eq!(view.tickets.len(), 2);

    repo.set_available(true);
    assert_eq!(sync.refresh().await, Reconciled::Live(2));
    assert_eq!(sync.snapshot().await.source, ViewSource::Live);
}

#[tokio::test(start_paused = true)]
async fn new_session_falls_back_to_cached_projection() {
    let (repo, store) = seeded().await;
    let cache: Arc<dyn FallbackCache> = Arc::new(MemoryCache::default());

    let first = SyncClient::new(store.clone(), config()).with_cache(cache.clone());
    first.start().await;
    first.stop();

    repo.set_available(false);
    let second = SyncClient::new(store.clone(), config()).with_cache(cache.clone());
    assert_eq!(second.start().await, Reconciled::Cached(2));
    assert_eq!(second.snapshot().await.source, ViewSource::Cache);

    let empty: Arc<dyn FallbackCache> = Arc::new(MemoryCache::default());
    let third = SyncClient::new(store, config()).with_cache(empty);
    assert_eq!(third.start().await, Reconciled::Unavailable);
    assert_eq!(third.snapshot().await.source, ViewSource::Empty);
}

#[tokio::test(start_paused = true)]
async fn small_quota_stores_a_shrunk_projection() {
    let (_, store) = seeded().await;
    let tickets = store.list(&TicketFilter::default()).await.unwrap();
    for t in &tickets {
        for i in 0..8 {
            store
                .annotate(t.id, "ana", &"long note ".repeat(40 + i), None)
                .await
                .unwrap();
        }
    }
    let tickets = store.list(&TicketFilter::default()).await.unwrap();

    let (entries, chars) = PROJECTION_LEVELS[1];
    let fits = serde_json::to_vec(&serde_json::json!({
        "tickets": project(&tickets, entries, chars)
    }))
    .unwrap()
    .len();
    let full = serde_json::to_vec(&serde_json::json!({
        "tickets": project(&tickets, PROJECTION_LEVELS[0].0, PROJECTION_LEVELS[0].1)
    }))
    .unwrap()
    .len();
    assert!(fits < full);

    let cache = Arc::new(MemoryCache::new(fits, MemoryCache::DEFAULT_MAX_AGE));
    let sync = SyncClient::new(store.clone(), config()).with_cache(cache.clone());
    assert_eq!(sync.start().await, Reconciled::Live(2));

    // Live view is authoritative and untouched.
    let live = sync.snapshot().await;
    assert!(live.tickets.iter().all(|t| t.history.len() == 8));

    let entry = cache
        .get(&TicketFilter::default().cache_key())
        .unwrap()
        .expect("a reduced projection is cached");
    let cached: serde_json::Value = serde_json::from_slice(&entry.bytes).unwrap();
    for t in cached["tickets"].as_array().unwrap() {
        assert_eq!(t["history"].as_array().unwrap().len(), entries);
    }
}

#[tokio::test(start_paused = true)]
async fn nothing_fits_still_serves_live_view() {
    let (_, store) = seeded().await;
    let cache = Arc::new(MemoryCache::new(16, MemoryCache::DEFAULT_MAX_AGE));
    let sync = SyncClient::new(store, config()).with_cache(cache.clone());

    assert_eq!(sync.start().await, Reconciled::Live(2));
    assert_eq!(cache.used_bytes(), 0);
}

#[tokio::test(start_paused = true)]
async fn local_write_is_merged_only_after_acknowledgement() {
    let (repo, store) = seeded().await;
    let sync = SyncClient::new(store.clone(), config());
    sync.start().await;
    let id = sync.snapshot().await.tickets[0].id;

    repo.set_available(false);
    let err = sync
        .transition(id, TransitionRequest::new(Status::EmAtendimento, "ana"))
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(sync.snapshot().await.get(id).unwrap().status, Status::Geral);

    repo.set_available(true);
    let t = sync
        .transition(id, TransitionRequest::new(Status::EmAtendimento, "ana"))
        .await
        .unwrap();
    assert_eq!(t.status, Status::EmAtendimento);
    assert_eq!(
        sync.snapshot().await.get(id).unwrap().status,
        Status::EmAtendimento
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_write_leaves_view_untouched() {
    let (_, store) = seeded().await;
    let sync = SyncClient::new(store.clone(), config());
    sync.start().await;
    let id = sync.snapshot().await.tickets[0].id;

    let source: &dyn TicketSource = store.as_ref();
    source
        .apply_transition(id, TransitionRequest::new(Status::Concluido, "bruno"))
        .await
        .unwrap();

    let err = sync
        .transition(id, TransitionRequest::new(Status::EmAtendimento, "ana"))
        .await
        .unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(sync.snapshot().await.get(id).unwrap().status, Status::Geral);

    sync.refresh().await;
    assert_eq!(sync.snapshot().await.get(id).unwrap().status, Status::Concluido);
}

#[test]
fn projection_keeps_ledger_tail() {
    let mut t = Ticket::from_draft(TicketId::new(), TicketCode::from_seq(1), draft("Maria"));
    for i in 0..4 {
        let note = format!("note {i} {}", "x".repeat(300));
        certdesk::ledger::append(
            &mut t,
            certdesk::ledger::EntryDraft::new("ana", Status::Geral).message(note),
        );
    }
    let projected = project(std::slice::from_ref(&t), 2, 10);
    let history = &projected[0].history;
    assert_eq!(history.len(), 2);
    assert!(history[0].message.starts_with("note 2"));
    assert!(history[1].message.chars().count() <= 11);
}

/// Store whose list call takes a while, so calls can land mid-fetch.
struct SlowList(Arc<TicketStore>);

#[async_trait]
impl TicketSource for SlowList {
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        TicketSource::list(self.0.as_ref(), filter).await
    }

    async fn get(&self, id: TicketId) -> Result<Ticket> {
        TicketSource::get(self.0.as_ref(), id).await
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        TicketSource::find_by_code(self.0.as_ref(), code).await
    }

    async fn create(&self, draft: NewTicket) -> Result<Ticket> {
        TicketSource::create(self.0.as_ref(), draft).await
    }

    async fn generate_code(&self) -> Result<TicketCode> {
        TicketSource::generate_code(self.0.as_ref()).await
    }

    async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket> {
        TicketSource::apply_transition(self.0.as_ref(), id, req).await
    }

    async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket> {
        TicketSource::annotate(self.0.as_ref(), id, author, message).await
    }
}

#[tokio::test(start_paused = true)]
async fn pause_during_resume_fetch_keeps_timer_disarmed() {
    let (_, store) = seeded().await;
    let sync = Arc::new(SyncClient::new(Arc::new(SlowList(store)), config()));
    sync.start().await;
    sync.pause();

    let resuming = {
        let sync = Arc::clone(&sync);
        tokio::spawn(async move { sync.resume().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    sync.pause();
    resuming.await.unwrap();

    assert!(sync.is_paused());
    assert!(!sync.is_armed());
    let fetches = sync.fetch_count();
    tokio::time::sleep(PERIOD * 3).await;
    assert_eq!(sync.fetch_count(), fetches, "no timer fetches after pause");
}
