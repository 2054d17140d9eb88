use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use certdesk::client::TicketSource;
use certdesk::error::{Error, Result};
use certdesk::intake::{IntakeBridge, Submitted};
use certdesk::model::*;
use certdesk::store::{MemoryRepository, TicketStore, TransitionRequest};

fn draft(name: &str) -> NewTicket {
    NewTicket::new(PersonType::Organization, "e-CNPJ A1", name, "12.345.678/0001-90")
        .email("contato@example.com")
}

fn offline_store() -> (Arc<MemoryRepository>, Arc<TicketStore>) {
    let repo = Arc::new(MemoryRepository::new());
    let store = Arc::new(TicketStore::new(repo.clone()));
    (repo, store)
}

/// Store whose create acknowledgement can be lost after the write lands.
struct LostAck {
    store: Arc<TicketStore>,
    lose_ack: AtomicBool,
}

#[async_trait]
impl TicketSource for LostAck {
    async fn list(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        self.store.list(filter).await
    }

    async fn get(&self, id: TicketId) -> Result<Ticket> {
        self.store.get(id).await
    }

    async fn find_by_code(&self, code: &TicketCode) -> Result<Option<Ticket>> {
        self.store.find_by_code(code).await
    }

    async fn create(&self, draft: NewTicket) -> Result<Ticket> {
        let ticket = self.store.create(draft).await?;
        if self.lose_ack.swap(false, Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("connection reset".into()));
        }
        Ok(ticket)
    }

    async fn generate_code(&self) -> Result<TicketCode> {
        self.store.generate_code().await
    }

    async fn apply_transition(&self, id: TicketId, req: TransitionRequest) -> Result<Ticket> {
        Ok(self.store.apply_transition(id, req).await?.ticket)
    }

    async fn annotate(&self, id: TicketId, author: &str, message: &str) -> Result<Ticket> {
        self.store.annotate(id, author, message, None).await
    }
}

#[tokio::test]
async fn online_submit_creates_with_preallocated_code() {
    let (_, store) = offline_store();
    let bridge = IntakeBridge::new(store.clone());

    let Submitted::Created(ticket) = bridge.submit(draft("ACME Ltda")).await.unwrap() else {
        panic!("expected immediate creation");
    };
    assert_eq!(ticket.status, Status::Geral);
    assert_eq!(ticket.code.as_str(), "TK-001");
    assert!(bridge.pending().await.is_empty());
}

#[tokio::test]
async fn outage_queues_then_flush_creates() {
    let (repo, store) = offline_store();
    let bridge = IntakeBridge::new(store.clone());

    repo.set_available(false);
    let Submitted::Queued { id, code } = bridge.submit(draft("ACME Ltda")).await.unwrap() else {
        panic!("expected the draft to be queued");
    };
    assert!(code.is_none());
    assert_eq!(bridge.pending().await.len(), 1);

    // Still down: nothing lost, nothing created.
    let report = bridge.flush().await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.remaining, 1);

    repo.set_available(true);
    let report = bridge.flush().await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert_eq!(report.created[0].id, id);
    assert_eq!(report.remaining, 0);
    assert!(bridge.pending().await.is_empty());
    assert_eq!(store.get(id).await.unwrap().history.len(), 0);
}

#[tokio::test]
async fn lost_acknowledgement_is_reconciled_not_duplicated() {
    let (_, store) = offline_store();
    let source = Arc::new(LostAck {
        store: store.clone(),
        lose_ack: AtomicBool::new(true),
    });
    let bridge = IntakeBridge::new(source);

    let Submitted::Queued { id, code } = bridge.submit(draft("ACME Ltda")).await.unwrap() else {
        panic!("expected the draft to be queued");
    };
    assert!(code.is_some());

    let report = bridge.flush().await.unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.reconciled.len(), 1);
    assert_eq!(report.reconciled[0].id, id);
    assert_eq!(store.list(&TicketFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn taken_code_is_dropped_and_store_assigns_a_new_one() {
    let (repo, store) = offline_store();
    let bridge = IntakeBridge::new(store.clone());

    repo.set_available(false);
    let queued = draft("ACME Ltda").with_code(TicketCode::from_seq(1));
    let Submitted::Queued { id, .. } = bridge.submit(queued).await.unwrap() else {
        panic!("expected the draft to be queued");
    };

    repo.set_available(true);
    let other = store.create(draft("Other Co")).await.unwrap();
    assert_eq!(other.code.as_str(), "TK-001");

    let report = bridge.flush().await.unwrap();
    assert_eq!(report.created.len(), 1);
    let created = &report.created[0];
    assert_eq!(created.id, id);
    assert_ne!(created.code, other.code);
}

#[tokio::test]
async fn invalid_draft_is_refused_up_front() {
    let (repo, store) = offline_store();
    let bridge = IntakeBridge::new(store);
    repo.set_available(false);

    let bad = NewTicket::new(PersonType::Individual, "", "Maria", "123");
    assert!(matches!(bridge.submit(bad).await, Err(Error::Validation(_))));
    assert!(bridge.pending().await.is_empty());
}

#[tokio::test]
async fn outbox_file_survives_restart() {
    let path = std::env::temp_dir().join(format!("certdesk-outbox-{}.json", uuid::Uuid::new_v4()));
    let (repo, store) = offline_store();

    repo.set_available(false);
    let bridge = IntakeBridge::new(store.clone())
        .with_outbox_file(&path)
        .await
        .unwrap();
    let Submitted::Queued { id, .. } = bridge.submit(draft("ACME Ltda")).await.unwrap() else {
        panic!("expected the draft to be queued");
    };
    drop(bridge);

    let restarted = IntakeBridge::new(store.clone())
        .with_outbox_file(&path)
        .await
        .unwrap();
    let pending = restarted.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id(), Some(id));

    repo.set_available(true);
    let report = restarted.flush().await.unwrap();
    assert_eq!(report.created.len(), 1);
    assert!(store.get(id).await.is_ok());

    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(persisted.as_array().unwrap().len(), 0);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn interrupted_outbox_write_leaves_previous_contents_readable() {
    let path = std::env::temp_dir().join(format!("certdesk-outbox-{}.json", uuid::Uuid::new_v4()));
    let temp = std::path::PathBuf::from(format!("{}.tmp", path.display()));
    let (repo, store) = offline_store();

    repo.set_available(false);
    let bridge = IntakeBridge::new(store.clone())
        .with_outbox_file(&path)
        .await
        .unwrap();
    bridge.submit(draft("ACME Ltda")).await.unwrap();
    assert!(!temp.exists(), "temp file is renamed into place");
    drop(bridge);

    // A crash mid-write leaves only a truncated temp file behind.
    std::fs::write(&temp, b"[{\"draft\": {\"perso").unwrap();

    let restarted = IntakeBridge::new(store.clone())
        .with_outbox_file(&path)
        .await
        .unwrap();
    assert_eq!(restarted.pending().await.len(), 1);

    restarted.submit(draft("Beta SA")).await.unwrap();
    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(persisted.as_array().unwrap().len(), 2);
    assert!(!temp.exists());
    let _ = std::fs::remove_file(&path);
}
