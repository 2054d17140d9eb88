use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use certdesk::attachment::{AttachmentEncoder, EncodedAttachment};
use certdesk::error::Error;
use certdesk::event::EventKind;
use certdesk::model::*;
use certdesk::notify::{
    ChannelOutcome, ChannelSelection, CompletionNotifier, DispatchReport, NotificationRequest,
};
use certdesk::store::{MemoryRepository, TicketStore, TransitionRequest};

/// Records every call and answers with a fixed report.
struct RecordingNotifier {
    calls: Mutex<Vec<(TicketId, String, Option<EncodedAttachment>, ChannelSelection)>>,
    report: DispatchReport,
}

impl RecordingNotifier {
    fn sending_both() -> Arc<Self> {
        Self::with_report(DispatchReport {
            email: sent(),
            messaging: sent(),
        })
    }

    fn with_report(report: DispatchReport) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            report,
        })
    }

    fn calls(&self) -> Vec<(TicketId, String, Option<EncodedAttachment>, ChannelSelection)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionNotifier for RecordingNotifier {
    async fn notify(&self, request: NotificationRequest<'_>) -> DispatchReport {
        self.calls.lock().unwrap().push((
            request.ticket.id,
            request.message.to_string(),
            request.attachment.cloned(),
            request.channels,
        ));
        let mut report = self.report.clone();
        if !request.channels.email {
            report.email = ChannelOutcome::skipped("not selected");
        }
        if !request.channels.messaging {
            report.messaging = ChannelOutcome::skipped("not selected");
        }
        report
    }
}

fn sent() -> ChannelOutcome {
    ChannelOutcome::Sent {
        provider_id: Some("p-1".into()),
        variant: None,
        attempts: 1,
    }
}

fn failed() -> ChannelOutcome {
    ChannelOutcome::Failed {
        cause: "timeout".into(),
        error: "timed out after 15s".into(),
    }
}

fn draft() -> NewTicket {
    NewTicket::new(PersonType::Individual, "e-CPF A1", "Maria Silva", "123.456.789-00")
        .priority(PriorityTier::Premium)
        .email("maria@example.com")
        .phone("+55 11 99999-0000")
}

#[tokio::test]
async fn create_starts_in_geral_with_empty_history() {
    let store = TicketStore::in_memory();
    let ticket = store.create(draft()).await.unwrap();

    assert_eq!(ticket.status, Status::Geral);
    assert!(ticket.history.is_empty());
    assert_eq!(ticket.code.as_str(), "TK-001");
    assert!(ticket.completed_at.is_none());
    assert_eq!(store.get(ticket.id).await.unwrap(), ticket);
}

#[tokio::test]
async fn create_rejects_missing_contact_fields() {
    let store = TicketStore::in_memory();
    let bad = NewTicket::new(PersonType::Individual, "e-CPF A1", "", "123");
    assert!(matches!(store.create(bad).await, Err(Error::Validation(_))));
}

#[tokio::test]
async fn concurrent_creates_get_distinct_increasing_codes() {
    let store = Arc::new(TicketStore::in_memory());
    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move { store.create(draft()).await }));
    }
    let mut seqs = Vec::new();
    for h in handles {
        seqs.push(h.await.unwrap().unwrap().code.seq().unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn preallocated_code_is_honoured_and_not_reissued() {
    let store = TicketStore::in_memory();
    let code = store.generate_code().await.unwrap();
    let ticket = store.create(draft().with_code(code.clone())).await.unwrap();
    assert_eq!(ticket.code, code);

    let next = store.create(draft()).await.unwrap();
    assert!(next.code.seq() > code.seq());
}

#[tokio::test]
async fn completion_scenario_notifies_with_attachment() {
    let notifier = RecordingNotifier::sending_both();
    let store = TicketStore::in_memory().with_notifier(notifier.clone());

    let ticket = store.create(draft()).await.unwrap();
    let assigned = store
        .apply_transition(
            ticket.id,
            TransitionRequest::new(Status::EmAtendimento, "ana"),
        )
        .await
        .unwrap()
        .ticket;
    assert_eq!(assigned.status, Status::EmAtendimento);
    assert_eq!(assigned.history.len(), 1);
    assert_eq!(assigned.assigned_operator.as_deref(), Some("ana"));
    assert!(assigned.assigned_at.is_some());

    let attachment = AttachmentEncoder::default()
        .encode_bytes("cert.pdf", "application/pdf", b"%PDF-1.4 certificate")
        .unwrap();
    let applied = store
        .apply_transition(
            ticket.id,
            TransitionRequest::new(Status::Concluido, "ana")
                .message("Done")
                .attachment(attachment.clone()),
        )
        .await
        .unwrap();

    let done = applied.ticket;
    assert_eq!(done.status, Status::Concluido);
    assert!(done.completed_at.is_some());
    assert_eq!(done.history.len(), 2);

    let last = done.last_entry().unwrap();
    assert_eq!(last.status_from, Status::EmAtendimento);
    assert_eq!(last.message, "Done");
    assert!(last.flags.email_sent && last.flags.messaging_sent);
    let reference = last.attachment.as_ref().unwrap();
    assert_eq!(reference.name, "cert.pdf");

    let calls = notifier.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, ticket.id);
    assert_eq!(calls[0].1, "Done");
    assert_eq!(calls[0].2.as_ref().unwrap().base64, attachment.base64);
    assert_eq!(calls[0].3, ChannelSelection::ALL);
    assert!(applied.dispatch.unwrap().email.is_sent());

    let stored = store.attachment(&reference.locator).await.unwrap();
    assert_eq!(stored.base64, attachment.base64);
}

#[tokio::test]
async fn channel_failure_still_commits_completion() {
    let notifier = RecordingNotifier::with_report(DispatchReport {
        email: sent(),
        messaging: failed(),
    });
    let store = TicketStore::in_memory().with_notifier(notifier);
    let ticket = store.create(draft()).await.unwrap();

    let applied = store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();

    assert_eq!(applied.ticket.status, Status::Concluido);
    let flags = applied.ticket.last_entry().unwrap().flags;
    assert!(flags.email_sent);
    assert!(!flags.messaging_sent);
    assert!(applied.dispatch.unwrap().messaging.is_failed());
}

#[tokio::test]
async fn illegal_edges_are_rejected_without_side_effects() {
    let notifier = RecordingNotifier::sending_both();
    let store = TicketStore::in_memory().with_notifier(notifier.clone());
    let ticket = store.create(draft()).await.unwrap();

    let err = store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Financeiro, "ana"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: Status::Geral,
            to: Status::Financeiro
        }
    ));

    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();
    let err = store
        .apply_transition(ticket.id, TransitionRequest::new(Status::EmAtendimento, "ana"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: Status::Concluido, .. }));

    let stored = store.get(ticket.id).await.unwrap();
    assert_eq!(stored.history.len(), 1);
    assert_eq!(notifier.calls().len(), 1);
}

#[tokio::test]
async fn unknown_ticket_is_not_found() {
    let store = TicketStore::in_memory();
    let err = store
        .apply_transition(TicketId::new(), TransitionRequest::new(Status::EmOperacao, "ana"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn concurrent_transitions_apply_exactly_one() {
    let store = Arc::new(TicketStore::in_memory());
    let ticket = store.create(draft()).await.unwrap();
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::EmOperacao, "system"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for operator in ["ana", "bruno"] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .apply_transition(
                    ticket.id,
                    TransitionRequest::new(Status::EmAtendimento, operator)
                        .expect(Status::EmOperacao),
                )
                .await
        }));
    }

    let mut applied = 0;
    let mut rejected = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => applied += 1,
            Err(Error::InvalidTransition { .. }) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((applied, rejected), (1, 1));

    let stored = store.get(ticket.id).await.unwrap();
    assert_eq!(stored.history.len(), 2);
    stored.check_invariants().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_ids_unique_across_concurrent_tickets() {
    let store = Arc::new(TicketStore::in_memory());
    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(store.create(draft()).await.unwrap().id);
    }

    let mut handles = Vec::new();
    for &id in &ids {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for n in 0..100 {
                store
                    .annotate(id, "ana", &format!("note {n}"), None)
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    for id in ids {
        let ticket = store.get(id).await.unwrap();
        assert_eq!(ticket.history.len(), 100);
        for entry in &ticket.history {
            assert!(seen.insert(entry.record_id.clone()), "duplicate {:?}", entry.record_id);
        }
    }
    assert_eq!(seen.len(), 1000);
}

#[tokio::test]
async fn stale_expected_status_is_rejected() {
    let store = TicketStore::in_memory();
    let ticket = store.create(draft()).await.unwrap();
    let err = store
        .apply_transition(
            ticket.id,
            TransitionRequest::new(Status::EmAtendimento, "ana").expect(Status::EmOperacao),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: Status::Geral, .. }));
}

#[tokio::test]
async fn replayed_status_matches_current_status() {
    let store = TicketStore::in_memory();
    let ticket = store.create(draft()).await.unwrap();
    let path = [
        Status::EmOperacao,
        Status::EmAtendimento,
        Status::AguardandoInfo,
        Status::EmAtendimento,
        Status::Financeiro,
        Status::EmAtendimento,
        Status::Concluido,
    ];
    for status in path {
        let t = store
            .apply_transition(ticket.id, TransitionRequest::new(status, "ana"))
            .await
            .unwrap()
            .ticket;
        assert_eq!(t.replayed_status(), t.status);
        t.check_invariants().unwrap();
    }
    store.annotate(ticket.id, "ana", "customer called", None).await.unwrap();

    let t = store.get(ticket.id).await.unwrap();
    assert_eq!(t.history.len(), path.len() + 1);
    assert_eq!(t.replayed_status(), Status::Concluido);
    let positions: Vec<_> = t.history.iter().map(|e| e.record_id.position()).collect();
    assert_eq!(positions, (0..t.history.len()).map(Some).collect::<Vec<_>>());
}

#[tokio::test]
async fn annotate_requires_content() {
    let store = TicketStore::in_memory();
    let ticket = store.create(draft()).await.unwrap();
    assert!(matches!(
        store.annotate(ticket.id, "ana", "   ", None).await,
        Err(Error::Validation(_))
    ));
    let t = store.annotate(ticket.id, "ana", "called back", None).await.unwrap();
    let entry = t.last_entry().unwrap();
    assert!(!entry.is_state_change());
    assert_eq!(t.status, Status::Geral);
}

#[tokio::test]
async fn admin_override_reopens_without_notifying() {
    let notifier = RecordingNotifier::sending_both();
    let store = TicketStore::in_memory().with_notifier(notifier.clone());
    let ticket = store.create(draft()).await.unwrap();
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();

    let reopened = store
        .admin_override(ticket.id, Status::EmAtendimento, "admin", "wrong document")
        .await
        .unwrap();
    assert_eq!(reopened.status, Status::EmAtendimento);
    assert!(reopened.completed_at.is_none());
    assert_eq!(reopened.last_entry().unwrap().message, "override: wrong document");
    reopened.check_invariants().unwrap();
    assert_eq!(notifier.calls().len(), 1);

    // Completing again goes through the normal path and notifies again.
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();
    assert_eq!(notifier.calls().len(), 2);
}

#[tokio::test]
async fn admin_override_requires_reason() {
    let store = TicketStore::in_memory();
    let ticket = store.create(draft()).await.unwrap();
    assert!(matches!(
        store.admin_override(ticket.id, Status::Concluido, "admin", "").await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn resend_skips_channels_already_delivered() {
    let notifier = RecordingNotifier::with_report(DispatchReport {
        email: sent(),
        messaging: failed(),
    });
    let store = TicketStore::in_memory().with_notifier(notifier.clone());
    let ticket = store.create(draft()).await.unwrap();
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();

    let (t, report) = store
        .resend_completion(ticket.id, "again", None, false)
        .await
        .unwrap();
    let calls = notifier.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].3,
        ChannelSelection {
            email: false,
            messaging: true
        }
    );
    assert!(matches!(report.email, ChannelOutcome::Skipped { .. }));
    let entry = t.last_entry().unwrap();
    assert!(entry.is_system());
    assert_eq!(entry.status_to, Status::Concluido);
    assert!(entry.message.starts_with("messaging failed"));

    let (_, forced) = store
        .resend_completion(ticket.id, "again", None, true)
        .await
        .unwrap();
    assert!(forced.email.is_sent());
    assert_eq!(notifier.calls()[2].3, ChannelSelection::ALL);
}

#[tokio::test]
async fn resend_with_everything_delivered_is_a_noop() {
    let notifier = RecordingNotifier::sending_both();
    let store = TicketStore::in_memory().with_notifier(notifier.clone());
    let ticket = store.create(draft()).await.unwrap();
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::Concluido, "ana"))
        .await
        .unwrap();

    let (t, report) = store
        .resend_completion(ticket.id, "", None, false)
        .await
        .unwrap();
    assert_eq!(t.history.len(), 1);
    assert!(matches!(report.messaging, ChannelOutcome::Skipped { .. }));
    assert_eq!(notifier.calls().len(), 1);
}

#[tokio::test]
async fn resend_requires_completed_ticket() {
    let store = TicketStore::in_memory().with_notifier(RecordingNotifier::sending_both());
    let ticket = store.create(draft()).await.unwrap();
    assert!(matches!(
        store.resend_completion(ticket.id, "", None, false).await,
        Err(Error::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn outage_surfaces_storage_unavailable() {
    let repo = Arc::new(MemoryRepository::new());
    let store = TicketStore::new(repo.clone()).with_timeout(Duration::from_millis(200));
    let ticket = store.create(draft()).await.unwrap();

    repo.set_available(false);
    let err = store.get(ticket.id).await.unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)));
    assert!(err.is_transient());

    repo.set_available(true);
    assert!(store.get(ticket.id).await.is_ok());
}

#[tokio::test]
async fn list_filters_and_orders_premium_first() {
    let store = TicketStore::in_memory();
    let standard = store
        .create(draft().priority(PriorityTier::Standard))
        .await
        .unwrap();
    let premium = store.create(draft()).await.unwrap();
    store
        .apply_transition(
            standard.id,
            TransitionRequest::new(Status::EmAtendimento, "ana"),
        )
        .await
        .unwrap();

    let all = store.list(&TicketFilter::default()).await.unwrap();
    assert_eq!(all[0].id, premium.id);
    assert_eq!(all[1].id, standard.id);

    let mine = store
        .list(&TicketFilter {
            status: None,
            operator: Some("ana".into()),
        })
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, standard.id);

    let geral = store.list(&TicketFilter::status(Status::Geral)).await.unwrap();
    assert_eq!(geral.len(), 1);
}

#[tokio::test]
async fn committed_changes_are_broadcast() {
    let store = TicketStore::in_memory();
    let mut events = store.subscribe();

    let ticket = store.create(draft()).await.unwrap();
    store
        .apply_transition(ticket.id, TransitionRequest::new(Status::EmOperacao, "system"))
        .await
        .unwrap();

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert!(matches!(first.kind, EventKind::TicketCreated { .. }));
    assert!(matches!(
        second.kind,
        EventKind::StateTransition {
            from: Status::Geral,
            to: Status::EmOperacao,
            ..
        }
    ));
    assert!(second.seq > first.seq);
    assert_eq!(second.kind.ticket_id(), ticket.id);
}
