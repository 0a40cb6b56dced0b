use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use sos_domain::auth::Role;
use sos_domain::dispatch::SosService;
use sos_domain::error::DomainError;
use sos_domain::escalation::{EscalationPolicy, EscalationSweeper};
use sos_domain::fanout::{
    ContactAlert, EmergencyContact, FanoutConfig, FanoutNotifier, ResponderUnit,
};
use sos_domain::geo::{LocationPolicy, LocationSample};
use sos_domain::identity::ActorIdentity;
use sos_domain::ports::BoxFuture;
use sos_domain::ports::contacts::{ContactAlertSender, DeliveryError};
use sos_domain::realtime::{SosUpdateEvent, SosUpdateHub, SubscriptionItem};
use sos_domain::sos::{CreateSosRequest, ResponderUpdate, SosRequest, SosStatus};
use sos_infra::repositories::{
    InMemoryEmergencyContactDirectory, InMemoryResponderDirectory,
    InMemoryResponderNotificationLog, InMemorySosRequestStore,
};

#[derive(Default)]
struct RecordingSender(Mutex<Vec<ContactAlert>>);

impl ContactAlertSender for RecordingSender {
    fn send(&self, alert: &ContactAlert) -> BoxFuture<'_, Result<(), DeliveryError>> {
        let alert = alert.clone();
        Box::pin(async move {
            self.0.lock().unwrap().push(alert);
            Ok(())
        })
    }
}

struct Harness {
    service: SosService,
    notifier: FanoutNotifier,
    directory: InMemoryResponderDirectory,
    contacts: InMemoryEmergencyContactDirectory,
    sender: Arc<RecordingSender>,
}

fn harness() -> Harness {
    let directory = InMemoryResponderDirectory::new();
    let contacts = InMemoryEmergencyContactDirectory::new();
    let sender = Arc::new(RecordingSender::default());
    let service = SosService::new(
        Arc::new(InMemorySosRequestStore::new()),
        SosUpdateHub::new(256),
        LocationPolicy::default(),
    );
    let notifier = FanoutNotifier::new(
        Arc::new(directory.clone()),
        Arc::new(InMemoryResponderNotificationLog::new()),
        Arc::new(contacts.clone()),
        sender.clone(),
        FanoutConfig::default(),
    );
    Harness {
        service,
        notifier,
        directory,
        contacts,
        sender,
    }
}

fn subject(id: &str) -> ActorIdentity {
    ActorIdentity::with_user_id(id)
}

fn responder(id: &str) -> ActorIdentity {
    ActorIdentity::with_user_id(id)
}

fn input(service: &SosService) -> CreateSosRequest {
    CreateSosRequest {
        location: LocationSample {
            latitude: 12.97,
            longitude: 77.59,
            sampled_at_ms: service.now_ms(),
        },
        notes: "collapsed at home".into(),
        correlation_id: "corr".into(),
    }
}

async fn create(h: &Harness, subject_id: &str) -> SosRequest {
    h.service
        .create_request(&subject(subject_id), input(&h.service))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_responders_race_exactly_one_wins() {
    let h = harness();
    let request = create(&h, "subject-s").await;
    assert_eq!(request.location.latitude, 12.97);

    let first = {
        let service = h.service.clone();
        let sos_id = request.sos_id.clone();
        tokio::spawn(async move {
            service
                .accept(&responder("r1"), &Role::Responder, &sos_id)
                .await
        })
    };
    let second = {
        let service = h.service.clone();
        let sos_id = request.sos_id.clone();
        tokio::spawn(async move {
            service
                .accept(&responder("r2"), &Role::Responder, &sos_id)
                .await
        })
    };
    let outcomes = [first.await.unwrap(), second.await.unwrap()];

    let winners: Vec<&SosRequest> = outcomes.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, DomainError::AlreadyClaimed));

    let stored = h
        .service
        .get(&subject("subject-s"), &Role::User, &request.sos_id)
        .await
        .unwrap();
    assert_eq!(stored.claimed_by, winners[0].claimed_by);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn many_concurrent_claims_admit_one() {
    let h = harness();
    let request = create(&h, "subject-1").await;

    let mut handles = Vec::new();
    for n in 0..32 {
        let service = h.service.clone();
        let sos_id = request.sos_id.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("r{n}");
            let result = service.accept(&responder(&id), &Role::Responder, &sos_id).await;
            (id, result)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (id, result) = handle.await.unwrap();
        match result {
            Ok(_) => winners.push(id),
            Err(DomainError::AlreadyClaimed) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = h
        .service
        .get(&subject("subject-1"), &Role::User, &request.sos_id)
        .await
        .unwrap();
    assert_eq!(stored.claimed_by.as_deref(), Some(winners[0].as_str()));

    // The claimant never changes, even on a repeat by the winner.
    let again = h
        .service
        .accept(&responder(&winners[0]), &Role::Responder, &request.sos_id)
        .await
        .unwrap_err();
    assert!(matches!(again, DomainError::AlreadyClaimed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_creates_leave_one_active_request() {
    let h = harness();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        handles.push(tokio::spawn(async move {
            let input = input(&service);
            service.create_request(&subject("subject-2"), input).await
        }));
    }
    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(DomainError::DuplicateActiveRequest) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(created, 1);
}

#[tokio::test]
async fn blocking_statuses_reject_new_requests_until_arrival() {
    let h = harness();
    let request = create(&h, "subject-s").await;
    let r = responder("r1");

    h.service
        .accept(&r, &Role::Responder, &request.sos_id)
        .await
        .unwrap();
    let err = h
        .service
        .create_request(&subject("subject-s"), input(&h.service))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::DuplicateActiveRequest));

    h.service
        .advance(
            &r,
            &Role::Responder,
            &request.sos_id,
            SosStatus::EnRoute,
            ResponderUpdate::default(),
        )
        .await
        .unwrap();
    let err = h
        .service
        .create_request(&subject("subject-s"), input(&h.service))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::DuplicateActiveRequest));

    h.service
        .advance(
            &r,
            &Role::Responder,
            &request.sos_id,
            SosStatus::Arrived,
            ResponderUpdate::default(),
        )
        .await
        .unwrap();
    let next = create(&h, "subject-s").await;
    assert_ne!(next.sos_id, request.sos_id);
}

#[tokio::test]
async fn full_lifecycle_follows_the_chain() {
    let h = harness();
    let subject_id = subject("subject-3");
    let request = create(&h, "subject-3").await;
    let mut subscription = h
        .service
        .subscribe(&subject_id, &Role::User, &request.sos_id)
        .await
        .unwrap();

    let r = responder("r1");
    h.service
        .accept(&r, &Role::Responder, &request.sos_id)
        .await
        .unwrap();
    for next in [SosStatus::EnRoute, SosStatus::Arrived, SosStatus::Completed] {
        h.service
            .advance(&r, &Role::Responder, &request.sos_id, next, ResponderUpdate::default())
            .await
            .unwrap();
    }

    let mut statuses = Vec::new();
    while let Some(item) = subscription.next().await {
        if let SubscriptionItem::Update(SosUpdateEvent::Snapshot { request }) = item {
            statuses.push(request.status);
        }
    }
    assert_eq!(
        statuses,
        vec![
            SosStatus::Initiated,
            SosStatus::Accepted,
            SosStatus::EnRoute,
            SosStatus::Arrived,
            SosStatus::Completed,
        ]
    );

    let err = h
        .service
        .update_location(
            &r,
            &Role::Responder,
            &request.sos_id,
            ResponderUpdate {
                location: Some(sos_domain::geo::GeoPoint::new(12.0, 77.0)),
                estimated_arrival_ms: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidState(SosStatus::Completed)));
}

#[tokio::test]
async fn cancel_only_before_claim() {
    let h = harness();
    let owner = subject("subject-b");

    let request = create(&h, "subject-b").await;
    let err = h
        .service
        .cancel(&subject("someone-else"), &request.sos_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotAuthorized(_)));

    let cancelled = h.service.cancel(&owner, &request.sos_id).await.unwrap();
    assert_eq!(cancelled.status, SosStatus::Cancelled);

    let err = h
        .service
        .accept(&responder("r1"), &Role::Responder, &request.sos_id)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidState(SosStatus::Cancelled)));

    let claimed = create(&h, "subject-b").await;
    h.service
        .accept(&responder("r1"), &Role::Responder, &claimed.sos_id)
        .await
        .unwrap();
    let err = h.service.cancel(&owner, &claimed.sos_id).await.unwrap_err();
    assert!(matches!(err, DomainError::AlreadyClaimed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_versions_never_go_backwards() {
    let h = harness();
    let request = create(&h, "subject-5").await;
    let r = responder("r1");
    h.service
        .accept(&r, &Role::Responder, &request.sos_id)
        .await
        .unwrap();

    let subscription = h
        .service
        .subscribe(&subject("subject-5"), &Role::User, &request.sos_id)
        .await
        .unwrap();
    let reader = tokio::spawn(async move {
        let mut subscription = subscription;
        let mut versions = Vec::new();
        while let Some(item) = subscription.next().await {
            if let SubscriptionItem::Update(event) = item {
                versions.push(event.version());
            }
        }
        versions
    });

    let mut writers = Vec::new();
    for n in 0..20 {
        let service = h.service.clone();
        let sos_id = request.sos_id.clone();
        writers.push(tokio::spawn(async move {
            let update = ResponderUpdate {
                location: Some(sos_domain::geo::GeoPoint::new(12.0 + f64::from(n) * 0.001, 77.0)),
                estimated_arrival_ms: None,
            };
            let _ = service
                .update_location(&responder("r1"), &Role::Responder, &sos_id, update)
                .await;
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    h.service
        .advance(&r, &Role::Responder, &request.sos_id, SosStatus::EnRoute, ResponderUpdate::default())
        .await
        .unwrap();
    h.service
        .advance(&r, &Role::Responder, &request.sos_id, SosStatus::Arrived, ResponderUpdate::default())
        .await
        .unwrap();
    h.service
        .advance(&r, &Role::Responder, &request.sos_id, SosStatus::Completed, ResponderUpdate::default())
        .await
        .unwrap();

    let versions = reader.await.unwrap();
    assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(versions.len() >= 2);
}

#[tokio::test]
async fn skipping_en_route_is_refused() {
    let h = harness();
    let request = create(&h, "subject-c").await;
    let r = responder("r1");
    let accepted = h
        .service
        .accept(&r, &Role::Responder, &request.sos_id)
        .await
        .unwrap();

    let err = h
        .service
        .advance(
            &r,
            &Role::Responder,
            &request.sos_id,
            SosStatus::Arrived,
            ResponderUpdate::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DomainError::InvalidTransition {
            from: SosStatus::Accepted,
            to: SosStatus::Arrived
        }
    ));

    let unchanged = h
        .service
        .get(&subject("subject-c"), &Role::User, &request.sos_id)
        .await
        .unwrap();
    assert_eq!(unchanged, accepted);

    let err = h
        .service
        .advance(
            &responder("r2"),
            &Role::Responder,
            &request.sos_id,
            SosStatus::EnRoute,
            ResponderUpdate::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NotAuthorized(_)));
}

#[tokio::test]
async fn no_responders_still_creates() {
    let h = harness();
    let request = create(&h, "subject-d").await;

    let report = h
        .notifier
        .notify_responders(&request.sos_id, &request.location, h.service.now_ms())
        .await;
    assert_eq!(report.notified, 0);

    let current = h
        .service
        .current_for_subject("subject-d")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SosStatus::Initiated);
}

#[tokio::test]
async fn only_opted_in_contact_is_alerted() {
    let h = harness();
    for (id, notify) in [("c1", true), ("c2", false)] {
        h.contacts
            .upsert(EmergencyContact {
                contact_id: id.into(),
                subject_id: "subject-e".into(),
                name: id.to_uppercase(),
                phone: "+62000".into(),
                notify_on_sos: notify,
            })
            .await;
    }
    let request = create(&h, "subject-e").await;

    let report = h
        .notifier
        .notify_contacts(&subject("subject-e"), &request.sos_id, &request.location)
        .await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(h.sender.0.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn escalation_reaches_responders_who_came_online_later() {
    let h = harness();
    let request = create(&h, "subject-x").await;

    let (responders, _) = h
        .notifier
        .dispatch(&request, &subject("subject-x"), request.created_at_ms)
        .await;
    assert_eq!(responders.notified, 0);

    h.directory
        .set_available(
            ResponderUnit {
                responder_id: "r-late".into(),
                display_name: "Ambulance 7".into(),
            },
            true,
        )
        .await;

    let sweeper = EscalationSweeper::new(
        h.service.clone(),
        h.notifier.clone(),
        EscalationPolicy {
            interval_ms: 1_000,
            max_rounds: 5,
        },
        50,
    );
    let report = sweeper.sweep(request.created_at_ms + 1_500).await.unwrap();
    assert_eq!(report.rebroadcast, 1);
    assert_eq!(report.newly_notified, 1);

    let repeat = sweeper.sweep(request.created_at_ms + 2_500).await.unwrap();
    assert_eq!(repeat.newly_notified, 0);

    let late = sweeper.sweep(request.created_at_ms + 9_000).await.unwrap();
    assert_eq!(late.exhausted, 1);

    let log = h.notifier.list_notifications(&request.sos_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].responder_id, "r-late");

    let current = h
        .service
        .current_for_subject("subject-x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.status, SosStatus::Initiated);
}

#[tokio::test]
async fn exhausted_backlog_does_not_starve_newer_requests() {
    const T0: i64 = 1_700_000_000_000;
    let clock = Arc::new(AtomicI64::new(T0));
    let now = {
        let clock = clock.clone();
        Arc::new(move || clock.load(Ordering::SeqCst))
    };
    let h = harness();
    let service = SosService::new(
        Arc::new(InMemorySosRequestStore::new()),
        SosUpdateHub::new(16),
        LocationPolicy::default(),
    )
    .with_clock(now);
    let notifier = h.notifier.clone();

    let stale = service
        .create_request(&subject("subject-old"), input(&service))
        .await
        .unwrap();
    clock.store(T0 + 20_000, Ordering::SeqCst);
    let fresh = service
        .create_request(&subject("subject-new"), input(&service))
        .await
        .unwrap();

    h.directory
        .set_available(
            ResponderUnit {
                responder_id: "r-late".into(),
                display_name: "Rescue 3".into(),
            },
            true,
        )
        .await;

    let sweeper = EscalationSweeper::new(
        service,
        notifier.clone(),
        EscalationPolicy {
            interval_ms: 1_000,
            max_rounds: 5,
        },
        1,
    );
    let report = sweeper.sweep(T0 + 21_500).await.unwrap();
    assert_eq!(report.exhausted, 1);
    assert_eq!(report.rebroadcast, 1);
    assert_eq!(report.newly_notified, 1);

    let log = notifier.list_notifications(&fresh.sos_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].responder_id, "r-late");
    assert!(
        notifier
            .list_notifications(&stale.sos_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn dropping_a_subscription_releases_its_topic() {
    let h = harness();
    let request = create(&h, "subject-y").await;
    let subscription = h
        .service
        .subscribe(&subject("subject-y"), &Role::User, &request.sos_id)
        .await
        .unwrap();
    assert_eq!(h.service.hub().subscriber_count(&request.sos_id), 1);
    drop(subscription);
    assert_eq!(h.service.hub().topic_count(), 0);
}
