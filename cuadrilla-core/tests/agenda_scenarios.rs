//! Agenda behaviour end to end: registration idempotence, logical deletion
//! and the member-centric views.

use chrono::{NaiveDate, TimeZone, Utc};
use std::sync::Arc;

use cuadrilla_core::agenda::{AgendaEngine, Catalog, Registration, Withdrawal};
use cuadrilla_core::clock::ManualClock;
use cuadrilla_core::store::MemoryStore;
use cuadrilla_core::{CoreError, MemberRef};

fn christmas_eve() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, 24).unwrap()
}

async fn engine() -> (AgendaEngine, Arc<MemoryStore<Catalog>>) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 12, 20, 9, 0, 0).unwrap()));
    let store = Arc::new(MemoryStore::new(Catalog::new()));
    (AgendaEngine::open(store.clone(), clock).await, store)
}

#[tokio::test]
async fn christmas_dinner_scenario() {
    let (agenda, store) = engine().await;
    let date = christmas_eve();

    let created = agenda.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
    assert_eq!((created.date, created.index), (date, 0));

    let listed = agenda.list_active_events(None, None).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].date, date);
    assert!(listed[0].events[0].1.attendees.is_empty());

    let luis = MemberRef::new(2, "Luis");
    assert_eq!(agenda.register_attendee(date, 0, &luis).await.unwrap(), Registration::Registered);
    assert_eq!(
        agenda.register_attendee(date, 0, &luis).await.unwrap(),
        Registration::AlreadyRegistered
    );
    let event = agenda.get_event(date, 0).await.unwrap();
    assert_eq!(event.attendees, vec![luis.clone()]);

    assert_eq!(agenda.list_events_for_creator(1, None).await.len(), 1);
    assert_eq!(agenda.list_events_for_attendee(2, None).await.len(), 1);

    agenda.deactivate_event(date, 0).await.unwrap();
    assert!(agenda.list_active_events(None, None).await.is_empty());
    assert!(agenda.list_events_for_creator(1, None).await.is_empty());
    assert!(agenda.list_events_for_attendee(2, None).await.is_empty());

    // The record stays in the catalog, only flagged inactive.
    let persisted = store.snapshot();
    assert_eq!(persisted[&date].len(), 1);
    assert!(!persisted[&date][0].active);
}

#[tokio::test]
async fn concurrent_registrations_add_one_attendee() {
    let (agenda, _) = engine().await;
    let date = christmas_eve();
    agenda.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();

    let luis = MemberRef::new(2, "Luis");
    let (a, b, c) = tokio::join!(
        agenda.register_attendee(date, 0, &luis),
        agenda.register_attendee(date, 0, &luis),
        agenda.register_attendee(date, 0, &luis),
    );
    let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| **o == Registration::Registered).count(), 1);
    assert_eq!(agenda.get_event(date, 0).await.unwrap().attendees.len(), 1);
}

#[tokio::test]
async fn deactivation_keeps_indices_stable() {
    let (agenda, _) = engine().await;
    let date = christmas_eve();
    agenda.create_event("2025-12-24", "13:00", "Vermut", 1).await.unwrap();
    agenda.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
    agenda.create_event("2025-12-24", "23:30", "Copas", 3).await.unwrap();

    agenda.deactivate_event(date, 0).await.unwrap();

    let day = &agenda.list_active_events(Some(date), Some(date)).await[0];
    let indices: Vec<usize> = day.events.iter().map(|(i, _)| *i).collect();
    assert_eq!(indices, vec![1, 2]);

    // Index 0 still resolves to the same, now inactive, event.
    let ana = MemberRef::new(4, "Ana");
    agenda.register_attendee(date, 0, &ana).await.unwrap();
    let vermut = agenda.get_event(date, 0).await.unwrap();
    assert_eq!(vermut.title, "Vermut");
    assert!(!vermut.active);

    agenda.register_attendee(date, 2, &ana).await.unwrap();
    assert_eq!(agenda.get_event(date, 2).await.unwrap().title, "Copas");
    assert_eq!(
        agenda.unregister_attendee(date, 1, ana.id).await.unwrap(),
        Withdrawal::NotRegistered
    );
}

#[tokio::test]
async fn only_creators_delete_through_the_owned_path() {
    let (agenda, _) = engine().await;
    let date = christmas_eve();
    agenda.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();

    let denied = agenda.deactivate_owned_event(date, 0, 2).await;
    assert!(matches!(denied, Err(CoreError::Forbidden(_))));
    assert!(agenda.get_event(date, 0).await.unwrap().active);

    agenda.deactivate_owned_event(date, 0, 1).await.unwrap();
    // Repeating is a no-op, not an error.
    agenda.deactivate_owned_event(date, 0, 1).await.unwrap();
    assert!(!agenda.get_event(date, 0).await.unwrap().active);
}

#[tokio::test]
async fn unknown_references_are_not_found() {
    let (agenda, _) = engine().await;
    let date = christmas_eve();
    let luis = MemberRef::new(2, "Luis");

    assert!(agenda.register_attendee(date, 0, &luis).await.unwrap_err().is_not_found());
    agenda.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
    assert!(agenda.register_attendee(date, 5, &luis).await.unwrap_err().is_not_found());
    assert!(agenda.deactivate_event(date, 1).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn window_defaults_and_inverted_ranges() {
    let (agenda, _) = engine().await;
    agenda.create_event("2025-12-20", "10:00", "Today", 1).await.unwrap();
    agenda.create_event("2026-01-02", "10:00", "Last day of window", 1).await.unwrap();
    agenda.create_event("2026-01-03", "10:00", "Outside window", 1).await.unwrap();

    let titles: Vec<String> = agenda
        .list_active_events(None, None)
        .await
        .into_iter()
        .flat_map(|d| d.events.into_iter().map(|(_, e)| e.title))
        .collect();
    assert_eq!(titles, vec!["Today", "Last day of window"]);

    let from = NaiveDate::from_ymd_opt(2026, 1, 3).unwrap();
    let to = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
    assert!(agenda.list_active_events(Some(from), Some(to)).await.is_empty());
    assert_eq!(agenda.list_active_events(Some(from), None).await.len(), 1);
}
