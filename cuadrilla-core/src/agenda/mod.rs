//! The shared agenda: dated, timed plans members can sign up for.
//!
//! Events are addressed by `(date, index)` where the index is the event's
//! position in that day's list. Events are never removed from the list, only
//! deactivated, so indices handed out to chat buttons stay valid.

use chrono::{Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::member::{MemberId, MemberRef};
use crate::store::{Change, Collection, RecordStore};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";
pub const DEFAULT_WINDOW_DAYS: u32 = 14;
pub const DEFAULT_LOOKUP_HORIZON_DAYS: u32 = 30;

/// Aliases accept catalogs written by the first-generation bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(alias = "hora")]
    pub time: String,
    #[serde(alias = "titulo")]
    pub title: String,
    #[serde(default, alias = "asistentes")]
    pub attendees: Vec<MemberRef>,
    #[serde(alias = "creador_id")]
    pub creator_id: MemberId,
    #[serde(default = "default_active", alias = "activo")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Event {
    pub fn has_attendee(&self, member_id: MemberId) -> bool {
        self.attendees.iter().any(|a| a.id == member_id)
    }
}

/// Date → events of that day, insertion order = index order.
pub type Catalog = BTreeMap<NaiveDate, Vec<Event>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub date: NaiveDate,
    pub index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Registered,
    AlreadyRegistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Withdrawal {
    Removed,
    NotRegistered,
}

/// One day of active events, each with its stable index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAgenda {
    pub date: NaiveDate,
    pub events: Vec<(usize, Event)>,
}

/// An event located by reference, returned by member-centric queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventListing {
    pub date: NaiveDate,
    pub index: usize,
    pub event: Event,
}

impl EventListing {
    pub fn event_ref(&self) -> EventRef {
        EventRef {
            date: self.date,
            index: self.index,
        }
    }
}

pub fn parse_date(raw: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| CoreError::invalid(format!("date must be YYYY-MM-DD, got '{raw}'")))
}

pub fn parse_time(raw: &str) -> CoreResult<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .map_err(|_| CoreError::invalid(format!("time must be HH:MM, got '{raw}'")))
}

pub struct AgendaEngine {
    catalog: Collection<Catalog>,
    clock: Arc<dyn Clock>,
    window_days: u32,
    lookup_horizon_days: u32,
}

impl std::fmt::Debug for AgendaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgendaEngine")
            .field("catalog", &self.catalog)
            .field("window_days", &self.window_days)
            .field("lookup_horizon_days", &self.lookup_horizon_days)
            .finish()
    }
}

impl AgendaEngine {
    pub async fn open(store: Arc<dyn RecordStore<Catalog>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog: Collection::open("agenda", store).await,
            clock,
            window_days: DEFAULT_WINDOW_DAYS,
            lookup_horizon_days: DEFAULT_LOOKUP_HORIZON_DAYS,
        }
    }

    pub fn with_horizons(mut self, window_days: u32, lookup_horizon_days: u32) -> Self {
        self.window_days = window_days.max(1);
        self.lookup_horizon_days = lookup_horizon_days.max(1);
        self
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    // --- Mutations ---

    pub async fn create_event(
        &self,
        date: &str,
        time: &str,
        title: &str,
        creator_id: MemberId,
    ) -> CoreResult<EventRef> {
        let date = parse_date(date)?;
        let time = parse_time(time)?;
        let title = title.trim();
        if title.is_empty() {
            return Err(CoreError::invalid("title must not be empty"));
        }

        let event = Event {
            time: time.format(TIME_FORMAT).to_string(),
            title: title.to_string(),
            attendees: Vec::new(),
            creator_id,
            active: true,
        };

        let created = self
            .catalog
            .update(move |catalog| {
                let day = catalog.entry(date).or_default();
                day.push(event);
                Ok(Change::Commit(EventRef {
                    date,
                    index: day.len() - 1,
                }))
            })
            .await?;

        info!(date = %created.date, index = created.index, creator_id = creator_id, title = %title, "Event created");
        Ok(created)
    }

    /// Logical delete. No ownership check; see [`Self::deactivate_owned_event`].
    pub async fn deactivate_event(&self, date: NaiveDate, index: usize) -> CoreResult<Event> {
        let event = self
            .catalog
            .update(move |catalog| {
                let event = event_mut(catalog, date, index)?;
                if !event.active {
                    return Ok(Change::Unchanged(event.clone()));
                }
                event.active = false;
                Ok(Change::Commit(event.clone()))
            })
            .await?;

        info!(date = %date, index = index, title = %event.title, "Event deactivated");
        Ok(event)
    }

    /// Logical delete restricted to the event's creator.
    pub async fn deactivate_owned_event(
        &self,
        date: NaiveDate,
        index: usize,
        requester: MemberId,
    ) -> CoreResult<Event> {
        let event = self
            .catalog
            .update(move |catalog| {
                let event = event_mut(catalog, date, index)?;
                if event.creator_id != requester {
                    return Err(CoreError::Forbidden(format!(
                        "member {requester} did not create this event"
                    )));
                }
                if !event.active {
                    return Ok(Change::Unchanged(event.clone()));
                }
                event.active = false;
                Ok(Change::Commit(event.clone()))
            })
            .await?;

        info!(date = %date, index = index, requester = requester, "Event deactivated by creator");
        Ok(event)
    }

    pub async fn register_attendee(
        &self,
        date: NaiveDate,
        index: usize,
        member: &MemberRef,
    ) -> CoreResult<Registration> {
        let outcome = self
            .catalog
            .update(|catalog| {
                let event = event_mut(catalog, date, index)?;
                if event.has_attendee(member.id) {
                    return Ok(Change::Unchanged(Registration::AlreadyRegistered));
                }
                event.attendees.push(member.clone());
                Ok(Change::Commit(Registration::Registered))
            })
            .await?;

        info!(date = %date, index = index, member_id = member.id, outcome = ?outcome, "Attendee registration");
        Ok(outcome)
    }

    pub async fn unregister_attendee(
        &self,
        date: NaiveDate,
        index: usize,
        member_id: MemberId,
    ) -> CoreResult<Withdrawal> {
        let outcome = self
            .catalog
            .update(move |catalog| {
                let event = event_mut(catalog, date, index)?;
                let before = event.attendees.len();
                event.attendees.retain(|a| a.id != member_id);
                if event.attendees.len() == before {
                    Ok(Change::Unchanged(Withdrawal::NotRegistered))
                } else {
                    Ok(Change::Commit(Withdrawal::Removed))
                }
            })
            .await?;

        info!(date = %date, index = index, member_id = member_id, outcome = ?outcome, "Attendee withdrawal");
        Ok(outcome)
    }

    // --- Queries ---

    pub async fn get_event(&self, date: NaiveDate, index: usize) -> CoreResult<Event> {
        self.catalog
            .read(|catalog| {
                catalog
                    .get(&date)
                    .and_then(|day| day.get(index))
                    .cloned()
                    .ok_or_else(|| missing(date, index))
            })
            .await
    }

    /// Active events between `from` and `to` inclusive. Missing bounds fall
    /// back to the default window anchored at `from` (or today).
    pub async fn list_active_events(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Vec<DayAgenda> {
        let span = Duration::days(i64::from(self.window_days) - 1);
        let (start, end) = match (from, to) {
            (Some(f), Some(t)) => (f, t),
            (Some(f), None) => (f, f + span),
            (None, Some(t)) => (self.today(), t),
            (None, None) => {
                let today = self.today();
                (today, today + span)
            }
        };
        if start > end {
            return Vec::new();
        }

        self.catalog
            .read(|catalog| {
                catalog
                    .range(start..=end)
                    .filter_map(|(date, day)| {
                        let events: Vec<(usize, Event)> = day
                            .iter()
                            .enumerate()
                            .filter(|(_, e)| e.active)
                            .map(|(i, e)| (i, e.clone()))
                            .collect();
                        (!events.is_empty()).then(|| DayAgenda {
                            date: *date,
                            events,
                        })
                    })
                    .collect()
            })
            .await
    }

    pub async fn list_events_for_attendee(
        &self,
        member_id: MemberId,
        horizon_days: Option<u32>,
    ) -> Vec<EventListing> {
        self.scan_horizon(horizon_days, |e| e.has_attendee(member_id))
            .await
    }

    pub async fn list_events_for_creator(
        &self,
        member_id: MemberId,
        horizon_days: Option<u32>,
    ) -> Vec<EventListing> {
        self.scan_horizon(horizon_days, |e| e.creator_id == member_id)
            .await
    }

    async fn scan_horizon(
        &self,
        horizon_days: Option<u32>,
        predicate: impl Fn(&Event) -> bool,
    ) -> Vec<EventListing> {
        let days = horizon_days.unwrap_or(self.lookup_horizon_days).max(1);
        let start = self.today();
        let end = start + Duration::days(i64::from(days) - 1);

        self.catalog
            .read(|catalog| {
                catalog
                    .range(start..=end)
                    .flat_map(|(date, day)| {
                        day.iter()
                            .enumerate()
                            .filter(|(_, e)| e.active && predicate(e))
                            .map(|(index, e)| EventListing {
                                date: *date,
                                index,
                                event: e.clone(),
                            })
                    })
                    .collect()
            })
            .await
    }
}

fn event_mut(catalog: &mut Catalog, date: NaiveDate, index: usize) -> CoreResult<&mut Event> {
    catalog
        .get_mut(&date)
        .and_then(|day| day.get_mut(index))
        .ok_or_else(|| missing(date, index))
}

fn missing(date: NaiveDate, index: usize) -> CoreError {
    CoreError::not_found(format!("event {index} on {date}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn d(raw: &str) -> NaiveDate {
        parse_date(raw).unwrap()
    }

    async fn engine_at(today: &str) -> (AgendaEngine, Arc<MemoryStore<Catalog>>) {
        let store = Arc::new(MemoryStore::new(Catalog::new()));
        let start = d(today).and_hms_opt(12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(Utc.from_utc_datetime(&start)));
        (AgendaEngine::open(store.clone(), clock).await, store)
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let (engine, store) = engine_at("2025-12-20").await;
        assert!(matches!(
            engine.create_event("24/12/2025", "20:00", "Cena", 1).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.create_event("2025-12-24", "8pm", "Cena", 1).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.create_event("2025-12-24", "20:00", "   ", 1).await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn indices_follow_insertion_order() {
        let (engine, _) = engine_at("2025-12-20").await;
        let a = engine.create_event("2025-12-24", "21:00", "Late", 1).await.unwrap();
        let b = engine.create_event("2025-12-24", "09:00", "Early", 1).await.unwrap();
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(engine.get_event(d("2025-12-24"), 1).await.unwrap().title, "Early");
    }

    #[tokio::test]
    async fn unknown_index_is_not_found() {
        let (engine, _) = engine_at("2025-12-20").await;
        engine.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
        let member = MemberRef::new(2, "Luis");
        assert!(engine
            .register_attendee(d("2025-12-24"), 3, &member)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(engine
            .deactivate_event(d("2025-12-25"), 0)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn unregister_reports_not_registered() {
        let (engine, store) = engine_at("2025-12-20").await;
        let ev = engine.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
        let member = MemberRef::new(2, "Luis");
        engine.register_attendee(ev.date, ev.index, &member).await.unwrap();
        let saves = store.save_count();

        assert_eq!(
            engine.unregister_attendee(ev.date, ev.index, 2).await.unwrap(),
            Withdrawal::Removed
        );
        assert_eq!(
            engine.unregister_attendee(ev.date, ev.index, 2).await.unwrap(),
            Withdrawal::NotRegistered
        );
        assert_eq!(store.save_count(), saves + 1);
    }

    #[tokio::test]
    async fn only_creator_may_deactivate_owned_event() {
        let (engine, _) = engine_at("2025-12-20").await;
        let ev = engine.create_event("2025-12-24", "20:00", "Cena", 1).await.unwrap();
        assert!(matches!(
            engine.deactivate_owned_event(ev.date, ev.index, 2).await,
            Err(CoreError::Forbidden(_))
        ));
        let event = engine.deactivate_owned_event(ev.date, ev.index, 1).await.unwrap();
        assert!(!event.active);
    }

    #[tokio::test]
    async fn default_window_is_fourteen_days() {
        let (engine, _) = engine_at("2025-12-01").await;
        engine.create_event("2025-11-30", "20:00", "Yesterday", 1).await.unwrap();
        engine.create_event("2025-12-01", "20:00", "Today", 1).await.unwrap();
        engine.create_event("2025-12-14", "20:00", "Last day", 1).await.unwrap();
        engine.create_event("2025-12-15", "20:00", "Too far", 1).await.unwrap();

        let titles: Vec<String> = engine
            .list_active_events(None, None)
            .await
            .into_iter()
            .flat_map(|day| day.events.into_iter().map(|(_, e)| e.title))
            .collect();
        assert_eq!(titles, vec!["Today", "Last day"]);
    }

    #[tokio::test]
    async fn explicit_range_is_inclusive_and_inverted_range_empty() {
        let (engine, _) = engine_at("2025-12-01").await;
        engine.create_event("2026-01-10", "20:00", "Far", 1).await.unwrap();
        let hit = engine
            .list_active_events(Some(d("2026-01-10")), Some(d("2026-01-10")))
            .await;
        assert_eq!(hit.len(), 1);
        let none = engine
            .list_active_events(Some(d("2026-01-11")), Some(d("2026-01-10")))
            .await;
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn attendee_lookup_uses_horizon() {
        let (engine, _) = engine_at("2025-12-01").await;
        let near = engine.create_event("2025-12-30", "20:00", "Near", 1).await.unwrap();
        let far = engine.create_event("2025-12-31", "20:00", "Far", 1).await.unwrap();
        let member = MemberRef::new(9, "Eva");
        engine.register_attendee(near.date, near.index, &member).await.unwrap();
        engine.register_attendee(far.date, far.index, &member).await.unwrap();

        let default = engine.list_events_for_attendee(9, None).await;
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].event.title, "Near");
        assert_eq!(engine.list_events_for_attendee(9, Some(31)).await.len(), 2);
    }
}
