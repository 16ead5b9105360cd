use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::WAL_CHANNEL_CAPACITY;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::writer::{wal_writer_loop, WalCommand};
use super::*;

const ACTIVE_SLOT_CONSTRAINT: &str = "bookings_active_slot_key";

/// Everything that lives on one court.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub court: Court,
    /// Sorted by `(booking_date, start_time)`.
    pub bookings: Vec<Booking>,
    pub recurring: Vec<RecurringBooking>,
    pub lessons: Vec<LessonSession>,
}

pub type SharedCourtState = Arc<RwLock<CourtState>>;

impl CourtState {
    pub fn new(court: Court) -> Self {
        Self {
            court,
            bookings: Vec::new(),
            recurring: Vec::new(),
            lessons: Vec::new(),
        }
    }

    fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.booking_date, booking.start_time);
        let pos = self
            .bookings
            .partition_point(|b| (b.booking_date, b.start_time) <= key);
        self.bookings.insert(pos, booking);
    }

    /// Bookings dated inside `dates`, any status. Binary search skips the past.
    pub fn bookings_within(&self, dates: DateRange) -> impl Iterator<Item = &Booking> {
        let first = self.bookings.partition_point(|b| b.booking_date < dates.start);
        self.bookings[first..]
            .iter()
            .take_while(move |b| dates.end.is_none_or(|end| b.booking_date <= end))
    }

    pub fn active_bookings(&self, dates: DateRange) -> impl Iterator<Item = &Booking> {
        self.bookings_within(dates).filter(|b| b.status.is_active())
    }

    pub fn scheduled_lessons(&self, dates: DateRange) -> impl Iterator<Item = &LessonSession> {
        self.lessons
            .iter()
            .filter(move |l| l.status == LessonStatus::Scheduled && dates.contains(l.lesson_date))
    }

    fn active_booking_at(&self, date: chrono::NaiveDate, start: SlotTime) -> Option<&Booking> {
        self.active_bookings(DateRange::day(date)).find(|b| b.start_time == start)
    }

    /// Apply a court-scoped event. Caller holds the write lock.
    fn apply(&mut self, event: &Event) {
        match event {
            Event::CourtSaved(court) => self.court = court.clone(),
            Event::BookingCreated(b) => self.insert_booking(b.clone()),
            Event::BookingUpdated(b) => {
                match self.bookings.iter_mut().find(|x| x.id == b.id) {
                    Some(slot) => *slot = b.clone(),
                    None => self.insert_booking(b.clone()),
                }
            }
            Event::SeriesRowCreated(r) => self.recurring.push(r.clone()),
            Event::SeriesRowUpdated(r) => {
                match self.recurring.iter_mut().find(|x| x.id == r.id) {
                    Some(slot) => *slot = r.clone(),
                    None => self.recurring.push(r.clone()),
                }
            }
            Event::LessonCreated(l) => self.lessons.push(l.clone()),
            Event::LessonUpdated(l) => {
                match self.lessons.iter_mut().find(|x| x.id == l.id) {
                    Some(slot) => *slot = l.clone(),
                    None => self.lessons.push(l.clone()),
                }
            }
            Event::UserSaved(_) | Event::CounterAdvanced { .. } | Event::NotificationCreated(_) => {}
        }
    }

    /// Events that rebuild this court from nothing.
    fn snapshot(&self, out: &mut Vec<Event>) {
        out.push(Event::CourtSaved(self.court.clone()));
        out.extend(self.bookings.iter().cloned().map(Event::BookingCreated));
        out.extend(self.recurring.iter().cloned().map(Event::SeriesRowCreated));
        out.extend(self.lessons.iter().cloned().map(Event::LessonCreated));
    }
}

/// Id of the booking/series row/lesson a court-scoped create event introduces.
fn created_entity(event: &Event) -> Option<(Ulid, CourtId)> {
    match event {
        Event::BookingCreated(b) => Some((b.id, b.court_id)),
        Event::SeriesRowCreated(r) => Some((r.id, r.court_id)),
        Event::LessonCreated(l) => Some((l.id, l.court_id)),
        _ => None,
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, events: Vec<Event>) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { events, response: tx })
        .await
        .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Wal(e.to_string()))
}

/// State rebuilt from the WAL before any lock exists.
#[derive(Default)]
struct Replayed {
    courts: BTreeMap<CourtId, CourtState>,
    users: HashMap<Ulid, User>,
    counters: HashMap<CounterScope, u32>,
    notifications: Vec<Notification>,
}

impl Replayed {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::CourtSaved(court) => {
                self.courts
                    .entry(court.id)
                    .and_modify(|state| state.court = court.clone())
                    .or_insert_with(|| CourtState::new(court.clone()));
            }
            Event::UserSaved(user) => {
                self.users.insert(user.id, user.clone());
            }
            Event::CounterAdvanced { scope, value } => {
                let slot = self.counters.entry(*scope).or_insert(0);
                *slot = (*slot).max(*value);
            }
            Event::NotificationCreated(n) => self.notifications.push(n.clone()),
            other => match other.court_id().and_then(|id| self.courts.get_mut(&id)) {
                Some(state) => state.apply(other),
                None => tracing::warn!("replay: dropping event for unknown court"),
            },
        }
    }
}

/// In-process store: per-court state behind async RwLocks, made durable
/// through a group-committed WAL and replayed on open.
pub struct MemoryStore {
    courts: DashMap<CourtId, SharedCourtState>,
    /// Reverse lookup: booking/series row/lesson id → court id.
    entity_to_court: Arc<DashMap<Ulid, CourtId>>,
    users: DashMap<Ulid, User>,
    counters: Mutex<HashMap<CounterScope, u32>>,
    notifications: RwLock<Vec<Notification>>,
    /// Writers hold it shared; compaction holds it exclusively.
    gate: Arc<RwLock<()>>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl MemoryStore {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside
    /// a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut replayed = Replayed::default();
        for event in &events {
            replayed.apply(event);
        }

        let entity_to_court = DashMap::new();
        let courts = DashMap::new();
        for (id, state) in replayed.courts {
            for b in &state.bookings {
                entity_to_court.insert(b.id, id);
            }
            for r in &state.recurring {
                entity_to_court.insert(r.id, id);
            }
            for l in &state.lessons {
                entity_to_court.insert(l.id, id);
            }
            courts.insert(id, Arc::new(RwLock::new(state)));
        }
        tracing::info!(events = events.len(), courts = courts.len(), "store replayed");

        Ok(Self {
            courts,
            entity_to_court: Arc::new(entity_to_court),
            users: replayed.users.into_iter().collect(),
            counters: Mutex::new(replayed.counters),
            notifications: RwLock::new(replayed.notifications),
            gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
        })
    }

    pub fn notify_hub(&self) -> Arc<NotifyHub> {
        self.notify.clone()
    }

    fn court_state(&self, id: CourtId) -> Result<SharedCourtState, StoreError> {
        self.courts
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::MissingCourt(id))
    }

    fn all_court_states(&self) -> Vec<SharedCourtState> {
        let mut entries: Vec<(CourtId, SharedCourtState)> =
            self.courts.iter().map(|e| (*e.key(), e.value().clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, s)| s).collect()
    }

    fn entity_court(&self, id: Ulid) -> Result<CourtId, StoreError> {
        self.entity_to_court
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::MissingRow(id))
    }

    /// WAL-append, apply, notify. Caller holds the court's write lock.
    async fn persist_and_apply(&self, state: &mut CourtState, event: Event) -> Result<(), StoreError> {
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        state.apply(&event);
        if let Some((id, court)) = created_entity(&event) {
            self.entity_to_court.insert(id, court);
        }
        self.notify.send(state.court.id, &event);
        Ok(())
    }

    /// Rewrite the WAL as the minimal event list for the current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _exclusive = self.gate.write().await;

        let mut events = Vec::new();
        for state in self.all_court_states() {
            state.read().await.snapshot(&mut events);
        }
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(Event::UserSaved));
        for (scope, value) in self.counters.lock().await.iter() {
            events.push(Event::CounterAdvanced { scope: *scope, value: *value });
        }
        events.extend(self.notifications.read().await.iter().cloned().map(Event::NotificationCreated));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_counter(&self, scope: CounterScope) -> Result<Option<u32>, StoreError> {
        let _shared = self.gate.read().await;
        let mut counters = self.counters.lock().await;
        let next = counters.get(&scope).copied().unwrap_or(0) + 1;
        wal_append(&self.wal_tx, vec![Event::CounterAdvanced { scope, value: next }]).await?;
        counters.insert(scope, next);
        Ok(Some(next))
    }
}

#[async_trait]
impl NotificationSink for MemoryStore {
    async fn create_notification(&self, notification: Notification) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let mut all = self.notifications.write().await;
        wal_append(&self.wal_tx, vec![Event::NotificationCreated(notification.clone())]).await?;
        all.push(notification);
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self, courts: &[CourtId]) -> Result<Box<dyn Transaction>, StoreError> {
        let gate = self.gate.clone().read_owned().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut ids = courts.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let state = self.court_state(id)?;
            guards.push((id, state.write_owned().await));
        }

        Ok(Box::new(MemoryTxn {
            _gate: gate,
            guards,
            staged: Vec::new(),
            entity_to_court: self.entity_to_court.clone(),
            wal_tx: self.wal_tx.clone(),
            notify: self.notify.clone(),
        }))
    }

    async fn save_court(&self, court: Court) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        if let Some(state) = self.courts.get(&court.id).map(|e| e.value().clone()) {
            let mut guard = state.write().await;
            return self.persist_and_apply(&mut guard, Event::CourtSaved(court)).await;
        }
        let event = Event::CourtSaved(court.clone());
        wal_append(&self.wal_tx, vec![event.clone()]).await?;
        self.courts.insert(court.id, Arc::new(RwLock::new(CourtState::new(court.clone()))));
        self.notify.send(court.id, &event);
        Ok(())
    }

    async fn court(&self, id: CourtId) -> Result<Option<Court>, StoreError> {
        match self.courts.get(&id).map(|e| e.value().clone()) {
            Some(state) => Ok(Some(state.read().await.court.clone())),
            None => Ok(None),
        }
    }

    async fn courts(&self) -> Result<Vec<Court>, StoreError> {
        let mut out = Vec::new();
        for state in self.all_court_states() {
            out.push(state.read().await.court.clone());
        }
        Ok(out)
    }

    async fn save_user(&self, user: User) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        wal_append(&self.wal_tx, vec![Event::UserSaved(user.clone())]).await?;
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn user(&self, id: Ulid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|e| e.value().clone()))
    }

    async fn booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        let Ok(court) = self.entity_court(id) else {
            return Ok(None);
        };
        let state = self.court_state(court)?;
        let guard = state.read().await;
        Ok(guard.bookings.iter().find(|b| b.id == id).cloned())
    }

    async fn active_bookings(&self, court: CourtId, dates: DateRange) -> Result<Vec<Booking>, StoreError> {
        let state = self.court_state(court)?;
        let guard = state.read().await;
        Ok(guard.active_bookings(dates).cloned().collect())
    }

    async fn recurring_rows(&self, court: Option<CourtId>) -> Result<Vec<RecurringBooking>, StoreError> {
        let states = match court {
            Some(id) => vec![self.court_state(id)?],
            None => self.all_court_states(),
        };
        let mut rows = Vec::new();
        for state in states {
            rows.extend(state.read().await.recurring.iter().cloned());
        }
        Ok(rows)
    }

    async fn recurring_row(&self, id: Ulid) -> Result<Option<RecurringBooking>, StoreError> {
        let Ok(court) = self.entity_court(id) else {
            return Ok(None);
        };
        let state = self.court_state(court)?;
        let guard = state.read().await;
        Ok(guard.recurring.iter().find(|r| r.id == id).cloned())
    }

    async fn scheduled_lessons(&self, court: CourtId, dates: DateRange) -> Result<Vec<LessonSession>, StoreError> {
        let state = self.court_state(court)?;
        let guard = state.read().await;
        Ok(guard.scheduled_lessons(dates).cloned().collect())
    }

    async fn lesson(&self, id: Ulid) -> Result<Option<LessonSession>, StoreError> {
        let Ok(court) = self.entity_court(id) else {
            return Ok(None);
        };
        let state = self.court_state(court)?;
        let guard = state.read().await;
        Ok(guard.lessons.iter().find(|l| l.id == id).cloned())
    }

    async fn pending_bookings(&self, ids: Option<&[Ulid]>) -> Result<Vec<Booking>, StoreError> {
        let mut out = Vec::new();
        for state in self.all_court_states() {
            let guard = state.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Pending && b.expired_at.is_none())
                    .filter(|b| ids.is_none_or(|ids| ids.contains(&b.id)))
                    .cloned(),
            );
        }
        Ok(out)
    }

    async fn update_booking(
        &self,
        id: Ulid,
        expected: BookingStatus,
        patch: BookingPatch,
    ) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let state = self.court_state(self.entity_court(id)?)?;
        let mut guard = state.write().await;
        let current = guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .ok_or(StoreError::MissingRow(id))?;
        if current.status != expected {
            return Err(StoreError::StaleRow(id));
        }
        let mut updated = current.clone();
        patch.apply(&mut updated);
        if updated.status.is_active()
            && !expected.is_active()
            && guard.active_booking_at(updated.booking_date, updated.start_time).is_some()
        {
            return Err(StoreError::UniqueViolation {
                constraint: ACTIVE_SLOT_CONSTRAINT,
                court: updated.court_id,
                date: updated.booking_date,
                start: updated.start_time,
            });
        }
        self.persist_and_apply(&mut guard, Event::BookingUpdated(updated.clone())).await?;
        Ok(updated)
    }

    async fn claim_warning(&self, id: Ulid) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let state = self.court_state(self.entity_court(id)?)?;
        let mut guard = state.write().await;
        let current = guard
            .bookings
            .iter()
            .find(|b| b.id == id)
            .ok_or(StoreError::MissingRow(id))?;
        if current.status != BookingStatus::Pending || current.expiration_warning_sent {
            return Err(StoreError::StaleRow(id));
        }
        let mut updated = current.clone();
        updated.expiration_warning_sent = true;
        self.persist_and_apply(&mut guard, Event::BookingUpdated(updated.clone())).await?;
        Ok(updated)
    }

    async fn update_recurring(&self, id: Ulid, patch: SeriesPatch) -> Result<RecurringBooking, StoreError> {
        let _shared = self.gate.read().await;
        let state = self.court_state(self.entity_court(id)?)?;
        let mut guard = state.write().await;
        let mut updated = guard
            .recurring
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::MissingRow(id))?;
        patch.apply(&mut updated);
        self.persist_and_apply(&mut guard, Event::SeriesRowUpdated(updated.clone())).await?;
        Ok(updated)
    }

    async fn update_lesson(
        &self,
        id: Ulid,
        expected: LessonStatus,
        status: LessonStatus,
    ) -> Result<LessonSession, StoreError> {
        let _shared = self.gate.read().await;
        let state = self.court_state(self.entity_court(id)?)?;
        let mut guard = state.write().await;
        let mut updated = guard
            .lessons
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or(StoreError::MissingRow(id))?;
        if updated.status != expected {
            return Err(StoreError::StaleRow(id));
        }
        updated.status = status;
        self.persist_and_apply(&mut guard, Event::LessonUpdated(updated.clone())).await?;
        Ok(updated)
    }

    async fn notifications(&self, user_id: Ulid) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Transaction over a locked set of courts. Writes are staged and reach the
/// WAL and the shared state only on commit.
struct MemoryTxn {
    _gate: OwnedRwLockReadGuard<()>,
    guards: Vec<(CourtId, OwnedRwLockWriteGuard<CourtState>)>,
    staged: Vec<Event>,
    entity_to_court: Arc<DashMap<Ulid, CourtId>>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl MemoryTxn {
    fn state(&self, court: CourtId) -> Result<&CourtState, StoreError> {
        self.guards
            .iter()
            .find(|(id, _)| *id == court)
            .map(|(_, guard)| &**guard)
            .ok_or(StoreError::OutOfScope(court))
    }

    fn stage(&mut self, event: Event) -> Result<(), StoreError> {
        let court = event.court_id().ok_or_else(|| StoreError::Backend("event is not court-scoped".into()))?;
        self.state(court)?;
        self.staged.push(event);
        Ok(())
    }

    /// Last-resort uniqueness check over committed and staged bookings.
    fn check_unique(&self) -> Result<(), StoreError> {
        let mut claimed: Vec<(CourtId, chrono::NaiveDate, SlotTime)> = Vec::new();
        for event in &self.staged {
            let Event::BookingCreated(b) = event else { continue };
            if !b.status.is_active() {
                continue;
            }
            let key = (b.court_id, b.booking_date, b.start_time);
            let taken = claimed.contains(&key)
                || self.state(b.court_id)?.active_booking_at(b.booking_date, b.start_time).is_some();
            if taken {
                return Err(StoreError::UniqueViolation {
                    constraint: ACTIVE_SLOT_CONSTRAINT,
                    court: b.court_id,
                    date: b.booking_date,
                    start: b.start_time,
                });
            }
            claimed.push(key);
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTxn {
    async fn active_bookings(&mut self, court: CourtId, dates: DateRange) -> Result<Vec<Booking>, StoreError> {
        let mut out: Vec<Booking> = self.state(court)?.active_bookings(dates).cloned().collect();
        out.extend(self.staged.iter().filter_map(|e| match e {
            Event::BookingCreated(b)
                if b.court_id == court && b.status.is_active() && dates.contains(b.booking_date) =>
            {
                Some(b.clone())
            }
            _ => None,
        }));
        Ok(out)
    }

    async fn recurring_rows(&mut self, court: CourtId) -> Result<Vec<RecurringBooking>, StoreError> {
        let mut out = self.state(court)?.recurring.clone();
        out.extend(self.staged.iter().filter_map(|e| match e {
            Event::SeriesRowCreated(r) if r.court_id == court => Some(r.clone()),
            _ => None,
        }));
        Ok(out)
    }

    async fn scheduled_lessons(&mut self, court: CourtId, dates: DateRange) -> Result<Vec<LessonSession>, StoreError> {
        let mut out: Vec<LessonSession> = self.state(court)?.scheduled_lessons(dates).cloned().collect();
        out.extend(self.staged.iter().filter_map(|e| match e {
            Event::LessonCreated(l)
                if l.court_id == court
                    && l.status == LessonStatus::Scheduled
                    && dates.contains(l.lesson_date) =>
            {
                Some(l.clone())
            }
            _ => None,
        }));
        Ok(out)
    }

    async fn insert_booking(&mut self, booking: Booking) -> Result<(), StoreError> {
        self.stage(Event::BookingCreated(booking))
    }

    async fn insert_recurring(&mut self, row: RecurringBooking) -> Result<(), StoreError> {
        self.stage(Event::SeriesRowCreated(row))
    }

    async fn insert_lesson(&mut self, lesson: LessonSession) -> Result<(), StoreError> {
        self.stage(Event::LessonCreated(lesson))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.check_unique()?;

        let events = std::mem::take(&mut self.staged);
        wal_append(&self.wal_tx, events.clone()).await?;
        for event in &events {
            let Some(court) = event.court_id() else { continue };
            if let Some((_, guard)) = self.guards.iter_mut().find(|(id, _)| *id == court) {
                guard.apply(event);
            }
            if let Some((id, court)) = created_entity(event) {
                self.entity_to_court.insert(id, court);
            }
            self.notify.send(court, event);
        }
        Ok(())
    }
}
