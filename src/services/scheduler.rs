//! Per-listing coordinator between the visit API and the user's selection.
//!
//! A [`Scheduler`] owns the fetched slot set for one listing and mutates it
//! only through its own operations. Network calls run without holding the
//! session lock; their results are applied afterwards and only if they are
//! still current. Availability fetches are tagged with a generation number,
//! so a response that arrives after a newer fetch was issued is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::errors::SchedulerError;
use crate::models::{
    ContactData, DaySlot, SlotStatus, TimeSlot, Visit, VisitConfirmation, VisitRequest, VisitSlot,
};
use crate::services::api::VisitApi;
use crate::services::availability::{self, DayPolicy};
use crate::services::messaging::{BookingNotice, Notifier};
use crate::services::wire_time::{self, is_slot_available};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub listing_id: String,
    pub user_id: String,
    pub channel: String,
    pub timezone: Tz,
    pub day_policy: DayPolicy,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub date: NaiveDate,
    pub time: String,
    pub slot_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Loading,
    Ready,
    Selected { selection: Selection },
    Booking { selection: Selection },
    Booked { confirmation: VisitConfirmation },
    Error,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Selected { .. } => "selected",
            Phase::Booking { .. } => "booking",
            Phase::Booked { .. } => "booked",
            Phase::Error => "error",
        }
    }

    pub fn selection(&self) -> Option<&Selection> {
        match self {
            Phase::Selected { selection } | Phase::Booking { selection } => Some(selection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged { phase: &'static str },
    SlotsLoaded { generation: u64, count: usize },
    SlotReserved { slot_id: String },
    SlotRolledBack { slot_id: String, status: SlotStatus },
    VisitBooked { visit_id: String, slot_id: String },
    Error { message: String },
}

/// Serializable view of a session, including derived day and time views.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub listing_id: String,
    pub timezone: String,
    #[serde(flatten)]
    pub phase: Phase,
    pub error: Option<String>,
    pub selected_date: Option<NaiveDate>,
    pub slots: Vec<VisitSlot>,
    pub days: Vec<DaySlot>,
    pub times: Vec<TimeSlot>,
    pub visits: Vec<Visit>,
}

#[derive(Debug)]
struct Session {
    phase: Phase,
    slots: Vec<VisitSlot>,
    loaded: bool,
    range: Option<(NaiveDate, NaiveDate)>,
    selected_date: Option<NaiveDate>,
    error: Option<String>,
    generation: u64,
    slots_generation: u64,
    booking_seq: u64,
    in_flight: Option<CancellationToken>,
    visits: Vec<Visit>,
    confirmations: Vec<VisitConfirmation>,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            slots: Vec::new(),
            loaded: false,
            range: None,
            selected_date: None,
            error: None,
            generation: 0,
            slots_generation: 0,
            booking_seq: 0,
            in_flight: None,
            visits: Vec::new(),
            confirmations: Vec::new(),
        }
    }

    /// Phase to fall back to once nothing is pending.
    fn resting_phase(&self) -> Phase {
        if self.loaded {
            Phase::Ready
        } else {
            Phase::Idle
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self.phase, Phase::Loading | Phase::Booking { .. })
    }
}

#[derive(Clone)]
pub struct Scheduler {
    api: Arc<dyn VisitApi>,
    settings: Arc<SchedulerSettings>,
    session: Arc<Mutex<Session>>,
    events: broadcast::Sender<SessionEvent>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(api: Arc<dyn VisitApi>, settings: SchedulerSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            api,
            settings: Arc::new(settings),
            session: Arc::new(Mutex::new(Session::new())),
            events,
            notifier: None,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&self, s: &mut Session, phase: Phase) {
        if s.phase != phase {
            let name = phase.name();
            s.phase = phase;
            self.emit(SessionEvent::PhaseChanged { phase: name });
        }
    }

    fn record_error(&self, s: &mut Session, err: &SchedulerError) {
        let message = err.user_message();
        s.error = Some(message.clone());
        self.emit(SessionEvent::Error { message });
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&self.settings.timezone).date_naive()
    }

    // ── Availability ──

    /// Loads the slots for local days `start..=end`, replacing the current
    /// slot set. Returns the number of slots loaded.
    ///
    /// Issuing a new fetch cancels the one in flight; that earlier call then
    /// returns [`SchedulerError::Superseded`] without touching the session.
    pub async fn fetch_availability(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize, SchedulerError> {
        if end < start {
            let err = SchedulerError::Validation(format!(
                "end date {end} is before start date {start}"
            ));
            self.record_error(&mut self.lock(), &err);
            return Err(err);
        }

        let tz = self.settings.timezone;
        let (start_wire, end_wire) = match wire_time::range_bounds(start, end, tz) {
            Ok(bounds) => bounds,
            Err(err) => {
                self.record_error(&mut self.lock(), &err);
                return Err(err);
            }
        };

        let (generation, token) = {
            let mut s = self.lock();
            if matches!(s.phase, Phase::Booking { .. }) {
                return Err(SchedulerError::InvalidState {
                    operation: "reload availability",
                    phase: s.phase.name(),
                });
            }
            if let Some(previous) = s.in_flight.take() {
                previous.cancel();
            }
            s.generation += 1;
            let token = CancellationToken::new();
            s.in_flight = Some(token.clone());
            s.range = Some((start, end));
            s.error = None;
            self.transition(&mut s, Phase::Loading);
            (s.generation, token)
        };

        tracing::debug!(
            listing_id = %self.settings.listing_id,
            generation,
            start = %start_wire,
            end = %end_wire,
            "fetching availability"
        );

        let result = tokio::select! {
            _ = token.cancelled() => Err(SchedulerError::Cancelled),
            r = self.api.fetch_availability(&self.settings.listing_id, &start_wire, &end_wire) => {
                r.map_err(SchedulerError::from)
            }
        };

        let mut s = self.lock();
        if s.generation != generation {
            tracing::debug!(
                listing_id = %self.settings.listing_id,
                generation,
                current = s.generation,
                "discarding stale availability response"
            );
            return Err(SchedulerError::Superseded);
        }
        if token.is_cancelled() {
            // cancel_fetch already restored the phase.
            return Err(SchedulerError::Cancelled);
        }
        s.in_flight = None;

        match result {
            Ok(resp) => {
                if resp.listing_id != self.settings.listing_id {
                    tracing::warn!(
                        expected = %self.settings.listing_id,
                        got = %resp.listing_id,
                        "availability response for a different listing"
                    );
                }
                if reports_other_timezone(&resp.timezone, self.settings.timezone) {
                    tracing::warn!(
                        listing_id = %self.settings.listing_id,
                        configured = self.settings.timezone.name(),
                        reported = %resp.timezone,
                        "server reports a different timezone, days are projected in the configured one"
                    );
                }
                let total = resp.slots.len();
                let slots: Vec<VisitSlot> = resp
                    .slots
                    .into_iter()
                    .filter(|slot| slot.is_well_formed())
                    .collect();
                if slots.len() != total {
                    tracing::warn!(
                        listing_id = %self.settings.listing_id,
                        dropped = total - slots.len(),
                        "ignoring slots whose start is not before their end"
                    );
                }

                let count = slots.len();
                s.slots = slots;
                s.loaded = true;
                s.slots_generation = generation;
                self.transition(&mut s, Phase::Ready);
                self.emit(SessionEvent::SlotsLoaded { generation, count });
                tracing::info!(
                    listing_id = %self.settings.listing_id,
                    generation,
                    count,
                    "availability loaded"
                );
                Ok(count)
            }
            Err(err) => {
                tracing::warn!(
                    listing_id = %self.settings.listing_id,
                    generation,
                    error = %err,
                    "availability fetch failed"
                );
                self.record_error(&mut s, &err);
                self.transition(&mut s, Phase::Error);
                Err(err)
            }
        }
    }

    /// Aborts the fetch in flight, if any. Returns whether one was aborted.
    pub fn cancel_fetch(&self) -> bool {
        let mut s = self.lock();
        match s.in_flight.take() {
            Some(token) => {
                token.cancel();
                let resting = s.resting_phase();
                self.transition(&mut s, resting);
                tracing::debug!(listing_id = %self.settings.listing_id, "availability fetch cancelled");
                true
            }
            None => false,
        }
    }

    // ── Selection ──

    /// Sets the day whose times are listed by [`Scheduler::available_slots`].
    /// Picking another day drops a time selection made on a different day.
    pub fn select_date(&self, date: NaiveDate) -> Result<(), SchedulerError> {
        let mut s = self.lock();
        self.ensure_selectable(&s, "select a date")?;
        s.selected_date = Some(date);
        if s.phase.selection().is_some_and(|sel| sel.date != date) {
            self.transition(&mut s, Phase::Ready);
        }
        Ok(())
    }

    /// Selects the slot starting at local `date` `time` (`HH:MM`) from the
    /// fetched set. No network call is made.
    pub fn select_date_time(&self, date: NaiveDate, time: &str) -> Result<Selection, SchedulerError> {
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map(|t| t.format("%H:%M").to_string())
            .map_err(|_| SchedulerError::Validation(format!("invalid time {time:?}, expected HH:MM")))?;

        let now = self.now();
        let mut s = self.lock();
        self.ensure_selectable(&s, "select a time")?;
        s.selected_date = Some(date);

        let found = availability::find_slot(&s.slots, date, &time, self.settings.timezone, &now)
            .map(|slot| (slot.id.clone(), is_slot_available(slot, &now)));

        let err = match found {
            Some((slot_id, true)) => {
                let selection = Selection {
                    date,
                    time,
                    slot_id,
                };
                s.error = None;
                self.transition(
                    &mut s,
                    Phase::Selected {
                        selection: selection.clone(),
                    },
                );
                return Ok(selection);
            }
            Some((slot_id, false)) => SchedulerError::SlotUnavailable(slot_id),
            None => SchedulerError::SlotNotFound {
                date: date.to_string(),
                time,
            },
        };

        self.transition(&mut s, Phase::Ready);
        self.record_error(&mut s, &err);
        Err(err)
    }

    fn ensure_selectable(&self, s: &Session, operation: &'static str) -> Result<(), SchedulerError> {
        match s.phase {
            Phase::Ready | Phase::Selected { .. } | Phase::Booked { .. } => Ok(()),
            _ => Err(SchedulerError::InvalidState {
                operation,
                phase: s.phase.name(),
            }),
        }
    }

    pub fn clear_selection(&self) -> Result<(), SchedulerError> {
        let mut s = self.lock();
        if s.is_busy() {
            return Err(SchedulerError::InvalidState {
                operation: "clear the selection",
                phase: s.phase.name(),
            });
        }
        if matches!(s.phase, Phase::Selected { .. } | Phase::Booked { .. }) {
            let resting = s.resting_phase();
            self.transition(&mut s, resting);
        }
        s.selected_date = None;
        Ok(())
    }

    pub fn clear_error(&self) -> Result<(), SchedulerError> {
        let mut s = self.lock();
        if matches!(s.phase, Phase::Loading) {
            return Err(SchedulerError::InvalidState {
                operation: "clear the error",
                phase: s.phase.name(),
            });
        }
        s.error = None;
        if matches!(s.phase, Phase::Error) {
            let resting = s.resting_phase();
            self.transition(&mut s, resting);
        }
        Ok(())
    }

    // ── Booking ──

    /// Books the selected slot for `contact`.
    ///
    /// The slot is marked `reserved` locally before the request is sent. If
    /// the request fails the slot gets its previous status back and the
    /// session returns to `Ready` with the error recorded.
    pub async fn create_visit(&self, contact: ContactData) -> Result<VisitConfirmation, SchedulerError> {
        let problems = contact.validate();
        if !problems.is_empty() {
            let err = SchedulerError::InvalidContact(problems);
            self.record_error(&mut self.lock(), &err);
            return Err(err);
        }

        let now = self.now();
        let (request, prior, seq, slots_generation) = {
            let mut s = self.lock();
            match self.reserve_selected(&mut s, &now, contact) {
                Ok(reserved) => reserved,
                Err(err) => {
                    self.record_error(&mut s, &err);
                    return Err(err);
                }
            }
        };

        tracing::info!(
            listing_id = %request.listing_id,
            slot_id = %request.slot_id,
            idempotency_key = %request.idempotency_key,
            "submitting visit"
        );

        // The reservation must be settled even if the caller stops waiting,
        // so the request and its bookkeeping run on their own task.
        let this = self.clone();
        tokio::spawn(async move {
            this.settle_booking(request, prior, seq, slots_generation, now)
                .await
        })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "booking task failed");
            SchedulerError::Cancelled
        })?
    }

    async fn settle_booking(
        &self,
        request: VisitRequest,
        prior: SlotStatus,
        seq: u64,
        slots_generation: u64,
        now: DateTime<Utc>,
    ) -> Result<VisitConfirmation, SchedulerError> {
        let result = self.api.create_visit(&request).await;

        let mut s = self.lock();
        let current = matches!(s.phase, Phase::Booking { .. }) && s.booking_seq == seq;
        let same_slots = s.slots_generation == slots_generation;

        match result {
            Ok(confirmation) => {
                if same_slots {
                    if let Some(slot) = s.slots.iter_mut().find(|x| x.id == request.slot_id) {
                        if let Some(next) = confirmation.status.slot_status() {
                            if slot.status.can_advance_to(next) {
                                slot.status = next;
                            }
                        }
                    }
                }

                s.visits.push(Visit {
                    id: confirmation.visit_id.clone(),
                    listing_id: request.listing_id.clone(),
                    slot_id: request.slot_id.clone(),
                    user_id: request.user_id.clone(),
                    status: confirmation.status,
                    created_at: now.fixed_offset(),
                    idempotency_key: request.idempotency_key.clone(),
                    agent_id: confirmation.agent.as_ref().and_then(|a| a.id.clone()),
                });
                s.confirmations.push(confirmation.clone());

                if current {
                    self.transition(
                        &mut s,
                        Phase::Booked {
                            confirmation: confirmation.clone(),
                        },
                    );
                }
                self.emit(SessionEvent::VisitBooked {
                    visit_id: confirmation.visit_id.clone(),
                    slot_id: request.slot_id.clone(),
                });
                drop(s);

                tracing::info!(
                    visit_id = %confirmation.visit_id,
                    slot_id = %request.slot_id,
                    status = confirmation.status.as_str(),
                    "visit booked"
                );
                self.dispatch_notice(&request, &confirmation);
                Ok(confirmation)
            }
            Err(api_err) => {
                let err = SchedulerError::from(api_err);
                if same_slots {
                    if let Some(slot) = s.slots.iter_mut().find(|x| x.id == request.slot_id) {
                        if slot.status == SlotStatus::Reserved {
                            slot.status = prior;
                            self.emit(SessionEvent::SlotRolledBack {
                                slot_id: request.slot_id.clone(),
                                status: prior,
                            });
                        }
                    }
                }
                tracing::warn!(
                    slot_id = %request.slot_id,
                    idempotency_key = %request.idempotency_key,
                    error = %err,
                    "visit booking failed, reservation rolled back"
                );
                self.record_error(&mut s, &err);
                if current {
                    self.transition(&mut s, Phase::Ready);
                }
                Err(err)
            }
        }
    }

    /// Applies the optimistic reservation and builds the request.
    fn reserve_selected(
        &self,
        s: &mut Session,
        now: &DateTime<Utc>,
        contact: ContactData,
    ) -> Result<(VisitRequest, SlotStatus, u64, u64), SchedulerError> {
        let selection = match &s.phase {
            Phase::Selected { selection } => selection.clone(),
            Phase::Loading | Phase::Booking { .. } => {
                return Err(SchedulerError::InvalidState {
                    operation: "book a visit",
                    phase: s.phase.name(),
                })
            }
            _ => {
                return Err(SchedulerError::Validation(
                    "select a date and time before booking".to_string(),
                ))
            }
        };

        if s
            .visits
            .iter()
            .any(|v| v.slot_id == selection.slot_id && v.status.is_active())
        {
            return Err(SchedulerError::Validation(format!(
                "slot {} already has an active visit",
                selection.slot_id
            )));
        }

        let slot = s
            .slots
            .iter_mut()
            .find(|x| x.id == selection.slot_id)
            .ok_or_else(|| SchedulerError::SlotNotFound {
                date: selection.date.to_string(),
                time: selection.time.clone(),
            })?;
        if !is_slot_available(slot, now) {
            return Err(SchedulerError::SlotUnavailable(slot.id.clone()));
        }
        let prior = slot.status;
        slot.status = SlotStatus::Reserved;

        let request = VisitRequest {
            listing_id: self.settings.listing_id.clone(),
            slot_id: selection.slot_id.clone(),
            user_id: self.settings.user_id.clone(),
            channel: self.settings.channel.clone(),
            idempotency_key: wire_time::generate_idempotency_key(),
            contact,
        };

        s.booking_seq += 1;
        s.error = None;
        self.emit(SessionEvent::SlotReserved {
            slot_id: selection.slot_id.clone(),
        });
        self.transition(s, Phase::Booking { selection });

        Ok((request, prior, s.booking_seq, s.slots_generation))
    }

    fn dispatch_notice(&self, request: &VisitRequest, confirmation: &VisitConfirmation) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let notice = BookingNotice {
            listing_id: request.listing_id.clone(),
            contact: request.contact.clone(),
            confirmation: confirmation.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.visit_booked(&notice).await {
                tracing::warn!(
                    visit_id = %notice.confirmation.visit_id,
                    error = %e,
                    "booking notification failed"
                );
            }
        });
    }

    // ── Views ──

    pub fn phase(&self) -> Phase {
        self.lock().phase.clone()
    }

    pub fn selection(&self) -> Option<Selection> {
        self.lock().phase.selection().cloned()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn slots(&self) -> Vec<VisitSlot> {
        self.lock().slots.clone()
    }

    pub fn visits(&self) -> Vec<Visit> {
        self.lock().visits.clone()
    }

    pub fn visit(&self, visit_id: &str) -> Option<Visit> {
        self.lock().visits.iter().find(|v| v.id == visit_id).cloned()
    }

    pub fn confirmation(&self, visit_id: &str) -> Option<VisitConfirmation> {
        self.lock()
            .confirmations
            .iter()
            .find(|c| c.visit_id == visit_id)
            .cloned()
    }

    /// Candidate days from the start of the fetched range (or today), with
    /// the number of bookable slots on each.
    pub fn available_days(&self) -> Vec<DaySlot> {
        let s = self.lock();
        self.days_for(&s)
    }

    /// Slots on the selected date, ordered by start time.
    pub fn available_slots(&self) -> Vec<TimeSlot> {
        let s = self.lock();
        self.times_for(&s)
    }

    fn days_for(&self, s: &Session) -> Vec<DaySlot> {
        let from = s.range.map(|(start, _)| start).unwrap_or_else(|| self.today());
        availability::project_days(
            &s.slots,
            &self.settings.day_policy,
            from,
            self.settings.timezone,
            &self.now(),
        )
    }

    fn times_for(&self, s: &Session) -> Vec<TimeSlot> {
        match s.selected_date {
            Some(date) => {
                availability::project_time_slots(&s.slots, date, self.settings.timezone, &self.now())
            }
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let s = self.lock();
        SessionSnapshot {
            listing_id: self.settings.listing_id.clone(),
            timezone: self.settings.timezone.name().to_string(),
            phase: s.phase.clone(),
            error: s.error.clone(),
            selected_date: s.selected_date,
            slots: s.slots.clone(),
            days: self.days_for(&s),
            times: self.times_for(&s),
            visits: s.visits.clone(),
        }
    }
}

/// Whether the zone named by the server differs from `configured`. A blank
/// name means the server did not say.
fn reports_other_timezone(reported: &str, configured: Tz) -> bool {
    let reported = reported.trim();
    if reported.is_empty() {
        return false;
    }
    match reported.parse::<Tz>() {
        Ok(tz) => tz != configured,
        Err(_) => reported != configured.name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ApiError;
    use crate::models::{AgentContact, AvailabilityResponse, BookedInterval, SlotSource, VisitStatus};
    use crate::services::wire_time::parse_rfc3339;

    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::oneshot;

    type Gate<T> = oneshot::Receiver<Result<T, ApiError>>;

    /// Mock API. Responses are either canned or gated on a oneshot so tests
    /// control when (and in which order) they resolve.
    #[derive(Default)]
    struct MockApi {
        slots: Mutex<Vec<VisitSlot>>,
        fetch_gates: Mutex<Vec<Gate<AvailabilityResponse>>>,
        fetch_error: Mutex<Option<ApiError>>,
        booking: Mutex<Option<Result<VisitConfirmation, ApiError>>>,
        booking_gate: Mutex<Option<Gate<VisitConfirmation>>>,
        fetch_calls: Mutex<Vec<(String, String)>>,
        requests: Mutex<Vec<VisitRequest>>,
    }

    #[async_trait]
    impl VisitApi for MockApi {
        async fn fetch_availability(
            &self,
            listing_id: &str,
            start: &str,
            end: &str,
        ) -> Result<AvailabilityResponse, ApiError> {
            self.fetch_calls
                .lock()
                .unwrap()
                .push((start.to_string(), end.to_string()));
            let gate = {
                let mut gates = self.fetch_gates.lock().unwrap();
                if gates.is_empty() {
                    None
                } else {
                    Some(gates.remove(0))
                }
            };
            if let Some(gate) = gate {
                return gate.await.unwrap_or(Err(ApiError::Decode("gate dropped".into())));
            }
            if let Some(err) = self.fetch_error.lock().unwrap().take() {
                return Err(err);
            }
            Ok(AvailabilityResponse {
                listing_id: listing_id.to_string(),
                timezone: "America/Sao_Paulo".to_string(),
                slots: self.slots.lock().unwrap().clone(),
            })
        }

        async fn create_visit(&self, request: &VisitRequest) -> Result<VisitConfirmation, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            let gate = self.booking_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                return gate.await.unwrap_or(Err(ApiError::Decode("gate dropped".into())));
            }
            self.booking
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ApiError::Decode("no booking response".into())))
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn slot(id: &str, start: &str, status: SlotStatus) -> VisitSlot {
        let start = parse_rfc3339(start).unwrap();
        VisitSlot {
            id: id.to_string(),
            listing_id: "bldg-42".to_string(),
            start,
            end: start + Duration::minutes(30),
            status,
            source: SlotSource::System,
            created_at: start - Duration::days(7),
        }
    }

    fn fixture_slots() -> Vec<VisitSlot> {
        vec![
            slot("s1", "2024-06-10T09:00:00-03:00", SlotStatus::Open),
            slot("s2", "2024-06-10T09:30:00-03:00", SlotStatus::Reserved),
            slot("s3", "2024-06-11T15:00:00-03:00", SlotStatus::Open),
        ]
    }

    fn confirmation(visit_id: &str, status: VisitStatus) -> VisitConfirmation {
        VisitConfirmation {
            visit_id: visit_id.to_string(),
            status,
            agent: Some(AgentContact {
                id: Some("agent-7".to_string()),
                name: "Carla".to_string(),
                phone: Some("+56922222222".to_string()),
                email: None,
            }),
            slot: BookedInterval {
                start: parse_rfc3339("2024-06-10T09:00:00-03:00").unwrap(),
                end: parse_rfc3339("2024-06-10T09:30:00-03:00").unwrap(),
            },
            message: "Visita confirmada".to_string(),
        }
    }

    fn setup(api: Arc<MockApi>) -> Scheduler {
        let settings = SchedulerSettings {
            listing_id: "bldg-42".to_string(),
            user_id: "u1".to_string(),
            channel: "web".to_string(),
            timezone: chrono_tz::America::Sao_Paulo,
            day_policy: DayPolicy::default(),
        };
        let now = parse_rfc3339("2024-06-09T12:00:00-03:00").unwrap().with_timezone(&Utc);
        Scheduler::new(api, settings).with_clock(Arc::new(move || now))
    }

    fn api_with_slots() -> Arc<MockApi> {
        let api = MockApi::default();
        *api.slots.lock().unwrap() = fixture_slots();
        Arc::new(api)
    }

    async fn loaded() -> (Scheduler, Arc<MockApi>) {
        let api = api_with_slots();
        let scheduler = setup(api.clone());
        scheduler
            .fetch_availability(date("2024-06-10"), date("2024-06-14"))
            .await
            .unwrap();
        (scheduler, api)
    }

    fn status_of(scheduler: &Scheduler, id: &str) -> SlotStatus {
        scheduler.slots().iter().find(|s| s.id == id).unwrap().status
    }

    #[tokio::test]
    async fn test_fetch_converts_range_to_wire_format() {
        let (scheduler, api) = loaded().await;
        assert_eq!(scheduler.phase(), Phase::Ready);
        assert_eq!(scheduler.slots().len(), 3);
        let calls = api.fetch_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "2024-06-10T00:00:00-03:00".to_string(),
                "2024-06-14T23:59:59-03:00".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_fetch_rejects_inverted_range() {
        let api = api_with_slots();
        let scheduler = setup(api.clone());
        let err = scheduler
            .fetch_availability(date("2024-06-14"), date("2024-06-10"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(api.fetch_calls.lock().unwrap().is_empty());
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert!(scheduler.error().is_some());
    }

    #[tokio::test]
    async fn test_fetch_failure_sets_error_phase() {
        let api = api_with_slots();
        *api.fetch_error.lock().unwrap() = Some(ApiError::Server {
            status: 500,
            message: "Servicio no disponible".into(),
        });
        let scheduler = setup(api);
        let err = scheduler
            .fetch_availability(date("2024-06-10"), date("2024-06-14"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Api(_)));
        assert_eq!(scheduler.phase(), Phase::Error);
        assert_eq!(scheduler.error().as_deref(), Some("Servicio no disponible"));

        scheduler.clear_error().unwrap();
        assert_eq!(scheduler.phase(), Phase::Idle);
        assert!(scheduler.error().is_none());
    }

    #[tokio::test]
    async fn test_fetch_drops_malformed_slots() {
        let api = api_with_slots();
        let mut bad = slot("bad", "2024-06-10T10:00:00-03:00", SlotStatus::Open);
        bad.end = bad.start;
        api.slots.lock().unwrap().push(bad);
        let scheduler = setup(api);
        let count = scheduler
            .fetch_availability(date("2024-06-10"), date("2024-06-14"))
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_stale_fetch_response_is_discarded() {
        let api = api_with_slots();
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        api.fetch_gates.lock().unwrap().extend([first_rx, second_rx]);
        let scheduler = setup(api);

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .fetch_availability(date("2024-06-10"), date("2024-06-14"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        while scheduler.phase() != Phase::Loading {
            tokio::task::yield_now().await;
        }

        let second = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .fetch_availability(date("2024-06-17"), date("2024-06-21"))
                    .await
            })
        };

        let first_result = first.await.unwrap();
        assert!(matches!(first_result, Err(SchedulerError::Superseded)));

        second_tx
            .send(Ok(AvailabilityResponse {
                listing_id: "bldg-42".into(),
                timezone: "America/Sao_Paulo".into(),
                slots: vec![slot("new", "2024-06-17T10:00:00-03:00", SlotStatus::Open)],
            }))
            .unwrap();
        assert_eq!(second.await.unwrap().unwrap(), 1);

        // A late answer to the first request has nowhere to go.
        let _ = first_tx.send(Ok(AvailabilityResponse {
            listing_id: "bldg-42".into(),
            timezone: "America/Sao_Paulo".into(),
            slots: fixture_slots(),
        }));
        let ids: Vec<String> = scheduler.slots().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["new".to_string()]);
        assert_eq!(scheduler.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn test_cancel_fetch() {
        let (scheduler, api) = loaded().await;
        let (_tx, rx) = oneshot::channel();
        api.fetch_gates.lock().unwrap().push(rx);

        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .fetch_availability(date("2024-06-17"), date("2024-06-21"))
                    .await
            })
        };
        while scheduler.phase() != Phase::Loading {
            tokio::task::yield_now().await;
        }

        assert!(scheduler.cancel_fetch());
        assert!(matches!(pending.await.unwrap(), Err(SchedulerError::Cancelled)));
        assert_eq!(scheduler.phase(), Phase::Ready);
        assert_eq!(scheduler.slots().len(), 3);
        assert!(!scheduler.cancel_fetch());
    }

    #[tokio::test]
    async fn test_select_resolves_exact_slot() {
        let (scheduler, _) = loaded().await;
        let selection = scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        assert_eq!(selection.slot_id, "s1");
        assert_eq!(scheduler.selection(), Some(selection));

        let selection = scheduler.select_date_time(date("2024-06-11"), "15:00").unwrap();
        assert_eq!(selection.slot_id, "s3");
    }

    #[tokio::test]
    async fn test_select_normalizes_time() {
        let (scheduler, _) = loaded().await;
        let selection = scheduler.select_date_time(date("2024-06-10"), "9:00").unwrap();
        assert_eq!(selection.time, "09:00");
        assert!(matches!(
            scheduler.select_date_time(date("2024-06-10"), "nine"),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_select_unknown_slot_is_error() {
        let (scheduler, _) = loaded().await;
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();

        let err = scheduler.select_date_time(date("2024-06-12"), "11:00").unwrap_err();
        assert!(matches!(err, SchedulerError::SlotNotFound { .. }));
        assert_eq!(scheduler.phase(), Phase::Ready);
        assert!(scheduler.selection().is_none());
        assert_eq!(scheduler.snapshot().selected_date, Some(date("2024-06-12")));
    }

    #[tokio::test]
    async fn test_select_reserved_slot_is_unavailable() {
        let (scheduler, _) = loaded().await;
        let err = scheduler.select_date_time(date("2024-06-10"), "09:30").unwrap_err();
        assert!(matches!(err, SchedulerError::SlotUnavailable(id) if id == "s2"));
    }

    #[tokio::test]
    async fn test_select_before_fetch_is_invalid_state() {
        let scheduler = setup(api_with_slots());
        let err = scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { phase: "idle", .. }));
    }

    #[tokio::test]
    async fn test_select_date_filters_times() {
        let (scheduler, _) = loaded().await;
        assert!(scheduler.available_slots().is_empty());
        scheduler.select_date(date("2024-06-10")).unwrap();
        let times: Vec<String> = scheduler.available_slots().into_iter().map(|t| t.time).collect();
        assert_eq!(times, vec!["09:00", "09:30"]);

        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler.select_date(date("2024-06-11")).unwrap();
        assert!(scheduler.selection().is_none());
    }

    #[tokio::test]
    async fn test_available_days_follow_policy() {
        let api = api_with_slots();
        let scheduler = setup(api);
        // 2024-06-14 is a Friday.
        scheduler
            .fetch_availability(date("2024-06-14"), date("2024-06-20"))
            .await
            .unwrap();
        let days: Vec<NaiveDate> = scheduler.available_days().into_iter().map(|d| d.date).collect();
        assert_eq!(
            days,
            vec![
                date("2024-06-14"),
                date("2024-06-17"),
                date("2024-06-18"),
                date("2024-06-19"),
                date("2024-06-20")
            ]
        );
    }

    #[tokio::test]
    async fn test_create_visit_requires_selection() {
        let (scheduler, api) = loaded().await;
        let err = scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(api.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_visit_rejects_invalid_contact() {
        let (scheduler, api) = loaded().await;
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        let err = scheduler
            .create_visit(ContactData::new("", "123"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidContact(ref p) if p.len() == 2));
        assert!(api.requests.lock().unwrap().is_empty());
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Open);
        assert!(scheduler.selection().is_some());
    }

    #[tokio::test]
    async fn test_booking_failure_rolls_back() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Err(ApiError::Server {
            status: 409,
            message: "Horario tomado".into(),
        }));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        let before = status_of(&scheduler, "s1");

        let err = scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Api(ApiError::Server { status: 409, .. })));
        assert_eq!(status_of(&scheduler, "s1"), before);
        assert_eq!(scheduler.phase(), Phase::Ready);
        assert_eq!(scheduler.error().as_deref(), Some("Horario tomado"));
        assert!(scheduler.visits().is_empty());
    }

    #[tokio::test]
    async fn test_slot_is_reserved_while_booking_in_flight() {
        let (scheduler, api) = loaded().await;
        let (tx, rx) = oneshot::channel();
        *api.booking_gate.lock().unwrap() = Some(rx);
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();

        let booking = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .create_visit(ContactData::new("Ana", "+56911111111"))
                    .await
            })
        };
        while !matches!(scheduler.phase(), Phase::Booking { .. }) {
            tokio::task::yield_now().await;
        }

        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Reserved);
        assert!(matches!(
            scheduler.clear_selection(),
            Err(SchedulerError::InvalidState { .. })
        ));
        assert!(matches!(
            scheduler
                .fetch_availability(date("2024-06-10"), date("2024-06-14"))
                .await,
            Err(SchedulerError::InvalidState { .. })
        ));

        tx.send(Err(ApiError::Timeout)).unwrap();
        assert!(booking.await.unwrap().is_err());
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Open);
    }

    #[tokio::test]
    async fn test_each_booking_attempt_gets_fresh_key() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Err(ApiError::Timeout));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        let _ = scheduler.create_visit(ContactData::new("Ana", "+56911111111")).await;

        *api.booking.lock().unwrap() = Some(Ok(confirmation("v1", VisitStatus::Confirmed)));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();

        let requests = api.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].idempotency_key, requests[1].idempotency_key);
    }

    #[tokio::test]
    async fn test_end_to_end_booking() {
        let (scheduler, api) = loaded().await;
        let mut events = scheduler.subscribe();
        let expected = confirmation("v1", VisitStatus::Confirmed);
        *api.booking.lock().unwrap() = Some(Ok(expected.clone()));

        let selection = scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        assert_eq!(selection.slot_id, "s1");

        let result = scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();
        assert_eq!(result, expected);

        let request = api.requests.lock().unwrap()[0].clone();
        assert_eq!(request.slot_id, "s1");
        assert_eq!(request.listing_id, "bldg-42");
        assert_eq!(request.user_id, "u1");
        assert_eq!(request.channel, "web");
        assert!(!request.idempotency_key.is_empty());

        assert!(scheduler.selection().is_none());
        assert!(matches!(scheduler.phase(), Phase::Booked { .. }));
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Confirmed);

        let visits = scheduler.visits();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].idempotency_key, request.idempotency_key);
        assert_eq!(visits[0].agent_id.as_deref(), Some("agent-7"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&SessionEvent::SlotReserved { slot_id: "s1".into() }));
        assert!(seen.contains(&SessionEvent::VisitBooked {
            visit_id: "v1".into(),
            slot_id: "s1".into()
        }));
    }

    #[tokio::test]
    async fn test_pending_visit_keeps_slot_reserved() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Ok(confirmation("v2", VisitStatus::Pending)));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Reserved);
    }

    #[tokio::test]
    async fn test_booked_slot_cannot_be_booked_twice() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Ok(confirmation("v1", VisitStatus::Confirmed)));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();

        // The slot is confirmed now, so it cannot even be selected.
        let err = scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap_err();
        assert!(matches!(err, SchedulerError::SlotUnavailable(_)));
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_selection_after_booking() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Ok(confirmation("v1", VisitStatus::Confirmed)));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();

        scheduler.clear_selection().unwrap();
        assert_eq!(scheduler.phase(), Phase::Ready);
        assert!(scheduler.visit("v1").is_some());
        assert!(scheduler.visit("missing").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_serializes_phase_tag() {
        let (scheduler, _) = loaded().await;
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        let json = serde_json::to_value(scheduler.snapshot()).unwrap();
        assert_eq!(json["phase"], "selected");
        assert_eq!(json["selection"]["slotId"], "s1");
        assert_eq!(json["listingId"], "bldg-42");
        assert_eq!(json["days"].as_array().unwrap().len(), 5);
        assert_eq!(json["times"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_settles_booking() {
        let (scheduler, api) = loaded().await;
        let (tx, rx) = oneshot::channel();
        *api.booking_gate.lock().unwrap() = Some(rx);
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();

        let booking = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .create_visit(ContactData::new("Ana", "+56911111111"))
                    .await
            })
        };
        while api.requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        // The HTTP client went away.
        booking.abort();
        assert!(booking.await.unwrap_err().is_cancelled());

        tx.send(Err(ApiError::Timeout)).unwrap();
        while matches!(scheduler.phase(), Phase::Booking { .. }) {
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.phase(), Phase::Ready);
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Open);
        assert!(scheduler.error().is_some());
        scheduler.clear_selection().unwrap();
        scheduler
            .fetch_availability(date("2024-06-10"), date("2024-06-14"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_caller_still_records_visit() {
        let (scheduler, api) = loaded().await;
        let (tx, rx) = oneshot::channel();
        *api.booking_gate.lock().unwrap() = Some(rx);
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();

        let booking = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .create_visit(ContactData::new("Ana", "+56911111111"))
                    .await
            })
        };
        while api.requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        booking.abort();
        let _ = booking.await;

        tx.send(Ok(confirmation("v1", VisitStatus::Confirmed))).unwrap();
        while matches!(scheduler.phase(), Phase::Booking { .. }) {
            tokio::task::yield_now().await;
        }

        assert!(matches!(scheduler.phase(), Phase::Booked { .. }));
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Confirmed);
        assert!(scheduler.visit("v1").is_some());
    }

    #[tokio::test]
    async fn test_ledger_rejects_second_visit_for_reopened_slot() {
        let (scheduler, api) = loaded().await;
        *api.booking.lock().unwrap() = Some(Ok(confirmation("v1", VisitStatus::Confirmed)));
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();
        scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap();

        // The server still reports s1 as open.
        scheduler
            .fetch_availability(date("2024-06-10"), date("2024-06-14"))
            .await
            .unwrap();
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Open);
        scheduler.select_date_time(date("2024-06-10"), "09:00").unwrap();

        let err = scheduler
            .create_visit(ContactData::new("Ana", "+56911111111"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(ref m) if m.contains("already has an active visit")));
        assert_eq!(api.requests.lock().unwrap().len(), 1);
        assert_eq!(status_of(&scheduler, "s1"), SlotStatus::Open);
        assert!(matches!(scheduler.phase(), Phase::Selected { .. }));
    }

    #[test]
    fn test_reports_other_timezone() {
        let configured = chrono_tz::America::Sao_Paulo;
        assert!(!reports_other_timezone("America/Sao_Paulo", configured));
        assert!(!reports_other_timezone(" ", configured));
        assert!(reports_other_timezone("America/Santiago", configured));
        assert!(reports_other_timezone("GMT-3", configured));
    }
}
