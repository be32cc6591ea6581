use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::models::trip::{RouteSample, Trip, TripParams, TripStatus, TrustedContact};
use crate::services::notify::NotificationDispatcher;
use crate::store::TripStore;

/// Lost CAS races on user-facing operations are retried this many times
/// before surfacing a conflict. Scan transitions never retry; a lost race
/// there means someone else already resolved the trip.
const CAS_RETRIES: usize = 2;

/// Per-contact cap on a single delivery attempt. Dispatch is awaited for
/// auditability, so one stalled provider must not wedge a whole sweep.
const DISPATCH_TIMEOUT_SECS: u64 = 10;

/// The Guardian Mode state machine. Validates transitions, performs
/// CAS-guarded writes through the store and fans notifications out after a
/// transition has been committed. A dispatch failure is logged and never
/// rolls the recorded transition back.
#[derive(Clone)]
pub struct TripEngine {
    store: Arc<dyn TripStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    escalation_contact: Option<TrustedContact>,
}

impl TripEngine {
    pub fn new(
        store: Arc<dyn TripStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        escalation_contact: Option<TrustedContact>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            escalation_contact,
        }
    }

    /// Starts a new guarded trip. Any prior active trip of the same traveler
    /// is force-cancelled first, so at most one trip per traveler is active.
    pub async fn start_trip(
        &self,
        traveler_id: &str,
        traveler_name: &str,
        params: &TripParams,
    ) -> Result<Trip, AppError> {
        let now = Utc::now();
        params.validate(now)?;

        self.cancel_prior_active(traveler_id, now).await?;

        let trip = Trip::new(traveler_id, traveler_name, params, now);
        self.store.create(&trip).await?;
        info!(trip_id = %trip.id, traveler = %traveler_id, destination = %trip.destination, "trip started");

        let message = format!(
            "{} started a guarded trip to {} and expects to arrive by {}. You are listed as a trusted contact.",
            trip.traveler_name,
            trip.destination,
            trip.expected_end_at.format("%H:%M UTC"),
        );
        self.notify_contacts(&trip, &message, false).await;

        Ok(trip)
    }

    async fn cancel_prior_active(
        &self,
        traveler_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        for attempt in 0..=CAS_RETRIES {
            let Some(prior) = self.store.get_active_by_traveler(traveler_id).await? else {
                return Ok(());
            };
            let mut cancelled = prior.clone();
            cancelled.status = TripStatus::Cancelled;
            cancelled.cancelled_at = Some(now);
            match self
                .store
                .compare_and_swap_status(TripStatus::Active, &cancelled)
                .await
            {
                Ok(_) => {
                    info!(trip_id = %prior.id, "force-cancelled prior active trip");
                    return Ok(());
                }
                Err(AppError::ConcurrentModification) if attempt < CAS_RETRIES => continue,
                // Someone else just transitioned it away; it is no longer active.
                Err(AppError::ConcurrentModification) | Err(AppError::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// A safety confirmation from the traveler. On an active trip it stamps
    /// `last_check_in_at` (and, when the caller supplies one, moves the
    /// deadline like an explicit extension); a plain active check-in never
    /// writes the deadline, so it cannot carry a stale value back over a
    /// concurrently committed extension. On an overdue trip it is the sole
    /// backward transition, returning the trip to active with a deadline
    /// strictly after now.
    pub async fn check_in(
        &self,
        traveler_id: &str,
        trip_id: &str,
        new_deadline: Option<DateTime<Utc>>,
    ) -> Result<Trip, AppError> {
        for attempt in 0..=CAS_RETRIES {
            let trip = self.load_owned(traveler_id, trip_id).await?;
            let now = Utc::now();
            let result = match (trip.status, new_deadline) {
                (TripStatus::Active, None) => self.store.touch_check_in(&trip.id, now).await,
                (TripStatus::Active, Some(deadline)) => {
                    Self::ensure_future(deadline, now)?;
                    let mut updated = trip.clone();
                    updated.last_check_in_at = Some(now);
                    updated.expected_end_at = deadline;
                    self.store
                        .compare_and_swap_status(TripStatus::Active, &updated)
                        .await
                }
                (TripStatus::Overdue, _) => {
                    let deadline = Self::late_return_deadline(&trip, new_deadline, now)?;
                    let mut updated = trip.clone();
                    updated.status = TripStatus::Active;
                    updated.alerted_at = None;
                    updated.last_check_in_at = Some(now);
                    updated.expected_end_at = deadline;
                    self.store
                        .compare_and_swap_status(TripStatus::Overdue, &updated)
                        .await
                }
                _ => return Err(AppError::TripAlreadyTerminal),
            };
            match result {
                Ok(stored) => {
                    if trip.status == TripStatus::Overdue {
                        info!(trip_id = %stored.id, deadline = %stored.expected_end_at, "late check-in, trip active again");
                    }
                    return Ok(stored);
                }
                Err(AppError::ConcurrentModification) if attempt < CAS_RETRIES => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::ConcurrentModification)
    }

    fn ensure_future(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), AppError> {
        if deadline <= now {
            return Err(AppError::InvalidTripParameters(
                "new deadline must lie in the future".into(),
            ));
        }
        Ok(())
    }

    fn late_return_deadline(
        trip: &Trip,
        requested: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AppError> {
        match requested {
            Some(deadline) => {
                Self::ensure_future(deadline, now)?;
                Ok(deadline)
            }
            None => Ok(now + Duration::minutes(trip.expected_duration_minutes)),
        }
    }

    /// Explicitly moves the deadline. From overdue this behaves like a late
    /// check-in with an explicit deadline, minus the check-in stamp.
    pub async fn extend_deadline(
        &self,
        traveler_id: &str,
        trip_id: &str,
        new_deadline: DateTime<Utc>,
    ) -> Result<Trip, AppError> {
        for attempt in 0..=CAS_RETRIES {
            let trip = self.load_owned(traveler_id, trip_id).await?;
            let now = Utc::now();
            Self::ensure_future(new_deadline, now)?;
            let expected = match trip.status {
                TripStatus::Active => TripStatus::Active,
                TripStatus::Overdue => TripStatus::Overdue,
                _ => return Err(AppError::TripAlreadyTerminal),
            };
            let mut updated = trip.clone();
            updated.status = TripStatus::Active;
            updated.alerted_at = None;
            updated.expected_end_at = new_deadline;
            match self.store.compare_and_swap_status(expected, &updated).await {
                Ok(stored) => return Ok(stored),
                Err(AppError::ConcurrentModification) if attempt < CAS_RETRIES => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::ConcurrentModification)
    }

    /// Panic button. Transitions to emergency and notifies every trusted
    /// contact plus the configured escalation contact. Dispatch is awaited
    /// here given the urgency, but a delivery failure cannot undo the
    /// recorded transition.
    pub async fn report_unsafe(
        &self,
        traveler_id: &str,
        trip_id: &str,
    ) -> Result<Trip, AppError> {
        for attempt in 0..=CAS_RETRIES {
            let trip = self.load_owned(traveler_id, trip_id).await?;
            let now = Utc::now();
            let expected = match trip.status {
                TripStatus::Active => TripStatus::Active,
                TripStatus::Overdue => TripStatus::Overdue,
                _ => return Err(AppError::TripAlreadyTerminal),
            };
            let mut updated = trip.clone();
            updated.status = TripStatus::Emergency;
            updated.alerted_at = Some(now);
            match self.store.compare_and_swap_status(expected, &updated).await {
                Ok(stored) => {
                    warn!(trip_id = %stored.id, traveler = %stored.traveler_id, "traveler reported unsafe");
                    let message = self.emergency_message(&stored);
                    self.notify_contacts(&stored, &message, true).await;
                    return Ok(stored);
                }
                Err(AppError::ConcurrentModification) if attempt < CAS_RETRIES => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::ConcurrentModification)
    }

    fn emergency_message(&self, trip: &Trip) -> String {
        let position = match trip.last_route_sample() {
            Some(sample) => format!(
                " Last known position: {:.5}, {:.5} at {}.",
                sample.latitude,
                sample.longitude,
                sample.recorded_at.format("%H:%M UTC"),
            ),
            None => String::new(),
        };
        format!(
            "EMERGENCY: {} reported feeling unsafe on their trip to {}.{}",
            trip.traveler_name, trip.destination, position,
        )
    }

    /// The traveler reached their destination.
    pub async fn mark_arrived(
        &self,
        traveler_id: &str,
        trip_id: &str,
    ) -> Result<Trip, AppError> {
        let stored = self
            .finish_trip(traveler_id, trip_id, TripStatus::Completed)
            .await?;
        info!(trip_id = %stored.id, "trip completed");
        let message = format!(
            "{} arrived safely at {}.",
            stored.traveler_name, stored.destination,
        );
        self.notify_contacts(&stored, &message, false).await;
        Ok(stored)
    }

    pub async fn cancel_trip(
        &self,
        traveler_id: &str,
        trip_id: &str,
    ) -> Result<Trip, AppError> {
        let stored = self
            .finish_trip(traveler_id, trip_id, TripStatus::Cancelled)
            .await?;
        info!(trip_id = %stored.id, "trip cancelled");
        Ok(stored)
    }

    async fn finish_trip(
        &self,
        traveler_id: &str,
        trip_id: &str,
        terminal: TripStatus,
    ) -> Result<Trip, AppError> {
        for attempt in 0..=CAS_RETRIES {
            let trip = self.load_owned(traveler_id, trip_id).await?;
            let now = Utc::now();
            let expected = match trip.status {
                TripStatus::Active => TripStatus::Active,
                TripStatus::Overdue => TripStatus::Overdue,
                _ => return Err(AppError::TripAlreadyTerminal),
            };
            let mut updated = trip.clone();
            updated.status = terminal;
            match terminal {
                TripStatus::Completed => updated.completed_at = Some(now),
                TripStatus::Cancelled => updated.cancelled_at = Some(now),
                _ => unreachable!("finish_trip only targets terminal states"),
            }
            match self.store.compare_and_swap_status(expected, &updated).await {
                Ok(stored) => return Ok(stored),
                Err(AppError::ConcurrentModification) if attempt < CAS_RETRIES => continue,
                Err(err) => return Err(err),
            }
        }
        Err(AppError::ConcurrentModification)
    }

    /// Appends a location sample to the trip's route. Never touches the
    /// status or the deadline; a location stream cannot suppress overdue
    /// detection.
    pub async fn append_location_sample(
        &self,
        traveler_id: &str,
        trip_id: &str,
        sample: RouteSample,
    ) -> Result<Trip, AppError> {
        let trip = self.load_owned(traveler_id, trip_id).await?;
        if trip.status.is_terminal() {
            return Err(AppError::TripAlreadyTerminal);
        }
        // The monotonic-timestamp guard lives in the store, atomically with
        // the append.
        self.store.append_route_sample(&trip.id, sample).await
    }

    pub async fn get_trip(&self, traveler_id: &str, trip_id: &str) -> Result<Trip, AppError> {
        self.load_owned(traveler_id, trip_id).await
    }

    pub async fn active_trip(&self, traveler_id: &str) -> Result<Option<Trip>, AppError> {
        self.store.get_active_by_traveler(traveler_id).await
    }

    pub async fn trip_history(&self, traveler_id: &str) -> Result<Vec<Trip>, AppError> {
        self.store.list_by_traveler(traveler_id).await
    }

    /// One sweep over every active trip whose deadline has passed. Each
    /// candidate gets a single CAS; losing the race means the trip was
    /// resolved while scanning and is skipped without retry or notification.
    /// Returns the number of trips transitioned to overdue.
    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let candidates = self.store.list_active_with_expired_deadline(now).await?;
        let mut transitions = 0;
        for trip in candidates {
            let mut updated = trip.clone();
            updated.status = TripStatus::Overdue;
            updated.alerted_at = Some(now);
            match self
                .store
                .compare_and_swap_status(TripStatus::Active, &updated)
                .await
            {
                Ok(stored) => {
                    transitions += 1;
                    warn!(
                        trip_id = %stored.id,
                        traveler = %stored.traveler_id,
                        deadline = %stored.expected_end_at,
                        "trip overdue, notifying trusted contacts"
                    );
                    let message = format!(
                        "{} has not arrived at {} by the expected time ({}) and has not checked in. Please try to reach them.",
                        stored.traveler_name,
                        stored.destination,
                        stored.expected_end_at.format("%H:%M UTC"),
                    );
                    self.notify_contacts(&stored, &message, false).await;
                }
                Err(AppError::ConcurrentModification) | Err(AppError::NotFound) => {
                    debug!(trip_id = %trip.id, "trip resolved while scanning, skipping");
                }
                Err(err) => {
                    warn!(trip_id = %trip.id, error = %err, "overdue transition failed");
                }
            }
        }
        Ok(transitions)
    }

    async fn load_owned(&self, traveler_id: &str, trip_id: &str) -> Result<Trip, AppError> {
        let trip = self
            .store
            .get_by_id(trip_id)
            .await?
            .ok_or(AppError::NotFound)?;
        // The auth collaborator already authenticated the caller; this is
        // the ownership re-check, defense in depth.
        if trip.traveler_id != traveler_id {
            return Err(AppError::Unauthorized);
        }
        Ok(trip)
    }

    async fn notify_contacts(&self, trip: &Trip, message: &str, escalate: bool) {
        for contact in &trip.trusted_contacts {
            self.dispatch_one(trip, contact, message).await;
        }
        if escalate {
            if let Some(contact) = &self.escalation_contact {
                self.dispatch_one(trip, contact, message).await;
            }
        }
    }

    async fn dispatch_one(&self, trip: &Trip, contact: &TrustedContact, message: &str) {
        let attempt = self.dispatcher.send(contact, contact.channel, message);
        let timeout = std::time::Duration::from_secs(DISPATCH_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    trip_id = %trip.id,
                    contact = %contact.address,
                    error = %err,
                    "notification delivery failed"
                );
            }
            Err(_) => {
                warn!(
                    trip_id = %trip.id,
                    contact = %contact.address,
                    timeout_secs = DISPATCH_TIMEOUT_SECS,
                    "notification delivery timed out"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trip::Channel;
    use crate::store::memory::InMemoryTripStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Wraps the in-memory store so a test can park one `get_by_id` call
    /// mid-operation and commit a competing write before releasing it.
    struct GatedStore {
        inner: InMemoryTripStore,
        parked: Mutex<Option<oneshot::Sender<()>>>,
        release: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: InMemoryTripStore::new(),
                parked: Mutex::new(None),
                release: Mutex::new(None),
            }
        }

        fn arm(&self, parked: oneshot::Sender<()>, release: oneshot::Receiver<()>) {
            *self.parked.lock().unwrap() = Some(parked);
            *self.release.lock().unwrap() = Some(release);
        }
    }

    #[async_trait]
    impl TripStore for GatedStore {
        async fn create(&self, trip: &Trip) -> Result<(), AppError> {
            self.inner.create(trip).await
        }

        async fn get_by_id(&self, id: &str) -> Result<Option<Trip>, AppError> {
            let trip = self.inner.get_by_id(id).await;
            // Park after the read, so the caller proceeds with a snapshot
            // taken before whatever the test commits while it waits.
            let parked = self.parked.lock().unwrap().take();
            if let Some(tx) = parked {
                let release = self.release.lock().unwrap().take();
                let _ = tx.send(());
                if let Some(rx) = release {
                    let _ = rx.await;
                }
            }
            trip
        }

        async fn get_active_by_traveler(
            &self,
            traveler_id: &str,
        ) -> Result<Option<Trip>, AppError> {
            self.inner.get_active_by_traveler(traveler_id).await
        }

        async fn list_by_traveler(&self, traveler_id: &str) -> Result<Vec<Trip>, AppError> {
            self.inner.list_by_traveler(traveler_id).await
        }

        async fn list_active_with_expired_deadline(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<Trip>, AppError> {
            self.inner.list_active_with_expired_deadline(now).await
        }

        async fn compare_and_swap_status(
            &self,
            expected: TripStatus,
            updated: &Trip,
        ) -> Result<Trip, AppError> {
            self.inner.compare_and_swap_status(expected, updated).await
        }

        async fn touch_check_in(
            &self,
            id: &str,
            at: DateTime<Utc>,
        ) -> Result<Trip, AppError> {
            self.inner.touch_check_in(id, at).await
        }

        async fn append_route_sample(
            &self,
            id: &str,
            sample: RouteSample,
        ) -> Result<Trip, AppError> {
            self.inner.append_route_sample(id, sample).await
        }
    }

    #[derive(Default)]
    struct RecordingDispatcher {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingDispatcher {
        fn messages_for(&self, address: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, _)| a == address)
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn total(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationDispatcher for RecordingDispatcher {
        async fn send(
            &self,
            contact: &TrustedContact,
            _channel: Channel,
            message: &str,
        ) -> Result<(), AppError> {
            self.sent
                .lock()
                .unwrap()
                .push((contact.address.clone(), message.to_string()));
            Ok(())
        }
    }

    fn contact(address: &str) -> TrustedContact {
        TrustedContact {
            display_name: address.to_string(),
            address: address.to_string(),
            channel: Channel::Matrix,
        }
    }

    fn params(minutes: i64) -> TripParams {
        TripParams {
            destination: "North Library".into(),
            destination_lat: None,
            destination_lon: None,
            expected_duration_minutes: Some(minutes),
            expected_end_at: None,
            check_in_interval_minutes: Some(5),
            trusted_contacts: vec![contact("@mika:campus.example"), contact("@sam:campus.example")],
        }
    }

    fn engine_with(
        escalation: Option<TrustedContact>,
    ) -> (TripEngine, Arc<RecordingDispatcher>) {
        let store = Arc::new(InMemoryTripStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = TripEngine::new(store, dispatcher.clone(), escalation);
        (engine, dispatcher)
    }

    #[tokio::test]
    async fn overdue_notifies_each_contact_exactly_once() {
        let (engine, dispatcher) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        let start_messages = dispatcher.total();

        let later = Utc::now() + Duration::minutes(20);
        assert_eq!(engine.scan(later).await.unwrap(), 1);
        assert_eq!(dispatcher.total(), start_messages + 2);

        // Repeated scans while still overdue are no-ops.
        assert_eq!(engine.scan(later + Duration::minutes(1)).await.unwrap(), 0);
        assert_eq!(engine.scan(later + Duration::minutes(5)).await.unwrap(), 0);
        assert_eq!(dispatcher.total(), start_messages + 2);

        let stored = engine.get_trip("u1", &trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Overdue);
        assert!(stored.alerted_at.is_some());
    }

    #[tokio::test]
    async fn starting_a_second_trip_cancels_the_first() {
        let (engine, _) = engine_with(None);
        let first = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        let second = engine.start_trip("u1", "Alex", &params(15)).await.unwrap();

        let first = engine.get_trip("u1", &first.id).await.unwrap();
        assert_eq!(first.status, TripStatus::Cancelled);
        assert!(first.cancelled_at.is_some());
        assert!(first.completed_at.is_none());

        let second = engine.get_trip("u1", &second.id).await.unwrap();
        assert_eq!(second.status, TripStatus::Active);
        assert_eq!(
            engine.active_trip("u1").await.unwrap().unwrap().id,
            second.id
        );
    }

    #[tokio::test]
    async fn late_check_in_reactivates_with_future_deadline() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        engine.scan(Utc::now() + Duration::minutes(20)).await.unwrap();

        let stored = engine.check_in("u1", &trip.id, None).await.unwrap();
        assert_eq!(stored.status, TripStatus::Active);
        assert!(stored.alerted_at.is_none());
        assert!(stored.expected_end_at > Utc::now());
        assert!(stored.last_check_in_at.is_some());
    }

    #[tokio::test]
    async fn check_in_before_deadline_only_stamps() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        let stored = engine.check_in("u1", &trip.id, None).await.unwrap();
        assert_eq!(stored.status, TripStatus::Active);
        assert_eq!(stored.expected_end_at, trip.expected_end_at);
        assert!(stored.last_check_in_at.is_some());
    }

    #[tokio::test]
    async fn stale_check_in_cannot_revert_a_committed_extension() {
        let store = Arc::new(GatedStore::new());
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = TripEngine::new(store.clone(), dispatcher, None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();

        // Park the check-in between its read and its write, and extend the
        // deadline while it waits on a snapshot with the old deadline.
        let (parked_tx, parked_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        store.arm(parked_tx, release_rx);

        let racing = {
            let engine = engine.clone();
            let trip_id = trip.id.clone();
            tokio::spawn(async move { engine.check_in("u1", &trip_id, None).await })
        };
        parked_rx.await.unwrap();

        let extended = Utc::now() + Duration::minutes(45);
        engine.extend_deadline("u1", &trip.id, extended).await.unwrap();

        release_tx.send(()).unwrap();
        racing.await.unwrap().unwrap();

        let stored = engine.get_trip("u1", &trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Active);
        assert_eq!(stored.expected_end_at, extended);
        assert!(stored.last_check_in_at.is_some());
    }

    #[tokio::test]
    async fn explicit_deadline_on_an_active_check_in_extends() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();

        let target = Utc::now() + Duration::minutes(90);
        let stored = engine.check_in("u1", &trip.id, Some(target)).await.unwrap();
        assert_eq!(stored.status, TripStatus::Active);
        assert_eq!(stored.expected_end_at, target);
        assert!(stored.last_check_in_at.is_some());

        let err = engine
            .check_in("u1", &trip.id, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTripParameters(_)));
    }

    struct StalledDispatcher;

    #[async_trait]
    impl NotificationDispatcher for StalledDispatcher {
        async fn send(
            &self,
            _contact: &TrustedContact,
            _channel: Channel,
            _message: &str,
        ) -> Result<(), AppError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_stalled_dispatcher_cannot_wedge_the_sweep() {
        let store = Arc::new(InMemoryTripStore::new());
        let engine = TripEngine::new(store, Arc::new(StalledDispatcher), None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();

        // Each delivery attempt hangs for an hour; the per-contact timeout
        // must cut it off and let the sweep record the transition anyway.
        let transitions = engine.scan(Utc::now() + Duration::minutes(20)).await.unwrap();
        assert_eq!(transitions, 1);

        let stored = engine.get_trip("u1", &trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Overdue);
        assert!(stored.alerted_at.is_some());
    }

    #[tokio::test]
    async fn terminal_trips_reject_every_mutation() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        engine.mark_arrived("u1", &trip.id).await.unwrap();

        let sample = RouteSample {
            latitude: 48.1,
            longitude: 11.5,
            recorded_at: Utc::now(),
        };
        for err in [
            engine.check_in("u1", &trip.id, None).await.unwrap_err(),
            engine.report_unsafe("u1", &trip.id).await.unwrap_err(),
            engine.mark_arrived("u1", &trip.id).await.unwrap_err(),
            engine.cancel_trip("u1", &trip.id).await.unwrap_err(),
            engine
                .extend_deadline("u1", &trip.id, Utc::now() + Duration::minutes(30))
                .await
                .unwrap_err(),
            engine
                .append_location_sample("u1", &trip.id, sample)
                .await
                .unwrap_err(),
        ] {
            assert!(matches!(err, AppError::TripAlreadyTerminal));
        }

        let stored = engine.get_trip("u1", &trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Completed);
    }

    #[tokio::test]
    async fn report_unsafe_is_terminal_and_escalates() {
        let escalation = contact("@security:campus.example");
        let (engine, dispatcher) = engine_with(Some(escalation));
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();

        let stored = engine.report_unsafe("u1", &trip.id).await.unwrap();
        assert_eq!(stored.status, TripStatus::Emergency);
        assert!(stored.alerted_at.is_some());

        let security = dispatcher.messages_for("@security:campus.example");
        assert_eq!(security.len(), 1);
        assert!(security[0].contains("EMERGENCY"));

        let err = engine.check_in("u1", &trip.id, None).await.unwrap_err();
        assert!(matches!(err, AppError::TripAlreadyTerminal));
    }

    #[tokio::test]
    async fn route_appends_never_touch_status_or_deadline() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        let base = Utc::now();
        for i in 0..5 {
            engine
                .append_location_sample(
                    "u1",
                    &trip.id,
                    RouteSample {
                        latitude: 48.1 + f64::from(i) * 0.001,
                        longitude: 11.5,
                        recorded_at: base + Duration::seconds(i64::from(i) * 30),
                    },
                )
                .await
                .unwrap();
        }
        let stored = engine.get_trip("u1", &trip.id).await.unwrap();
        assert_eq!(stored.route.len(), 5);
        assert_eq!(stored.status, TripStatus::Active);
        assert_eq!(stored.expected_end_at, trip.expected_end_at);
    }

    #[tokio::test]
    async fn cancel_racing_a_scan_never_double_notifies() {
        let (engine, dispatcher) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(1)).await.unwrap();
        let start_messages = dispatcher.total();

        let later = Utc::now() + Duration::minutes(5);
        let (cancelled, transitions) =
            tokio::join!(engine.cancel_trip("u1", &trip.id), engine.scan(later));
        let transitions = transitions.unwrap();

        // The loser's CAS is rejected; overdue contacts are told at most once.
        let overdue_messages = dispatcher.total() - start_messages;
        assert!(transitions <= 1);
        assert_eq!(overdue_messages, transitions * 2);
        // Cancel retries after a lost race (overdue is still cancellable),
        // so the trip always ends up cancelled.
        assert_eq!(cancelled.unwrap().status, TripStatus::Cancelled);
    }

    #[tokio::test]
    async fn rejects_invalid_parameters() {
        let (engine, _) = engine_with(None);

        let mut bad = params(10);
        bad.expected_duration_minutes = Some(0);
        assert!(matches!(
            engine.start_trip("u1", "Alex", &bad).await.unwrap_err(),
            AppError::InvalidTripParameters(_)
        ));

        let mut bad = params(10);
        bad.destination = "   ".into();
        assert!(matches!(
            engine.start_trip("u1", "Alex", &bad).await.unwrap_err(),
            AppError::InvalidTripParameters(_)
        ));

        let mut bad = params(10);
        bad.expected_end_at = Some(Utc::now() + Duration::minutes(5));
        assert!(matches!(
            engine.start_trip("u1", "Alex", &bad).await.unwrap_err(),
            AppError::InvalidTripParameters(_)
        ));
    }

    #[tokio::test]
    async fn foreign_trips_are_unauthorized() {
        let (engine, _) = engine_with(None);
        let trip = engine.start_trip("u1", "Alex", &params(10)).await.unwrap();
        assert!(matches!(
            engine.check_in("u2", &trip.id, None).await.unwrap_err(),
            AppError::Unauthorized
        ));
        assert!(matches!(
            engine.report_unsafe("u2", &trip.id).await.unwrap_err(),
            AppError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn duplicate_contacts_are_collapsed_at_start() {
        let (engine, dispatcher) = engine_with(None);
        let mut p = params(10);
        p.trusted_contacts.push(contact("@mika:campus.example"));
        let trip = engine.start_trip("u1", "Alex", &p).await.unwrap();
        assert_eq!(trip.trusted_contacts.len(), 2);
        assert_eq!(dispatcher.messages_for("@mika:campus.example").len(), 1);
    }
}
