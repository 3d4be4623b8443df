use crate::availability::{bookable_slots, validate_schedule};
use crate::backend::BookingBackend;
use crate::broadcast::MessageBroadcaster;
use crate::clock::Clock;
use crate::conflict::{ConflictChecker, SlotCandidate, SlotVerdict};
use crate::deadline::{with_deadline, within};
use crate::error::{BookingError, StoreError};
use crate::types::{
    Booking, BookingStatus, Caller, Counselor, DayAvailability, NewBooking, PaymentStatus, Role,
    SessionType, TimeSlot,
};
use chrono::NaiveDate;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct BookingRequest {
    pub counselor_id: Uuid,
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub session_type: SessionType,
}

/// Booking details the payment gateway echoes back after checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMetadata {
    pub counselor_id: Uuid,
    pub client_id: Uuid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub session_type: SessionType,
    /// Settled amount in minor currency units.
    pub settled_amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingOutcome {
    pub booking: Booking,
    /// `None` when the booking was stored but the conversation could not be
    /// opened; `warning` then says why.
    pub channel_id: Option<Uuid>,
    pub warning: Option<String>,
}

#[derive(Clone)]
pub struct BookingCoordinator<T: BookingBackend> {
    pub(crate) backend: T,
    pub(crate) checker: ConflictChecker<T>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) broadcaster: Arc<dyn MessageBroadcaster>,
    pub(crate) store_timeout: Duration,
}

impl<T: BookingBackend> BookingCoordinator<T> {
    pub fn new(
        backend: T,
        clock: Arc<dyn Clock>,
        broadcaster: Arc<dyn MessageBroadcaster>,
        store_timeout: Duration,
    ) -> Self {
        let checker = ConflictChecker::new(backend.clone(), clock.clone(), store_timeout);
        Self {
            backend,
            checker,
            clock,
            broadcaster,
            store_timeout,
        }
    }

    pub(crate) async fn io<R, F>(&self, operation: &str, future: F) -> Result<R, BookingError>
    where
        F: Future<Output = Result<R, StoreError>>,
    {
        with_deadline(self.store_timeout, operation, future).await
    }

    pub async fn counselor_availability(
        &self,
        counselor_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, BookingError> {
        let counselor = self.checker.counselor(counselor_id).await?;
        Ok(bookable_slots(&counselor.availability, date, self.clock.now()))
    }

    pub async fn validate_slot(&self, candidate: &SlotCandidate) -> Result<SlotVerdict, BookingError> {
        self.checker.validate(candidate).await
    }

    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingOutcome, BookingError> {
        if request.client_id == request.counselor_id {
            return Err(BookingError::InvalidInput(
                "a counselor cannot book their own slot".into(),
            ));
        }

        let candidate = SlotCandidate {
            counselor_id: request.counselor_id,
            date: request.date,
            slot: request.slot,
        };
        let verdict = self.checker.validate(&candidate).await?;

        let new_booking = NewBooking {
            client_id: request.client_id,
            counselor_id: verdict.counselor_id,
            date: candidate.date,
            slot: candidate.slot.clone(),
            session_type: request.session_type,
            amount: verdict.hourly_rate,
            payment_status: PaymentStatus::Pending,
            payment_reference: None,
        };
        self.commit(&candidate, new_booking).await
    }

    /// Books a slot the client has already paid for. Redelivered callbacks
    /// for the same payment return the booking created the first time.
    pub async fn confirm_paid_booking(
        &self,
        payment_reference: &str,
        metadata: PaymentMetadata,
    ) -> Result<BookingOutcome, BookingError> {
        if let Some(existing) = self
            .io(
                "find booking by payment",
                self.backend.booking_by_payment_reference(payment_reference),
            )
            .await?
        {
            info!(booking_id = %existing.id, payment_reference, "Payment already confirmed");
            return Ok(self.with_channel(existing).await);
        }

        if metadata.client_id == metadata.counselor_id {
            return Err(BookingError::InvalidInput(
                "a counselor cannot book their own slot".into(),
            ));
        }
        if let Some(minor) = metadata.settled_amount.filter(|minor| *minor <= 0) {
            return Err(BookingError::InvalidInput(format!(
                "settled amount must be positive, got {minor}"
            )));
        }

        let counselor = self.checker.counselor(metadata.counselor_id).await?;
        let amount = metadata
            .settled_amount
            .map(|minor| minor as f64 / 100.0)
            .unwrap_or(counselor.hourly_rate);

        let candidate = SlotCandidate {
            counselor_id: counselor.user_id,
            date: metadata.date,
            slot: metadata.slot,
        };
        let new_booking = NewBooking {
            client_id: metadata.client_id,
            counselor_id: counselor.user_id,
            date: candidate.date,
            slot: candidate.slot.clone(),
            session_type: metadata.session_type,
            amount,
            payment_status: PaymentStatus::Paid,
            payment_reference: Some(payment_reference.to_string()),
        };

        self.commit(&candidate, new_booking).await.inspect_err(|err| {
            if matches!(err, BookingError::SlotAlreadyBooked { .. }) {
                warn!(
                    payment_reference,
                    counselor_id = %candidate.counselor_id,
                    date = %candidate.date,
                    slot = %candidate.slot,
                    "Paid slot was taken in the meantime, payment needs a refund"
                );
            }
        })
    }

    /// Collision re-check directly before the write, conditional insert,
    /// then the conversation channel.
    async fn commit(
        &self,
        candidate: &SlotCandidate,
        new_booking: NewBooking,
    ) -> Result<BookingOutcome, BookingError> {
        let client_id = new_booking.client_id;
        let payment_reference = new_booking.payment_reference.clone();

        if let Err(err) = self.checker.check_collision(candidate).await {
            return match self.paid_earlier(payment_reference.as_deref()).await? {
                Some(existing) => Ok(self.with_channel(existing).await),
                None => Err(err),
            };
        }

        let booking = match within(
            self.store_timeout,
            "insert booking",
            self.backend.insert_booking(new_booking),
        )
        .await
        {
            Ok(Ok(booking)) => booking,
            Ok(Err(StoreError::Conflict(reason))) => {
                if let Some(existing) = self.paid_earlier(payment_reference.as_deref()).await? {
                    return Ok(self.with_channel(existing).await);
                }
                info!(%reason, "Concurrent booking won the slot");
                return Err(candidate.already_booked());
            }
            Ok(Err(err)) => return Err(err.into()),
            // The write may still have landed after the deadline.
            Err(timed_out) => {
                match self
                    .landed_late(candidate, client_id, payment_reference.as_deref())
                    .await?
                {
                    Some(booking) => {
                        warn!(booking_id = %booking.id, "Booking insert outlived its deadline but was stored");
                        booking
                    }
                    None => return Err(timed_out),
                }
            }
        };

        info!(
            booking_id = %booking.id,
            counselor_id = %booking.counselor_id,
            client_id = %booking.client_id,
            date = %booking.date,
            slot = %candidate.slot,
            payment_status = booking.payment_status.as_str(),
            "Booking created"
        );
        Ok(self.with_channel(booking).await)
    }

    /// The booking a concurrent delivery of the same payment already stored.
    async fn paid_earlier(
        &self,
        payment_reference: Option<&str>,
    ) -> Result<Option<Booking>, BookingError> {
        let Some(reference) = payment_reference else {
            return Ok(None);
        };
        self.io(
            "find booking by payment",
            self.backend.booking_by_payment_reference(reference),
        )
        .await
    }

    /// The booking of this very request, if a timed out insert committed.
    async fn landed_late(
        &self,
        candidate: &SlotCandidate,
        client_id: Uuid,
        payment_reference: Option<&str>,
    ) -> Result<Option<Booking>, BookingError> {
        let active = self
            .io(
                "find stored booking",
                self.backend
                    .active_booking(candidate.counselor_id, candidate.date, &candidate.slot),
            )
            .await?;
        Ok(active.filter(|booking| {
            booking.client_id == client_id
                && booking.payment_reference.as_deref() == payment_reference
        }))
    }

    /// A failed channel upsert never undoes the booking; the room is created
    /// lazily on the first message instead.
    async fn with_channel(&self, booking: Booking) -> BookingOutcome {
        match self
            .io(
                "upsert chat room",
                self.backend
                    .upsert_chat_room(booking.client_id, booking.counselor_id),
            )
            .await
        {
            Ok(room) => BookingOutcome {
                booking,
                channel_id: Some(room.id),
                warning: None,
            },
            Err(err) => {
                warn!(booking_id = %booking.id, %err, "Booking stored without a conversation");
                BookingOutcome {
                    booking,
                    channel_id: None,
                    warning: Some(format!(
                        "booking confirmed, but the conversation could not be opened: {err}"
                    )),
                }
            }
        }
    }

    pub async fn update_booking_status(
        &self,
        booking_id: Uuid,
        actor_id: Uuid,
        next: BookingStatus,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .io("load booking", self.backend.booking(booking_id))
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;

        if !booking.involves(actor_id) {
            return Err(BookingError::Forbidden(
                "not a party to this booking".into(),
            ));
        }
        if next == BookingStatus::Completed && actor_id != booking.counselor_id {
            return Err(BookingError::Forbidden(
                "only the counselor can complete a booking".into(),
            ));
        }
        if !booking.status.can_transition_to(next) {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                to: next,
            });
        }

        match within(
            self.store_timeout,
            "update booking status",
            self.backend
                .transition_booking(booking_id, BookingStatus::Scheduled, next),
        )
        .await?
        {
            Ok(updated) => {
                info!(%booking_id, %actor_id, status = %next, "Booking status changed");
                Ok(updated)
            }
            Err(StoreError::Conflict(_)) => {
                let current = self
                    .io("load booking", self.backend.booking(booking_id))
                    .await?
                    .map(|booking| booking.status)
                    .unwrap_or(booking.status);
                Err(BookingError::InvalidTransition {
                    from: current,
                    to: next,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn list_bookings(
        &self,
        caller: Caller,
        limit: Option<usize>,
    ) -> Result<Vec<Booking>, BookingError> {
        let mut bookings = match caller.role {
            Role::Client => {
                self.io(
                    "list client bookings",
                    self.backend.bookings_for_client(caller.user_id),
                )
                .await?
            }
            Role::Counselor => {
                self.io(
                    "list counselor bookings",
                    self.backend.scheduled_bookings_for_counselor(caller.user_id),
                )
                .await?
            }
        };
        if let Some(limit) = limit {
            bookings.truncate(limit);
        }
        Ok(bookings)
    }

    pub async fn schedule(&self, caller: Caller) -> Result<Counselor, BookingError> {
        if caller.role != Role::Counselor {
            return Err(BookingError::Forbidden("only counselors have a schedule".into()));
        }
        self.checker.counselor(caller.user_id).await
    }

    /// Replaces the caller's whole availability and rate, creating the
    /// counselor profile on first save.
    pub async fn update_schedule(
        &self,
        caller: Caller,
        availability: Vec<DayAvailability>,
        hourly_rate: f64,
    ) -> Result<Counselor, BookingError> {
        if caller.role != Role::Counselor {
            return Err(BookingError::Forbidden(
                "only counselors can publish a schedule".into(),
            ));
        }
        if !hourly_rate.is_finite() || hourly_rate <= 0.0 {
            return Err(BookingError::InvalidInput(
                "hourly rate must be a positive amount".into(),
            ));
        }
        validate_schedule(&availability).map_err(BookingError::InvalidInput)?;

        let counselor = self
            .io(
                "save schedule",
                self.backend.upsert_counselor(Counselor {
                    user_id: caller.user_id,
                    hourly_rate,
                    availability,
                }),
            )
            .await?;
        info!(
            counselor_id = %counselor.user_id,
            days = counselor.availability.len(),
            "Schedule updated"
        );
        Ok(counselor)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::broadcast::MockMessageBroadcaster;
    use crate::clock::MockClock;
    use crate::local_backend::LocalBackend;
    use crate::testutils::MockBookingBackend;
    use std::sync::atomic::Ordering;

    fn june_10() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn clock_at(hour: u32, minute: u32) -> Arc<dyn Clock> {
        let mut clock = MockClock::new();
        clock
            .expect_now()
            .return_const(june_10().and_hms_opt(hour, minute, 0).unwrap());
        Arc::new(clock)
    }

    fn quiet_broadcaster() -> Arc<dyn MessageBroadcaster> {
        let mut broadcaster = MockMessageBroadcaster::new();
        broadcaster.expect_publish().return_const(());
        Arc::new(broadcaster)
    }

    fn counselor_caller(user_id: Uuid) -> Caller {
        Caller {
            user_id,
            role: Role::Counselor,
        }
    }

    async fn setup() -> (BookingCoordinator<LocalBackend>, Uuid) {
        let coordinator = BookingCoordinator::new(
            LocalBackend::default(),
            clock_at(7, 0),
            quiet_broadcaster(),
            Duration::from_secs(1),
        );
        let counselor_id = Uuid::new_v4();
        coordinator
            .update_schedule(
                counselor_caller(counselor_id),
                vec![
                    DayAvailability {
                        day: june_10(),
                        slots: vec![TimeSlot::new("09:00", "10:00")],
                    },
                    DayAvailability {
                        day: june_10().succ_opt().unwrap(),
                        slots: vec![TimeSlot::new("09:00", "10:00")],
                    },
                ],
                60.0,
            )
            .await
            .unwrap();
        (coordinator, counselor_id)
    }

    fn request(counselor_id: Uuid, client_id: Uuid, date: NaiveDate) -> BookingRequest {
        BookingRequest {
            counselor_id,
            client_id,
            date,
            slot: TimeSlot::new("09:00", "10:00"),
            session_type: SessionType::Video,
        }
    }

    fn metadata(counselor_id: Uuid, client_id: Uuid) -> PaymentMetadata {
        PaymentMetadata {
            counselor_id,
            client_id,
            date: june_10(),
            slot: TimeSlot::new("09:00", "10:00"),
            session_type: SessionType::Video,
            settled_amount: Some(6000),
        }
    }

    #[tokio::test]
    async fn test_book_reject_cancel_rebook() {
        let (coordinator, counselor_id) = setup().await;
        let first_client = Uuid::new_v4();

        let first = coordinator
            .create_booking(request(counselor_id, first_client, june_10()))
            .await
            .unwrap();
        assert_eq!(first.booking.status, BookingStatus::Scheduled);
        assert_eq!(first.booking.amount, 60.0);
        assert_eq!(first.booking.payment_status, PaymentStatus::Pending);
        assert!(first.channel_id.is_some());

        let err = coordinator
            .create_booking(request(counselor_id, Uuid::new_v4(), june_10()))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotAlreadyBooked { .. }));

        coordinator
            .update_booking_status(first.booking.id, first_client, BookingStatus::Cancelled)
            .await
            .unwrap();

        let third = coordinator
            .create_booking(request(counselor_id, Uuid::new_v4(), june_10()))
            .await
            .unwrap();
        assert_eq!(third.booking.status, BookingStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_sub_slot_is_rejected() {
        let (coordinator, counselor_id) = setup().await;
        let mut sub_slot = request(counselor_id, Uuid::new_v4(), june_10());
        sub_slot.slot = TimeSlot::new("09:00", "09:30");
        let err = coordinator.create_booking(sub_slot).await.unwrap_err();
        assert!(matches!(err, BookingError::SlotNotAvailable { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_bookings_yield_one_winner() {
        let (coordinator, counselor_id) = setup().await;
        let attempts = (0..8).map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .create_booking(request(counselor_id, Uuid::new_v4(), june_10()))
                    .await
            })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let successes = results.iter().filter(|result| result.is_ok()).count();
        let collisions = results
            .iter()
            .filter(|result| matches!(result, Err(BookingError::SlotAlreadyBooked { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(collisions, results.len() - 1);
    }

    #[tokio::test]
    async fn test_channel_is_reused_across_bookings() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();

        let monday = coordinator
            .create_booking(request(counselor_id, client_id, june_10()))
            .await
            .unwrap();
        let tuesday = coordinator
            .create_booking(request(
                counselor_id,
                client_id,
                june_10().succ_opt().unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(monday.channel_id, tuesday.channel_id);
    }

    #[tokio::test]
    async fn test_paid_and_direct_bookings_have_the_same_shape() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();

        let paid = coordinator
            .confirm_paid_booking("pi_123", metadata(counselor_id, client_id))
            .await
            .unwrap();
        let mut direct_request = request(counselor_id, client_id, june_10().succ_opt().unwrap());
        direct_request.session_type = SessionType::Video;
        let direct = coordinator.create_booking(direct_request).await.unwrap();

        assert_eq!(paid.booking.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.booking.payment_reference.as_deref(), Some("pi_123"));
        assert_eq!(paid.booking.amount, 60.0);
        assert_eq!(direct.booking.payment_status, PaymentStatus::Pending);

        let normalized = Booking {
            id: direct.booking.id,
            date: direct.booking.date,
            created_at: direct.booking.created_at,
            payment_status: direct.booking.payment_status,
            payment_reference: direct.booking.payment_reference.clone(),
            ..paid.booking.clone()
        };
        assert_eq!(normalized, direct.booking);
        assert_eq!(paid.channel_id, direct.channel_id);
    }

    #[tokio::test]
    async fn test_redelivered_payment_is_idempotent() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();

        let first = coordinator
            .confirm_paid_booking("pi_42", metadata(counselor_id, client_id))
            .await
            .unwrap();
        let second = coordinator
            .confirm_paid_booking("pi_42", metadata(counselor_id, client_id))
            .await
            .unwrap();
        assert_eq!(first.booking.id, second.booking.id);
        assert_eq!(first.channel_id, second.channel_id);
    }

    #[tokio::test]
    async fn test_paid_booking_without_settled_amount_uses_rate() {
        let (coordinator, counselor_id) = setup().await;
        let mut details = metadata(counselor_id, Uuid::new_v4());
        details.settled_amount = None;
        let outcome = coordinator
            .confirm_paid_booking("pi_7", details)
            .await
            .unwrap();
        assert_eq!(outcome.booking.amount, 60.0);
    }

    #[tokio::test]
    async fn test_paid_booking_loses_taken_slot() {
        let (coordinator, counselor_id) = setup().await;
        coordinator
            .create_booking(request(counselor_id, Uuid::new_v4(), june_10()))
            .await
            .unwrap();
        let err = coordinator
            .confirm_paid_booking("pi_late", metadata(counselor_id, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::SlotAlreadyBooked { .. }));
    }

    #[tokio::test]
    async fn test_status_rules() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();
        let booking = coordinator
            .create_booking(request(counselor_id, client_id, june_10()))
            .await
            .unwrap()
            .booking;

        let err = coordinator
            .update_booking_status(booking.id, Uuid::new_v4(), BookingStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));

        let err = coordinator
            .update_booking_status(booking.id, client_id, BookingStatus::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));

        let completed = coordinator
            .update_booking_status(booking.id, counselor_id, BookingStatus::Completed)
            .await
            .unwrap();
        assert_eq!(completed.status, BookingStatus::Completed);

        let err = coordinator
            .update_booking_status(booking.id, client_id, BookingStatus::Cancelled)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BookingError::InvalidTransition {
                from: BookingStatus::Completed,
                to: BookingStatus::Cancelled,
            }
        );

        let err = coordinator
            .update_booking_status(Uuid::new_v4(), client_id, BookingStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_availability_for_counselor() {
        let (coordinator, counselor_id) = setup().await;
        let slots = coordinator
            .counselor_availability(counselor_id, june_10())
            .await
            .unwrap();
        assert_eq!(slots, vec![TimeSlot::new("09:00", "10:00")]);

        let err = coordinator
            .counselor_availability(Uuid::new_v4(), june_10())
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_bookings_by_role() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();
        for date in [june_10(), june_10().succ_opt().unwrap()] {
            coordinator
                .create_booking(request(counselor_id, client_id, date))
                .await
                .unwrap();
        }

        let client_view = coordinator
            .list_bookings(
                Caller {
                    user_id: client_id,
                    role: Role::Client,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(client_view.len(), 2);
        assert!(client_view[0].date > client_view[1].date);

        let counselor_view = coordinator
            .list_bookings(counselor_caller(counselor_id), Some(1))
            .await
            .unwrap();
        assert_eq!(counselor_view.len(), 1);
        assert_eq!(counselor_view[0].date, june_10());
    }

    #[tokio::test]
    async fn test_schedule_rules() {
        let (coordinator, counselor_id) = setup().await;
        let client = Caller {
            user_id: Uuid::new_v4(),
            role: Role::Client,
        };
        let err = coordinator
            .update_schedule(client, vec![], 50.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::Forbidden(_)));

        let err = coordinator
            .update_schedule(counselor_caller(counselor_id), vec![], 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));

        let overlapping = vec![DayAvailability {
            day: june_10(),
            slots: vec![
                TimeSlot::new("09:00", "10:00"),
                TimeSlot::new("09:30", "10:30"),
            ],
        }];
        let err = coordinator
            .update_schedule(counselor_caller(counselor_id), overlapping, 50.0)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));

        let schedule = coordinator
            .schedule(counselor_caller(counselor_id))
            .await
            .unwrap();
        assert_eq!(schedule.hourly_rate, 60.0);
    }

    #[tokio::test]
    async fn test_self_booking_is_rejected() {
        let (coordinator, counselor_id) = setup().await;
        let err = coordinator
            .create_booking(request(counselor_id, counselor_id, june_10()))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_channel_failure_keeps_booking() {
        let backend = MockBookingBackend::new();
        let counselor_id = Uuid::new_v4();
        backend.add_counselor(Counselor {
            user_id: counselor_id,
            hourly_rate: 40.0,
            availability: vec![DayAvailability {
                day: june_10(),
                slots: vec![TimeSlot::new("09:00", "10:00")],
            }],
        });
        backend.0.fail_chat_rooms.store(true, Ordering::SeqCst);

        let coordinator = BookingCoordinator::new(
            backend.clone(),
            clock_at(7, 0),
            quiet_broadcaster(),
            Duration::from_secs(1),
        );
        let outcome = coordinator
            .create_booking(request(counselor_id, Uuid::new_v4(), june_10()))
            .await
            .unwrap();
        assert!(outcome.channel_id.is_none());
        assert!(outcome.warning.is_some());
        assert_eq!(backend.0.calls_to_insert_booking.load(Ordering::SeqCst), 1);
    }

    fn slow_insert_coordinator() -> (BookingCoordinator<MockBookingBackend>, MockBookingBackend, Uuid) {
        let backend = MockBookingBackend::new();
        let counselor_id = Uuid::new_v4();
        backend.add_counselor(Counselor {
            user_id: counselor_id,
            hourly_rate: 60.0,
            availability: vec![DayAvailability {
                day: june_10(),
                slots: vec![TimeSlot::new("09:00", "10:00")],
            }],
        });
        backend.0.insert_delay_ms.store(300, Ordering::SeqCst);
        let coordinator = BookingCoordinator::new(
            backend.clone(),
            clock_at(7, 0),
            quiet_broadcaster(),
            Duration::from_millis(50),
        );
        (coordinator, backend, counselor_id)
    }

    #[tokio::test]
    async fn test_insert_stored_after_deadline_still_opens_channel() {
        let (coordinator, backend, counselor_id) = slow_insert_coordinator();
        let client_id = Uuid::new_v4();

        let outcome = coordinator
            .create_booking(request(counselor_id, client_id, june_10()))
            .await
            .unwrap();
        assert_eq!(outcome.booking.client_id, client_id);
        assert!(outcome.channel_id.is_some());
        assert_eq!(backend.0.calls_to_insert_booking.load(Ordering::SeqCst), 1);
        assert_eq!(backend.0.calls_to_upsert_chat_room.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_paid_insert_stored_after_deadline_is_confirmed() {
        let (coordinator, backend, counselor_id) = slow_insert_coordinator();

        let outcome = coordinator
            .confirm_paid_booking("pi_slow", metadata(counselor_id, Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(outcome.booking.payment_reference.as_deref(), Some("pi_slow"));
        assert!(outcome.channel_id.is_some());
        assert_eq!(backend.0.calls_to_upsert_chat_room.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_payment_deliveries_share_one_booking() {
        let (coordinator, counselor_id) = setup().await;
        let client_id = Uuid::new_v4();
        let deliveries = (0..2).map(|_| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .confirm_paid_booking("pi_x", metadata(counselor_id, client_id))
                    .await
            })
        });
        let outcomes: Vec<BookingOutcome> = futures::future::join_all(deliveries)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(outcomes[0].booking.id, outcomes[1].booking.id);
        assert!(outcomes[0].channel_id.is_some());
        assert_eq!(outcomes[0].channel_id, outcomes[1].channel_id);
        let bookings = coordinator
            .list_bookings(counselor_caller(counselor_id), None)
            .await
            .unwrap();
        assert_eq!(bookings.len(), 1);
    }

    #[test_case::test_case(Some(0) ; "zero")]
    #[test_case::test_case(Some(-6000) ; "negative")]
    #[tokio::test]
    async fn test_paid_booking_rejects_non_positive_amount(settled_amount: Option<i64>) {
        let (coordinator, counselor_id) = setup().await;
        let mut details = metadata(counselor_id, Uuid::new_v4());
        details.settled_amount = settled_amount;
        let err = coordinator
            .confirm_paid_booking("pi_zero", details)
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_paid_self_booking_is_rejected() {
        let (coordinator, counselor_id) = setup().await;
        let err = coordinator
            .confirm_paid_booking("pi_self", metadata(counselor_id, counselor_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BookingError::InvalidInput(_)));
        let bookings = coordinator
            .list_bookings(counselor_caller(counselor_id), None)
            .await
            .unwrap();
        assert!(bookings.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_surfaces_as_unavailable() {
        let backend = MockBookingBackend::new();
        backend.0.success.store(false, Ordering::SeqCst);
        let coordinator = BookingCoordinator::new(
            backend,
            clock_at(7, 0),
            quiet_broadcaster(),
            Duration::from_secs(1),
        );
        let err = coordinator
            .counselor_availability(Uuid::new_v4(), june_10())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
