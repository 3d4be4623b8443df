use crate::availability::{is_elapsed, slots_for_date};
use crate::backend::BookingBackend;
use crate::clock::Clock;
use crate::deadline::with_deadline;
use crate::error::BookingError;
use crate::types::{Counselor, TimeSlot};
use chrono::NaiveDate;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct SlotCandidate {
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
}

impl SlotCandidate {
    fn not_available(&self, reason: impl Into<String>) -> BookingError {
        BookingError::SlotNotAvailable {
            date: self.date,
            start_time: self.slot.start_time.clone(),
            end_time: self.slot.end_time.clone(),
            reason: reason.into(),
        }
    }

    pub fn already_booked(&self) -> BookingError {
        BookingError::SlotAlreadyBooked {
            date: self.date,
            start_time: self.slot.start_time.clone(),
            end_time: self.slot.end_time.clone(),
        }
    }
}

/// Outcome of a successful check. Carries what pricing needs downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotVerdict {
    pub counselor_id: Uuid,
    pub hourly_rate: f64,
}

/// Decides whether a candidate slot can be booked. Never writes.
#[derive(Clone)]
pub struct ConflictChecker<T: BookingBackend> {
    backend: T,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl<T: BookingBackend> ConflictChecker<T> {
    pub fn new(backend: T, clock: Arc<dyn Clock>, store_timeout: Duration) -> Self {
        Self {
            backend,
            clock,
            store_timeout,
        }
    }

    pub async fn validate(&self, candidate: &SlotCandidate) -> Result<SlotVerdict, BookingError> {
        let counselor = self.counselor(candidate.counselor_id).await?;
        self.check_published(&counselor, candidate)?;
        self.check_collision(candidate).await?;

        debug!(
            counselor_id = %candidate.counselor_id,
            date = %candidate.date,
            slot = %candidate.slot,
            "Slot is bookable"
        );
        Ok(SlotVerdict {
            counselor_id: counselor.user_id,
            hourly_rate: counselor.hourly_rate,
        })
    }

    pub async fn counselor(&self, counselor_id: Uuid) -> Result<Counselor, BookingError> {
        with_deadline(
            self.store_timeout,
            "load counselor",
            self.backend.counselor(counselor_id),
        )
        .await?
        .ok_or_else(|| BookingError::NotFound(format!("counselor {counselor_id}")))
    }

    /// The candidate must match a published slot exactly and must not have
    /// started yet.
    pub fn check_published(
        &self,
        counselor: &Counselor,
        candidate: &SlotCandidate,
    ) -> Result<(), BookingError> {
        let published = slots_for_date(&counselor.availability, candidate.date)
            .iter()
            .any(|slot| slot.matches(&candidate.slot.start_time, &candidate.slot.end_time));
        if !published {
            return Err(candidate.not_available("not in the counselor's schedule"));
        }
        if is_elapsed(candidate.date, &candidate.slot, self.clock.now()) {
            return Err(candidate.not_available("slot has already started"));
        }
        Ok(())
    }

    pub async fn check_collision(&self, candidate: &SlotCandidate) -> Result<(), BookingError> {
        let existing = with_deadline(
            self.store_timeout,
            "find conflicting booking",
            self.backend
                .active_booking(candidate.counselor_id, candidate.date, &candidate.slot),
        )
        .await?;
        match existing {
            Some(booking) => {
                debug!(booking_id = %booking.id, "Slot collides with an existing booking");
                Err(candidate.already_booked())
            }
            None => Ok(()),
        }
    }
}
