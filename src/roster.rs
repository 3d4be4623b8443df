use crate::backend::BookingBackend;
use crate::coordinator::BookingCoordinator;
use crate::error::BookingError;
use crate::types::{BookingStatus, Caller, Counselor, Role};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A client the counselor has met or is going to meet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub client_id: Uuid,
    /// Every booking with this counselor, cancelled ones included.
    pub total_sessions: usize,
    /// Last message in their conversation, else the date of the latest
    /// scheduled or completed booking.
    pub last_interaction: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ClientTally {
    total_sessions: usize,
    engaged: bool,
    last_booking: Option<DateTime<Utc>>,
}

impl<T: BookingBackend> BookingCoordinator<T> {
    pub async fn counselors(&self) -> Result<Vec<Counselor>, BookingError> {
        self.io("list counselors", self.backend.counselors()).await
    }

    pub async fn counselor_profile(&self, counselor_id: Uuid) -> Result<Counselor, BookingError> {
        self.checker.counselor(counselor_id).await
    }

    /// Clients with at least one scheduled or completed booking with the
    /// calling counselor, most recent interaction first.
    pub async fn clients(&self, caller: Caller) -> Result<Vec<ClientSummary>, BookingError> {
        if caller.role != Role::Counselor {
            return Err(BookingError::Forbidden(
                "only counselors have a client list".into(),
            ));
        }

        let bookings = self
            .io(
                "list counselor bookings",
                self.backend.bookings_for_counselor(caller.user_id),
            )
            .await?;
        let rooms = self
            .io("list chat rooms", self.backend.chat_rooms_for(caller.user_id))
            .await?;

        let mut tallies: BTreeMap<Uuid, ClientTally> = BTreeMap::new();
        for booking in &bookings {
            let tally = tallies.entry(booking.client_id).or_default();
            tally.total_sessions += 1;
            if matches!(
                booking.status,
                BookingStatus::Scheduled | BookingStatus::Completed
            ) {
                tally.engaged = true;
                let day = booking.date.and_time(NaiveTime::MIN).and_utc();
                tally.last_booking = tally.last_booking.max(Some(day));
            }
        }

        let mut clients: Vec<ClientSummary> = tallies
            .into_iter()
            .filter(|(_, tally)| tally.engaged)
            .map(|(client_id, tally)| {
                let last_message = rooms
                    .iter()
                    .filter(|room| room.other_participant(caller.user_id) == Some(client_id))
                    .filter_map(|room| room.last_message_date)
                    .max();
                ClientSummary {
                    client_id,
                    total_sessions: tally.total_sessions,
                    last_interaction: last_message.or(tally.last_booking),
                }
            })
            .collect();
        clients.sort_by(|a, b| b.last_interaction.cmp(&a.last_interaction));
        Ok(clients)
    }
}
