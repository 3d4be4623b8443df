use crate::error::StoreError;
use crate::types::{Booking, BookingStatus, ChatRoom, Counselor, Message, NewBooking, TimeSlot};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

/// Storage seam of the coordinator.
///
/// Implementations must enforce two invariants themselves, without relying on
/// the caller having checked first:
/// * `insert_booking` fails with [`StoreError::Conflict`] when a booking with
///   `status != cancelled` already occupies the same counselor, date and bounds.
/// * `upsert_chat_room` never creates a second room for the same unordered pair.
#[async_trait]
pub trait BookingBackend: Clone + Send + Sync + 'static {
    async fn counselor(&self, user_id: Uuid) -> Result<Option<Counselor>, StoreError>;
    async fn upsert_counselor(&self, counselor: Counselor) -> Result<Counselor, StoreError>;
    /// Every counselor with a saved profile.
    async fn counselors(&self) -> Result<Vec<Counselor>, StoreError>;

    async fn active_booking(
        &self,
        counselor_id: Uuid,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Option<Booking>, StoreError>;
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;
    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;
    async fn booking_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, StoreError>;
    /// All bookings of a client, newest date first.
    async fn bookings_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError>;
    /// All bookings of a counselor regardless of status, newest date first.
    async fn bookings_for_counselor(&self, counselor_id: Uuid)
        -> Result<Vec<Booking>, StoreError>;
    /// Scheduled bookings of a counselor, earliest first.
    async fn scheduled_bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError>;
    /// Compare-and-set on the status; [`StoreError::Conflict`] if the current
    /// status is not `expected`.
    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError>;

    /// Returns the room of the pair, creating it with an empty last message
    /// if neither ordering exists yet.
    async fn upsert_chat_room(&self, user_a: Uuid, user_b: Uuid) -> Result<ChatRoom, StoreError>;
    async fn chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>, StoreError>;
    /// Rooms of a participant, most recent message first.
    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>, StoreError>;
    async fn touch_chat_room(
        &self,
        id: Uuid,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError>;
    /// Messages of a room in creation order, optionally only those after `after`.
    async fn messages(
        &self,
        chat_room_id: Uuid,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
    async fn mark_read(&self, chat_room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError>;
    async fn unread_count(&self, chat_room_id: Uuid, receiver_id: Uuid)
        -> Result<u64, StoreError>;
}
