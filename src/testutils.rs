use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
    backend::BookingBackend,
    error::StoreError,
    local_backend::LocalBackend,
    types::{Booking, BookingStatus, ChatRoom, Counselor, Message, NewBooking, TimeSlot},
};

/// Counts calls and injects failures; bookings and messages are delegated to
/// an in-memory store so the booking invariants still hold.
pub struct MockBookingBackendInner {
    pub success: AtomicBool,
    pub fail_chat_rooms: AtomicBool,
    /// Delay after a booking insert has been stored, in milliseconds.
    pub insert_delay_ms: AtomicU64,
    pub calls_to_counselor: AtomicU64,
    pub calls_to_insert_booking: AtomicU64,
    pub calls_to_transition_booking: AtomicU64,
    pub calls_to_upsert_chat_room: AtomicU64,
    pub calls_to_insert_message: AtomicU64,
    pub counselors: Mutex<HashMap<Uuid, Counselor>>,
    store: LocalBackend,
}

#[derive(Clone)]
pub struct MockBookingBackend(pub Arc<MockBookingBackendInner>);

impl MockBookingBackendInner {
    fn new() -> Self {
        Self {
            success: AtomicBool::new(true),
            fail_chat_rooms: AtomicBool::new(false),
            insert_delay_ms: AtomicU64::default(),
            calls_to_counselor: AtomicU64::default(),
            calls_to_insert_booking: AtomicU64::default(),
            calls_to_transition_booking: AtomicU64::default(),
            calls_to_upsert_chat_room: AtomicU64::default(),
            calls_to_insert_message: AtomicU64::default(),
            counselors: Mutex::default(),
            store: LocalBackend::default(),
        }
    }
}

impl MockBookingBackend {
    pub fn new() -> Self {
        Self(Arc::new(MockBookingBackendInner::new()))
    }

    pub fn add_counselor(&self, counselor: Counselor) {
        self.0
            .counselors
            .lock()
            .unwrap()
            .insert(counselor.user_id, counselor);
    }

    fn result(&self) -> Result<(), StoreError> {
        match self.0.success.load(Ordering::SeqCst) {
            true => Ok(()),
            false => Err(StoreError::Backend("Supposed to fail".into())),
        }
    }
}

#[async_trait]
impl BookingBackend for MockBookingBackend {
    async fn counselor(&self, user_id: Uuid) -> Result<Option<Counselor>, StoreError> {
        self.0.calls_to_counselor.fetch_add(1, Ordering::SeqCst);
        self.result()?;
        Ok(self.0.counselors.lock().unwrap().get(&user_id).cloned())
    }

    async fn upsert_counselor(&self, counselor: Counselor) -> Result<Counselor, StoreError> {
        self.result()?;
        self.add_counselor(counselor.clone());
        Ok(counselor)
    }

    async fn counselors(&self) -> Result<Vec<Counselor>, StoreError> {
        self.result()?;
        let mut counselors: Vec<Counselor> =
            self.0.counselors.lock().unwrap().values().cloned().collect();
        counselors.sort_by_key(|counselor| counselor.user_id);
        Ok(counselors)
    }

    async fn active_booking(
        &self,
        counselor_id: Uuid,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Option<Booking>, StoreError> {
        self.result()?;
        self.0.store.active_booking(counselor_id, date, slot).await
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        self.0.calls_to_insert_booking.fetch_add(1, Ordering::SeqCst);
        self.result()?;
        let booking = self.0.store.insert_booking(booking).await?;
        let delay = self.0.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        Ok(booking)
    }

    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        self.result()?;
        self.0.store.booking(id).await
    }

    async fn booking_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, StoreError> {
        self.result()?;
        self.0.store.booking_by_payment_reference(reference).await
    }

    async fn bookings_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError> {
        self.result()?;
        self.0.store.bookings_for_client(client_id).await
    }

    async fn bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        self.result()?;
        self.0.store.bookings_for_counselor(counselor_id).await
    }

    async fn scheduled_bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        self.result()?;
        self.0.store.scheduled_bookings_for_counselor(counselor_id).await
    }

    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError> {
        self.0
            .calls_to_transition_booking
            .fetch_add(1, Ordering::SeqCst);
        self.result()?;
        self.0.store.transition_booking(id, expected, next).await
    }

    async fn upsert_chat_room(&self, user_a: Uuid, user_b: Uuid) -> Result<ChatRoom, StoreError> {
        self.0
            .calls_to_upsert_chat_room
            .fetch_add(1, Ordering::SeqCst);
        self.result()?;
        if self.0.fail_chat_rooms.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("Supposed to fail".into()));
        }
        self.0.store.upsert_chat_room(user_a, user_b).await
    }

    async fn chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>, StoreError> {
        self.result()?;
        self.0.store.chat_room(id).await
    }

    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>, StoreError> {
        self.result()?;
        self.0.store.chat_rooms_for(user_id).await
    }

    async fn touch_chat_room(
        &self,
        id: Uuid,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.result()?;
        self.0.store.touch_chat_room(id, last_message, at).await
    }

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError> {
        self.0.calls_to_insert_message.fetch_add(1, Ordering::SeqCst);
        self.result()?;
        self.0.store.insert_message(message).await
    }

    async fn messages(
        &self,
        chat_room_id: Uuid,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.result()?;
        self.0.store.messages(chat_room_id, after, limit).await
    }

    async fn mark_read(&self, chat_room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError> {
        self.result()?;
        self.0.store.mark_read(chat_room_id, receiver_id).await
    }

    async fn unread_count(
        &self,
        chat_room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<u64, StoreError> {
        self.result()?;
        self.0.store.unread_count(chat_room_id, receiver_id).await
    }
}
