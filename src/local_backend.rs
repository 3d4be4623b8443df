use crate::backend::BookingBackend;
use crate::error::StoreError;
use crate::types::{Booking, BookingStatus, ChatRoom, Counselor, Message, NewBooking, TimeSlot};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    counselors: HashMap<Uuid, Counselor>,
    bookings: HashMap<Uuid, Booking>,
    chat_rooms: HashMap<Uuid, ChatRoom>,
    messages: Vec<Message>,
}

/// In-memory backend used when no database is configured. Every operation
/// runs under one lock, so check-and-insert sequences are atomic.
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    tables: Arc<Mutex<Tables>>,
}

impl LocalBackend {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|err| {
            error!(%err, "In-memory tables are poisoned");
            StoreError::Backend("in-memory store is poisoned".into())
        })
    }
}

#[async_trait]
impl BookingBackend for LocalBackend {
    async fn counselor(&self, user_id: Uuid) -> Result<Option<Counselor>, StoreError> {
        Ok(self.tables()?.counselors.get(&user_id).cloned())
    }

    async fn upsert_counselor(&self, counselor: Counselor) -> Result<Counselor, StoreError> {
        self.tables()?
            .counselors
            .insert(counselor.user_id, counselor.clone());
        Ok(counselor)
    }

    async fn counselors(&self) -> Result<Vec<Counselor>, StoreError> {
        let mut counselors: Vec<Counselor> =
            self.tables()?.counselors.values().cloned().collect();
        counselors.sort_by_key(|counselor| counselor.user_id);
        Ok(counselors)
    }

    async fn active_booking(
        &self,
        counselor_id: Uuid,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .tables()?
            .bookings
            .values()
            .find(|booking| booking.occupies(counselor_id, date, slot))
            .cloned())
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let mut tables = self.tables()?;
        let taken = tables
            .bookings
            .values()
            .any(|existing| existing.occupies(booking.counselor_id, booking.date, &booking.slot));
        if taken {
            return Err(StoreError::Conflict(format!(
                "slot {} on {} is already booked",
                booking.slot, booking.date
            )));
        }
        if let Some(reference) = booking.payment_reference.as_deref() {
            if tables
                .bookings
                .values()
                .any(|existing| existing.payment_reference.as_deref() == Some(reference))
            {
                return Err(StoreError::Conflict(format!(
                    "payment {reference} is already recorded"
                )));
            }
        }

        let booking = booking.into_booking(Uuid::new_v4(), Utc::now());
        tables.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables()?.bookings.get(&id).cloned())
    }

    async fn booking_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self
            .tables()?
            .bookings
            .values()
            .find(|booking| booking.payment_reference.as_deref() == Some(reference))
            .cloned())
    }

    async fn bookings_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self
            .tables()?
            .bookings
            .values()
            .filter(|booking| booking.client_id == client_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        Ok(bookings)
    }

    async fn bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self
            .tables()?
            .bookings
            .values()
            .filter(|booking| booking.counselor_id == counselor_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        Ok(bookings)
    }

    async fn scheduled_bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self
            .tables()?
            .bookings
            .values()
            .filter(|booking| {
                booking.counselor_id == counselor_id && booking.status == BookingStatus::Scheduled
            })
            .cloned()
            .collect();
        bookings.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| a.start_time.cmp(&b.start_time))
        });
        Ok(bookings)
    }

    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let mut tables = self.tables()?;
        let booking = tables
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("booking {id}")))?;
        if booking.status != expected {
            return Err(StoreError::Conflict(format!(
                "booking {id} is {}, expected {expected}",
                booking.status
            )));
        }
        booking.status = next;
        Ok(booking.clone())
    }

    async fn upsert_chat_room(&self, user_a: Uuid, user_b: Uuid) -> Result<ChatRoom, StoreError> {
        let mut tables = self.tables()?;
        if let Some(room) = tables
            .chat_rooms
            .values()
            .find(|room| room.connects(user_a, user_b))
        {
            return Ok(room.clone());
        }

        let room = ChatRoom {
            id: Uuid::new_v4(),
            user1_id: user_a,
            user2_id: user_b,
            last_message: String::new(),
            last_message_date: None,
            created_at: Utc::now(),
        };
        tables.chat_rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>, StoreError> {
        Ok(self.tables()?.chat_rooms.get(&id).cloned())
    }

    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>, StoreError> {
        let mut rooms: Vec<ChatRoom> = self
            .tables()?
            .chat_rooms
            .values()
            .filter(|room| room.has_participant(user_id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| {
            b.last_message_date
                .cmp(&a.last_message_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(rooms)
    }

    async fn touch_chat_room(
        &self,
        id: Uuid,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let room = tables
            .chat_rooms
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("chat room {id}")))?;
        room.last_message = last_message.to_string();
        room.last_message_date = Some(at);
        Ok(())
    }

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError> {
        let mut tables = self.tables()?;
        if !tables.chat_rooms.contains_key(&message.chat_room_id) {
            return Err(StoreError::NotFound(format!(
                "chat room {}",
                message.chat_room_id
            )));
        }
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn messages(
        &self,
        chat_room_id: Uuid,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut messages: Vec<Message> = self
            .tables()?
            .messages
            .iter()
            .filter(|message| message.chat_room_id == chat_room_id)
            .filter(|message| after.map_or(true, |after| message.created_at > after))
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn mark_read(&self, chat_room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError> {
        let mut tables = self.tables()?;
        let mut updated = 0;
        for message in tables.messages.iter_mut().filter(|message| {
            message.chat_room_id == chat_room_id && message.receiver_id == receiver_id && !message.read
        }) {
            message.read = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn unread_count(
        &self,
        chat_room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<u64, StoreError> {
        Ok(self
            .tables()?
            .messages
            .iter()
            .filter(|message| {
                message.chat_room_id == chat_room_id
                    && message.receiver_id == receiver_id
                    && !message.read
            })
            .count() as u64)
    }
}
