use crate::backend::BookingBackend;
use crate::error::StoreError;
use crate::schema::{
    availability_days, availability_slots, bookings, chat_rooms, counselors, messages,
};
use crate::types::{
    Booking, BookingStatus, ChatRoom, Counselor, DayAvailability, Message, NewBooking,
    PaymentStatus, SessionType, TimeSlot,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::{ConnectionError, PgConnection};
use std::sync::{Arc, Mutex};
use tracing::error;
use uuid::Uuid;

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = counselors)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct CounselorRow {
    user_id: Uuid,
    hourly_rate: f64,
    updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = availability_days)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct DayRow {
    counselor_id: Uuid,
    entry_index: i32,
    day: NaiveDate,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = availability_slots)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct SlotRow {
    counselor_id: Uuid,
    entry_index: i32,
    slot_index: i32,
    start_time: String,
    end_time: String,
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct BookingRow {
    id: Uuid,
    client_id: Uuid,
    counselor_id: Uuid,
    date: NaiveDate,
    start_time: String,
    end_time: String,
    session_type: String,
    status: String,
    amount: f64,
    payment_status: String,
    payment_reference: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<&Booking> for BookingRow {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            client_id: booking.client_id,
            counselor_id: booking.counselor_id,
            date: booking.date,
            start_time: booking.start_time.clone(),
            end_time: booking.end_time.clone(),
            session_type: booking.session_type.as_str().into(),
            status: booking.status.as_str().into(),
            amount: booking.amount,
            payment_status: booking.payment_status.as_str().into(),
            payment_reference: booking.payment_reference.clone(),
            created_at: booking.created_at,
        }
    }
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str, value: &str| {
            StoreError::Backend(format!("booking {} has unknown {column} '{value}'", row.id))
        };
        Ok(Booking {
            session_type: SessionType::parse(&row.session_type)
                .ok_or_else(|| corrupt("session type", &row.session_type))?,
            status: BookingStatus::parse(&row.status).ok_or_else(|| corrupt("status", &row.status))?,
            payment_status: PaymentStatus::parse(&row.payment_status)
                .ok_or_else(|| corrupt("payment status", &row.payment_status))?,
            id: row.id,
            client_id: row.client_id,
            counselor_id: row.counselor_id,
            date: row.date,
            start_time: row.start_time,
            end_time: row.end_time,
            amount: row.amount,
            payment_reference: row.payment_reference,
            created_at: row.created_at,
        })
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = chat_rooms)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct ChatRoomRow {
    id: Uuid,
    user1_id: Uuid,
    user2_id: Uuid,
    last_message: String,
    last_message_date: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ChatRoomRow> for ChatRoom {
    fn from(row: ChatRoomRow) -> Self {
        ChatRoom {
            id: row.id,
            user1_id: row.user1_id,
            user2_id: row.user2_id,
            last_message: row.last_message,
            last_message_date: row.last_message_date,
            created_at: row.created_at,
        }
    }
}

#[derive(Queryable, Selectable, Insertable)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct MessageRow {
    id: Uuid,
    chat_room_id: Uuid,
    sender_id: Uuid,
    receiver_id: Uuid,
    content: String,
    read: bool,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            chat_room_id: row.chat_room_id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            read: row.read,
            created_at: row.created_at,
        }
    }
}

impl From<&Message> for MessageRow {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            chat_room_id: message.chat_room_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            content: message.content.clone(),
            read: message.read,
            created_at: message.created_at,
        }
    }
}

fn store_error(err: DieselError) -> StoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            StoreError::Conflict(info.message().to_string())
        }
        DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
            StoreError::NotFound(info.message().to_string())
        }
        DieselError::NotFound => StoreError::NotFound("record".into()),
        other => {
            error!(%other, "Database query failed");
            StoreError::Backend(other.to_string())
        }
    }
}

/// PostgreSQL backend. Uniqueness of active bookings and of chat room pairs
/// is enforced by partial/expression indexes (see `migrations/`).
#[derive(Clone)]
pub struct DatabaseInterface {
    connection: Arc<Mutex<PgConnection>>,
}

impl DatabaseInterface {
    pub fn new(database_url: &str) -> Result<Self, ConnectionError> {
        let connection = Self::establish_connection(database_url)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn establish_connection(database_url: &str) -> Result<PgConnection, ConnectionError> {
        PgConnection::establish(database_url)
    }

    /// Runs blocking diesel work off the async runtime.
    async fn run<R, F>(&self, query: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut PgConnection) -> Result<R, DieselError> + Send + 'static,
        R: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = connection
                .lock()
                .map_err(|_| StoreError::Backend("database connection is poisoned".into()))?;
            query(&mut connection).map_err(store_error)
        })
        .await
        .map_err(|err| StoreError::Backend(format!("database task failed: {err}")))?
    }

    #[cfg(test)]
    async fn clear(&self) -> Result<(), StoreError> {
        self.run(|connection| {
            connection.transaction(|connection| {
                diesel::delete(messages::table).execute(connection)?;
                diesel::delete(chat_rooms::table).execute(connection)?;
                diesel::delete(bookings::table).execute(connection)?;
                diesel::delete(counselors::table).execute(connection)?;
                Ok(())
            })
        })
        .await
    }
}

fn load_counselor(
    connection: &mut PgConnection,
    user_id: Uuid,
) -> Result<Option<Counselor>, DieselError> {
    let Some(row) = counselors::table
        .find(user_id)
        .select(CounselorRow::as_select())
        .first::<CounselorRow>(connection)
        .optional()?
    else {
        return Ok(None);
    };

    let days: Vec<DayRow> = availability_days::table
        .filter(availability_days::counselor_id.eq(user_id))
        .order(availability_days::entry_index.asc())
        .select(DayRow::as_select())
        .load::<DayRow>(connection)?;
    let slots: Vec<SlotRow> = availability_slots::table
        .filter(availability_slots::counselor_id.eq(user_id))
        .order((
            availability_slots::entry_index.asc(),
            availability_slots::slot_index.asc(),
        ))
        .select(SlotRow::as_select())
        .load::<SlotRow>(connection)?;

    let availability = days
        .into_iter()
        .map(|day| DayAvailability {
            day: day.day,
            slots: slots
                .iter()
                .filter(|slot| slot.entry_index == day.entry_index)
                .map(|slot| TimeSlot::new(slot.start_time.clone(), slot.end_time.clone()))
                .collect(),
        })
        .collect();

    Ok(Some(Counselor {
        user_id: row.user_id,
        hourly_rate: row.hourly_rate,
        availability,
    }))
}

fn into_bookings(rows: Vec<BookingRow>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter().map(Booking::try_from).collect()
}

#[async_trait]
impl BookingBackend for DatabaseInterface {
    async fn counselor(&self, user_id: Uuid) -> Result<Option<Counselor>, StoreError> {
        self.run(move |connection| load_counselor(connection, user_id))
            .await
    }

    async fn upsert_counselor(&self, counselor: Counselor) -> Result<Counselor, StoreError> {
        self.run(move |connection| {
            connection.transaction(|connection| {
                let row = CounselorRow {
                    user_id: counselor.user_id,
                    hourly_rate: counselor.hourly_rate,
                    updated_at: Utc::now(),
                };
                diesel::insert_into(counselors::table)
                    .values(&row)
                    .on_conflict(counselors::user_id)
                    .do_update()
                    .set((
                        counselors::hourly_rate.eq(row.hourly_rate),
                        counselors::updated_at.eq(row.updated_at),
                    ))
                    .execute(connection)?;

                // Replacing the days cascades to their slots.
                diesel::delete(
                    availability_days::table
                        .filter(availability_days::counselor_id.eq(counselor.user_id)),
                )
                .execute(connection)?;

                let mut days = Vec::new();
                let mut slots = Vec::new();
                for (entry_index, entry) in counselor.availability.iter().enumerate() {
                    days.push(DayRow {
                        counselor_id: counselor.user_id,
                        entry_index: entry_index as i32,
                        day: entry.day,
                    });
                    for (slot_index, slot) in entry.slots.iter().enumerate() {
                        slots.push(SlotRow {
                            counselor_id: counselor.user_id,
                            entry_index: entry_index as i32,
                            slot_index: slot_index as i32,
                            start_time: slot.start_time.clone(),
                            end_time: slot.end_time.clone(),
                        });
                    }
                }
                if !days.is_empty() {
                    diesel::insert_into(availability_days::table)
                        .values(&days)
                        .execute(connection)?;
                }
                if !slots.is_empty() {
                    diesel::insert_into(availability_slots::table)
                        .values(&slots)
                        .execute(connection)?;
                }
                Ok(counselor)
            })
        })
        .await
    }

    async fn counselors(&self) -> Result<Vec<Counselor>, StoreError> {
        self.run(|connection| {
            let ids: Vec<Uuid> = counselors::table
                .select(counselors::user_id)
                .order(counselors::user_id.asc())
                .load::<Uuid>(connection)?;
            let mut counselors = Vec::with_capacity(ids.len());
            for user_id in ids {
                if let Some(counselor) = load_counselor(connection, user_id)? {
                    counselors.push(counselor);
                }
            }
            Ok(counselors)
        })
        .await
    }

    async fn active_booking(
        &self,
        counselor_id: Uuid,
        date: NaiveDate,
        slot: &TimeSlot,
    ) -> Result<Option<Booking>, StoreError> {
        let slot = slot.clone();
        let row = self
            .run(move |connection| {
                bookings::table
                    .filter(bookings::counselor_id.eq(counselor_id))
                    .filter(bookings::date.eq(date))
                    .filter(bookings::start_time.eq(slot.start_time))
                    .filter(bookings::end_time.eq(slot.end_time))
                    .filter(bookings::status.ne(BookingStatus::Cancelled.as_str()))
                    .select(BookingRow::as_select())
                    .first::<BookingRow>(connection)
                    .optional()
            })
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError> {
        let booking = booking.into_booking(Uuid::new_v4(), Utc::now());
        let row = BookingRow::from(&booking);
        self.run(move |connection| {
            diesel::insert_into(bookings::table)
                .values(&row)
                .execute(connection)
        })
        .await?;
        Ok(booking)
    }

    async fn booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let row = self
            .run(move |connection| {
                bookings::table
                    .find(id)
                    .select(BookingRow::as_select())
                    .first::<BookingRow>(connection)
                    .optional()
            })
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn booking_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<Booking>, StoreError> {
        let reference = reference.to_string();
        let row = self
            .run(move |connection| {
                bookings::table
                    .filter(bookings::payment_reference.eq(reference))
                    .select(BookingRow::as_select())
                    .first::<BookingRow>(connection)
                    .optional()
            })
            .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn bookings_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError> {
        let rows = self
            .run(move |connection| {
                bookings::table
                    .filter(bookings::client_id.eq(client_id))
                    .order((bookings::date.desc(), bookings::start_time.asc()))
                    .select(BookingRow::as_select())
                    .load::<BookingRow>(connection)
            })
            .await?;
        into_bookings(rows)
    }

    async fn bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = self
            .run(move |connection| {
                bookings::table
                    .filter(bookings::counselor_id.eq(counselor_id))
                    .order((bookings::date.desc(), bookings::start_time.asc()))
                    .select(BookingRow::as_select())
                    .load::<BookingRow>(connection)
            })
            .await?;
        into_bookings(rows)
    }

    async fn scheduled_bookings_for_counselor(
        &self,
        counselor_id: Uuid,
    ) -> Result<Vec<Booking>, StoreError> {
        let rows = self
            .run(move |connection| {
                bookings::table
                    .filter(bookings::counselor_id.eq(counselor_id))
                    .filter(bookings::status.eq(BookingStatus::Scheduled.as_str()))
                    .order((bookings::date.asc(), bookings::start_time.asc()))
                    .select(BookingRow::as_select())
                    .load::<BookingRow>(connection)
            })
            .await?;
        into_bookings(rows)
    }

    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let updated = self
            .run(move |connection| {
                diesel::update(
                    bookings::table
                        .filter(bookings::id.eq(id))
                        .filter(bookings::status.eq(expected.as_str())),
                )
                .set(bookings::status.eq(next.as_str()))
                .returning(BookingRow::as_returning())
                .get_result::<BookingRow>(connection)
                .optional()
            })
            .await?;

        match updated {
            Some(row) => Booking::try_from(row),
            None => match self.booking(id).await? {
                Some(current) => Err(StoreError::Conflict(format!(
                    "booking {id} is {}, expected {expected}",
                    current.status
                ))),
                None => Err(StoreError::NotFound(format!("booking {id}"))),
            },
        }
    }

    async fn upsert_chat_room(&self, user_a: Uuid, user_b: Uuid) -> Result<ChatRoom, StoreError> {
        self.run(move |connection| {
            let candidate = ChatRoomRow {
                id: Uuid::new_v4(),
                user1_id: user_a,
                user2_id: user_b,
                last_message: String::new(),
                last_message_date: None,
                created_at: Utc::now(),
            };
            // The pair index rejects the insert when either ordering exists.
            diesel::insert_into(chat_rooms::table)
                .values(&candidate)
                .on_conflict_do_nothing()
                .execute(connection)?;

            chat_rooms::table
                .filter(
                    chat_rooms::user1_id
                        .eq(user_a)
                        .and(chat_rooms::user2_id.eq(user_b))
                        .or(chat_rooms::user1_id
                            .eq(user_b)
                            .and(chat_rooms::user2_id.eq(user_a))),
                )
                .select(ChatRoomRow::as_select())
                .first::<ChatRoomRow>(connection)
        })
        .await
        .map(ChatRoom::from)
    }

    async fn chat_room(&self, id: Uuid) -> Result<Option<ChatRoom>, StoreError> {
        self.run(move |connection| {
            chat_rooms::table
                .find(id)
                .select(ChatRoomRow::as_select())
                .first::<ChatRoomRow>(connection)
                .optional()
        })
        .await
        .map(|row| row.map(ChatRoom::from))
    }

    async fn chat_rooms_for(&self, user_id: Uuid) -> Result<Vec<ChatRoom>, StoreError> {
        self.run(move |connection| {
            chat_rooms::table
                .filter(
                    chat_rooms::user1_id
                        .eq(user_id)
                        .or(chat_rooms::user2_id.eq(user_id)),
                )
                .order((
                    chat_rooms::last_message_date.desc().nulls_last(),
                    chat_rooms::created_at.desc(),
                ))
                .select(ChatRoomRow::as_select())
                .load::<ChatRoomRow>(connection)
        })
        .await
        .map(|rows| rows.into_iter().map(ChatRoom::from).collect())
    }

    async fn touch_chat_room(
        &self,
        id: Uuid,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let last_message = last_message.to_string();
        let updated = self
            .run(move |connection| {
                diesel::update(chat_rooms::table.find(id))
                    .set((
                        chat_rooms::last_message.eq(last_message),
                        chat_rooms::last_message_date.eq(Some(at)),
                    ))
                    .execute(connection)
            })
            .await?;
        match updated {
            0 => Err(StoreError::NotFound(format!("chat room {id}"))),
            _ => Ok(()),
        }
    }

    async fn insert_message(&self, message: Message) -> Result<Message, StoreError> {
        let row = MessageRow::from(&message);
        self.run(move |connection| {
            diesel::insert_into(messages::table)
                .values(&row)
                .execute(connection)
        })
        .await?;
        Ok(message)
    }

    async fn messages(
        &self,
        chat_room_id: Uuid,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.run(move |connection| {
            let mut query = messages::table
                .filter(messages::chat_room_id.eq(chat_room_id))
                .into_boxed();
            if let Some(after) = after {
                query = query.filter(messages::created_at.gt(after));
            }
            query
                .order(messages::created_at.asc())
                .limit(limit as i64)
                .select(MessageRow::as_select())
                .load::<MessageRow>(connection)
        })
        .await
        .map(|rows| rows.into_iter().map(Message::from).collect())
    }

    async fn mark_read(&self, chat_room_id: Uuid, receiver_id: Uuid) -> Result<u64, StoreError> {
        self.run(move |connection| {
            diesel::update(
                messages::table
                    .filter(messages::chat_room_id.eq(chat_room_id))
                    .filter(messages::receiver_id.eq(receiver_id))
                    .filter(messages::read.eq(false)),
            )
            .set(messages::read.eq(true))
            .execute(connection)
        })
        .await
        .map(|updated| updated as u64)
    }

    async fn unread_count(
        &self,
        chat_room_id: Uuid,
        receiver_id: Uuid,
    ) -> Result<u64, StoreError> {
        self.run(move |connection| {
            messages::table
                .filter(messages::chat_room_id.eq(chat_room_id))
                .filter(messages::receiver_id.eq(receiver_id))
                .filter(messages::read.eq(false))
                .count()
                .get_result::<i64>(connection)
        })
        .await
        .map(|count| count as u64)
    }
}
