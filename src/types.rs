use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use validator::{Validate, ValidationError};

lazy_static! {
    /// 24-hour `HH:MM`, zero padded.
    pub static ref TIME_OF_DAY: Regex = Regex::new(r"^([01][0-9]|2[0-3]):[0-5][0-9]$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_slot_order"))]
pub struct TimeSlot {
    #[validate(regex(path = *TIME_OF_DAY, message = "start time must be HH:MM"))]
    pub start_time: String,
    #[validate(regex(path = *TIME_OF_DAY, message = "end time must be HH:MM"))]
    pub end_time: String,
}

fn validate_slot_order(slot: &TimeSlot) -> Result<(), ValidationError> {
    match (slot.start(), slot.end()) {
        (Some(start), Some(end)) if end > start => Ok(()),
        _ => Err(ValidationError::new("slot_order")
            .with_message("end time must be after start time".into())),
    }
}

impl TimeSlot {
    pub fn new(start_time: impl Into<String>, end_time: impl Into<String>) -> Self {
        Self {
            start_time: start_time.into(),
            end_time: end_time.into(),
        }
    }

    /// Parses a `"HH:MM-HH:MM"` range as carried in payment metadata.
    pub fn parse_range(range: &str) -> Option<Self> {
        let (start, end) = range.split_once('-')?;
        Some(Self::new(start.trim(), end.trim()))
    }

    pub fn start(&self) -> Option<NaiveTime> {
        parse_time_of_day(&self.start_time)
    }

    pub fn end(&self) -> Option<NaiveTime> {
        parse_time_of_day(&self.end_time)
    }

    pub fn matches(&self, start_time: &str, end_time: &str) -> bool {
        self.start_time == start_time && self.end_time == end_time
    }

    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        match (self.start(), self.end(), other.start(), other.end()) {
            (Some(a_start), Some(a_end), Some(b_start), Some(b_end)) => {
                a_start < b_end && b_start < a_end
            }
            _ => false,
        }
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_time, self.end_time)
    }
}

pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    if !TIME_OF_DAY.is_match(value) {
        return None;
    }
    NaiveTime::parse_from_str(value, "%H:%M").ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DayAvailability {
    pub day: NaiveDate,
    #[validate(nested)]
    pub slots: Vec<TimeSlot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counselor {
    pub user_id: Uuid,
    pub hourly_rate: f64,
    pub availability: Vec<DayAvailability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Video,
    Chat,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Video => "video",
            SessionType::Chat => "chat",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(SessionType::Video),
            "chat" => Some(SessionType::Chat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(BookingStatus::Scheduled),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }

    /// Only `scheduled` may move, and only to one of the terminal states.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Scheduled, BookingStatus::Completed)
                | (BookingStatus::Scheduled, BookingStatus::Cancelled)
        )
    }

    pub fn blocks_slot(&self) -> bool {
        *self != BookingStatus::Cancelled
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Uuid,
    pub client_id: Uuid,
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub session_type: SessionType,
    pub status: BookingStatus,
    pub amount: f64,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn involves(&self, user_id: Uuid) -> bool {
        self.client_id == user_id || self.counselor_id == user_id
    }

    pub fn occupies(&self, counselor_id: Uuid, date: NaiveDate, slot: &TimeSlot) -> bool {
        self.status.blocks_slot()
            && self.counselor_id == counselor_id
            && self.date == date
            && slot.matches(&self.start_time, &self.end_time)
    }
}

/// A booking that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub client_id: Uuid,
    pub counselor_id: Uuid,
    pub date: NaiveDate,
    pub slot: TimeSlot,
    pub session_type: SessionType,
    pub amount: f64,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
}

impl NewBooking {
    pub fn into_booking(self, id: Uuid, created_at: DateTime<Utc>) -> Booking {
        Booking {
            id,
            client_id: self.client_id,
            counselor_id: self.counselor_id,
            date: self.date,
            start_time: self.slot.start_time,
            end_time: self.slot.end_time,
            session_type: self.session_type,
            status: BookingStatus::Scheduled,
            amount: self.amount,
            payment_status: self.payment_status,
            payment_reference: self.payment_reference,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoom {
    pub id: Uuid,
    pub user1_id: Uuid,
    pub user2_id: Uuid,
    pub last_message: String,
    pub last_message_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn has_participant(&self, user_id: Uuid) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    pub fn connects(&self, a: Uuid, b: Uuid) -> bool {
        (self.user1_id == a && self.user2_id == b) || (self.user1_id == b && self.user2_id == a)
    }

    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        if self.user1_id == user_id {
            Some(self.user2_id)
        } else if self.user2_id == user_id {
            Some(self.user1_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomSummary {
    pub id: Uuid,
    pub other_user_id: Uuid,
    pub last_message: String,
    pub last_message_date: Option<DateTime<Utc>>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub chat_room_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Counselor,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "client" => Some(Role::Client),
            "counselor" => Some(Role::Counselor),
            _ => None,
        }
    }
}

/// Authenticated identity forwarded by the session provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}
