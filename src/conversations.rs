use crate::backend::BookingBackend;
use crate::coordinator::BookingCoordinator;
use crate::error::BookingError;
use crate::types::{ChatRoom, ChatRoomSummary, Message};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tracing::debug;
use uuid::Uuid;

pub const MESSAGE_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub receiver_id: Option<Uuid>,
    pub chat_room_id: Option<Uuid>,
    pub content: String,
}

impl<T: BookingBackend> BookingCoordinator<T> {
    async fn room_of_participant(
        &self,
        chat_room_id: Uuid,
        user_id: Uuid,
    ) -> Result<ChatRoom, BookingError> {
        let room = self
            .io("load chat room", self.backend.chat_room(chat_room_id))
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("chat room {chat_room_id}")))?;
        if !room.has_participant(user_id) {
            return Err(BookingError::Forbidden(
                "not a participant of this conversation".into(),
            ));
        }
        Ok(room)
    }

    /// Stores a message and pushes it to the receiver's live connections.
    /// Without a room id the room of the pair is created on demand.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        outgoing: OutgoingMessage,
    ) -> Result<Message, BookingError> {
        let content = outgoing.content.trim();
        if content.is_empty() {
            return Err(BookingError::InvalidInput("message is empty".into()));
        }

        let (room, receiver_id) = match (outgoing.chat_room_id, outgoing.receiver_id) {
            (Some(chat_room_id), _) => {
                let room = self.room_of_participant(chat_room_id, sender_id).await?;
                let receiver_id = room
                    .other_participant(sender_id)
                    .ok_or_else(|| BookingError::Internal("room without counterpart".into()))?;
                (room, receiver_id)
            }
            (None, Some(receiver_id)) if receiver_id != sender_id => {
                let room = self
                    .io(
                        "upsert chat room",
                        self.backend.upsert_chat_room(sender_id, receiver_id),
                    )
                    .await?;
                (room, receiver_id)
            }
            (None, Some(_)) => {
                return Err(BookingError::InvalidInput(
                    "cannot message yourself".into(),
                ))
            }
            (None, None) => {
                return Err(BookingError::InvalidInput(
                    "either a chat room or a receiver is required".into(),
                ))
            }
        };

        let now = Utc::now();
        let message = self
            .io(
                "store message",
                self.backend.insert_message(Message {
                    id: Uuid::new_v4(),
                    chat_room_id: room.id,
                    sender_id,
                    receiver_id,
                    content: content.to_string(),
                    read: false,
                    created_at: now,
                }),
            )
            .await?;
        self.io(
            "update last message",
            self.backend.touch_chat_room(room.id, &message.content, now),
        )
        .await?;

        self.broadcaster.publish(receiver_id, &message);
        debug!(message_id = %message.id, chat_room_id = %room.id, "Message sent");
        Ok(message)
    }

    pub async fn messages(
        &self,
        user_id: Uuid,
        chat_room_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, BookingError> {
        self.room_of_participant(chat_room_id, user_id).await?;
        self.io(
            "list messages",
            self.backend
                .messages(chat_room_id, after, MESSAGE_PAGE_SIZE),
        )
        .await
    }

    pub async fn mark_read(&self, user_id: Uuid, chat_room_id: Uuid) -> Result<u64, BookingError> {
        self.room_of_participant(chat_room_id, user_id).await?;
        self.io(
            "mark messages read",
            self.backend.mark_read(chat_room_id, user_id),
        )
        .await
    }

    pub async fn chat_rooms(&self, user_id: Uuid) -> Result<Vec<ChatRoomSummary>, BookingError> {
        let rooms = self
            .io("list chat rooms", self.backend.chat_rooms_for(user_id))
            .await?;

        let unread_counts = try_join_all(rooms.iter().map(|room| {
            self.io(
                "count unread messages",
                self.backend.unread_count(room.id, user_id),
            )
        }))
        .await?;

        Ok(rooms
            .into_iter()
            .zip(unread_counts)
            .filter_map(|(room, unread_count)| {
                Some(ChatRoomSummary {
                    id: room.id,
                    other_user_id: room.other_participant(user_id)?,
                    last_message: room.last_message,
                    last_message_date: room.last_message_date,
                    unread_count,
                })
            })
            .collect())
    }
}
