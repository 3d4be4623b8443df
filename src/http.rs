use crate::availability::{calendar_date, day_label};
use crate::backend::BookingBackend;
use crate::broadcast::ConnectionRegistry;
use crate::clock::SystemClock;
use crate::configuration::Configuration;
use crate::conflict::SlotCandidate;
use crate::conversations::OutgoingMessage;
use crate::coordinator::{BookingCoordinator, BookingRequest, PaymentMetadata};
use crate::deadline::retry_once;
use crate::error::BookingError;
use crate::types::{
    BookingStatus, Caller, DayAvailability, Role, SessionType, TimeSlot,
};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, warn};
use uuid::Uuid;
use validator::Validate;

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";
const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

#[derive(Clone)]
pub struct AppState<T: BookingBackend, C: Configuration> {
    coordinator: BookingCoordinator<T>,
    registry: ConnectionRegistry,
    configuration: C,
}

#[derive(Debug, Deserialize)]
struct AvailabilityQuery {
    date: String,
}

#[derive(Debug, Serialize)]
struct AvailabilityResponse {
    date: NaiveDate,
    label: String,
    slots: Vec<TimeSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SlotRequest {
    counselor_id: Uuid,
    date: String,
    #[serde(flatten)]
    #[validate(nested)]
    slot: TimeSlot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct CreateBookingRequest {
    counselor_id: Uuid,
    date: String,
    #[serde(flatten)]
    #[validate(nested)]
    slot: TimeSlot,
    session_type: SessionType,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusRequest {
    status: BookingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    #[validate(nested)]
    availability: Vec<ScheduleDay>,
    hourly_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct ScheduleDay {
    day: String,
    #[validate(nested)]
    slots: Vec<TimeSlot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    receiver_id: Option<Uuid>,
    chat_room_id: Option<Uuid>,
    #[validate(length(max = 4000, message = "message is too long"))]
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    chat_room_id: Uuid,
    after: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    chat_room_id: Uuid,
}

/// Checkout completion as forwarded by the payment gateway.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct PaymentWebhook {
    #[validate(length(min = 1, message = "payment reference is required"))]
    payment_reference: String,
    /// Minor currency units.
    #[validate(range(min = 1, message = "amount must be positive"))]
    amount_total: Option<i64>,
    metadata: PaymentWebhookMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentWebhookMetadata {
    counselor_id: Uuid,
    client_id: Uuid,
    date: String,
    /// `HH:MM-HH:MM`
    time_slot: String,
    session_type: SessionType,
}

impl IntoResponse for BookingError {
    fn into_response(self) -> Response {
        let status = match &self {
            BookingError::NotFound(_) => StatusCode::NOT_FOUND,
            BookingError::Unauthorized => StatusCode::UNAUTHORIZED,
            BookingError::Forbidden(_) => StatusCode::FORBIDDEN,
            BookingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            BookingError::SlotNotAvailable { .. }
            | BookingError::SlotAlreadyBooked { .. }
            | BookingError::InvalidTransition { .. } => StatusCode::CONFLICT,
            BookingError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BookingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({ "error": self.code(), "message": self.to_string() });
        match &self {
            BookingError::SlotNotAvailable {
                date,
                start_time,
                end_time,
                reason,
            } => {
                body["date"] = json!(date);
                body["startTime"] = json!(start_time);
                body["endTime"] = json!(end_time);
                body["reason"] = json!(reason);
            }
            BookingError::SlotAlreadyBooked {
                date,
                start_time,
                end_time,
            } => {
                body["date"] = json!(date);
                body["startTime"] = json!(start_time);
                body["endTime"] = json!(end_time);
            }
            BookingError::InvalidTransition { from, to } => {
                body["from"] = json!(from);
                body["to"] = json!(to);
            }
            BookingError::Internal(_) => error!(err = %self, "Request failed"),
            BookingError::Unavailable(_) => warn!(err = %self, "Request failed"),
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

pub fn create_app<T: BookingBackend, C: Configuration>(backend: T, configuration: C) -> Router {
    let registry = ConnectionRegistry::default();
    let coordinator = BookingCoordinator::new(
        backend,
        Arc::new(SystemClock),
        Arc::new(registry.clone()),
        configuration.store_timeout(),
    );
    let state = AppState {
        coordinator,
        registry,
        configuration,
    };

    let cors = CorsLayer::new()
        .allow_origin(allowed_origin(state.configuration.allowed_origin()))
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/counselors", get(list_counselors::<T, C>))
        .route("/counselors/:id", get(get_counselor::<T, C>));

    let authenticated = Router::new()
        .route(
            "/counselors/:id/availability",
            get(get_availability::<T, C>),
        )
        .route("/bookings/validate", post(validate_slot::<T, C>))
        .route(
            "/bookings",
            post(create_booking::<T, C>).get(list_bookings::<T, C>),
        )
        .route("/bookings/:id/status", put(update_booking_status::<T, C>))
        .route(
            "/counselor/schedule",
            get(get_schedule::<T, C>).put(update_schedule::<T, C>),
        )
        .route(
            "/messages",
            post(send_message::<T, C>).get(list_messages::<T, C>),
        )
        .route("/messages/read", post(mark_read::<T, C>))
        .route("/chats", get(list_chat_rooms::<T, C>))
        .route("/clients", get(list_clients::<T, C>))
        .route("/events", get(events::<T, C>))
        .route_layer(middleware::from_fn(identify));

    let webhooks = Router::new()
        .route("/webhooks/payment", post(payment_webhook::<T, C>))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            webhook_auth::<T, C>,
        ));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .merge(webhooks)
        .with_state(state)
        .layer(cors)
}

fn allowed_origin(origin: Option<String>) -> AllowOrigin {
    match origin.map(|origin| HeaderValue::from_str(&origin)) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(err)) => {
            warn!(%err, "Ignoring malformed allowed origin, allowing any");
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    }
}

fn caller_from_headers(headers: &HeaderMap) -> Option<Caller> {
    let user_id = headers
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()?
        .parse::<Uuid>()
        .ok()?;
    let role = Role::parse(headers.get(USER_ROLE_HEADER)?.to_str().ok()?)?;
    Some(Caller { user_id, role })
}

/// Resolves the identity forwarded by the session proxy.
async fn identify(mut request: Request, next: Next) -> Result<Response, BookingError> {
    let caller = caller_from_headers(request.headers()).ok_or(BookingError::Unauthorized)?;
    request.extensions_mut().insert(caller);
    Ok(next.run(request).await)
}

async fn webhook_auth<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    request: Request,
    next: Next,
) -> Result<Response, BookingError> {
    let secret = state.configuration.webhook_secret();
    match request.headers().get(WEBHOOK_SECRET_HEADER) {
        Some(header) if header.to_str().unwrap_or("") == secret => Ok(next.run(request).await),
        Some(_) => {
            warn!("Payment webhook with wrong secret");
            Err(BookingError::Unauthorized)
        }
        None => Err(BookingError::Unauthorized),
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, BookingError> {
    calendar_date(value).ok_or_else(|| BookingError::InvalidInput(format!("invalid date '{value}'")))
}

async fn list_counselors<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
) -> Result<impl IntoResponse, BookingError> {
    Ok(Json(state.coordinator.counselors().await?))
}

async fn get_counselor<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Path(counselor_id): Path<Uuid>,
) -> Result<impl IntoResponse, BookingError> {
    Ok(Json(state.coordinator.counselor_profile(counselor_id).await?))
}

async fn get_availability<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Path(counselor_id): Path<Uuid>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityResponse>, BookingError> {
    let date = parse_date(&query.date)?;
    let coordinator = &state.coordinator;
    let slots = retry_once(state.configuration.retry_backoff(), || {
        coordinator.counselor_availability(counselor_id, date)
    })
    .await?;
    Ok(Json(AvailabilityResponse {
        date,
        label: day_label(date, coordinator.clock.now().date()),
        slots,
    }))
}

async fn validate_slot<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Json(request): Json<SlotRequest>,
) -> Result<impl IntoResponse, BookingError> {
    request.validate()?;
    let candidate = SlotCandidate {
        counselor_id: request.counselor_id,
        date: parse_date(&request.date)?,
        slot: request.slot,
    };
    let coordinator = &state.coordinator;
    let verdict = retry_once(state.configuration.retry_backoff(), || {
        coordinator.validate_slot(&candidate)
    })
    .await?;
    Ok(Json(verdict))
}

async fn create_booking<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<CreateBookingRequest>,
) -> Result<impl IntoResponse, BookingError> {
    if caller.role != Role::Client {
        return Err(BookingError::Forbidden("only clients can book sessions".into()));
    }
    request.validate()?;
    let outcome = state
        .coordinator
        .create_booking(BookingRequest {
            counselor_id: request.counselor_id,
            client_id: caller.user_id,
            date: parse_date(&request.date)?,
            slot: request.slot,
            session_type: request.session_type,
        })
        .await?;
    Ok(Json(outcome))
}

async fn list_bookings<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, BookingError> {
    let bookings = state.coordinator.list_bookings(caller, query.limit).await?;
    Ok(Json(bookings))
}

async fn update_booking_status<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Path(booking_id): Path<Uuid>,
    Json(request): Json<StatusRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let booking = state
        .coordinator
        .update_booking_status(booking_id, caller.user_id, request.status)
        .await?;
    Ok(Json(booking))
}

async fn get_schedule<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, BookingError> {
    Ok(Json(state.coordinator.schedule(caller).await?))
}

async fn update_schedule<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, BookingError> {
    request.validate()?;
    let availability = request
        .availability
        .into_iter()
        .map(|entry| {
            Ok(DayAvailability {
                day: parse_date(&entry.day)?,
                slots: entry.slots,
            })
        })
        .collect::<Result<Vec<_>, BookingError>>()?;
    let counselor = state
        .coordinator
        .update_schedule(caller, availability, request.hourly_rate)
        .await?;
    Ok(Json(counselor))
}

async fn send_message<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, BookingError> {
    request.validate()?;
    let message = state
        .coordinator
        .send_message(
            caller.user_id,
            OutgoingMessage {
                receiver_id: request.receiver_id,
                chat_room_id: request.chat_room_id,
                content: request.content,
            },
        )
        .await?;
    Ok(Json(message))
}

async fn list_messages<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<MessagesQuery>,
) -> Result<impl IntoResponse, BookingError> {
    let messages = state
        .coordinator
        .messages(caller.user_id, query.chat_room_id, query.after)
        .await?;
    Ok(Json(messages))
}

async fn mark_read<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
    Json(request): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, BookingError> {
    let updated = state
        .coordinator
        .mark_read(caller.user_id, request.chat_room_id)
        .await?;
    Ok(Json(json!({ "updated": updated })))
}

async fn list_chat_rooms<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, BookingError> {
    Ok(Json(state.coordinator.chat_rooms(caller.user_id).await?))
}

async fn list_clients<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, BookingError> {
    Ok(Json(state.coordinator.clients(caller).await?))
}

/// Server-sent events carrying every message addressed to the caller.
async fn events<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Extension(caller): Extension<Caller>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let user_id = caller.user_id;
    let stream = state.registry.subscribe(user_id);
    debug!(
        %user_id,
        connections = state.registry.connections(user_id),
        "Event stream opened"
    );
    let stream = stream.filter_map(move |delivery| match delivery {
        Ok(message) => match Event::default().event("message").json_data(&message) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                error!(%err, message_id = %message.id, "Failed to encode message event");
                None
            }
        },
        Err(err) => {
            warn!(%user_id, %err, "Event stream fell behind");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn payment_webhook<T: BookingBackend, C: Configuration>(
    State(state): State<AppState<T, C>>,
    Json(webhook): Json<PaymentWebhook>,
) -> Result<impl IntoResponse, BookingError> {
    webhook.validate()?;
    let metadata = webhook.metadata;
    let slot = TimeSlot::parse_range(&metadata.time_slot).ok_or_else(|| {
        BookingError::InvalidInput(format!("invalid time slot '{}'", metadata.time_slot))
    })?;
    slot.validate()?;

    let outcome = state
        .coordinator
        .confirm_paid_booking(
            &webhook.payment_reference,
            PaymentMetadata {
                counselor_id: metadata.counselor_id,
                client_id: metadata.client_id,
                date: parse_date(&metadata.date)?,
                slot,
                session_type: metadata.session_type,
                settled_amount: webhook.amount_total,
            },
        )
        .await?;
    Ok(Json(outcome))
}
