use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequest, Path, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{self, AuthUser};
use crate::db::{DbHandle, RouteStopInput, TripStopTimeInput};
use crate::errors::AuthError;
use crate::models::{BusStatus, ReportStatus, Role, TripStatus};
use crate::ws::{ServerFrame, TripChannels};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub channels: Arc<TripChannels>,
    pub token_secret: String,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────
//
// Required fields are Options so a missing field surfaces as a 400 with a
// named message rather than a body-rejection error.

#[derive(Deserialize)]
pub struct LoginRequest {
    pub role: Option<String>,
    pub username: Option<String>,
    pub phone_number: Option<String>,
    pub password: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub role: Role,
    pub subject_id: i64,
    pub expires_at: i64,
}

#[derive(Deserialize)]
pub struct StopPayload {
    pub name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Deserialize)]
pub struct RoutePayload {
    pub name: Option<String>,
    pub description: Option<String>,
    pub stops: Option<Vec<RouteStopInput>>,
}

#[derive(Deserialize)]
pub struct BusPayload {
    pub bus_no: Option<String>,
    pub capacity: Option<i32>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct LocationPayload {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
}

#[derive(Deserialize)]
pub struct DriverPayload {
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub license_no: Option<String>,
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct SchedulePayload {
    pub route_id: Option<i64>,
    pub bus_id: Option<i64>,
    pub driver_id: Option<i64>,
    pub departure_time: Option<String>,
    pub days_of_week: Option<String>,
}

#[derive(Deserialize)]
pub struct TripPayload {
    pub route_id: Option<i64>,
    pub bus_id: Option<i64>,
    pub driver_id: Option<i64>,
    pub service_date: Option<String>,
    pub status: Option<String>,
    pub stop_times: Option<Vec<TripStopTimeInput>>,
}

#[derive(Deserialize)]
pub struct TripStatusPayload {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct AnnouncementPayload {
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Deserialize)]
pub struct ReportPayload {
    pub category: Option<String>,
    pub message: Option<String>,
    pub contact: Option<String>,
}

#[derive(Deserialize)]
pub struct ReportStatusPayload {
    pub status: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        // Foreign-key and uniqueness violations are client conflicts (409),
        // not server faults; everything else from the DB surfaces as 500
        // with the underlying message.
        let constraint = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation
            )
        });
        if constraint {
            ApiError::Conflict(format!("{err:#}"))
        } else {
            ApiError::Internal(format!("{err:#}"))
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::WrongRole { .. } => ApiError::Forbidden(err.to_string()),
            _ => ApiError::Unauthorized(err.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// JSON body extractor. Axum's own `Json` rejects malformed bodies with
/// 422; bad input is a validation failure here and gets the same 400
/// envelope as a missing field.
pub struct Payload<T>(pub T);

impl<S, T> FromRequest<S> for Payload<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
        Ok(Payload(value))
    }
}

// ── Validation helpers ────────────────────────────────────────────────

fn require<T>(value: Option<T>, field: &str) -> ApiResult<T> {
    value.ok_or_else(|| ApiError::BadRequest(format!("Missing required field: {}", field)))
}

fn require_text(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(ApiError::BadRequest(format!(
            "Missing required field: {}",
            field
        ))),
    }
}

fn not_found(what: &str, id: i64) -> ApiError {
    ApiError::NotFound(format!("{} {} not found", what, id))
}

fn deleted_ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "deleted": true }))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/stops", get(list_stops).post(create_stop))
        .route(
            "/api/stops/{id}",
            get(get_stop).put(update_stop).delete(delete_stop),
        )
        .route("/api/routes", get(list_routes).post(create_route))
        .route(
            "/api/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/api/buses", get(list_buses).post(create_bus))
        .route(
            "/api/buses/{id}",
            get(get_bus).put(update_bus).delete(delete_bus),
        )
        .route("/api/buses/{id}/location", post(update_bus_location))
        .route("/api/drivers", get(list_drivers).post(create_driver))
        .route(
            "/api/drivers/{id}",
            get(get_driver).put(update_driver).delete(delete_driver),
        )
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route(
            "/api/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/api/trips", get(list_trips).post(create_trip))
        .route(
            "/api/trips/{id}",
            get(get_trip).put(update_trip).delete(delete_trip),
        )
        .route("/api/trips/{id}/status", patch(update_trip_status))
        .route(
            "/api/announcements",
            get(list_announcements).post(create_announcement),
        )
        .route(
            "/api/announcements/{id}",
            get(get_announcement).delete(delete_announcement),
        )
        .route("/api/reports", get(list_reports).post(create_report))
        .route(
            "/api/reports/{id}",
            get(get_report).patch(update_report_status).delete(delete_report),
        )
        .route("/health", get(health_check))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ── Auth ──────────────────────────────────────────────────────────────

async fn login(
    State(state): State<SharedState>,
    Payload(r): Payload<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let role = require_text(r.role, "role")?;
    let role = Role::from_str(&role).map_err(ApiError::BadRequest)?;
    let password = require_text(r.password, "password")?;

    let (subject_id, role) = match role {
        Role::Admin => {
            let username = require_text(r.username, "username")?;
            let creds = state
                .db
                .call(move |db| db.get_admin_credentials(&username))
                .await?;
            let (admin, hash) = creds.ok_or(AuthError::InvalidCredentials)?;
            if !auth::verify_password(&password, &hash) {
                return Err(AuthError::InvalidCredentials.into());
            }
            (admin.id, Role::Admin)
        }
        Role::Driver => {
            let phone = require_text(r.phone_number, "phone_number")?;
            let creds = state
                .db
                .call(move |db| db.get_driver_credentials(&phone))
                .await?;
            let (driver, hash) = creds.ok_or(AuthError::InvalidCredentials)?;
            if !auth::verify_password(&password, &hash) {
                return Err(AuthError::InvalidCredentials.into());
            }
            (driver.id, Role::Driver)
        }
    };

    let (token, expires_at) = auth::mint_token(
        &state.token_secret,
        role,
        subject_id,
        Utc::now().timestamp(),
    );
    tracing::info!(role = role.as_str(), subject_id, "login");
    Ok(Json(LoginResponse {
        token,
        role,
        subject_id,
        expires_at,
    }))
}

// ── Stops ─────────────────────────────────────────────────────────────

async fn list_stops(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let stops = state.db.call(|db| db.list_stops()).await?;
    Ok(Json(stops))
}

async fn create_stop(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<StopPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let latitude = require(r.latitude, "latitude")?;
    let longitude = require(r.longitude, "longitude")?;
    let stop = state
        .db
        .call(move |db| db.create_stop(&name, latitude, longitude))
        .await?;
    Ok((StatusCode::CREATED, Json(stop)))
}

async fn get_stop(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let stop = state
        .db
        .call(move |db| db.get_stop(id))
        .await?
        .ok_or_else(|| not_found("Stop", id))?;
    Ok(Json(stop))
}

async fn update_stop(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<StopPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let latitude = require(r.latitude, "latitude")?;
    let longitude = require(r.longitude, "longitude")?;
    let stop = state
        .db
        .call(move |db| db.update_stop(id, &name, latitude, longitude))
        .await?
        .ok_or_else(|| not_found("Stop", id))?;
    Ok(Json(stop))
}

async fn delete_stop(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_stop(id)).await?;
    if !deleted {
        return Err(not_found("Stop", id));
    }
    Ok(deleted_ok())
}

// ── Routes ────────────────────────────────────────────────────────────

async fn list_routes(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let routes = state.db.call(|db| db.list_routes()).await?;
    Ok(Json(routes))
}

async fn create_route(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<RoutePayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let stops = r.stops.unwrap_or_default();
    let route = state
        .db
        .call(move |db| db.create_route(&name, r.description.as_deref(), &stops))
        .await?;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn get_route(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let route = state
        .db
        .call(move |db| db.get_route_detail(id))
        .await?
        .ok_or_else(|| not_found("Route", id))?;
    Ok(Json(route))
}

async fn update_route(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<RoutePayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let route = state
        .db
        .call(move |db| db.update_route(id, &name, r.description.as_deref(), r.stops.as_deref()))
        .await?
        .ok_or_else(|| not_found("Route", id))?;
    Ok(Json(route))
}

async fn delete_route(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_route(id)).await?;
    if !deleted {
        return Err(not_found("Route", id));
    }
    Ok(deleted_ok())
}

// ── Buses ─────────────────────────────────────────────────────────────

async fn list_buses(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let buses = state.db.call(|db| db.list_buses()).await?;
    Ok(Json(buses))
}

fn parse_bus_status(status: Option<String>) -> ApiResult<BusStatus> {
    match status {
        None => Ok(BusStatus::Active),
        Some(s) => BusStatus::from_str(&s).map_err(ApiError::BadRequest),
    }
}

async fn create_bus(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<BusPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let bus_no = require_text(r.bus_no, "bus_no")?;
    let capacity = require(r.capacity, "capacity")?;
    let status = parse_bus_status(r.status)?;
    let bus = state
        .db
        .call(move |db| db.create_bus(&bus_no, capacity, &status))
        .await?;
    Ok((StatusCode::CREATED, Json(bus)))
}

async fn get_bus(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let bus = state
        .db
        .call(move |db| db.get_bus(id))
        .await?
        .ok_or_else(|| not_found("Bus", id))?;
    Ok(Json(bus))
}

async fn update_bus(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<BusPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let bus_no = require_text(r.bus_no, "bus_no")?;
    let capacity = require(r.capacity, "capacity")?;
    let status = parse_bus_status(r.status)?;
    let bus = state
        .db
        .call(move |db| db.update_bus(id, &bus_no, capacity, &status))
        .await?
        .ok_or_else(|| not_found("Bus", id))?;
    Ok(Json(bus))
}

async fn delete_bus(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_bus(id)).await?;
    if !deleted {
        return Err(not_found("Bus", id));
    }
    Ok(deleted_ok())
}

/// Overwrite a bus's live location (drivers report here). The row keeps no
/// history; the frame is also republished on the relay channel of the bus's
/// in-progress trip, if it has one.
async fn update_bus_location(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<LocationPayload>,
) -> ApiResult<impl IntoResponse> {
    let latitude = require(r.latitude, "latitude")?;
    let longitude = require(r.longitude, "longitude")?;
    let speed_kmh = r.speed_kmh;
    let recorded_at = Utc::now().to_rfc3339();

    let stamp = recorded_at.clone();
    let (bus, active_trip) = state
        .db
        .call(move |db| {
            let bus = db.update_bus_location(id, latitude, longitude, speed_kmh, &stamp)?;
            let trip = match &bus {
                Some(_) => db.find_active_trip_for_bus(id)?,
                None => None,
            };
            Ok((bus, trip))
        })
        .await?;
    let bus = bus.ok_or_else(|| not_found("Bus", id))?;

    if let Some(trip_id) = active_trip {
        state.channels.publish(
            trip_id,
            Uuid::nil(),
            &ServerFrame::Location {
                trip_id,
                latitude,
                longitude,
                speed_kmh,
                recorded_at,
            },
        );
    }
    Ok(Json(bus))
}

// ── Drivers ───────────────────────────────────────────────────────────

async fn list_drivers(
    State(state): State<SharedState>,
    user: AuthUser,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let drivers = state.db.call(|db| db.list_drivers()).await?;
    Ok(Json(drivers))
}

async fn create_driver(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<DriverPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let phone_number = require_text(r.phone_number, "phone_number")?;
    let password = require_text(r.password, "password")?;
    let hash = auth::hash_password(&password);
    let driver = state
        .db
        .call(move |db| db.create_driver(&name, &phone_number, r.license_no.as_deref(), &hash))
        .await?;
    Ok((StatusCode::CREATED, Json(driver)))
}

async fn get_driver(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let driver = state
        .db
        .call(move |db| db.get_driver(id))
        .await?
        .ok_or_else(|| not_found("Driver", id))?;
    Ok(Json(driver))
}

async fn update_driver(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<DriverPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let name = require_text(r.name, "name")?;
    let phone_number = require_text(r.phone_number, "phone_number")?;
    let hash = r.password.as_deref().map(auth::hash_password);
    let driver = state
        .db
        .call(move |db| {
            db.update_driver(
                id,
                &name,
                &phone_number,
                r.license_no.as_deref(),
                hash.as_deref(),
            )
        })
        .await?
        .ok_or_else(|| not_found("Driver", id))?;
    Ok(Json(driver))
}

async fn delete_driver(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_driver(id)).await?;
    if !deleted {
        return Err(not_found("Driver", id));
    }
    Ok(deleted_ok())
}

// ── Schedules ─────────────────────────────────────────────────────────

async fn list_schedules(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let schedules = state.db.call(|db| db.list_schedules()).await?;
    Ok(Json(schedules))
}

async fn create_schedule(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<SchedulePayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let route_id = require(r.route_id, "route_id")?;
    let departure_time = require_text(r.departure_time, "departure_time")?;
    let days_of_week = r.days_of_week.unwrap_or_else(|| "Mon-Sun".to_string());
    let schedule = state
        .db
        .call(move |db| {
            db.create_schedule(route_id, r.bus_id, r.driver_id, &departure_time, &days_of_week)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(schedule)))
}

async fn get_schedule(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state
        .db
        .call(move |db| db.get_schedule(id))
        .await?
        .ok_or_else(|| not_found("Schedule", id))?;
    Ok(Json(schedule))
}

async fn update_schedule(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<SchedulePayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let route_id = require(r.route_id, "route_id")?;
    let departure_time = require_text(r.departure_time, "departure_time")?;
    let days_of_week = r.days_of_week.unwrap_or_else(|| "Mon-Sun".to_string());
    let schedule = state
        .db
        .call(move |db| {
            db.update_schedule(
                id,
                route_id,
                r.bus_id,
                r.driver_id,
                &departure_time,
                &days_of_week,
            )
        })
        .await?
        .ok_or_else(|| not_found("Schedule", id))?;
    Ok(Json(schedule))
}

async fn delete_schedule(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_schedule(id)).await?;
    if !deleted {
        return Err(not_found("Schedule", id));
    }
    Ok(deleted_ok())
}

// ── Trips ─────────────────────────────────────────────────────────────

async fn list_trips(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let trips = state.db.call(|db| db.list_trips()).await?;
    Ok(Json(trips))
}

async fn create_trip(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<TripPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let route_id = require(r.route_id, "route_id")?;
    let bus_id = require(r.bus_id, "bus_id")?;
    let driver_id = require(r.driver_id, "driver_id")?;
    let service_date = require_text(r.service_date, "service_date")?;
    let status = r
        .status
        .unwrap_or_else(|| TripStatus::Scheduled.as_str().to_string());
    let stop_times = r.stop_times.unwrap_or_default();
    let trip = state
        .db
        .call(move |db| {
            db.create_trip(route_id, bus_id, driver_id, &service_date, &status, &stop_times)
        })
        .await?;
    Ok((StatusCode::CREATED, Json(trip)))
}

async fn get_trip(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let trip = state
        .db
        .call(move |db| db.get_trip_detail(id))
        .await?
        .ok_or_else(|| not_found("Trip", id))?;
    Ok(Json(trip))
}

async fn update_trip(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<TripPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let route_id = require(r.route_id, "route_id")?;
    let bus_id = require(r.bus_id, "bus_id")?;
    let driver_id = require(r.driver_id, "driver_id")?;
    let service_date = require_text(r.service_date, "service_date")?;
    let trip = state
        .db
        .call(move |db| db.update_trip(id, route_id, bus_id, driver_id, &service_date))
        .await?
        .ok_or_else(|| not_found("Trip", id))?;
    Ok(Json(trip))
}

/// Set a trip's status. Any non-empty string is accepted and stored
/// verbatim; transitions are not guarded (drivers pause and resume trips
/// freely, and the original system never enforced a state machine).
async fn update_trip_status(
    State(state): State<SharedState>,
    _user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<TripStatusPayload>,
) -> ApiResult<impl IntoResponse> {
    let status = require_text(r.status, "status")?;
    let trip = state
        .db
        .call(move |db| db.update_trip_status(id, &status))
        .await?
        .ok_or_else(|| not_found("Trip", id))?;
    Ok(Json(trip))
}

async fn delete_trip(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_trip(id)).await?;
    if !deleted {
        return Err(not_found("Trip", id));
    }
    Ok(deleted_ok())
}

// ── Announcements ─────────────────────────────────────────────────────

async fn list_announcements(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let announcements = state.db.call(|db| db.list_announcements()).await?;
    Ok(Json(announcements))
}

async fn create_announcement(
    State(state): State<SharedState>,
    user: AuthUser,
    Payload(r): Payload<AnnouncementPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let title = require_text(r.title, "title")?;
    let body = require_text(r.body, "body")?;
    let author = user.0.subject;
    let announcement = state
        .db
        .call(move |db| db.create_announcement(&title, &body, Some(author)))
        .await?;
    Ok((StatusCode::CREATED, Json(announcement)))
}

async fn get_announcement(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let announcement = state
        .db
        .call(move |db| db.get_announcement(id))
        .await?
        .ok_or_else(|| not_found("Announcement", id))?;
    Ok(Json(announcement))
}

async fn delete_announcement(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_announcement(id)).await?;
    if !deleted {
        return Err(not_found("Announcement", id));
    }
    Ok(deleted_ok())
}

// ── Passenger reports ─────────────────────────────────────────────────

async fn list_reports(
    State(state): State<SharedState>,
    user: AuthUser,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let reports = state.db.call(|db| db.list_reports()).await?;
    Ok(Json(reports))
}

/// Passengers file reports unauthenticated from the mobile app.
async fn create_report(
    State(state): State<SharedState>,
    Payload(r): Payload<ReportPayload>,
) -> ApiResult<impl IntoResponse> {
    let category = require_text(r.category, "category")?;
    let message = require_text(r.message, "message")?;
    let report = state
        .db
        .call(move |db| db.create_report(&category, &message, r.contact.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn get_report(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let report = state
        .db
        .call(move |db| db.get_report(id))
        .await?
        .ok_or_else(|| not_found("Report", id))?;
    Ok(Json(report))
}

async fn update_report_status(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Payload(r): Payload<ReportStatusPayload>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let status = require_text(r.status, "status")?;
    let status = ReportStatus::from_str(&status).map_err(ApiError::BadRequest)?;
    let report = state
        .db
        .call(move |db| db.update_report_status(id, &status))
        .await?
        .ok_or_else(|| not_found("Report", id))?;
    Ok(Json(report))
}

async fn delete_report(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    user.0.require_admin()?;
    let deleted = state.db.call(move |db| db.delete_report(id)).await?;
    if !deleted {
        return Err(not_found("Report", id));
    }
    Ok(deleted_ok())
}
