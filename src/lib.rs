//! fleetd — city bus fleet-management backend.
//!
//! ## Overview
//!
//! fleetd is the backend behind an admin dashboard and two mobile companion
//! apps (driver, passenger). It owns CRUD over buses, routes, stops,
//! schedules, trips, drivers, announcements, and passenger reports, a
//! role-based login endpoint, and a best-effort live location relay over
//! WebSocket.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │ Clients  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │ (apps,   │ <─────── │    ├─ api.rs   (route handlers, AppState)        │
//! │  admin)  │ WebSocket│    └─ ws.rs    (per-trip location relay)         │
//! └──────────┘          │         │                                        │
//!                       │         │ DbHandle::call()                       │
//!                       │         v                                        │
//!                       │  db.rs  (SQLite via rusqlite, spawn_blocking)    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                          |
//! |----------|---------------------------------------------------------|
//! | `models` | Shared types: `Bus`, `Route`, `Trip`, `TripStatus`, ... |
//! | `auth`   | Password digests, signed bearer tokens, `AuthUser`      |
//! | `errors` | Typed auth error hierarchy                              |
//!
//! ## Typical Request Flow (driver reports a location)
//!
//! 1. `POST /api/buses/{id}/location` → `api::update_bus_location()`
//! 2. The bus row is overwritten in place with the new coordinates and a
//!    server-side timestamp (no history is retained).
//! 3. If the bus has a trip currently `In Progress`, the frame is republished
//!    on that trip's broadcast channel so every WebSocket listener joined to
//!    the trip receives it. Delivery is best effort: lagged receivers skip
//!    missed frames, and there is no ordering guarantee across publishers.

pub mod api;
pub mod auth;
pub mod db;
pub mod errors;
pub mod models;
pub mod server;
pub mod ws;
