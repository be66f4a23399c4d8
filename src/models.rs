use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admin {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: i64,
    pub name: String,
    pub phone_number: String,
    pub license_no: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub id: i64,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

/// One entry of a route's ordered stop sequence, joined with the stop row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStop {
    pub stop_id: i64,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub seq: i32,
    pub offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDetail {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
    pub stops: Vec<RouteStop>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BusStatus {
    Active,
    Maintenance,
    Retired,
}

impl BusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Retired => "retired",
        }
    }
}

impl FromStr for BusStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "maintenance" => Ok(Self::Maintenance),
            "retired" => Ok(Self::Retired),
            _ => Err(format!("Invalid bus status: {}", s)),
        }
    }
}

/// A bus row. Location fields are overwritten in place on every report;
/// no history is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub id: i64,
    pub bus_no: String,
    pub capacity: i32,
    pub status: BusStatus,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub route_id: i64,
    pub bus_id: Option<i64>,
    pub driver_id: Option<i64>,
    pub departure_time: String,
    pub days_of_week: String,
}

/// Canonical trip status values.
///
/// Status is stored as a free string and `PATCH /api/trips/{id}/status`
/// stores whatever non-empty value it receives. This enum covers the values
/// the clients actually use and supplies the default for new trips.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TripStatus {
    Scheduled,
    #[serde(rename = "In Progress")]
    InProgress,
    Paused,
    Completed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::InProgress => "In Progress",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
        }
    }
}

impl FromStr for TripStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Scheduled" => Ok(Self::Scheduled),
            "In Progress" => Ok(Self::InProgress),
            "Paused" => Ok(Self::Paused),
            "Completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown trip status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: i64,
    pub route_id: i64,
    pub bus_id: i64,
    pub driver_id: i64,
    pub service_date: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripStopTime {
    pub stop_id: i64,
    pub seq: i32,
    pub expected_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripDetail {
    pub id: i64,
    pub route_id: i64,
    pub bus_id: i64,
    pub driver_id: i64,
    pub service_date: String,
    pub status: String,
    pub created_at: String,
    pub stop_times: Vec<TripStopTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub id: i64,
    pub title: String,
    pub body: String,
    pub created_by: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Open,
    Resolved,
    Dismissed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }
}

impl FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            "dismissed" => Ok(Self::Dismissed),
            _ => Err(format!("Invalid report status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerReport {
    pub id: i64,
    pub category: String,
    pub message: String,
    pub contact: Option<String>,
    pub status: ReportStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Driver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Driver => "driver",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "driver" => Ok(Self::Driver),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}
