use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;

use crate::models::*;

/// Async-safe handle to the fleet database.
///
/// Wraps `FleetDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. One handle is created at startup
/// and injected through the application state; request handlers never open
/// their own connections.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FleetDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used where blocking is
    /// acceptable: CLI commands, startup initialization, and tests. Must not
    /// be called from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, FleetDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Stop-sequence entry supplied when creating or replacing a route.
/// The sequence index is the entry's position in the submitted list.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteStopInput {
    pub stop_id: i64,
    #[serde(default)]
    pub offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TripStopTimeInput {
    pub stop_id: i64,
    pub expected_time: String,
}

pub struct FleetDb {
    conn: Connection,
}

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS admins (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    display_name TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS drivers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    phone_number TEXT NOT NULL UNIQUE,
                    license_no TEXT,
                    password_hash TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS stops (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    latitude REAL NOT NULL,
                    longitude REAL NOT NULL
                );

                CREATE TABLE IF NOT EXISTS routes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    description TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS route_stops (
                    route_id INTEGER NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
                    stop_id INTEGER NOT NULL REFERENCES stops(id),
                    seq INTEGER NOT NULL,
                    offset_minutes INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (route_id, seq)
                );

                CREATE TABLE IF NOT EXISTS buses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    bus_no TEXT NOT NULL UNIQUE,
                    capacity INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    latitude REAL,
                    longitude REAL,
                    speed_kmh REAL,
                    last_updated TEXT
                );

                CREATE TABLE IF NOT EXISTS schedules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    route_id INTEGER NOT NULL REFERENCES routes(id),
                    bus_id INTEGER REFERENCES buses(id),
                    driver_id INTEGER REFERENCES drivers(id),
                    departure_time TEXT NOT NULL,
                    days_of_week TEXT NOT NULL DEFAULT 'Mon-Sun'
                );

                CREATE TABLE IF NOT EXISTS trips (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    route_id INTEGER NOT NULL REFERENCES routes(id),
                    bus_id INTEGER NOT NULL REFERENCES buses(id),
                    driver_id INTEGER NOT NULL REFERENCES drivers(id),
                    service_date TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'Scheduled',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS trip_stop_times (
                    trip_id INTEGER NOT NULL REFERENCES trips(id) ON DELETE CASCADE,
                    stop_id INTEGER NOT NULL REFERENCES stops(id),
                    seq INTEGER NOT NULL,
                    expected_time TEXT NOT NULL,
                    PRIMARY KEY (trip_id, seq)
                );

                CREATE TABLE IF NOT EXISTS announcements (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_by INTEGER REFERENCES admins(id),
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS passenger_reports (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    category TEXT NOT NULL,
                    message TEXT NOT NULL,
                    contact TEXT,
                    status TEXT NOT NULL DEFAULT 'open',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_route_stops_route ON route_stops(route_id);
                CREATE INDEX IF NOT EXISTS idx_trips_bus ON trips(bus_id);
                CREATE INDEX IF NOT EXISTS idx_trips_route ON trips(route_id);
                CREATE INDEX IF NOT EXISTS idx_trip_stop_times_trip ON trip_stop_times(trip_id);
                CREATE INDEX IF NOT EXISTS idx_schedules_route ON schedules(route_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Admin accounts ────────────────────────────────────────────────

    pub fn create_admin(
        &self,
        username: &str,
        password_hash: &str,
        display_name: &str,
    ) -> Result<Admin> {
        self.conn
            .execute(
                "INSERT INTO admins (username, password_hash, display_name) VALUES (?1, ?2, ?3)",
                params![username, password_hash, display_name],
            )
            .context("Failed to insert admin")?;
        let id = self.conn.last_insert_rowid();
        self.get_admin(id)?.context("Admin not found after insert")
    }

    pub fn get_admin(&self, id: i64) -> Result<Option<Admin>> {
        self.conn
            .query_row(
                "SELECT id, username, display_name, created_at FROM admins WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Admin {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        display_name: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query admin")
    }

    /// Look up an admin by username, returning the row and its password hash.
    pub fn get_admin_credentials(&self, username: &str) -> Result<Option<(Admin, String)>> {
        self.conn
            .query_row(
                "SELECT id, username, display_name, created_at, password_hash
                 FROM admins WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        Admin {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            display_name: row.get(2)?,
                            created_at: row.get(3)?,
                        },
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query admin credentials")
    }

    // ── Driver CRUD ───────────────────────────────────────────────────

    pub fn create_driver(
        &self,
        name: &str,
        phone_number: &str,
        license_no: Option<&str>,
        password_hash: &str,
    ) -> Result<Driver> {
        self.conn
            .execute(
                "INSERT INTO drivers (name, phone_number, license_no, password_hash)
                 VALUES (?1, ?2, ?3, ?4)",
                params![name, phone_number, license_no, password_hash],
            )
            .context("Failed to insert driver")?;
        let id = self.conn.last_insert_rowid();
        self.get_driver(id)?
            .context("Driver not found after insert")
    }

    pub fn list_drivers(&self) -> Result<Vec<Driver>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, phone_number, license_no, created_at FROM drivers ORDER BY id",
            )
            .context("Failed to prepare list_drivers")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Driver {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    phone_number: row.get(2)?,
                    license_no: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query drivers")?;
        let mut drivers = Vec::new();
        for row in rows {
            drivers.push(row.context("Failed to read driver row")?);
        }
        Ok(drivers)
    }

    pub fn get_driver(&self, id: i64) -> Result<Option<Driver>> {
        self.conn
            .query_row(
                "SELECT id, name, phone_number, license_no, created_at FROM drivers WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Driver {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        phone_number: row.get(2)?,
                        license_no: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query driver")
    }

    pub fn get_driver_credentials(&self, phone_number: &str) -> Result<Option<(Driver, String)>> {
        self.conn
            .query_row(
                "SELECT id, name, phone_number, license_no, created_at, password_hash
                 FROM drivers WHERE phone_number = ?1",
                params![phone_number],
                |row| {
                    Ok((
                        Driver {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            phone_number: row.get(2)?,
                            license_no: row.get(3)?,
                            created_at: row.get(4)?,
                        },
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query driver credentials")
    }

    /// Full update of a driver row. A new password hash is applied only when
    /// provided; otherwise the stored hash is kept.
    pub fn update_driver(
        &self,
        id: i64,
        name: &str,
        phone_number: &str,
        license_no: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<Driver>> {
        let n = self
            .conn
            .execute(
                "UPDATE drivers
                 SET name = ?1, phone_number = ?2, license_no = ?3,
                     password_hash = COALESCE(?4, password_hash)
                 WHERE id = ?5",
                params![name, phone_number, license_no, password_hash, id],
            )
            .context("Failed to update driver")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_driver(id)
    }

    pub fn delete_driver(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM drivers WHERE id = ?1", params![id])
            .context("Failed to delete driver")?;
        Ok(n > 0)
    }

    // ── Stop CRUD ─────────────────────────────────────────────────────

    pub fn create_stop(&self, name: &str, latitude: f64, longitude: f64) -> Result<Stop> {
        self.conn
            .execute(
                "INSERT INTO stops (name, latitude, longitude) VALUES (?1, ?2, ?3)",
                params![name, latitude, longitude],
            )
            .context("Failed to insert stop")?;
        let id = self.conn.last_insert_rowid();
        self.get_stop(id)?.context("Stop not found after insert")
    }

    pub fn list_stops(&self) -> Result<Vec<Stop>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, latitude, longitude FROM stops ORDER BY id")
            .context("Failed to prepare list_stops")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Stop {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                })
            })
            .context("Failed to query stops")?;
        let mut stops = Vec::new();
        for row in rows {
            stops.push(row.context("Failed to read stop row")?);
        }
        Ok(stops)
    }

    pub fn get_stop(&self, id: i64) -> Result<Option<Stop>> {
        self.conn
            .query_row(
                "SELECT id, name, latitude, longitude FROM stops WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Stop {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        latitude: row.get(2)?,
                        longitude: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query stop")
    }

    pub fn update_stop(
        &self,
        id: i64,
        name: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<Option<Stop>> {
        let n = self
            .conn
            .execute(
                "UPDATE stops SET name = ?1, latitude = ?2, longitude = ?3 WHERE id = ?4",
                params![name, latitude, longitude, id],
            )
            .context("Failed to update stop")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_stop(id)
    }

    pub fn delete_stop(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM stops WHERE id = ?1", params![id])
            .context("Failed to delete stop")?;
        Ok(n > 0)
    }

    // ── Route CRUD ────────────────────────────────────────────────────

    /// Insert a route and its ordered stop sequence atomically. Either the
    /// route row and every `route_stops` row land, or nothing does.
    pub fn create_route(
        &self,
        name: &str,
        description: Option<&str>,
        stops: &[RouteStopInput],
    ) -> Result<RouteDetail> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        tx.execute(
            "INSERT INTO routes (name, description) VALUES (?1, ?2)",
            params![name, description],
        )
        .context("Failed to insert route")?;
        let route_id = tx.last_insert_rowid();
        for (seq, stop) in stops.iter().enumerate() {
            tx.execute(
                "INSERT INTO route_stops (route_id, stop_id, seq, offset_minutes)
                 VALUES (?1, ?2, ?3, ?4)",
                params![route_id, stop.stop_id, seq as i32, stop.offset_minutes],
            )
            .context("Failed to insert route stop")?;
        }
        tx.commit().context("Failed to commit route insert")?;
        self.get_route_detail(route_id)?
            .context("Route not found after insert")
    }

    pub fn list_routes(&self) -> Result<Vec<Route>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, description, created_at FROM routes ORDER BY id")
            .context("Failed to prepare list_routes")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Route {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query routes")?;
        let mut routes = Vec::new();
        for row in rows {
            routes.push(row.context("Failed to read route row")?);
        }
        Ok(routes)
    }

    pub fn get_route_detail(&self, id: i64) -> Result<Option<RouteDetail>> {
        let route = self
            .conn
            .query_row(
                "SELECT id, name, description, created_at FROM routes WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Route {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query route")?;
        let Some(route) = route else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare(
                "SELECT rs.stop_id, s.name, s.latitude, s.longitude, rs.seq, rs.offset_minutes
                 FROM route_stops rs
                 INNER JOIN stops s ON rs.stop_id = s.id
                 WHERE rs.route_id = ?1
                 ORDER BY rs.seq",
            )
            .context("Failed to prepare route stops query")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(RouteStop {
                    stop_id: row.get(0)?,
                    name: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    seq: row.get(4)?,
                    offset_minutes: row.get(5)?,
                })
            })
            .context("Failed to query route stops")?;
        let mut stops = Vec::new();
        for row in rows {
            stops.push(row.context("Failed to read route stop row")?);
        }

        Ok(Some(RouteDetail {
            id: route.id,
            name: route.name,
            description: route.description,
            created_at: route.created_at,
            stops,
        }))
    }

    /// Full update of a route. When a stop sequence is provided the existing
    /// one is replaced inside the same transaction.
    pub fn update_route(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
        stops: Option<&[RouteStopInput]>,
    ) -> Result<Option<RouteDetail>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        let n = tx
            .execute(
                "UPDATE routes SET name = ?1, description = ?2 WHERE id = ?3",
                params![name, description, id],
            )
            .context("Failed to update route")?;
        if n == 0 {
            return Ok(None);
        }
        if let Some(stops) = stops {
            tx.execute("DELETE FROM route_stops WHERE route_id = ?1", params![id])
                .context("Failed to clear route stops")?;
            for (seq, stop) in stops.iter().enumerate() {
                tx.execute(
                    "INSERT INTO route_stops (route_id, stop_id, seq, offset_minutes)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, stop.stop_id, seq as i32, stop.offset_minutes],
                )
                .context("Failed to insert route stop")?;
            }
        }
        tx.commit().context("Failed to commit route update")?;
        self.get_route_detail(id)
    }

    pub fn delete_route(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM routes WHERE id = ?1", params![id])
            .context("Failed to delete route")?;
        Ok(n > 0)
    }

    // ── Bus CRUD ──────────────────────────────────────────────────────

    pub fn create_bus(&self, bus_no: &str, capacity: i32, status: &BusStatus) -> Result<Bus> {
        self.conn
            .execute(
                "INSERT INTO buses (bus_no, capacity, status) VALUES (?1, ?2, ?3)",
                params![bus_no, capacity, status.as_str()],
            )
            .context("Failed to insert bus")?;
        let id = self.conn.last_insert_rowid();
        self.get_bus(id)?.context("Bus not found after insert")
    }

    pub fn list_buses(&self) -> Result<Vec<Bus>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, bus_no, capacity, status, latitude, longitude, speed_kmh, last_updated
                 FROM buses ORDER BY id",
            )
            .context("Failed to prepare list_buses")?;
        let rows = stmt
            .query_map([], Self::bus_row)
            .context("Failed to query buses")?;
        let mut buses = Vec::new();
        for row in rows {
            buses.push(row.context("Failed to read bus row")?.into_bus()?);
        }
        Ok(buses)
    }

    pub fn get_bus(&self, id: i64) -> Result<Option<Bus>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, bus_no, capacity, status, latitude, longitude, speed_kmh, last_updated
                 FROM buses WHERE id = ?1",
                params![id],
                Self::bus_row,
            )
            .optional()
            .context("Failed to query bus")?;
        match row {
            Some(r) => Ok(Some(r.into_bus()?)),
            None => Ok(None),
        }
    }

    fn bus_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BusRow> {
        Ok(BusRow {
            id: row.get(0)?,
            bus_no: row.get(1)?,
            capacity: row.get(2)?,
            status: row.get(3)?,
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            speed_kmh: row.get(6)?,
            last_updated: row.get(7)?,
        })
    }

    pub fn update_bus(
        &self,
        id: i64,
        bus_no: &str,
        capacity: i32,
        status: &BusStatus,
    ) -> Result<Option<Bus>> {
        let n = self
            .conn
            .execute(
                "UPDATE buses SET bus_no = ?1, capacity = ?2, status = ?3 WHERE id = ?4",
                params![bus_no, capacity, status.as_str(), id],
            )
            .context("Failed to update bus")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_bus(id)
    }

    /// Overwrite a bus's live location in place. Prior coordinates are lost;
    /// the fleet keeps no location history.
    pub fn update_bus_location(
        &self,
        id: i64,
        latitude: f64,
        longitude: f64,
        speed_kmh: Option<f64>,
        recorded_at: &str,
    ) -> Result<Option<Bus>> {
        let n = self
            .conn
            .execute(
                "UPDATE buses
                 SET latitude = ?1, longitude = ?2, speed_kmh = ?3, last_updated = ?4
                 WHERE id = ?5",
                params![latitude, longitude, speed_kmh, recorded_at, id],
            )
            .context("Failed to update bus location")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_bus(id)
    }

    pub fn delete_bus(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM buses WHERE id = ?1", params![id])
            .context("Failed to delete bus")?;
        Ok(n > 0)
    }

    // ── Schedule CRUD ─────────────────────────────────────────────────

    pub fn create_schedule(
        &self,
        route_id: i64,
        bus_id: Option<i64>,
        driver_id: Option<i64>,
        departure_time: &str,
        days_of_week: &str,
    ) -> Result<Schedule> {
        self.conn
            .execute(
                "INSERT INTO schedules (route_id, bus_id, driver_id, departure_time, days_of_week)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![route_id, bus_id, driver_id, departure_time, days_of_week],
            )
            .context("Failed to insert schedule")?;
        let id = self.conn.last_insert_rowid();
        self.get_schedule(id)?
            .context("Schedule not found after insert")
    }

    pub fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, route_id, bus_id, driver_id, departure_time, days_of_week
                 FROM schedules ORDER BY id",
            )
            .context("Failed to prepare list_schedules")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Schedule {
                    id: row.get(0)?,
                    route_id: row.get(1)?,
                    bus_id: row.get(2)?,
                    driver_id: row.get(3)?,
                    departure_time: row.get(4)?,
                    days_of_week: row.get(5)?,
                })
            })
            .context("Failed to query schedules")?;
        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row.context("Failed to read schedule row")?);
        }
        Ok(schedules)
    }

    pub fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        self.conn
            .query_row(
                "SELECT id, route_id, bus_id, driver_id, departure_time, days_of_week
                 FROM schedules WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Schedule {
                        id: row.get(0)?,
                        route_id: row.get(1)?,
                        bus_id: row.get(2)?,
                        driver_id: row.get(3)?,
                        departure_time: row.get(4)?,
                        days_of_week: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query schedule")
    }

    pub fn update_schedule(
        &self,
        id: i64,
        route_id: i64,
        bus_id: Option<i64>,
        driver_id: Option<i64>,
        departure_time: &str,
        days_of_week: &str,
    ) -> Result<Option<Schedule>> {
        let n = self
            .conn
            .execute(
                "UPDATE schedules
                 SET route_id = ?1, bus_id = ?2, driver_id = ?3,
                     departure_time = ?4, days_of_week = ?5
                 WHERE id = ?6",
                params![route_id, bus_id, driver_id, departure_time, days_of_week, id],
            )
            .context("Failed to update schedule")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_schedule(id)
    }

    pub fn delete_schedule(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM schedules WHERE id = ?1", params![id])
            .context("Failed to delete schedule")?;
        Ok(n > 0)
    }

    // ── Trip CRUD ─────────────────────────────────────────────────────

    pub fn create_trip(
        &self,
        route_id: i64,
        bus_id: i64,
        driver_id: i64,
        service_date: &str,
        status: &str,
        stop_times: &[TripStopTimeInput],
    ) -> Result<TripDetail> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to start transaction")?;
        tx.execute(
            "INSERT INTO trips (route_id, bus_id, driver_id, service_date, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![route_id, bus_id, driver_id, service_date, status],
        )
        .context("Failed to insert trip")?;
        let trip_id = tx.last_insert_rowid();
        for (seq, st) in stop_times.iter().enumerate() {
            tx.execute(
                "INSERT INTO trip_stop_times (trip_id, stop_id, seq, expected_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![trip_id, st.stop_id, seq as i32, st.expected_time],
            )
            .context("Failed to insert trip stop time")?;
        }
        tx.commit().context("Failed to commit trip insert")?;
        self.get_trip_detail(trip_id)?
            .context("Trip not found after insert")
    }

    pub fn list_trips(&self) -> Result<Vec<Trip>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, route_id, bus_id, driver_id, service_date, status, created_at
                 FROM trips ORDER BY id",
            )
            .context("Failed to prepare list_trips")?;
        let rows = stmt
            .query_map([], Self::trip_row)
            .context("Failed to query trips")?;
        let mut trips = Vec::new();
        for row in rows {
            trips.push(row.context("Failed to read trip row")?);
        }
        Ok(trips)
    }

    fn trip_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trip> {
        Ok(Trip {
            id: row.get(0)?,
            route_id: row.get(1)?,
            bus_id: row.get(2)?,
            driver_id: row.get(3)?,
            service_date: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    pub fn get_trip(&self, id: i64) -> Result<Option<Trip>> {
        self.conn
            .query_row(
                "SELECT id, route_id, bus_id, driver_id, service_date, status, created_at
                 FROM trips WHERE id = ?1",
                params![id],
                Self::trip_row,
            )
            .optional()
            .context("Failed to query trip")
    }

    pub fn get_trip_detail(&self, id: i64) -> Result<Option<TripDetail>> {
        let Some(trip) = self.get_trip(id)? else {
            return Ok(None);
        };
        let mut stmt = self
            .conn
            .prepare(
                "SELECT stop_id, seq, expected_time FROM trip_stop_times
                 WHERE trip_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare trip stop times query")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(TripStopTime {
                    stop_id: row.get(0)?,
                    seq: row.get(1)?,
                    expected_time: row.get(2)?,
                })
            })
            .context("Failed to query trip stop times")?;
        let mut stop_times = Vec::new();
        for row in rows {
            stop_times.push(row.context("Failed to read trip stop time row")?);
        }
        Ok(Some(TripDetail {
            id: trip.id,
            route_id: trip.route_id,
            bus_id: trip.bus_id,
            driver_id: trip.driver_id,
            service_date: trip.service_date,
            status: trip.status,
            created_at: trip.created_at,
            stop_times,
        }))
    }

    pub fn update_trip(
        &self,
        id: i64,
        route_id: i64,
        bus_id: i64,
        driver_id: i64,
        service_date: &str,
    ) -> Result<Option<Trip>> {
        let n = self
            .conn
            .execute(
                "UPDATE trips SET route_id = ?1, bus_id = ?2, driver_id = ?3, service_date = ?4
                 WHERE id = ?5",
                params![route_id, bus_id, driver_id, service_date, id],
            )
            .context("Failed to update trip")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_trip(id)
    }

    /// Store a trip status verbatim. Transitions are intentionally
    /// unguarded: any non-empty string the API accepts is persisted as-is.
    pub fn update_trip_status(&self, id: i64, status: &str) -> Result<Option<Trip>> {
        let n = self
            .conn
            .execute(
                "UPDATE trips SET status = ?1 WHERE id = ?2",
                params![status, id],
            )
            .context("Failed to update trip status")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_trip(id)
    }

    pub fn delete_trip(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM trips WHERE id = ?1", params![id])
            .context("Failed to delete trip")?;
        Ok(n > 0)
    }

    /// The most recent trip currently `In Progress` for a bus, if any.
    /// Used to pick the relay channel for REST location reports.
    pub fn find_active_trip_for_bus(&self, bus_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM trips WHERE bus_id = ?1 AND status = 'In Progress'
                 ORDER BY id DESC LIMIT 1",
                params![bus_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query active trip")
    }

    // ── Announcements ─────────────────────────────────────────────────

    pub fn create_announcement(
        &self,
        title: &str,
        body: &str,
        created_by: Option<i64>,
    ) -> Result<Announcement> {
        self.conn
            .execute(
                "INSERT INTO announcements (title, body, created_by) VALUES (?1, ?2, ?3)",
                params![title, body, created_by],
            )
            .context("Failed to insert announcement")?;
        let id = self.conn.last_insert_rowid();
        self.get_announcement(id)?
            .context("Announcement not found after insert")
    }

    pub fn list_announcements(&self) -> Result<Vec<Announcement>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, body, created_by, created_at
                 FROM announcements ORDER BY id DESC",
            )
            .context("Failed to prepare list_announcements")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Announcement {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    body: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query announcements")?;
        let mut announcements = Vec::new();
        for row in rows {
            announcements.push(row.context("Failed to read announcement row")?);
        }
        Ok(announcements)
    }

    pub fn get_announcement(&self, id: i64) -> Result<Option<Announcement>> {
        self.conn
            .query_row(
                "SELECT id, title, body, created_by, created_at
                 FROM announcements WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Announcement {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        body: row.get(2)?,
                        created_by: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query announcement")
    }

    pub fn delete_announcement(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM announcements WHERE id = ?1", params![id])
            .context("Failed to delete announcement")?;
        Ok(n > 0)
    }

    // ── Passenger reports ─────────────────────────────────────────────

    pub fn create_report(
        &self,
        category: &str,
        message: &str,
        contact: Option<&str>,
    ) -> Result<PassengerReport> {
        self.conn
            .execute(
                "INSERT INTO passenger_reports (category, message, contact) VALUES (?1, ?2, ?3)",
                params![category, message, contact],
            )
            .context("Failed to insert report")?;
        let id = self.conn.last_insert_rowid();
        self.get_report(id)?
            .context("Report not found after insert")
    }

    pub fn list_reports(&self) -> Result<Vec<PassengerReport>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, category, message, contact, status, created_at
                 FROM passenger_reports ORDER BY id DESC",
            )
            .context("Failed to prepare list_reports")?;
        let rows = stmt
            .query_map([], Self::report_row)
            .context("Failed to query reports")?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(row.context("Failed to read report row")?.into_report()?);
        }
        Ok(reports)
    }

    pub fn get_report(&self, id: i64) -> Result<Option<PassengerReport>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, category, message, contact, status, created_at
                 FROM passenger_reports WHERE id = ?1",
                params![id],
                Self::report_row,
            )
            .optional()
            .context("Failed to query report")?;
        match row {
            Some(r) => Ok(Some(r.into_report()?)),
            None => Ok(None),
        }
    }

    fn report_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportRow> {
        Ok(ReportRow {
            id: row.get(0)?,
            category: row.get(1)?,
            message: row.get(2)?,
            contact: row.get(3)?,
            status: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    pub fn update_report_status(
        &self,
        id: i64,
        status: &ReportStatus,
    ) -> Result<Option<PassengerReport>> {
        let n = self
            .conn
            .execute(
                "UPDATE passenger_reports SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update report status")?;
        if n == 0 {
            return Ok(None);
        }
        self.get_report(id)
    }

    pub fn delete_report(&self, id: i64) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM passenger_reports WHERE id = ?1", params![id])
            .context("Failed to delete report")?;
        Ok(n > 0)
    }
}

// Intermediate rows for tables whose TEXT columns map onto enums.

struct BusRow {
    id: i64,
    bus_no: String,
    capacity: i32,
    status: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    speed_kmh: Option<f64>,
    last_updated: Option<String>,
}

impl BusRow {
    fn into_bus(self) -> Result<Bus> {
        let status = BusStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!("Corrupt bus row {}: {}", self.id, e))?;
        Ok(Bus {
            id: self.id,
            bus_no: self.bus_no,
            capacity: self.capacity,
            status,
            latitude: self.latitude,
            longitude: self.longitude,
            speed_kmh: self.speed_kmh,
            last_updated: self.last_updated,
        })
    }
}

struct ReportRow {
    id: i64,
    category: String,
    message: String,
    contact: Option<String>,
    status: String,
    created_at: String,
}

impl ReportRow {
    fn into_report(self) -> Result<PassengerReport> {
        let status = ReportStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!("Corrupt report row {}: {}", self.id, e))?;
        Ok(PassengerReport {
            id: self.id,
            category: self.category,
            message: self.message,
            contact: self.contact,
            status,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> FleetDb {
        FleetDb::new_in_memory().unwrap()
    }

    fn seed_fleet(db: &FleetDb) -> (i64, i64, i64) {
        let route = db.create_route("42 Crosstown", None, &[]).unwrap();
        let bus = db.create_bus("KA-01-1234", 40, &BusStatus::Active).unwrap();
        let driver = db
            .create_driver("Asha", "+91-900000001", None, "hash")
            .unwrap();
        (route.id, bus.id, driver.id)
    }

    #[test]
    fn stop_crud_round_trip() {
        let db = db();
        let stop = db.create_stop("Central Station", 12.9716, 77.5946).unwrap();
        assert_eq!(db.get_stop(stop.id).unwrap().unwrap().name, "Central Station");

        let updated = db
            .update_stop(stop.id, "Central Stn", 12.97, 77.59)
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "Central Stn");

        assert!(db.delete_stop(stop.id).unwrap());
        assert!(db.get_stop(stop.id).unwrap().is_none());
        assert!(!db.delete_stop(stop.id).unwrap());
    }

    #[test]
    fn route_insert_is_atomic_with_stop_sequence() {
        let db = db();
        let a = db.create_stop("A", 0.0, 0.0).unwrap();
        let b = db.create_stop("B", 1.0, 1.0).unwrap();

        let detail = db
            .create_route(
                "7 Express",
                Some("limited stops"),
                &[
                    RouteStopInput { stop_id: a.id, offset_minutes: 0 },
                    RouteStopInput { stop_id: b.id, offset_minutes: 12 },
                ],
            )
            .unwrap();
        assert_eq!(detail.stops.len(), 2);
        assert_eq!(detail.stops[0].seq, 0);
        assert_eq!(detail.stops[1].offset_minutes, 12);

        // A sequence referencing a missing stop must leave no route row behind.
        let before = db.list_routes().unwrap().len();
        let err = db.create_route(
            "Broken",
            None,
            &[RouteStopInput { stop_id: 9999, offset_minutes: 0 }],
        );
        assert!(err.is_err());
        assert_eq!(db.list_routes().unwrap().len(), before);
    }

    #[test]
    fn update_route_replaces_stop_sequence() {
        let db = db();
        let a = db.create_stop("A", 0.0, 0.0).unwrap();
        let b = db.create_stop("B", 1.0, 1.0).unwrap();
        let detail = db
            .create_route(
                "9 Loop",
                None,
                &[RouteStopInput { stop_id: a.id, offset_minutes: 0 }],
            )
            .unwrap();

        let updated = db
            .update_route(
                detail.id,
                "9 Loop",
                None,
                Some(&[
                    RouteStopInput { stop_id: b.id, offset_minutes: 0 },
                    RouteStopInput { stop_id: a.id, offset_minutes: 20 },
                ]),
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.stops.len(), 2);
        assert_eq!(updated.stops[0].stop_id, b.id);
    }

    #[test]
    fn duplicate_bus_no_is_a_constraint_violation() {
        let db = db();
        db.create_bus("KA-01-1234", 40, &BusStatus::Active).unwrap();
        let err = db
            .create_bus("KA-01-1234", 32, &BusStatus::Active)
            .unwrap_err();
        let is_constraint = err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<rusqlite::Error>(),
                Some(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation
            )
        });
        assert!(is_constraint, "expected constraint violation, got: {err:#}");
    }

    #[test]
    fn location_update_overwrites_in_place() {
        let db = db();
        let bus = db.create_bus("KA-02-0001", 40, &BusStatus::Active).unwrap();
        assert!(bus.latitude.is_none());

        db.update_bus_location(bus.id, 12.90, 77.50, Some(31.0), "2026-08-28T10:00:00Z")
            .unwrap()
            .unwrap();
        let bus = db
            .update_bus_location(bus.id, 12.91, 77.51, Some(28.5), "2026-08-28T10:00:05Z")
            .unwrap()
            .unwrap();
        assert_eq!(bus.latitude, Some(12.91));
        assert_eq!(bus.speed_kmh, Some(28.5));
        assert_eq!(bus.last_updated.as_deref(), Some("2026-08-28T10:00:05Z"));
    }

    #[test]
    fn deleting_bus_referenced_by_trip_fails_and_keeps_row() {
        let db = db();
        let (route_id, bus_id, driver_id) = seed_fleet(&db);
        db.create_trip(route_id, bus_id, driver_id, "2026-08-28", "Scheduled", &[])
            .unwrap();

        assert!(db.delete_bus(bus_id).is_err());
        assert!(db.get_bus(bus_id).unwrap().is_some());
    }

    #[test]
    fn trip_status_is_stored_verbatim() {
        let db = db();
        let (route_id, bus_id, driver_id) = seed_fleet(&db);
        let trip = db
            .create_trip(route_id, bus_id, driver_id, "2026-08-28", "Scheduled", &[])
            .unwrap();

        let trip = db
            .update_trip_status(trip.id, "Delayed By Parade")
            .unwrap()
            .unwrap();
        assert_eq!(trip.status, "Delayed By Parade");
    }

    #[test]
    fn active_trip_lookup_matches_in_progress_only() {
        let db = db();
        let (route_id, bus_id, driver_id) = seed_fleet(&db);
        let trip = db
            .create_trip(route_id, bus_id, driver_id, "2026-08-28", "Scheduled", &[])
            .unwrap();
        assert!(db.find_active_trip_for_bus(bus_id).unwrap().is_none());

        db.update_trip_status(trip.id, "In Progress").unwrap();
        assert_eq!(db.find_active_trip_for_bus(bus_id).unwrap(), Some(trip.id));

        db.update_trip_status(trip.id, "Completed").unwrap();
        assert!(db.find_active_trip_for_bus(bus_id).unwrap().is_none());
    }

    #[test]
    fn trip_detail_orders_stop_times() {
        let db = db();
        let (route_id, bus_id, driver_id) = seed_fleet(&db);
        let a = db.create_stop("A", 0.0, 0.0).unwrap();
        let b = db.create_stop("B", 1.0, 1.0).unwrap();
        let detail = db
            .create_trip(
                route_id,
                bus_id,
                driver_id,
                "2026-08-28",
                "Scheduled",
                &[
                    TripStopTimeInput { stop_id: a.id, expected_time: "08:00".into() },
                    TripStopTimeInput { stop_id: b.id, expected_time: "08:15".into() },
                ],
            )
            .unwrap();
        assert_eq!(detail.stop_times.len(), 2);
        assert_eq!(detail.stop_times[1].expected_time, "08:15");
    }

    #[test]
    fn report_defaults_to_open_and_status_updates() {
        let db = db();
        let report = db
            .create_report("cleanliness", "Seats need cleaning", None)
            .unwrap();
        assert_eq!(report.status, ReportStatus::Open);

        let report = db
            .update_report_status(report.id, &ReportStatus::Resolved)
            .unwrap()
            .unwrap();
        assert_eq!(report.status, ReportStatus::Resolved);
    }

    #[test]
    fn driver_update_keeps_password_when_not_supplied() {
        let db = db();
        let driver = db
            .create_driver("Asha", "+91-900000001", Some("DL-1"), "hash-1")
            .unwrap();
        db.update_driver(driver.id, "Asha K", "+91-900000001", Some("DL-1"), None)
            .unwrap()
            .unwrap();
        let (_, hash) = db
            .get_driver_credentials("+91-900000001")
            .unwrap()
            .unwrap();
        assert_eq!(hash, "hash-1");

        db.update_driver(driver.id, "Asha K", "+91-900000001", Some("DL-1"), Some("hash-2"))
            .unwrap()
            .unwrap();
        let (_, hash) = db
            .get_driver_credentials("+91-900000001")
            .unwrap()
            .unwrap();
        assert_eq!(hash, "hash-2");
    }

    #[tokio::test]
    async fn db_handle_runs_closures_off_the_async_thread() {
        let handle = DbHandle::new(FleetDb::new_in_memory().unwrap());
        let stop = handle
            .call(|db| db.create_stop("Depot", 12.0, 77.0))
            .await
            .unwrap();
        let fetched = handle
            .call(move |db| db.get_stop(stop.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.name, "Depot");
    }
}
