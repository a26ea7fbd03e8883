use super::{Store, StoreError};
use crate::model::{ActivityLogEntry, Ban, ProjectType, Service, ServiceStatus, User};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// SQLite-backed store. One connection behind a mutex; statements are short.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SERVICE_COLUMNS: &str = "service_id, user_id, port, status, project_type, path, \
     created_at, last_restart, domain, domain_token, domain_verified";

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                user_id          INTEGER PRIMARY KEY,
                is_premium       INTEGER NOT NULL DEFAULT 0,
                deployment_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS services (
                service_id      TEXT PRIMARY KEY,
                user_id         INTEGER NOT NULL,
                port            INTEGER NOT NULL UNIQUE,
                status          TEXT NOT NULL,
                project_type    TEXT NOT NULL,
                path            TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                last_restart    TEXT NOT NULL,
                domain          TEXT,
                domain_token    TEXT,
                domain_verified INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS services_by_user ON services(user_id);
            CREATE INDEX IF NOT EXISTS services_by_status ON services(status);

            CREATE TABLE IF NOT EXISTS bans (
                user_id   INTEGER PRIMARY KEY,
                reason    TEXT NOT NULL,
                banned_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_logs (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id   INTEGER NOT NULL,
                action    TEXT NOT NULL,
                details   TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_services(
        &self,
        filter: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<Service>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SERVICE_COLUMNS} FROM services WHERE {filter} ORDER BY created_at");
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map([param], RawService::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawService::into_service).collect()
    }
}

/// Row as stored; enum and timestamp columns are decoded in a second step so a
/// bad value surfaces as `StoreError::Corrupt` instead of a generic SQL error.
struct RawService {
    id: String,
    user_id: i64,
    port: u16,
    status: String,
    project_type: String,
    path: String,
    created_at: String,
    last_restart: String,
    domain: Option<String>,
    domain_token: Option<String>,
    domain_verified: bool,
}

impl RawService {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            port: row.get(2)?,
            status: row.get(3)?,
            project_type: row.get(4)?,
            path: row.get(5)?,
            created_at: row.get(6)?,
            last_restart: row.get(7)?,
            domain: row.get(8)?,
            domain_token: row.get(9)?,
            domain_verified: row.get(10)?,
        })
    }

    fn into_service(self) -> Result<Service, StoreError> {
        let status = ServiceStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("{}: status {}", self.id, self.status)))?;
        let project_type = ProjectType::parse(&self.project_type).ok_or_else(|| {
            StoreError::Corrupt(format!("{}: project type {}", self.id, self.project_type))
        })?;
        Ok(Service {
            created_at: parse_time(&self.created_at)?,
            last_restart: parse_time(&self.last_restart)?,
            id: self.id,
            user_id: self.user_id,
            port: self.port,
            status,
            project_type,
            path: self.path,
            domain: self.domain,
            domain_token: self.domain_token,
            domain_verified: self.domain_verified,
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {s}: {e}")))
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

impl Store for SqliteStore {
    fn user(&self, user_id: i64) -> Result<User, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id) VALUES (?1)",
            params![user_id],
        )?;
        let user = conn.query_row(
            "SELECT user_id, is_premium, deployment_count FROM users WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(User {
                    id: row.get(0)?,
                    premium: row.get(1)?,
                    deployment_count: row.get(2)?,
                })
            },
        )?;
        Ok(user)
    }

    fn set_premium(&self, user_id: i64, premium: bool) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO users (user_id, is_premium) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET is_premium = excluded.is_premium",
            params![user_id, premium],
        )?;
        Ok(())
    }

    fn adjust_deployment_count(&self, user_id: i64, delta: i64) -> Result<u32, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id) VALUES (?1)",
            params![user_id],
        )?;
        conn.execute(
            "UPDATE users SET deployment_count = MAX(deployment_count + ?2, 0) WHERE user_id = ?1",
            params![user_id, delta],
        )?;
        let count = conn.query_row(
            "SELECT deployment_count FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_service(&self, s: &Service) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let result = conn.execute(
            &format!(
                "INSERT INTO services ({SERVICE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                s.id,
                s.user_id,
                s.port,
                s.status.as_str(),
                s.project_type.as_str(),
                s.path,
                format_time(&s.created_at),
                format_time(&s.last_restart),
                s.domain,
                s.domain_token,
                s.domain_verified,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(s.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn service(&self, service_id: &str) -> Result<Option<Service>, StoreError> {
        let raw = {
            let conn = self.conn()?;
            conn.query_row(
                &format!("SELECT {SERVICE_COLUMNS} FROM services WHERE service_id = ?1"),
                params![service_id],
                RawService::from_row,
            )
            .optional()?
        };
        raw.map(RawService::into_service).transpose()
    }

    fn save_service(&self, s: &Service) -> Result<(), StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE services SET user_id = ?2, port = ?3, status = ?4, project_type = ?5,
                 path = ?6, created_at = ?7, last_restart = ?8, domain = ?9,
                 domain_token = ?10, domain_verified = ?11
             WHERE service_id = ?1",
            params![
                s.id,
                s.user_id,
                s.port,
                s.status.as_str(),
                s.project_type.as_str(),
                s.path,
                format_time(&s.created_at),
                format_time(&s.last_restart),
                s.domain,
                s.domain_token,
                s.domain_verified,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Missing(s.id.clone()));
        }
        Ok(())
    }

    fn delete_service(&self, service_id: &str) -> Result<(), StoreError> {
        self.conn()?.execute(
            "DELETE FROM services WHERE service_id = ?1",
            params![service_id],
        )?;
        Ok(())
    }

    fn services_for_user(&self, user_id: i64) -> Result<Vec<Service>, StoreError> {
        self.query_services("user_id = ?1", &user_id)
    }

    fn services_with_status(&self, status: ServiceStatus) -> Result<Vec<Service>, StoreError> {
        self.query_services("status = ?1", &status.as_str())
    }

    fn assigned_ports(&self) -> Result<HashSet<u16>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT port FROM services")?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ports)
    }

    fn ban(&self, ban: &Ban) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO bans (user_id, reason, banned_at) VALUES (?1, ?2, ?3)",
            params![ban.user_id, ban.reason, format_time(&ban.banned_at)],
        )?;
        Ok(())
    }

    fn ban_for(&self, user_id: i64) -> Result<Option<Ban>, StoreError> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT user_id, reason, banned_at FROM bans WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
        };
        row.map(|(user_id, reason, at)| {
            Ok(Ban {
                user_id,
                reason,
                banned_at: parse_time(&at)?,
            })
        })
        .transpose()
    }

    fn unban(&self, user_id: i64) -> Result<bool, StoreError> {
        let removed = self
            .conn()?
            .execute("DELETE FROM bans WHERE user_id = ?1", params![user_id])?;
        Ok(removed > 0)
    }

    fn log_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO activity_logs (user_id, action, details, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.user_id,
                entry.action,
                entry.details,
                format_time(&entry.timestamp)
            ],
        )?;
        Ok(())
    }

    fn activity_for(&self, user_id: i64) -> Result<Vec<ActivityLogEntry>, StoreError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT user_id, action, details, timestamp FROM activity_logs
                 WHERE user_id = ?1 ORDER BY id",
            )?;
            stmt.query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        rows.into_iter()
            .map(|(user_id, action, details, ts)| {
                Ok(ActivityLogEntry {
                    user_id,
                    action,
                    details,
                    timestamp: parse_time(&ts)?,
                })
            })
            .collect()
    }
}
