//! Access event ledger (entries, exits and unknown faces) in SQLite.
//!
//! Timestamps are written as fixed-width UTC RFC 3339 so text order is
//! time order. Reports are per calendar day in the ledger's fixed offset;
//! a day is the half-open UTC range between two local midnights.

use crate::attendance::{AccessKind, LastAccess, PendingAccess};
use crate::store::{open_connection, parse_datetime};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, SecondsFormat, TimeZone, Utc};
use facegate_core::IdentityId;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessEvent {
    pub id: i64,
    pub identity_id: Option<IdentityId>,
    pub name: Option<String>,
    pub kind: AccessKind,
    pub score: f32,
    pub recorded_at: DateTime<Utc>,
}

/// Counts for one day plus ledger-wide totals by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessStats {
    pub day: NaiveDate,
    /// Events of any kind recorded on `day`.
    pub accesses_on_day: u64,
    pub entries: u64,
    pub exits: u64,
    pub unknown: u64,
}

impl AccessStats {
    /// Recognized passages, entries plus exits.
    pub fn permitted(&self) -> u64 {
        self.entries + self.exits
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_event(row: &Row) -> Result<AccessEvent> {
    let identity_id: Option<String> = row.get("identity_id")?;
    let kind: String = row.get("kind")?;
    let score: f64 = row.get("score")?;
    let recorded_at: String = row.get("recorded_at")?;

    Ok(AccessEvent {
        id: row.get("id")?,
        identity_id: identity_id.map(IdentityId::from),
        name: row.get("name")?,
        kind: kind.parse().map_err(|e: String| anyhow!(e))?,
        score: score as f32,
        recorded_at: parse_datetime(&recorded_at, "recorded_at")?,
    })
}

/// Shared by the result sink (writes) and the D-Bus service (reads).
pub struct AccessLedger {
    conn: Mutex<Connection>,
    offset: FixedOffset,
}

impl AccessLedger {
    /// Days are UTC until [`with_offset`](Self::with_offset) says otherwise.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
            offset: Utc.fix(),
        })
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// The current calendar day in the ledger's offset.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.offset).date_naive()
    }

    /// Encoded `[start, end)` bounds covering `from..=to`.
    fn day_range(&self, from: NaiveDate, to: NaiveDate) -> Result<(String, String)> {
        let midnight = |day: NaiveDate| -> Result<String> {
            let local = day
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| self.offset.from_local_datetime(&midnight).single())
                .ok_or_else(|| anyhow!("no local midnight for {day}"))?;
            Ok(timestamp(local.with_timezone(&Utc)))
        };
        let after = to
            .checked_add_days(Days::new(1))
            .ok_or_else(|| anyhow!("date {to} out of range"))?;
        Ok((midnight(from)?, midnight(after)?))
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one event and return its row id.
    pub fn record(&self, event: &PendingAccess) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO access_events (identity_id, name, kind, score, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.identity_id.as_ref().map(IdentityId::as_str),
                event.name,
                event.kind.as_str(),
                f64::from(event.score),
                timestamp(event.at),
            ],
        )
        .context("failed to insert access event")?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent events first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AccessEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, name, kind, score, recorded_at
             FROM access_events
             ORDER BY recorded_at DESC, id DESC
             LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    /// Events between `from` and `to` inclusive (either end open when `None`),
    /// optionally for one identity, newest first.
    pub fn query(
        &self,
        identity: Option<&IdentityId>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AccessEvent>> {
        let start = from.map(|day| self.day_range(day, day)).transpose()?.map(|(start, _)| start);
        let end = to.map(|day| self.day_range(day, day)).transpose()?.map(|(_, end)| end);

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, name, kind, score, recorded_at
             FROM access_events
             WHERE (?1 IS NULL OR identity_id = ?1)
               AND (?2 IS NULL OR recorded_at >= ?2)
               AND (?3 IS NULL OR recorded_at < ?3)
             ORDER BY recorded_at DESC, id DESC",
        )?;
        let mut rows = stmt.query(params![identity.map(IdentityId::as_str), start, end])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    pub fn stats(&self, day: NaiveDate) -> Result<AccessStats> {
        let (start, end) = self.day_range(day, day)?;
        let conn = self.conn();
        let accesses_on_day: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM access_events WHERE recorded_at >= ?1 AND recorded_at < ?2",
                params![start, end],
                |row| row.get(0),
            )
            .context("failed to count accesses for the day")?;

        let mut stats = AccessStats {
            day,
            accesses_on_day: u64::try_from(accesses_on_day).unwrap_or(0),
            entries: 0,
            exits: 0,
            unknown: 0,
        };
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM access_events GROUP BY kind")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let kind: String = row.get(0)?;
            let count = u64::try_from(row.get::<_, i64>(1)?).unwrap_or(0);
            match kind.parse().map_err(|e: String| anyhow!(e))? {
                AccessKind::Entry => stats.entries = count,
                AccessKind::Exit => stats.exits = count,
                AccessKind::Unknown => stats.unknown = count,
            }
        }
        Ok(stats)
    }

    /// Identities whose last entry/exit on `day` is an entry: they came in
    /// and were never seen leaving. Sorted by name.
    pub fn open_entries(&self, day: NaiveDate) -> Result<Vec<AccessEvent>> {
        let (start, end) = self.day_range(day, day)?;
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.identity_id, e.name, e.kind, e.score, e.recorded_at
             FROM access_events e
             WHERE e.kind = 'entry'
               AND e.identity_id IS NOT NULL
               AND e.recorded_at >= ?1 AND e.recorded_at < ?2
               AND NOT EXISTS (
                   SELECT 1 FROM access_events later
                   WHERE later.identity_id = e.identity_id
                     AND later.kind IN ('entry', 'exit')
                     AND later.recorded_at >= ?1 AND later.recorded_at < ?2
                     AND (later.recorded_at > e.recorded_at
                          OR (later.recorded_at = e.recorded_at AND later.id > e.id))
               )
             ORDER BY e.name, e.identity_id",
        )?;
        let mut rows = stmt.query(params![start, end])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    /// Latest entry or exit for `id`, if any.
    pub fn last_for(&self, id: &IdentityId) -> Result<Option<LastAccess>> {
        let conn = self.conn();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT kind, recorded_at FROM access_events
                 WHERE identity_id = ?1 AND kind IN ('entry', 'exit')
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT 1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query last access")?;

        row.map(|(kind, at)| -> Result<LastAccess> {
            Ok(LastAccess {
                kind: kind.parse().map_err(|e: String| anyhow!(e))?,
                at: parse_datetime(&at, "recorded_at")?,
            })
        })
        .transpose()
    }
}
