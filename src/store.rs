use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::alert::{Alert, NewAlert};
use crate::models::device::Device;
use crate::models::job::{Job, JobKind, JobStatus};
use crate::models::parameter::{DataType, Parameter};
use crate::models::rule::{Cooldown, NotificationChannels, Rule, RuleScope, ScheduleType, Severity};
use crate::models::tenant::Tenant;
use crate::models::user::{User, UserRole};
use crate::rules::Metrics;

/// Timestamps are stored as ISO-8601 UTC text, matching the
/// `strftime('%Y-%m-%dT%H:%M:%SZ','now')` column defaults.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn ts_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("bad timestamp: {s}").into(),
        )
    })
}

fn opt_ts_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    Ok(s.as_deref().and_then(parse_ts))
}

/// The relational store: identity, configuration and discrete events.
///
/// A single connection behind a mutex; every query is tenant-filtered —
/// `tenant_id` is the security boundary.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tenants (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                slug       TEXT NOT NULL UNIQUE,
                name       TEXT NOT NULL,
                timezone   TEXT NOT NULL DEFAULT 'UTC',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id       INTEGER NOT NULL REFERENCES tenants(id),
                email           TEXT NOT NULL,
                whatsapp_number TEXT,
                password_hash   TEXT NOT NULL DEFAULT '',
                role            TEXT NOT NULL DEFAULT 'admin' CHECK(role IN ('super_admin','admin')),
                permissions     TEXT NOT NULL DEFAULT '{}',
                is_active       INTEGER NOT NULL DEFAULT 1,
                invite_token    TEXT,
                invited_at      TEXT,
                last_login      TEXT,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(tenant_id, email)
            );

            CREATE TABLE IF NOT EXISTS devices (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id    INTEGER NOT NULL REFERENCES tenants(id),
                device_key   TEXT NOT NULL,
                name         TEXT,
                manufacturer TEXT,
                model        TEXT,
                region       TEXT,
                is_active    INTEGER NOT NULL DEFAULT 1,
                last_seen    TEXT,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(tenant_id, device_key)
            );
            CREATE INDEX IF NOT EXISTS idx_devices_tenant ON devices(tenant_id);

            CREATE TABLE IF NOT EXISTS parameters (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id       INTEGER NOT NULL REFERENCES tenants(id),
                device_id       INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                parameter_key   TEXT NOT NULL,
                display_name    TEXT,
                unit            TEXT,
                data_type       TEXT NOT NULL DEFAULT 'float' CHECK(data_type IN ('float','int','string')),
                is_kpi_selected INTEGER NOT NULL DEFAULT 1,
                discovered_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                UNIQUE(device_id, parameter_key)
            );
            CREATE INDEX IF NOT EXISTS idx_parameters_tenant_device ON parameters(tenant_id, device_id);

            CREATE TABLE IF NOT EXISTS rules (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id             INTEGER NOT NULL REFERENCES tenants(id),
                name                  TEXT NOT NULL,
                description           TEXT,
                scope                 TEXT NOT NULL DEFAULT 'device' CHECK(scope IN ('device','global')),
                conditions            TEXT NOT NULL,
                cooldown_minutes      INTEGER NOT NULL DEFAULT 15,
                is_active             INTEGER NOT NULL DEFAULT 1,
                schedule_type         TEXT NOT NULL DEFAULT 'always' CHECK(schedule_type IN ('always','time_window','date_range')),
                schedule_config       TEXT NOT NULL DEFAULT '{}',
                severity              TEXT NOT NULL DEFAULT 'medium' CHECK(severity IN ('low','medium','high','critical')),
                notification_channels TEXT NOT NULL DEFAULT '{}',
                created_by            INTEGER REFERENCES users(id),
                created_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at            TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_rules_tenant_active ON rules(tenant_id, is_active);

            CREATE TABLE IF NOT EXISTS rule_devices (
                rule_id   INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                device_id INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                PRIMARY KEY (rule_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS rule_cooldowns (
                rule_id        INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                device_id      INTEGER NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
                last_triggered TEXT NOT NULL,
                PRIMARY KEY (rule_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id          INTEGER NOT NULL REFERENCES tenants(id),
                rule_id            INTEGER NOT NULL REFERENCES rules(id),
                device_id          INTEGER NOT NULL REFERENCES devices(id),
                triggered_at       TEXT NOT NULL,
                resolved_at        TEXT,
                severity           TEXT NOT NULL CHECK(severity IN ('low','medium','high','critical')),
                message            TEXT NOT NULL DEFAULT '',
                telemetry_snapshot TEXT NOT NULL DEFAULT '{}',
                notification_sent  INTEGER NOT NULL DEFAULT 0,
                created_at         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant_device_time ON alerts(tenant_id, device_id, triggered_at);
            CREATE INDEX IF NOT EXISTS idx_alerts_tenant_time ON alerts(tenant_id, triggered_at);

            CREATE TABLE IF NOT EXISTS jobs (
                id               TEXT PRIMARY KEY,
                tenant_id        INTEGER NOT NULL REFERENCES tenants(id),
                kind             TEXT NOT NULL CHECK(kind IN ('analytics','report')),
                job_type         TEXT NOT NULL DEFAULT '',
                device_ids       TEXT NOT NULL DEFAULT '[]',
                date_range_start TEXT NOT NULL,
                date_range_end   TEXT NOT NULL,
                status           TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','complete','failed')),
                result_url       TEXT,
                error_message    TEXT,
                started_at       TEXT,
                completed_at     TEXT,
                created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON jobs(tenant_id, status);
            ",
        )?;
        Ok(())
    }

    // ── Tenants ──

    pub fn create_tenant(&self, slug: &str, name: &str, timezone: &str) -> anyhow::Result<Tenant> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO tenants (slug, name, timezone) VALUES (?1, ?2, ?3)",
            params![slug, name, timezone],
        )?;
        drop(conn);
        self.get_tenant_by_slug(slug)?
            .ok_or_else(|| anyhow::anyhow!("failed to read created tenant"))
    }

    pub fn get_tenant_by_slug(&self, slug: &str) -> anyhow::Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, slug, name, timezone, created_at, updated_at FROM tenants WHERE slug = ?1",
        )?;
        let mut rows = stmt.query_map(params![slug], tenant_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_tenant(&self, id: i64) -> anyhow::Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, slug, name, timezone, created_at, updated_at FROM tenants WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], tenant_from_row)?;
        Ok(rows.next().transpose()?)
    }

    // ── Devices ──

    pub fn get_device(&self, tenant_id: i64, device_key: &str) -> anyhow::Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, device_key, name, manufacturer, model, region, is_active, last_seen \
             FROM devices WHERE tenant_id = ?1 AND device_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![tenant_id, device_key], device_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn get_device_by_id(&self, tenant_id: i64, device_id: i64) -> anyhow::Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, device_key, name, manufacturer, model, region, is_active, last_seen \
             FROM devices WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query_map(params![tenant_id, device_id], device_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Insert the device on first sighting; on a lost insert race the
    /// unique index forces one winner and the re-read returns the winning
    /// row. Returns `(device, created)`.
    pub fn get_or_create_device(
        &self,
        tenant_id: i64,
        device_key: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Device, bool)> {
        let created = {
            let conn = self.conn.lock().unwrap();
            let changed = conn.execute(
                "INSERT INTO devices (tenant_id, device_key, is_active, last_seen) \
                 VALUES (?1, ?2, 1, ?3) \
                 ON CONFLICT(tenant_id, device_key) DO NOTHING",
                params![tenant_id, device_key, fmt_ts(now)],
            )?;
            changed > 0
        };
        let device = self
            .get_device(tenant_id, device_key)?
            .ok_or_else(|| anyhow::anyhow!("device vanished after upsert"))?;
        Ok((device, created))
    }

    /// Presence update (fire-and-forget from the caller's point of view).
    pub fn touch_last_seen(
        &self,
        tenant_id: i64,
        device_id: i64,
        ts: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE devices SET last_seen = ?3, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, device_id, fmt_ts(ts)],
        )?;
        Ok(count > 0)
    }

    // ── Parameters ──

    /// Idempotent upsert of one parameter row per metric key. Re-sighting
    /// touches only `updated_at`; user-edited fields (`is_kpi_selected`,
    /// `display_name`, `unit`) are never overwritten. Returns key → is_new.
    pub fn discover_parameters(
        &self,
        tenant_id: i64,
        device_id: i64,
        metrics: &Metrics,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BTreeMap<String, bool>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now_str = fmt_ts(now);
        let mut discovered = BTreeMap::new();

        for (key, value) in metrics {
            let exists: bool = tx
                .prepare("SELECT COUNT(*) > 0 FROM parameters WHERE device_id = ?1 AND parameter_key = ?2")?
                .query_row(params![device_id, key], |row| row.get(0))?;

            tx.execute(
                "INSERT INTO parameters \
                    (tenant_id, device_id, parameter_key, data_type, is_kpi_selected, discovered_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5) \
                 ON CONFLICT(device_id, parameter_key) DO UPDATE SET updated_at = excluded.updated_at",
                params![
                    tenant_id,
                    device_id,
                    key,
                    DataType::of_number(value).as_str(),
                    now_str
                ],
            )?;

            discovered.insert(key.clone(), !exists);
        }

        tx.commit()?;
        Ok(discovered)
    }

    pub fn list_parameters(&self, tenant_id: i64, device_id: i64) -> anyhow::Result<Vec<Parameter>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, device_id, parameter_key, display_name, unit, data_type, \
                    is_kpi_selected, discovered_at, updated_at \
             FROM parameters WHERE tenant_id = ?1 AND device_id = ?2 ORDER BY parameter_key",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, device_id], parameter_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// User-facing toggle; exists so tests can prove discovery never
    /// claws it back.
    pub fn set_kpi_selected(
        &self,
        tenant_id: i64,
        device_id: i64,
        parameter_key: &str,
        selected: bool,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE parameters SET is_kpi_selected = ?4 \
             WHERE tenant_id = ?1 AND device_id = ?2 AND parameter_key = ?3",
            params![tenant_id, device_id, parameter_key, selected],
        )?;
        Ok(count > 0)
    }

    // ── Rules ──

    #[allow(clippy::too_many_arguments)]
    pub fn create_rule(
        &self,
        tenant_id: i64,
        name: &str,
        scope: RuleScope,
        conditions: &serde_json::Value,
        cooldown_minutes: i64,
        schedule_type: ScheduleType,
        schedule_config: &serde_json::Value,
        severity: Severity,
        channels: NotificationChannels,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rules \
                (tenant_id, name, scope, conditions, cooldown_minutes, schedule_type, schedule_config, severity, notification_channels) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tenant_id,
                name,
                scope.as_str(),
                conditions.to_string(),
                cooldown_minutes,
                schedule_type.as_str(),
                schedule_config.to_string(),
                severity.as_str(),
                serde_json::to_string(&channels)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn link_rule_device(&self, rule_id: i64, device_id: i64) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rule_devices (rule_id, device_id) VALUES (?1, ?2) \
             ON CONFLICT(rule_id, device_id) DO NOTHING",
            params![rule_id, device_id],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, tenant_id: i64, rule_id: i64) -> anyhow::Result<Option<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, scope, conditions, cooldown_minutes, \
                    is_active, schedule_type, schedule_config, severity, notification_channels, created_by \
             FROM rules WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query_map(params![tenant_id, rule_id], rule_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Active rules applicable to a device: global rules plus rules linked
    /// through the association table, all tenant-filtered.
    pub fn active_rules_for_device(&self, tenant_id: i64, device_id: i64) -> anyhow::Result<Vec<Rule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, scope, conditions, cooldown_minutes, \
                    is_active, schedule_type, schedule_config, severity, notification_channels, created_by \
             FROM rules \
             WHERE tenant_id = ?1 AND is_active = 1 \
               AND (scope = 'global' OR id IN (SELECT rule_id FROM rule_devices WHERE device_id = ?2)) \
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, device_id], rule_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Cooldowns ──

    pub fn get_cooldown(&self, rule_id: i64, device_id: i64) -> anyhow::Result<Option<Cooldown>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT rule_id, device_id, last_triggered FROM rule_cooldowns \
             WHERE rule_id = ?1 AND device_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![rule_id, device_id], |row| {
            Ok(Cooldown {
                rule_id: row.get(0)?,
                device_id: row.get(1)?,
                last_triggered: ts_col(row, 2)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn upsert_cooldown(
        &self,
        rule_id: i64,
        device_id: i64,
        last_triggered: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO rule_cooldowns (rule_id, device_id, last_triggered) VALUES (?1, ?2, ?3) \
             ON CONFLICT(rule_id, device_id) DO UPDATE SET last_triggered = excluded.last_triggered",
            params![rule_id, device_id, fmt_ts(last_triggered)],
        )?;
        Ok(())
    }

    // ── Alerts ──

    /// Materialize an alert, re-checking the cooldown inside the same
    /// transaction that inserts the row and bumps the cooldown. Under
    /// concurrent deliveries the second caller observes the fresh
    /// `last_triggered` and backs off. Returns the alert id, or `None`
    /// when the cooldown window suppressed it.
    pub fn try_trigger_alert(
        &self,
        alert: &NewAlert,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if cooldown_minutes > 0 {
            let last: Option<String> = tx
                .query_row(
                    "SELECT last_triggered FROM rule_cooldowns WHERE rule_id = ?1 AND device_id = ?2",
                    params![alert.rule_id, alert.device_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(last) = last.as_deref().and_then(parse_ts) {
                if now - last < Duration::minutes(cooldown_minutes) {
                    return Ok(None);
                }
            }
        }

        tx.execute(
            "INSERT INTO alerts \
                (tenant_id, rule_id, device_id, triggered_at, severity, message, telemetry_snapshot, notification_sent) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                alert.tenant_id,
                alert.rule_id,
                alert.device_id,
                fmt_ts(alert.triggered_at),
                alert.severity.as_str(),
                alert.message,
                alert.telemetry_snapshot.to_string(),
            ],
        )?;
        let alert_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO rule_cooldowns (rule_id, device_id, last_triggered) VALUES (?1, ?2, ?3) \
             ON CONFLICT(rule_id, device_id) DO UPDATE SET last_triggered = excluded.last_triggered",
            params![alert.rule_id, alert.device_id, fmt_ts(alert.triggered_at)],
        )?;

        tx.commit()?;
        Ok(Some(alert_id))
    }

    pub fn get_alert(&self, alert_id: i64) -> anyhow::Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, rule_id, device_id, triggered_at, resolved_at, severity, \
                    message, telemetry_snapshot, notification_sent \
             FROM alerts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![alert_id], alert_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_alerts(&self, tenant_id: i64) -> anyhow::Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, rule_id, device_id, triggered_at, resolved_at, severity, \
                    message, telemetry_snapshot, notification_sent \
             FROM alerts WHERE tenant_id = ?1 ORDER BY triggered_at, id",
        )?;
        let rows = stmt
            .query_map(params![tenant_id], alert_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// One-shot false→true transition, after delivery was attempted.
    pub fn mark_notification_sent(&self, alert_id: i64) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE alerts SET notification_sent = 1 WHERE id = ?1 AND notification_sent = 0",
            params![alert_id],
        )?;
        Ok(count > 0)
    }

    /// `resolved_at` is set once; later calls are no-ops.
    pub fn resolve_alert(
        &self,
        tenant_id: i64,
        alert_id: i64,
        resolved_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE alerts SET resolved_at = ?3 \
             WHERE tenant_id = ?1 AND id = ?2 AND resolved_at IS NULL",
            params![tenant_id, alert_id, fmt_ts(resolved_at)],
        )?;
        Ok(count > 0)
    }

    // ── Users ──

    pub fn create_user(
        &self,
        tenant_id: i64,
        email: &str,
        whatsapp_number: Option<&str>,
        role: UserRole,
        is_active: bool,
    ) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (tenant_id, email, whatsapp_number, role, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id, email, whatsapp_number, role.as_str(), is_active],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn active_users(&self, tenant_id: i64) -> anyhow::Result<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, email, whatsapp_number, role, permissions, is_active, \
                    invite_token, invited_at, last_login \
             FROM users WHERE tenant_id = ?1 AND is_active = 1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![tenant_id], user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Jobs ──

    #[allow(clippy::too_many_arguments)]
    pub fn create_job(
        &self,
        id: &str,
        tenant_id: i64,
        kind: JobKind,
        job_type: &str,
        device_ids: &[i64],
        date_range_start: DateTime<Utc>,
        date_range_end: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (id, tenant_id, kind, job_type, device_ids, date_range_start, date_range_end) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                tenant_id,
                kind.as_str(),
                job_type,
                serde_json::to_string(device_ids)?,
                fmt_ts(date_range_start),
                fmt_ts(date_range_end),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, tenant_id: i64, id: &str) -> anyhow::Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, kind, job_type, device_ids, date_range_start, date_range_end, \
                    status, result_url, error_message, started_at, completed_at, created_at \
             FROM jobs WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query_map(params![tenant_id, id], job_from_row)?;
        Ok(rows.next().transpose()?)
    }

    /// pending → running. Re-running an already-running job (redelivery
    /// after worker loss) refreshes `started_at`; terminal states refuse.
    pub fn mark_job_running(&self, id: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2 \
             WHERE id = ?1 AND status IN ('pending','running')",
            params![id, fmt_ts(now)],
        )?;
        Ok(count > 0)
    }

    pub fn mark_job_complete(
        &self,
        id: &str,
        result_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE jobs SET status = 'complete', result_url = ?2, completed_at = ?3 \
             WHERE id = ?1 AND status = 'running'",
            params![id, result_url, fmt_ts(now)],
        )?;
        Ok(count > 0)
    }

    pub fn mark_job_failed(&self, id: &str, error: &str, now: DateTime<Utc>) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?2, completed_at = ?3 \
             WHERE id = ?1 AND status IN ('pending','running')",
            params![id, error, fmt_ts(now)],
        )?;
        Ok(count > 0)
    }

    /// Completed task state is retained 24 h; the worker sweeper calls
    /// this with `now - 24h`.
    pub fn prune_terminal_jobs(&self, older_than: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM jobs WHERE status IN ('complete','failed') AND completed_at < ?1",
            params![fmt_ts(older_than)],
        )?;
        Ok(count)
    }
}

// ── Row mappers ──

fn tenant_from_row(row: &rusqlite::Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        timezone: row.get(3)?,
        created_at: ts_col(row, 4)?,
        updated_at: ts_col(row, 5)?,
    })
}

fn device_from_row(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        device_key: row.get(2)?,
        name: row.get(3)?,
        manufacturer: row.get(4)?,
        model: row.get(5)?,
        region: row.get(6)?,
        is_active: row.get(7)?,
        last_seen: opt_ts_col(row, 8)?,
    })
}

fn parameter_from_row(row: &rusqlite::Row) -> rusqlite::Result<Parameter> {
    let data_type: String = row.get(6)?;
    Ok(Parameter {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        device_id: row.get(2)?,
        parameter_key: row.get(3)?,
        display_name: row.get(4)?,
        unit: row.get(5)?,
        data_type: DataType::parse(&data_type).unwrap_or(DataType::Float),
        is_kpi_selected: row.get(7)?,
        discovered_at: ts_col(row, 8)?,
        updated_at: ts_col(row, 9)?,
    })
}

fn rule_from_row(row: &rusqlite::Row) -> rusqlite::Result<Rule> {
    let scope: String = row.get(4)?;
    let conditions: String = row.get(5)?;
    let schedule_type: String = row.get(8)?;
    let schedule_config: String = row.get(9)?;
    let severity: String = row.get(10)?;
    let channels: String = row.get(11)?;
    Ok(Rule {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        scope: RuleScope::parse(&scope),
        conditions: serde_json::from_str(&conditions).unwrap_or(serde_json::Value::Null),
        cooldown_minutes: row.get(6)?,
        is_active: row.get(7)?,
        schedule_type: ScheduleType::parse(&schedule_type),
        schedule_config: serde_json::from_str(&schedule_config)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        severity: Severity::parse(&severity),
        notification_channels: serde_json::from_str(&channels).unwrap_or_default(),
        created_by: row.get(12)?,
    })
}

fn alert_from_row(row: &rusqlite::Row) -> rusqlite::Result<Alert> {
    let severity: String = row.get(6)?;
    let snapshot: String = row.get(8)?;
    Ok(Alert {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        rule_id: row.get(2)?,
        device_id: row.get(3)?,
        triggered_at: ts_col(row, 4)?,
        resolved_at: opt_ts_col(row, 5)?,
        severity: Severity::parse(&severity),
        message: row.get(7)?,
        telemetry_snapshot: serde_json::from_str(&snapshot)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        notification_sent: row.get(9)?,
    })
}

fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
    let role: String = row.get(4)?;
    let permissions: String = row.get(5)?;
    Ok(User {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        email: row.get(2)?,
        whatsapp_number: row.get(3)?,
        role: UserRole::parse(&role),
        permissions: serde_json::from_str(&permissions)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        is_active: row.get(6)?,
        invite_token: row.get(7)?,
        invited_at: opt_ts_col(row, 8)?,
        last_login: opt_ts_col(row, 9)?,
    })
}

fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let kind: String = row.get(2)?;
    let device_ids: String = row.get(4)?;
    let status: String = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        kind: JobKind::parse(&kind).unwrap_or(JobKind::Analytics),
        job_type: row.get(3)?,
        device_ids: serde_json::from_str(&device_ids).unwrap_or_default(),
        date_range_start: ts_col(row, 5)?,
        date_range_end: ts_col(row, 6)?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        result_url: row.get(8)?,
        error_message: row.get(9)?,
        started_at: opt_ts_col(row, 10)?,
        completed_at: opt_ts_col(row, 11)?,
        created_at: ts_col(row, 12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mem_store() -> Store {
        Store::open(":memory:").unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sample_metrics() -> Metrics {
        let mut m = Metrics::new();
        m.insert("temperature".into(), serde_json::Number::from_f64(45.5).unwrap());
        m.insert("rpm".into(), serde_json::Number::from(1500));
        m
    }

    #[test]
    fn tenant_lookup_by_slug() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC Plant", "UTC").unwrap();
        let found = store.get_tenant_by_slug("vpc").unwrap().unwrap();
        assert_eq!(found.id, tenant.id);
        assert!(store.get_tenant_by_slug("ghost").unwrap().is_none());
    }

    #[test]
    fn device_auto_registration_is_unique() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let now = ts("2024-01-15T10:00:00Z");

        let (first, created) = store.get_or_create_device(tenant.id, "M01", now).unwrap();
        assert!(created);
        assert_eq!(first.last_seen, Some(now));

        let (second, created) = store.get_or_create_device(tenant.id, "M01", now).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn device_lookup_is_tenant_scoped() {
        let store = mem_store();
        let a = store.create_tenant("a", "A", "UTC").unwrap();
        let b = store.create_tenant("b", "B", "UTC").unwrap();
        let now = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(a.id, "M01", now).unwrap();

        assert!(store.get_device(b.id, "M01").unwrap().is_none());
        assert!(store.get_device_by_id(b.id, device.id).unwrap().is_none());
        // Same key under another tenant is a distinct device.
        let (other, created) = store.get_or_create_device(b.id, "M01", now).unwrap();
        assert!(created);
        assert_ne!(device.id, other.id);
    }

    #[test]
    fn parameter_discovery_is_idempotent() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let now = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", now).unwrap();
        let metrics = sample_metrics();

        let first = store
            .discover_parameters(tenant.id, device.id, &metrics, now)
            .unwrap();
        assert!(first.values().all(|new| *new));

        let second = store
            .discover_parameters(tenant.id, device.id, &metrics, ts("2024-01-15T11:00:00Z"))
            .unwrap();
        assert!(second.values().all(|new| !*new));

        let params = store.list_parameters(tenant.id, device.id).unwrap();
        assert_eq!(params.len(), 2);
        let rpm = params.iter().find(|p| p.parameter_key == "rpm").unwrap();
        assert_eq!(rpm.data_type, DataType::Int);
        let temp = params.iter().find(|p| p.parameter_key == "temperature").unwrap();
        assert_eq!(temp.data_type, DataType::Float);
    }

    #[test]
    fn rediscovery_preserves_user_edits() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let now = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", now).unwrap();
        let metrics = sample_metrics();

        store.discover_parameters(tenant.id, device.id, &metrics, now).unwrap();
        store.set_kpi_selected(tenant.id, device.id, "rpm", false).unwrap();

        store
            .discover_parameters(tenant.id, device.id, &metrics, ts("2024-01-15T12:00:00Z"))
            .unwrap();
        let params = store.list_parameters(tenant.id, device.id).unwrap();
        let rpm = params.iter().find(|p| p.parameter_key == "rpm").unwrap();
        assert!(!rpm.is_kpi_selected);
        assert_eq!(rpm.updated_at, ts("2024-01-15T12:00:00Z"));
        assert_eq!(rpm.discovered_at, now);
    }

    #[test]
    fn active_rules_cover_global_and_linked() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let other = store.create_tenant("other", "Other", "UTC").unwrap();
        let now = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", now).unwrap();
        let (stranger, _) = store.get_or_create_device(tenant.id, "M02", now).unwrap();
        let cond = json!({"operator":"AND","conditions":[{"parameter":"v","operator":"gt","value":1}]});

        let linked = store
            .create_rule(tenant.id, "linked", RuleScope::Device, &cond, 15,
                ScheduleType::Always, &json!({}), Severity::High, NotificationChannels::default())
            .unwrap();
        store.link_rule_device(linked, device.id).unwrap();

        let global = store
            .create_rule(tenant.id, "global", RuleScope::Global, &cond, 15,
                ScheduleType::Always, &json!({}), Severity::Low, NotificationChannels::default())
            .unwrap();

        // Same shape under another tenant must stay invisible.
        store
            .create_rule(other.id, "foreign", RuleScope::Global, &cond, 15,
                ScheduleType::Always, &json!({}), Severity::Low, NotificationChannels::default())
            .unwrap();

        let rules = store.active_rules_for_device(tenant.id, device.id).unwrap();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![linked, global]);

        let rules = store.active_rules_for_device(tenant.id, stranger.id).unwrap();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![global]);
    }

    #[test]
    fn trigger_alert_respects_cooldown_window() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let t0 = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", t0).unwrap();
        let cond = json!({"operator":"AND","conditions":[{"parameter":"voltage","operator":"gt","value":100}]});
        let rule = store
            .create_rule(tenant.id, "R", RuleScope::Device, &cond, 5,
                ScheduleType::Always, &json!({}), Severity::High, NotificationChannels::default())
            .unwrap();

        let alert = NewAlert {
            tenant_id: tenant.id,
            rule_id: rule,
            device_id: device.id,
            triggered_at: t0,
            severity: Severity::High,
            message: "[R] voltage (245.5) gt 100".into(),
            telemetry_snapshot: json!({"voltage": 245.5}),
        };

        let first = store.try_trigger_alert(&alert, 5, t0).unwrap();
        assert!(first.is_some());
        let cooldown = store.get_cooldown(rule, device.id).unwrap().unwrap();
        assert_eq!(cooldown.last_triggered, t0);

        // 30 s later: inside the window, suppressed.
        let again = NewAlert { triggered_at: ts("2024-01-15T10:00:30Z"), ..alert.clone() };
        let second = store
            .try_trigger_alert(&again, 5, ts("2024-01-15T10:00:30Z"))
            .unwrap();
        assert!(second.is_none());
        assert_eq!(store.list_alerts(tenant.id).unwrap().len(), 1);

        // Past the window: fires again.
        let later = NewAlert { triggered_at: ts("2024-01-15T10:06:00Z"), ..alert.clone() };
        let third = store
            .try_trigger_alert(&later, 5, ts("2024-01-15T10:06:00Z"))
            .unwrap();
        assert!(third.is_some());

        let alerts = store.list_alerts(tenant.id).unwrap();
        assert_eq!(alerts.len(), 2);
        assert!(alerts[1].triggered_at - alerts[0].triggered_at >= Duration::minutes(5));
    }

    #[test]
    fn zero_cooldown_always_fires() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let t0 = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", t0).unwrap();
        let cond = json!({"operator":"AND","conditions":[{"parameter":"v","operator":"gt","value":1}]});
        let rule = store
            .create_rule(tenant.id, "R", RuleScope::Device, &cond, 0,
                ScheduleType::Always, &json!({}), Severity::Low, NotificationChannels::default())
            .unwrap();
        let alert = NewAlert {
            tenant_id: tenant.id,
            rule_id: rule,
            device_id: device.id,
            triggered_at: t0,
            severity: Severity::Low,
            message: String::new(),
            telemetry_snapshot: json!({}),
        };
        assert!(store.try_trigger_alert(&alert, 0, t0).unwrap().is_some());
        assert!(store.try_trigger_alert(&alert, 0, t0).unwrap().is_some());
        assert_eq!(store.list_alerts(tenant.id).unwrap().len(), 2);
    }

    #[test]
    fn alert_transitions_are_one_shot() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let t0 = ts("2024-01-15T10:00:00Z");
        let (device, _) = store.get_or_create_device(tenant.id, "M01", t0).unwrap();
        let cond = json!({"operator":"AND","conditions":[{"parameter":"v","operator":"gt","value":1}]});
        let rule = store
            .create_rule(tenant.id, "R", RuleScope::Device, &cond, 0,
                ScheduleType::Always, &json!({}), Severity::Low, NotificationChannels::default())
            .unwrap();
        let alert_id = store
            .try_trigger_alert(
                &NewAlert {
                    tenant_id: tenant.id,
                    rule_id: rule,
                    device_id: device.id,
                    triggered_at: t0,
                    severity: Severity::Low,
                    message: String::new(),
                    telemetry_snapshot: json!({}),
                },
                0,
                t0,
            )
            .unwrap()
            .unwrap();

        assert!(store.mark_notification_sent(alert_id).unwrap());
        assert!(!store.mark_notification_sent(alert_id).unwrap());

        assert!(store.resolve_alert(tenant.id, alert_id, t0).unwrap());
        assert!(!store.resolve_alert(tenant.id, alert_id, ts("2024-01-16T00:00:00Z")).unwrap());
        let alert = store.get_alert(alert_id).unwrap().unwrap();
        assert_eq!(alert.resolved_at, Some(t0));
    }

    #[test]
    fn active_users_are_tenant_scoped() {
        let store = mem_store();
        let a = store.create_tenant("a", "A", "UTC").unwrap();
        let b = store.create_tenant("b", "B", "UTC").unwrap();
        store.create_user(a.id, "ops@a.example", Some("+1555000001"), UserRole::Admin, true).unwrap();
        store.create_user(a.id, "off@a.example", None, UserRole::Admin, false).unwrap();
        store.create_user(b.id, "ops@b.example", None, UserRole::SuperAdmin, true).unwrap();

        let users = store.active_users(a.id).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "ops@a.example");
    }

    #[test]
    fn job_transitions_are_monotonic() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let t0 = ts("2024-01-15T10:00:00Z");
        store
            .create_job("job-1", tenant.id, JobKind::Analytics, "anomaly", &[1, 2], t0, t0)
            .unwrap();

        assert_eq!(store.get_job(tenant.id, "job-1").unwrap().unwrap().status, JobStatus::Pending);
        assert!(store.get_job(tenant.id + 1, "job-1").unwrap().is_none());

        assert!(store.mark_job_running("job-1", t0).unwrap());
        assert!(store.mark_job_complete("job-1", Some("1/analytics/job-1.json"), t0).unwrap());
        // Terminal: no going back.
        assert!(!store.mark_job_running("job-1", t0).unwrap());
        assert!(!store.mark_job_failed("job-1", "late", t0).unwrap());

        let job = store.get_job(tenant.id, "job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.result_url.as_deref(), Some("1/analytics/job-1.json"));
    }

    #[test]
    fn terminal_jobs_are_pruned_after_retention() {
        let store = mem_store();
        let tenant = store.create_tenant("vpc", "VPC", "UTC").unwrap();
        let t0 = ts("2024-01-15T10:00:00Z");
        store.create_job("old", tenant.id, JobKind::Report, "daily", &[], t0, t0).unwrap();
        store.mark_job_running("old", t0).unwrap();
        store.mark_job_complete("old", None, t0).unwrap();
        store.create_job("live", tenant.id, JobKind::Report, "daily", &[], t0, t0).unwrap();
        store.mark_job_running("live", t0).unwrap();

        let pruned = store.prune_terminal_jobs(ts("2024-01-16T10:00:01Z")).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.get_job(tenant.id, "old").unwrap().is_none());
        assert!(store.get_job(tenant.id, "live").unwrap().is_some());
    }
}
