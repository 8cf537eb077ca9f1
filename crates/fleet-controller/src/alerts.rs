//! Alert Evaluator (C9): per-host sustain-window threshold tracking, and
//! incident lifecycle management. Generalizes the teacher's
//! `AlertManager::check_threshold` (fixed fire-on-first-breach semantics)
//! to the spec's sustain-over-window requirement — a single spiky sample
//! must not open an incident.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_protocol::model::MonitorSample;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Cpu,
    Memory,
    Disk,
    Network,
    /// Not a threshold rule: `threshold` is instead a bitmask over host
    /// online/offline transitions (1 = notify on up, 2 = on down, 3 = both),
    /// evaluated by [`AlertEvaluator::evaluate_status_transition`] rather
    /// than against a `MonitorSample`.
    Status,
}

impl RuleKind {
    fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Cpu => "cpu",
            RuleKind::Memory => "memory",
            RuleKind::Disk => "disk",
            RuleKind::Network => "network",
            RuleKind::Status => "status",
        }
    }

    fn sample_value(&self, sample: &MonitorSample) -> f64 {
        match self {
            RuleKind::Cpu => sample.cpu_percent,
            RuleKind::Memory => {
                if sample.memory_total == 0 {
                    0.0
                } else {
                    sample.memory_used as f64 / sample.memory_total as f64 * 100.0
                }
            }
            RuleKind::Disk => {
                if sample.disk_total == 0 {
                    0.0
                } else {
                    sample.disk_used as f64 / sample.disk_total as f64 * 100.0
                }
            }
            RuleKind::Network => (sample.net_in_rate + sample.net_out_rate) / (1024.0 * 1024.0),
            RuleKind::Status => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub host_id: i64,
    pub kind: RuleKind,
    pub threshold: f64,
    pub sustain_seconds: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub kind: String,
    pub name: String,
    pub config_json: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertIncident {
    pub id: i64,
    pub host_id: i64,
    pub rule_kind: String,
    pub opened_at: i64,
    pub value_at_open: f64,
    pub threshold: f64,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
}

struct BreachState {
    first_over_at: i64,
    notified: bool,
}

/// Tracks, per `(host_id, rule kind)`, how long a threshold has been
/// continuously breached. A sample that drops back under threshold resets
/// the window immediately — only a *sustained* breach opens an incident.
pub struct AlertEvaluator {
    breach_state: Mutex<HashMap<(i64, &'static str), BreachState>>,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self {
            breach_state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn evaluate(&self, pool: &DbPool, host_id: i64, sample: &MonitorSample) {
        let rules = match list_rules_for_host(pool, host_id) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, host_id, "failed to load alert rules");
                return;
            }
        };

        let now = now_unix();
        for rule in rules.into_iter().filter(|r| r.enabled && r.kind != RuleKind::Status) {
            let value = rule.kind.sample_value(sample);
            let breached = value > rule.threshold;
            let key = (host_id, rule.kind.as_str());
            let mut state = self.breach_state.lock().await;

            if breached {
                let entry = state.entry(key).or_insert(BreachState {
                    first_over_at: now,
                    notified: false,
                });
                let sustained_for = now - entry.first_over_at;
                if sustained_for >= rule.sustain_seconds && !entry.notified {
                    entry.notified = true;
                    drop(state);
                    open_incident(pool, host_id, rule.kind.as_str(), value, rule.threshold, now).await;
                }
            } else if state.remove(&key).is_some() {
                drop(state);
                resolve_incident(pool, host_id, rule.kind.as_str(), now).await;
            }
        }
    }

    /// Evaluates `status` rules against a host online/offline transition,
    /// per §3's bitmask (`threshold` bit 1 = notify on up, bit 2 = on down).
    /// Unlike the threshold rules above, a transition is instantaneous —
    /// there is no sustain window to track.
    pub async fn evaluate_status_transition(&self, pool: &DbPool, host_id: i64, online: bool) {
        let rules = match list_rules_for_host(pool, host_id) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, host_id, "failed to load alert rules");
                return;
            }
        };

        let now = now_unix();
        for rule in rules.into_iter().filter(|r| r.enabled && r.kind == RuleKind::Status) {
            let mask = rule.threshold as i64;
            if online {
                if mask & 0b01 != 0 {
                    resolve_incident(pool, host_id, RuleKind::Status.as_str(), now).await;
                }
            } else if mask & 0b10 != 0 {
                open_incident(pool, host_id, RuleKind::Status.as_str(), 0.0, rule.threshold, now).await;
            }
        }
    }
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn list_rules_for_host(pool: &DbPool, host_id: i64) -> rusqlite::Result<Vec<AlertRule>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut stmt = conn.prepare(
        "SELECT id, host_id, kind, threshold, sustain_seconds, enabled FROM alert_rules
         WHERE host_id = 0 OR host_id = ?1",
    )?;
    let rows = stmt.query_map(params![host_id], |row| {
        let kind_str: String = row.get(2)?;
        Ok(AlertRule {
            id: row.get(0)?,
            host_id: row.get(1)?,
            kind: parse_rule_kind(&kind_str),
            threshold: row.get(3)?,
            sustain_seconds: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn parse_rule_kind(s: &str) -> RuleKind {
    match s {
        "memory" => RuleKind::Memory,
        "disk" => RuleKind::Disk,
        "network" => RuleKind::Network,
        "status" => RuleKind::Status,
        _ => RuleKind::Cpu,
    }
}

/// Opens a new incident, enforcing the invariant that at most one unresolved
/// incident exists per `(host_id, rule_kind)` at a time.
async fn open_incident(pool: &DbPool, host_id: i64, rule_kind: &str, value: f64, threshold: f64, now: i64) {
    let pool = pool.clone();
    let rule_kind = rule_kind.to_string();
    let result = tokio::task::spawn_blocking(move || -> rusqlite::Result<i64> {
        let conn = pool.get().expect("db pool exhausted");
        let already_open: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alert_incidents WHERE host_id = ?1 AND rule_kind = ?2 AND resolved = 0",
            params![host_id, rule_kind],
            |row| row.get(0),
        )?;
        if already_open > 0 {
            return Ok(-1);
        }
        conn.execute(
            "INSERT INTO alert_incidents (host_id, rule_kind, opened_at, value_at_open, threshold, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![host_id, rule_kind, now, value, threshold],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await;

    match result {
        Ok(Ok(id)) if id >= 0 => {
            info!(host_id, rule_kind = %rule_kind, value, threshold, "alert incident opened");
            dispatch_notifications(&pool, host_id, &rule_kind, value, threshold).await;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(error = %e, "failed to open alert incident"),
        Err(e) => warn!(error = %e, "alert incident task panicked"),
    }
}

async fn resolve_incident(pool: &DbPool, host_id: i64, rule_kind: &str, now: i64) {
    let pool = pool.clone();
    let rule_kind = rule_kind.to_string();
    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get().expect("db pool exhausted");
        conn.execute(
            "UPDATE alert_incidents SET resolved = 1, resolved_at = ?1
             WHERE host_id = ?2 AND rule_kind = ?3 AND resolved = 0",
            params![now, host_id, rule_kind],
        )
    })
    .await;
    if let Ok(Ok(rows)) = result {
        if rows > 0 {
            info!(host_id, rule_kind = %rule_kind, "alert incident resolved");
        }
    }
}

/// Dispatches to every enabled notification channel. Only `webhook` is
/// actually delivered (via HTTP POST with retry); other channel kinds are
/// accepted by the API but logged as not-yet-deliverable, matching the
/// teacher's fire-and-forget `dispatch_webhook` shape with retry added on
/// top since the spec requires it.
async fn dispatch_notifications(pool: &DbPool, host_id: i64, rule_kind: &str, value: f64, threshold: f64) {
    let channels = match list_enabled_channels(pool) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to load notification channels");
            return;
        }
    };

    let body = serde_json::json!({
        "host_id": host_id,
        "rule_kind": rule_kind,
        "value": value,
        "threshold": threshold,
    });

    for channel in channels {
        match channel.kind.as_str() {
            "webhook" => {
                if let Some(url) = channel_webhook_url(&channel) {
                    tokio::spawn(deliver_webhook(url, body.clone()));
                }
            }
            other => {
                warn!(kind = other, channel = %channel.name, "notification channel kind not implemented");
            }
        }
    }
}

fn channel_webhook_url(channel: &NotificationChannel) -> Option<String> {
    let config: serde_json::Value = serde_json::from_str(&channel.config_json).ok()?;
    config.get("url")?.as_str().map(String::from)
}

fn list_enabled_channels(pool: &DbPool) -> rusqlite::Result<Vec<NotificationChannel>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut stmt = conn.prepare(
        "SELECT id, kind, name, config_json, enabled FROM notification_channels WHERE enabled = 1",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(NotificationChannel {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            config_json: row.get(3)?,
            enabled: row.get::<_, i64>(4)? != 0,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Delivers a webhook with up to 3 attempts and exponential backoff capped
/// at 30s, reusing the protocol's jittered backoff helper.
async fn deliver_webhook(url: String, body: serde_json::Value) {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build();
    let client = match client {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build webhook client");
            return;
        }
    };

    let mut backoff = fleet_protocol::Backoff::new(
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(30),
    )
    .with_max_attempts(3);

    loop {
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(url = %url, status = %resp.status(), "webhook delivered");
                return;
            }
            Ok(resp) => warn!(url = %url, status = %resp.status(), "webhook returned non-success status"),
            Err(e) => warn!(url = %url, error = %e, "webhook delivery failed"),
        }
        match backoff.next_delay() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                warn!(url = %url, "webhook delivery exhausted retries");
                return;
            }
        }
    }
}

pub fn create_rule(pool: &DbPool, host_id: i64, kind: RuleKind, threshold: f64, sustain_seconds: i64) -> rusqlite::Result<i64> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "INSERT INTO alert_rules (host_id, kind, threshold, sustain_seconds, enabled) VALUES (?1, ?2, ?3, ?4, 1)",
        params![host_id, kind.as_str(), threshold, sustain_seconds],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_rules(pool: &DbPool) -> rusqlite::Result<Vec<AlertRule>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut stmt = conn.prepare("SELECT id, host_id, kind, threshold, sustain_seconds, enabled FROM alert_rules")?;
    let rows = stmt.query_map([], |row| {
        let kind_str: String = row.get(2)?;
        Ok(AlertRule {
            id: row.get(0)?,
            host_id: row.get(1)?,
            kind: parse_rule_kind(&kind_str),
            threshold: row.get(3)?,
            sustain_seconds: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn update_rule(pool: &DbPool, id: i64, threshold: f64, sustain_seconds: i64, enabled: bool) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "UPDATE alert_rules SET threshold = ?1, sustain_seconds = ?2, enabled = ?3 WHERE id = ?4",
        params![threshold, sustain_seconds, enabled as i64, id],
    )?;
    Ok(())
}

pub fn delete_rule(pool: &DbPool, id: i64) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn create_channel(pool: &DbPool, kind: &str, name: &str, config_json: &str) -> rusqlite::Result<i64> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "INSERT INTO notification_channels (kind, name, config_json, enabled) VALUES (?1, ?2, ?3, 1)",
        params![kind, name, config_json],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_channels(pool: &DbPool) -> rusqlite::Result<Vec<NotificationChannel>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut stmt = conn.prepare("SELECT id, kind, name, config_json, enabled FROM notification_channels")?;
    let rows = stmt.query_map([], |row| {
        Ok(NotificationChannel {
            id: row.get(0)?,
            kind: row.get(1)?,
            name: row.get(2)?,
            config_json: row.get(3)?,
            enabled: row.get::<_, i64>(4)? != 0,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn update_channel(pool: &DbPool, id: i64, name: &str, config_json: &str, enabled: bool) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "UPDATE notification_channels SET name = ?1, config_json = ?2, enabled = ?3 WHERE id = ?4",
        params![name, config_json, enabled as i64, id],
    )?;
    Ok(())
}

pub fn delete_channel(pool: &DbPool, id: i64) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute("DELETE FROM notification_channels WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn list_incidents(pool: &DbPool, resolved: Option<bool>) -> rusqlite::Result<Vec<AlertIncident>> {
    let conn = pool.get().expect("db pool exhausted");
    let sql = match resolved {
        Some(true) => "SELECT id, host_id, rule_kind, opened_at, value_at_open, threshold, resolved, resolved_at FROM alert_incidents WHERE resolved = 1 ORDER BY opened_at DESC",
        Some(false) => "SELECT id, host_id, rule_kind, opened_at, value_at_open, threshold, resolved, resolved_at FROM alert_incidents WHERE resolved = 0 ORDER BY opened_at DESC",
        None => "SELECT id, host_id, rule_kind, opened_at, value_at_open, threshold, resolved, resolved_at FROM alert_incidents ORDER BY opened_at DESC",
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(AlertIncident {
            id: row.get(0)?,
            host_id: row.get(1)?,
            rule_kind: row.get(2)?,
            opened_at: row.get(3)?,
            value_at_open: row.get(4)?,
            threshold: row.get(5)?,
            resolved: row.get::<_, i64>(6)? != 0,
            resolved_at: row.get(7)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2::Pool;
    use r2d2_sqlite::SqliteConnectionManager;

    fn mem_pool() -> DbPool {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        pool.get().unwrap().execute_batch(crate::store::SCHEMA).unwrap();
        pool
    }

    #[tokio::test]
    async fn incident_opens_only_after_sustain_window() {
        let pool = mem_pool();
        create_rule(&pool, 1, RuleKind::Cpu, 90.0, 60).unwrap();
        let evaluator = AlertEvaluator::new();

        let mut sample = MonitorSample::default();
        sample.cpu_percent = 95.0;
        evaluator.evaluate(&pool, 1, &sample).await;

        let open = list_incidents(&pool, Some(false)).unwrap();
        assert!(open.is_empty(), "a single breach should not open an incident yet");
    }

    #[tokio::test]
    async fn at_most_one_unresolved_incident_per_host_and_kind() {
        let pool = mem_pool();
        create_rule(&pool, 1, RuleKind::Cpu, 10.0, 0).unwrap();
        let evaluator = AlertEvaluator::new();

        let mut sample = MonitorSample::default();
        sample.cpu_percent = 99.0;
        evaluator.evaluate(&pool, 1, &sample).await;
        evaluator.evaluate(&pool, 1, &sample).await;

        let open = list_incidents(&pool, Some(false)).unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn drop_below_threshold_resolves_incident() {
        let pool = mem_pool();
        create_rule(&pool, 1, RuleKind::Cpu, 10.0, 0).unwrap();
        let evaluator = AlertEvaluator::new();

        let mut over = MonitorSample::default();
        over.cpu_percent = 99.0;
        evaluator.evaluate(&pool, 1, &over).await;

        let mut under = MonitorSample::default();
        under.cpu_percent = 1.0;
        evaluator.evaluate(&pool, 1, &under).await;

        let open = list_incidents(&pool, Some(false)).unwrap();
        assert!(open.is_empty());
        let resolved = list_incidents(&pool, Some(true)).unwrap();
        assert_eq!(resolved.len(), 1);
    }
}
