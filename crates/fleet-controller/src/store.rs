//! Retention Engine (C8) and the backing persistence layer for the rest of
//! the data model. Generalizes the teacher's ring-buffer + SQLite
//! (`metrics_store.rs`) pattern into a pooled `rusqlite` store, since the
//! spec requires a connection pool sized to CPU count rather than a single
//! lazily-initialized connection.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fleet_protocol::constants::{DEFAULT_RETENTION_DAYS, RETENTION_BATCH_SIZE};
use fleet_protocol::model::MonitorSample;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub type DbPool = Pool<SqliteConnectionManager>;

pub fn open_pool(path: &Path) -> anyhow::Result<DbPool> {
    let manager = SqliteConnectionManager::file(path);
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let pool = Pool::builder()
        .max_size((2 * cores) as u32)
        .build(manager)?;

    {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
    }
    Ok(pool)
}

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    public_address TEXT NOT NULL DEFAULT '',
    os TEXT NOT NULL DEFAULT '',
    arch TEXT NOT NULL DEFAULT '',
    cpu_cores INTEGER NOT NULL DEFAULT 0,
    memory_total INTEGER NOT NULL DEFAULT 0,
    disk_total INTEGER NOT NULL DEFAULT 0,
    shared_secret TEXT NOT NULL,
    register_token TEXT,
    agent_version TEXT NOT NULL DEFAULT '',
    last_heartbeat_at INTEGER NOT NULL DEFAULT 0,
    owner_id INTEGER,
    tags TEXT NOT NULL DEFAULT '',
    allow_public_view INTEGER NOT NULL DEFAULT 0,
    network_total_in INTEGER NOT NULL DEFAULT 0,
    network_total_out INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS monitor_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL,
    captured_at INTEGER NOT NULL,
    cpu_percent REAL NOT NULL,
    memory_used INTEGER NOT NULL,
    memory_total INTEGER NOT NULL,
    disk_used INTEGER NOT NULL,
    disk_total INTEGER NOT NULL,
    net_in_rate REAL NOT NULL,
    net_out_rate REAL NOT NULL,
    net_in_delta INTEGER NOT NULL,
    net_out_delta INTEGER NOT NULL,
    sample_window_ms INTEGER NOT NULL,
    load_1 REAL NOT NULL,
    load_5 REAL NOT NULL,
    load_15 REAL NOT NULL,
    swap_used INTEGER NOT NULL,
    swap_total INTEGER NOT NULL,
    boot_time INTEGER NOT NULL,
    latency_ms REAL NOT NULL,
    packet_loss_pct REAL NOT NULL,
    process_count INTEGER NOT NULL,
    tcp_conn_count INTEGER NOT NULL,
    udp_conn_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_host_time ON monitor_samples(host_id, captured_at);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    email TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL DEFAULT 'user',
    last_login_at INTEGER
);

CREATE TABLE IF NOT EXISTS alert_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL DEFAULT 0,
    kind TEXT NOT NULL,
    threshold REAL NOT NULL,
    sustain_seconds INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS notification_channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS alert_incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL,
    rule_kind TEXT NOT NULL,
    opened_at INTEGER NOT NULL,
    value_at_open REAL NOT NULL,
    threshold REAL NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at INTEGER,
    notified_channels TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_incidents_open ON alert_incidents(host_id, rule_kind, resolved);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub public_address: String,
    pub os: String,
    pub arch: String,
    pub cpu_cores: i64,
    pub memory_total: i64,
    pub disk_total: i64,
    #[serde(skip_serializing)]
    pub shared_secret: String,
    pub agent_version: String,
    pub last_heartbeat_at: i64,
    pub owner_id: Option<i64>,
    pub tags: String,
    pub allow_public_view: bool,
    pub network_total_in: i64,
    pub network_total_out: i64,
    pub online: bool,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn is_online(last_heartbeat_at: i64, heartbeat_timeout_secs: i64) -> bool {
    now_unix() - last_heartbeat_at <= heartbeat_timeout_secs
}

pub fn create_host(
    pool: &DbPool,
    name: &str,
    owner_id: Option<i64>,
) -> rusqlite::Result<(i64, String)> {
    let shared_secret = uuid::Uuid::new_v4().to_string();
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "INSERT INTO hosts (name, shared_secret, owner_id) VALUES (?1, ?2, ?3)",
        params![name, shared_secret, owner_id],
    )?;
    Ok((conn.last_insert_rowid(), shared_secret))
}

pub fn get_host(pool: &DbPool, id: i64, heartbeat_timeout_secs: i64) -> rusqlite::Result<Option<Host>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut stmt = conn.prepare(
        "SELECT id, name, public_address, os, arch, cpu_cores, memory_total, disk_total,
                shared_secret, agent_version, last_heartbeat_at, owner_id, tags,
                allow_public_view, network_total_in, network_total_out
         FROM hosts WHERE id = ?1",
    )?;
    let host = stmt
        .query_row(params![id], |row| row_to_host(row, heartbeat_timeout_secs))
        .ok();
    Ok(host)
}

pub fn list_hosts(
    pool: &DbPool,
    owner_id: Option<i64>,
    heartbeat_timeout_secs: i64,
) -> rusqlite::Result<Vec<Host>> {
    let conn = pool.get().expect("db pool exhausted");
    let base = "SELECT id, name, public_address, os, arch, cpu_cores, memory_total, disk_total,
                shared_secret, agent_version, last_heartbeat_at, owner_id, tags,
                allow_public_view, network_total_in, network_total_out FROM hosts";
    let mut hosts = Vec::new();
    if let Some(owner) = owner_id {
        let mut stmt = conn.prepare(&format!(
            "{base} WHERE owner_id = ?1 OR allow_public_view = 1"
        ))?;
        let rows = stmt.query_map(params![owner], |row| row_to_host(row, heartbeat_timeout_secs))?;
        for row in rows {
            hosts.push(row?);
        }
    } else {
        let mut stmt = conn.prepare(base)?;
        let rows = stmt.query_map([], |row| row_to_host(row, heartbeat_timeout_secs))?;
        for row in rows {
            hosts.push(row?);
        }
    }
    Ok(hosts)
}

pub fn delete_host(pool: &DbPool, id: i64) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute("DELETE FROM monitor_samples WHERE host_id = ?1", params![id])?;
    conn.execute(
        "DELETE FROM alert_incidents WHERE host_id = ?1",
        params![id],
    )?;
    conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
    Ok(())
}

fn row_to_host(row: &rusqlite::Row, heartbeat_timeout_secs: i64) -> rusqlite::Result<Host> {
    let last_heartbeat_at: i64 = row.get(10)?;
    Ok(Host {
        id: row.get(0)?,
        name: row.get(1)?,
        public_address: row.get(2)?,
        os: row.get(3)?,
        arch: row.get(4)?,
        cpu_cores: row.get(5)?,
        memory_total: row.get(6)?,
        disk_total: row.get(7)?,
        shared_secret: row.get(8)?,
        agent_version: row.get(9)?,
        last_heartbeat_at,
        owner_id: row.get(11)?,
        tags: row.get(12)?,
        allow_public_view: row.get::<_, i64>(13)? != 0,
        network_total_in: row.get(14)?,
        network_total_out: row.get(15)?,
        online: is_online(last_heartbeat_at, heartbeat_timeout_secs),
    })
}

/// Verifies the agent's credential in constant time, matching the teacher's
/// `require_auth` discipline for its own static-token check. Accepts either
/// the host's permanent `shared_secret` or its one-time `register_token`
/// (issued for first provisioning before the permanent secret is rolled
/// out to the agent's config).
pub fn verify_shared_secret(pool: &DbPool, host_id: i64, secret: &str) -> rusqlite::Result<bool> {
    let conn = pool.get().expect("db pool exhausted");
    let stored: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT shared_secret, register_token FROM hosts WHERE id = ?1",
            params![host_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ok();
    Ok(match stored {
        Some((shared_secret, register_token)) => {
            constant_time_eq(shared_secret.as_bytes(), secret.as_bytes())
                || register_token.is_some_and(|t| constant_time_eq(t.as_bytes(), secret.as_bytes()))
        }
        None => false,
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Inserts a sample and, in the same transaction, advances the host's
/// running network totals and `last_heartbeat_at`. Counter accumulation
/// uses the Agent-reported deltas, never raw counters, so a rollback
/// (delta = 0) simply does not advance the totals.
pub fn insert_sample(pool: &DbPool, host_id: i64, sample: &MonitorSample) -> rusqlite::Result<()> {
    let mut conn = pool.get().expect("db pool exhausted");
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO monitor_samples (
            host_id, captured_at, cpu_percent, memory_used, memory_total, disk_used, disk_total,
            net_in_rate, net_out_rate, net_in_delta, net_out_delta, sample_window_ms,
            load_1, load_5, load_15, swap_used, swap_total, boot_time, latency_ms,
            packet_loss_pct, process_count, tcp_conn_count, udp_conn_count
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23)",
        params![
            host_id,
            sample.captured_at,
            sample.cpu_percent,
            sample.memory_used as i64,
            sample.memory_total as i64,
            sample.disk_used as i64,
            sample.disk_total as i64,
            sample.net_in_rate,
            sample.net_out_rate,
            sample.net_in_delta as i64,
            sample.net_out_delta as i64,
            sample.sample_window_ms as i64,
            sample.load_1,
            sample.load_5,
            sample.load_15,
            sample.swap_used as i64,
            sample.swap_total as i64,
            sample.boot_time,
            sample.latency_ms,
            sample.packet_loss_pct,
            sample.process_count as i64,
            sample.tcp_conn_count as i64,
            sample.udp_conn_count as i64,
        ],
    )?;
    tx.execute(
        "UPDATE hosts SET
            network_total_in = network_total_in + ?1,
            network_total_out = network_total_out + ?2,
            last_heartbeat_at = ?3
         WHERE id = ?4",
        params![
            sample.net_in_delta as i64,
            sample.net_out_delta as i64,
            sample.captured_at,
            host_id
        ],
    )?;
    tx.commit()?;
    Ok(())
}

pub fn touch_heartbeat(pool: &DbPool, host_id: i64, agent_version: &str) -> rusqlite::Result<()> {
    let conn = pool.get().expect("db pool exhausted");
    conn.execute(
        "UPDATE hosts SET last_heartbeat_at = ?1, agent_version = ?2 WHERE id = ?3",
        params![now_unix(), agent_version, host_id],
    )?;
    Ok(())
}

pub fn query_samples(
    pool: &DbPool,
    host_id: i64,
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<i64>,
) -> rusqlite::Result<Vec<MonitorSample>> {
    let conn = pool.get().expect("db pool exhausted");
    let mut sql = "SELECT captured_at, cpu_percent, memory_used, memory_total, disk_used,
            disk_total, net_in_rate, net_out_rate, net_in_delta, net_out_delta,
            sample_window_ms, load_1, load_5, load_15, swap_used, swap_total, boot_time,
            latency_ms, packet_loss_pct, process_count, tcp_conn_count, udp_conn_count
         FROM monitor_samples WHERE host_id = ?1"
        .to_string();
    if from.is_some() {
        sql.push_str(" AND captured_at >= ?2");
    }
    if to.is_some() {
        sql.push_str(" AND captured_at <= ?3");
    }
    sql.push_str(" ORDER BY captured_at ASC LIMIT ?4");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![host_id, from.unwrap_or(0), to.unwrap_or(i64::MAX), limit.unwrap_or(1000)],
        row_to_sample,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn row_to_sample(row: &rusqlite::Row) -> rusqlite::Result<MonitorSample> {
    Ok(MonitorSample {
        captured_at: row.get(0)?,
        cpu_percent: row.get(1)?,
        memory_used: row.get::<_, i64>(2)? as u64,
        memory_total: row.get::<_, i64>(3)? as u64,
        disk_used: row.get::<_, i64>(4)? as u64,
        disk_total: row.get::<_, i64>(5)? as u64,
        net_in_rate: row.get(6)?,
        net_out_rate: row.get(7)?,
        net_in_delta: row.get::<_, i64>(8)? as u64,
        net_out_delta: row.get::<_, i64>(9)? as u64,
        sample_window_ms: row.get::<_, i64>(10)? as u64,
        load_1: row.get(11)?,
        load_5: row.get(12)?,
        load_15: row.get(13)?,
        swap_used: row.get::<_, i64>(14)? as u64,
        swap_total: row.get::<_, i64>(15)? as u64,
        boot_time: row.get(16)?,
        latency_ms: row.get(17)?,
        packet_loss_pct: row.get(18)?,
        process_count: row.get::<_, i64>(19)? as u64,
        tcp_conn_count: row.get::<_, i64>(20)? as u64,
        udp_conn_count: row.get::<_, i64>(21)? as u64,
    })
}

/// Background eviction loop: deletes `monitor_samples` rows older than
/// `retention_days`, in batches, to avoid holding a long-lived lock.
pub async fn run_retention_loop(pool: DbPool, retention_days_provider: impl Fn() -> i64) {
    let mut interval = tokio::time::interval(fleet_protocol::constants::RETENTION_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let retention_days = retention_days_provider();
        match evict_expired(&pool, retention_days) {
            Ok(deleted) if deleted > 0 => info!(deleted, retention_days, "evicted expired samples"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention eviction failed"),
        }
    }
}

fn evict_expired(pool: &DbPool, retention_days: i64) -> rusqlite::Result<usize> {
    let cutoff = now_unix() - retention_days * 86_400;
    let conn = pool.get().expect("db pool exhausted");
    let mut total = 0usize;
    loop {
        let deleted = conn.execute(
            "DELETE FROM monitor_samples WHERE id IN (
                SELECT id FROM monitor_samples WHERE captured_at < ?1 LIMIT ?2
            )",
            params![cutoff, RETENTION_BATCH_SIZE as i64],
        )?;
        total += deleted;
        if deleted < RETENTION_BATCH_SIZE {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2_sqlite::SqliteConnectionManager;

    fn mem_pool() -> DbPool {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        pool.get().unwrap().execute_batch(SCHEMA).unwrap();
        pool
    }

    #[test]
    fn delta_accounting_advances_totals_monotonically() {
        let pool = mem_pool();
        let (id, _) = create_host(&pool, "web-1", None).unwrap();

        // Synthetic raw counters [100, 150, 40, 90] -> deltas [0, 50, 0, 50]
        let deltas = [0u64, 50, 0, 50];
        for (i, delta) in deltas.iter().enumerate() {
            let mut sample = MonitorSample::default();
            sample.captured_at = i as i64 * 30;
            sample.net_in_delta = *delta;
            insert_sample(&pool, id, &sample).unwrap();
        }

        let host = get_host(&pool, id, 15).unwrap().unwrap();
        assert_eq!(host.network_total_in, 100);
    }

    #[test]
    fn retention_bound_removes_only_old_rows() {
        let pool = mem_pool();
        let (id, _) = create_host(&pool, "web-1", None).unwrap();

        let old = MonitorSample {
            captured_at: now_unix() - 10 * 86_400,
            ..Default::default()
        };
        let fresh = MonitorSample {
            captured_at: now_unix(),
            ..Default::default()
        };
        insert_sample(&pool, id, &old).unwrap();
        insert_sample(&pool, id, &fresh).unwrap();

        let deleted = evict_expired(&pool, 7).unwrap();
        assert_eq!(deleted, 1);

        let remaining = query_samples(&pool, id, None, None, Some(10)).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].captured_at, fresh.captured_at);
    }

    #[test]
    fn online_derivation_boundary() {
        let now = now_unix();
        assert!(is_online(now - 14, 15));
        assert!(!is_online(now - 16, 15));
    }
}
