//! Protocol-wide defaults. Centralized here rather than scattered across
//! call sites, matching the Agent/Controller's shared timing contract in
//! the coordination plane.

use std::time::Duration;

/// Default interval between `heartbeat` messages.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default interval between `monitor.sample` messages.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// A host is considered online iff `now - last_heartbeat_at <= this`.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for a browser-originated request routed through the hub.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for the transport to receive `register_ack` after `register`.
pub const REGISTER_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Connect timeout for the Agent's outbound transport dial.
pub const TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period the writer is given to drain on shutdown before a forced close.
pub const SHUTDOWN_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Reconnect backoff base delay.
pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Reconnect backoff cap.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Default retention window for `MonitorSample` rows.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// How often the retention eviction loop runs.
pub const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Rows deleted per eviction transaction.
pub const RETENTION_BATCH_SIZE: usize = 1000;

/// Bound on a subscriber's outbound queue before it is treated as a slow consumer.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Number of hosts dispatched per upgrade batch.
pub const UPGRADE_BATCH_SIZE: usize = 10;

/// Spacing between upgrade dispatch batches.
pub const UPGRADE_BATCH_SPACING: Duration = Duration::from_millis(100);

/// Idle timeout after which an interactive session is proactively closed.
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Grace period between SIGTERM and SIGKILL when closing a session.
pub const SESSION_KILL_GRACE: Duration = Duration::from_secs(2);

/// Window within which a duplicate `upgrade.apply` request_id returns the cached result.
pub const UPGRADE_IDEMPOTENCE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default TTL for a minted auth token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 3600);

/// Default API port.
pub const DEFAULT_PORT: u16 = 3333;

/// Network-counter discontinuity threshold; an elapsed gap beyond this between
/// two samples is treated as a reset rather than a rate.
pub const COUNTER_DISCONTINUITY_WINDOW: Duration = Duration::from_secs(300);
