//! Idle keepalive.
//!
//! Multiplexed connections sitting idle are probed with protocol-level
//! PINGs so a silently dead transport is discovered before a request is
//! scheduled onto it. One task is armed per idle connection and cancelled
//! the moment it is acquired. After [`delay`](KeepalivePolicy::delay) of
//! continuous idleness the task stops probing and leaves the connection
//! acquirable; liveness is then only verified by the next request, which
//! the retry controller covers for idempotent requests.
//!
//! HTTP/2 uses PING frames. HTTP/3 connections rely on QUIC's transport
//! keepalive, configured from the same policy at connection open; no task
//! is armed for them. HTTP/1.1 connections are never pinged.

use std::{sync::Arc, time::Duration, time::Instant};

use log::{debug, trace};

use crate::conn::{CloseReason, Conn, Protocol};

const MIN_IDLE_WINDOW: Duration = Duration::from_secs(1);

/// When and how often idle multiplexed connections are pinged.
#[derive(Clone, Debug)]
pub struct KeepalivePolicy {
    enabled: bool,
    idle_window: Duration,
    delay: Duration,
}

impl KeepalivePolicy {
    /// Disable liveness probing entirely.
    pub fn disabled() -> KeepalivePolicy {
        KeepalivePolicy {
            enabled: false,
            ..KeepalivePolicy::default()
        }
    }

    /// Silence on an idle connection before a PING goes out. Clamped to at
    /// least one second; values of 30 seconds or more are recommended.
    pub fn idle_window(mut self, window: Duration) -> KeepalivePolicy {
        self.idle_window = window.max(MIN_IDLE_WINDOW);
        self
    }

    /// Total idle duration after which probing stops. The connection then
    /// stays acquirable on a best-effort basis.
    pub fn delay(mut self, delay: Duration) -> KeepalivePolicy {
        self.delay = delay;
        self
    }

    /// The QUIC transport keepalive interval derived from this policy.
    pub(crate) fn quic_interval(&self) -> Option<Duration> {
        self.enabled.then_some(self.idle_window)
    }
}

impl Default for KeepalivePolicy {
    fn default() -> KeepalivePolicy {
        KeepalivePolicy {
            enabled: true,
            idle_window: Duration::from_secs(30),
            delay: Duration::from_secs(300),
        }
    }
}

/// Arms the keepalive task for a connection that just became fully idle.
pub(crate) fn arm(policy: &KeepalivePolicy, conn: &Arc<Conn>) {
    if !policy.enabled || conn.protocol() != Protocol::H2 {
        return;
    }

    let weak = Arc::downgrade(conn);
    let window = policy.idle_window;
    let delay = policy.delay;

    let task = tokio::spawn(async move {
        let idle_since = Instant::now();
        loop {
            // Wait out a full window of silence; any traffic restarts it.
            loop {
                let Some(conn) = weak.upgrade() else { return };
                let silence = conn.last_activity().elapsed();
                drop(conn);
                if silence >= window {
                    break;
                }
                tokio::time::sleep(window - silence).await;
            }

            let Some(conn) = weak.upgrade() else { return };

            if idle_since.elapsed() > delay {
                trace!(
                    "conn {} idle past keepalive delay, probing stops",
                    conn.id()
                );
                return;
            }

            trace!("conn {} sending keepalive ping", conn.id());
            match tokio::time::timeout(window, conn.ping()).await {
                Ok(Ok(())) => {
                    // The ACK counts as traffic.
                    conn.touch();
                }
                Ok(Err(e)) => {
                    debug!("conn {} keepalive ping failed: {e}", conn.id());
                    conn.close(CloseReason::PingTimeout);
                    if let Some(pool) = conn.pool() {
                        pool.discard(&conn);
                    }
                    return;
                }
                Err(_elapsed) => {
                    debug!(
                        "conn {} keepalive ping unacknowledged (sent {:?})",
                        conn.id(),
                        conn.last_ping()
                    );
                    conn.close(CloseReason::PingTimeout);
                    if let Some(pool) = conn.pool() {
                        pool.discard(&conn);
                    }
                    return;
                }
            }
        }
    });

    conn.set_keepalive_task(task.abort_handle());
}
