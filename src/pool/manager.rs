//! Pool state machine and the public `PoolManager` surface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::{Mutex, Notify, RwLock};

use super::{priority_for, PoolConfig, Role};
use crate::connection::{dial, Connection, Session, SharedConnection};
use crate::error::ConnectError;

/// Skip the liveness probe if a connection was used within this window
/// (distilled spec §4.2).
const VALIDATE_SKIP_WINDOW: Duration = Duration::from_secs(30);

/// Polling granularity while waiting for a pool slot to free up.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct PoolState {
    idle: VecDeque<SharedConnection>,
    borrowed: usize,
}

impl PoolState {
    fn size(&self) -> usize {
        self.idle.len() + self.borrowed
    }
}

/// A bounded multiset of connections for one (session, role) pair.
struct Pool {
    config: PoolConfig,
    state: StdMutex<PoolState>,
    notify: Notify,
}

impl Pool {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(PoolState {
                idle: VecDeque::new(),
                borrowed: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Pop the most-recently-released idle connection (LIFO, maximizes
    /// cache locality of recent connections per distilled §4.2 ordering
    /// note), reserving a borrowed slot for it.
    fn try_take_idle(&self) -> Option<SharedConnection> {
        let mut state = self.state.lock().unwrap();
        let conn = state.idle.pop_back();
        if conn.is_some() {
            state.borrowed += 1;
        }
        conn
    }

    /// Reserve a slot for a brand new connection if the pool has room.
    fn try_reserve_new(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.size() < self.config.max {
            state.borrowed += 1;
            true
        } else {
            false
        }
    }

    /// Release a reserved-but-never-created slot (dial failed).
    fn release_reservation(&self) {
        let mut state = self.state.lock().unwrap();
        state.borrowed = state.borrowed.saturating_sub(1);
        self.notify.notify_waiters();
    }

    /// Return a healthy connection to the idle list.
    fn release(&self, conn: SharedConnection) {
        let mut state = self.state.lock().unwrap();
        state.borrowed = state.borrowed.saturating_sub(1);
        conn.touch();
        state.idle.push_back(conn);
        self.notify.notify_waiters();
    }

    /// Drop a connection that failed validation or health-check instead of
    /// returning it to the idle list.
    fn evict_borrowed(&self) {
        let mut state = self.state.lock().unwrap();
        state.borrowed = state.borrowed.saturating_sub(1);
        self.notify.notify_waiters();
    }

    fn drain(&self) -> Vec<SharedConnection> {
        let mut state = self.state.lock().unwrap();
        state.idle.drain(..).collect()
    }

    fn stats(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.idle.len(), state.borrowed, self.config.max)
    }
}

/// Per-session collection of the three pools named in distilled §4.2.
struct SessionPools {
    session: Session,
    dedicated: RwLock<Option<SharedConnection>>,
    shared: Pool,
    transfer: Pool,
    next_conn_seq: AtomicU64,
}

impl SessionPools {
    fn new(session: Session) -> Self {
        Self {
            session,
            dedicated: RwLock::new(None),
            shared: Pool::new(PoolConfig::shared_default()),
            transfer: Pool::new(PoolConfig::transfer_default()),
            next_conn_seq: AtomicU64::new(0),
        }
    }

    fn next_id(&self, role: Role) -> String {
        let seq = self.next_conn_seq.fetch_add(1, Ordering::Relaxed);
        let tag = match role {
            Role::Terminal => "dedicated",
            Role::Command => "shared",
            Role::Transfer => "transfer",
        };
        format!("{}-{}-{}", self.session.id, tag, seq)
    }
}

/// A connection borrowed from the pool manager. `release` is a no-op for
/// [`Role::Terminal`] handles (the dedicated connection is never returned).
/// For pooled roles the connection is returned automatically when the
/// handle is dropped, so every exit path — including early `?` returns —
/// releases it; this is the hard contract from `SPEC_FULL.md` §9's Open
/// Question decision, enforced structurally rather than by caller
/// discipline.
pub struct PooledHandle {
    conn: Option<SharedConnection>,
    origin: Option<(Arc<SessionPools>, Role)>,
}

impl PooledHandle {
    pub fn connection(&self) -> &SharedConnection {
        self.conn.as_ref().expect("connection handle already released")
    }

    /// Explicitly release back to the pool now instead of waiting for drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let (Some(conn), Some((pools, role))) = (self.conn.take(), self.origin.take()) {
            match role {
                Role::Command => pools.shared.release(conn),
                Role::Transfer => pools.transfer.release(conn),
                Role::Terminal => {}
            }
        }
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Owns every session's pools. Mirrors `SPEC_FULL.md` §9: a single value
/// replacing the teacher's global `Lazy` maps, wired at construction time.
pub struct PoolManager {
    sessions: RwLock<HashMap<String, Arc<SessionPools>>>,
}

impl PoolManager {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a session: creates the dedicated connection synchronously,
    /// then asynchronously pre-creates the transfer-pool minimum. The
    /// shared pool warms lazily (distilled §4.2 "Warm-up").
    pub async fn register_session(&self, session: Session) -> Result<(), ConnectError> {
        let pools = Arc::new(SessionPools::new(session.clone()));
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id.clone(), pools.clone());
        }

        let dedicated_id = pools.next_id(Role::Terminal);
        let conn = dial(&session, dedicated_id).await?;
        *pools.dedicated.write().await = Some(Arc::new(conn));
        debug!("session {} registered, dedicated connection ready", session.id);

        let warm_pools = pools.clone();
        tokio::spawn(async move {
            for _ in 0..warm_pools.transfer.config.min {
                let id = warm_pools.next_id(Role::Transfer);
                if !warm_pools.transfer.try_reserve_new() {
                    break;
                }
                match dial(&warm_pools.session, id).await {
                    Ok(conn) => warm_pools.transfer.release(Arc::new(conn)),
                    Err(err) => {
                        warn!(
                            "transfer pool warm-up dial failed for session {}: {err}",
                            warm_pools.session.id
                        );
                        warm_pools.transfer.release_reservation();
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Drains and clears both pools in parallel, ends the dedicated
    /// connection, and forgets the session.
    pub async fn disconnect_session(&self, session_id: &str) -> Result<(), ConnectError> {
        let pools = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        let Some(pools) = pools else {
            return Err(ConnectError::NotConnected(session_id.to_string()));
        };

        let shared_drain = pools.shared.drain();
        let transfer_drain = pools.transfer.drain();
        let dedicated = pools.dedicated.write().await.take();

        let (shared_res, transfer_res) = tokio::join!(
            close_all(shared_drain),
            close_all(transfer_drain),
        );
        shared_res?;
        transfer_res?;
        if let Some(conn) = dedicated {
            conn.close().await?;
        }
        Ok(())
    }

    /// `getConnection(sessionId, role) -> handle` (distilled §4.2).
    pub async fn get_connection(
        &self,
        session_id: &str,
        role: Role,
    ) -> Result<PooledHandle, ConnectError> {
        let pools = self.session_pools(session_id).await?;

        if role == Role::Terminal {
            let guard = pools.dedicated.read().await;
            if let Some(conn) = guard.as_ref() {
                return Ok(PooledHandle {
                    conn: Some(conn.clone()),
                    origin: None,
                });
            }
            drop(guard);
            let mut write_guard = pools.dedicated.write().await;
            if write_guard.is_none() {
                let id = pools.next_id(Role::Terminal);
                let conn = dial(&pools.session, id).await?;
                *write_guard = Some(Arc::new(conn));
            }
            return Ok(PooledHandle {
                conn: write_guard.clone(),
                origin: None,
            });
        }

        let _priority = priority_for(role);
        let deadline = Instant::now()
            + match role {
                Role::Command => pools.shared.config.acquire_timeout,
                Role::Transfer => pools.transfer.config.acquire_timeout,
                Role::Terminal => unreachable!(),
            };

        loop {
            if let Some(conn) = self.try_acquire_validated(&pools, role).await? {
                return Ok(PooledHandle {
                    conn: Some(conn),
                    origin: Some((pools.clone(), role)),
                });
            }

            if Instant::now() >= deadline {
                return Err(ConnectError::PoolExhausted(session_id.to_string()));
            }
            tokio::select! {
                _ = self.notify_for(&pools, role) => {},
                _ = tokio::time::sleep(ACQUIRE_POLL_INTERVAL) => {},
            }
        }
    }

    /// Verifies socket aliveness for every borrowed/idle connection and
    /// removes dead entries so subsequent acquires recreate them.
    pub async fn health_check(&self) {
        let sessions: Vec<Arc<SessionPools>> = {
            let guard = self.sessions.read().await;
            guard.values().cloned().collect()
        };
        for pools in sessions {
            if let Some(conn) = pools.dedicated.read().await.as_ref() {
                if !conn.probe().await {
                    warn!(
                        "dedicated connection for session {} failed health check",
                        pools.session.id
                    );
                    *pools.dedicated.write().await = None;
                }
            }
            for pool in [&pools.shared, &pools.transfer] {
                let idle = pool.drain();
                let mut survivors = Vec::with_capacity(idle.len());
                for conn in idle {
                    if conn.probe().await {
                        survivors.push(conn);
                    } else {
                        debug!("evicting dead idle connection {}", conn.id);
                    }
                }
                let mut state = pool.state.lock().unwrap();
                state.idle.extend(survivors);
            }
        }
    }

    /// Whether `session_id` has an active registration, without dialing
    /// anything — unlike [`Self::get_connection`], which creates the
    /// dedicated connection lazily if missing.
    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    async fn session_pools(&self, session_id: &str) -> Result<Arc<SessionPools>, ConnectError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| ConnectError::NotConnected(session_id.to_string()))
    }

    async fn notify_for(&self, pools: &Arc<SessionPools>, role: Role) {
        match role {
            Role::Command => pools.shared.notify.notified().await,
            Role::Transfer => pools.transfer.notify.notified().await,
            Role::Terminal => {}
        }
    }

    async fn try_acquire_validated(
        &self,
        pools: &Arc<SessionPools>,
        role: Role,
    ) -> Result<Option<SharedConnection>, ConnectError> {
        let pool = match role {
            Role::Command => &pools.shared,
            Role::Transfer => &pools.transfer,
            Role::Terminal => unreachable!(),
        };

        if let Some(conn) = pool.try_take_idle() {
            let age = crate::connection::now_ms().saturating_sub(conn.last_used_ms());
            let needs_probe = age > VALIDATE_SKIP_WINDOW.as_millis() as u64;
            if !needs_probe || conn.probe().await {
                conn.touch();
                return Ok(Some(conn));
            }
            debug!(
                "evicting connection {} on failed acquire-time probe",
                conn.id
            );
            pool.evict_borrowed();
            // fall through to try creating a fresh one below
        }

        if pool.try_reserve_new() {
            let id = pools.next_id(role);
            match dial(&pools.session, id).await {
                Ok(conn) => return Ok(Some(Arc::new(conn))),
                Err(err) => {
                    pool.release_reservation();
                    return Err(err);
                }
            }
        }

        Ok(None)
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn close_all(conns: Vec<SharedConnection>) -> Result<(), ConnectError> {
    for conn in conns {
        conn.close().await?;
    }
    Ok(())
}
