//! Session/Connection data model and the connection factory (C1).
//!
//! A [`Session`] describes a remote endpoint and is immutable once created.
//! A [`Connection`] is a live SSH handle dialed for that session; it is
//! always owned by exactly one of: the dedicated-connection registry, a
//! [`crate::pool::Pool`], or a borrowing task.

mod factory;

pub use factory::dial;

use async_ssh2_tokio::client::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::security::ConnectionSecurityOptions;

/// Credential variant for authenticating a [`Session`].
#[derive(Debug, Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        key_path: String,
        passphrase: Option<String>,
    },
}

/// Describes a remote endpoint. Immutable after creation; referenced by
/// every component that needs to dial or re-dial the same host.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub default_cwd: Option<String>,
    pub security: ConnectionSecurityOptions,
}

impl Session {
    /// Validates the fields required before a dial is attempted.
    ///
    /// Mirrors distilled spec §4.1: host non-empty, port in range,
    /// credential variant populated.
    pub fn validate(&self) -> Result<(), crate::error::ConnectError> {
        if self.host.is_empty() {
            return Err(crate::error::ConnectError::Internal(
                "session host must not be empty".into(),
            ));
        }
        if self.port == 0 {
            return Err(crate::error::ConnectError::Internal(
                "session port must be in [1, 65535]".into(),
            ));
        }
        match &self.credential {
            Credential::Password(p) if p.is_empty() => {
                return Err(crate::error::ConnectError::Internal(
                    "password credential must not be empty".into(),
                ));
            }
            Credential::PrivateKey { key_path, .. } if key_path.is_empty() => {
                return Err(crate::error::ConnectError::Internal(
                    "private key path must not be empty".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

/// A live SSH connection dialed for a [`Session`].
///
/// Owned exclusively by whichever of {dedicated registry, shared pool,
/// transfer pool} created it. `last_used` is updated on every borrow so the
/// pool's 30s probe-skip window (distilled §4.2) can be computed cheaply.
pub struct Connection {
    pub id: String,
    pub session_id: String,
    pub client: Client,
    created_at_ms: u64,
    last_used_ms: AtomicU64,
    ready: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: String, session_id: String, client: Client) -> Self {
        let now = now_ms();
        Self {
            id,
            session_id,
            client,
            created_at_ms: now,
            last_used_ms: AtomicU64::new(now),
            ready: AtomicBool::new(true),
        }
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_dead(&self) {
        self.ready.store(false, Ordering::Relaxed);
    }

    /// Trivial round-trip used by the pool's liveness probe (distilled §4.2).
    pub async fn probe(&self) -> bool {
        match self.client.execute("echo __probe__").await {
            Ok(result) => result.exit_status == 0,
            Err(_) => {
                self.mark_dead();
                false
            }
        }
    }

    pub async fn close(&self) -> Result<(), crate::error::ConnectError> {
        self.client
            .disconnect()
            .await
            .map_err(crate::error::ConnectError::Ssh)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedConnection = Arc<Connection>;
