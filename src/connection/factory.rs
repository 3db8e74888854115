//! C1 — Connection Factory: `dial(session) -> Connection | error`.
//!
//! Grounded on the teacher's `SharedSshClient::new` connect/handshake/auth
//! sequence and on `other_examples/2c7db84c` (`sftp-pool.rs`)'s explicit
//! `client::connect` + timeout wrapper with password/key auth branches.

use async_ssh2_tokio::client::{AuthMethod, Client};
use log::{debug, warn};
use std::time::Duration;

use super::{Connection, Credential, Session};
use crate::error::ConnectError;

/// Hard cap on the whole dial (TCP connect + handshake + auth), per
/// distilled spec §4.1.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH keepalive: ping every 10s, tolerate up to 3 missed before the
/// transport is considered dead (distilled spec §4.1).
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_MAX_MISSED: usize = 3;

/// Opens a TCP connection, performs the SSH handshake, authenticates, and
/// returns a ready [`Connection`]. All failure paths close any partially
/// opened socket (dropping `Client` on an `Err` path does this).
pub async fn dial(session: &Session, id: String) -> Result<Connection, ConnectError> {
    session.validate()?;

    let auth = match &session.credential {
        Credential::Password(password) => AuthMethod::with_password(password),
        Credential::PrivateKey {
            key_path,
            passphrase,
        } => AuthMethod::with_key_file(key_path, passphrase.as_deref()),
    };

    let config = async_ssh2_tokio::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX_MISSED,
        ..Default::default()
    };

    debug!(
        "dialing session {} ({}:{})",
        session.id, session.host, session.port
    );

    let connect = Client::connect_with_config(
        (session.host.as_str(), session.port),
        &session.username,
        auth,
        session.security.server_check.clone(),
        config,
    );

    let client = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(client)) => client,
        Ok(Err(err)) => {
            warn!(
                "dial failed for session {} ({}:{}): {err}",
                session.id, session.host, session.port
            );
            return Err(classify_connect_error(err));
        }
        Err(_) => {
            warn!(
                "dial timed out after {:?} for session {} ({}:{})",
                CONNECT_TIMEOUT, session.id, session.host, session.port
            );
            return Err(ConnectError::Timeout(format!(
                "connect to {}:{}",
                session.host, session.port
            )));
        }
    };

    debug!("session {} dialed successfully as connection {id}", session.id);
    Ok(Connection::new(id, session.id.clone(), client))
}

fn classify_connect_error(err: async_ssh2_tokio::Error) -> ConnectError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("auth") {
        ConnectError::AuthFailed
    } else if lowered.contains("refused")
        || lowered.contains("unreachable")
        || lowered.contains("resolve")
        || lowered.contains("connection reset")
    {
        ConnectError::Unreachable(message)
    } else {
        ConnectError::Ssh(err)
    }
}
