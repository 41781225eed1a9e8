//! Pre-shared token authentication.
//!
//! The client never sends the token itself. It sends a privilege key,
//! `sha256_hex(token || decimal_timestamp)`, together with the timestamp. The
//! server recomputes the key from its own copy of the token and compares in
//! constant time. Timestamps outside the allowed clock skew are rejected, which
//! bounds how long a captured key can be replayed.
//!
//! Logins are always authenticated. Heartbeats and new work connections are
//! authenticated only when the matching [`AuthScope`] is enabled on both ends.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::AuthConfig;
use crate::msg::{self, Login, NewWorkConn, Ping};

/// Extra message types that carry a privilege key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScope {
    Heartbeats,
    NewWorkConns,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("incompatible client version {client} (server is {server})")]
    VersionMismatch { client: String, server: String },

    #[error("timestamp {timestamp} is outside the allowed clock skew of {max_skew_secs}s")]
    ClockSkew { timestamp: i64, max_skew_secs: u64 },

    #[error("authorization failed")]
    InvalidKey,
}

/// Compute the privilege key for `token` at `timestamp`. Lowercase hex.
pub fn privilege_key(token: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Compare a computed privilege key against the one a peer sent.
///
/// Runs over every byte of `expected` even after a mismatch; a length
/// mismatch still counts as a difference.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let padded = provided.iter().copied().chain(std::iter::repeat(0xff));
    let diff = expected
        .iter()
        .zip(padded)
        .fold(u8::from(expected.len() != provided.len()), |acc, (e, p)| acc | (e ^ p));
    diff == 0
}

/// Signs outgoing and verifies incoming authenticated messages.
#[derive(Debug, Clone)]
pub struct Authenticator {
    token: String,
    scopes: Vec<AuthScope>,
    max_skew_secs: u64,
}

impl Authenticator {
    pub fn new(token: impl Into<String>, scopes: Vec<AuthScope>, max_skew_secs: u64) -> Self {
        Self {
            token: token.into(),
            scopes,
            max_skew_secs,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.token.clone(),
            config.additional_scopes.clone(),
            config.max_clock_skew_secs,
        )
    }

    pub fn has_scope(&self, scope: AuthScope) -> bool {
        self.scopes.contains(&scope)
    }

    pub fn sign_login(&self, login: &mut Login) {
        login.timestamp = unix_now();
        login.privilege_key = privilege_key(&self.token, login.timestamp);
    }

    pub fn sign_ping(&self, ping: &mut Ping) {
        if self.has_scope(AuthScope::Heartbeats) {
            ping.timestamp = unix_now();
            ping.privilege_key = privilege_key(&self.token, ping.timestamp);
        }
    }

    pub fn sign_new_work_conn(&self, msg: &mut NewWorkConn) {
        if self.has_scope(AuthScope::NewWorkConns) {
            msg.timestamp = unix_now();
            msg.privilege_key = privilege_key(&self.token, msg.timestamp);
        }
    }

    /// Check version compatibility, clock skew and the privilege key of a login.
    pub fn verify_login(&self, login: &Login, now: i64) -> Result<(), AuthError> {
        if !msg::is_compatible(&login.version) {
            return Err(AuthError::VersionMismatch {
                client: login.version.clone(),
                server: msg::PROTOCOL_VERSION.to_string(),
            });
        }
        self.verify_key(&login.privilege_key, login.timestamp, now)
    }

    pub fn verify_ping(&self, ping: &Ping, now: i64) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::Heartbeats) {
            return Ok(());
        }
        self.verify_key(&ping.privilege_key, ping.timestamp, now)
    }

    pub fn verify_new_work_conn(&self, msg: &NewWorkConn, now: i64) -> Result<(), AuthError> {
        if !self.has_scope(AuthScope::NewWorkConns) {
            return Ok(());
        }
        self.verify_key(&msg.privilege_key, msg.timestamp, now)
    }

    fn verify_key(&self, key: &str, timestamp: i64, now: i64) -> Result<(), AuthError> {
        if self.max_skew_secs > 0 && now.abs_diff(timestamp) > self.max_skew_secs {
            return Err(AuthError::ClockSkew {
                timestamp,
                max_skew_secs: self.max_skew_secs,
            });
        }
        let expected = privilege_key(&self.token, timestamp);
        if !constant_time_eq(expected.as_bytes(), key.as_bytes()) {
            return Err(AuthError::InvalidKey);
        }
        Ok(())
    }
}

/// Lowercase hex, the wire form of privilege keys.
mod hex {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(char::from(DIGITS[usize::from(b >> 4)]));
            out.push(char::from(DIGITS[usize::from(b & 0x0f)]));
        }
        out
    }
}
