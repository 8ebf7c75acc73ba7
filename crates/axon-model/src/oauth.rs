// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token bookkeeping for OAuth-backed backends.
//!
//! The device-code/PKCE handshake itself is out of scope here — this module
//! only consumes a credential bundle already produced by that flow and
//! performs the refresh-before-every-request dance, plus proactive renewal
//! of a secondary gateway-issued exchange token.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// How close to expiry a token is still treated as usable. A 5-minute grace
/// margin keeps a request from starting with a token that expires mid-flight.
const EXPIRY_GRACE: Duration = Duration::minutes(5);

/// Fraction of a token's remaining lifetime at which the exchange-token
/// cache proactively refreshes, rather than waiting for outright expiry.
const EXCHANGE_REFRESH_FRACTION: f64 = 0.8;

/// An OAuth credential bundle: the bearer token used on requests plus
/// whatever is needed to mint a new one.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// True once `expires_at` is within `EXPIRY_GRACE` of now (or already past).
    pub fn is_expired(&self) -> bool {
        Utc::now() + EXPIRY_GRACE >= self.expires_at
    }
}

/// Error raised when a refresh attempt fails. Distinct from a transient
/// provider error: the caller must prompt the user to re-authenticate, not
/// retry the request.
#[derive(Debug, thiserror::Error)]
#[error("re-authenticate: refreshing the OAuth credential failed: {0}")]
pub struct ReauthenticateError(pub String);

/// Performs the actual refresh network call. Implemented per backend (the
/// device-code/PKCE provider that issued the original credential).
#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ReauthenticateError>;
}

/// Ensures every request is preceded by a refresh attempt and surfaces
/// refresh failure as [`ReauthenticateError`] rather than a generic error.
pub struct CredentialManager {
    refresher: Box<dyn OAuthRefresher>,
    current: Mutex<Credential>,
}

impl CredentialManager {
    pub fn new(initial: Credential, refresher: Box<dyn OAuthRefresher>) -> Self {
        Self {
            refresher,
            current: Mutex::new(initial),
        }
    }

    /// Return a valid access token, refreshing first if the cached one is
    /// expired (or about to be).
    pub async fn access_token(&self) -> Result<String, ReauthenticateError> {
        let (needs_refresh, refresh_token) = {
            let cred = self.current.lock().unwrap();
            (cred.is_expired(), cred.refresh_token.clone())
        };
        if !needs_refresh {
            return Ok(self.current.lock().unwrap().access_token.clone());
        }
        let refreshed = self.refresher.refresh(&refresh_token).await?;
        let token = refreshed.access_token.clone();
        *self.current.lock().unwrap() = refreshed;
        Ok(token)
    }
}

/// A secondary, gateway-issued token (e.g. an exchange token minted from the
/// primary OAuth credential) cached in memory and refreshed proactively at
/// `EXCHANGE_REFRESH_FRACTION` of its lifetime rather than waiting for it to
/// expire outright.
pub struct ExchangeTokenCache {
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    token: String,
}

impl ExchangeTokenCache {
    pub fn new(token: String, issued_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            issued_at,
            expires_at,
            token,
        }
    }

    /// True once the token has consumed `EXCHANGE_REFRESH_FRACTION` of its
    /// total lifetime — the point at which a proactive refresh should start,
    /// well before `is_expired` would trigger a blocking reissue.
    pub fn needs_proactive_refresh(&self) -> bool {
        let total = (self.expires_at - self.issued_at).num_milliseconds().max(1) as f64;
        let elapsed = (Utc::now() - self.issued_at).num_milliseconds() as f64;
        elapsed / total >= EXCHANGE_REFRESH_FRACTION
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}
