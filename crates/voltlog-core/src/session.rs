//! Cloud session: bearer token, its expiry and best-effort time sync.
//!
//! Every outbound payload goes through [`SessionManager::ensure_valid`]
//! first. When the database answers 401 the caller refreshes exactly once
//! with [`SessionManager::refresh`] and retries once.

use alloc::string::String;

use log::{debug, info, warn};

use crate::clock::{Monotonic, WallClock};
use crate::cloud::{AuthGrant, CloudLink, Endpoints, HttpRequest, Method, SIGN_UP_BODY};
use crate::error::AuthError;

/// Status code meaning "stale credential".
pub const UNAUTHORIZED: u16 = 401;

/// A bearer token valid until `expires_at_ms` (uptime milliseconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    expires_at_ms: u64,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        !self.token.is_empty() && now_ms < self.expires_at_ms
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}

pub struct SessionManager {
    session: Option<Session>,
    default_lifetime_secs: u64,
    wall_clock: WallClock,
    /// Set by the first successful authentication; cleared once time is known
    time_sync_pending: bool,
    auth_exchanges: u32,
}

impl SessionManager {
    pub const fn new(default_lifetime_secs: u64) -> Self {
        Self {
            session: None,
            default_lifetime_secs,
            wall_clock: WallClock::new(),
            time_sync_pending: false,
            auth_exchanges: 0,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_valid_at(&self, now_ms: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_valid_at(now_ms))
    }

    pub fn wall_clock(&self) -> &WallClock {
        &self.wall_clock
    }

    /// Number of sign-up exchanges attempted since boot.
    pub fn auth_exchanges(&self) -> u32 {
        self.auth_exchanges
    }

    /// `true` for the rejection that means the token went stale.
    pub const fn is_authorized_rejection(status: u16) -> bool {
        status == UNAUTHORIZED
    }

    /// Returns a usable session, authenticating first when there is none or
    /// it has expired. On failure the previous state is left untouched.
    pub async fn ensure_valid<L, C>(
        &mut self,
        link: &mut L,
        endpoints: &Endpoints<'_>,
        clock: &C,
    ) -> Result<&Session, AuthError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        if !self.is_valid_at(clock.uptime_ms()) {
            debug!("No valid session, authenticating");
            self.authenticate(link, endpoints, clock).await?;
        }
        self.session.as_ref().ok_or(AuthError::Malformed)
    }

    /// Discards the rejected token and authenticates again.
    pub async fn refresh<L, C>(
        &mut self,
        link: &mut L,
        endpoints: &Endpoints<'_>,
        clock: &C,
    ) -> Result<&Session, AuthError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        info!("Session token rejected, re-authenticating");
        self.session = None;
        self.authenticate(link, endpoints, clock).await?;
        self.session.as_ref().ok_or(AuthError::Malformed)
    }

    /// Syncs the wall clock if a sync is still outstanding.
    ///
    /// A failed attempt is logged and retried on a later send; timestamps
    /// fall back to "unsynced" meanwhile.
    pub async fn sync_time<L, C>(&mut self, link: &mut L, clock: &C)
    where
        L: CloudLink,
        C: Monotonic,
    {
        if !self.time_sync_pending {
            return;
        }

        match link.fetch_unix_time_ms().await {
            Ok(unix_ms) => {
                if self.wall_clock.set(unix_ms, clock.uptime_ms()) {
                    self.time_sync_pending = false;
                    info!("Wall clock synchronized");
                }
            }
            Err(e) => warn!("Time sync failed ({:?}), using unsynced timestamps", e),
        }
    }

    async fn authenticate<L, C>(
        &mut self,
        link: &mut L,
        endpoints: &Endpoints<'_>,
        clock: &C,
    ) -> Result<(), AuthError>
    where
        L: CloudLink,
        C: Monotonic,
    {
        self.auth_exchanges += 1;
        let url = endpoints.sign_up();
        let response = link
            .send(HttpRequest::with_body(Method::Post, &url, SIGN_UP_BODY))
            .await
            .map_err(|e| {
                warn!("Sign-up request failed: {:?}", e);
                AuthError::Transport
            })?;

        if !response.is_success() {
            warn!("Sign-up rejected with status {}", response.status);
            return Err(AuthError::Rejected(response.status));
        }

        let grant = AuthGrant::parse(&response.body)?;
        let lifetime_secs = grant.expires_in_secs.unwrap_or(self.default_lifetime_secs);
        let expires_at_ms = clock
            .uptime_ms()
            .saturating_add(lifetime_secs.saturating_mul(1000));

        self.session = Some(Session {
            token: grant.id_token,
            expires_at_ms,
        });
        if !self.wall_clock.is_synced() {
            self.time_sync_pending = true;
        }

        info!("Authenticated, token valid for {} s", lifetime_secs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ScriptedLink, TEST_TIME_MS, cloud_config};
    use embassy_futures::block_on;

    #[test]
    fn test_absent_session_authenticates_once() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(1_000);
        let mut link = ScriptedLink::new();
        link.auth_ok("tok-1");
        let mut manager = SessionManager::new(3600);

        let session = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(session.token(), "tok-1");
        assert_eq!(session.expires_at_ms(), 1_000 + 3_600_000);

        // Still valid: no further exchange
        block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(link.auth_calls(), 1);
        assert_eq!(link.requests[0].body.as_deref(), Some(SIGN_UP_BODY));
    }

    #[test]
    fn test_expired_session_reauthenticates() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        link.respond(200, r#"{"idToken":"short","expiresIn":"10"}"#)
            .auth_ok("fresh");
        let mut manager = SessionManager::new(3600);

        block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        clock.advance(10_000);
        assert!(!manager.is_valid_at(clock.uptime_ms()));

        let session = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(session.token(), "fresh");
        assert_eq!(link.auth_calls(), 2);
    }

    #[test]
    fn test_missing_lifetime_uses_default() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        link.respond(200, r#"{"idToken":"t"}"#);
        let mut manager = SessionManager::new(120);

        let session = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(session.expires_at_ms(), 120_000);
    }

    #[test]
    fn test_huge_lifetime_saturates() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(5_000);
        let mut link = ScriptedLink::new();
        link.respond(200, r#"{"idToken":"t","expiresIn":"18446744073709551615"}"#);
        let mut manager = SessionManager::new(3600);

        let session = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(session.expires_at_ms(), u64::MAX);

        clock.advance(1_000_000_000);
        assert!(manager.is_valid_at(clock.uptime_ms()));
        block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        assert_eq!(link.auth_calls(), 1);
    }

    #[test]
    fn test_failed_exchange_keeps_previous_state() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        link.respond(200, r#"{"idToken":"old","expiresIn":"1"}"#)
            .respond(400, "{}")
            .drop_connection();
        let mut manager = SessionManager::new(3600);

        block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        clock.advance(5_000);

        let err = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap_err();
        assert_eq!(err, AuthError::Rejected(400));
        assert_eq!(manager.session().map(Session::token), Some("old"));

        let err = block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap_err();
        assert_eq!(err, AuthError::Transport);
    }

    #[test]
    fn test_rejection_classification() {
        assert!(SessionManager::is_authorized_rejection(401));
        assert!(!SessionManager::is_authorized_rejection(403));
        assert!(!SessionManager::is_authorized_rejection(500));
    }

    #[test]
    fn test_time_sync_after_first_auth_and_lazy_retry() {
        let config = cloud_config();
        let endpoints = Endpoints::new(&config);
        let clock = ManualClock::at(0);
        let mut link = ScriptedLink::new();
        link.auth_ok("t");
        let mut manager = SessionManager::new(3600);

        // Nothing to sync before the first authentication
        block_on(manager.sync_time(&mut link, &clock));
        assert_eq!(link.time_requests, 0);

        block_on(manager.ensure_valid(&mut link, &endpoints, &clock)).unwrap();
        block_on(manager.sync_time(&mut link, &clock));
        assert_eq!(link.time_requests, 1);
        assert!(!manager.wall_clock().is_synced());

        link.time = Some(TEST_TIME_MS);
        block_on(manager.sync_time(&mut link, &clock));
        assert!(manager.wall_clock().is_synced());

        block_on(manager.sync_time(&mut link, &clock));
        assert_eq!(link.time_requests, 2);
    }
}
