//! Session ownership of one device
//!
//! A device is either free or held by exactly one account. The holder proves
//! ownership with the session key it got from [`Session::open`] and keeps the
//! session alive with heartbeats.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Why a session request was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionError {
    #[error("session already in use by this account")]
    AlreadyInUseByThisAccount,
    #[error("session already in use by another account")]
    AlreadyInUseByAnotherAccount,
    #[error("session not in use")]
    NotInUse,
    #[error("session not in use by this account")]
    NotOwner,
    #[error("session key {given} does not match the active session")]
    WrongSessionKey { actual: Uuid, given: Uuid },
    #[error("device not found {0}")]
    DeviceNotFound(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    #[default]
    Free,
    InUse,
}

/// How a session ended, delivered to the holder of the [`SessionTicket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCompletion {
    /// Closed by its owner or an administrator
    Closed,
    /// No heartbeat arrived within the session timeout
    TimedOut,
}

/// Session fields as reported in device snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub kind: SessionKind,
    pub session_key: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub timeout: Duration,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Returned by a successful open
#[derive(Debug)]
pub struct SessionTicket {
    pub session_key: Uuid,
    /// Resolves once the session is closed or times out
    pub completion: oneshot::Receiver<SessionCompletion>,
}

#[derive(Debug, Default)]
pub(crate) struct Session {
    state: SessionState,
    heartbeat_at: Option<Instant>,
    completion: Option<oneshot::Sender<SessionCompletion>>,
}

impl Session {
    pub(crate) fn state(&self) -> &SessionState {
        &self.state
    }

    pub(crate) fn open(
        &mut self,
        account_id: Uuid,
        timeout: Duration,
    ) -> Result<SessionTicket, SessionError> {
        if self.state.kind == SessionKind::InUse {
            return Err(if self.state.account_id == Some(account_id) {
                SessionError::AlreadyInUseByThisAccount
            } else {
                SessionError::AlreadyInUseByAnotherAccount
            });
        }

        let session_key = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.state = SessionState {
            kind: SessionKind::InUse,
            session_key: Some(session_key),
            account_id: Some(account_id),
            last_heartbeat: Some(Utc::now()),
            timeout,
            metadata: serde_json::Map::new(),
        };
        self.heartbeat_at = Some(Instant::now());
        self.completion = Some(tx);

        Ok(SessionTicket {
            session_key,
            completion: rx,
        })
    }

    fn check_owner(&self, account_id: Uuid, session_key: Uuid) -> Result<(), SessionError> {
        if self.state.kind != SessionKind::InUse {
            return Err(SessionError::NotInUse);
        }
        if self.state.account_id != Some(account_id) {
            return Err(SessionError::NotOwner);
        }
        match self.state.session_key {
            Some(actual) if actual == session_key => Ok(()),
            actual => Err(SessionError::WrongSessionKey {
                actual: actual.unwrap_or_default(),
                given: session_key,
            }),
        }
    }

    pub(crate) fn heartbeat(
        &mut self,
        account_id: Uuid,
        session_key: Uuid,
    ) -> Result<(), SessionError> {
        self.check_owner(account_id, session_key)?;
        self.state.last_heartbeat = Some(Utc::now());
        self.heartbeat_at = Some(Instant::now());
        Ok(())
    }

    /// Ends the session. `admin_override` skips the ownership check.
    pub(crate) fn close(
        &mut self,
        account_id: Uuid,
        session_key: Uuid,
        admin_override: bool,
    ) -> Result<(), SessionError> {
        if self.state.kind != SessionKind::InUse {
            return Err(SessionError::NotInUse);
        }
        if !admin_override {
            self.check_owner(account_id, session_key)?;
        }
        self.finish(SessionCompletion::Closed);
        Ok(())
    }

    /// Closes the session if its last heartbeat is older than the timeout
    pub(crate) fn expire(&mut self, now: Instant) -> bool {
        if self.state.kind != SessionKind::InUse {
            return false;
        }
        let Some(at) = self.heartbeat_at else {
            return false;
        };
        // a deadline past what Instant can hold never comes
        match at.checked_add(self.state.timeout) {
            Some(deadline) if now > deadline => {}
            _ => return false,
        }
        info!(
            "Session timeout for session {:?} account {:?}",
            self.state.session_key, self.state.account_id
        );
        self.finish(SessionCompletion::TimedOut);
        true
    }

    fn finish(&mut self, completion: SessionCompletion) {
        if let Some(tx) = self.completion.take()
            && tx.send(completion).is_err()
        {
            debug!("Session owner stopped waiting for completion");
        }
        self.state.kind = SessionKind::Free;
        self.state.session_key = None;
        self.state.account_id = None;
        self.heartbeat_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_heartbeat_close() {
        let account = Uuid::new_v4();
        let mut session = Session::default();

        let ticket = session.open(account, Duration::from_secs(1)).unwrap();
        assert_eq!(session.state().kind, SessionKind::InUse);
        assert_eq!(session.state().session_key, Some(ticket.session_key));

        session.heartbeat(account, ticket.session_key).unwrap();
        assert_eq!(session.state().kind, SessionKind::InUse);

        assert_eq!(
            session.open(account, Duration::from_secs(1)).unwrap_err(),
            SessionError::AlreadyInUseByThisAccount
        );
        assert_eq!(
            session
                .open(Uuid::new_v4(), Duration::from_secs(1))
                .unwrap_err(),
            SessionError::AlreadyInUseByAnotherAccount
        );

        session.close(account, ticket.session_key, false).unwrap();
        assert_eq!(ticket.completion.await.unwrap(), SessionCompletion::Closed);
        assert_eq!(session.state().kind, SessionKind::Free);
        assert_eq!(session.state().account_id, None);
    }

    #[test]
    fn ownership_is_checked() {
        let account = Uuid::new_v4();
        let mut session = Session::default();
        assert_eq!(
            session.heartbeat(account, Uuid::new_v4()),
            Err(SessionError::NotInUse)
        );

        let ticket = session.open(account, Duration::from_secs(1)).unwrap();
        assert_eq!(
            session.heartbeat(Uuid::new_v4(), ticket.session_key),
            Err(SessionError::NotOwner)
        );
        let wrong = Uuid::new_v4();
        assert_eq!(
            session.close(account, wrong, false),
            Err(SessionError::WrongSessionKey {
                actual: ticket.session_key,
                given: wrong
            })
        );
        assert_eq!(session.state().kind, SessionKind::InUse);
    }

    #[tokio::test]
    async fn admin_override_closes_any_session() {
        let mut session = Session::default();
        let ticket = session
            .open(Uuid::new_v4(), Duration::from_secs(1))
            .unwrap();
        session.close(Uuid::nil(), Uuid::nil(), true).unwrap();
        assert_eq!(ticket.completion.await.unwrap(), SessionCompletion::Closed);
        assert_eq!(
            session.close(Uuid::nil(), Uuid::nil(), true),
            Err(SessionError::NotInUse)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_follows_the_last_heartbeat() {
        let account = Uuid::new_v4();
        let mut session = Session::default();
        let ticket = session.open(account, Duration::from_secs(10)).unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        session.heartbeat(account, ticket.session_key).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!session.expire(Instant::now()));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(session.expire(Instant::now()));
        assert_eq!(ticket.completion.await.unwrap(), SessionCompletion::TimedOut);
        assert_eq!(session.state().kind, SessionKind::Free);
    }

    #[test]
    fn keys_are_fresh() {
        let account = Uuid::new_v4();
        let mut session = Session::default();
        let first = session.open(account, Duration::from_secs(1)).unwrap();
        session.close(account, first.session_key, false).unwrap();
        let second = session.open(account, Duration::from_secs(1)).unwrap();
        assert_ne!(first.session_key, second.session_key);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_timeout_never_expires() {
        let account = Uuid::new_v4();
        let mut session = Session::default();
        session.open(account, Duration::MAX).unwrap();

        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(!session.expire(Instant::now()));
        assert_eq!(session.state().kind, SessionKind::InUse);
    }
}
