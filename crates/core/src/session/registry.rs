//! Session registry.
//!
//! Sessions are looked up by id through this registry; there is no global
//! session table. The state machine is enforced here, and every transition
//! is persisted before it is observable.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::db::Database;
use crate::errors::SessionError;
use crate::models::{ChangeEvent, Session, SessionState};

/// SQLite-backed registry of sessions keyed by id.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Arc<Database>,
}

impl SessionRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Register a new session. Fails if the id is taken.
    pub fn create(&self, session: &Session) -> Result<(), SessionError> {
        if self.db.get_session(&session.session_id)?.is_some() {
            return Err(SessionError::AlreadyExists(session.session_id.clone()));
        }
        self.db.insert_session(session)?;
        debug!(session_id = %session.session_id, "session registered");
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        self.db
            .get_session(session_id)?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn exists(&self, session_id: &str) -> Result<bool, SessionError> {
        Ok(self.db.get_session(session_id)?.is_some())
    }

    /// Move `session` to `next` and persist it. Terminal states stamp the end
    /// time.
    pub fn transition(&self, session: &mut Session, next: SessionState) -> Result<(), SessionError> {
        if !session.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: session.state.to_string(),
                to: next.to_string(),
            });
        }
        let from = session.state;
        session.state = next;
        if matches!(next, SessionState::Closed | SessionState::Aborted) {
            session.end_time = Some(Utc::now());
        }
        self.db.update_session(session)?;
        info!(session_id = %session.session_id, %from, to = %next, "session transition");
        Ok(())
    }

    /// Append events in order, persisting each before it joins the session.
    pub fn append_events(
        &self,
        session: &mut Session,
        events: Vec<ChangeEvent>,
    ) -> Result<(), SessionError> {
        for event in events {
            self.db.insert_session_event(&session.session_id, &event)?;
            session.change_events.push(event);
        }
        Ok(())
    }

    /// Sessions that have not reached a terminal state.
    pub fn active(&self) -> Result<Vec<Session>, SessionError> {
        Ok(self.db.list_sessions_in_states(&[
            SessionState::Active,
            SessionState::Interrupted,
            SessionState::Closing,
        ])?)
    }

    /// Paths a session is committing right now. Mirroring skips them so the
    /// session snapshot and the shadow tree never race on one file.
    pub fn owned_paths(&self) -> Result<BTreeSet<String>, SessionError> {
        let closing = self.db.list_sessions_in_states(&[SessionState::Closing])?;
        Ok(closing.iter().flat_map(|s| s.agent_files()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, ChangeKind};

    fn registry() -> SessionRegistry {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SessionRegistry::new(Arc::new(db))
    }

    fn session(id: &str) -> Session {
        Session {
            session_id: id.into(),
            start_time: Utc::now(),
            end_time: None,
            primary_commit_at_start: "p1".into(),
            primary_commit_current: "p1".into(),
            shadow_base_commit: "s1".into(),
            worktree_path: format!("/tmp/{id}"),
            branch_name: format!("session/{id}"),
            change_events: vec![],
            reasoning_events: vec![],
            state: SessionState::NotStarted,
            shadow_commit: None,
        }
    }

    #[test]
    fn test_create_and_duplicate() {
        let reg = registry();
        reg.create(&session("a")).unwrap();
        assert!(matches!(
            reg.create(&session("a")),
            Err(SessionError::AlreadyExists(_))
        ));
        assert!(matches!(reg.get("zzz"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_transitions_are_enforced_and_persisted() {
        let reg = registry();
        let mut s = session("a");
        reg.create(&s).unwrap();
        reg.transition(&mut s, SessionState::Active).unwrap();
        assert!(matches!(
            reg.transition(&mut s, SessionState::Closed),
            Err(SessionError::InvalidTransition { .. })
        ));
        reg.transition(&mut s, SessionState::Closing).unwrap();
        reg.transition(&mut s, SessionState::Closed).unwrap();
        let loaded = reg.get("a").unwrap();
        assert_eq!(loaded.state, SessionState::Closed);
        assert!(loaded.end_time.is_some());
        assert!(reg.active().unwrap().is_empty());
    }

    #[test]
    fn test_owned_paths_come_from_closing_sessions() {
        let reg = registry();
        let mut s = session("a");
        reg.create(&s).unwrap();
        reg.transition(&mut s, SessionState::Active).unwrap();
        reg.append_events(
            &mut s,
            vec![ChangeEvent::new("x.py", ChangeKind::Create, None, Some("d".into()), Actor::Agent)],
        )
        .unwrap();
        assert!(reg.owned_paths().unwrap().is_empty());

        reg.transition(&mut s, SessionState::Closing).unwrap();
        assert_eq!(
            reg.owned_paths().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["x.py".to_string()]
        );
        assert_eq!(reg.get("a").unwrap().change_events.len(), 1);
    }
}
