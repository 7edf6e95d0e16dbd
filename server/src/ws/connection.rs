//! Per-connection state held by the gateway's message loop.

use uuid::Uuid;

use super::clients::EndpointKind;
use crate::auth::Principal;
use crate::error::{Error, Result};

/// One authenticated channel.
///
/// Holds only the *id* of the session it is bound to; sessions are owned by
/// the registry and outlive connections.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub principal: Principal,
    pub endpoint: EndpointKind,
    bound_session: Option<String>,
}

impl Connection {
    pub fn new(principal: Principal, endpoint: EndpointKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            endpoint,
            bound_session: None,
        }
    }

    pub fn bound_session(&self) -> Option<&str> {
        self.bound_session.as_deref()
    }

    /// Whether binding `requested` is allowed. Re-binding the same id is
    /// fine; a different id needs an explicit unbind first.
    pub fn check_bind(&self, requested: &str) -> Result<()> {
        match &self.bound_session {
            Some(bound) if bound != requested => Err(Error::AlreadyBound {
                bound: bound.clone(),
                requested: requested.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn bind(&mut self, session_id: &str) -> Result<()> {
        self.check_bind(session_id)?;
        self.bound_session = Some(session_id.to_string());
        Ok(())
    }

    pub fn unbind(&mut self) -> Option<String> {
        self.bound_session.take()
    }

    /// The bound session id, or `NotBound`.
    pub fn require_bound(&self) -> Result<&str> {
        self.bound_session().ok_or(Error::NotBound)
    }
}
