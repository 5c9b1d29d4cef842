//! Staff access gate: one shared password, sessions without expiry or identity.

use dashmap::DashMap;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("incorrect password")]
    WrongPassword,
    #[error("not signed in")]
    Unauthorized,
}

pub struct AccessGate {
    password: Option<String>,
    sessions: DashMap<String, ()>,
}

fn same_bytes(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl AccessGate {
    /// `None` (or blank) leaves the gate open: every session is authorized.
    pub fn new(password: Option<String>) -> Self {
        let password = password.filter(|p| !p.is_empty());
        if password.is_none() {
            tracing::warn!("[HUB] no gate password configured; access gate is open");
        }
        Self {
            password,
            sessions: DashMap::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.password.is_none()
    }

    /// Check the shared password and issue a session token.
    pub fn login(&self, candidate: &str) -> Result<String, GateError> {
        if let Some(expected) = &self.password {
            if !same_bytes(expected.as_bytes(), candidate.as_bytes()) {
                tracing::warn!("[HUB] failed sign-in attempt");
                return Err(GateError::WrongPassword);
            }
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(token.clone(), ());
        Ok(token)
    }

    pub fn logout(&self, token: &str) {
        self.sessions.remove(token);
    }

    pub fn is_authorized(&self, token: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        token.is_some_and(|t| self.sessions.contains_key(t))
    }

    pub fn authorize(&self, token: Option<&str>) -> Result<(), GateError> {
        if self.is_authorized(token) {
            Ok(())
        } else {
            Err(GateError::Unauthorized)
        }
    }
}
