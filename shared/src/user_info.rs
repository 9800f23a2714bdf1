use std::sync::RwLock;
use serde::{Serialize, Deserialize};

use crate::validation::normalize_voter;

pub const DEFAULT_FALLBACK_VOTER: &str = "guest";
pub const VOTER_HEADER: &str = "X-Voter";

/// The "current voter" binding for a session. It can change at runtime.
#[derive(Debug)]
pub struct SessionIdentity {
    current: RwLock<Option<String>>,
    fallback: String,
}

impl Default for SessionIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_VOTER)
    }
}

impl SessionIdentity {
    pub fn new(fallback: impl Into<String>) -> Self {
        let fallback = fallback.into();
        let fallback = match normalize_voter(&fallback) {
            Ok(name) => name.to_string(),
            Err(_) => DEFAULT_FALLBACK_VOTER.to_string(),
        };
        Self { current: RwLock::new(None), fallback }
    }

    /// Binds the current voter. Blank names clear the binding.
    pub fn set_current(&self, voter: &str) {
        let next = normalize_voter(voter).ok().map(str::to_string);
        if let Ok(mut current) = self.current.write() {
            *current = next;
        }
    }

    pub fn clear(&self) {
        if let Ok(mut current) = self.current.write() {
            *current = None;
        }
    }

    pub fn current(&self) -> Option<String> {
        self.current.read().ok().and_then(|current| current.clone())
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Explicit voter, else the bound voter, else the fallback identity.
    /// Only a blank explicit name falls through.
    pub fn resolve(&self, explicit: Option<&str>) -> String {
        explicit
            .and_then(|voter| normalize_voter(voter).ok())
            .map(str::to_string)
            .or_else(|| self.current())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Voter name carried by the request, if any. Trimmed but not yet checked
/// against request limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoterInfo {
    pub voter: Option<String>,
}

#[cfg(feature = "backend")]
mod backend_impl {
    use super::*;
    use rocket::request::{FromRequest, Outcome};
    use rocket::Request;

    #[rocket::async_trait]
    impl<'r> FromRequest<'r> for VoterInfo {
        type Error = ();

        async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
            let voter = req.headers()
                .get_one(VOTER_HEADER)
                .and_then(|name| normalize_voter(name).ok())
                .map(str::to_string);

            Outcome::Success(VoterInfo { voter })
        }
    }
}
