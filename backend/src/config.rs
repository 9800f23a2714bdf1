use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use shared::user_info::DEFAULT_FALLBACK_VOTER;
use shuttle_runtime::SecretStore;
use tracing::{info, warn};

use crate::engine::DEFAULT_EVENT_CAPACITY;
use crate::local::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Local,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "remote" | "postgres" => Ok(BackendKind::Remote),
            "local" => Ok(BackendKind::Local),
            other => Err(format!("unknown backend {other:?}, expected remote or local")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendKind,
    pub local_path: PathBuf,
    pub fallback_voter: String,
    pub event_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_secrets(secrets: &SecretStore) -> Self {
        Self::from_lookup(|key| secrets.get(key))
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let default_path = env::temp_dir().join("image_ratings.json");
        Self {
            backend: try_load(&get, "RATINGS_BACKEND", BackendKind::Remote),
            local_path: get("RATINGS_LOCAL_PATH").map(PathBuf::from).unwrap_or_else(|| {
                info!("RATINGS_LOCAL_PATH not set, using default: {}", default_path.display());
                default_path
            }),
            fallback_voter: get("RATINGS_FALLBACK_VOTER")
                .unwrap_or_else(|| DEFAULT_FALLBACK_VOTER.to_string()),
            event_capacity: try_load(&get, "RATINGS_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY),
        }
    }

    /// Where failed primary writes go. The local file is the primary in local
    /// mode, so writes it rejects are held in memory instead.
    pub fn fallback_store(&self) -> LocalStore {
        match self.backend {
            BackendKind::Remote => LocalStore::file(&self.local_path),
            BackendKind::Local => LocalStore::in_memory(),
        }
    }
}

fn try_load<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default:?}");
            default
        }),
        None => {
            info!("{key} not set, using default: {default:?}");
            default
        }
    }
}
