pub mod config;
pub mod engine;
pub mod registry;
pub mod store;
pub mod local;
pub mod remote;
pub mod routes;
pub mod cors;
pub mod error;
pub mod utils;
pub mod catchers;
pub use shared::user_info;
pub use shared::{models::*, error::*, user_info::*};
pub use shared::aggregation::{classify, score, filter_by_voter, Category, Tier, VoterFilter};
pub use engine::{Persisted, RatingsEngine, Subscription};
pub use store::{StoreError, VoteStore, WatchHandle};

#[cfg(test)]
mod tests;
