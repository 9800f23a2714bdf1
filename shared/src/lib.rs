pub mod error;
pub mod models;
pub mod validation;
pub mod user_info;
pub mod aggregation;

pub use error::{Error, ErrorCode, ErrorResponse};
pub use models::*;
pub use validation::*;
pub use user_info::*;
pub use aggregation::{
    classify, score, tally, filter_by_voter, group_by_category, group_by_tier, group_by_room,
    rank_by_score, Catalogued, Category, Tally, Tier, VoterFilter, MIN_CLASSIFIABLE_VOTES,
};
