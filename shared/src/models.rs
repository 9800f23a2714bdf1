use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::aggregation::{Category, Tally, Tier};
use crate::error::{Error, ErrorCode};

pub type ImageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Like,
    Unsure,
    Dislike,
}

impl Vote {
    pub const fn as_str(self) -> &'static str {
        match self {
            Vote::Like => "like",
            Vote::Unsure => "unsure",
            Vote::Dislike => "dislike",
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vote {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "like" => Ok(Vote::Like),
            "unsure" => Ok(Vote::Unsure),
            "dislike" => Ok(Vote::Dislike),
            other => Err(Error::with_details(
                ErrorCode::InvalidVote,
                "Vote must be one of like, unsure, dislike",
                other,
            )),
        }
    }
}

/// Votes on one image keyed by voter identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoteMap {
    votes: BTreeMap<String, Vote>,
}

/// What a toggle-aware write did to a voter's cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellChange {
    Set(Vote),
    Retracted,
}

impl CellChange {
    pub fn vote(self) -> Option<Vote> {
        match self {
            CellChange::Set(vote) => Some(vote),
            CellChange::Retracted => None,
        }
    }
}

impl VoteMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, voter: &str) -> Option<Vote> {
        self.votes.get(voter).copied()
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Vote)> {
        self.votes.iter().map(|(voter, vote)| (voter.as_str(), *vote))
    }

    pub fn votes(&self) -> impl Iterator<Item = Vote> + '_ {
        self.votes.values().copied()
    }

    pub fn insert(&mut self, voter: impl Into<String>, vote: Vote) -> Option<Vote> {
        self.votes.insert(voter.into(), vote)
    }

    pub fn remove(&mut self, voter: &str) -> Option<Vote> {
        self.votes.remove(voter)
    }

    /// Writes `change` into the voter's cell.
    pub fn apply(&mut self, voter: &str, change: CellChange) {
        match change {
            CellChange::Set(vote) => {
                self.votes.insert(voter.to_string(), vote);
            }
            CellChange::Retracted => {
                self.votes.remove(voter);
            }
        }
    }

    /// Casting the vote a voter already holds retracts it; anything else overwrites.
    pub fn toggle(&mut self, voter: &str, vote: Vote) -> CellChange {
        let change = if self.get(voter) == Some(vote) {
            CellChange::Retracted
        } else {
            CellChange::Set(vote)
        };
        self.apply(voter, change);
        change
    }
}

impl FromIterator<(String, Vote)> for VoteMap {
    fn from_iter<I: IntoIterator<Item = (String, Vote)>>(iter: I) -> Self {
        Self { votes: iter.into_iter().collect() }
    }
}

impl<'a> FromIterator<(&'a str, Vote)> for VoteMap {
    fn from_iter<I: IntoIterator<Item = (&'a str, Vote)>>(iter: I) -> Self {
        iter.into_iter().map(|(voter, vote)| (voter.to_string(), vote)).collect()
    }
}

/// Read-only catalog entry handed over by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDescriptor {
    pub id: ImageId,
    pub room: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl ImageDescriptor {
    pub fn new(id: impl Into<ImageId>, room: impl Into<String>) -> Self {
        Self { id: id.into(), room: room.into(), fields: HashMap::new() }
    }
}

/// Process-wide notice that one image's votes changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingChange {
    pub image_id: ImageId,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

impl RatingChange {
    pub fn now(image_id: impl Into<ImageId>) -> Self {
        Self { image_id: image_id.into(), changed_at: OffsetDateTime::now_utc() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteRequest {
    pub vote: String,
    #[serde(default)]
    pub voter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVoterRequest {
    pub voter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSetRequest {
    pub image_ids: Vec<ImageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterFilterRequest {
    pub voter: String,
    pub filter: crate::aggregation::VoterFilter,
    pub image_ids: Vec<ImageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub image_id: ImageId,
    pub votes: VoteMap,
    pub tally: Tally,
    pub category: Category,
    pub score: u32,
    pub tier: Tier,
}

impl ImageSummary {
    pub fn new(image_id: impl Into<ImageId>, votes: VoteMap) -> Self {
        let score = crate::aggregation::score(&votes);
        Self {
            image_id: image_id.into(),
            tally: crate::aggregation::tally(&votes),
            category: crate::aggregation::classify(&votes),
            score,
            tier: Tier::from_score(score),
            votes,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageGroups {
    pub by_category: BTreeMap<Category, Vec<ImageId>>,
    pub by_tier: BTreeMap<Tier, Vec<ImageId>>,
}
