use std::collections::{BTreeMap, HashMap};
use serde::{Serialize, Deserialize};

use crate::models::{ImageDescriptor, ImageId, Vote, VoteMap};

/// A single vote never settles a category either way.
pub const MIN_CLASSIFIABLE_VOTES: usize = 2;
pub const TOP_TIER_SCORE: u32 = 5;
pub const HIGH_TIER_SCORE: u32 = 3;

const LIKE_WEIGHT: u32 = 2;
const UNSURE_WEIGHT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category { Consensus, Controversial, Rejected, Unrated }

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier { Top, High, Low, Unrated }

impl Tier {
    pub const fn from_score(score: u32) -> Self {
        match score {
            0 => Tier::Unrated,
            s if s >= TOP_TIER_SCORE => Tier::Top,
            s if s >= HIGH_TIER_SCORE => Tier::High,
            _ => Tier::Low,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub likes: usize,
    pub unsure: usize,
    pub dislikes: usize,
}

impl Tally {
    fn record(&mut self, vote: Vote) {
        match vote {
            Vote::Like => self.likes += 1,
            Vote::Unsure => self.unsure += 1,
            Vote::Dislike => self.dislikes += 1,
        }
    }

    pub fn total(&self) -> usize { self.likes + self.unsure + self.dislikes }
}

pub fn tally(votes: &VoteMap) -> Tally {
    votes.votes().fold(Tally::default(), |mut t, vote| { t.record(vote); t })
}

/// The order of the checks is the tie-break.
pub fn classify(votes: &VoteMap) -> Category {
    let Tally { likes, dislikes, .. } = tally(votes);
    if votes.len() < MIN_CLASSIFIABLE_VOTES {
        Category::Unrated
    } else if likes > 0 && dislikes == 0 {
        Category::Consensus
    } else if dislikes > likes {
        Category::Rejected
    } else if likes > 0 && dislikes > 0 {
        Category::Controversial
    } else {
        Category::Unrated
    }
}

pub fn score(votes: &VoteMap) -> u32 {
    let t = tally(votes);
    LIKE_WEIGHT * t.likes as u32 + UNSURE_WEIGHT * t.unsure as u32
}

/// Anything that names a catalog image.
pub trait Catalogued {
    fn image_id(&self) -> &str;
}

impl Catalogued for ImageDescriptor {
    fn image_id(&self) -> &str { &self.id }
}

impl Catalogued for String {
    fn image_id(&self) -> &str { self }
}

impl Catalogued for &str {
    fn image_id(&self) -> &str { self }
}

/// Keeps the images whose cell for `voter` satisfies `predicate`.
/// Images missing from `vote_maps` count as not voted.
pub fn filter_by_voter<'a, T, P>(
    images: &'a [T],
    vote_maps: &HashMap<ImageId, VoteMap>,
    voter: &str,
    predicate: P,
) -> Vec<&'a T>
where
    T: Catalogued,
    P: Fn(Option<Vote>) -> bool,
{
    images.iter()
        .filter(|image| {
            let cell = vote_maps.get(image.image_id()).and_then(|votes| votes.get(voter));
            predicate(cell)
        })
        .collect()
}

/// Ready-made predicates for the per-voter views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoterFilter { Likes, Unsure, Dislikes, Unrated }

impl VoterFilter {
    pub fn matches(self, cell: Option<Vote>) -> bool {
        match self {
            VoterFilter::Likes => cell == Some(Vote::Like),
            VoterFilter::Unsure => cell == Some(Vote::Unsure),
            VoterFilter::Dislikes => cell == Some(Vote::Dislike),
            VoterFilter::Unrated => cell.is_none(),
        }
    }
}

fn group_by<'a, T, K, F>(images: &'a [T], vote_maps: &HashMap<ImageId, VoteMap>, key: F) -> BTreeMap<K, Vec<&'a T>>
where
    T: Catalogued,
    K: Ord,
    F: Fn(&VoteMap) -> K,
{
    let empty = VoteMap::new();
    images.iter().fold(BTreeMap::new(), |mut groups, image| {
        let votes = vote_maps.get(image.image_id()).unwrap_or(&empty);
        groups.entry(key(votes)).or_insert_with(Vec::new).push(image);
        groups
    })
}

pub fn group_by_category<'a, T: Catalogued>(
    images: &'a [T],
    vote_maps: &HashMap<ImageId, VoteMap>,
) -> BTreeMap<Category, Vec<&'a T>> {
    group_by(images, vote_maps, classify)
}

pub fn group_by_tier<'a, T: Catalogued>(
    images: &'a [T],
    vote_maps: &HashMap<ImageId, VoteMap>,
) -> BTreeMap<Tier, Vec<&'a T>> {
    group_by(images, vote_maps, |votes| Tier::from_score(score(votes)))
}

pub fn group_by_room(images: &[ImageDescriptor]) -> BTreeMap<&str, Vec<&ImageDescriptor>> {
    images.iter().fold(BTreeMap::new(), |mut rooms, image| {
        rooms.entry(image.room.as_str()).or_insert_with(Vec::new).push(image);
        rooms
    })
}

/// Highest score first; equal scores fall back to image id so the order is stable.
pub fn rank_by_score<'a, T: Catalogued>(
    images: &'a [T],
    vote_maps: &HashMap<ImageId, VoteMap>,
) -> Vec<(&'a T, u32)> {
    let mut ranked: Vec<_> = images.iter()
        .map(|image| (image, vote_maps.get(image.image_id()).map_or(0, score)))
        .collect();
    ranked.sort_by(|(a, sa), (b, sb)| sb.cmp(sa).then_with(|| a.image_id().cmp(b.image_id())));
    ranked
}
