use crate::error::ApiError;
use shared::models::{ImageGroups, ImageId, Vote, VoteMap};
use shared::validation::{parse_vote as parse_raw_vote, validate_image_id, validate_voter};
use shared::{group_by_category, group_by_tier};
use std::collections::{BTreeMap, HashMap};

pub fn parse_image_id(id: &str) -> Result<ImageId, ApiError> {
    Ok(validate_image_id(id)?.to_string())
}

pub fn parse_voter(name: &str) -> Result<String, ApiError> {
    Ok(validate_voter(name)?.to_string())
}

pub fn parse_vote(raw: &str) -> Result<Vote, ApiError> {
    Ok(parse_raw_vote(raw)?)
}

pub fn parse_image_ids(ids: &[ImageId]) -> Result<Vec<ImageId>, ApiError> {
    ids.iter().map(|id| parse_image_id(id)).collect()
}

fn owned<K: Ord>(groups: BTreeMap<K, Vec<&ImageId>>) -> BTreeMap<K, Vec<ImageId>> {
    groups.into_iter()
        .map(|(key, ids)| (key, ids.into_iter().cloned().collect()))
        .collect()
}

pub fn build_groups(image_ids: &[ImageId], vote_maps: &HashMap<ImageId, VoteMap>) -> ImageGroups {
    ImageGroups {
        by_category: owned(group_by_category(image_ids, vote_maps)),
        by_tier: owned(group_by_tier(image_ids, vote_maps)),
    }
}
