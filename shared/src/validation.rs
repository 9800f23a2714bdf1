use crate::models::Vote;

pub const MAX_VOTER_LENGTH: usize = 64;
pub const MAX_IMAGE_ID_LENGTH: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Voter name is empty")]
    EmptyVoter,
    #[error("Voter name exceeds maximum length of {MAX_VOTER_LENGTH}")]
    VoterTooLong,
    #[error("Image id is empty")]
    EmptyImageId,
    #[error("Image id exceeds maximum length of {MAX_IMAGE_ID_LENGTH}")]
    ImageIdTooLong,
    #[error("Invalid vote: {0}")]
    InvalidVote(String),
}

/// Any non-blank name is an identity. Returns it trimmed, case preserved.
pub fn normalize_voter(voter: &str) -> Result<&str, ValidationError> {
    let voter = voter.trim();
    if voter.is_empty() { return Err(ValidationError::EmptyVoter); }
    Ok(voter)
}

/// Image ids are opaque; only blank ones are rejected.
pub fn require_image_id(image_id: &str) -> Result<&str, ValidationError> {
    if image_id.trim().is_empty() { return Err(ValidationError::EmptyImageId); }
    Ok(image_id)
}

/// Request-boundary check: a usable identity within [`MAX_VOTER_LENGTH`].
pub fn validate_voter(voter: &str) -> Result<&str, ValidationError> {
    let voter = normalize_voter(voter)?;
    if voter.chars().count() > MAX_VOTER_LENGTH { return Err(ValidationError::VoterTooLong); }
    Ok(voter)
}

pub fn validate_image_id(image_id: &str) -> Result<&str, ValidationError> {
    let image_id = require_image_id(image_id)?;
    if image_id.len() > MAX_IMAGE_ID_LENGTH { return Err(ValidationError::ImageIdTooLong); }
    Ok(image_id)
}

pub fn parse_vote(raw: &str) -> Result<Vote, ValidationError> {
    raw.parse().map_err(|_| ValidationError::InvalidVote(raw.to_string()))
}
