use rocket::http::Status;
use rocket::response::Responder;
use rocket::serde::json::Json;
use serde::Serialize;
use shared::{ErrorResponse, ValidationError};
use thiserror::Error;

#[derive(Error, Debug, Serialize)]
pub enum ApiError {
    #[error("Invalid image id: {0}")]
    InvalidImageId(String),
    #[error("Invalid voter: {0}")]
    InvalidVoter(String),
    #[error("Invalid vote: {0}")]
    InvalidVote(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::EmptyVoter | ValidationError::VoterTooLong => ApiError::InvalidVoter(e.to_string()),
            ValidationError::EmptyImageId | ValidationError::ImageIdTooLong => ApiError::InvalidImageId(e.to_string()),
            ValidationError::InvalidVote(raw) => ApiError::InvalidVote(raw),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for ApiError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        let status = match self {
            ApiError::InvalidImageId(_) => Status::BadRequest,
            ApiError::InvalidVoter(_) => Status::BadRequest,
            ApiError::InvalidVote(_) => Status::BadRequest,
            ApiError::Internal(_) => Status::InternalServerError,
        };

        rocket::Response::build_from(Json(ErrorResponse { error: self.to_string() }).respond_to(req)?)
            .status(status)
            .ok()
    }
}
