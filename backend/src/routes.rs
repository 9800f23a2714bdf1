use rocket::{State, get, post, put, http::Status, serde::json::Json, Shutdown};
use rocket::response::stream::{Event, EventStream};
use rocket::tokio::select;
use rocket::tokio::sync::{broadcast::error::RecvError, mpsc};
use serde::{Serialize, Deserialize};
use tracing::{debug, instrument};
use shared::models::*;
use shared::user_info::VoterInfo;
use shared::{filter_by_voter, ErrorResponse};
use crate::{
    engine::{Persisted, RatingsEngine},
    error::ApiError,
    utils::{build_groups, parse_image_id, parse_image_ids, parse_vote, parse_voter},
};

pub struct AppState {
    pub engine: RatingsEngine,
}

impl AppState {
    pub fn new(engine: RatingsEngine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteResponse {
    pub image_id: ImageId,
    pub voter: String,
    pub vote: Option<Vote>,
    pub votes: VoteMap,
    pub persisted: Persisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoterResponse {
    pub voter: String,
}

#[rocket::options("/<_..>")]
pub async fn all_options() -> Status {
    Status::Ok
}

#[get("/ratings/<image_id>")]
pub async fn get_votes(state: &State<AppState>, image_id: &str) -> Result<Json<VoteMap>, ApiError> {
    let image_id = parse_image_id(image_id)?;
    Ok(Json(state.engine.get_votes(&image_id).await))
}

#[instrument(skip(state, request, voter_info))]
#[post("/ratings/<image_id>", format = "json", data = "<request>")]
pub async fn cast_vote(
    state: &State<AppState>,
    image_id: &str,
    request: Json<CastVoteRequest>,
    voter_info: VoterInfo,
) -> Result<Json<CastVoteResponse>, ApiError> {
    let image_id = parse_image_id(image_id)?;
    let request = request.into_inner();
    let vote = parse_vote(&request.vote)?;
    let explicit = match request.voter.as_deref() {
        Some(name) => Some(parse_voter(name)?),
        None => voter_info.voter.as_deref().map(parse_voter).transpose()?,
    };
    let voter = state.engine.identity().resolve(explicit.as_deref());

    // Toggle against what the stores already hold.
    state.engine.get_votes(&image_id).await;

    let pending = state.engine.set_vote(&image_id, Some(&voter), vote)
        .ok_or_else(|| ApiError::Internal("vote was not applied".into()))?;
    let persisted = pending.await.map_err(|e| ApiError::Internal(e.to_string()))?;
    debug!("Vote by {} persisted to {:?}", voter, persisted);

    let votes = state.engine.get_votes(&image_id).await;
    Ok(Json(CastVoteResponse {
        vote: votes.get(&voter),
        image_id,
        voter,
        votes,
        persisted,
    }))
}

#[get("/ratings/<image_id>/summary")]
pub async fn get_summary(state: &State<AppState>, image_id: &str) -> Result<Json<ImageSummary>, ApiError> {
    let image_id = parse_image_id(image_id)?;
    let votes = state.engine.get_votes(&image_id).await;
    Ok(Json(ImageSummary::new(image_id, votes)))
}

#[get("/ratings/<image_id>/stream")]
pub fn stream_votes(
    state: &State<AppState>,
    image_id: &str,
    mut end: Shutdown,
) -> Result<EventStream![], (Status, Json<ErrorResponse>)> {
    let image_id = parse_image_id(image_id)
        .map_err(|e| (Status::BadRequest, Json(ErrorResponse { error: e.to_string() })))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<VoteMap>();
    let subscription = state.engine.subscribe(&image_id, move |votes| {
        let _ = tx.send(votes.clone());
    });

    Ok(EventStream! {
        let _subscription = subscription;
        loop {
            let votes = select! {
                votes = rx.recv() => match votes {
                    Some(votes) => votes,
                    None => break,
                },
                _ = &mut end => break,
            };
            yield Event::json(&votes).event("votes");
        }
    })
}

#[get("/events")]
pub fn events(state: &State<AppState>, mut end: Shutdown) -> EventStream![] {
    let mut rx = state.engine.changes();
    EventStream! {
        loop {
            let change = select! {
                change = rx.recv() => match change {
                    Ok(change) => change,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Change feed lagged by {} event(s)", skipped);
                        continue;
                    }
                },
                _ = &mut end => break,
            };
            yield Event::json(&change).event("rating-change");
        }
    }
}

#[post("/catalog/summaries", format = "json", data = "<request>")]
pub async fn summaries(state: &State<AppState>, request: Json<ImageSetRequest>) -> Result<Json<Vec<ImageSummary>>, ApiError> {
    let image_ids = parse_image_ids(&request.image_ids)?;
    let mut vote_maps = state.engine.get_many(&image_ids).await;
    Ok(Json(image_ids.into_iter()
        .map(|id| {
            let votes = vote_maps.remove(&id).unwrap_or_default();
            ImageSummary::new(id, votes)
        })
        .collect()))
}

#[post("/catalog/filter", format = "json", data = "<request>")]
pub async fn filter_images(state: &State<AppState>, request: Json<VoterFilterRequest>) -> Result<Json<Vec<ImageId>>, ApiError> {
    let request = request.into_inner();
    let voter = parse_voter(&request.voter)?;
    let image_ids = parse_image_ids(&request.image_ids)?;
    let vote_maps = state.engine.get_many(&image_ids).await;
    let matches = filter_by_voter(&image_ids, &vote_maps, &voter, |cell| request.filter.matches(cell));
    Ok(Json(matches.into_iter().cloned().collect()))
}

#[post("/catalog/groups", format = "json", data = "<request>")]
pub async fn group_images(state: &State<AppState>, request: Json<ImageSetRequest>) -> Result<Json<ImageGroups>, ApiError> {
    let image_ids = parse_image_ids(&request.image_ids)?;
    let vote_maps = state.engine.get_many(&image_ids).await;
    Ok(Json(build_groups(&image_ids, &vote_maps)))
}

#[get("/session/voter")]
pub fn current_voter(state: &State<AppState>) -> Json<VoterResponse> {
    Json(VoterResponse { voter: state.engine.identity().resolve(None) })
}

#[put("/session/voter", format = "json", data = "<request>")]
pub fn set_current_voter(state: &State<AppState>, request: Json<SetVoterRequest>) -> Result<Json<VoterResponse>, ApiError> {
    let voter = parse_voter(&request.voter)?;
    state.engine.identity().set_current(&voter);
    Ok(Json(VoterResponse { voter }))
}
