use std::sync::Arc;
use backend::{
    config::{BackendKind, Settings},
    engine::RatingsEngine,
    local::LocalStore,
    remote::RemoteStore,
    store::VoteStore,
    routes::{
        all_options, cast_vote, current_voter, events, filter_images, get_summary, get_votes,
        group_images, set_current_voter, stream_votes, summaries, AppState,
    },
    cors::CORS,
    catchers::{bad_request, internal_error, not_found, unprocessable},
};
use rocket::{routes, catchers, fairing::AdHoc};
use shared::user_info::SessionIdentity;
use shuttle_runtime::CustomError;
use sqlx::PgPool;
use tracing::info;

#[shuttle_runtime::main]
async fn rocket(
    #[shuttle_shared_db::Postgres] pool: PgPool,
    #[shuttle_runtime::Secrets] secret_store: shuttle_runtime::SecretStore,
) -> shuttle_rocket::ShuttleRocket {
    info!("🚀 Starting image ratings server");

    let settings = Settings::from_secrets(&secret_store);

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(CustomError::new)?;

    info!("📋 Migrations complete");

    let primary: Arc<dyn VoteStore> = match settings.backend {
        BackendKind::Remote => Arc::new(RemoteStore::new(pool)),
        BackendKind::Local => Arc::new(LocalStore::file(&settings.local_path)),
    };
    let fallback = settings.fallback_store();
    match fallback.path() {
        Some(path) => info!("🗳️ Votes go to the {} store, falling back to {}", primary.name(), path.display()),
        None => info!("🗳️ Votes go to the {} store, falling back to session memory", primary.name()),
    }

    let engine = RatingsEngine::with_event_capacity(
        primary,
        Arc::new(fallback),
        SessionIdentity::new(settings.fallback_voter.clone()),
        settings.event_capacity,
    );

    let rocket = rocket::build()
        .attach(CORS)
        .attach(AdHoc::on_shutdown("Release vote subscriptions", |rocket| Box::pin(async move {
            if let Some(state) = rocket.state::<AppState>() {
                state.engine.shutdown();
                info!("🧹 Vote subscriptions released");
            }
        })))
        .manage(AppState::new(engine))
        .mount(
            "/api",
            routes![
                all_options,
                get_votes,
                cast_vote,
                get_summary,
                stream_votes,
                events,
                summaries,
                filter_images,
                group_images,
                current_voter,
                set_current_voter
            ],
        )
        .register(
            "/",
            catchers![
                bad_request,
                not_found,
                unprocessable,
                internal_error
            ],
        );

    Ok(rocket.into())
}
