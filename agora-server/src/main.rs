use std::{net::SocketAddr, sync::Arc};

use agora_api::MessageStore;
use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use structopt::StructOpt;
use tower_http::trace::TraceLayer;

mod db;
mod error;
mod extractors;
mod feeds;
mod fuzz;
mod handlers;

use error::Error;
use extractors::AppState;
use feeds::RoomFeeds;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(StructOpt)]
#[structopt(about = "Comment store and realtime room relay")]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    /// Address to listen on
    #[structopt(long, env = "AGORA_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(db_url)
        .await
        .with_context(|| format!("Error opening database {:?}", db_url))
}

pub fn app(store: Arc<dyn MessageStore>) -> Router {
    let state = AppState {
        store,
        feeds: RoomFeeds::new(),
    };
    Router::new()
        .route("/api/resources/:id/comments", get(handlers::list_comments))
        .route("/api/comments", post(handlers::insert_comment))
        .route("/api/comments/:id/children", get(handlers::list_children))
        .route("/api/comments/delete", post(handlers::delete_comments))
        .route("/ws/room/:name", get(handlers::room_feed))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();
    let pool = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&pool)
        .await
        .context("applying database migrations")?;

    let app = app(Arc::new(db::PgStore::new(pool)));

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
