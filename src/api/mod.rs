//! HTTP API.
//!
//! Exposes level math, embed script parsing and read-only guild state under
//! `/v1`. The service shares the bot's database pool.

mod v1;

use std::net::SocketAddr;

use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::AddData};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::ApiConfig;

pub(crate) fn route() -> Route {
    Route::new().nest("/v1", v1::service())
}

pub async fn serve(config: ApiConfig, pool: SqlitePool) -> Result<(), std::io::Error> {
    let app = route().with(AddData::new(pool));
    let socket = SocketAddr::new(config.address, config.port);
    info!(%socket, "starting api server");
    Server::new(TcpListener::bind(socket)).run(app).await
}
