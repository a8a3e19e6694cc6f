//! Monitoring API.
//!
//! - `GET /progress`: every running shard's tracker as JSON, keyed by
//!   model id.
//! - `GET /metrics`: Prometheus text exposition.

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;

use crate::metrics;
use crate::server::ShardRouter;

fn app(router: ShardRouter) -> Router {
    Router::new()
        .route("/progress", get(get_progress))
        .route("/metrics", get(get_metrics))
        .layer(Extension(router))
}

pub(crate) async fn run_webserver(router: ShardRouter, addr: SocketAddr) {
    tracing::info!("Starting monitoring server on {addr:?}");

    if let Err(err) = axum::Server::bind(&addr)
        .serve(app(router).into_make_service())
        .await
    {
        tracing::error!("Monitoring server on {addr:?} stopped: {err}");
    }
}

async fn get_progress(Extension(router): Extension<ShardRouter>) -> impl IntoResponse {
    Json(router.snapshots().await)
}

async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::Server;
    use crate::storage::MapStorage;

    #[tokio::test]
    async fn endpoints_respond() {
        let (mut builder, _replies) = Server::builder(ServerConfig::default());
        builder
            .add_asp_model(0, Box::new(MapStorage::new(0, 1)))
            .unwrap();
        let server = builder.start().unwrap();

        let resp = get_progress(Extension(server.router())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = get_metrics().await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
        server.shutdown().unwrap();
    }
}
