//! Read-only status API for operators.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::{ServerContext, SessionSnapshot};

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve the status API on `addr` until `shutdown` fires.
pub async fn serve(
    addr: &str,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Status API listening");
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// `GET /api/health`: liveness check with uptime and session count.
pub async fn health(State(ctx): State<Arc<ServerContext>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": ctx.registry.len().await,
    }))
}

/// `GET /api/sessions`: every live session with its tunnels and pool.
pub async fn sessions(State(ctx): State<Arc<ServerContext>>) -> Json<Vec<SessionSnapshot>> {
    let mut snapshots = Vec::new();
    for ctl in ctx.registry.all().await {
        snapshots.push(ctl.snapshot().await);
    }
    snapshots.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Json(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::config::ServerConfig;
    use crate::msg::Login;
    use crate::server::Control;

    fn context() -> Arc<ServerContext> {
        Arc::new(
            ServerContext::new(ServerConfig::default(), Authenticator::new("t", vec![], 0)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_health_reports_session_count() {
        let ctx = context();
        let Json(body) = health(State(Arc::clone(&ctx))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);

        let login = Login {
            user: "alice".to_string(),
            pool_count: 2,
            ..Login::default()
        };
        ctx.registry
            .insert(Control::new("r1".to_string(), login, Arc::clone(&ctx)))
            .await;
        let Json(body) = health(State(Arc::clone(&ctx))).await;
        assert_eq!(body["sessions"], 1);
    }

    #[tokio::test]
    async fn test_sessions_lists_snapshots() {
        let ctx = context();
        let login = Login {
            user: "alice".to_string(),
            pool_count: 2,
            ..Login::default()
        };
        ctx.registry
            .insert(Control::new("r1".to_string(), login, Arc::clone(&ctx)))
            .await;

        let Json(list) = sessions(State(Arc::clone(&ctx))).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].run_id, "r1");
        assert_eq!(list[0].user, "alice");
        assert_eq!(list[0].pool_target, 2);
        assert_eq!(list[0].idle_work_conns, 0);
        assert!(list[0].tunnels.is_empty());

        let json = serde_json::to_value(&list[0]).unwrap();
        assert_eq!(json["status"], "working");
    }
}
