//! Route registration: module routes plus system endpoints.

use axum::Router;
use axum::response::IntoResponse;
use axum::routing::get;

/// Build the complete router. Each module is nested under `/{name}` and
/// authenticates its own requests.
pub fn build_router(module_routes: Vec<(&str, Router)>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/version", get(version));

    for (name, router) in module_routes {
        app = app.nest(&format!("/{name}"), router);
    }
    app
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
    }))
}

async fn version() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "name": "drivechatd",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use drivechat_core::{FixedOwner, Module};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        let db = Arc::new(drivechat_sql::SqliteStore::open_in_memory().unwrap());
        let module = task::TaskModule::new(
            db,
            Arc::new(FixedOwner("u1".into())),
            task::config::TaskConfig::default(),
        )
        .unwrap();
        build_router(vec![(module.name(), module.routes())])
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn system_endpoints() {
        let app = app();
        let (s, json) = get_json(&app, "/health").await;
        assert_eq!(s, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (_, json) = get_json(&app, "/version").await;
        assert_eq!(json["name"], "drivechatd");
    }

    #[tokio::test]
    async fn task_module_is_nested() {
        let app = app();
        let (s, json) = get_json(&app, "/task/tasks/stats").await;
        assert_eq!(s, StatusCode::OK);
        assert_eq!(json["pending"], 0);

        let (s, _) = get_json(&app, "/tasks/stats").await;
        assert_eq!(s, StatusCode::NOT_FOUND);
    }
}
