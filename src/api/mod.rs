use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer,
    extract::Request,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    BoxError, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::impersonation::{block_impersonation, impersonation, require_scope, RequiredScope};
use crate::auth::middleware::authenticate;
use crate::errors::AppError;
use crate::features::{require_module, FeatureAnnotation, ModuleGate};
use crate::AppState;

pub mod handlers;
pub mod integrations;

pub const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Module an organization needs before it can run or configure integrations.
pub const INTEGRATIONS_MODULE: &str = "integrations";

/// Builds the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let auth = state.authenticator.clone();
    let integrations_gate = ModuleGate {
        cache: state.features.clone(),
        annotation: FeatureAnnotation::modules([INTEGRATIONS_MODULE]),
    };

    let writes = Router::new()
        .route(
            "/v1/integrations/:provider/auth/start",
            post(integrations::start_auth),
        )
        .route(
            "/v1/integrations/:provider/credentials",
            post(integrations::submit_credentials),
        )
        .route(
            "/v1/integrations/:provider/operations/:operation",
            post(integrations::run_operation).route_layer(middleware::from_fn_with_state(
                integrations_gate.clone(),
                require_module,
            )),
        )
        .route_layer(middleware::from_fn_with_state(
            RequiredScope("write"),
            require_scope,
        ));

    let sensitive = Router::new()
        .route("/v1/integrations/:provider", delete(integrations::disconnect))
        .route(
            "/v1/integrations/:provider/operations/:operation/template",
            put(integrations::put_template).route_layer(middleware::from_fn_with_state(
                integrations_gate,
                require_module,
            )),
        )
        .route(
            "/v1/sso/tokens/:token_id/authorize",
            post(handlers::authorize_token_sso),
        )
        .route(
            "/v1/organizations/:org_id/modules",
            put(handlers::set_modules),
        )
        .route("/v1/impersonation/start", post(handlers::start_impersonation))
        .route_layer(middleware::from_fn(block_impersonation));

    let protected = Router::new()
        .route("/v1/me", get(handlers::me))
        .route("/v1/organizations", get(handlers::organizations))
        .route("/v1/modules", get(handlers::modules))
        .route("/v1/impersonation/end", post(handlers::end_impersonation))
        .route("/v1/integrations", get(integrations::list))
        .route(
            "/v1/integrations/:provider/auth/callback",
            get(integrations::auth_callback),
        )
        .merge(writes)
        .merge(sensitive)
        .route_layer(middleware::from_fn_with_state(auth.clone(), impersonation))
        .route_layer(middleware::from_fn_with_state(auth, authenticate));

    let timeout = state.config.request_timeout;
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(JWKS_PATH, get(handlers::jwks))
        .route("/v1/refresh", post(handlers::refresh))
        .merge(protected)
        .fallback(fallback_404)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(timeout),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .layer(middleware::from_fn(security_headers))
}

async fn fallback_404() -> AppError {
    AppError::NotFound("route not found".into())
}

async fn handle_timeout(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        AppError::Timeout.into_response()
    } else {
        AppError::Internal(anyhow::anyhow!("unhandled middleware error: {}", err)).into_response()
    }
}

fn cors() -> CorsLayer {
    let dashboard_origin =
        std::env::var("DASHBOARD_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin = origin.to_str().unwrap_or("");
            origin == dashboard_origin
                || origin.starts_with("http://localhost:")
                || origin.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        // AllowHeaders::any() is not allowed together with credentials.
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-organization-id"),
            HeaderName::from_static("x-user-id"),
        ])
        .allow_credentials(true)
}

/// Adds security headers to every response.
async fn security_headers(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    // Responses carry tokens and credentials.
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove(header::SERVER);
    resp
}
