use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the match relay.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::login::login_form,
        crate::routes::login::login_submit,
        crate::routes::websocket::ws_handler,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::login::LoginForm,
            crate::dto::login::LoginAccepted,
            crate::dto::ws::ServerInfo,
            crate::dto::ws::ErrorBody,
            crate::services::auth::Identity,
            crate::state::registry::Role,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "login", description = "Path-based login for pending hub connections"),
        (name = "hub", description = "WebSocket relay for plugins, overlays and control boards"),
    )
)]
pub struct ApiDoc;
