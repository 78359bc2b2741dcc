use axum::{
    Json, Router,
    extract::{Path, State},
    response::Html,
    routing::get,
};
use axum_valid::Valid;

use crate::{
    dto::login::{LoginAccepted, LoginForm},
    error::AppError,
    services::hub_service,
    state::SharedState,
};

const LOGIN_PAGE: &str = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>Match Relay login</title></head>
<body>
<h1>Log in as {role}</h1>
<form id="login">
  <label>Email <input name="email" type="email" required></label>
  <label>Password <input name="password" type="password" required></label>
  <label>Display name <input name="name"></label>
  <button type="submit">Log in</button>
</form>
<p id="status"></p>
<script>
document.getElementById("login").addEventListener("submit", async (event) => {
  event.preventDefault();
  const body = Object.fromEntries(new FormData(event.target));
  const response = await fetch(window.location.pathname, {
    method: "POST",
    headers: {"Content-Type": "application/json"},
    body: JSON.stringify(body),
  });
  const payload = await response.json().catch(() => ({}));
  document.getElementById("status").textContent =
    response.ok ? "Logged in, you can close this page." : (payload.message || response.statusText);
});
</script>
</body>
</html>
"#;

#[utoipa::path(
    get,
    path = "/login/{id}",
    tag = "login",
    params(("id" = String, Path, description = "Identifier of the pending hub connection")),
    responses(
        (status = 200, description = "Login form", content_type = "text/html"),
        (status = 404, description = "No login ticket for this connection"),
        (status = 409, description = "Connection already authenticated"),
    )
)]
/// Serve the login form for a pending connection that requested a login path.
pub async fn login_form(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Html<String>, AppError> {
    let role = hub_service::login_ticket(&state, &id).await?;
    Ok(Html(LOGIN_PAGE.replace("{role}", &role.to_string())))
}

#[utoipa::path(
    post,
    path = "/login/{id}",
    tag = "login",
    params(("id" = String, Path, description = "Identifier of the pending hub connection")),
    request_body = LoginForm,
    responses(
        (status = 200, description = "Connection logged in", body = LoginAccepted),
        (status = 400, description = "Invalid form"),
        (status = 401, description = "Credentials rejected"),
        (status = 404, description = "No login ticket for this connection"),
        (status = 409, description = "Connection already authenticated"),
    )
)]
/// Redeem a login ticket with email and password.
pub async fn login_submit(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Valid(Json(form)): Valid<Json<LoginForm>>,
) -> Result<Json<LoginAccepted>, AppError> {
    let logged_in = hub_service::redeem_login_ticket(&state, &id, form).await?;
    Ok(Json(LoginAccepted {
        id: logged_in.id,
        role: logged_in.role,
        identity: logged_in.identity,
        server: logged_in.server,
    }))
}

/// Configure the path-based login routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/login/{id}", get(login_form).post(login_submit))
}
