//! DTOs for the HTTP half of the path-based login flow.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    dto::{validation::validate_display_name, ws::ServerInfo},
    services::auth::Identity,
    state::registry::Role,
};

/// Credentials posted by the login form for a pending connection.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct LoginForm {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
    /// Display name for the connection; defaults to the account's name.
    #[serde(default)]
    #[validate(custom(function = "validate_display_name"))]
    pub name: String,
}

/// Response returned once the pending connection has been logged in.
#[derive(Debug, Serialize, ToSchema)]
pub struct LoginAccepted {
    pub id: String,
    pub role: Role,
    pub identity: Identity,
    pub server: ServerInfo,
}
