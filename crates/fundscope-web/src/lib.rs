//! Token-guarded read API over stored funds.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use chrono::{Duration, Utc};
use fundscope_storage::{FundStore, StorageError, UserStore};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "fundscope-web";

/// Lifetime of issued tokens.
pub const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub funds: Arc<dyn FundStore>,
    pub users: Arc<dyn UserStore>,
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub jwt_secret: String,
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("FUNDSCOPE_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let jwt_secret = std::env::var("FUNDSCOPE_JWT_SECRET")
            .context("FUNDSCOPE_JWT_SECRET must be set to serve the API")?;
        Ok(Self { port, jwt_secret })
    }
}

/// Username of the verified token holder, attached to every `/secured` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    username: String,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let secured = Router::new()
        .route("/etfs", get(list_funds_handler))
        .route("/etf/{ticker}", get(fund_detail_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/login", post(login_handler))
        .nest("/secured", secured)
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "serving fund API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Passwords are stored as lowercase hex SHA-256 digests.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

pub fn issue_token(username: &str, secret: &str) -> jsonwebtoken::errors::Result<String> {
    let claims = Claims {
        username: username.to_string(),
        exp: (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

fn verify_token(token: &str, secret: &str) -> jsonwebtoken::errors::Result<AuthenticatedUser> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(AuthenticatedUser(data.claims.username))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let password_hash = hash_password(&form.password);
    match state.users.user_exists(&form.username, &password_hash).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(username = %form.username, "rejected login");
            return unauthorized("invalid username or password");
        }
        Err(err) => return storage_error(err),
    }

    match issue_token(&form.username, &state.jwt_secret) {
        Ok(token) => Json(token).into_response(),
        Err(err) => server_error(anyhow::anyhow!("signing token: {err}")),
    }
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(raw) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return unauthorized("missing authorization token");
    };
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();

    match verify_token(token, &state.jwt_secret) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(err) => {
            warn!(error = %err, "rejected token");
            unauthorized("invalid authorization token")
        }
    }
}

async fn list_funds_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Response {
    match state.funds.list_ids().await {
        Ok(ids) => {
            info!(username = %user.0, funds = ids.len(), "listed funds");
            Json(ids).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn fund_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(ticker): Path<String>,
) -> Response {
    match state.funds.get(&ticker).await {
        Ok(fund) => Json(fund.data).into_response(),
        Err(err) => storage_error(err),
    }
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, message.to_string()).into_response()
}

fn storage_error(err: StorageError) -> Response {
    match err {
        StorageError::NotFound(id) => {
            (StatusCode::NOT_FOUND, format!("fund {id} not found")).into_response()
        }
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err}"),
    )
        .into_response()
}
