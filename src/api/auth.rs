// src/api/auth.rs

use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{AUTHORIZATION, HeaderMap};
use actix_web::{Error, HttpMessage, HttpRequest, HttpResponse, ResponseError, post, web};
use futures_util::future::{LocalBoxFuture, Ready, ready};
use serde::{Deserialize, Serialize};
use std::rc::Rc;
use std::task::{Context, Poll};
use utoipa::ToSchema;

use crate::AppState;
use crate::api::helpers::{JsonResponse, read_json};
use crate::db::Store;
use crate::errors::{AppError, Result};
use crate::mailer::MailMessage;
use crate::models::User;
use crate::tokens::{TOKEN_LEN, Token, TokenScope, hash_token};

const INVALID_CREDENTIALS: &str = "Invalid authentication credentials";

#[derive(Debug, Deserialize, ToSchema)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub error: bool,
    pub message: String,
    pub authentication_token: crate::tokens::IssuedToken,
}

/// Resolves a plaintext bearer token to its user.
pub async fn authenticate_token(store: &dyn Store, token: &str) -> Result<User> {
    if token.len() != TOKEN_LEN {
        return Err(AppError::Auth(INVALID_CREDENTIALS.into()));
    }

    store
        .user_for_token(&hash_token(token), TokenScope::Authentication)
        .await?
        .ok_or_else(|| AppError::Auth(INVALID_CREDENTIALS.into()))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| AppError::Auth("no authorization header received".into()))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Auth("no authorization header received".into()))
}

#[utoipa::path(
    post,
    path = "/api/authenticate",
    request_body = Credentials,
    responses((status = 200, body = AuthResponse), (status = 401, body = JsonResponse))
)]
#[post("/authenticate")]
pub async fn authenticate(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let creds: Credentials = read_json(&body)?;

    let user = state
        .store
        .get_user_by_email(creds.email.trim())
        .await?
        .ok_or_else(|| AppError::Auth(INVALID_CREDENTIALS.into()))?;

    if !bcrypt::verify(&creds.password, &user.password_hash)? {
        return Err(AppError::Auth(INVALID_CREDENTIALS.into()));
    }

    let token = Token::generate(user.id, TokenScope::Authentication);
    state.store.replace_token(&token, &user).await?;
    log::info!("issued authentication token for user {}", user.id);

    Ok(HttpResponse::Ok().json(AuthResponse {
        error: false,
        message: format!("token for {} created", user.email),
        authentication_token: token.issued(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/is-authenticated",
    responses((status = 200, body = JsonResponse), (status = 401, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/is-authenticated")]
pub async fn is_authenticated(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse> {
    let token = bearer_token(req.headers())?;
    let user = authenticate_token(state.store.as_ref(), token).await?;

    Ok(HttpResponse::Ok().json(JsonResponse::ok(format!(
        "authenticated user {}",
        user.email
    ))))
}

#[utoipa::path(
    post,
    path = "/api/forgot-password",
    request_body = ForgotPasswordRequest,
    responses((status = 200, body = JsonResponse), (status = 404, body = JsonResponse))
)]
#[post("/forgot-password")]
pub async fn forgot_password(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: ForgotPasswordRequest = read_json(&body)?;

    let user = state
        .store
        .get_user_by_email(payload.email.trim())
        .await?
        .ok_or_else(|| AppError::NotFound("No matching email found on our system".into()))?;

    let token = Token::generate(user.id, TokenScope::PasswordReset);
    state.store.replace_token(&token, &user).await?;

    let link = format!(
        "{}/reset-password?token={}",
        state.frontend_url.trim_end_matches('/'),
        token.plaintext
    );
    state
        .mailer
        .send(MailMessage {
            to: user.email.clone(),
            subject: "Password Reset Request".into(),
            body: format!(
                "Someone asked to reset the password on your account.\n\n\
                 Follow this link within an hour to choose a new one:\n{link}\n"
            ),
        })
        .await
        .map_err(|e| AppError::Internal(format!("password reset mail to user {}: {e}", user.id)))?;

    Ok(HttpResponse::Ok().json(JsonResponse::ok("password reset email sent")))
}

#[utoipa::path(
    post,
    path = "/api/reset-password",
    request_body = ResetPasswordRequest,
    responses((status = 200, body = JsonResponse), (status = 401, body = JsonResponse))
)]
#[post("/reset-password")]
pub async fn reset_password(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: ResetPasswordRequest = read_json(&body)?;
    if payload.password.len() < 6 {
        return Err(AppError::Validation(
            "password must be at least 6 characters".into(),
        ));
    }

    let user = if payload.token.len() == TOKEN_LEN {
        state
            .store
            .user_for_token(&hash_token(&payload.token), TokenScope::PasswordReset)
            .await?
    } else {
        None
    };
    let Some(user) = user else {
        return Err(AppError::Auth("reset link is invalid or has expired".into()));
    };

    let hash = bcrypt::hash(&payload.password, bcrypt::DEFAULT_COST)?;
    state.store.update_password(user.id, &hash).await?;
    state.store.delete_tokens_for_user(user.id).await?;
    log::info!("password reset for user {}", user.id);

    Ok(HttpResponse::Ok().json(JsonResponse::ok("password changed")))
}

/// Guards a scope with an opaque bearer token:
/// - reads `Authorization: Bearer <token>`
/// - resolves it through the store
/// - puts the `User` into request extensions
///
/// A rejected request is answered here with the usual JSON envelope.
pub struct TokenAuth;

impl<S, B> Transform<S, ServiceRequest> for TokenAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = TokenAuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<std::result::Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(TokenAuthMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct TokenAuthMiddleware<S> {
    service: Rc<S>,
}

async fn authorize(req: &ServiceRequest) -> Result<User> {
    let state = req
        .app_data::<web::Data<AppState>>()
        .ok_or_else(|| AppError::Config("application state not registered".into()))?;
    let token = bearer_token(req.headers())?;
    authenticate_token(state.store.as_ref(), token).await
}

impl<S, B> Service<ServiceRequest> for TokenAuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        Box::pin(async move {
            match authorize(&req).await {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                    service
                        .call(req)
                        .await
                        .map(ServiceResponse::map_into_left_body)
                }
                Err(e) => Ok(req.into_response(e.error_response()).map_into_right_body()),
            }
        })
    }
}
