// src/api/checkout.rs

use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::http::header::LOCATION;
use actix_web::{HttpRequest, HttpResponse, get, post, web};
use chrono::Utc;
use serde::Deserialize;
use utoipa::ToSchema;

use crate::AppState;
use crate::api::helpers::{JsonResponse, ok_with, parse_int, read_json};
use crate::api::stripe_client::PaymentIntent;
use crate::checkout::{self, CheckoutRequest, SubscribeRequest};
use crate::errors::{AppError, Result};
use crate::models::Receipt;
use crate::tokens::{RECEIPT_TTL_SECS, receipt_token, verify_receipt_token};

/// Cookie holding the buyer's proof that they may view a receipt.
pub const RECEIPT_COOKIE: &str = "receipt";

#[derive(Debug, Deserialize, ToSchema)]
pub struct PaymentIntentRequest {
    /// Minor units, sent as a string by the storefront.
    pub amount: String,
    pub currency: String,
}

/// Form posted by the storefront once the card has been confirmed client side.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PaymentSucceededForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub payment_intent: String,
    pub payment_method: String,
    pub payment_amount: String,
    pub payment_currency: String,
    pub product_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubscribeBody {
    pub product_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub payment_method: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[utoipa::path(
    post,
    path = "/api/payment-intent",
    request_body = PaymentIntentRequest,
    responses((status = 200, description = "Provider payment intent"), (status = 402, body = JsonResponse))
)]
#[post("/payment-intent")]
pub async fn create_payment_intent(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: PaymentIntentRequest = read_json(&body)?;
    let amount: i64 = parse_int("amount", &payload.amount)?;
    if amount <= 0 {
        return Err(AppError::Validation("amount must be positive".into()));
    }
    let currency = payload.currency.trim().to_lowercase();
    if currency.is_empty() {
        return Err(AppError::Validation("currency is required".into()));
    }

    let intent: PaymentIntent = state
        .gateway
        .create_payment_intent(&state.stripe_secret, &currency, amount)
        .await?;
    log::info!("payment intent {} created for {amount} {currency}", intent.id);

    Ok(HttpResponse::Ok().json(intent))
}

#[utoipa::path(
    post,
    path = "/api/create-customer-and-subscribe-to-plan",
    request_body = SubscribeBody,
    responses((status = 200, body = JsonResponse), (status = 402, body = JsonResponse))
)]
#[post("/create-customer-and-subscribe-to-plan")]
pub async fn create_customer_and_subscribe(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: SubscribeBody = read_json(&body)?;

    let recorded = checkout::subscribe_to_plan(
        state.gateway.as_ref(),
        state.store.as_ref(),
        &state.stripe_secret,
        SubscribeRequest {
            product_id: payload.product_id,
            first_name: payload.first_name,
            last_name: payload.last_name,
            email: payload.email,
            payment_method: payload.payment_method,
            currency: payload.currency,
        },
    )
    .await?;

    Ok(ok_with("Transaction successful", "receipt", &recorded))
}

#[utoipa::path(
    post,
    path = "/payment-succeeded",
    request_body(content = PaymentSucceededForm, content_type = "application/x-www-form-urlencoded"),
    responses((status = 303, description = "Redirect to the receipt"), (status = 402, body = JsonResponse))
)]
#[post("/payment-succeeded")]
pub async fn payment_succeeded(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let form: PaymentSucceededForm = serde_urlencoded::from_bytes(&body)
        .map_err(|e| AppError::Validation(format!("malformed form body: {e}")))?;

    let req = CheckoutRequest {
        amount: parse_int("payment_amount", &form.payment_amount)?,
        product_id: parse_int("product_id", &form.product_id)?,
        first_name: form.first_name,
        last_name: form.last_name,
        email: form.email,
        payment_intent: form.payment_intent,
        payment_method: form.payment_method,
        currency: form.payment_currency,
        quantity: 1,
    };

    let recorded = checkout::complete_checkout(
        state.gateway.as_ref(),
        state.store.as_ref(),
        &state.stripe_secret,
        req,
    )
    .await?;

    let expires_at = Utc::now().timestamp() + RECEIPT_TTL_SECS;
    let token = receipt_token(&state.stripe_secret, &recorded.payment_intent, expires_at)
        .ok_or_else(|| AppError::Internal("receipt token could not be signed".into()))?;
    let cookie = Cookie::build(RECEIPT_COOKIE, token)
        .path("/receipt")
        .http_only(true)
        .same_site(SameSite::Lax)
        .max_age(CookieDuration::seconds(RECEIPT_TTL_SECS))
        .finish();

    Ok(HttpResponse::SeeOther()
        .insert_header((LOCATION, format!("/receipt/{}", recorded.payment_intent)))
        .cookie(cookie)
        .finish())
}

/// Only the browser that completed the payment holds a valid receipt cookie;
/// everyone else gets the same 404 as for an unknown payment intent.
#[utoipa::path(
    get,
    path = "/receipt/{payment_intent}",
    params(("payment_intent" = String, Path)),
    responses((status = 200, body = Receipt), (status = 404, body = JsonResponse))
)]
#[get("/receipt/{payment_intent}")]
pub async fn get_receipt(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let payment_intent = path.into_inner();
    let not_found = || AppError::NotFound(format!("no receipt for {payment_intent}"));

    let allowed = req.cookie(RECEIPT_COOKIE).is_some_and(|c| {
        verify_receipt_token(
            &state.stripe_secret,
            &payment_intent,
            c.value(),
            Utc::now().timestamp(),
        )
    });
    if !allowed {
        return Err(not_found());
    }

    let recorded = state
        .store
        .find_receipt(&payment_intent)
        .await?
        .ok_or_else(not_found)?;

    Ok(HttpResponse::Ok().json(recorded))
}
