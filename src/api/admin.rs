// src/api/admin.rs
//
// Back-office endpoints. Mounted under `/api/admin` behind `TokenAuth`,
// which puts the calling `User` into request extensions.

use actix_web::{HttpResponse, post, web};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::AppState;
use crate::admin::{self, TerminalPayment, UserForm};
use crate::api::helpers::{JsonResponse, ok_with, read_json};
use crate::errors::Result;
use crate::models::{OrderStatus, Page, Sale, Transaction, User};
use crate::ws::notify_logout;

#[derive(Debug, Deserialize, ToSchema)]
pub struct TerminalBody {
    pub payment_intent: String,
    pub payment_method: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PageRequest {
    #[serde(default = "first_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn first_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    10
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundRequest {
    pub id: i32,
    /// Minor units; the full order amount when absent.
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelSubscriptionRequest {
    pub id: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UserBody {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/admin/virtual-terminal-succeeded",
    request_body = TerminalBody,
    responses((status = 200, body = Transaction), (status = 402, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/virtual-terminal-succeeded")]
pub async fn virtual_terminal_succeeded(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: TerminalBody = read_json(&body)?;

    let txn = admin::virtual_terminal_succeeded(
        state.gateway.as_ref(),
        state.store.as_ref(),
        &state.stripe_secret,
        TerminalPayment {
            payment_intent: payload.payment_intent,
            payment_method: payload.payment_method,
            amount: payload.amount,
            currency: payload.currency,
        },
    )
    .await?;

    Ok(HttpResponse::Ok().json(txn))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-sales",
    request_body = PageRequest,
    responses((status = 200, body = Page<Sale>)),
    security(("bearer" = []))
)]
#[post("/all-sales")]
pub async fn all_sales(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    let req: PageRequest = read_json(&body)?;
    let page = admin::list_sales(state.store.as_ref(), false, req.page_size, req.page).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-subs",
    request_body = PageRequest,
    responses((status = 200, body = Page<Sale>)),
    security(("bearer" = []))
)]
#[post("/all-subs")]
pub async fn all_subscriptions(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let req: PageRequest = read_json(&body)?;
    let page = admin::list_sales(state.store.as_ref(), true, req.page_size, req.page).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[utoipa::path(
    post,
    path = "/api/admin/get-sale/{id}",
    params(("id" = i32, Path)),
    responses((status = 200, body = Sale), (status = 404, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/get-sale/{id}")]
pub async fn get_sale(state: web::Data<AppState>, path: web::Path<i32>) -> Result<HttpResponse> {
    let sale = admin::get_sale(state.store.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(sale))
}

#[utoipa::path(
    post,
    path = "/api/admin/refund",
    request_body = RefundRequest,
    responses(
        (status = 200, body = JsonResponse),
        (status = 402, body = JsonResponse),
        (status = 409, body = JsonResponse)
    ),
    security(("bearer" = []))
)]
#[post("/refund")]
pub async fn refund(
    state: web::Data<AppState>,
    admin_user: web::ReqData<User>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let req: RefundRequest = read_json(&body)?;
    log::info!("admin {} refunding order {}", admin_user.email, req.id);

    let sale = admin::refund_payment(
        state.gateway.as_ref(),
        state.store.as_ref(),
        &state.stripe_secret,
        req.id,
        req.amount,
    )
    .await?;

    Ok(ok_with("Charge refunded", "sale", &sale))
}

#[utoipa::path(
    post,
    path = "/api/admin/cancel-sub",
    request_body = CancelSubscriptionRequest,
    responses((status = 200, body = JsonResponse), (status = 409, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/cancel-sub")]
pub async fn cancel_subscription(
    state: web::Data<AppState>,
    admin_user: web::ReqData<User>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let req: CancelSubscriptionRequest = read_json(&body)?;
    log::info!("admin {} cancelling subscription on order {}", admin_user.email, req.id);

    let sale = admin::cancel_subscription(
        state.gateway.as_ref(),
        state.store.as_ref(),
        &state.stripe_secret,
        req.id,
    )
    .await?;

    Ok(ok_with("Subscription cancelled", "sale", &sale))
}

#[utoipa::path(
    post,
    path = "/api/admin/update-order-status/{id}",
    params(("id" = i32, Path)),
    request_body = OrderStatusRequest,
    responses((status = 200, body = JsonResponse), (status = 409, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/update-order-status/{id}")]
pub async fn update_order_status(
    state: web::Data<AppState>,
    path: web::Path<i32>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let req: OrderStatusRequest = read_json(&body)?;
    let sale = admin::update_order_status(state.store.as_ref(), path.into_inner(), req.status).await?;
    Ok(ok_with("Order status updated", "sale", &sale))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-users",
    responses((status = 200, body = Vec<User>)),
    security(("bearer" = []))
)]
#[post("/all-users")]
pub async fn all_users(state: web::Data<AppState>) -> Result<HttpResponse> {
    let users = admin::all_users(state.store.as_ref()).await?;
    Ok(HttpResponse::Ok().json(users))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-users/{id}",
    params(("id" = i32, Path)),
    responses((status = 200, body = User), (status = 404, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/all-users/{id}")]
pub async fn one_user(state: web::Data<AppState>, path: web::Path<i32>) -> Result<HttpResponse> {
    let user = admin::get_user(state.store.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-users/edit/{id}",
    params(("id" = i32, Path, description = "0 creates a new user")),
    request_body = UserBody,
    responses((status = 200, body = JsonResponse), (status = 400, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/all-users/edit/{id}")]
pub async fn edit_user(
    state: web::Data<AppState>,
    path: web::Path<i32>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    let payload: UserBody = read_json(&body)?;
    let id = admin::save_user(
        state.store.as_ref(),
        path.into_inner(),
        UserForm {
            first_name: payload.first_name,
            last_name: payload.last_name,
            email: payload.email,
            password: payload.password,
        },
    )
    .await?;

    Ok(ok_with("user saved", "id", &id))
}

#[utoipa::path(
    post,
    path = "/api/admin/all-users/delete/{id}",
    params(("id" = i32, Path)),
    responses((status = 200, body = JsonResponse), (status = 404, body = JsonResponse)),
    security(("bearer" = []))
)]
#[post("/all-users/delete/{id}")]
pub async fn delete_user(
    state: web::Data<AppState>,
    admin_user: web::ReqData<User>,
    path: web::Path<i32>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    admin::delete_user(state.store.as_ref(), id).await?;
    log::info!("admin {} deleted user {id}", admin_user.email);

    notify_logout(&state.ws_hub, id);

    Ok(HttpResponse::Ok().json(JsonResponse::ok("user deleted")))
}
