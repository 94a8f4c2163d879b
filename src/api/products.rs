// src/api/products.rs

use actix_web::{HttpResponse, get, web};

use crate::AppState;
use crate::api::helpers::JsonResponse;
use crate::errors::{AppError, Result};
use crate::models::Product;

#[utoipa::path(
    get,
    path = "/api/product/{id}",
    params(("id" = i32, Path)),
    responses((status = 200, body = Product), (status = 404, body = JsonResponse))
)]
#[get("/product/{id}")]
pub async fn get_product(state: web::Data<AppState>, path: web::Path<i32>) -> Result<HttpResponse> {
    let id = path.into_inner();
    let product = state
        .store
        .get_product(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {id} not found")))?;

    Ok(HttpResponse::Ok().json(product))
}
