// src/api/mod.rs

pub mod admin;
pub mod auth;
pub mod checkout;
pub mod helpers;
pub mod products;
pub mod stripe_client;

use actix_web::web;

/// Mounts every route. Storefront and auth endpoints are public; `/api/admin`
/// requires a bearer token.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .service(products::get_product)
            .service(checkout::create_payment_intent)
            .service(checkout::create_customer_and_subscribe)
            .service(auth::authenticate)
            .service(auth::is_authenticated)
            .service(auth::forgot_password)
            .service(auth::reset_password)
            .service(
                web::scope("/admin")
                    .wrap(auth::TokenAuth)
                    .service(admin::virtual_terminal_succeeded)
                    .service(admin::all_sales)
                    .service(admin::all_subscriptions)
                    .service(admin::get_sale)
                    .service(admin::refund)
                    .service(admin::cancel_subscription)
                    .service(admin::update_order_status)
                    .service(admin::edit_user)
                    .service(admin::delete_user)
                    .service(admin::all_users)
                    .service(admin::one_user),
            ),
    )
    .service(checkout::payment_succeeded)
    .service(checkout::get_receipt)
    .route("/ws", web::get().to(crate::ws::admin_ws));
}
