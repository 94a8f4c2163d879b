use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::products::get_product,
        crate::api::checkout::create_payment_intent,
        crate::api::checkout::create_customer_and_subscribe,
        crate::api::checkout::payment_succeeded,
        crate::api::checkout::get_receipt,
        crate::api::auth::authenticate,
        crate::api::auth::is_authenticated,
        crate::api::auth::forgot_password,
        crate::api::auth::reset_password,
        crate::api::admin::virtual_terminal_succeeded,
        crate::api::admin::all_sales,
        crate::api::admin::all_subscriptions,
        crate::api::admin::get_sale,
        crate::api::admin::refund,
        crate::api::admin::cancel_subscription,
        crate::api::admin::update_order_status,
        crate::api::admin::all_users,
        crate::api::admin::one_user,
        crate::api::admin::edit_user,
        crate::api::admin::delete_user
    ),
    components(
        schemas(
            crate::api::helpers::JsonResponse,
            crate::api::checkout::PaymentIntentRequest,
            crate::api::checkout::PaymentSucceededForm,
            crate::api::checkout::SubscribeBody,
            crate::api::auth::Credentials,
            crate::api::auth::ForgotPasswordRequest,
            crate::api::auth::ResetPasswordRequest,
            crate::api::auth::AuthResponse,
            crate::api::admin::TerminalBody,
            crate::api::admin::PageRequest,
            crate::api::admin::RefundRequest,
            crate::api::admin::CancelSubscriptionRequest,
            crate::api::admin::OrderStatusRequest,
            crate::api::admin::UserBody,
            crate::tokens::IssuedToken,
            crate::models::Product,
            crate::models::Sale,
            crate::models::Receipt,
            crate::models::Transaction,
            crate::models::User,
            crate::models::OrderStatus,
            crate::models::TransactionStatus
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "checkout", description = "Storefront checkout"),
        (name = "auth", description = "Authentication"),
        (name = "admin", description = "Back office")
    )
)]
pub struct ApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}
