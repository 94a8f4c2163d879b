// src/errors.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

use crate::api::stripe_client::GatewayError;
use crate::db::StoreError;
use crate::models::{OrderStatus, TransactionStatus};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    /// The provider rejected or could not perform an operation.
    /// `message` is the user-facing card message, `detail` stays in the logs.
    #[error("payment gateway error: {detail}")]
    Gateway { message: String, detail: String },

    #[error("payment could not be confirmed: {0}")]
    PaymentVerification(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("{0}")]
    NotFound(String),

    #[error("order cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn order_transition(from: OrderStatus, to: OrderStatus) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn transaction_transition(from: TransactionStatus, to: TransactionStatus) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Text safe to hand back to the client.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(m)
            | AppError::Auth(m)
            | AppError::NotFound(m)
            | AppError::Conflict(m) => m.clone(),
            AppError::Gateway { message, .. } => message.clone(),
            AppError::PaymentVerification(_) => "payment could not be confirmed".to_string(),
            AppError::InvalidTransition { .. } => self.to_string(),
            AppError::Persistence(_) | AppError::Config(_) | AppError::Internal(_) => {
                "something went wrong".to_string()
            }
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        AppError::Gateway {
            message: e.user_message().to_string(),
            detail: e.to_string(),
        }
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(e: bcrypt::BcryptError) -> Self {
        AppError::Internal(format!("bcrypt: {e}"))
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Gateway { .. } | AppError::PaymentVerification(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition { .. } | AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Persistence(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            log::error!("responding with error: {self}");
        } else {
            log::warn!("request rejected: {self}");
        }

        HttpResponse::build(self.status_code()).json(json!({
            "error": true,
            "message": self.public_message(),
        }))
    }
}

pub type Result<T, E = AppError> = std::result::Result<T, E>;
