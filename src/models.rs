// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Lifecycle of a payment as recorded locally. Stored as `transactions.transaction_status_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending = 1,
    Succeeded = 2,
    Refunded = 3,
    Cancelled = 4,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Fulfillment state of an order. Stored as `orders.status_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending = 1,
    Fulfilled = 2,
    Refunded = 3,
    Cancelled = 4,
}

impl OrderStatus {
    /// Transitions accepted by a direct status update.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Fulfilled)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
                | (OrderStatus::Fulfilled, OrderStatus::Refunded)
        )
    }

    /// A refund may be issued against an order that has not already been
    /// refunded or cancelled.
    pub fn is_refundable(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Fulfilled)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Fulfilled => "fulfilled",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Product {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub inventory_level: i32,
    pub price: i64, // minor units
    pub image: String,
    pub is_recurring: bool,
    pub plan_id: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProductSummary {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Customer {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Transaction {
    pub id: i32,
    pub amount: i64,
    pub currency: String,
    pub last_four: String,
    pub expiry_month: i32,
    pub expiry_year: i32,
    pub payment_intent: String,
    pub payment_method: String,
    pub bank_return_code: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub amount: i64,
    pub currency: String,
    pub last_four: String,
    pub expiry_month: i32,
    pub expiry_year: i32,
    pub payment_intent: String,
    pub payment_method: String,
    pub bank_return_code: String,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Order {
    pub id: i32,
    pub product_id: i32,
    pub transaction_id: i32,
    pub customer_id: i32,
    pub status: OrderStatus,
    pub quantity: i32,
    pub amount: i64,
    /// Provider subscription id, only set for orders against a recurring product.
    pub subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub updated_at: DateTime<Utc>,
}

/// Order line written together with its transaction.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub product_id: i32,
    pub status: OrderStatus,
    pub quantity: i32,
    pub amount: i64,
    pub subscription_id: Option<String>,
}

/// An order joined with its product, transaction and customer.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Sale {
    #[serde(flatten)]
    pub order: Order,
    pub product: ProductSummary,
    pub transaction: Transaction,
    pub customer: Customer,
}

/// Ids produced (or found) by recording a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleRecord {
    pub customer_id: i32,
    pub transaction_id: i32,
    pub order_id: i32,
    /// false when the payment intent had already been recorded
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Page<T> {
    pub current_page: i64,
    pub page_size: i64,
    pub last_page: i64,
    pub total_records: i64,
    pub orders: Vec<T>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct User {
    pub id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

/// What the buyer sees after a successful payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Receipt {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub payment_intent: String,
    pub payment_method: String,
    pub amount: i64,
    pub currency: String,
    pub last_four: String,
    pub expiry_month: i32,
    pub expiry_year: i32,
    pub bank_return_code: String,
    pub transaction_id: i32,
    pub order_id: Option<i32>,
    pub subscription_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
