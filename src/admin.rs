// src/admin.rs
//
// Back-office mutations over existing orders, subscriptions and users.
// Provider calls come first; local state only changes after they succeed.

use crate::api::stripe_client::PaymentGateway;
use crate::checkout::verify_payment;
use crate::db::{Store, StoreError};
use crate::errors::{AppError, Result};
use crate::models::{
    NewTransaction, NewUser, OrderStatus, Page, Sale, Transaction, TransactionStatus, User,
};

#[derive(Debug, Clone)]
pub struct TerminalPayment {
    pub payment_intent: String,
    pub payment_method: String,
    pub amount: i64,
    pub currency: String,
}

/// Records a card payment taken through the admin virtual terminal.
/// Only a transaction is written; there is no customer or order.
pub async fn virtual_terminal_succeeded(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    payment: TerminalPayment,
) -> Result<Transaction> {
    if payment.payment_intent.trim().is_empty() || payment.payment_method.trim().is_empty() {
        return Err(AppError::Validation(
            "payment_intent and payment_method are required".into(),
        ));
    }
    if payment.amount < 0 {
        return Err(AppError::Validation("amount must not be negative".into()));
    }

    let verified = verify_payment(
        gateway,
        secret,
        &payment.payment_intent,
        &payment.payment_method,
        payment.amount,
        &payment.currency,
    )
    .await?;

    let txn: NewTransaction = verified.to_transaction();
    store.record_transaction(txn).await.map_err(|e| {
        log::error!(
            "terminal payment confirmed but not recorded: payment_intent={} amount={} error={e}",
            verified.payment_intent,
            verified.amount
        );
        AppError::Persistence(e)
    })
}

/// One page of orders, one-time sales when `recurring` is false and
/// subscriptions when it is true.
pub async fn list_sales(
    store: &dyn Store,
    recurring: bool,
    page_size: i64,
    page: i64,
) -> Result<Page<Sale>> {
    if page_size < 1 {
        return Err(AppError::Validation("page_size must be at least 1".into()));
    }
    if page < 1 {
        return Err(AppError::Validation("page must be at least 1".into()));
    }

    let (orders, total_records) = store.sales_paginated(recurring, page_size, page).await?;

    Ok(Page {
        current_page: page,
        page_size,
        // a trailing partial page is not counted
        last_page: total_records / page_size,
        total_records,
        orders,
    })
}

pub async fn get_sale(store: &dyn Store, order_id: i32) -> Result<Sale> {
    store
        .get_sale(order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("order {order_id} not found")))
}

/// Refunds `amount` minor units (the full order amount when `None`) and marks
/// the transaction and order refunded. An already refunded sale is rejected
/// before the provider is called.
pub async fn refund_payment(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    order_id: i32,
    amount: Option<i64>,
) -> Result<Sale> {
    let sale = get_sale(store, order_id).await?;

    if sale.transaction.status != TransactionStatus::Succeeded {
        return Err(AppError::transaction_transition(
            sale.transaction.status,
            TransactionStatus::Refunded,
        ));
    }
    if !sale.order.status.is_refundable() {
        return Err(AppError::order_transition(
            sale.order.status,
            OrderStatus::Refunded,
        ));
    }

    let amount = amount.unwrap_or(sale.transaction.amount);
    if amount <= 0 || amount > sale.transaction.amount {
        return Err(AppError::Validation(format!(
            "refund amount must be between 1 and {}",
            sale.transaction.amount
        )));
    }

    let refund = gateway
        .refund(secret, &sale.transaction.payment_intent, amount)
        .await?;
    log::info!(
        "refund {} issued for order {} payment_intent={} amount={}",
        refund.id,
        order_id,
        sale.transaction.payment_intent,
        amount
    );

    store
        .mark_refunded(sale.order.id, sale.transaction.id)
        .await
        .map_err(|e| {
            log::error!(
                "refund {} issued but not recorded for order {order_id}: {e}",
                refund.id
            );
            AppError::Persistence(e)
        })?;

    get_sale(store, order_id).await
}

/// Cancels the provider subscription at period end and marks the order
/// cancelled. Access is not revoked here.
pub async fn cancel_subscription(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    order_id: i32,
) -> Result<Sale> {
    let sale = get_sale(store, order_id).await?;

    let Some(subscription_id) = sale.order.subscription_id.clone() else {
        return Err(AppError::Validation(format!(
            "order {order_id} is not a subscription"
        )));
    };
    if !matches!(sale.order.status, OrderStatus::Pending | OrderStatus::Fulfilled) {
        return Err(AppError::order_transition(
            sale.order.status,
            OrderStatus::Cancelled,
        ));
    }

    let sub = gateway
        .cancel_subscription(secret, &subscription_id)
        .await?;
    log::info!(
        "subscription {} set to cancel at period end (order {order_id})",
        sub.id
    );

    store
        .update_order_status(order_id, OrderStatus::Cancelled)
        .await
        .map_err(|e| {
            log::error!(
                "subscription {subscription_id} cancelled but not recorded for order {order_id}: {e}"
            );
            AppError::Persistence(e)
        })?;

    get_sale(store, order_id).await
}

/// Direct status change with no provider call.
pub async fn update_order_status(
    store: &dyn Store,
    order_id: i32,
    next: OrderStatus,
) -> Result<Sale> {
    let sale = get_sale(store, order_id).await?;
    if !sale.order.status.can_transition_to(next) {
        return Err(AppError::order_transition(sale.order.status, next));
    }

    store.update_order_status(order_id, next).await?;
    get_sale(store, order_id).await
}

pub async fn all_users(store: &dyn Store) -> Result<Vec<User>> {
    Ok(store.all_users().await?)
}

pub async fn get_user(store: &dyn Store, id: i32) -> Result<User> {
    store
        .get_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {id} not found")))
}

#[derive(Debug, Clone)]
pub struct UserForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

/// Edits user `id`, or creates a new user when `id` is 0. A non-empty
/// password replaces the stored hash.
pub async fn save_user(store: &dyn Store, id: i32, form: UserForm) -> Result<i32> {
    if form.email.trim().is_empty() {
        return Err(AppError::Validation("email is required".into()));
    }

    let user = NewUser {
        first_name: form.first_name,
        last_name: form.last_name,
        email: form.email.trim().to_string(),
    };

    if id > 0 {
        get_user(store, id).await?;
        store.edit_user(id, user).await.map_err(conflict_on_duplicate)?;
        if !form.password.is_empty() {
            let hash = bcrypt::hash(&form.password, bcrypt::DEFAULT_COST)?;
            store.update_password(id, &hash).await?;
        }
        return Ok(id);
    }

    if form.password.is_empty() {
        return Err(AppError::Validation("password is required for a new user".into()));
    }
    let hash = bcrypt::hash(&form.password, bcrypt::DEFAULT_COST)?;
    store.add_user(user, &hash).await.map_err(conflict_on_duplicate)
}

fn conflict_on_duplicate(e: StoreError) -> AppError {
    match e {
        StoreError::Duplicate(msg) => AppError::Conflict(msg),
        other => AppError::Persistence(other),
    }
}

pub async fn delete_user(store: &dyn Store, id: i32) -> Result<()> {
    if !store.delete_user(id).await? {
        return Err(AppError::NotFound(format!("user {id} not found")));
    }
    Ok(())
}
