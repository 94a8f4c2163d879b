// src/checkout.rs
//
// Turns a client-confirmed payment into local records. Every provider call
// happens before the first write; the writes themselves are one unit of work.

use chrono::Utc;

use crate::api::stripe_client::{PaymentGateway, PaymentMethod};
use crate::db::Store;
use crate::errors::{AppError, Result};
use crate::models::{
    NewCustomer, NewOrder, NewTransaction, OrderStatus, Product, Receipt, SaleRecord,
    TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub payment_intent: String,
    pub payment_method: String,
    /// Client-claimed amount, only a fallback for display.
    pub amount: i64,
    pub currency: String,
    pub product_id: i32,
    pub quantity: i32,
}

impl CheckoutRequest {
    fn validate(&self) -> Result<()> {
        if self.payment_intent.trim().is_empty() {
            return Err(AppError::Validation("payment_intent is required".into()));
        }
        if self.payment_method.trim().is_empty() {
            return Err(AppError::Validation("payment_method is required".into()));
        }
        if self.amount < 0 {
            return Err(AppError::Validation("payment_amount must not be negative".into()));
        }
        if self.quantity < 1 {
            return Err(AppError::Validation("quantity must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub product_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub payment_method: String,
    pub currency: String,
}

/// Payment facts as reported by the provider, not by the client.
#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    pub payment_intent: String,
    pub payment_method: String,
    pub amount: i64,
    pub currency: String,
    pub last_four: String,
    pub expiry_month: i32,
    pub expiry_year: i32,
    pub card_brand: String,
    pub bank_return_code: String,
}

impl VerifiedPayment {
    pub fn to_transaction(&self) -> NewTransaction {
        NewTransaction {
            amount: self.amount,
            currency: self.currency.clone(),
            last_four: self.last_four.clone(),
            expiry_month: self.expiry_month,
            expiry_year: self.expiry_year,
            payment_intent: self.payment_intent.clone(),
            payment_method: self.payment_method.clone(),
            bank_return_code: self.bank_return_code.clone(),
            status: TransactionStatus::Succeeded,
        }
    }
}

struct CardFacts {
    last_four: String,
    expiry_month: i32,
    expiry_year: i32,
    brand: String,
}

fn card_facts(method: &PaymentMethod) -> Result<CardFacts> {
    let card = method.card.as_ref().ok_or_else(|| {
        AppError::PaymentVerification(format!("payment method {} has no card details", method.id))
    })?;
    Ok(CardFacts {
        last_four: card.last4.clone(),
        expiry_month: card.exp_month,
        expiry_year: card.exp_year,
        brand: card.brand.clone(),
    })
}

/// Re-fetches the intent and method from the provider.
pub async fn verify_payment(
    gateway: &dyn PaymentGateway,
    secret: &str,
    payment_intent: &str,
    payment_method: &str,
    claimed_amount: i64,
    claimed_currency: &str,
) -> Result<VerifiedPayment> {
    let intent = gateway
        .retrieve_payment_intent(secret, payment_intent)
        .await
        .map_err(|e| {
            log::error!("retrieve payment intent {payment_intent} failed: {e}");
            AppError::PaymentVerification(e.to_string())
        })?;

    if intent.status != "succeeded" {
        return Err(AppError::PaymentVerification(format!(
            "payment intent {} has status {:?}",
            intent.id, intent.status
        )));
    }

    let method = gateway
        .retrieve_payment_method(secret, payment_method)
        .await
        .map_err(|e| {
            log::error!("retrieve payment method {payment_method} failed: {e}");
            AppError::PaymentVerification(e.to_string())
        })?;
    let card = card_facts(&method)?;

    if claimed_amount != intent.amount {
        log::warn!(
            "claimed amount {claimed_amount} differs from provider amount {} for {}",
            intent.amount,
            intent.id
        );
    }

    let amount = if intent.amount > 0 {
        intent.amount
    } else {
        claimed_amount
    };
    let currency = if intent.currency.is_empty() {
        claimed_currency.to_lowercase()
    } else {
        intent.currency.clone()
    };

    Ok(VerifiedPayment {
        payment_intent: intent.id.clone(),
        payment_method: method.id.clone(),
        amount,
        currency,
        last_four: card.last_four,
        expiry_month: card.expiry_month,
        expiry_year: card.expiry_year,
        card_brand: card.brand,
        bank_return_code: intent.first_charge_id().unwrap_or_default().to_string(),
    })
}

/// The money has already moved when this runs; a failure here needs manual reconciliation.
async fn persist_sale(
    store: &dyn Store,
    customer: NewCustomer,
    transaction: NewTransaction,
    order: NewOrder,
) -> Result<SaleRecord> {
    let payment_intent = transaction.payment_intent.clone();
    let amount = transaction.amount;
    let currency = transaction.currency.clone();
    let email = customer.email.clone();

    store
        .record_sale(customer, transaction, order)
        .await
        .map_err(|e| {
            log::error!(
                "payment confirmed but not recorded: payment_intent={payment_intent} amount={amount} currency={currency} email={email} error={e}"
            );
            AppError::Persistence(e)
        })
}

async fn load_product(store: &dyn Store, product_id: i32) -> Result<Product> {
    store
        .get_product(product_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("product {product_id} not found")))
}

fn receipt(
    customer: &NewCustomer,
    payment: &VerifiedPayment,
    record: &SaleRecord,
    subscription_id: Option<String>,
) -> Receipt {
    Receipt {
        first_name: customer.first_name.clone(),
        last_name: customer.last_name.clone(),
        email: customer.email.clone(),
        payment_intent: payment.payment_intent.clone(),
        payment_method: payment.payment_method.clone(),
        amount: payment.amount,
        currency: payment.currency.clone(),
        last_four: payment.last_four.clone(),
        expiry_month: payment.expiry_month,
        expiry_year: payment.expiry_year,
        bank_return_code: payment.bank_return_code.clone(),
        transaction_id: record.transaction_id,
        order_id: Some(record.order_id),
        subscription_id,
        created_at: Utc::now(),
    }
}

/// Verifies a confirmed payment intent and records customer, transaction and
/// order. A payment intent that was already recorded yields the stored
/// receipt without touching the provider or the store again, but only to the
/// buyer who paid (same email and payment method).
///
/// Concurrent calls for one payment intent are serialised by a claim in the
/// store: the loser gets `Conflict` before any provider call is made.
pub async fn complete_checkout(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    req: CheckoutRequest,
) -> Result<Receipt> {
    req.validate()?;

    if let Some(existing) = store.find_receipt(&req.payment_intent).await? {
        return replayed(existing, &req);
    }

    if !store.claim_payment_intent(&req.payment_intent).await? {
        if let Some(existing) = store.find_receipt(&req.payment_intent).await? {
            return replayed(existing, &req);
        }
        log::warn!(
            "payment intent {} is already being settled by another request",
            req.payment_intent
        );
        return Err(AppError::Conflict(format!(
            "payment {} is already being processed",
            req.payment_intent
        )));
    }

    let (product, payment, subscription_id) = match prepare(gateway, store, secret, &req).await {
        Ok(Prepared::Recorded(existing)) => return replayed(existing, &req),
        Ok(Prepared::Verified {
            product,
            payment,
            subscription_id,
        }) => (product, payment, subscription_id),
        Err(e) => {
            release_claim(store, &req.payment_intent).await;
            return Err(e);
        }
    };

    let customer = NewCustomer {
        first_name: req.first_name,
        last_name: req.last_name,
        email: req.email,
    };
    let order = NewOrder {
        product_id: product.id,
        status: OrderStatus::Pending,
        quantity: req.quantity,
        amount: payment.amount,
        subscription_id: subscription_id.clone(),
    };

    // a failed write keeps the claim so the payment is not settled twice
    let record = persist_sale(store, customer.clone(), payment.to_transaction(), order).await?;
    log::info!(
        "checkout recorded payment_intent={} order_id={} transaction_id={}",
        payment.payment_intent,
        record.order_id,
        record.transaction_id
    );

    Ok(receipt(&customer, &payment, &record, subscription_id))
}

enum Prepared {
    Recorded(Receipt),
    Verified {
        product: Product,
        payment: VerifiedPayment,
        subscription_id: Option<String>,
    },
}

/// Everything up to the first write, run while holding the claim.
async fn prepare(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    req: &CheckoutRequest,
) -> Result<Prepared> {
    // another request may have finished between the lookup and the claim
    if let Some(existing) = store.find_receipt(&req.payment_intent).await? {
        return Ok(Prepared::Recorded(existing));
    }

    let product = load_product(store, req.product_id).await?;
    let payment = verify_payment(
        gateway,
        secret,
        &req.payment_intent,
        &req.payment_method,
        req.amount,
        &req.currency,
    )
    .await?;

    let subscription_id = if product.is_recurring {
        Some(subscribe(gateway, secret, &product, &req.email, &payment).await?)
    } else {
        None
    };

    Ok(Prepared::Verified {
        product,
        payment,
        subscription_id,
    })
}

fn replayed(existing: Receipt, req: &CheckoutRequest) -> Result<Receipt> {
    let same_buyer = existing.email.eq_ignore_ascii_case(req.email.trim())
        && existing.payment_method == req.payment_method;
    if !same_buyer {
        log::warn!(
            "payment intent {} replayed with different buyer details",
            req.payment_intent
        );
        return Err(AppError::Conflict(format!(
            "payment {} has already been recorded",
            req.payment_intent
        )));
    }
    log::info!(
        "payment intent {} already recorded, returning stored receipt",
        req.payment_intent
    );
    Ok(existing)
}

async fn release_claim(store: &dyn Store, payment_intent: &str) {
    if let Err(e) = store.release_payment_intent(payment_intent).await {
        log::warn!("could not release claim on payment intent {payment_intent}: {e}");
    }
}

async fn subscribe(
    gateway: &dyn PaymentGateway,
    secret: &str,
    product: &Product,
    email: &str,
    payment: &VerifiedPayment,
) -> Result<String> {
    let customer = gateway
        .create_customer(secret, &payment.payment_method, email)
        .await?;
    let sub = gateway
        .create_subscription(
            secret,
            &customer.id,
            &product.plan_id,
            &payment.last_four,
            &payment.card_brand,
        )
        .await?;
    Ok(sub.id)
}

/// Creates a provider customer, subscribes it to the product's plan and
/// records the initial invoice as a transaction + order.
pub async fn subscribe_to_plan(
    gateway: &dyn PaymentGateway,
    store: &dyn Store,
    secret: &str,
    req: SubscribeRequest,
) -> Result<Receipt> {
    if req.payment_method.trim().is_empty() {
        return Err(AppError::Validation("payment_method is required".into()));
    }
    if req.email.trim().is_empty() {
        return Err(AppError::Validation("email is required".into()));
    }

    let product = load_product(store, req.product_id).await?;
    if !product.is_recurring || product.plan_id.is_empty() {
        return Err(AppError::Validation(format!(
            "product {} is not a subscription plan",
            product.id
        )));
    }

    let method = gateway
        .retrieve_payment_method(secret, &req.payment_method)
        .await
        .map_err(|e| AppError::PaymentVerification(e.to_string()))?;
    let card = card_facts(&method)?;

    let customer = gateway
        .create_customer(secret, &method.id, &req.email)
        .await?;
    let sub = gateway
        .create_subscription(
            secret,
            &customer.id,
            &product.plan_id,
            &card.last_four,
            &card.brand,
        )
        .await?;

    let intent = sub.initial_payment_intent();
    let payment = VerifiedPayment {
        payment_intent: intent.map(|pi| pi.id.clone()).unwrap_or_else(|| sub.id.clone()),
        payment_method: method.id.clone(),
        amount: intent.map(|pi| pi.amount).unwrap_or(product.price),
        currency: intent
            .map(|pi| pi.currency.clone())
            .unwrap_or_else(|| req.currency.to_lowercase()),
        last_four: card.last_four,
        expiry_month: card.expiry_month,
        expiry_year: card.expiry_year,
        card_brand: card.brand,
        bank_return_code: intent
            .and_then(|pi| pi.first_charge_id())
            .unwrap_or_default()
            .to_string(),
    };

    let customer = NewCustomer {
        first_name: req.first_name,
        last_name: req.last_name,
        email: req.email,
    };
    let order = NewOrder {
        product_id: product.id,
        status: OrderStatus::Pending,
        quantity: 1,
        amount: payment.amount,
        subscription_id: Some(sub.id.clone()),
    };

    let record = persist_sale(store, customer.clone(), payment.to_transaction(), order).await?;
    log::info!(
        "subscription {} recorded order_id={} transaction_id={}",
        sub.id,
        record.order_id,
        record.transaction_id
    );

    Ok(receipt(&customer, &payment, &record, Some(sub.id)))
}
