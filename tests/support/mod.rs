#![allow(dead_code)]

use actix::{Actor, Addr};
use actix_web::web;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::PgPool;
use std::env;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use maize_shop::AppState;
use maize_shop::api::stripe_client::{
    CardDetails, Charge, ChargeList, Customer as GatewayCustomer, Expandable, GatewayError,
    Invoice, PaymentGateway, PaymentIntent, PaymentMethod, Refund, Subscription,
};
use maize_shop::db::{Store, StoreError};
use maize_shop::mailer::{MailMessage, Mailer};
use maize_shop::models::{
    Customer, NewCustomer, NewOrder, NewTransaction, NewUser, Order, OrderStatus, Product,
    ProductSummary, Receipt, Sale, SaleRecord, Transaction, TransactionStatus, User,
};
use maize_shop::tokens::{Token, TokenScope};
use maize_shop::ws::WsHub;

pub const ONE_TIME_PRODUCT: i32 = 1;
pub const PLAN_PRODUCT: i32 = 2;
pub const PLAN_ID: &str = "price_bronze";

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

struct StoredToken {
    hash: Vec<u8>,
    user_id: i32,
    scope: TokenScope,
    expiry: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    products: Vec<Product>,
    customers: Vec<Customer>,
    transactions: Vec<Transaction>,
    orders: Vec<Order>,
    users: Vec<User>,
    tokens: Vec<StoredToken>,
    claims: Vec<String>,
    writes: usize,
    clock: i64,
    fail_writes: bool,
}

impl Inner {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::seconds(self.clock)
    }

    fn sale(&self, order: &Order) -> Option<Sale> {
        let product = self.products.iter().find(|p| p.id == order.product_id)?;
        let transaction = self
            .transactions
            .iter()
            .find(|t| t.id == order.transaction_id)?;
        let customer = self.customers.iter().find(|c| c.id == order.customer_id)?;
        Some(Sale {
            order: order.clone(),
            product: ProductSummary {
                id: product.id,
                name: product.name.clone(),
            },
            transaction: transaction.clone(),
            customer: customer.clone(),
        })
    }

    fn insert_transaction(&mut self, t: NewTransaction) -> Transaction {
        let now = self.tick();
        let txn = Transaction {
            id: self.transactions.len() as i32 + 1,
            amount: t.amount,
            currency: t.currency,
            last_four: t.last_four,
            expiry_month: t.expiry_month,
            expiry_year: t.expiry_year,
            payment_intent: t.payment_intent,
            payment_method: t.payment_method,
            bank_return_code: t.bank_return_code,
            status: t.status,
            created_at: now,
            updated_at: now,
        };
        self.transactions.push(txn.clone());
        self.writes += 1;
        txn
    }

    fn upsert_customer(&mut self, c: NewCustomer) -> i32 {
        let email = c.email.to_lowercase();
        let now = self.tick();
        self.writes += 1;
        if let Some(existing) = self.customers.iter_mut().find(|x| x.email == email) {
            existing.first_name = c.first_name;
            existing.last_name = c.last_name;
            existing.updated_at = now;
            return existing.id;
        }
        let id = self.customers.len() as i32 + 1;
        self.customers.push(Customer {
            id,
            first_name: c.first_name,
            last_name: c.last_name,
            email,
            created_at: now,
            updated_at: now,
        });
        id
    }

    fn insert_order(&mut self, o: NewOrder, transaction_id: i32, customer_id: i32) -> i32 {
        let now = self.tick();
        let id = self.orders.len() as i32 + 1;
        self.orders.push(Order {
            id,
            product_id: o.product_id,
            transaction_id,
            customer_id,
            status: o.status,
            quantity: o.quantity,
            amount: o.amount,
            subscription_id: o.subscription_id,
            created_at: now,
            updated_at: now,
        });
        self.writes += 1;
        id
    }
}

/// `Store` backed by vectors, with a write counter for asserting side effects.
#[derive(Default)]
pub struct MemoryStore {
    inner: StdMutex<Inner>,
}

fn product(id: i32, name: &str, price: i64, is_recurring: bool, plan_id: &str) -> Product {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    Product {
        id,
        name: name.to_string(),
        description: String::new(),
        inventory_level: 10,
        price,
        image: String::new(),
        is_recurring,
        plan_id: plan_id.to_string(),
        created_at: at,
        updated_at: at,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.lock().unwrap();
            inner.products.push(product(ONE_TIME_PRODUCT, "Heirloom Maize", 1000, false, ""));
            inner.products.push(product(PLAN_PRODUCT, "Bronze Plan", 2000, true, PLAN_ID));
        }
        store
    }

    pub fn is_claimed(&self, payment_intent: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .claims
            .iter()
            .any(|c| c == payment_intent)
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_writes = fail;
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.inner.lock().unwrap().transactions.clone()
    }

    pub fn orders(&self) -> Vec<Order> {
        self.inner.lock().unwrap().orders.clone()
    }

    pub fn customers(&self) -> Vec<Customer> {
        self.inner.lock().unwrap().customers.clone()
    }

    pub fn order(&self, id: i32) -> Order {
        self.orders().into_iter().find(|o| o.id == id).expect("order")
    }

    pub fn transaction(&self, id: i32) -> Transaction {
        self.transactions()
            .into_iter()
            .find(|t| t.id == id)
            .expect("transaction")
    }

    /// Records `count` paid orders for `product_id`, oldest first. Returns their ids.
    pub fn seed_orders(&self, count: usize, product_id: i32, subscription: bool) -> Vec<i32> {
        let mut inner = self.inner.lock().unwrap();
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let n = inner.transactions.len() + 1;
            let txn = inner.insert_transaction(NewTransaction {
                amount: 1000,
                currency: "usd".into(),
                last_four: "4242".into(),
                expiry_month: 12,
                expiry_year: 2030,
                payment_intent: format!("pi_seed_{n}"),
                payment_method: format!("pm_seed_{n}"),
                bank_return_code: format!("ch_seed_{n}"),
                status: TransactionStatus::Succeeded,
            });
            let customer_id = inner.upsert_customer(NewCustomer {
                first_name: "Seed".into(),
                last_name: format!("Buyer{n}"),
                email: format!("seed{n}@example.com"),
            });
            let order_id = inner.insert_order(
                NewOrder {
                    product_id,
                    status: OrderStatus::Pending,
                    quantity: 1,
                    amount: 1000,
                    subscription_id: subscription.then(|| format!("sub_seed_{n}")),
                },
                txn.id,
                customer_id,
            );
            ids.push(order_id);
        }
        ids
    }

    pub fn add_admin(&self, email: &str, password: &str) -> User {
        let hash = bcrypt::hash(password, 4).unwrap();
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        let user = User {
            id: inner.users.len() as i32 + 1,
            first_name: "Admin".into(),
            last_name: "User".into(),
            email: email.to_string(),
            password_hash: hash,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        user
    }

    pub fn user_by_id(&self, id: i32) -> Option<User> {
        self.inner
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
    }

    /// Issues an authentication token the way `/api/authenticate` does.
    pub fn issue_token(&self, user: &User) -> String {
        let token = Token::generate(user.id, TokenScope::Authentication);
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.retain(|t| t.user_id != user.id);
        inner.tokens.push(StoredToken {
            hash: token.hash.clone(),
            user_id: user.id,
            scope: token.scope,
            expiry: token.expiry,
        });
        token.plaintext
    }

    pub fn token_count(&self, user_id: i32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id)
            .count()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.inner.lock().unwrap().fail_writes {
            return Err(StoreError::Timeout(Duration::from_secs(3)));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .products
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn find_receipt(&self, payment_intent: &str) -> Result<Option<Receipt>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(t) = inner
            .transactions
            .iter()
            .find(|t| t.payment_intent == payment_intent)
        else {
            return Ok(None);
        };
        let order = inner.orders.iter().find(|o| o.transaction_id == t.id);
        let customer =
            order.and_then(|o| inner.customers.iter().find(|c| c.id == o.customer_id));

        Ok(Some(Receipt {
            first_name: customer.map(|c| c.first_name.clone()).unwrap_or_default(),
            last_name: customer.map(|c| c.last_name.clone()).unwrap_or_default(),
            email: customer.map(|c| c.email.clone()).unwrap_or_default(),
            payment_intent: t.payment_intent.clone(),
            payment_method: t.payment_method.clone(),
            amount: t.amount,
            currency: t.currency.clone(),
            last_four: t.last_four.clone(),
            expiry_month: t.expiry_month,
            expiry_year: t.expiry_year,
            bank_return_code: t.bank_return_code.clone(),
            transaction_id: t.id,
            order_id: order.map(|o| o.id),
            subscription_id: order.and_then(|o| o.subscription_id.clone()),
            created_at: t.created_at,
        }))
    }

    async fn claim_payment_intent(&self, payment_intent: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.claims.iter().any(|c| c == payment_intent) {
            return Ok(false);
        }
        inner.claims.push(payment_intent.to_string());
        Ok(true)
    }

    async fn release_payment_intent(&self, payment_intent: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .claims
            .retain(|c| c != payment_intent);
        Ok(())
    }

    async fn record_sale(
        &self,
        customer: NewCustomer,
        transaction: NewTransaction,
        order: NewOrder,
    ) -> Result<SaleRecord, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();

        if let Some(t) = inner
            .transactions
            .iter()
            .find(|t| t.payment_intent == transaction.payment_intent)
        {
            let o = inner
                .orders
                .iter()
                .find(|o| o.transaction_id == t.id)
                .ok_or_else(|| StoreError::Duplicate(transaction.payment_intent.clone()))?;
            return Ok(SaleRecord {
                customer_id: o.customer_id,
                transaction_id: t.id,
                order_id: o.id,
                created: false,
            });
        }

        let txn = inner.insert_transaction(transaction);
        let customer_id = inner.upsert_customer(customer);
        let order_id = inner.insert_order(order, txn.id, customer_id);

        Ok(SaleRecord {
            customer_id,
            transaction_id: txn.id,
            order_id,
            created: true,
        })
    }

    async fn record_transaction(
        &self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(t) = inner
            .transactions
            .iter()
            .find(|t| t.payment_intent == transaction.payment_intent)
        {
            return Ok(t.clone());
        }
        Ok(inner.insert_transaction(transaction))
    }

    async fn sales_paginated(
        &self,
        recurring: bool,
        page_size: i64,
        page: i64,
    ) -> Result<(Vec<Sale>, i64), StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut matching: Vec<&Order> = inner
            .orders
            .iter()
            .filter(|o| {
                inner
                    .products
                    .iter()
                    .any(|p| p.id == o.product_id && p.is_recurring == recurring)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as i64;
        let offset = ((page - 1) * page_size) as usize;
        let rows = matching
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .filter_map(|o| inner.sale(o))
            .collect();
        Ok((rows, total))
    }

    async fn get_sale(&self, order_id: i32) -> Result<Option<Sale>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .and_then(|o| inner.sale(o)))
    }

    async fn update_order_status(
        &self,
        order_id: i32,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.writes += 1;
        if let Some(o) = inner.orders.iter_mut().find(|o| o.id == order_id) {
            o.status = status;
        }
        Ok(())
    }

    async fn mark_refunded(&self, order_id: i32, transaction_id: i32) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.writes += 1;
        if let Some(t) = inner.transactions.iter_mut().find(|t| t.id == transaction_id) {
            t.status = TransactionStatus::Refunded;
        }
        if let Some(o) = inner.orders.iter_mut().find(|o| o.id == order_id) {
            o.status = OrderStatus::Refunded;
        }
        Ok(())
    }

    async fn all_users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.clone())
    }

    async fn get_user(&self, id: i32) -> Result<Option<User>, StoreError> {
        Ok(self.user_by_id(id))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn add_user(&self, user: NewUser, password_hash: &str) -> Result<i32, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Duplicate(format!("{} already exists", user.email)));
        }
        let now = inner.tick();
        let id = inner.users.iter().map(|u| u.id).max().unwrap_or(0) + 1;
        inner.users.push(User {
            id,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            password_hash: password_hash.to_string(),
            created_at: now,
            updated_at: now,
        });
        inner.writes += 1;
        Ok(id)
    }

    async fn edit_user(&self, id: i32, user: NewUser) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let now = inner.tick();
        if let Some(u) = inner.users.iter_mut().find(|u| u.id == id) {
            u.first_name = user.first_name;
            u.last_name = user.last_name;
            u.email = user.email;
            u.updated_at = now;
        }
        inner.writes += 1;
        Ok(())
    }

    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        if let Some(u) = inner.users.iter_mut().find(|u| u.id == id) {
            u.password_hash = password_hash.to_string();
        }
        inner.writes += 1;
        Ok(())
    }

    async fn delete_user(&self, id: i32) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.users.len();
        inner.users.retain(|u| u.id != id);
        inner.tokens.retain(|t| t.user_id != id);
        inner.writes += 1;
        Ok(inner.users.len() < before)
    }

    async fn replace_token(&self, token: &Token, user: &User) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.retain(|t| t.user_id != user.id);
        inner.tokens.push(StoredToken {
            hash: token.hash.clone(),
            user_id: user.id,
            scope: token.scope,
            expiry: token.expiry,
        });
        inner.writes += 1;
        Ok(())
    }

    async fn user_for_token(
        &self,
        token_hash: &[u8],
        scope: TokenScope,
    ) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let user_id = inner
            .tokens
            .iter()
            .find(|t| t.hash == token_hash && t.scope == scope && t.expiry > now)
            .map(|t| t.user_id);
        Ok(user_id.and_then(|id| inner.users.iter().find(|u| u.id == id).cloned()))
    }

    async fn delete_tokens_for_user(&self, user_id: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens.retain(|t| t.user_id != user_id);
        inner.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted payment gateway
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    intents: Vec<PaymentIntent>,
    methods: Vec<PaymentMethod>,
    fail_retrievals: bool,
    yield_on_retrieval: bool,
    refund_error: Option<String>,
    calls: Vec<String>,
}

/// Answers from a fixed script and records every call by operation name.
#[derive(Default)]
pub struct ScriptedGateway {
    script: StdMutex<Script>,
}

pub const SUBSCRIPTION_ID: &str = "sub_1";
pub const SUBSCRIPTION_INTENT: &str = "pi_sub_1";

fn declined(code: &str) -> GatewayError {
    GatewayError::Api {
        status: 402,
        code: Some(code.to_string()),
        message: format!("provider said {code}"),
    }
}

impl ScriptedGateway {
    pub fn new() -> Self {
        let gw = Self::default();
        gw.add_method("pm_card", "4242");
        gw
    }

    pub fn add_method(&self, id: &str, last4: &str) {
        self.script.lock().unwrap().methods.push(PaymentMethod {
            id: id.to_string(),
            card: Some(CardDetails {
                brand: "visa".into(),
                last4: last4.to_string(),
                exp_month: 12,
                exp_year: 2030,
            }),
        });
    }

    /// A succeeded intent paid with `pm_card`.
    pub fn with_payment(&self, payment_intent: &str, amount: i64, currency: &str) {
        self.script.lock().unwrap().intents.push(PaymentIntent {
            id: payment_intent.to_string(),
            amount,
            currency: currency.to_string(),
            status: "succeeded".into(),
            client_secret: None,
            latest_charge: None,
            charges: Some(ChargeList {
                data: vec![Charge {
                    id: format!("ch_{payment_intent}"),
                }],
            }),
        });
    }

    pub fn with_unconfirmed_payment(&self, payment_intent: &str, amount: i64) {
        self.script.lock().unwrap().intents.push(PaymentIntent {
            id: payment_intent.to_string(),
            amount,
            currency: "usd".into(),
            status: "requires_payment_method".into(),
            client_secret: None,
            latest_charge: None,
            charges: None,
        });
    }

    pub fn fail_retrievals(&self) {
        self.script.lock().unwrap().fail_retrievals = true;
    }

    /// Makes intent retrieval suspend once, so concurrent checkouts interleave.
    pub fn yield_on_retrieval(&self) {
        self.script.lock().unwrap().yield_on_retrieval = true;
    }

    pub fn decline_refunds(&self, code: &str) {
        self.script.lock().unwrap().refund_error = Some(code.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == op).count()
    }

    fn record(&self, op: &str) {
        self.script.lock().unwrap().calls.push(op.to_string());
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_payment_intent(
        &self,
        _secret: &str,
        currency: &str,
        amount: i64,
    ) -> Result<PaymentIntent, GatewayError> {
        self.record("create_payment_intent");
        Ok(PaymentIntent {
            id: "pi_new".into(),
            amount,
            currency: currency.to_string(),
            status: "requires_payment_method".into(),
            client_secret: Some("pi_new_secret".into()),
            latest_charge: None,
            charges: None,
        })
    }

    async fn retrieve_payment_intent(
        &self,
        _secret: &str,
        id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        self.record("retrieve_payment_intent");
        let suspend = self.script.lock().unwrap().yield_on_retrieval;
        if suspend {
            tokio::task::yield_now().await;
        }
        let script = self.script.lock().unwrap();
        if script.fail_retrievals {
            return Err(declined("resource_missing"));
        }
        script
            .intents
            .iter()
            .find(|pi| pi.id == id)
            .cloned()
            .ok_or_else(|| declined("resource_missing"))
    }

    async fn retrieve_payment_method(
        &self,
        _secret: &str,
        id: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        self.record("retrieve_payment_method");
        let script = self.script.lock().unwrap();
        if script.fail_retrievals {
            return Err(declined("resource_missing"));
        }
        script
            .methods
            .iter()
            .find(|pm| pm.id == id)
            .cloned()
            .ok_or_else(|| declined("resource_missing"))
    }

    async fn create_customer(
        &self,
        _secret: &str,
        _payment_method: &str,
        email: &str,
    ) -> Result<GatewayCustomer, GatewayError> {
        self.record("create_customer");
        Ok(GatewayCustomer {
            id: "cus_1".into(),
            email: Some(email.to_string()),
        })
    }

    async fn create_subscription(
        &self,
        _secret: &str,
        _customer_id: &str,
        _plan: &str,
        _last_four: &str,
        _card_type: &str,
    ) -> Result<Subscription, GatewayError> {
        self.record("create_subscription");
        Ok(Subscription {
            id: SUBSCRIPTION_ID.into(),
            status: "active".into(),
            cancel_at_period_end: false,
            latest_invoice: Some(Expandable::Object(Box::new(Invoice {
                id: "in_1".into(),
                payment_intent: Some(Expandable::Object(Box::new(PaymentIntent {
                    id: SUBSCRIPTION_INTENT.into(),
                    amount: 2000,
                    currency: "usd".into(),
                    status: "succeeded".into(),
                    client_secret: None,
                    latest_charge: Some("ch_sub_1".into()),
                    charges: None,
                }))),
            }))),
        })
    }

    async fn refund(
        &self,
        _secret: &str,
        _payment_intent: &str,
        amount: i64,
    ) -> Result<Refund, GatewayError> {
        self.record("refund");
        if let Some(code) = self.script.lock().unwrap().refund_error.clone() {
            return Err(declined(&code));
        }
        Ok(Refund {
            id: "re_1".into(),
            amount,
            status: "succeeded".into(),
        })
    }

    async fn cancel_subscription(
        &self,
        _secret: &str,
        subscription_id: &str,
    ) -> Result<Subscription, GatewayError> {
        self.record("cancel_subscription");
        Ok(Subscription {
            id: subscription_id.to_string(),
            status: "active".into(),
            cancel_at_period_end: true,
            latest_invoice: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CapturingMailer {
    sent: StdMutex<Vec<MailMessage>>,
}

impl CapturingMailer {
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, msg: MailMessage) -> Result<(), String> {
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }
}

/// Pulls the plaintext token out of a password-reset mail.
pub fn reset_token_from(mail: &MailMessage) -> String {
    let start = mail.body.find("token=").expect("token in mail") + "token=".len();
    mail.body[start..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect()
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub mailer: Arc<CapturingMailer>,
    pub hub: Addr<WsHub>,
}

impl Fixture {
    /// Must be called inside an actix system (`#[actix_web::test]`).
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            gateway: Arc::new(ScriptedGateway::new()),
            mailer: Arc::new(CapturingMailer::default()),
            hub: WsHub::new().start(),
        }
    }

    pub fn state(&self) -> web::Data<AppState> {
        web::Data::new(AppState {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            mailer: self.mailer.clone(),
            ws_hub: self.hub.clone(),
            stripe_secret: "sk_test_maize".into(),
            frontend_url: "http://localhost:4000".into(),
        })
    }

    pub fn admin_token(&self) -> String {
        let admin = self.store.add_admin("admin@example.com", "password");
        self.store.issue_token(&admin)
    }
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

fn split_db_url(url: &str) -> Result<(String, String), String> {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base.to_string(), Some(query)),
        None => (url.to_string(), None),
    };

    let db_start = base
        .rfind('/')
        .ok_or_else(|| "invalid database url".to_string())?;
    if db_start + 1 >= base.len() {
        return Err("database name is empty".to_string());
    }

    let db_name = base[db_start + 1..].to_string();
    let mut admin_url = format!("{}postgres", &base[..db_start + 1]);
    if let Some(query) = query {
        admin_url = format!("{admin_url}?{query}");
    }

    Ok((admin_url, db_name))
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

static TEST_DB_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

pub struct TestDb {
    pub pool: PgPool,
    _guard: MutexGuard<'static, ()>,
}

/// Fresh, migrated database, or `None` when `TEST_DATABASE_URL` is not set.
pub async fn init_test_db() -> Option<TestDb> {
    dotenvy::dotenv().ok();
    let Ok(test_url) = env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };
    let (admin_url, db_name) = split_db_url(&test_url).expect("invalid TEST_DATABASE_URL format");

    let lock = TEST_DB_LOCK.get_or_init(|| Mutex::new(()));
    let guard = lock.lock().await;

    let admin_pool = PgPool::connect(&admin_url).await.expect("connect admin db");

    let quoted_name = quote_identifier(&db_name);
    let drop_sql = format!("DROP DATABASE IF EXISTS {quoted_name} WITH (FORCE)");
    let create_sql = format!("CREATE DATABASE {quoted_name}");

    let _ = sqlx::query(&drop_sql).execute(&admin_pool).await;
    sqlx::query(&create_sql)
        .execute(&admin_pool)
        .await
        .expect("create test db");
    admin_pool.close().await;

    let pool = PgPool::connect(&test_url).await.expect("connect test db");
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(TestDb {
        pool,
        _guard: guard,
    })
}
