// src/db.rs

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::models::{
    Customer, NewCustomer, NewOrder, NewTransaction, NewUser, Order, OrderStatus, Product,
    ProductSummary, Receipt, Sale, SaleRecord, Transaction, TransactionStatus, User,
};
use crate::tokens::{Token, TokenScope};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Duplicate(String),
}

/// Persistence layer used by the checkout and admin flows.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError>;

    /// Receipt for an already recorded payment intent, if any.
    async fn find_receipt(&self, payment_intent: &str) -> Result<Option<Receipt>, StoreError>;

    /// Takes the exclusive right to settle a payment intent. Returns false
    /// while another request holds an unexpired claim on it.
    async fn claim_payment_intent(&self, payment_intent: &str) -> Result<bool, StoreError>;

    /// Gives a claim back after a failure that happened before any provider mutation.
    async fn release_payment_intent(&self, payment_intent: &str) -> Result<(), StoreError>;

    /// Writes customer, transaction and order as one unit of work.
    /// Replaying a known payment intent returns the stored ids with `created = false`.
    async fn record_sale(
        &self,
        customer: NewCustomer,
        transaction: NewTransaction,
        order: NewOrder,
    ) -> Result<SaleRecord, StoreError>;

    /// Writes a standalone transaction (virtual terminal). Idempotent on the payment intent.
    async fn record_transaction(&self, transaction: NewTransaction)
    -> Result<Transaction, StoreError>;

    async fn sales_paginated(
        &self,
        recurring: bool,
        page_size: i64,
        page: i64,
    ) -> Result<(Vec<Sale>, i64), StoreError>;

    async fn get_sale(&self, order_id: i32) -> Result<Option<Sale>, StoreError>;

    async fn update_order_status(&self, order_id: i32, status: OrderStatus)
    -> Result<(), StoreError>;

    /// Marks both the transaction and its order refunded, atomically.
    async fn mark_refunded(&self, order_id: i32, transaction_id: i32) -> Result<(), StoreError>;

    async fn all_users(&self) -> Result<Vec<User>, StoreError>;
    async fn get_user(&self, id: i32) -> Result<Option<User>, StoreError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn add_user(&self, user: NewUser, password_hash: &str) -> Result<i32, StoreError>;
    async fn edit_user(&self, id: i32, user: NewUser) -> Result<(), StoreError>;
    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), StoreError>;
    /// Returns false when no such user existed.
    async fn delete_user(&self, id: i32) -> Result<bool, StoreError>;

    /// Drops every token held by the user, then stores the new one.
    async fn replace_token(&self, token: &Token, user: &User) -> Result<(), StoreError>;
    async fn user_for_token(
        &self,
        token_hash: &[u8],
        scope: TokenScope,
    ) -> Result<Option<User>, StoreError>;
    async fn delete_tokens_for_user(&self, user_id: i32) -> Result<(), StoreError>;
}

pub async fn connect(dsn: &str, timeout: Duration) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(timeout)
        .connect(dsn)
        .await
}

/// A checkout claim older than this is considered abandoned and can be taken over.
const CLAIM_TTL_SECS: u64 = 600;

const SALE_SELECT: &str = r#"
    SELECT o.id, o.product_id, o.transaction_id, o.customer_id, o.status_id,
           o.quantity, o.amount, o.subscription_id, o.created_at, o.updated_at,
           p.name AS product_name,
           t.amount AS t_amount, t.currency, t.last_four, t.expiry_month, t.expiry_year,
           t.payment_intent, t.payment_method, t.bank_return_code, t.transaction_status_id,
           t.created_at AS t_created_at, t.updated_at AS t_updated_at,
           c.first_name, c.last_name, c.email,
           c.created_at AS c_created_at, c.updated_at AS c_updated_at
    FROM orders o
    JOIN products p ON p.id = o.product_id
    JOIN transactions t ON t.id = o.transaction_id
    JOIN customers c ON c.id = o.customer_id"#;

fn sale_from_row(r: &PgRow) -> Sale {
    Sale {
        order: Order {
            id: r.get("id"),
            product_id: r.get("product_id"),
            transaction_id: r.get("transaction_id"),
            customer_id: r.get("customer_id"),
            status: r.get("status_id"),
            quantity: r.get("quantity"),
            amount: r.get("amount"),
            subscription_id: r.get("subscription_id"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        },
        product: ProductSummary {
            id: r.get("product_id"),
            name: r.get("product_name"),
        },
        transaction: Transaction {
            id: r.get("transaction_id"),
            amount: r.get("t_amount"),
            currency: r.get("currency"),
            last_four: r.get("last_four"),
            expiry_month: r.get("expiry_month"),
            expiry_year: r.get("expiry_year"),
            payment_intent: r.get("payment_intent"),
            payment_method: r.get("payment_method"),
            bank_return_code: r.get("bank_return_code"),
            status: r.get("transaction_status_id"),
            created_at: r.get("t_created_at"),
            updated_at: r.get("t_updated_at"),
        },
        customer: Customer {
            id: r.get("customer_id"),
            first_name: r.get("first_name"),
            last_name: r.get("last_name"),
            email: r.get("email"),
            created_at: r.get("c_created_at"),
            updated_at: r.get("c_updated_at"),
        },
    }
}

fn transaction_from_row(r: &PgRow) -> Transaction {
    Transaction {
        id: r.get("id"),
        amount: r.get("amount"),
        currency: r.get("currency"),
        last_four: r.get("last_four"),
        expiry_month: r.get("expiry_month"),
        expiry_year: r.get("expiry_year"),
        payment_intent: r.get("payment_intent"),
        payment_method: r.get("payment_method"),
        bank_return_code: r.get("bank_return_code"),
        status: r.get("transaction_status_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn user_from_row(r: &PgRow) -> User {
    User {
        id: r.get("id"),
        first_name: r.get("first_name"),
        last_name: r.get("last_name"),
        email: r.get("email"),
        password_hash: r.get("password"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn duplicate_email(e: sqlx::Error, email: &str) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Duplicate(format!("a user with email {email} already exists"))
        }
        _ => StoreError::Database(e),
    }
}

/// Postgres-backed store. Every call is bounded by `timeout`; a call that
/// times out is dropped, which rolls back any open transaction.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_product(&self, id: i32) -> Result<Option<Product>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"SELECT id, name, description, inventory_level, price, COALESCE(image, '') AS image,
                          is_recurring, plan_id, created_at, updated_at
                   FROM products
                   WHERE id = $1"#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|r| Product {
                id: r.get("id"),
                name: r.get("name"),
                description: r.get("description"),
                inventory_level: r.get("inventory_level"),
                price: r.get("price"),
                image: r.get("image"),
                is_recurring: r.get("is_recurring"),
                plan_id: r.get("plan_id"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            }))
        })
        .await
    }

    async fn find_receipt(&self, payment_intent: &str) -> Result<Option<Receipt>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"SELECT t.id AS transaction_id, t.amount, t.currency, t.last_four,
                          t.expiry_month, t.expiry_year, t.payment_intent, t.payment_method,
                          t.bank_return_code, t.created_at,
                          o.id AS order_id, o.subscription_id,
                          c.first_name, c.last_name, c.email
                   FROM transactions t
                   LEFT JOIN orders o ON o.transaction_id = t.id
                   LEFT JOIN customers c ON c.id = o.customer_id
                   WHERE t.payment_intent = $1"#,
            )
            .bind(payment_intent)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.map(|r| Receipt {
                first_name: r.get::<Option<String>, _>("first_name").unwrap_or_default(),
                last_name: r.get::<Option<String>, _>("last_name").unwrap_or_default(),
                email: r.get::<Option<String>, _>("email").unwrap_or_default(),
                payment_intent: r.get("payment_intent"),
                payment_method: r.get("payment_method"),
                amount: r.get("amount"),
                currency: r.get("currency"),
                last_four: r.get("last_four"),
                expiry_month: r.get("expiry_month"),
                expiry_year: r.get("expiry_year"),
                bank_return_code: r.get("bank_return_code"),
                transaction_id: r.get("transaction_id"),
                order_id: r.get("order_id"),
                subscription_id: r.get("subscription_id"),
                created_at: r.get("created_at"),
            }))
        })
        .await
    }

    async fn claim_payment_intent(&self, payment_intent: &str) -> Result<bool, StoreError> {
        self.timed(async {
            let claimed = sqlx::query(&format!(
                r#"INSERT INTO checkout_claims (payment_intent)
                   VALUES ($1)
                   ON CONFLICT (payment_intent)
                   DO UPDATE SET claimed_at = NOW()
                   WHERE checkout_claims.claimed_at < NOW() - INTERVAL '{CLAIM_TTL_SECS} seconds'
                   RETURNING payment_intent"#
            ))
            .bind(payment_intent)
            .fetch_optional(&self.pool)
            .await?;

            Ok(claimed.is_some())
        })
        .await
    }

    async fn release_payment_intent(&self, payment_intent: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM checkout_claims WHERE payment_intent = $1")
                .bind(payment_intent)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn record_sale(
        &self,
        customer: NewCustomer,
        transaction: NewTransaction,
        order: NewOrder,
    ) -> Result<SaleRecord, StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"INSERT INTO transactions
                        (amount, currency, last_four, bank_return_code, expiry_month, expiry_year,
                         payment_intent, payment_method, transaction_status_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (payment_intent) DO NOTHING
                   RETURNING id"#,
            )
            .bind(transaction.amount)
            .bind(&transaction.currency)
            .bind(&transaction.last_four)
            .bind(&transaction.bank_return_code)
            .bind(transaction.expiry_month)
            .bind(transaction.expiry_year)
            .bind(&transaction.payment_intent)
            .bind(&transaction.payment_method)
            .bind(transaction.status)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(inserted) = inserted else {
                tx.rollback().await?;
                let existing = sqlx::query(
                    r#"SELECT t.id AS transaction_id, o.id AS order_id, o.customer_id
                       FROM transactions t
                       LEFT JOIN orders o ON o.transaction_id = t.id
                       WHERE t.payment_intent = $1"#,
                )
                .bind(&transaction.payment_intent)
                .fetch_one(&self.pool)
                .await?;

                let order_id: Option<i32> = existing.get("order_id");
                let customer_id: Option<i32> = existing.get("customer_id");
                return match (order_id, customer_id) {
                    (Some(order_id), Some(customer_id)) => Ok(SaleRecord {
                        customer_id,
                        transaction_id: existing.get("transaction_id"),
                        order_id,
                        created: false,
                    }),
                    _ => Err(StoreError::Duplicate(format!(
                        "payment intent {} is already recorded without an order",
                        transaction.payment_intent
                    ))),
                };
            };
            let transaction_id: i32 = inserted.get("id");

            let customer_id: i32 = sqlx::query(
                r#"INSERT INTO customers (first_name, last_name, email)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (email)
                   DO UPDATE SET first_name = EXCLUDED.first_name,
                                 last_name = EXCLUDED.last_name,
                                 updated_at = NOW()
                   RETURNING id"#,
            )
            .bind(&customer.first_name)
            .bind(&customer.last_name)
            .bind(customer.email.to_lowercase())
            .fetch_one(&mut *tx)
            .await?
            .get("id");

            let order_id: i32 = sqlx::query(
                r#"INSERT INTO orders
                        (product_id, transaction_id, customer_id, status_id, quantity, amount, subscription_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7)
                   RETURNING id"#,
            )
            .bind(order.product_id)
            .bind(transaction_id)
            .bind(customer_id)
            .bind(order.status)
            .bind(order.quantity)
            .bind(order.amount)
            .bind(order.subscription_id.as_deref())
            .fetch_one(&mut *tx)
            .await?
            .get("id");

            tx.commit().await?;

            Ok(SaleRecord {
                customer_id,
                transaction_id,
                order_id,
                created: true,
            })
        })
        .await
    }

    async fn record_transaction(
        &self,
        transaction: NewTransaction,
    ) -> Result<Transaction, StoreError> {
        self.timed(async {
            let inserted = sqlx::query(
                r#"INSERT INTO transactions
                        (amount, currency, last_four, bank_return_code, expiry_month, expiry_year,
                         payment_intent, payment_method, transaction_status_id)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (payment_intent) DO NOTHING
                   RETURNING id, amount, currency, last_four, bank_return_code, expiry_month,
                             expiry_year, payment_intent, payment_method, transaction_status_id,
                             created_at, updated_at"#,
            )
            .bind(transaction.amount)
            .bind(&transaction.currency)
            .bind(&transaction.last_four)
            .bind(&transaction.bank_return_code)
            .bind(transaction.expiry_month)
            .bind(transaction.expiry_year)
            .bind(&transaction.payment_intent)
            .bind(&transaction.payment_method)
            .bind(transaction.status)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(transaction_from_row(&row));
            }

            let row = sqlx::query(
                r#"SELECT id, amount, currency, last_four, bank_return_code, expiry_month,
                          expiry_year, payment_intent, payment_method, transaction_status_id,
                          created_at, updated_at
                   FROM transactions
                   WHERE payment_intent = $1"#,
            )
            .bind(&transaction.payment_intent)
            .fetch_one(&self.pool)
            .await?;

            Ok(transaction_from_row(&row))
        })
        .await
    }

    async fn sales_paginated(
        &self,
        recurring: bool,
        page_size: i64,
        page: i64,
    ) -> Result<(Vec<Sale>, i64), StoreError> {
        self.timed(async {
            let offset = (page - 1) * page_size;

            let rows = sqlx::query(&format!(
                "{SALE_SELECT}
                 WHERE p.is_recurring = $1
                 ORDER BY o.created_at DESC, o.id DESC
                 LIMIT $2 OFFSET $3"
            ))
            .bind(recurring)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

            let total: i64 = sqlx::query(
                r#"SELECT COUNT(o.id) AS total
                   FROM orders o
                   JOIN products p ON p.id = o.product_id
                   WHERE p.is_recurring = $1"#,
            )
            .bind(recurring)
            .fetch_one(&self.pool)
            .await?
            .get("total");

            Ok((rows.iter().map(sale_from_row).collect(), total))
        })
        .await
    }

    async fn get_sale(&self, order_id: i32) -> Result<Option<Sale>, StoreError> {
        self.timed(async {
            let row = sqlx::query(&format!("{SALE_SELECT} WHERE o.id = $1"))
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;

            Ok(row.as_ref().map(sale_from_row))
        })
        .await
    }

    async fn update_order_status(
        &self,
        order_id: i32,
        status: OrderStatus,
    ) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("UPDATE orders SET status_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(status)
                .bind(order_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn mark_refunded(&self, order_id: i32, transaction_id: i32) -> Result<(), StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "UPDATE transactions SET transaction_status_id = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(TransactionStatus::Refunded)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE orders SET status_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(OrderStatus::Refunded)
                .bind(order_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn all_users(&self) -> Result<Vec<User>, StoreError> {
        self.timed(async {
            let rows = sqlx::query(
                r#"SELECT id, first_name, last_name, email, password, created_at, updated_at
                   FROM users
                   ORDER BY last_name, first_name"#,
            )
            .fetch_all(&self.pool)
            .await?;

            Ok(rows.iter().map(user_from_row).collect())
        })
        .await
    }

    async fn get_user(&self, id: i32) -> Result<Option<User>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"SELECT id, first_name, last_name, email, password, created_at, updated_at
                   FROM users
                   WHERE id = $1"#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.as_ref().map(user_from_row))
        })
        .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"SELECT id, first_name, last_name, email, password, created_at, updated_at
                   FROM users
                   WHERE email = $1"#,
            )
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.as_ref().map(user_from_row))
        })
        .await
    }

    async fn add_user(&self, user: NewUser, password_hash: &str) -> Result<i32, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"INSERT INTO users (first_name, last_name, email, password)
                   VALUES ($1, $2, $3, $4)
                   RETURNING id"#,
            )
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(user.email.to_lowercase())
            .bind(password_hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| duplicate_email(e, &user.email))?;

            Ok(row.get("id"))
        })
        .await
    }

    async fn edit_user(&self, id: i32, user: NewUser) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query(
                r#"UPDATE users
                   SET first_name = $1, last_name = $2, email = $3, updated_at = NOW()
                   WHERE id = $4"#,
            )
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(user.email.to_lowercase())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| duplicate_email(e, &user.email))?;
            Ok(())
        })
        .await
    }

    async fn update_password(&self, id: i32, password_hash: &str) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("UPDATE users SET password = $1, updated_at = NOW() WHERE id = $2")
                .bind(password_hash)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete_user(&self, id: i32) -> Result<bool, StoreError> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn replace_token(&self, token: &Token, user: &User) -> Result<(), StoreError> {
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM tokens WHERE user_id = $1")
                .bind(user.id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                r#"INSERT INTO tokens (user_id, name, email, token_hash, expiration, scope)
                   VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(user.id)
            .bind(&user.last_name)
            .bind(&user.email)
            .bind(&token.hash)
            .bind(token.expiry)
            .bind(token.scope.as_str())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn user_for_token(
        &self,
        token_hash: &[u8],
        scope: TokenScope,
    ) -> Result<Option<User>, StoreError> {
        self.timed(async {
            let row = sqlx::query(
                r#"SELECT u.id, u.first_name, u.last_name, u.email, u.password,
                          u.created_at, u.updated_at
                   FROM users u
                   JOIN tokens t ON t.user_id = u.id
                   WHERE t.token_hash = $1 AND t.scope = $2 AND t.expiration > NOW()"#,
            )
            .bind(token_hash)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .await?;

            Ok(row.as_ref().map(user_from_row))
        })
        .await
    }

    async fn delete_tokens_for_user(&self, user_id: i32) -> Result<(), StoreError> {
        self.timed(async {
            sqlx::query("DELETE FROM tokens WHERE user_id = $1")
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
