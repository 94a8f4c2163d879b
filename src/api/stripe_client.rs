// src/api/stripe_client.rs
//
// Thin client for the Stripe REST API.
// Auth: `Authorization: Bearer <secret>`, request bodies are form-encoded.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";

#[derive(Debug)]
pub enum GatewayError {
    Http(reqwest::Error),
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    InvalidResponse(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Http(e) => write!(f, "http error: {e}"),
            GatewayError::Api {
                status,
                code,
                message,
            } => write!(
                f,
                "stripe api error status={status} code={} message={message}",
                code.as_deref().unwrap_or("-")
            ),
            GatewayError::InvalidResponse(e) => write!(f, "invalid response: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value)
    }
}

impl GatewayError {
    /// Card message suitable for showing to the buyer.
    pub fn user_message(&self) -> &'static str {
        match self {
            GatewayError::Api {
                code: Some(code), ..
            } => card_error_message(code),
            _ => card_error_message(""),
        }
    }

    /// Network failures and provider-side 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Api { status, .. } => *status >= 500 || *status == 429,
            GatewayError::InvalidResponse(_) => false,
        }
    }
}

/// Maps a provider error code to the message shown to the buyer.
pub fn card_error_message(code: &str) -> &'static str {
    match code {
        "card_declined" => "Your card was declined.",
        "expired_card" => "Your card is expired.",
        "incorrect_cvc" => "Your card's security code is incorrect.",
        "incorrect_number" => "Your card number is incorrect.",
        "incorrect_zip" => "Your card's zip code failed validation.",
        "amount_too_large" => "The amount is too large to process.",
        "amount_too_small" => "The amount is too small to process.",
        "postal_code_invalid" => "Your card's postal code failed validation.",
        "balance_insufficient" => "Your card's balance is insufficient.",
        _ => "There was an error processing your card.",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub latest_charge: Option<String>,
    #[serde(default)]
    pub charges: Option<ChargeList>,
}

impl PaymentIntent {
    /// Id of the first recorded charge, used as the bank return code.
    pub fn first_charge_id(&self) -> Option<&str> {
        self.charges
            .as_ref()
            .and_then(|c| c.data.first())
            .map(|c| c.id.as_str())
            .or(self.latest_charge.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeList {
    #[serde(default)]
    pub data: Vec<Charge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(default)]
    pub card: Option<CardDetails>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardDetails {
    #[serde(default)]
    pub brand: String,
    pub last4: String,
    pub exp_month: i32,
    pub exp_year: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T> Expandable<T> {
    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Object(o) => Some(o.as_ref()),
            Expandable::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub latest_invoice: Option<Expandable<Invoice>>,
}

impl Subscription {
    /// The payment intent that settled the first invoice, when it was expanded.
    pub fn initial_payment_intent(&self) -> Option<&PaymentIntent> {
        self.latest_invoice
            .as_ref()
            .and_then(Expandable::as_object)
            .and_then(|inv| inv.payment_intent.as_ref())
            .and_then(Expandable::as_object)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Operations the shop needs from the card-payment provider. Each call takes
/// the caller's secret key; implementations hold no per-merchant state.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        secret: &str,
        currency: &str,
        amount: i64,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_payment_intent(
        &self,
        secret: &str,
        id: &str,
    ) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_payment_method(
        &self,
        secret: &str,
        id: &str,
    ) -> Result<PaymentMethod, GatewayError>;

    async fn create_customer(
        &self,
        secret: &str,
        payment_method: &str,
        email: &str,
    ) -> Result<Customer, GatewayError>;

    async fn create_subscription(
        &self,
        secret: &str,
        customer_id: &str,
        plan: &str,
        last_four: &str,
        card_type: &str,
    ) -> Result<Subscription, GatewayError>;

    async fn refund(
        &self,
        secret: &str,
        payment_intent: &str,
        amount: i64,
    ) -> Result<Refund, GatewayError>;

    /// Cancels at the end of the current billing period.
    async fn cancel_subscription(
        &self,
        secret: &str,
        subscription_id: &str,
    ) -> Result<Subscription, GatewayError>;
}

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    retries: u32,
}

impl StripeClient {
    pub fn new(base_url: &str, timeout: Duration, retries: u32) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retries: retries.max(1),
        })
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, GatewayError> {
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(env) => (env.error.code, env.error.message.unwrap_or_default()),
                Err(_) => (None, body),
            };
            return Err(GatewayError::Api {
                status: status.as_u16(),
                code,
                message,
            });
        }

        serde_json::from_str::<T>(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))
    }

    /// GET with bounded retries on transient failures.
    async fn get<T: DeserializeOwned>(&self, secret: &str, path: &str) -> Result<T, GatewayError> {
        let mut attempt = 0;
        loop {
            let result = async {
                let resp = self
                    .http
                    .get(format!("{}{path}", self.base_url))
                    .bearer_auth(secret)
                    .send()
                    .await?;
                Self::parse::<T>(resp).await
            }
            .await;

            match result {
                Err(e) if e.is_transient() && attempt + 1 < self.retries => {
                    let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                    log::warn!("stripe GET {path} failed ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// POST is never retried: it may already have moved money.
    async fn post<T: DeserializeOwned>(
        &self,
        secret: &str,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, GatewayError> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(secret)
            .form(form)
            .send()
            .await?;
        Self::parse(resp).await
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_payment_intent(
        &self,
        secret: &str,
        currency: &str,
        amount: i64,
    ) -> Result<PaymentIntent, GatewayError> {
        let amount = amount.to_string();
        self.post(
            secret,
            "/v1/payment_intents",
            &[("amount", amount.as_str()), ("currency", currency)],
        )
        .await
    }

    async fn retrieve_payment_intent(
        &self,
        secret: &str,
        id: &str,
    ) -> Result<PaymentIntent, GatewayError> {
        self.get(secret, &format!("/v1/payment_intents/{id}")).await
    }

    async fn retrieve_payment_method(
        &self,
        secret: &str,
        id: &str,
    ) -> Result<PaymentMethod, GatewayError> {
        self.get(secret, &format!("/v1/payment_methods/{id}")).await
    }

    async fn create_customer(
        &self,
        secret: &str,
        payment_method: &str,
        email: &str,
    ) -> Result<Customer, GatewayError> {
        self.post(
            secret,
            "/v1/customers",
            &[
                ("payment_method", payment_method),
                ("email", email),
                ("invoice_settings[default_payment_method]", payment_method),
            ],
        )
        .await
    }

    async fn create_subscription(
        &self,
        secret: &str,
        customer_id: &str,
        plan: &str,
        last_four: &str,
        card_type: &str,
    ) -> Result<Subscription, GatewayError> {
        self.post(
            secret,
            "/v1/subscriptions",
            &[
                ("customer", customer_id),
                ("items[0][plan]", plan),
                ("metadata[last_four]", last_four),
                ("metadata[card_type]", card_type),
                ("expand[]", "latest_invoice.payment_intent"),
            ],
        )
        .await
    }

    async fn refund(
        &self,
        secret: &str,
        payment_intent: &str,
        amount: i64,
    ) -> Result<Refund, GatewayError> {
        let amount = amount.to_string();
        self.post(
            secret,
            "/v1/refunds",
            &[("payment_intent", payment_intent), ("amount", amount.as_str())],
        )
        .await
    }

    async fn cancel_subscription(
        &self,
        secret: &str,
        subscription_id: &str,
    ) -> Result<Subscription, GatewayError> {
        self.post(
            secret,
            &format!("/v1/subscriptions/{subscription_id}"),
            &[("cancel_at_period_end", "true")],
        )
        .await
    }
}
