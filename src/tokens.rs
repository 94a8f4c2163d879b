// src/tokens.rs

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// Length of the hex plaintext handed to the client (16 random bytes).
pub const TOKEN_LEN: usize = 32;

/// How long a buyer may view their receipt after paying.
pub const RECEIPT_TTL_SECS: i64 = 15 * 60;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScope {
    Authentication,
    PasswordReset,
}

impl TokenScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenScope::Authentication => "authentication",
            TokenScope::PasswordReset => "password-reset",
        }
    }

    pub fn ttl(self) -> Duration {
        match self {
            TokenScope::Authentication => Duration::hours(24),
            TokenScope::PasswordReset => Duration::hours(1),
        }
    }
}

/// Opaque bearer token. Only `hash` is ever persisted.
#[derive(Debug, Clone)]
pub struct Token {
    pub plaintext: String,
    pub user_id: i32,
    pub hash: Vec<u8>,
    pub expiry: DateTime<Utc>,
    pub scope: TokenScope,
}

/// Wire form of a freshly issued token.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IssuedToken {
    pub token: String,
    pub expiry: DateTime<Utc>,
}

impl Token {
    pub fn generate(user_id: i32, scope: TokenScope) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let plaintext = hex::encode(bytes);
        let hash = hash_token(&plaintext);

        Token {
            plaintext,
            user_id,
            hash,
            expiry: Utc::now() + scope.ttl(),
            scope,
        }
    }

    pub fn issued(&self) -> IssuedToken {
        IssuedToken {
            token: self.plaintext.clone(),
            expiry: self.expiry,
        }
    }
}

/// SHA-256 of the plaintext token.
pub fn hash_token(plaintext: &str) -> Vec<u8> {
    Sha256::digest(plaintext.as_bytes()).to_vec()
}

fn receipt_mac(key: &str, payment_intent: &str, expires_at: i64) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
    mac.update(format!("{payment_intent}:{expires_at}").as_bytes());
    Some(mac)
}

/// `<expires_at>.<hex hmac>` binding a receipt view to one payment intent.
pub fn receipt_token(key: &str, payment_intent: &str, expires_at: i64) -> Option<String> {
    let mac = receipt_mac(key, payment_intent, expires_at)?;
    Some(format!(
        "{expires_at}.{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub fn verify_receipt_token(key: &str, payment_intent: &str, token: &str, now: i64) -> bool {
    let Some((expiry, signature)) = token.split_once('.') else {
        return false;
    };
    let Ok(expires_at) = expiry.parse::<i64>() else {
        return false;
    };
    if expires_at <= now {
        return false;
    }
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    receipt_mac(key, payment_intent, expires_at)
        .is_some_and(|mac| mac.verify_slice(&signature).is_ok())
}
