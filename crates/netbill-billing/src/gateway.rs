//! Payment gateway contract and the Tripay client
//!
//! Requests are signed with `HMAC-SHA256(merchant_code + merchant_ref + amount)`
//! and callbacks carry `X-Callback-Signature: HMAC-SHA256(raw body)`, both keyed
//! by the merchant private key.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use crate::payment::PaymentStatus;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the callback signature
pub const CALLBACK_SIGNATURE_HEADER: &str = "x-callback-signature";

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    #[error("malformed gateway payload: {0}")]
    Malformed(String),

    #[error("gateway misconfigured: {0}")]
    Config(String),
}

/// Gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub merchant_code: String,
    /// Lifetime of a checkout before the gateway expires it
    #[serde(default = "default_expiry_minutes")]
    pub expiry_minutes: i64,
}

fn default_base_url() -> String {
    "https://tripay.co.id/api".into()
}

fn default_expiry_minutes() -> i64 {
    24 * 60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_base_url(),
            api_key: String::new(),
            private_key: String::new(),
            merchant_code: String::new(),
            expiry_minutes: default_expiry_minutes(),
        }
    }
}

/// A checkout to open at the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRequest {
    pub method: String,
    /// Our reference for the order
    pub merchant_ref: String,
    /// Total including admin fee
    pub amount: Decimal,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    /// Line item shown on the gateway's checkout page
    pub item_name: String,
    pub callback_url: String,
    pub return_url: String,
}

/// What the gateway created
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPayment {
    pub reference: String,
    pub payment_url: Option<String>,
    pub virtual_account: Option<String>,
    pub qr_url: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// A status report delivered by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayNotification {
    pub reference: String,
    pub status: PaymentStatus,
    pub amount: Decimal,
}

/// Payment provider contract
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Open a checkout
    async fn create_payment(&self, request: &PaymentRequest) -> Result<GatewayPayment, GatewayError>;

    /// Check the signature of a raw callback body
    fn verify_callback(&self, body: &[u8], signature: &str) -> bool;

    /// Decode a callback body
    fn parse_callback(&self, body: &[u8]) -> Result<GatewayNotification, GatewayError>;
}

/// Hex HMAC-SHA256 of `data` keyed by `key`
pub fn sign(key: &str, data: &[u8]) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| GatewayError::Config(e.to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Tripay closed-payment client
pub struct TripayGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl TripayGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        if config.api_key.is_empty() || config.private_key.is_empty() || config.merchant_code.is_empty() {
            return Err(GatewayError::Config(
                "api_key, private_key and merchant_code are required".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    fn request_body(&self, request: &PaymentRequest, now: DateTime<Utc>) -> Result<TripayCreate, GatewayError> {
        // the gateway takes whole units; never charge a truncated total
        if !request.amount.fract().is_zero() {
            return Err(GatewayError::Malformed(format!(
                "amount {} is not a whole currency unit",
                request.amount
            )));
        }
        let amount = request
            .amount
            .to_i64()
            .ok_or_else(|| GatewayError::Malformed(format!("amount {} out of range", request.amount)))?;
        let signature = sign(
            &self.config.private_key,
            format!("{}{}{}", self.config.merchant_code, request.merchant_ref, amount).as_bytes(),
        )?;
        Ok(TripayCreate {
            method: request.method.clone(),
            merchant_ref: request.merchant_ref.clone(),
            amount,
            customer_name: request.customer_name.clone(),
            customer_email: request.customer_email.clone().unwrap_or_default(),
            customer_phone: request.customer_phone.clone().unwrap_or_default(),
            order_items: vec![TripayItem {
                name: request.item_name.clone(),
                price: amount,
                quantity: 1,
            }],
            callback_url: request.callback_url.clone(),
            return_url: request.return_url.clone(),
            expired_time: (now + ChronoDuration::minutes(self.config.expiry_minutes)).timestamp(),
            signature,
        })
    }
}

#[derive(Debug, Serialize)]
struct TripayCreate {
    method: String,
    merchant_ref: String,
    amount: i64,
    customer_name: String,
    customer_email: String,
    customer_phone: String,
    order_items: Vec<TripayItem>,
    callback_url: String,
    return_url: String,
    expired_time: i64,
    signature: String,
}

#[derive(Debug, Serialize)]
struct TripayItem {
    name: String,
    price: i64,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct TripayEnvelope {
    success: bool,
    #[serde(default)]
    message: String,
    data: Option<TripayTransaction>,
}

#[derive(Debug, Deserialize)]
struct TripayTransaction {
    reference: String,
    #[serde(default)]
    checkout_url: Option<String>,
    #[serde(default)]
    pay_code: Option<String>,
    #[serde(default)]
    qr_url: Option<String>,
    expired_time: i64,
}

#[derive(Debug, Deserialize)]
struct TripayCallback {
    reference: String,
    status: String,
    total_amount: Decimal,
}

#[async_trait]
impl PaymentGateway for TripayGateway {
    fn name(&self) -> &str {
        "tripay"
    }

    async fn create_payment(&self, request: &PaymentRequest) -> Result<GatewayPayment, GatewayError> {
        let body = self.request_body(request, Utc::now())?;
        let url = format!("{}/transaction/create", self.config.base_url.trim_end_matches('/'));
        debug!(merchant_ref = %request.merchant_ref, method = %request.method, "creating gateway payment");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let envelope: TripayEnvelope = response
            .json()
            .await
            .map_err(|e| GatewayError::Malformed(format!("{}: {}", status, e)))?;

        if !status.is_success() || !envelope.success {
            warn!(merchant_ref = %request.merchant_ref, message = %envelope.message, "gateway rejected payment");
            return Err(GatewayError::Rejected(envelope.message));
        }
        let data = envelope
            .data
            .ok_or_else(|| GatewayError::Malformed("response carries no data".into()))?;
        let expires_at = Utc
            .timestamp_opt(data.expired_time, 0)
            .single()
            .ok_or_else(|| GatewayError::Malformed(format!("bad expiry {}", data.expired_time)))?;

        Ok(GatewayPayment {
            reference: data.reference,
            payment_url: data.checkout_url,
            virtual_account: data.pay_code,
            qr_url: data.qr_url,
            expires_at,
        })
    }

    fn verify_callback(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(self.config.private_key.as_bytes()) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    fn parse_callback(&self, body: &[u8]) -> Result<GatewayNotification, GatewayError> {
        let callback: TripayCallback =
            serde_json::from_slice(body).map_err(|e| GatewayError::Malformed(e.to_string()))?;
        let status = match callback.status.to_ascii_uppercase().as_str() {
            "UNPAID" => PaymentStatus::Pending,
            "PAID" => PaymentStatus::Paid,
            "EXPIRED" => PaymentStatus::Expired,
            "FAILED" | "REFUND" => PaymentStatus::Failed,
            other => return Err(GatewayError::Malformed(format!("unknown status {}", other))),
        };
        Ok(GatewayNotification {
            reference: callback.reference,
            status,
            amount: callback.total_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn gateway() -> TripayGateway {
        TripayGateway::new(GatewayConfig {
            enabled: true,
            api_key: "DEV-key".into(),
            private_key: "priv-key".into(),
            merchant_code: "T0001".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn request() -> PaymentRequest {
        PaymentRequest {
            method: "BRIVA".into(),
            merchant_ref: "INV1-1700000000".into(),
            amount: dec!(102000),
            customer_name: "Budi".into(),
            customer_email: None,
            customer_phone: Some("0812".into()),
            item_name: "Internet 2024-03".into(),
            callback_url: "https://billing.example/api/payments/callback".into(),
            return_url: "https://billing.example/portal".into(),
        }
    }

    #[test]
    fn test_missing_keys_rejected() {
        assert!(matches!(
            TripayGateway::new(GatewayConfig::default()),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_request_signature() {
        let gw = gateway();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let body = gw.request_body(&request(), now).unwrap();

        assert_eq!(body.amount, 102000);
        assert_eq!(
            body.signature,
            sign("priv-key", b"T0001INV1-1700000000102000").unwrap()
        );
        assert_eq!(body.expired_time, now.timestamp() + 24 * 3600);
        assert_eq!(body.order_items[0].price, 102000);
    }

    #[test]
    fn test_fractional_total_refused() {
        let gw = gateway();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let mut request = request();
        request.amount = dec!(102000.75);

        assert!(matches!(
            gw.request_body(&request, now),
            Err(GatewayError::Malformed(_))
        ));
    }

    #[test]
    fn test_callback_signature() {
        let gw = gateway();
        let body = br#"{"reference":"PAY-1","status":"PAID","total_amount":102000}"#;
        let signature = sign("priv-key", body).unwrap();

        assert!(gw.verify_callback(body, &signature));
        assert!(!gw.verify_callback(b"{}", &signature));
        assert!(!gw.verify_callback(body, "not-hex"));
    }

    #[test]
    fn test_parse_callback() {
        let gw = gateway();
        let n = gw
            .parse_callback(br#"{"reference":"PAY-1","merchant_ref":"INV1","status":"PAID","total_amount":102000}"#)
            .unwrap();
        assert_eq!(n.reference, "PAY-1");
        assert_eq!(n.status, PaymentStatus::Paid);
        assert_eq!(n.amount, dec!(102000));

        let n = gw
            .parse_callback(br#"{"reference":"PAY-2","status":"EXPIRED","total_amount":5000}"#)
            .unwrap();
        assert_eq!(n.status, PaymentStatus::Expired);

        assert!(gw
            .parse_callback(br#"{"reference":"PAY-3","status":"WEIRD","total_amount":1}"#)
            .is_err());
    }
}
