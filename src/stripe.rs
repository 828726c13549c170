//! Stripe webhook handling.
//!
//! Stripe signs every webhook delivery with a `Stripe-Signature` header of
//! the form `t=<unix ts>,v1=<hmac>,...` where the HMAC-SHA256 is computed
//! over `"{t}.{raw body}"` with the endpoint secret. Verification checks
//! the MAC and rejects timestamps outside a tolerance window.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StripeError {
    #[error("Malformed Stripe-Signature header")]
    MalformedHeader,

    #[error("Signature does not match payload")]
    SignatureMismatch,

    #[error("Signature timestamp outside tolerance window")]
    TimestampOutOfTolerance,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
}

/// Verify a `Stripe-Signature` header against the raw request body.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<(), StripeError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| StripeError::MalformedHeader)?);
            }
            Some(("v1", value)) => {
                signatures.push(hex::decode(value).map_err(|_| StripeError::MalformedHeader)?);
            }
            // v0 (test-mode) and unknown schemes are skipped.
            Some(_) => {}
            None => return Err(StripeError::MalformedHeader),
        }
    }

    let timestamp = timestamp.ok_or(StripeError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(StripeError::MalformedHeader);
    }

    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(StripeError::TimestampOutOfTolerance);
    }

    let mut signed_payload = Vec::with_capacity(payload.len() + 16);
    signed_payload.extend_from_slice(timestamp.to_string().as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(payload);

    for signature in &signatures {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| StripeError::MalformedHeader)?;
        mac.update(&signed_payload);
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }

    Err(StripeError::SignatureMismatch)
}

/// The webhook events we act on. Everything else is acknowledged and
/// dropped so Stripe does not retry it.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    /// A checkout finished; the order referenced in metadata is paid and
    /// should be provisioned.
    CheckoutCompleted {
        order_uuid: String,
        session_id: String,
        amount_total_cents: Option<i64>,
        currency: Option<String>,
    },
    /// A recurring payment failed; the subscription's server should be
    /// suspended.
    PaymentFailed { order_uuid: String },
    Ignored { event_type: String },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: RawData,
}

#[derive(Deserialize)]
struct RawData {
    object: serde_json::Value,
}

pub fn parse_event(payload: &[u8]) -> Result<WebhookEvent, StripeError> {
    let raw: RawEvent = serde_json::from_slice(payload)?;
    let object = &raw.data.object;

    let order_uuid = object
        .pointer("/metadata/order_uuid")
        .and_then(|v| v.as_str())
        .map(String::from);

    match (raw.event_type.as_str(), order_uuid) {
        ("checkout.session.completed", Some(order_uuid)) => Ok(WebhookEvent::CheckoutCompleted {
            order_uuid,
            session_id: object
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            amount_total_cents: object.get("amount_total").and_then(|v| v.as_i64()),
            currency: object
                .get("currency")
                .and_then(|v| v.as_str())
                .map(String::from),
        }),
        ("invoice.payment_failed", Some(order_uuid)) => {
            Ok(WebhookEvent::PaymentFailed { order_uuid })
        }
        (event_type, _) => Ok(WebhookEvent::Ignored {
            event_type: event_type.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("t={timestamp},v1={signature}")
    }

    #[test]
    fn test_valid_signature_accepted() {
        let now = Utc::now();
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = sign(SECRET, now.timestamp(), payload);

        verify_signature(SECRET, &header, payload, now, 300).unwrap();
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let now = Utc::now();
        let payload = b"{}";
        let header = sign("whsec_other", now.timestamp(), payload);

        assert!(matches!(
            verify_signature(SECRET, &header, payload, now, 300),
            Err(StripeError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = Utc::now();
        let header = sign(SECRET, now.timestamp(), b"{}");

        assert!(matches!(
            verify_signature(SECRET, &header, b"{\"x\":1}", now, 300),
            Err(StripeError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let now = Utc::now();
        let payload = b"{}";
        let header = sign(SECRET, now.timestamp() - 301, payload);

        assert!(matches!(
            verify_signature(SECRET, &header, payload, now, 300),
            Err(StripeError::TimestampOutOfTolerance)
        ));
    }

    #[test]
    fn test_second_v1_signature_accepted() {
        // Stripe sends multiple v1 entries during secret rotation.
        let now = Utc::now();
        let payload = b"{}";
        let good = sign(SECRET, now.timestamp(), payload);
        let bad = sign("whsec_old", now.timestamp(), payload);

        let v1_good = good.split("v1=").nth(1).unwrap();
        let header = format!("{bad},v1={v1_good}");

        verify_signature(SECRET, &header, payload, now, 300).unwrap();
    }

    #[test]
    fn test_missing_signature_rejected() {
        let now = Utc::now();
        assert!(matches!(
            verify_signature(SECRET, &format!("t={}", now.timestamp()), b"{}", now, 300),
            Err(StripeError::MalformedHeader)
        ));
    }

    #[test]
    fn test_parse_checkout_completed() {
        let payload = serde_json::json!({
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_test_123",
                    "amount_total": 799,
                    "currency": "eur",
                    "metadata": { "order_uuid": "abc-def" }
                }
            }
        });

        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            WebhookEvent::CheckoutCompleted {
                order_uuid: "abc-def".to_string(),
                session_id: "cs_test_123".to_string(),
                amount_total_cents: Some(799),
                currency: Some("eur".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_payment_failed() {
        let payload = serde_json::json!({
            "type": "invoice.payment_failed",
            "data": {
                "object": {
                    "id": "in_test_1",
                    "metadata": { "order_uuid": "abc-def" }
                }
            }
        });

        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            WebhookEvent::PaymentFailed {
                order_uuid: "abc-def".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_event_ignored() {
        let payload = serde_json::json!({
            "type": "customer.created",
            "data": { "object": {} }
        });

        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert_eq!(
            event,
            WebhookEvent::Ignored {
                event_type: "customer.created".to_string()
            }
        );
    }

    #[test]
    fn test_checkout_without_order_uuid_ignored() {
        let payload = serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_test_1", "metadata": {} } }
        });

        let event = parse_event(payload.to_string().as_bytes()).unwrap();
        assert!(matches!(event, WebhookEvent::Ignored { .. }));
    }
}
