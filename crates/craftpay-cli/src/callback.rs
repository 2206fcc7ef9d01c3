// Simulated gateway callbacks for local testing
//
// Builds the STK push result body the gateway would post to the webhook, so
// an operator can drive a payment to HELD or FAILED without a real phone.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

/// What the simulated payer did.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedResult {
    Paid {
        amount: u64,
        receipt: String,
        phone: String,
    },
    /// Non-zero result code, e.g. 1032 for "cancelled by user".
    Declined { code: i64, description: String },
}

/// Builds a Daraja STK callback body for `checkout_request_id`.
pub fn stk_callback(checkout_request_id: &str, result: &SimulatedResult, at: DateTime<Utc>) -> Value {
    let merchant_request_id = format!("SIM-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);

    match result {
        SimulatedResult::Paid {
            amount,
            receipt,
            phone,
        } => {
            let transaction_date: u64 = daraja_timestamp(at).parse().unwrap_or_default();
            let phone_number: Value = phone
                .parse::<u64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::from(phone.as_str()));

            json!({
                "Body": {
                    "stkCallback": {
                        "MerchantRequestID": merchant_request_id,
                        "CheckoutRequestID": checkout_request_id,
                        "ResultCode": 0,
                        "ResultDesc": "The service request is processed successfully.",
                        "CallbackMetadata": {
                            "Item": [
                                { "Name": "Amount", "Value": amount },
                                { "Name": "MpesaReceiptNumber", "Value": receipt },
                                { "Name": "Balance" },
                                { "Name": "TransactionDate", "Value": transaction_date },
                                { "Name": "PhoneNumber", "Value": phone_number }
                            ]
                        }
                    }
                }
            })
        }
        SimulatedResult::Declined { code, description } => json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": merchant_request_id,
                    "CheckoutRequestID": checkout_request_id,
                    "ResultCode": code,
                    "ResultDesc": description
                }
            }
        }),
    }
}

/// Gateway-local `YYYYMMDDHHMMSS` (East Africa Time).
fn daraja_timestamp(at: DateTime<Utc>) -> String {
    (at + Duration::hours(3)).format("%Y%m%d%H%M%S").to_string()
}

/// A plausible ten-character receipt number.
pub fn random_receipt() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("SIM{}", &id[..7])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_paid_callback_shape() {
        let at = Utc.with_ymd_and_hms(2026, 1, 15, 11, 21, 2).unwrap();
        let body = stk_callback(
            "ws_CO_123",
            &SimulatedResult::Paid {
                amount: 1000,
                receipt: "NLJ7RT61SV".to_string(),
                phone: "254712345678".to_string(),
            },
            at,
        );

        let callback = &body["Body"]["stkCallback"];
        assert_eq!(callback["CheckoutRequestID"], "ws_CO_123");
        assert_eq!(callback["ResultCode"], 0);

        let items = callback["CallbackMetadata"]["Item"].as_array().unwrap();
        let item = |name: &str| {
            items
                .iter()
                .find(|i| i["Name"] == name)
                .map(|i| i["Value"].clone())
                .unwrap()
        };
        assert_eq!(item("Amount"), 1000);
        assert_eq!(item("MpesaReceiptNumber"), "NLJ7RT61SV");
        assert_eq!(item("TransactionDate"), 20260115142102u64);
        assert_eq!(item("PhoneNumber"), 254712345678u64);
    }

    #[test]
    fn test_declined_callback_has_no_metadata() {
        let body = stk_callback(
            "ws_CO_123",
            &SimulatedResult::Declined {
                code: 1032,
                description: "Request cancelled by user".to_string(),
            },
            Utc::now(),
        );

        let callback = &body["Body"]["stkCallback"];
        assert_eq!(callback["ResultCode"], 1032);
        assert!(callback.get("CallbackMetadata").is_none());
    }

    #[test]
    fn test_random_receipt() {
        let receipt = random_receipt();
        assert_eq!(receipt.len(), 10);
        assert!(receipt.starts_with("SIM"));
        assert_ne!(receipt, random_receipt());
    }
}
