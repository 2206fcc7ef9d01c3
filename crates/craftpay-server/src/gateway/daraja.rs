//! M-Pesa Daraja implementation of [`PaymentGateway`].
//!
//! Collections use STK push, payouts use B2C, refunds use the transaction
//! reversal API. All three are asynchronous on the gateway side; a successful
//! response here only means the request was accepted.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CollectionRequest, GatewayError, PaymentGateway, PayoutRequest, ReversalRequest};

const TOKEN_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const B2C_PATH: &str = "/mpesa/b2c/v3/paymentrequest";
const REVERSAL_PATH: &str = "/mpesa/reversal/v1/request";

/// Daraja timestamps are East Africa Time (UTC+3, no DST).
const EAT_OFFSET_HOURS: i64 = 3;

/// Tokens are refreshed this long before the gateway says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

const DEFAULT_TOKEN_TTL_SECS: i64 = 3599;

/// Daraja credentials and endpoints.
#[derive(Debug, Clone)]
pub struct DarajaConfig {
    /// e.g. `https://sandbox.safaricom.co.ke`
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill / till receiving collections.
    pub shortcode: String,
    /// Lipa na M-Pesa passkey for the STK password.
    pub passkey: String,
    /// Shortcode paying out B2C.
    pub b2c_shortcode: String,
    pub initiator_name: String,
    /// Encrypted initiator password.
    pub security_credential: String,
    /// Where the gateway posts STK results (our webhook).
    pub callback_url: String,
    /// Where the gateway posts B2C and reversal results.
    pub result_url: String,
    pub queue_timeout_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// HTTP client for the Daraja API.
pub struct DarajaClient {
    client: Client,
    config: DarajaConfig,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushBody<'a> {
    business_short_code: &'a str,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    account_reference: &'a str,
    transaction_desc: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    response_code: String,
    #[serde(default)]
    response_description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct B2cBody<'a> {
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: &'a str,
    initiator_name: &'a str,
    security_credential: &'a str,
    #[serde(rename = "CommandID")]
    command_id: &'static str,
    amount: u64,
    party_a: &'a str,
    party_b: &'a str,
    remarks: &'a str,
    #[serde(rename = "QueueTimeOutURL")]
    queue_timeout_url: &'a str,
    #[serde(rename = "ResultURL")]
    result_url: &'a str,
    occasion: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ReversalBody<'a> {
    initiator: &'a str,
    security_credential: &'a str,
    #[serde(rename = "CommandID")]
    command_id: &'static str,
    #[serde(rename = "TransactionID")]
    transaction_id: &'a str,
    amount: u64,
    receiver_party: &'a str,
    // the gateway's own spelling
    #[serde(rename = "RecieverIdentifierType")]
    receiver_identifier_type: &'static str,
    #[serde(rename = "ResultURL")]
    result_url: &'a str,
    #[serde(rename = "QueueTimeOutURL")]
    queue_timeout_url: &'a str,
    remarks: &'a str,
    occasion: &'a str,
}

/// Acknowledgement shared by B2C and reversal.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AcceptedResponse {
    #[serde(rename = "ConversationID")]
    conversation_id: String,
    response_code: String,
    #[serde(default)]
    response_description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl DarajaClient {
    pub fn new(config: DarajaConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Permanent(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Returns a cached OAuth token, fetching a new one when it is close to expiry.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref() {
            if token.expires_at > now {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting Daraja access token");
        let response = self
            .client
            .get(self.url(TOKEN_PATH))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_send_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let token: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Transient(format!("unreadable token response: {}", e)))?;

        let ttl = token
            .expires_in
            .as_ref()
            .and_then(|v| match v {
                serde_json::Value::String(s) => s.parse::<i64>().ok(),
                serde_json::Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);

        let value = token.access_token;
        *cached = Some(AccessToken {
            value: value.clone(),
            expires_at: now + chrono::Duration::seconds(ttl - TOKEN_REFRESH_MARGIN_SECS),
        });

        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let token = self.access_token().await?;

        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_send_error)?;

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                self.invalidate_token().await;
            }
            warn!(path, status = status.as_u16(), "Daraja request failed");
            return Err(classify_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Transient(format!("unreadable gateway response: {}", e)))
    }
}

#[async_trait]
impl PaymentGateway for DarajaClient {
    async fn initiate_collection(&self, request: &CollectionRequest) -> Result<String, GatewayError> {
        let amount = whole_units(&request.amount)?;
        let timestamp = daraja_timestamp(Utc::now());
        let body = StkPushBody {
            business_short_code: &self.config.shortcode,
            password: stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            timestamp,
            transaction_type: "CustomerPayBillOnline",
            amount,
            party_a: &request.phone,
            party_b: &self.config.shortcode,
            phone_number: &request.phone,
            callback_url: &self.config.callback_url,
            account_reference: &request.reference,
            transaction_desc: &request.description,
        };

        let response: StkPushResponse = self.post(STK_PUSH_PATH, &body).await?;
        ensure_accepted(&response.response_code, &response.response_description)?;
        Ok(response.checkout_request_id)
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<String, GatewayError> {
        let amount = whole_units(&request.amount)?;
        let body = B2cBody {
            originator_conversation_id: &request.reference,
            initiator_name: &self.config.initiator_name,
            security_credential: &self.config.security_credential,
            command_id: "BusinessPayment",
            amount,
            party_a: &self.config.b2c_shortcode,
            party_b: &request.phone,
            remarks: &request.description,
            queue_timeout_url: &self.config.queue_timeout_url,
            result_url: &self.config.result_url,
            occasion: request.occasion.as_deref().unwrap_or(""),
        };

        let response: AcceptedResponse = self.post(B2C_PATH, &body).await?;
        ensure_accepted(&response.response_code, &response.response_description)?;
        Ok(response.conversation_id)
    }

    async fn reverse_collection(&self, request: &ReversalRequest) -> Result<String, GatewayError> {
        let amount = whole_units(&request.amount)?;
        let body = ReversalBody {
            initiator: &self.config.initiator_name,
            security_credential: &self.config.security_credential,
            command_id: "TransactionReversal",
            transaction_id: &request.receipt_number,
            amount,
            receiver_party: &self.config.shortcode,
            receiver_identifier_type: "11",
            result_url: &self.config.result_url,
            queue_timeout_url: &self.config.queue_timeout_url,
            remarks: &request.reason,
            occasion: &request.reference,
        };

        let response: AcceptedResponse = self.post(REVERSAL_PATH, &body).await?;
        ensure_accepted(&response.response_code, &response.response_description)?;
        Ok(response.conversation_id)
    }
}

/// `base64(shortcode ‖ passkey ‖ timestamp)`
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

/// Formats an instant as the gateway's `YYYYMMDDHHMMSS` local timestamp.
pub fn daraja_timestamp(at: DateTime<Utc>) -> String {
    (at + chrono::Duration::hours(EAT_OFFSET_HOURS))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// Parses a gateway `YYYYMMDDHHMMSS` local timestamp.
pub fn parse_daraja_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y%m%d%H%M%S")
        .ok()
        .map(|local| (local - chrono::Duration::hours(EAT_OFFSET_HOURS)).and_utc())
}

/// The gateway only moves whole shillings.
pub fn whole_units(amount: &BigDecimal) -> Result<u64, GatewayError> {
    if amount <= &BigDecimal::from(0) {
        return Err(GatewayError::Permanent(format!(
            "amount must be positive, got {}",
            amount
        )));
    }

    let whole = amount.with_scale(0);
    if &whole != amount {
        return Err(GatewayError::Permanent(format!(
            "amount {} has a fractional part the gateway cannot transfer",
            amount
        )));
    }

    whole
        .to_u64()
        .ok_or_else(|| GatewayError::Permanent(format!("amount {} out of range", amount)))
}

fn ensure_accepted(code: &str, description: &str) -> Result<(), GatewayError> {
    if code.trim() == "0" {
        Ok(())
    } else {
        Err(GatewayError::Permanent(format!(
            "{} (response code {})",
            description, code
        )))
    }
}

fn classify_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Transient(format!("gateway timed out: {}", e))
    } else if e.is_builder() {
        GatewayError::Permanent(format!("invalid gateway request: {}", e))
    } else {
        GatewayError::Transient(format!("gateway unreachable: {}", e))
    }
}

/// Maps a non-success HTTP status onto the retry taxonomy.
fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    let message = format!(
        "HTTP {}: {} ({})",
        status.as_u16(),
        detail.error_message.as_deref().unwrap_or("no error message"),
        detail.error_code.as_deref().unwrap_or("no error code"),
    );

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::UNAUTHORIZED
    {
        GatewayError::Transient(message)
    } else {
        GatewayError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    #[test]
    fn test_stk_password() {
        // Daraja sandbox documentation values
        let password = stk_password(
            "174379",
            "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919",
            "20160216165627",
        );
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&password)
            .unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "174379bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c91920160216165627"
        );
    }

    #[test]
    fn test_timestamp_is_east_africa_time() {
        let at = Utc.with_ymd_and_hms(2024, 12, 19, 7, 21, 15).unwrap();
        assert_eq!(daraja_timestamp(at), "20241219102115");
        assert_eq!(parse_daraja_timestamp("20241219102115"), Some(at));
        assert_eq!(parse_daraja_timestamp("not-a-date"), None);
    }

    #[test]
    fn test_whole_units() {
        assert_eq!(whole_units(&BigDecimal::from(1000)).unwrap(), 1000);
        assert_eq!(whole_units(&BigDecimal::from_str("1000.00").unwrap()).unwrap(), 1000);
        assert!(whole_units(&BigDecimal::from_str("10.50").unwrap()).is_err());
        assert!(whole_units(&BigDecimal::from(0)).is_err());
        assert!(whole_units(&BigDecimal::from(-5)).is_err());
    }

    #[test]
    fn test_classify_status() {
        let body = r#"{"requestId":"1","errorCode":"400.002.02","errorMessage":"Bad Request - Invalid Amount"}"#;
        let err = classify_status(StatusCode::BAD_REQUEST, body);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Invalid Amount"));

        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "<html>").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_ensure_accepted() {
        assert!(ensure_accepted("0", "Accept the service request successfully.").is_ok());
        let err = ensure_accepted("1", "Insufficient funds").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_stk_body_field_names() {
        let body = StkPushBody {
            business_short_code: "174379",
            password: "pw".to_string(),
            timestamp: "20241219102115".to_string(),
            transaction_type: "CustomerPayBillOnline",
            amount: 1000,
            party_a: "254712345678",
            party_b: "174379",
            phone_number: "254712345678",
            callback_url: "https://example.com/cb",
            account_reference: "ORDER1",
            transaction_desc: "CraftPay",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["BusinessShortCode"], "174379");
        assert_eq!(json["CallBackURL"], "https://example.com/cb");
        assert_eq!(json["PartyA"], "254712345678");
        assert_eq!(json["Amount"], 1000);
    }

    #[test]
    fn test_reversal_body_uses_gateway_spelling() {
        let body = ReversalBody {
            initiator: "api",
            security_credential: "cred",
            command_id: "TransactionReversal",
            transaction_id: "QKL7XYZ123",
            amount: 1000,
            receiver_party: "174379",
            receiver_identifier_type: "11",
            result_url: "https://example.com/result",
            queue_timeout_url: "https://example.com/timeout",
            remarks: "Buyer rejected product",
            occasion: "RFD-1",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["TransactionID"], "QKL7XYZ123");
        assert_eq!(json["RecieverIdentifierType"], "11");
    }
}
