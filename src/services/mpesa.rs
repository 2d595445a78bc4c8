use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::MpesaConfig;

#[derive(Error, Debug)]
pub enum MpesaError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("M-Pesa auth failed: {0}")]
    Auth(String),
    #[error("M-Pesa gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },
}

/// Rewrites a local-format mobile number to international form: a leading
/// `0` becomes the country calling code, a leading `+` is stripped.
pub fn normalize_phone(phone: &str, country_prefix: &str) -> String {
    let phone = phone.trim();
    let phone = phone.strip_prefix('+').unwrap_or(phone);

    match phone.strip_prefix('0') {
        Some(rest) => format!("{}{}", country_prefix, rest),
        None => phone.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
}

#[derive(Debug, Serialize)]
struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: String,
    #[serde(rename = "Password")]
    password: String,
    #[serde(rename = "Timestamp")]
    timestamp: String,
    #[serde(rename = "TransactionType")]
    transaction_type: String,
    #[serde(rename = "Amount")]
    amount: String,
    #[serde(rename = "PartyA")]
    party_a: String,
    #[serde(rename = "PartyB")]
    party_b: String,
    #[serde(rename = "PhoneNumber")]
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    #[serde(rename = "AccountReference")]
    account_reference: String,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: String,
}

/// Gateway reply to an STK push. A rejection may omit the request ids, so
/// every field is optional and acceptance is decided by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode")]
    pub response_code: Option<String>,
    #[serde(rename = "ResponseDescription")]
    pub response_description: Option<String>,
    #[serde(rename = "CustomerMessage")]
    pub customer_message: Option<String>,
}

impl StkPushResponse {
    pub fn is_accepted(&self) -> bool {
        self.response_code.as_deref() == Some("0")
    }
}

/// Seam for the outbound push-payment call, so the initiation flow can be
/// exercised without the live gateway.
#[async_trait]
pub trait StkGateway: Send + Sync {
    async fn stk_push(
        &self,
        phone_number: &str,
        amount: i64,
        account_reference: &str,
    ) -> Result<StkPushResponse, MpesaError>;
}

pub struct DarajaClient {
    config: MpesaConfig,
    client: Client,
    cached_token: RwLock<Option<(String, DateTime<Utc>)>>,
}

impl DarajaClient {
    pub fn new(config: MpesaConfig) -> Result<Self, MpesaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(DarajaClient {
            config,
            client,
            cached_token: RwLock::new(None),
        })
    }

    fn generate_password(&self, timestamp: &str) -> String {
        base64.encode(format!(
            "{}{}{}",
            self.config.short_code, self.config.passkey, timestamp
        ))
    }

    async fn access_token(&self) -> Result<String, MpesaError> {
        {
            let cached = self.cached_token.read().await;
            if let Some((token, expiry)) = cached.as_ref() {
                if *expiry > Utc::now() + chrono::Duration::minutes(5) {
                    return Ok(token.clone());
                }
            }
        }

        info!("Requesting new M-Pesa access token");
        let encoded_auth = base64.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url()
        );

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("M-Pesa auth failed: {} - {}", status, body);
            return Err(MpesaError::Auth(status.to_string()));
        }

        let auth: AuthResponse = response.json().await?;

        {
            // Daraja tokens last an hour.
            let expiry = Utc::now() + chrono::Duration::hours(1);
            let mut cached = self.cached_token.write().await;
            *cached = Some((auth.access_token.clone(), expiry));
        }

        Ok(auth.access_token)
    }
}

#[async_trait]
impl StkGateway for DarajaClient {
    async fn stk_push(
        &self,
        phone_number: &str,
        amount: i64,
        account_reference: &str,
    ) -> Result<StkPushResponse, MpesaError> {
        info!("STK push for {} - KSh {}", phone_number, amount);

        let access_token = self.access_token().await?;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let password = self.generate_password(&timestamp);

        let request = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount: amount.to_string(),
            party_a: phone_number.to_string(),
            party_b: self.config.short_code.clone(),
            phone_number: phone_number.to_string(),
            callback_url: self.config.callback_url.clone(),
            account_reference: account_reference.to_string(),
            transaction_desc: format!("Parcel {}", account_reference),
        };

        let url = format!("{}/mpesa/stkpush/v1/processrequest", self.config.base_url());

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", access_token))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("STK push failed: {} - {}", status, body);
            return Err(MpesaError::Gateway {
                status: status.as_u16(),
                body,
            });
        }

        let stk_response: StkPushResponse = response.json().await?;
        Ok(stk_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_zero_prefix_is_rewritten() {
        assert_eq!(normalize_phone("0712345678", "254"), "254712345678");
    }

    #[test]
    fn plus_prefix_is_stripped() {
        assert_eq!(normalize_phone("+254712345678", "254"), "254712345678");
    }

    #[test]
    fn normalized_input_is_unchanged() {
        assert_eq!(normalize_phone("254712345678", "254"), "254712345678");
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        assert_eq!(normalize_phone(" 0712345678 ", "254"), "254712345678");
    }

    #[test]
    fn rejection_without_ids_is_not_accepted() {
        let response: StkPushResponse = serde_json::from_str(
            r#"{"requestId":"1-1","errorCode":"500.001.1001","errorMessage":"Invalid Amount"}"#,
        )
        .expect("rejection body should still parse");
        assert!(!response.is_accepted());
        assert!(response.merchant_request_id.is_none());
    }

    #[test]
    fn acceptance_requires_zero_response_code() {
        let response: StkPushResponse = serde_json::from_str(
            r#"{"MerchantRequestID":"m-1","CheckoutRequestID":"ws_CO_1","ResponseCode":"0","ResponseDescription":"Success. Request accepted for processing","CustomerMessage":"Success"}"#,
        )
        .expect("acceptance body should parse");
        assert!(response.is_accepted());
        assert_eq!(response.checkout_request_id.as_deref(), Some("ws_CO_1"));
    }
}
