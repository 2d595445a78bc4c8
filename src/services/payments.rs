use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::connection::DbPool;
use crate::models::parcel::Parcel;
use crate::models::transaction::{MpesaTransaction, TransactionError, TransactionOutcome};
use crate::services::mpesa::{normalize_phone, StkGateway};

/// Rounding policy for the gateway: the fractional part of the amount is
/// truncated toward zero, since the gateway only takes whole units.
pub fn gateway_amount(amount: Decimal) -> i64 {
    amount.trunc().to_i64().unwrap_or(0)
}

/// Result of asking the gateway to prompt the customer's phone. `Accepted`
/// carries everything the caller needs to persist the pending transaction.
#[derive(Debug, Clone)]
pub enum InitiationOutcome {
    Accepted {
        merchant_request_id: String,
        checkout_request_id: String,
        phone_number: String,
        message: String,
    },
    Rejected {
        message: String,
    },
}

impl InitiationOutcome {
    pub fn message(&self) -> &str {
        match self {
            InitiationOutcome::Accepted { message, .. }
            | InitiationOutcome::Rejected { message } => message,
        }
    }
}

const REJECTED_FALLBACK: &str = "Failed to send M-Pesa prompt";
const UNAVAILABLE_MESSAGE: &str = "Payment service temporarily unavailable";

#[derive(Clone)]
pub struct Payments {
    gateway: Arc<dyn StkGateway>,
    country_prefix: String,
}

impl Payments {
    pub fn new(gateway: Arc<dyn StkGateway>, country_prefix: String) -> Self {
        Self {
            gateway,
            country_prefix,
        }
    }

    /// Asks the gateway to prompt `phone` for `amount`, referenced by the
    /// parcel's tracking code. Transport and gateway failures are absorbed
    /// here; the caller only ever sees accepted/rejected.
    pub async fn request_push(
        &self,
        tracking_code: &str,
        phone: &str,
        amount: Decimal,
    ) -> InitiationOutcome {
        let normalized = normalize_phone(phone, &self.country_prefix);

        let response = match self
            .gateway
            .stk_push(&normalized, gateway_amount(amount), tracking_code)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("M-Pesa STK push error for {}: {}", tracking_code, e);
                return InitiationOutcome::Rejected {
                    message: UNAVAILABLE_MESSAGE.to_string(),
                };
            }
        };

        if response.is_accepted() {
            if let (Some(merchant_request_id), Some(checkout_request_id)) =
                (response.merchant_request_id, response.checkout_request_id)
            {
                info!(
                    "STK push accepted for {}: {}",
                    tracking_code, checkout_request_id
                );
                return InitiationOutcome::Accepted {
                    merchant_request_id,
                    checkout_request_id,
                    phone_number: normalized,
                    // The confirmation shown to staff keeps the phone as
                    // it was typed.
                    message: format!("M-Pesa payment prompt sent to {}", phone),
                };
            }

            warn!(
                "STK push for {} accepted without request ids",
                tracking_code
            );
            return InitiationOutcome::Rejected {
                message: REJECTED_FALLBACK.to_string(),
            };
        }

        InitiationOutcome::Rejected {
            message: response
                .response_description
                .unwrap_or_else(|| REJECTED_FALLBACK.to_string()),
        }
    }
}

// --- Callback envelope -----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: CallbackBody,
}

#[derive(Debug, Deserialize)]
pub struct CallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item")]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<serde_json::Value>,
}

const RECEIPT_METADATA_KEY: &str = "MpesaReceiptNumber";

impl StkCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }

    /// Folds the flat name/value metadata list into a map keyed by name.
    pub fn metadata_map(&self) -> HashMap<&str, &serde_json::Value> {
        self.callback_metadata
            .iter()
            .flat_map(|metadata| metadata.items.iter())
            .filter_map(|item| item.value.as_ref().map(|value| (item.name.as_str(), value)))
            .collect()
    }

    pub fn receipt_number(&self) -> Option<String> {
        self.metadata_map()
            .get(RECEIPT_METADATA_KEY)
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

/// Parses the gateway envelope, returning the callback and the raw
/// `stkCallback` object verbatim for the audit column. None means the
/// payload is structurally malformed.
pub fn parse_callback(bytes: &[u8]) -> Option<(StkCallback, serde_json::Value)> {
    let root: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    let raw = root.get("Body")?.get("stkCallback")?.clone();
    let callback: StkCallback = serde_json::from_value(raw.clone()).ok()?;
    Some((callback, raw))
}

// --- Reconciliation --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Payment confirmed; transaction completed and parcel advanced.
    Completed,
    /// Gateway reported a non-zero result; transaction failed.
    Failed,
    /// No transaction carries this checkout id; acknowledged and dropped.
    Unmatched,
    /// The transaction was already terminal; redelivery is a no-op.
    AlreadyFinal,
}

/// Persistence the reconciler needs, behind a seam so its dispatch can be
/// driven in tests the same way `StkGateway` is for the initiator.
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn finalize_transaction(
        &self,
        checkout_request_id: &str,
        outcome: TransactionOutcome,
    ) -> Result<Option<MpesaTransaction>, TransactionError>;

    async fn find_transaction(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<MpesaTransaction>, TransactionError>;

    async fn mark_parcel_received(&self, parcel_id: Uuid) -> Result<bool, TransactionError>;
}

#[async_trait]
impl ReconcileStore for DbPool {
    async fn finalize_transaction(
        &self,
        checkout_request_id: &str,
        outcome: TransactionOutcome,
    ) -> Result<Option<MpesaTransaction>, TransactionError> {
        MpesaTransaction::finalize(self, checkout_request_id, outcome).await
    }

    async fn find_transaction(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<MpesaTransaction>, TransactionError> {
        MpesaTransaction::find_by_checkout_id(self, checkout_request_id).await
    }

    async fn mark_parcel_received(&self, parcel_id: Uuid) -> Result<bool, TransactionError> {
        Ok(Parcel::mark_received_if_pending(self, parcel_id).await?)
    }
}

/// Matches a gateway callback to its pending transaction and applies the
/// terminal state. Safe under duplicate and concurrent delivery: the
/// transaction update is a compare-and-set on `pending`, and the parcel
/// advance only fires on the delivery that won it.
pub async fn reconcile(
    store: &impl ReconcileStore,
    callback: &StkCallback,
    raw_payload: serde_json::Value,
) -> Result<ReconcileOutcome, TransactionError> {
    let outcome = TransactionOutcome {
        result_code: callback.result_code,
        result_desc: callback.result_desc.clone(),
        receipt_number: callback.receipt_number(),
        callback_data: raw_payload,
    };

    let finalized = store
        .finalize_transaction(&callback.checkout_request_id, outcome)
        .await?;

    let transaction = match finalized {
        Some(transaction) => transaction,
        None => {
            // Either the gateway redelivered an already-settled outcome or
            // the checkout id is unknown to us.
            return match store.find_transaction(&callback.checkout_request_id).await? {
                Some(_) => {
                    info!(
                        "Callback redelivered for settled transaction {}",
                        callback.checkout_request_id
                    );
                    Ok(ReconcileOutcome::AlreadyFinal)
                }
                None => {
                    warn!(
                        "Callback for unknown transaction {}",
                        callback.checkout_request_id
                    );
                    Ok(ReconcileOutcome::Unmatched)
                }
            };
        }
    };

    if !callback.is_success() {
        info!(
            "Transaction {} failed: {} ({})",
            callback.checkout_request_id, callback.result_desc, callback.result_code
        );
        return Ok(ReconcileOutcome::Failed);
    }

    let advanced = store.mark_parcel_received(transaction.parcel_id).await?;
    if advanced {
        info!(
            "Payment confirmed, parcel {} marked received",
            transaction.account_reference
        );
    } else {
        warn!(
            "Payment confirmed for parcel {} not awaiting payment; status left unchanged",
            transaction.account_reference
        );
    }

    Ok(ReconcileOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::transaction::TransactionStatus;
    use crate::services::mpesa::{MpesaError, StkPushResponse};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct ScriptedGateway {
        response: Result<StkPushResponse, MpesaError>,
        seen_phone: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl StkGateway for ScriptedGateway {
        async fn stk_push(
            &self,
            phone_number: &str,
            _amount: i64,
            _account_reference: &str,
        ) -> Result<StkPushResponse, MpesaError> {
            *self.seen_phone.lock().unwrap() = Some(phone_number.to_string());
            match &self.response {
                Ok(response) => Ok(response.clone()),
                Err(_) => Err(MpesaError::Auth("503".to_string())),
            }
        }
    }

    fn payments_with(response: Result<StkPushResponse, MpesaError>) -> (Payments, Arc<ScriptedGateway>) {
        let gateway = Arc::new(ScriptedGateway {
            response,
            seen_phone: std::sync::Mutex::new(None),
        });
        (
            Payments::new(gateway.clone(), "254".to_string()),
            gateway,
        )
    }

    fn accepted_response() -> StkPushResponse {
        serde_json::from_value(json!({
            "MerchantRequestID": "m-1",
            "CheckoutRequestID": "ws_CO_1",
            "ResponseCode": "0",
            "ResponseDescription": "Success. Request accepted for processing",
            "CustomerMessage": "Success"
        }))
        .unwrap()
    }

    #[test]
    fn gateway_amount_truncates_toward_zero() {
        assert_eq!(gateway_amount(dec!(150.99)), 150);
        assert_eq!(gateway_amount(dec!(150.01)), 150);
        assert_eq!(gateway_amount(dec!(150)), 150);
        assert_eq!(gateway_amount(dec!(0.75)), 0);
    }

    #[tokio::test]
    async fn accepted_push_carries_ids_and_original_phone() {
        let (payments, gateway) = payments_with(Ok(accepted_response()));

        let outcome = payments
            .request_push("JETABC123", "0712345678", dec!(150.00))
            .await;

        match outcome {
            InitiationOutcome::Accepted {
                merchant_request_id,
                checkout_request_id,
                phone_number,
                message,
            } => {
                assert_eq!(merchant_request_id, "m-1");
                assert_eq!(checkout_request_id, "ws_CO_1");
                assert_eq!(phone_number, "254712345678");
                // The user-facing message keeps the phone as typed.
                assert!(message.contains("0712345678"));
            }
            other => panic!("expected Accepted, got {:?}", other),
        }

        // The gateway itself was called with the normalized number.
        assert_eq!(
            gateway.seen_phone.lock().unwrap().as_deref(),
            Some("254712345678")
        );
    }

    #[tokio::test]
    async fn rejected_push_surfaces_gateway_description() {
        let response: StkPushResponse = serde_json::from_value(json!({
            "ResponseCode": "1",
            "ResponseDescription": "Insufficient balance on shortcode"
        }))
        .unwrap();
        let (payments, _) = payments_with(Ok(response));

        let outcome = payments
            .request_push("JETABC123", "0712345678", dec!(150.00))
            .await;

        match outcome {
            InitiationOutcome::Rejected { message } => {
                assert_eq!(message, "Insufficient balance on shortcode");
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn transport_failure_yields_generic_message() {
        let (payments, _) = payments_with(Err(MpesaError::Auth("503".to_string())));

        let outcome = payments
            .request_push("JETABC123", "0712345678", dec!(150.00))
            .await;

        match outcome {
            InitiationOutcome::Rejected { message } => {
                assert_eq!(message, UNAVAILABLE_MESSAGE);
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn accepted_without_ids_is_rejected() {
        let response: StkPushResponse = serde_json::from_value(json!({
            "ResponseCode": "0",
            "ResponseDescription": "Success"
        }))
        .unwrap();
        let (payments, _) = payments_with(Ok(response));

        let outcome = payments
            .request_push("JETABC123", "0712345678", dec!(150.00))
            .await;

        assert!(matches!(outcome, InitiationOutcome::Rejected { .. }));
    }

    fn success_envelope() -> serde_json::Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "m-1",
                    "CheckoutRequestID": "ws_CO_1",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 150.0},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "TransactionDate", "Value": 20260826121530u64},
                            {"Name": "PhoneNumber", "Value": 254712345678u64}
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn well_formed_callback_parses() {
        let bytes = serde_json::to_vec(&success_envelope()).unwrap();
        let (callback, raw) = parse_callback(&bytes).expect("should parse");

        assert_eq!(callback.checkout_request_id, "ws_CO_1");
        assert_eq!(callback.result_code, 0);
        assert!(callback.is_success());
        assert_eq!(raw["CheckoutRequestID"], "ws_CO_1");
    }

    #[test]
    fn metadata_is_flattened_and_receipt_extracted() {
        let bytes = serde_json::to_vec(&success_envelope()).unwrap();
        let (callback, _) = parse_callback(&bytes).unwrap();

        let metadata = callback.metadata_map();
        assert_eq!(metadata.len(), 4);
        assert_eq!(metadata["Amount"], &json!(150.0));
        assert_eq!(callback.receipt_number().as_deref(), Some("NLJ7RT61SV"));
    }

    #[test]
    fn failure_callback_has_no_metadata_or_receipt() {
        let envelope = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "m-1",
                    "CheckoutRequestID": "ws_CO_1",
                    "ResultCode": 1032,
                    "ResultDesc": "Request cancelled by user"
                }
            }
        });
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let (callback, _) = parse_callback(&bytes).unwrap();

        assert!(!callback.is_success());
        assert!(callback.metadata_map().is_empty());
        assert_eq!(callback.receipt_number(), None);
    }

    #[test]
    fn envelope_without_stk_callback_is_malformed() {
        assert!(parse_callback(br#"{"Body": {}}"#).is_none());
        assert!(parse_callback(br#"{"ResultCode": 0}"#).is_none());
        assert!(parse_callback(b"not json at all").is_none());
    }

    struct ScriptedStore {
        finalized: Option<MpesaTransaction>,
        looked_up: Option<MpesaTransaction>,
        parcel_was_pending: bool,
        finalized_with: std::sync::Mutex<Option<TransactionOutcome>>,
        marked_parcels: std::sync::Mutex<Vec<Uuid>>,
    }

    impl ScriptedStore {
        fn new(
            finalized: Option<MpesaTransaction>,
            looked_up: Option<MpesaTransaction>,
        ) -> Self {
            Self {
                finalized,
                looked_up,
                parcel_was_pending: true,
                finalized_with: std::sync::Mutex::new(None),
                marked_parcels: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReconcileStore for ScriptedStore {
        async fn finalize_transaction(
            &self,
            _checkout_request_id: &str,
            outcome: TransactionOutcome,
        ) -> Result<Option<MpesaTransaction>, TransactionError> {
            *self.finalized_with.lock().unwrap() = Some(outcome);
            Ok(self.finalized.clone())
        }

        async fn find_transaction(
            &self,
            _checkout_request_id: &str,
        ) -> Result<Option<MpesaTransaction>, TransactionError> {
            Ok(self.looked_up.clone())
        }

        async fn mark_parcel_received(
            &self,
            parcel_id: Uuid,
        ) -> Result<bool, TransactionError> {
            self.marked_parcels.lock().unwrap().push(parcel_id);
            Ok(self.parcel_was_pending)
        }
    }

    fn stored_transaction(status: TransactionStatus) -> MpesaTransaction {
        let now = chrono::Utc::now();
        MpesaTransaction {
            id: Uuid::new_v4(),
            parcel_id: Uuid::new_v4(),
            merchant_request_id: "m-1".to_string(),
            checkout_request_id: "ws_CO_1".to_string(),
            phone_number: "254712345678".to_string(),
            amount: dec!(150),
            account_reference: "JETABC123".to_string(),
            status,
            result_code: None,
            result_desc: None,
            receipt_number: None,
            callback_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn callback_with_result(result_code: i32) -> StkCallback {
        let mut envelope = success_envelope();
        envelope["Body"]["stkCallback"]["ResultCode"] = json!(result_code);
        let bytes = serde_json::to_vec(&envelope).unwrap();
        parse_callback(&bytes).unwrap().0
    }

    #[tokio::test]
    async fn successful_callback_completes_and_advances_parcel() {
        let settled = stored_transaction(TransactionStatus::Completed);
        let parcel_id = settled.parcel_id;
        let store = ScriptedStore::new(Some(settled), None);
        let callback = callback_with_result(0);

        let outcome = reconcile(&store, &callback, json!({})).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
        assert_eq!(*store.marked_parcels.lock().unwrap(), vec![parcel_id]);

        let applied = store.finalized_with.lock().unwrap().take().unwrap();
        assert_eq!(applied.final_status(), TransactionStatus::Completed);
        assert_eq!(applied.receipt_number.as_deref(), Some("NLJ7RT61SV"));
    }

    #[tokio::test]
    async fn failed_callback_leaves_parcel_untouched() {
        let settled = stored_transaction(TransactionStatus::Failed);
        let store = ScriptedStore::new(Some(settled), None);
        let callback = callback_with_result(1032);

        let outcome = reconcile(&store, &callback, json!({})).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Failed);
        assert!(store.marked_parcels.lock().unwrap().is_empty());

        let applied = store.finalized_with.lock().unwrap().take().unwrap();
        assert_eq!(applied.final_status(), TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_checkout_id_is_unmatched_without_mutation() {
        let store = ScriptedStore::new(None, None);
        let callback = callback_with_result(0);

        let outcome = reconcile(&store, &callback, json!({})).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unmatched);
        assert!(store.marked_parcels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_callback_is_already_final() {
        let settled = stored_transaction(TransactionStatus::Completed);
        let store = ScriptedStore::new(None, Some(settled));
        let callback = callback_with_result(0);

        let outcome = reconcile(&store, &callback, json!({})).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::AlreadyFinal);
        assert!(store.marked_parcels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn completion_stands_when_parcel_no_longer_awaits_payment() {
        let settled = stored_transaction(TransactionStatus::Completed);
        let mut store = ScriptedStore::new(Some(settled), None);
        store.parcel_was_pending = false;
        let callback = callback_with_result(0);

        let outcome = reconcile(&store, &callback, json!({})).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Completed);
    }

    #[test]
    fn null_metadata_values_are_dropped() {
        let envelope = json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "m-1",
                    "CheckoutRequestID": "ws_CO_1",
                    "ResultCode": 0,
                    "ResultDesc": "ok",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "MpesaReceiptNumber"},
                            {"Name": "Amount", "Value": 10}
                        ]
                    }
                }
            }
        });
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let (callback, _) = parse_callback(&bytes).unwrap();

        assert_eq!(callback.receipt_number(), None);
        assert_eq!(callback.metadata_map().len(), 1);
    }
}
