use actix_web::{web, HttpResponse, Result};
use serde_json::json;
use tracing::{error, info, warn};

use crate::database::connection::DbPool;
use crate::services::payments::{parse_callback, reconcile};

fn ack_accepted() -> HttpResponse {
    HttpResponse::Ok().json(json!({"ResultCode": 0, "ResultDesc": "Accepted"}))
}

fn ack_invalid() -> HttpResponse {
    HttpResponse::Ok().json(json!({"ResultCode": 1, "ResultDesc": "Invalid"}))
}

/// Gateway-facing callback endpoint. The acknowledgment is about receipt
/// of the payload, not the business outcome: anything structurally parsed
/// is accepted, including callbacks for transactions we do not know.
pub async fn callback(pool: web::Data<DbPool>, body: web::Bytes) -> Result<HttpResponse> {
    info!("M-Pesa callback received ({} bytes)", body.len());

    let Some((callback, raw_payload)) = parse_callback(&body) else {
        warn!("Invalid M-Pesa callback: no stkCallback found");
        return Ok(ack_invalid());
    };

    info!(
        "Callback for {}: result {} ({})",
        callback.checkout_request_id, callback.result_code, callback.result_desc
    );

    match reconcile(pool.get_ref(), &callback, raw_payload).await {
        Ok(outcome) => {
            info!(
                "Callback for {} reconciled: {:?}",
                callback.checkout_request_id, outcome
            );
        }
        Err(e) => {
            // Still acknowledged; the gateway does not redeliver based on
            // the response body and the operator sees the log.
            error!(
                "Failed to reconcile callback for {}: {}",
                callback.checkout_request_id, e
            );
        }
    }

    Ok(ack_accepted())
}
