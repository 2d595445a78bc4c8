use crate::database::connection::DbPool;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Type};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

/// One push-payment attempt. Created `pending` when the gateway accepts
/// the STK push; finalized exactly once by the callback reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MpesaTransaction {
    pub id: Uuid,
    pub parcel_id: Uuid,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub phone_number: String,
    pub amount: Decimal,
    pub account_reference: String,
    pub status: TransactionStatus,
    pub result_code: Option<i32>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub callback_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransaction {
    pub parcel_id: Uuid,
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub phone_number: String,
    pub amount: Decimal,
    pub account_reference: String,
}

/// Terminal result applied by the reconciler.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub result_code: i32,
    pub result_desc: String,
    pub receipt_number: Option<String>,
    pub callback_data: serde_json::Value,
}

impl TransactionOutcome {
    pub fn final_status(&self) -> TransactionStatus {
        if self.result_code == 0 {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        }
    }
}

/// Listing row joined with the owning parcel's tracking code.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TransactionWithParcel {
    pub id: Uuid,
    pub parcel_id: Uuid,
    pub tracking_code: String,
    pub phone_number: String,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub result_code: Option<i32>,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MpesaTransaction {
    pub async fn create_pending(
        conn: &mut PgConnection,
        transaction: CreateTransaction,
    ) -> Result<Self, TransactionError> {
        let now = Utc::now();

        let transaction = sqlx::query_as::<_, MpesaTransaction>(
            "INSERT INTO mpesa_transactions (id, parcel_id, merchant_request_id,
                                             checkout_request_id, phone_number, amount,
                                             account_reference, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(transaction.parcel_id)
        .bind(transaction.merchant_request_id)
        .bind(transaction.checkout_request_id)
        .bind(transaction.phone_number)
        .bind(transaction.amount)
        .bind(transaction.account_reference)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;

        Ok(transaction)
    }

    pub async fn find_by_checkout_id(
        pool: &DbPool,
        checkout_request_id: &str,
    ) -> Result<Option<Self>, TransactionError> {
        let transaction = sqlx::query_as::<_, MpesaTransaction>(
            "SELECT * FROM mpesa_transactions WHERE checkout_request_id = $1",
        )
        .bind(checkout_request_id)
        .fetch_optional(pool)
        .await?;

        Ok(transaction)
    }

    /// Compare-and-set finalization: only a still-pending transaction is
    /// updated, so duplicate or concurrent callback deliveries settle the
    /// row at most once. Returns None when no pending row matched.
    pub async fn finalize(
        pool: &DbPool,
        checkout_request_id: &str,
        outcome: TransactionOutcome,
    ) -> Result<Option<Self>, TransactionError> {
        let status = outcome.final_status();

        let transaction = sqlx::query_as::<_, MpesaTransaction>(
            "UPDATE mpesa_transactions
             SET result_code = $2, result_desc = $3, receipt_number = $4,
                 callback_data = $5, status = $6, updated_at = $7
             WHERE checkout_request_id = $1 AND status = 'pending'
             RETURNING *",
        )
        .bind(checkout_request_id)
        .bind(outcome.result_code)
        .bind(outcome.result_desc)
        .bind(outcome.receipt_number)
        .bind(outcome.callback_data)
        .bind(status)
        .bind(Utc::now())
        .fetch_optional(pool)
        .await?;

        Ok(transaction)
    }

    pub async fn find_all_with_parcel(
        pool: &DbPool,
    ) -> Result<Vec<TransactionWithParcel>, TransactionError> {
        let transactions = sqlx::query_as::<_, TransactionWithParcel>(
            "SELECT t.id, t.parcel_id, p.tracking_code, t.phone_number, t.amount,
                    t.status, t.result_code, t.result_desc, t.receipt_number, t.created_at
             FROM mpesa_transactions t
             JOIN parcels p ON p.id = t.parcel_id
             ORDER BY t.created_at DESC",
        )
        .fetch_all(pool)
        .await?;

        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(result_code: i32) -> TransactionOutcome {
        TransactionOutcome {
            result_code,
            result_desc: "desc".to_string(),
            receipt_number: None,
            callback_data: json!({}),
        }
    }

    #[test]
    fn zero_result_code_completes() {
        assert_eq!(outcome(0).final_status(), TransactionStatus::Completed);
    }

    #[test]
    fn nonzero_result_code_fails() {
        assert_eq!(outcome(1).final_status(), TransactionStatus::Failed);
        assert_eq!(outcome(1032).final_status(), TransactionStatus::Failed);
        assert_eq!(outcome(-1).final_status(), TransactionStatus::Failed);
    }
}
