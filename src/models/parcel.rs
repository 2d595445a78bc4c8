use crate::database::connection::DbPool;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, Type};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ParcelError {
    #[error("Parcel with ID {id} not found")]
    NotFound { id: Uuid },
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("A similar parcel was just created. Please wait a moment before submitting again.")]
    DuplicateSubmission,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Type, PartialEq, Eq)]
#[sqlx(type_name = "parcel_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ParcelStatus {
    PendingPayment,
    Received,
    InTransit,
    Delivered,
}

impl ParcelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParcelStatus::PendingPayment => "pending_payment",
            ParcelStatus::Received => "received",
            ParcelStatus::InTransit => "in_transit",
            ParcelStatus::Delivered => "delivered",
        }
    }
}

impl FromStr for ParcelStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(ParcelStatus::PendingPayment),
            "received" => Ok(ParcelStatus::Received),
            "in_transit" => Ok(ParcelStatus::InTransit),
            "delivered" => Ok(ParcelStatus::Delivered),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Parcel {
    pub id: Uuid,
    pub tracking_code: String,
    pub sender_id: Uuid,
    pub origin_town: String,
    pub recipient_id: Uuid,
    pub destination_town: String,
    pub destination_address: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub amount: Decimal,
    pub payment_phone: String,
    pub idempotency_key: Option<String>,
    pub status: ParcelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateParcel {
    pub sender_id: Uuid,
    pub origin_town: String,
    pub recipient_id: Uuid,
    pub destination_town: String,
    pub destination_address: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub amount: Decimal,
    pub payment_phone: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateParcel {
    pub sender_id: Uuid,
    pub origin_town: String,
    pub recipient_id: Uuid,
    pub destination_town: String,
    pub destination_address: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub amount: Decimal,
    pub payment_phone: String,
    pub status: ParcelStatus,
}

/// Listing row: a parcel joined with its parties and the receipt of its
/// latest completed transaction, if any.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ParcelWithParties {
    pub id: Uuid,
    pub tracking_code: String,
    pub origin_town: String,
    pub destination_town: String,
    pub destination_address: String,
    pub description: Option<String>,
    pub image_path: Option<String>,
    pub amount: Decimal,
    pub payment_phone: String,
    pub status: ParcelStatus,
    pub created_at: DateTime<Utc>,
    pub sender_first_name: String,
    pub sender_last_name: String,
    pub sender_phone: String,
    pub recipient_first_name: String,
    pub recipient_last_name: String,
    pub recipient_phone: String,
    pub receipt_number: Option<String>,
}

const TRACKING_PREFIX: &str = "JET";
const TRACKING_RANDOM_LEN: usize = 6;

pub fn generate_tracking_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRACKING_RANDOM_LEN)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();

    format!("{}{}", TRACKING_PREFIX, suffix)
}

const PARCEL_WITH_PARTIES_SQL: &str = "SELECT p.id, p.tracking_code, p.origin_town, p.destination_town,
            p.destination_address, p.description, p.image_path, p.amount,
            p.payment_phone, p.status, p.created_at,
            s.first_name AS sender_first_name, s.last_name AS sender_last_name,
            s.phone AS sender_phone,
            r.first_name AS recipient_first_name, r.last_name AS recipient_last_name,
            r.phone AS recipient_phone,
            t.receipt_number
     FROM parcels p
     JOIN parties s ON s.id = p.sender_id
     JOIN parties r ON r.id = p.recipient_id
     LEFT JOIN LATERAL (
         SELECT receipt_number FROM mpesa_transactions
         WHERE parcel_id = p.id AND status = 'completed'
         ORDER BY updated_at DESC
         LIMIT 1
     ) t ON TRUE
     ORDER BY p.created_at DESC";

impl Parcel {
    pub const DUPLICATE_WINDOW_MINUTES: i64 = 5;

    /// Heuristic duplicate-submission guard: same payment phone, amount and
    /// destination town within the trailing window.
    pub async fn recent_duplicate_exists(
        pool: &DbPool,
        payment_phone: &str,
        amount: Decimal,
        destination_town: &str,
    ) -> Result<bool, sqlx::Error> {
        let found: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM parcels
             WHERE payment_phone = $1 AND amount = $2 AND destination_town = $3
               AND created_at > now() - make_interval(mins => $4)
             LIMIT 1",
        )
        .bind(payment_phone)
        .bind(amount)
        .bind(destination_town)
        .bind(Self::DUPLICATE_WINDOW_MINUTES as i32)
        .fetch_optional(pool)
        .await?;

        Ok(found.is_some())
    }

    pub async fn idempotency_key_exists(pool: &DbPool, key: &str) -> Result<bool, sqlx::Error> {
        let found: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM parcels WHERE idempotency_key = $1 LIMIT 1")
                .bind(key)
                .fetch_optional(pool)
                .await?;

        Ok(found.is_some())
    }

    pub async fn create(
        conn: &mut PgConnection,
        parcel: CreateParcel,
    ) -> Result<Self, ParcelError> {
        let now = Utc::now();

        let parcel = sqlx::query_as::<_, Parcel>(
            "INSERT INTO parcels (id, tracking_code, sender_id, origin_town, recipient_id,
                                  destination_town, destination_address, description, image_path,
                                  amount, payment_phone, idempotency_key, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(generate_tracking_code())
        .bind(parcel.sender_id)
        .bind(parcel.origin_town)
        .bind(parcel.recipient_id)
        .bind(parcel.destination_town)
        .bind(parcel.destination_address)
        .bind(parcel.description)
        .bind(parcel.image_path)
        .bind(parcel.amount)
        .bind(parcel.payment_phone)
        .bind(parcel.idempotency_key)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;

        Ok(parcel)
    }

    pub async fn find_by_id(pool: &DbPool, id: Uuid) -> Result<Option<Self>, ParcelError> {
        let parcel = sqlx::query_as::<_, Parcel>("SELECT * FROM parcels WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(parcel)
    }

    pub async fn find_all_with_parties(pool: &DbPool) -> Result<Vec<ParcelWithParties>, ParcelError> {
        let parcels = sqlx::query_as::<_, ParcelWithParties>(PARCEL_WITH_PARTIES_SQL)
            .fetch_all(pool)
            .await?;

        Ok(parcels)
    }

    pub async fn find_recent(pool: &DbPool, limit: i64) -> Result<Vec<ParcelWithParties>, ParcelError> {
        let sql = format!("{} LIMIT $1", PARCEL_WITH_PARTIES_SQL);
        let parcels = sqlx::query_as::<_, ParcelWithParties>(&sql)
            .bind(limit)
            .fetch_all(pool)
            .await?;

        Ok(parcels)
    }

    pub async fn update(
        conn: &mut PgConnection,
        id: Uuid,
        update_data: UpdateParcel,
    ) -> Result<Self, ParcelError> {
        let updated = sqlx::query_as::<_, Parcel>(
            "UPDATE parcels
             SET sender_id = $2, origin_town = $3, recipient_id = $4, destination_town = $5,
                 destination_address = $6, description = $7, image_path = $8, amount = $9,
                 payment_phone = $10, status = $11, updated_at = $12
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(update_data.sender_id)
        .bind(update_data.origin_town)
        .bind(update_data.recipient_id)
        .bind(update_data.destination_town)
        .bind(update_data.destination_address)
        .bind(update_data.description)
        .bind(update_data.image_path)
        .bind(update_data.amount)
        .bind(update_data.payment_phone)
        .bind(update_data.status)
        .bind(Utc::now())
        .fetch_optional(conn)
        .await?;

        updated.ok_or(ParcelError::NotFound { id })
    }

    /// Transition fired by a successful payment. Only a parcel still
    /// awaiting payment advances; any other current status is left alone
    /// and the caller logs the skip.
    pub async fn mark_received_if_pending(pool: &DbPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE parcels SET status = 'received', updated_at = $2
             WHERE id = $1 AND status = 'pending_payment'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Deletes the row and returns it so the caller can clean up the
    /// stored image. Transactions go with it via the FK cascade.
    pub async fn delete(pool: &DbPool, id: Uuid) -> Result<Self, ParcelError> {
        let deleted = sqlx::query_as::<_, Parcel>("DELETE FROM parcels WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        deleted.ok_or(ParcelError::NotFound { id })
    }
}
