use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

/// A person referenced by a parcel, as sender or recipient. The phone
/// number is the natural key: the same person re-submitted under the
/// same phone resolves to the existing row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Party {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub national_id: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertParty {
    pub first_name: String,
    pub last_name: String,
    pub national_id: String,
    pub phone: String,
}

/// What to do with name/id fields when the phone number already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyUpdatePolicy {
    /// Keep the stored fields, ignore the submitted ones.
    Preserve,
    /// Replace the stored fields with the submitted ones.
    Overwrite,
}

#[derive(Debug, Clone)]
pub enum PartyUpsert {
    Created(Party),
    Matched(Party),
}

impl PartyUpsert {
    pub fn into_party(self) -> Party {
        match self {
            PartyUpsert::Created(party) | PartyUpsert::Matched(party) => party,
        }
    }
}

impl Party {
    pub async fn find_by_phone(
        conn: &mut PgConnection,
        phone: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        let party = sqlx::query_as::<_, Party>("SELECT * FROM parties WHERE phone = $1")
            .bind(phone)
            .fetch_optional(conn)
            .await?;

        Ok(party)
    }

    pub async fn upsert_by_phone(
        conn: &mut PgConnection,
        details: UpsertParty,
        policy: PartyUpdatePolicy,
    ) -> Result<PartyUpsert, sqlx::Error> {
        if let Some(existing) = Self::find_by_phone(&mut *conn, &details.phone).await? {
            return match policy {
                PartyUpdatePolicy::Preserve => Ok(PartyUpsert::Matched(existing)),
                PartyUpdatePolicy::Overwrite => {
                    let updated = sqlx::query_as::<_, Party>(
                        "UPDATE parties
                         SET first_name = $2, last_name = $3, national_id = $4, updated_at = $5
                         WHERE id = $1
                         RETURNING *",
                    )
                    .bind(existing.id)
                    .bind(details.first_name)
                    .bind(details.last_name)
                    .bind(details.national_id)
                    .bind(Utc::now())
                    .fetch_one(conn)
                    .await?;

                    Ok(PartyUpsert::Matched(updated))
                }
            };
        }

        let now = Utc::now();

        let party = sqlx::query_as::<_, Party>(
            "INSERT INTO parties (id, first_name, last_name, national_id, phone, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(details.first_name)
        .bind(details.last_name)
        .bind(details.national_id)
        .bind(details.phone)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await?;

        Ok(PartyUpsert::Created(party))
    }
}
