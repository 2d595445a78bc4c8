use actix_multipart::Multipart;
use actix_web::{web, HttpResponse, Result};
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::database::connection::DbPool;
use crate::models::parcel::{CreateParcel, Parcel, ParcelError, ParcelStatus, UpdateParcel};
use crate::models::party::{Party, PartyUpdatePolicy};
use crate::models::transaction::{CreateTransaction, MpesaTransaction, TransactionError};
use crate::requests::parcel::{parse_parcel_form, ParcelForm};
use crate::services::notify::Notifier;
use crate::services::payments::{InitiationOutcome, Payments};
use crate::services::storage::{ImageStorage, StorageError};
use crate::utils::helpers::ApiResponse;

#[derive(Error, Debug)]
enum WriteError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Parcel(#[from] ParcelError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

pub async fn index(pool: web::Data<DbPool>) -> Result<HttpResponse> {
    info!("Listing parcels");

    match Parcel::find_all_with_parties(&pool).await {
        Ok(parcels) => Ok(HttpResponse::Ok().json(ApiResponse::success(parcels))),
        Err(e) => {
            error!("Database error listing parcels: {}", e);
            Ok(
                HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to retrieve parcels".to_string(),
                )),
            )
        }
    }
}

pub async fn store(
    pool: web::Data<DbPool>,
    payments: web::Data<Payments>,
    storage: web::Data<ImageStorage>,
    payload: Multipart,
) -> Result<HttpResponse> {
    let form = match parse_parcel_form(payload).await {
        Ok(form) => form,
        Err(errors) => {
            return Ok(
                HttpResponse::UnprocessableEntity().json(ApiResponse::<()>::validation(errors))
            );
        }
    };

    info!(
        "Registering parcel {} -> {}",
        form.origin_town, form.destination_town
    );

    let duplicate = match &form.idempotency_key {
        Some(key) => Parcel::idempotency_key_exists(&pool, key).await,
        None => {
            Parcel::recent_duplicate_exists(
                &pool,
                &form.payment_phone,
                form.amount,
                &form.destination_town,
            )
            .await
        }
    };

    match duplicate {
        Ok(false) => {}
        Ok(true) => {
            info!("Duplicate parcel submission rejected");
            return Ok(HttpResponse::Conflict().json(ApiResponse::<()>::error(
                ParcelError::DuplicateSubmission.to_string(),
            )));
        }
        Err(e) => {
            error!("Database error checking for duplicates: {}", e);
            return Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                "Failed to create parcel. Please try again.".to_string(),
            )));
        }
    }

    // The image lands on disk before the database writes; it is removed
    // again if the registration rolls back.
    let image_path = match &form.image {
        Some(image) => match storage.store(&image.bytes, image.extension).await {
            Ok(path) => Some(path),
            Err(StorageError::TooLarge) => {
                return Ok(HttpResponse::UnprocessableEntity().json(
                    ApiResponse::<()>::validation(vec![StorageError::TooLarge.to_string()]),
                ));
            }
            Err(e) => {
                error!("Failed to store parcel image: {}", e);
                return Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to create parcel. Please try again.".to_string(),
                )));
            }
        },
        None => None,
    };

    match register(&pool, &payments, &form, image_path.clone()).await {
        Ok((parcel, initiation)) => {
            info!("Parcel {} registered", parcel.tracking_code);
            Ok(HttpResponse::Created().json(ApiResponse::success_with_message(
                parcel,
                initiation.message().to_string(),
            )))
        }
        Err(e) => {
            error!("Parcel registration error: {}", e);
            if let Some(path) = image_path {
                storage.remove(&path).await;
            }
            Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                "Failed to create parcel. Please try again.".to_string(),
            )))
        }
    }
}

/// The registration unit-of-work: parties, parcel and (when the gateway
/// accepts) the pending transaction commit together or not at all. A
/// rejected or unreachable gateway is not an error; the parcel stays
/// `pending_payment` with no transaction.
async fn register(
    pool: &DbPool,
    payments: &Payments,
    form: &ParcelForm,
    image_path: Option<String>,
) -> Result<(Parcel, InitiationOutcome), WriteError> {
    let mut tx = pool.begin().await?;

    let sender =
        Party::upsert_by_phone(&mut tx, form.sender.clone(), PartyUpdatePolicy::Preserve)
            .await?
            .into_party();
    let recipient =
        Party::upsert_by_phone(&mut tx, form.recipient.clone(), PartyUpdatePolicy::Preserve)
            .await?
            .into_party();

    let parcel = Parcel::create(
        &mut tx,
        CreateParcel {
            sender_id: sender.id,
            origin_town: form.origin_town.clone(),
            recipient_id: recipient.id,
            destination_town: form.destination_town.clone(),
            destination_address: form.destination_address.clone(),
            description: form.description.clone(),
            image_path,
            amount: form.amount,
            payment_phone: form.payment_phone.clone(),
            idempotency_key: form.idempotency_key.clone(),
        },
    )
    .await?;

    let initiation = payments
        .request_push(&parcel.tracking_code, &form.payment_phone, form.amount)
        .await;

    if let InitiationOutcome::Accepted {
        merchant_request_id,
        checkout_request_id,
        phone_number,
        ..
    } = &initiation
    {
        MpesaTransaction::create_pending(
            &mut tx,
            CreateTransaction {
                parcel_id: parcel.id,
                merchant_request_id: merchant_request_id.clone(),
                checkout_request_id: checkout_request_id.clone(),
                phone_number: phone_number.clone(),
                amount: form.amount,
                account_reference: parcel.tracking_code.clone(),
            },
        )
        .await?;
    }

    // The pending transaction is durable before the response leaves, so a
    // callback can always find its row.
    tx.commit().await?;

    Ok((parcel, initiation))
}

pub async fn update(
    pool: web::Data<DbPool>,
    storage: web::Data<ImageStorage>,
    notifier: web::Data<Notifier>,
    path: web::Path<Uuid>,
    payload: Multipart,
) -> Result<HttpResponse> {
    let parcel_id = path.into_inner();

    let form = match parse_parcel_form(payload).await {
        Ok(form) => form,
        Err(errors) => {
            return Ok(
                HttpResponse::UnprocessableEntity().json(ApiResponse::<()>::validation(errors))
            );
        }
    };

    let Some(status) = form.status else {
        return Ok(
            HttpResponse::UnprocessableEntity().json(ApiResponse::<()>::validation(vec![
                "The status field is required.".to_string(),
            ])),
        );
    };

    info!("Updating parcel {}", parcel_id);

    let existing = match Parcel::find_by_id(&pool, parcel_id).await {
        Ok(Some(parcel)) => parcel,
        Ok(None) => {
            return Ok(HttpResponse::NotFound()
                .json(ApiResponse::<()>::error("Parcel not found".to_string())));
        }
        Err(e) => {
            error!("Database error loading parcel {}: {}", parcel_id, e);
            return Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                "Failed to update parcel. Please try again.".to_string(),
            )));
        }
    };

    // Any replacement lands on disk first; the old file only goes once the
    // row no longer references it, and the new file goes if the row update
    // fails.
    let replacement = match &form.image {
        Some(image) => match storage.store(&image.bytes, image.extension).await {
            Ok(path) => Some(path),
            Err(StorageError::TooLarge) => {
                return Ok(HttpResponse::UnprocessableEntity().json(
                    ApiResponse::<()>::validation(vec![StorageError::TooLarge.to_string()]),
                ));
            }
            Err(e) => {
                error!("Failed to store replacement image: {}", e);
                return Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to update parcel. Please try again.".to_string(),
                )));
            }
        },
        None => None,
    };

    let change = ImageChange {
        current: existing.image_path.clone(),
        replacement,
        remove_requested: form.remove_image,
    };

    match apply_update(&pool, parcel_id, &form, status, change.target()).await {
        Ok(parcel) => {
            if let Some(old) = change.discard_on_success() {
                storage.remove(old).await;
            }

            if status == ParcelStatus::Delivered && existing.status != ParcelStatus::Delivered {
                notifier
                    .send_delivery_note(
                        &form.recipient.phone,
                        &form.recipient.first_name,
                        &parcel.tracking_code,
                        &parcel.origin_town,
                        &parcel.destination_address,
                    )
                    .await;
            }

            info!("Parcel {} updated", parcel.tracking_code);
            Ok(HttpResponse::Ok().json(ApiResponse::success_with_message(
                parcel,
                "Parcel updated successfully".to_string(),
            )))
        }
        Err(e) => {
            if let Some(orphaned) = change.discard_on_failure() {
                storage.remove(orphaned).await;
            }

            match e {
                WriteError::Parcel(ParcelError::NotFound { .. }) => Ok(HttpResponse::NotFound()
                    .json(ApiResponse::<()>::error("Parcel not found".to_string()))),
                e => {
                    error!("Parcel update error: {}", e);
                    Ok(HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                        "Failed to update parcel. Please try again.".to_string(),
                    )))
                }
            }
        }
    }
}

/// What happens to a parcel's stored image across an edit. The stored row
/// keeps pointing at the current file until the update succeeds, so a
/// failed update never leaves the row referencing a deleted file.
struct ImageChange {
    current: Option<String>,
    replacement: Option<String>,
    remove_requested: bool,
}

impl ImageChange {
    /// Path the updated row should carry.
    fn target(&self) -> Option<String> {
        if self.replacement.is_some() {
            self.replacement.clone()
        } else if self.remove_requested {
            None
        } else {
            self.current.clone()
        }
    }

    /// The freshly written file, orphaned if the row update failed.
    fn discard_on_failure(&self) -> Option<&str> {
        self.replacement.as_deref()
    }

    /// The superseded file, safe to delete once the row points elsewhere.
    fn discard_on_success(&self) -> Option<&str> {
        if self.replacement.is_some() || self.remove_requested {
            self.current.as_deref()
        } else {
            None
        }
    }
}

async fn apply_update(
    pool: &DbPool,
    id: Uuid,
    form: &ParcelForm,
    status: ParcelStatus,
    image_path: Option<String>,
) -> Result<Parcel, WriteError> {
    let mut tx = pool.begin().await?;

    // The edit form is authoritative, so repeat submissions replace the
    // stored party details.
    let sender =
        Party::upsert_by_phone(&mut tx, form.sender.clone(), PartyUpdatePolicy::Overwrite)
            .await?
            .into_party();
    let recipient =
        Party::upsert_by_phone(&mut tx, form.recipient.clone(), PartyUpdatePolicy::Overwrite)
            .await?
            .into_party();

    let parcel = Parcel::update(
        &mut tx,
        id,
        UpdateParcel {
            sender_id: sender.id,
            origin_town: form.origin_town.clone(),
            recipient_id: recipient.id,
            destination_town: form.destination_town.clone(),
            destination_address: form.destination_address.clone(),
            description: form.description.clone(),
            image_path,
            amount: form.amount,
            payment_phone: form.payment_phone.clone(),
            status,
        },
    )
    .await?;

    tx.commit().await?;

    Ok(parcel)
}

pub async fn destroy(
    pool: web::Data<DbPool>,
    storage: web::Data<ImageStorage>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let parcel_id = path.into_inner();
    info!("Deleting parcel {}", parcel_id);

    match Parcel::delete(&pool, parcel_id).await {
        Ok(parcel) => {
            if let Some(image) = parcel.image_path {
                storage.remove(&image).await;
            }
            Ok(HttpResponse::Ok().json(ApiResponse::<()>::success(())))
        }
        Err(ParcelError::NotFound { .. }) => Ok(HttpResponse::NotFound()
            .json(ApiResponse::<()>::error("Parcel not found".to_string()))),
        Err(e) => {
            error!("Database error deleting parcel: {}", e);
            Ok(
                HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to delete parcel".to_string(),
                )),
            )
        }
    }
}
