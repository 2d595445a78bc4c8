use actix_web::{web, HttpResponse, Result};
use tracing::{error, info};

use crate::database::connection::DbPool;
use crate::models::transaction::MpesaTransaction;
use crate::utils::helpers::ApiResponse;

pub async fn index(pool: web::Data<DbPool>) -> Result<HttpResponse> {
    info!("Listing transactions");

    match MpesaTransaction::find_all_with_parcel(&pool).await {
        Ok(transactions) => Ok(HttpResponse::Ok().json(ApiResponse::success(transactions))),
        Err(e) => {
            error!("Database error listing transactions: {}", e);
            Ok(
                HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to retrieve transactions".to_string(),
                )),
            )
        }
    }
}
