use actix_web::{web, HttpResponse, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{error, info};

use crate::database::connection::DbPool;
use crate::models::parcel::{Parcel, ParcelStatus, ParcelWithParties};
use crate::utils::helpers::ApiResponse;

#[derive(Debug, Serialize)]
pub struct DashboardStats {
    pub total_parcels: i64,
    pub pending_payment: i64,
    pub in_transit: i64,
    pub delivered: i64,
    pub total_revenue: Decimal,
    pub pending_revenue: Decimal,
    pub total_customers: i64,
}

#[derive(Debug, Serialize)]
pub struct MonthlyRevenue {
    pub month: String,
    pub revenue: Decimal,
}

#[derive(Debug, Serialize)]
pub struct Dashboard {
    pub stats: DashboardStats,
    pub recent_parcels: Vec<ParcelWithParties>,
    pub parcels_by_status: HashMap<&'static str, i64>,
    pub revenue_by_month: Vec<MonthlyRevenue>,
}

pub async fn index(pool: web::Data<DbPool>) -> Result<HttpResponse> {
    info!("Loading dashboard");

    match load(&pool).await {
        Ok(dashboard) => Ok(HttpResponse::Ok().json(ApiResponse::success(dashboard))),
        Err(e) => {
            error!("Database error loading dashboard: {}", e);
            Ok(
                HttpResponse::InternalServerError().json(ApiResponse::<()>::error(
                    "Failed to load dashboard".to_string(),
                )),
            )
        }
    }
}

async fn load(pool: &DbPool) -> Result<Dashboard, anyhow::Error> {
    let status_counts: Vec<(ParcelStatus, i64)> =
        sqlx::query_as("SELECT status, count(*) FROM parcels GROUP BY status")
            .fetch_all(pool)
            .await?;

    let parcels_by_status: HashMap<&'static str, i64> = status_counts
        .iter()
        .map(|(status, count)| (status.as_str(), *count))
        .collect();

    let count_for =
        |status: ParcelStatus| parcels_by_status.get(status.as_str()).copied().unwrap_or(0);
    let total_parcels: i64 = status_counts.iter().map(|(_, count)| count).sum();
    let pending_payment = count_for(ParcelStatus::PendingPayment);
    let in_transit = count_for(ParcelStatus::InTransit);
    let delivered = count_for(ParcelStatus::Delivered);

    // Collected revenue is everything past the payment gate; pending is
    // what still awaits it.
    let (total_revenue, pending_revenue): (Decimal, Decimal) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount) FILTER (WHERE status <> 'pending_payment'), 0),
                COALESCE(SUM(amount) FILTER (WHERE status = 'pending_payment'), 0)
         FROM parcels",
    )
    .fetch_one(pool)
    .await?;

    let (total_customers,): (i64,) = sqlx::query_as("SELECT count(*) FROM parties")
        .fetch_one(pool)
        .await?;

    let revenue_rows: Vec<(DateTime<Utc>, Decimal)> = sqlx::query_as(
        "SELECT date_trunc('month', created_at) AS month, SUM(amount) AS revenue
         FROM parcels
         WHERE created_at >= now() - interval '6 months'
         GROUP BY 1
         ORDER BY 1",
    )
    .fetch_all(pool)
    .await?;

    let revenue_by_month = revenue_rows
        .into_iter()
        .map(|(month, revenue)| MonthlyRevenue {
            month: month.format("%b %Y").to_string(),
            revenue,
        })
        .collect();

    let recent_parcels = Parcel::find_recent(pool, 5).await?;

    Ok(Dashboard {
        stats: DashboardStats {
            total_parcels,
            pending_payment,
            in_transit,
            delivered,
            total_revenue,
            pending_revenue,
            total_customers,
        },
        recent_parcels,
        parcels_by_status,
        revenue_by_month,
    })
}
