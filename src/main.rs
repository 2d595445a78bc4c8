use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;

mod config;
mod database;
mod handlers;
mod models;
mod requests;
mod routes;
mod services;
mod utils;

use config::AppConfig;
use services::mpesa::DarajaClient;
use services::notify::Notifier;
use services::payments::Payments;
use services::storage::ImageStorage;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = AppConfig::from_env()?;

    let pool = database::connection::establish(&config.database_url).await?;
    sqlx::migrate!().run(&pool).await?;
    info!("Database connected and migrations applied");

    let storage = ImageStorage::new(config.upload_root.clone());
    storage.ensure_root().await?;

    let gateway = Arc::new(DarajaClient::new(config.mpesa.clone())?);
    let payments = Payments::new(gateway, config.country_prefix.clone());

    let notifier = Notifier::new(config.whatsapp.clone(), config.country_prefix.clone())?;

    info!(
        "Starting server on {}:{} (M-Pesa environment: {})",
        config.host, config.port, config.mpesa.environment
    );

    let bind_address = (config.host.clone(), config.port);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::new(payments.clone()))
            .app_data(web::Data::new(storage.clone()))
            .app_data(web::Data::new(notifier.clone()))
            .configure(routes::api::scoped_config)
    })
    .bind(bind_address)?
    .run()
    .await?;

    Ok(())
}
