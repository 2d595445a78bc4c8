use actix_web::web;

use crate::handlers;

pub fn scoped_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/parcels")
            .service(
                web::resource("")
                    .route(web::get().to(handlers::parcels::index))
                    .route(web::post().to(handlers::parcels::store)),
            )
            .service(
                web::resource("/{id}")
                    .route(web::put().to(handlers::parcels::update))
                    .route(web::delete().to(handlers::parcels::destroy)),
            ),
    )
    .service(web::resource("/transactions").route(web::get().to(handlers::transactions::index)))
    .service(web::resource("/dashboard").route(web::get().to(handlers::dashboard::index)))
    .service(web::resource("/mpesa/callback").route(web::post().to(handlers::mpesa::callback)));
}
