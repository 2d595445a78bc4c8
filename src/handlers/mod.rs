pub mod dashboard;
pub mod mpesa;
pub mod parcels;
pub mod transactions;
