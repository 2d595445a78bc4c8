pub mod mpesa;
pub mod notify;
pub mod payments;
pub mod storage;
