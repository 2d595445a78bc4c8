pub mod parcel;
pub mod party;
pub mod transaction;
