pub mod flush;
pub mod manager;
pub mod transaction;
