pub mod adapters;
pub mod config;
pub mod currency;
pub mod error;
pub mod ledger;
pub mod payday;
pub mod store;
