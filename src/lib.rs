pub mod clock;
pub mod config;
pub mod damage;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod sweep;
pub mod wal;
