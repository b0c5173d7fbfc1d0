pub mod allocator;
pub mod auth;
pub mod catalog;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod ledger;
pub mod limits;
pub mod mail;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod wal;
