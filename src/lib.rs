pub mod clock;
pub mod config;
pub mod engine;
pub mod grouping;
pub mod jobcode;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod notices;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod retry;
pub mod slots;
pub mod store;
pub mod sweeper;
pub mod wal;
