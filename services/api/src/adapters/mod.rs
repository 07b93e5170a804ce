pub mod db;
pub mod log_trigger;
pub mod outbox;

pub use db::DbAdapter;
pub use log_trigger::LogTrigger;
pub use outbox::PgOutboxTrigger;
