pub mod event;
pub mod query;
pub mod record;
