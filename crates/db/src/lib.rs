pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod subscription;

pub use connection::{connect, connect_for_config, connect_with_settings, DbPool};
pub use subscription::{Subscription, SubscriptionOptions};

#[cfg(test)]
pub(crate) mod test_support;
