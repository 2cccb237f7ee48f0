use std::sync::Arc;

use gtmlake_db::repositories::{
    DeadLetterSink, PartitionLog, SqlDeadLetterSink, SqlPartitionLog, SqlStorage, Storage,
};
use gtmlake_db::{connect_with_settings, migrations, DbPool};

pub(crate) const DIMENSION: usize = 32;

pub(crate) async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("pool should connect");
    migrations::run_pending(&pool).await.expect("migrations should run");
    pool
}

pub(crate) struct Stores {
    pub log: Arc<dyn PartitionLog>,
    pub storage: Arc<dyn Storage>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

pub(crate) async fn sql_stores() -> Stores {
    let pool = setup_pool().await;
    Stores {
        log: Arc::new(SqlPartitionLog::new(pool.clone())),
        storage: Arc::new(SqlStorage::new(pool.clone()).with_dimension(DIMENSION)),
        dead_letters: Arc::new(SqlDeadLetterSink::new(pool)),
    }
}
