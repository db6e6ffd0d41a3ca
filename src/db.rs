use rocket_db_pools::{sqlx, Database};

/// Pool for the database that holds the load targets and the column catalog.
#[derive(Database)]
#[database("loader_db")]
pub struct LoaderDb(sqlx::PgPool);
