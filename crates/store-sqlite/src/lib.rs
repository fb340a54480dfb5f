mod open;
mod models;
mod insert;
mod query;
mod schema;

pub use open::{lock_db, Db, SharedDb};
pub use models::*;
pub use insert::*;
pub use query::*;
