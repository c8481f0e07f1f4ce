pub mod connection;
pub mod db_schema;
pub mod timestamps;

pub use connection::Database;
pub use db_schema::initialize_schema;
pub use timestamps::now_ms;
