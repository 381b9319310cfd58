pub mod connection;
pub mod store;
pub mod types;
pub mod value;

pub use connection::PostgresConnection;
pub use store::PostgresStore;
pub use types::*;
