mod connection;
mod executor;
mod introspection;
mod query;

pub use connection::*;
pub use executor::*;
pub use introspection::*;
pub use query::*;
