#![forbid(unsafe_code)]

//! Data access layer for Rowgate: per-datasource connection pools,
//! transaction-wrapped query execution, LISTEN connections for the
//! notification fan-out, and dynamic row decoding.

pub mod error;
pub mod manager;
pub mod row;
pub mod value;

pub use error::{DataError, Result};
pub use manager::{set_transaction_sql, DataSources};
pub use row::row_values;
pub use value::{bind_args, ArgValue, NullKind};
