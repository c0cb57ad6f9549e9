pub mod config;
pub mod error;
pub mod event;
pub mod reducer;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FingraphError, Result};
pub use reducer::{FieldName, Reducer, REDUCER_TABLE};
pub use state::StateRecord;
pub use types::*;
