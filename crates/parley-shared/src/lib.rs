//! Types shared by every Parley crate: identifiers, domain models, the
//! change-event wire format and the error taxonomy.

pub mod constants;
pub mod error;
pub mod events;
pub mod models;
pub mod types;
