//! Typed, schema-validated configuration storage that plays well with JSON.
//!
//! A [`ConfigStore`] holds values for keys declared in a schema. Each key
//! carries a type, a required/optional flag, and optionally a default-value
//! producer. Updates are partial (only the keys present in the update
//! document change), validated against the schema, and can be previewed
//! without committing:
//!
//! ```
//! use serde_json::json;
//! use tether_config::{ConfigStore, ConfigType, Requirement, static_default};
//!
//! let mut store = ConfigStore::new();
//! store.register_key("endpoint", ConfigType::String, Requirement::Required, None);
//! store.register_key(
//!     "retries",
//!     ConfigType::Integer,
//!     Requirement::Optional,
//!     Some(static_default(3)),
//! );
//!
//! // Validation fails: 'endpoint' is missing, and the store is untouched.
//! let errors = store.update(&json!({})).unwrap_err();
//! assert_eq!(errors[0].full_message(), "'endpoint' is required");
//! assert!(store.get("endpoint").is_null());
//!
//! store.update(&json!({"endpoint": "tcp://db/"})).unwrap();
//! assert_eq!(store.get("endpoint"), json!("tcp://db/"));
//! assert_eq!(store.get("retries"), json!(3)); // default kicks in
//! ```
//!
//! Unregistered keys in an update document are silently ignored, and a key
//! is cleared by assigning it an explicit `null`. [`ConfigStore::dump`]
//! renders the whole store (user values, produced defaults, effective
//! values, types) as one JSON document for introspection surfaces.

pub mod coerce;
mod error;
mod store;

pub use error::{ConfigError, join_errors};
pub use store::{ConfigStore, ConfigType, DefaultProducer, Requirement, static_default};
