//! Request deduplication for expensive generation calls.
//!
//! Collapses concurrent requests with the same signature onto one shared
//! in-flight generation, converts generation failures into time-boxed error
//! blackouts, and sweeps entries that outlive their TTL.
//!
//! ```rust
//! use relay_core::ManualTimers;
//! use relay_dedup::{DedupConfig, GeneratedResponse, RequestDeduplicator};
//!
//! let timers = ManualTimers::new();
//! let dedup = RequestDeduplicator::new(DedupConfig::default(), timers.context());
//! let first = dedup
//!     .check_or_register("lilith", "hello", None, || async {
//!         Ok(GeneratedResponse::new("hi there"))
//!     })
//!     .expect("not blacked out");
//! let second = dedup
//!     .check_or_register("Lilith", "hello", None, || async {
//!         Ok(GeneratedResponse::new("never generated"))
//!     })
//!     .expect("not blacked out");
//! assert!(second.is_existing());
//! assert_eq!(first.signature(), second.signature());
//! ```

pub mod dedup_types;
pub mod request_dedup;
pub mod request_signature;

pub use dedup_types::*;
pub use request_dedup::RequestDeduplicator;
pub use request_signature::{normalize_content, normalize_personality_name, request_signature};
