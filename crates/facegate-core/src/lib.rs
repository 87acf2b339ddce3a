//! facegate-core: Enrollment data model, enrollment store, and verification oracle.
//!
//! One [`EnrollmentRecord`] per profile is persisted through an
//! [`EnrollmentStore`]; a [`VerificationOracle`] scores live captures against it.

pub mod oracle;
pub mod store;
pub mod types;

pub use oracle::{DescriptorOracle, OracleError, VerificationOracle};
pub use store::{EnrollmentStore, FileStore, MemoryStore, StoreError};
pub use types::{Embedding, EnrollmentRecord, VerificationOutcome};
