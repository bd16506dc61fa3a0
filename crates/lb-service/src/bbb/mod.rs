//! BBB wire protocol plumbing.
//!
//! Everything needed to speak the BigBlueButton HTTP API on both sides:
//! ordered query parameters and tenant-scoped meeting IDs, the SHA1 checksum
//! scheme, the XML response envelope, and the signed HTTP client used to talk
//! to backend servers.

pub mod checksum;
pub mod client;
pub mod params;
pub mod xml;

pub use checksum::{checksum_for, verify_checksum_query, ChecksumError};
pub use client::{BbbClient, BbbError, BbbResponse};
pub use params::{add_scope, split_scope, Params, MAX_MEETING_ID_LEN};
