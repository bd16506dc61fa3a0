//! Repository layer for the balancer.
//!
//! Provides database access following the Handler -> Service -> Repository
//! architecture. All queries are parameterized. Methods that must run inside
//! a caller-controlled transaction take `&mut PgConnection`; everything else
//! takes the pool.

pub mod callbacks;
pub mod leases;
pub mod meetings;
pub mod recordings;
pub mod servers;
pub mod tenants;

pub use callbacks::CallbacksRepository;
pub use leases::Lease;
pub use meetings::MeetingsRepository;
pub use recordings::{RecordingFilter, RecordingsRepository};
pub use servers::ServersRepository;
pub use tenants::TenantsRepository;
