pub mod client;
pub mod db_dispatch;
pub mod envelope;
pub mod nonce;

pub use client::{DispatchClient, IntentTransport};
pub use db_dispatch::{DeviceEnrollment, DispatchAuditEntry, DispatchMethods};
pub use envelope::ExecutionIntent;
pub use nonce::NonceCache;
