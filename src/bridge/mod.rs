//! Framed request/response boundary to the Control Plane.
//!
//! Runs over a local Unix domain socket, never used by end-user
//! connections. Frames are length-prefixed (4-byte big-endian) JSON; every
//! request carries a correlation id. Lifecycle and broadcast-injection
//! requests flow inward; `connection.opened`/`connection.closed` audit
//! notifications flow outward, isolated from the per-message hot path.

mod backoff;
mod framing;
mod notifier;
mod protocol;
mod server;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use framing::{read_frame, write_frame, FramingError, DEFAULT_MAX_FRAME_BYTES};
pub use notifier::{notifier_pair, BridgeNotifier, BridgeNotifierTask};
pub use protocol::{BridgeNotification, BridgeOp, BridgeOutcome, BridgeRequest, BridgeResponse};
pub use server::BridgeServer;
