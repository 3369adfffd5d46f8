//! PTP engine: wire codecs, datasets, best-master selection and the
//! port state machine.

pub mod bmc;
pub mod datasets;
pub mod messages;
pub mod port;

pub use messages::{PTP_EVENT_PORT, PTP_GENERAL_PORT};
