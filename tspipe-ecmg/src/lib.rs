//! ECM generator collaborator interface.
//!
//! This crate defines the boundary between the tspipe scrambler and an
//! external ECM Generator (ECMG) in the sense of DVB SimulCrypt. The wire
//! protocol itself is not implemented here: the scrambler only needs a
//! request/response surface, either synchronous (`generate_ecm`) or
//! asynchronous (`submit_ecm` with a continuation invoked from the
//! generator's own thread).

mod error;
mod types;

pub use error::EcmgError;
pub use types::{ChannelStatus, EcmContinuation, EcmGenerator, EcmRequest, EcmResponse, CW_BYTES};
