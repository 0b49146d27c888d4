//! Error types for the ECMG collaborator interface.

use thiserror::Error;

/// Errors reported by an ECM generator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EcmgError {
    /// Channel setup was rejected or failed.
    #[error("ECMG channel setup failed: {0}")]
    ChannelSetupFailed(String),

    /// ECM generation was rejected by the generator.
    #[error("ECM generation failed for crypto-period {cp_number}: {reason}")]
    GenerationFailed { cp_number: u16, reason: String },

    /// The generator returned a datagram that does not match the
    /// `section_tspkt_flag` negotiated at channel setup.
    #[error("Invalid ECM datagram: {0}")]
    InvalidDatagram(String),

    /// The connection to the generator was lost.
    #[error("ECMG connection lost: {0}")]
    ConnectionLost(String),
}
