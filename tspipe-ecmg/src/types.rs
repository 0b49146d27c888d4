//! Request/response types and the generator capability trait.

use bytes::Bytes;

use crate::EcmgError;

/// Length in bytes of a DVB-CSA control word.
pub const CW_BYTES: usize = 8;

/// Result of the ECMG channel setup, as far as the scrambler cares.
///
/// The scrambler reads `delay_start` to decide whether an ECM transition
/// leads or trails the matching control-word transition, and
/// `section_tspkt_flag` to know in which form `EcmResponse::ecm_datagram`
/// arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    /// When false, ECM datagrams are PSI sections; when true, they are
    /// pre-packetized 188-byte TS packets.
    pub section_tspkt_flag: bool,
    /// Delay in milliseconds between the start of a crypto-period and the
    /// start of the matching ECM broadcast. May be negative (ECM leads).
    pub delay_start: i64,
}

impl Default for ChannelStatus {
    fn default() -> Self {
        Self {
            section_tspkt_flag: false,
            delay_start: 0,
        }
    }
}

/// One ECM generation request, covering a single crypto-period.
#[derive(Debug, Clone)]
pub struct EcmRequest {
    /// Crypto-period number.
    pub cp_number: u16,
    /// Control word of this crypto-period.
    pub cw_current: [u8; CW_BYTES],
    /// Control word of the next crypto-period.
    pub cw_next: [u8; CW_BYTES],
    /// Opaque access criteria forwarded to the generator.
    pub access_criteria: Bytes,
    /// Crypto-period duration in hundreds of milliseconds.
    pub cp_duration_cs: u16,
}

/// Response to an ECM generation request.
#[derive(Debug, Clone)]
pub struct EcmResponse {
    /// The ECM, either one PSI section or a whole number of TS packets,
    /// as indicated by [`ChannelStatus::section_tspkt_flag`].
    pub ecm_datagram: Bytes,
}

/// Continuation invoked when an asynchronously submitted ECM is ready.
/// May run on a thread owned by the generator.
pub type EcmContinuation = Box<dyn FnOnce(Result<EcmResponse, EcmgError>) + Send>;

/// Capability set of an external ECM generator.
pub trait EcmGenerator: Send {
    /// Open the ECM channel. Called once before any request.
    fn channel_setup(&mut self, super_cas_id: u32, cp_duration_cs: u16) -> Result<ChannelStatus, EcmgError>;

    /// Generate an ECM synchronously, blocking until it is ciphered.
    fn generate_ecm(&mut self, request: &EcmRequest) -> Result<EcmResponse, EcmgError>;

    /// Submit an ECM request; `done` is invoked when the response is
    /// available, possibly from another thread.
    fn submit_ecm(&mut self, request: &EcmRequest, done: EcmContinuation) -> Result<(), EcmgError>;

    /// Close the channel. Called once, after the last request.
    fn disconnect(&mut self) {}
}
