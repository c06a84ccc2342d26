//! Unified error type for the gateway.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` for efficient on-target logging.

/// Error reported by the BLE transport for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The transport (or the addressed engine) is busy; try again later.
    Busy,
    /// The request is not valid in the current state (e.g. already scanning).
    InvalidState,
    /// The attribute handle is not valid on the peer.
    InvalidHandle,
    /// The link is gone.
    Disconnected,
    /// A fixed-size table in the stack is exhausted (e.g. vendor UUIDs).
    NoResources,
    /// The procedure timed out.
    Timeout,
    /// Raw stack error code we do not classify.
    Raw(u32),
}

impl TransportError {
    /// Transient errors are retried; everything else drops the operation.
    pub const fn is_transient(self) -> bool {
        matches!(self, TransportError::Busy)
    }
}

/// Top-level error type used across the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A transport request failed.
    Transport(TransportError),

    /// The client has no live link.
    NotConnected,

    /// The attribute handle needed for the operation was never discovered.
    HandleUnassigned,

    /// Registering a vendor-specific base UUID failed.
    UuidRegistration(TransportError),

    /// Registering a service with the discovery engine failed.
    DiscoveryRegistration(TransportError),

    /// Scanning could not be (re)started.
    Scan(TransportError),

    /// The operation targets a peer type that is not connected.
    UnknownPeer,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}
