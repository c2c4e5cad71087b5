/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/// Severity attached to every message the engine reports through
/// `ZrtpCallback::send_info` and `ZrtpCallback::negotiation_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Severe,
    /// The subcode is a wire error code (`WireError`), either received from
    /// the peer in an Error message or about to be sent in one.
    ZrtpError,
}

/// Subcode accompanying a `Severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCode {
    /// Hello received and processed, about to respond.
    HelloReceived,
    /// Commit was generated, this side offered to become Initiator.
    CommitGenerated,
    /// Responder side computed its keys.
    ResponderDataReady,
    /// Initiator side computed its keys.
    InitiatorDataReady,
    /// Handshake complete, entering the secure state.
    SecureStateOn,
    /// Left the secure state.
    SecureStateOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningCode {
    /// A 256 bit Diffie-Hellman result is protected by a 128 bit cipher.
    /// Reserved: no supported key agreement is strong enough to produce
    /// this pairing, so the engine currently never reports it.
    DhAesMismatch,
    /// The peer's hash chain did not verify against its commitment.
    DhShort,
    /// No retained secret matched although the cache holds one. Possible
    /// man-in-the-middle, see RFC 6189 section 4.6.1.
    NoRsMatch,
    /// Record found but the retained secret IDs do not agree with the
    /// expected ones.
    NoExpectedRsMatch,
    /// Aux secrets were set on both sides but do not match.
    NoExpectedAuxMatch,
    /// The ZID cache could not be opened; continuing without retained
    /// secrets.
    NoCache,
    /// The peer attached a SAS signature that did not verify.
    SasSignatureInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SevereCode {
    /// HMAC check of a stored Hello failed when its key was revealed.
    HelloHmacFailed,
    /// HMAC check of a stored Commit failed when its key was revealed.
    CommitHmacFailed,
    /// HMAC check of a stored DHPart1 failed when its key was revealed.
    Dh1HmacFailed,
    /// HMAC check of a stored DHPart2 failed when its key was revealed.
    Dh2HmacFailed,
    /// The host send callback reported failure.
    CannotSend,
    /// A message arrived that is illegal in the current protocol state.
    ProtocolError,
    /// The host timer callback reported failure.
    NoTimer,
    /// A retransmission counter was exhausted.
    TooMuchRetries,
    /// Internal error, always a bug.
    SoftwareError,
}

/// ZRTP wire error codes, RFC 6189 section 5.9. These travel in Error
/// messages and are also the subcode reported with `Severity::ZrtpError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WireError {
    MalformedPacket = 0x10,
    CriticalSwError = 0x20,
    UnsupportedVersion = 0x30,
    HelloMismatch = 0x40,
    UnsupportedHash = 0x51,
    UnsupportedCipher = 0x52,
    UnsupportedPubKey = 0x53,
    UnsupportedAuthTag = 0x54,
    UnsupportedSasRender = 0x55,
    NoSharedSecret = 0x56,
    DhBadPublicValue = 0x61,
    DhHviMismatch = 0x62,
    UntrustedMitm = 0x63,
    ConfirmHmacFailed = 0x70,
    NonceReused = 0x80,
    EqualZid = 0x90,
    SsrcCollision = 0x91,
    ServiceUnavailable = 0xA0,
    ProtocolTimeout = 0xB0,
}

impl WireError {
    pub(crate) fn from_wire(code: u32) -> Option<Self> {
        use WireError::*;
        Some(match code {
            0x10 => MalformedPacket,
            0x20 => CriticalSwError,
            0x30 => UnsupportedVersion,
            0x40 => HelloMismatch,
            0x51 => UnsupportedHash,
            0x52 => UnsupportedCipher,
            0x53 => UnsupportedPubKey,
            0x54 => UnsupportedAuthTag,
            0x55 => UnsupportedSasRender,
            0x56 => NoSharedSecret,
            0x61 => DhBadPublicValue,
            0x62 => DhHviMismatch,
            0x63 => UntrustedMitm,
            0x70 => ConfirmHmacFailed,
            0x80 => NonceReused,
            0x90 => EqualZid,
            0x91 => SsrcCollision,
            0xA0 => ServiceUnavailable,
            0xB0 => ProtocolTimeout,
            _ => return None,
        })
    }
}

/// The subcode half of an engine report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportCode {
    Info(InfoCode),
    Warning(WarningCode),
    Severe(SevereCode),
    /// A wire error code; `known` is `None` when the peer sent a code this
    /// implementation does not recognize.
    Wire { raw: u32, known: Option<WireError> },
}

impl ReportCode {
    pub fn severity(&self) -> Severity {
        match self {
            ReportCode::Info(_) => Severity::Info,
            ReportCode::Warning(_) => Severity::Warning,
            ReportCode::Severe(_) => Severity::Severe,
            ReportCode::Wire { .. } => Severity::ZrtpError,
        }
    }
}

impl From<InfoCode> for ReportCode {
    fn from(c: InfoCode) -> Self {
        ReportCode::Info(c)
    }
}
impl From<WarningCode> for ReportCode {
    fn from(c: WarningCode) -> Self {
        ReportCode::Warning(c)
    }
}
impl From<SevereCode> for ReportCode {
    fn from(c: SevereCode) -> Self {
        ReportCode::Severe(c)
    }
}
impl From<WireError> for ReportCode {
    fn from(c: WireError) -> Self {
        ReportCode::Wire { raw: c as u32, known: Some(c) }
    }
}

/// Error returned by fallible public entry points of the session facade.
#[derive(Debug, PartialEq, Eq)]
pub enum ZrtpError {
    /// An invalid parameter was supplied to the function.
    InvalidParameter,

    /// The call is not legal in the current protocol state, e.g. setting an
    /// aux secret after `start` or reading SRTP keys before the secure
    /// state.
    WrongState,

    /// The session was stopped and refuses further input.
    SessionClosed,

    /// The ZID cache storage backend reported a failure.
    CacheIoError,
}
