/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Trait to implement to integrate the ZRTP engine into an application.
//!
//! The engine is transport, OS and use-case independent: it never touches a
//! socket or a clock. Everything it needs from its host environment comes
//! through this trait, and every callback is invoked synchronously from
//! within `process_message`, `process_timeout` or one of the control calls.

use crate::algorithm::{AuthTag, CipherAlgorithm};
use crate::error::{ReportCode, Severity};
#[cfg(feature = "logging")]
use crate::log_event::LogEvent;

/// Which direction of the SRTP stream a secrets callback refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableSecurity {
    ForSender,
    ForReceiver,
}

/// This side's role in the finished or ongoing handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
    NoRole,
}

/// The negotiated SRTP key material handed to the host when a direction is
/// enabled. The borrowed buffers are only valid for the duration of the
/// callback; the SRTP engine must copy what it needs.
pub struct SrtpSecrets<'a> {
    pub cipher: CipherAlgorithm,
    pub auth_tag: AuthTag,
    pub key_initiator: &'a [u8],
    pub salt_initiator: &'a [u8],
    pub key_responder: &'a [u8],
    pub salt_responder: &'a [u8],
    /// Our role; decides which key/salt pair protects which direction.
    pub role: Role,
}

/// PBX enrollment events surfaced to the user interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentInfo {
    /// A trusted-MitM enrollment is offered; answer with
    /// `accept_enrollment`.
    Request,
    /// The peer canceled a pending enrollment.
    Canceled,
    /// Enrollment completed and the MitM key was stored.
    Ok,
    Failed,
}

/// The host side of the engine.
///
/// `send_data` and `activate_timer` return `false` on failure, which the
/// engine surfaces as a severe error and converts into a failed session.
pub trait ZrtpCallback {
    /// Hand one complete ZRTP message to the transport. Framing and CRC are
    /// the transport's business.
    fn send_data(&mut self, data: &[u8]) -> bool;

    /// Arm the one-shot protocol timer. A later `activate_timer` replaces
    /// any pending one.
    fn activate_timer(&mut self, ms: i32) -> bool;

    fn cancel_timer(&mut self) -> bool;

    /// Status and warning reporting while the protocol makes progress.
    fn send_info(&mut self, severity: Severity, code: ReportCode);

    /// The handshake failed; timers are canceled and secrets wiped before
    /// this is called.
    fn negotiation_failed(&mut self, severity: Severity, code: ReportCode);

    /// The peer never answered our Hellos.
    fn not_supported_by_other(&mut self);

    /// SRTP keys for one direction are ready. Returning `false` aborts the
    /// session with a severe error.
    fn srtp_secrets_ready(&mut self, part: EnableSecurity, secrets: &SrtpSecrets<'_>) -> bool;

    /// Tear down SRTP for one direction.
    fn srtp_secrets_off(&mut self, part: EnableSecurity);

    /// The stream went secure: display the SAS and its verification state.
    fn srtp_secrets_on(&mut self, cipher_info: &str, sas: &str, verified: bool);

    /// The peer attached a signature to its Confirm. Return whether the
    /// signature verifies against the SAS hash.
    fn check_sas_signature(&mut self, _sas_hash: &[u8; 32], _signature: &[u8]) -> bool {
        false
    }

    /// Produce our own SAS signature block, called while building a Confirm
    /// if SAS signing is enabled. Length must be a multiple of 4.
    fn sign_sas(&mut self, _sas_hash: &[u8; 32]) -> Option<Vec<u8>> {
        None
    }

    /// PBX enrollment housekeeping, RFC 6189 section 7.3.
    fn ask_enrollment(&mut self, _info: EnrollmentInfo) {}

    /// Receives a stream of events that occur during protocol execution.
    /// These are provided for debugging, logging or metrics purposes, and
    /// must be used for nothing else.
    #[cfg(feature = "logging")]
    #[allow(unused)]
    fn event_log(&mut self, event: LogEvent<'_>) {}
}
