/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! A transport-independent implementation of the ZRTP media key agreement
//! protocol (RFC 6189).
//!
//! The engine consumes and produces ZRTP messages as opaque byte buffers
//! and never touches a socket, a clock or a thread: the host supplies
//! transport, timer and UI services through the [`ZrtpCallback`] trait and
//! feeds events in through [`ZrtpSession::process_message`] and
//! [`ZrtpSession::process_timeout`]. All events of one stream must be
//! serialized by the host; every handler runs to completion and produces at
//! most one outbound packet plus one timer operation.
//!
//! Key continuity lives in the [`cache`] module: a 96 bit ZID identifies
//! each endpoint and a per-peer record carries the retained secrets that
//! detect a man in the middle across calls, next to the SAS verified flag.

pub mod algorithm;
pub mod cache;
mod callbacks;
pub mod config;
mod counters;
pub mod crypto;
pub mod error;
mod kdf;
#[cfg(feature = "logging")]
pub mod log_event;
mod packet;
pub mod proto;
pub mod sas;
mod session;
mod state;

pub use callbacks::{EnableSecurity, EnrollmentInfo, Role, SrtpSecrets, ZrtpCallback};
pub use error::{InfoCode, ReportCode, SevereCode, Severity, WarningCode, WireError, ZrtpError};
pub use packet::MessageType;
pub use session::{ZrtpInfo, ZrtpSession, SECRET_AUX, SECRET_PBX, SECRET_RS1, SECRET_RS2};
pub use state::State;
