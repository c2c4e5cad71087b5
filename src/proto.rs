/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/* Common wire constants */

/// Size in bytes of one ZRTP word. All message lengths are multiples of this.
pub const WORD_SIZE: usize = 4;

/// Size in bytes of a ZRTP identifier (ZID), 96 bits.
pub const ZID_SIZE: usize = 12;

/// Every ZRTP message starts with this 16-bit preamble.
pub(crate) const MESSAGE_PREAMBLE: u16 = 0x505a;

/// Message header: preamble + length word, then the 2-word type block.
pub(crate) const HEADER_SIZE: usize = 3 * WORD_SIZE;
pub(crate) const TYPE_SIZE: usize = 2 * WORD_SIZE;

/// Truncated HMAC appended to Hello, Commit and DHPart messages.
pub(crate) const MAC_SIZE: usize = 2 * WORD_SIZE;

/// Size of the hash chain images H0..H3 on the wire.
pub(crate) const HASH_IMAGE_SIZE: usize = 32;

/// Size of one retained-secret ID carried in DHPart messages.
pub(crate) const SECRET_ID_SIZE: usize = 2 * WORD_SIZE;

/// Size of the hvi field in a Commit and of the value it is compared against.
pub(crate) const HVI_SIZE: usize = 32;

/// Size of the nonce replacing hvi in a multi-stream Commit.
pub(crate) const NONCE_SIZE: usize = 4 * WORD_SIZE;

/// CFB initialization vector in Confirm and SASRelay messages.
pub(crate) const IV_SIZE: usize = 16;

/// Upper bound for a signature block in a Confirm (9-bit length in words).
pub(crate) const MAX_SIGNATURE_WORDS: usize = 512;

/// SRTP master salt length, 112 bits per RFC 3711.
pub const SRTP_SALT_SIZE: usize = 14;

/// Length in bytes of a retained secret stored in the cache.
pub const RS_SIZE: usize = 32;

/// Maximum length of an aux secret accepted from the application.
pub(crate) const MAX_AUX_SECRET_SIZE: usize = 64;

/// Largest ZRTP message the engine accepts or builds (DH3k DHPart plus slack).
pub(crate) const MAX_MESSAGE_SIZE: usize = 1024;

/* Protocol versions, newest first. Version negotiation steps down. */

pub(crate) const VERSION_1_10: &[u8; 4] = b"1.10";
pub(crate) const SUPPORTED_VERSIONS: [&[u8; 4]; 1] = [VERSION_1_10];

pub(crate) const CLIENT_ID_SIZE: usize = 16;

/* Message type blocks, always 2 words of ASCII. */

pub(crate) const MSG_HELLO: &[u8; 8] = b"Hello   ";
pub(crate) const MSG_HELLO_ACK: &[u8; 8] = b"HelloACK";
pub(crate) const MSG_COMMIT: &[u8; 8] = b"Commit  ";
pub(crate) const MSG_DHPART1: &[u8; 8] = b"DHPart1 ";
pub(crate) const MSG_DHPART2: &[u8; 8] = b"DHPart2 ";
pub(crate) const MSG_CONFIRM1: &[u8; 8] = b"Confirm1";
pub(crate) const MSG_CONFIRM2: &[u8; 8] = b"Confirm2";
pub(crate) const MSG_CONF2_ACK: &[u8; 8] = b"Conf2ACK";
pub(crate) const MSG_ERROR: &[u8; 8] = b"Error   ";
pub(crate) const MSG_ERROR_ACK: &[u8; 8] = b"ErrorACK";
pub(crate) const MSG_PING: &[u8; 8] = b"Ping    ";
pub(crate) const MSG_PING_ACK: &[u8; 8] = b"PingACK ";
pub(crate) const MSG_SAS_RELAY: &[u8; 8] = b"SASrelay";
pub(crate) const MSG_RELAY_ACK: &[u8; 8] = b"RelayACK";

/* KDF label strings, RFC 6189 section 4. The labels are part of the wire
 * contract: both sides must feed byte-identical labels into the KDF. */

pub(crate) const LABEL_KDF: &[u8] = b"ZRTP-HMAC-KDF";
pub(crate) const LABEL_INITIATOR: &[u8] = b"Initiator";
pub(crate) const LABEL_RESPONDER: &[u8] = b"Responder";
pub(crate) const LABEL_INI_SRTP_KEY: &[u8] = b"Initiator SRTP master key";
pub(crate) const LABEL_INI_SRTP_SALT: &[u8] = b"Initiator SRTP master salt";
pub(crate) const LABEL_RESP_SRTP_KEY: &[u8] = b"Responder SRTP master key";
pub(crate) const LABEL_RESP_SRTP_SALT: &[u8] = b"Responder SRTP master salt";
pub(crate) const LABEL_INI_HMAC_KEY: &[u8] = b"Initiator HMAC key";
pub(crate) const LABEL_RESP_HMAC_KEY: &[u8] = b"Responder HMAC key";
pub(crate) const LABEL_INI_ZRTP_KEY: &[u8] = b"Initiator ZRTP key";
pub(crate) const LABEL_RESP_ZRTP_KEY: &[u8] = b"Responder ZRTP key";
pub(crate) const LABEL_SESSION_KEY: &[u8] = b"ZRTP Session Key";
pub(crate) const LABEL_EXPORTED_KEY: &[u8] = b"Exported key";
pub(crate) const LABEL_RETAINED_SECRET: &[u8] = b"retained secret";
pub(crate) const LABEL_SAS: &[u8] = b"SAS";
pub(crate) const LABEL_MSK: &[u8] = b"ZRTP MSK";
pub(crate) const LABEL_TRUSTED_MITM: &[u8] = b"Trusted MiTM key";

/* Retransmission timers, RFC 6189 section 6. Milliseconds. */

pub(crate) const T1_START_MS: i32 = 50;
pub(crate) const T1_CAP_MS: i32 = 200;
pub(crate) const T1_RESEND: i32 = 20;
pub(crate) const T1_RESEND_EXTENDED: i32 = 60;

pub(crate) const T2_START_MS: i32 = 150;
pub(crate) const T2_CAP_MS: i32 = 1200;
pub(crate) const T2_RESEND: i32 = 10;

/// Lower bounds enforced on the tuning API.
pub(crate) const T1_CAP_MIN_MS: i32 = 50;
pub(crate) const T2_CAP_MIN_MS: i32 = 150;
pub(crate) const RESEND_MIN: i32 = 10;

/// Bound on the per-session set of multi-stream nonces already seen.
pub(crate) const MAX_SEEN_NONCES: usize = 32;
