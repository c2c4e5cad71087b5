/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The session facade.
//!
//! `ZrtpSession` owns everything one ZRTP stream needs: the hash chain, the
//! DH context, the negotiated suite, the derived key block, the working
//! copy of the peer's cache record and the state engine driving it all.
//! The state engine calls back into `SessionCore` to prepare and verify
//! packets; the host is reached exclusively through the `ZrtpCallback`
//! trait passed into every entry point.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};

use crate::algorithm::*;
use crate::cache::ZidCache;
use crate::callbacks::{EnableSecurity, EnrollmentInfo, Role, SrtpSecrets, ZrtpCallback};
use crate::config::ZrtpConfig;
use crate::counters::Counters;
use crate::crypto::secret::{secure_eq, Secret, SecretVec};
use crate::crypto::{cipher as cfb, dh::DhContext, hash};
use crate::error::*;
use crate::kdf::{self, KdfContext, SessionKeys};
#[cfg(feature = "logging")]
use crate::log_event::LogEvent;
use crate::packet::commit::{self, CommitVariant, CommitView};
use crate::packet::confirm::{self, ConfirmBody, ConfirmDecrypted, ConfirmView, SasRelayDecrypted};
use crate::packet::dhpart::{self, DhPartView};
use crate::packet::hello::{self, HelloSpec, HelloView};
use crate::packet::misc::{self, PingView};
use crate::packet::{parse_header, MessageType};
use crate::proto::*;
use crate::sas;
use crate::state::{Event, State, StateEngine, RETRY_COUNTERS};

/// Secret classes reported in `ZrtpInfo` bit masks.
pub const SECRET_RS1: u32 = 1;
pub const SECRET_RS2: u32 = 2;
pub const SECRET_PBX: u32 = 4;
pub const SECRET_AUX: u32 = 8;

/// Detail information about a finished or ongoing negotiation.
#[derive(Debug, Clone, Default)]
pub struct ZrtpInfo {
    /// Bit mask of secrets present in the cache record at handshake time.
    pub secrets_cached: u32,
    /// Bit mask of secrets that matched the peer's.
    pub secrets_matched: u32,
    pub hash: &'static str,
    pub cipher: &'static str,
    pub pub_key: &'static str,
    pub sas_type: &'static str,
    pub auth_len: &'static str,
}

/// How a packet preparation step failed.
pub(crate) enum Abort {
    /// Drop the triggering packet and carry on in the current state.
    Ignore,
    /// Abort the handshake with this wire error code.
    Error(WireError),
}

type Prepared = Result<Vec<u8>, Abort>;

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn version_int(v: &[u8; 4]) -> i32 {
    ((v[0].wrapping_sub(b'0')) as i32) * 10 + (v[2].wrapping_sub(b'0')) as i32
}

/// Master-stream parameters carried between sessions in multi-stream mode.
/// Only an immutable snapshot of the master's session key travels, never a
/// reference into the master's state.
struct MultiStreamParams {
    hash: HashAlgorithm,
    cipher: CipherAlgorithm,
    auth_tag: AuthTag,
    sas: SasRender,
    session_key: SecretVec,
}

/// Everything the peer's Hello told us.
#[derive(Default)]
struct PeerData {
    hello: Vec<u8>,
    hello_hash: [u8; 32],
    version: [u8; 4],
    client_id: Vec<u8>,
    zid: [u8; ZID_SIZE],
    h3: [u8; HASH_IMAGE_SIZE],
    mitm: bool,
    sas_sign: bool,
    multi_stream: bool,
}

/// Which retained secrets matched during this handshake.
#[derive(Default, Clone, Copy)]
struct SecretMatches {
    rs1: bool,
    rs2: bool,
    aux: bool,
    pbx: bool,
}

impl SecretMatches {
    fn any_rs(&self) -> bool {
        self.rs1 || self.rs2
    }
}

pub(crate) struct SessionCore {
    config: ZrtpConfig,
    cache: Option<Arc<Mutex<ZidCache>>>,
    client_id: [u8; CLIENT_ID_SIZE],
    own_zid: [u8; ZID_SIZE],
    role: Role,

    /* Hash chain, RFC 6189 section 9. H0 is random, each successor is the
     * SHA-256 of its predecessor, revealed in reverse order. */
    h0: Secret<HASH_IMAGE_SIZE>,
    h1: [u8; HASH_IMAGE_SIZE],
    h2: [u8; HASH_IMAGE_SIZE],
    h3: [u8; HASH_IMAGE_SIZE],

    hello: Vec<u8>,
    hello_hash: [u8; 32],
    peer: Option<PeerData>,
    peer_ssrc: u32,

    suite: Option<AlgorithmSuite>,
    dh: Option<DhContext>,
    our_commit: Option<Vec<u8>>,
    our_dhpart: Option<Vec<u8>>,
    peer_commit: Option<Vec<u8>>,
    peer_dhpart: Option<Vec<u8>>,
    peer_h2: Option<[u8; HASH_IMAGE_SIZE]>,
    peer_h1: Option<[u8; HASH_IMAGE_SIZE]>,

    record: Option<crate::cache::ZidRecord>,
    matches: SecretMatches,
    secrets_cached: u32,
    /// Cleared on a cache mismatch: the rotated rs1 is then withheld until
    /// the user confirms the SAS, RFC 6189 section 4.6.1.
    save_record_allowed: bool,

    aux_secret: Option<SecretVec>,

    keys: Option<SessionKeys>,
    sas_string: String,

    multi_stream: Option<MultiStreamParams>,
    seen_nonces: Vec<[u8; NONCE_SIZE]>,

    enrollment_mode: bool,
    pending_pbx_secret: Option<SecretVec>,
    peer_disclosure_seen: bool,
    signature_out: Option<Vec<u8>>,
    signature_in: Option<Vec<u8>>,

    counters: Counters,
    stopped: bool,
}

impl SessionCore {
    fn new(client_id: &str, config: ZrtpConfig, cache: Option<Arc<Mutex<ZidCache>>>) -> Self {
        let mut id = [b' '; CLIENT_ID_SIZE];
        let bytes = client_id.as_bytes();
        let n = bytes.len().min(CLIENT_ID_SIZE);
        id[..n].copy_from_slice(&bytes[..n]);

        let own_zid = match &cache {
            Some(c) => c.lock().map(|c| *c.own_zid()).unwrap_or_else(|_| random_zid()),
            None => random_zid(),
        };

        let mut h0 = Secret::<HASH_IMAGE_SIZE>::new();
        OsRng.fill_bytes(h0.as_mut());
        let h1 = hash::sha256(&[h0.as_bytes()]);
        let h2 = hash::sha256(&[&h1]);
        let h3 = hash::sha256(&[&h2]);

        let mut core = Self {
            config,
            cache,
            client_id: id,
            own_zid,
            role: Role::NoRole,
            h0,
            h1,
            h2,
            h3,
            hello: Vec::new(),
            hello_hash: [0; 32],
            peer: None,
            peer_ssrc: 0,
            suite: None,
            dh: None,
            our_commit: None,
            our_dhpart: None,
            peer_commit: None,
            peer_dhpart: None,
            peer_h2: None,
            peer_h1: None,
            record: None,
            matches: SecretMatches::default(),
            secrets_cached: 0,
            save_record_allowed: true,
            aux_secret: None,
            keys: None,
            sas_string: String::new(),
            multi_stream: None,
            seen_nonces: Vec::new(),
            enrollment_mode: false,
            pending_pbx_secret: None,
            peer_disclosure_seen: false,
            signature_out: None,
            signature_in: None,
            counters: Counters::default(),
            stopped: false,
        };
        core.rebuild_hello();
        core
    }

    /// Build (or rebuild) our Hello for the current configuration.
    fn rebuild_hello(&mut self) {
        let h2 = self.h2;
        let spec = HelloSpec {
            version: VERSION_1_10,
            client_id: &self.client_id,
            h3: &self.h3,
            zid: &self.own_zid,
            sas_sign: self.config.sas_signature,
            mitm: self.config.trusted_mitm,
            hashes: &self.config.hashes,
            ciphers: &self.config.ciphers,
            auth_tags: &self.config.auth_tags,
            pub_keys: &self.config.pub_keys,
            multi_stream: true,
            sas_renders: &self.config.sas_renders,
        };
        self.hello = hello::build(&spec, |maced| truncated_hmac(&h2, maced));
        self.hello_hash = hash::sha256(&[&self.hello]);
    }

    /* Small helpers the state engine leans on. */

    pub fn send_packet<A: ZrtpCallback>(&mut self, app: &mut A, pkt: &[u8]) -> bool {
        if pkt.len() > TYPE_SIZE + WORD_SIZE && &pkt[WORD_SIZE..HEADER_SIZE] == MSG_HELLO {
            self.counters.hello_sent += 1;
        }
        app.send_data(pkt)
    }

    pub fn hello_packet(&self) -> Vec<u8> {
        self.hello.clone()
    }

    pub fn hello_ack_packet(&self) -> Vec<u8> {
        misc::build_ack(MessageType::HelloAck)
    }

    pub fn is_multi_stream(&self) -> bool {
        self.multi_stream.is_some()
    }

    pub fn commit_as_initiator<A: ZrtpCallback>(&mut self, app: &mut A) {
        self.role = Role::Initiator;
        self.counters.commit_as_initiator += 1;
        app.send_info(Severity::Info, ReportCode::Info(InfoCode::CommitGenerated));
    }

    pub fn commit_as_responder<A: ZrtpCallback>(&mut self, _app: &mut A) {
        self.role = Role::Responder;
        self.counters.commit_as_responder += 1;
    }

    pub fn peer_not_responding<A: ZrtpCallback>(&mut self, app: &mut A) {
        self.counters.aborts_no_peer_response += 1;
        app.cancel_timer();
        self.wipe_secrets();
        app.not_supported_by_other();
    }

    /// Terminal failure bookkeeping: report, count and wipe.
    pub fn fail<A: ZrtpCallback>(&mut self, app: &mut A, severity: Severity, code: ReportCode) {
        match code {
            ReportCode::Wire { known: Some(WireError::DhBadPublicValue | WireError::DhHviMismatch), .. } => {
                self.counters.aborts_dh_error += 1
            }
            ReportCode::Wire { known: Some(WireError::ConfirmHmacFailed), .. } => self.counters.aborts_auth_error += 1,
            ReportCode::Wire { known: Some(WireError::ProtocolTimeout), .. }
            | ReportCode::Severe(SevereCode::ProtocolError | SevereCode::TooMuchRetries) => {
                self.counters.aborts_protocol_error += 1
            }
            _ => self.counters.aborts_other += 1,
        }
        app.cancel_timer();
        self.wipe_secrets();
        app.negotiation_failed(severity, code);
    }

    fn wipe_secrets(&mut self) {
        self.dh = None;
        self.keys = None;
        self.aux_secret = None;
        self.pending_pbx_secret = None;
        if let Some(p) = &mut self.multi_stream {
            p.session_key.purge();
        }
    }

    pub fn handle_error_packet<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) {
        let raw = misc::parse_error_code(msg).unwrap_or(0);
        let ack = misc::build_ack(MessageType::ErrorAck);
        self.send_packet(app, &ack);
        self.fail(app, Severity::ZrtpError, ReportCode::Wire { raw, known: WireError::from_wire(raw) });
    }

    pub fn prepare_error(&mut self, code: WireError) -> Vec<u8> {
        misc::build_error(code as u32)
    }

    /// Answer a Ping with a PingAck echoing the sender's endpoint hash and
    /// SSRC. Works in any state and never changes one.
    pub fn prepare_ping_ack(&mut self, msg: &[u8]) -> Option<Vec<u8>> {
        let ping = PingView::parse(msg).ok()?;
        // Our endpoint hash: leftmost bits of the hash of our ZID.
        let own = hash::sha256(&[&self.own_zid]);
        Some(misc::build_ping_ack(
            VERSION_1_10,
            own[..misc::ENDPOINT_HASH_SIZE].try_into().unwrap(),
            ping.endpoint_hash(),
            self.peer_ssrc,
        ))
    }

    pub fn set_peer_ssrc(&mut self, ssrc: u32) {
        self.peer_ssrc = ssrc;
    }

    /* Discovery phase */

    /// Digest a received Hello: version negotiation, equal-ZID guard, and
    /// capture of everything later stages need.
    pub fn save_peer_hello<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Result<(), Abort> {
        let view = HelloView::parse(msg).map_err(|_| Abort::Ignore)?;

        let ours = version_int(VERSION_1_10);
        let theirs = version_int(view.version());
        if theirs > ours {
            // The peer is expected to step down to a version we speak.
            return Err(Abort::Ignore);
        }
        if theirs < ours {
            // We already sent our lowest supported version.
            return Err(Abort::Error(WireError::UnsupportedVersion));
        }
        if view.zid() == &self.own_zid {
            return Err(Abort::Error(WireError::EqualZid));
        }

        let offers = view.offers();
        self.peer = Some(PeerData {
            hello: msg.to_vec(),
            hello_hash: hash::sha256(&[msg]),
            version: *view.version(),
            client_id: view.client_id().to_vec(),
            zid: *view.zid(),
            h3: *view.h3(),
            mitm: view.is_mitm(),
            sas_sign: view.is_sas_sign(),
            multi_stream: offers.multi_stream,
        });

        // Pull the peer's record now; every later stage needs it.
        self.load_record();
        app.send_info(Severity::Info, ReportCode::Info(InfoCode::HelloReceived));
        Ok(())
    }

    fn load_record(&mut self) {
        let Some(peer) = &self.peer else { return };
        let peer_zid = peer.zid;
        self.record = None;
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                if let Ok(record) = cache.get_record(&peer_zid) {
                    self.record = record;
                }
            }
        }
        let now = unix_now();
        self.secrets_cached = 0;
        if let Some(r) = &self.record {
            if r.has_rs1(now) {
                self.secrets_cached |= SECRET_RS1;
            }
            if r.has_rs2(now) {
                self.secrets_cached |= SECRET_RS2;
            }
            if r.has_mitm_key() {
                self.secrets_cached |= SECRET_PBX;
            }
        }
        if self.aux_secret.is_some() {
            self.secrets_cached |= SECRET_AUX;
        }
    }

    /* Commit preparation (tentative Initiator) */

    pub fn prepare_commit<A: ZrtpCallback>(&mut self, app: &mut A) -> Prepared {
        if self.is_multi_stream() {
            return self.prepare_commit_multi(app);
        }
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };
        let offers = HelloView::parse(&peer.hello).map_err(|_| Abort::Error(WireError::CriticalSwError))?.offers();
        let suite = self.config.select_suite(&offers);
        self.suite = Some(suite);

        let dh = DhContext::generate(suite.pub_key, &mut OsRng);
        let pv = dh.public_value();
        self.dh = Some(dh);

        // Build our DHPart2 now: the Commit must carry
        // hvi = hash(DHPart2 || peer Hello), RFC 6189 section 4.4.1.1.
        let ids = self.own_secret_ids(suite.hash, LABEL_INITIATOR);
        let h0 = *self.h0.as_bytes();
        let dhpart2 = dhpart::build(MessageType::DhPart2, &self.h1, &ids, &pv, |m| truncated_hmac(&h0, m));

        let peer_hello = &self.peer.as_ref().unwrap().hello;
        let hvi_full = hash::digest(suite.hash, &[&dhpart2, peer_hello]);
        let mut hvi = [0u8; HVI_SIZE];
        hvi.copy_from_slice(&hvi_full[..HVI_SIZE]);

        let h1 = self.h1;
        let commit = commit::build_dh(&self.h2, &self.own_zid, &suite, &hvi, |m| truncated_hmac(&h1, m));
        self.our_dhpart = Some(dhpart2);
        self.our_commit = Some(commit.clone());
        Ok(commit)
    }

    fn prepare_commit_multi<A: ZrtpCallback>(&mut self, _app: &mut A) -> Prepared {
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };
        if !peer.multi_stream {
            // The peer cannot do multi-stream; there is no DH fallback once
            // the application asked for a dependent stream.
            return Err(Abort::Error(WireError::UnsupportedPubKey));
        }
        let params = self.multi_stream.as_ref().unwrap();
        let suite = AlgorithmSuite {
            hash: params.hash,
            cipher: params.cipher,
            auth_tag: params.auth_tag,
            pub_key: PubKeyAlgorithm::Mult,
            sas: params.sas,
        };
        self.suite = Some(suite);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let h1 = self.h1;
        let commit = commit::build_multi_stream(&self.h2, &self.own_zid, &suite, &nonce, |m| truncated_hmac(&h1, m));

        // We may become the Initiator of this stream: derive the keys now,
        // Confirm1 arrives encrypted.
        let peer_hello = self.peer.as_ref().unwrap().hello.clone();
        self.derive_keys_multi(&peer_hello, &commit, Role::Initiator);
        self.our_commit = Some(commit.clone());
        Ok(commit)
    }

    /* Contention */

    /// Is the peer's Commit provably chained to its Hello? Drops forged
    /// contention commits early.
    pub fn verify_peer_commit_chain(&self, msg: &[u8]) -> bool {
        let (Ok(view), Some(peer)) = (CommitView::parse(msg), &self.peer) else {
            return false;
        };
        secure_eq(&hash::sha256(&[view.h2()]), &peer.h3)
    }

    /// Compare our Commit with the peer's, RFC 6189 section 4.2: larger hvi
    /// (nonce in multi-stream mode) wins and stays Initiator. `None` means
    /// the values are equal, which honest peers cannot produce.
    pub fn compare_commit(&self, peer_msg: &[u8]) -> Option<bool> {
        let ours = self.our_commit.as_deref()?;
        let (Ok(our_view), Ok(peer_view)) = (CommitView::parse(ours), CommitView::parse(peer_msg)) else {
            return Some(false);
        };
        let (a, b) = match (our_view.variant(), peer_view.variant()) {
            (CommitVariant::Dh { hvi: a }, CommitVariant::Dh { hvi: b }) => (&a[..], &b[..]),
            (CommitVariant::MultiStream { nonce: a }, CommitVariant::MultiStream { nonce: b }) => (&a[..], &b[..]),
            // Mixed modes: DH beats multi-stream, RFC 6189 section 4.2.
            (CommitVariant::Dh { .. }, CommitVariant::MultiStream { .. }) => return Some(true),
            (CommitVariant::MultiStream { .. }, CommitVariant::Dh { .. }) => return Some(false),
        };
        match a.cmp(b) {
            std::cmp::Ordering::Greater => Some(true),
            std::cmp::Ordering::Less => Some(false),
            std::cmp::Ordering::Equal => None,
        }
    }

    /* Responder path */

    fn commit_suite(&self, view: &CommitView<'_>) -> Result<AlgorithmSuite, Abort> {
        let suite = view.suite_or_error().map_err(Abort::Error)?;
        if !self.config.accepts_suite(&suite) {
            return Err(Abort::Error(WireError::HelloMismatch));
        }
        Ok(suite)
    }

    /// Validate the peer's Commit against our Hello and the hash chain,
    /// then build DHPart1. We are Responder from here on.
    pub fn prepare_dhpart1<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let view = CommitView::parse(msg).map_err(|_| Abort::Ignore)?;
        if view.is_multi_stream() {
            return Err(Abort::Error(WireError::UnsupportedPubKey));
        }
        let suite = self.commit_suite(&view)?;
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };

        // H2 must chain to the H3 committed in the peer's Hello, and the
        // Hello MAC becomes checkable now that H2 is revealed.
        if !secure_eq(&hash::sha256(&[view.h2()]), &peer.h3) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::CommitHmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        if !self.check_stored_hello_mac(app, view.h2()) {
            return Err(Abort::Error(WireError::CriticalSwError));
        }

        self.suite = Some(suite);
        self.peer_h2 = Some(*view.h2());
        self.peer_commit = Some(msg.to_vec());

        // Reuse the DH context from our own commit preparation when the
        // peer committed to the same algorithm (the contention case).
        if self.dh.as_ref().map(|d| d.algorithm()) != Some(suite.pub_key) {
            self.dh = Some(DhContext::generate(suite.pub_key, &mut OsRng));
        }
        let pv = self.dh.as_ref().unwrap().public_value();

        let ids = self.own_secret_ids(suite.hash, LABEL_RESPONDER);
        let h0 = *self.h0.as_bytes();
        let dhpart1 = dhpart::build(MessageType::DhPart1, &self.h1, &ids, &pv, |m| truncated_hmac(&h0, m));
        self.our_dhpart = Some(dhpart1.clone());
        self.our_commit = None;
        Ok(dhpart1)
    }

    /// Initiator: the peer's DHPart1 arrived. Verify, compute the shared
    /// secret and the whole key block, and hand out our prepared DHPart2.
    pub fn prepare_dhpart2<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let view = DhPartView::parse(msg).map_err(|_| Abort::Ignore)?;
        let suite = self.suite.ok_or(Abort::Error(WireError::CriticalSwError))?;
        if view.pv().len() != suite.pub_key.public_value_size() {
            return Err(Abort::Error(WireError::DhBadPublicValue));
        }
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };

        // The peer never sent a Commit (or lost contention), so its H1
        // must chain straight to the H3 from its Hello.
        let h2 = hash::sha256(&[view.h1()]);
        if !secure_eq(&hash::sha256(&[&h2]), &peer.h3) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::Dh1HmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        if !self.check_stored_hello_mac(app, &h2) {
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        // The DHPart1 MAC is keyed with the peer's H0 and can only be
        // checked once Confirm1 reveals it.

        let dhss = match self.dh.as_ref().unwrap().agree(view.pv()) {
            Ok(ss) => ss,
            Err(_) => return Err(Abort::Error(WireError::DhBadPublicValue)),
        };

        self.peer_h1 = Some(*view.h1());
        self.peer_dhpart = Some(msg.to_vec());

        let dhpart2 = self.our_dhpart.clone().ok_or(Abort::Error(WireError::CriticalSwError))?;

        // Transcript: Hello of the Responder, Commit, DHPart1, DHPart2.
        let total_hash = {
            let peer = self.peer.as_ref().unwrap();
            let commit = self.our_commit.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let mut transcript = hash::TranscriptHash::new(suite.hash);
            transcript.update(&peer.hello);
            transcript.update(commit);
            transcript.update(msg);
            transcript.update(&dhpart2);
            transcript.finalize()
        };
        self.compute_secrets(app, &dhss, view.rs1_id(), view.rs2_id(), view.aux_secret_id(), view.pbx_secret_id(), &total_hash, LABEL_RESPONDER)?;
        Ok(dhpart2)
    }

    /// Responder: DHPart2 closes the DH exchange. Verify the chain, the
    /// hvi commitment and the public value, derive keys and answer with
    /// Confirm1.
    pub fn prepare_confirm1<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let view = DhPartView::parse(msg).map_err(|_| Abort::Ignore)?;
        let suite = self.suite.ok_or(Abort::Error(WireError::CriticalSwError))?;
        if view.pv().len() != suite.pub_key.public_value_size() {
            return Err(Abort::Error(WireError::DhBadPublicValue));
        }
        let peer_h2 = self.peer_h2.ok_or(Abort::Error(WireError::CriticalSwError))?;

        // H1 chains to the H2 revealed in the Commit, and H1 keys the
        // Commit MAC.
        if !secure_eq(&hash::sha256(&[view.h1()]), &peer_h2) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::Dh2HmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        {
            let peer_commit = self.peer_commit.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let commit_view = CommitView::parse(peer_commit).map_err(|_| Abort::Error(WireError::CriticalSwError))?;
            if !verify_truncated_hmac(view.h1(), commit_view.maced_region(), commit_view.mac()) {
                self.hmac_failed(app, MessageType::Commit, SevereCode::CommitHmacFailed);
                return Err(Abort::Error(WireError::CriticalSwError));
            }
            // The DHPart2 MAC is keyed with the peer's H0; it is checked
            // once Confirm2 reveals it.

            // The Commit's hvi must equal hash(DHPart2 || our Hello): the
            // Initiator fixed its half of the exchange before seeing ours.
            let hvi = hash::digest(suite.hash, &[msg, &self.hello]);
            let committed_hvi = commit_view.hvi().ok_or(Abort::Error(WireError::CriticalSwError))?;
            if !secure_eq(&hvi[..HVI_SIZE], committed_hvi) {
                return Err(Abort::Error(WireError::DhHviMismatch));
            }
        }

        let dhss = match self.dh.as_ref().unwrap().agree(view.pv()) {
            Ok(ss) => ss,
            Err(_) => return Err(Abort::Error(WireError::DhBadPublicValue)),
        };

        self.peer_h1 = Some(*view.h1());
        self.peer_dhpart = Some(msg.to_vec());

        let total_hash = {
            let commit = self.peer_commit.as_ref().unwrap();
            let dhpart1 = self.our_dhpart.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let mut transcript = hash::TranscriptHash::new(suite.hash);
            transcript.update(&self.hello);
            transcript.update(commit);
            transcript.update(dhpart1);
            transcript.update(msg);
            transcript.finalize()
        };
        self.compute_secrets(app, &dhss, view.rs1_id(), view.rs2_id(), view.aux_secret_id(), view.pbx_secret_id(), &total_hash, LABEL_INITIATOR)?;

        app.send_info(Severity::Info, ReportCode::Info(InfoCode::ResponderDataReady));
        self.build_confirm(app, MessageType::Confirm1)
    }

    /// Initiator: Confirm1 proves the Responder derived the same keys.
    /// Verify, absorb its flags, update the cache and answer Confirm2.
    pub fn prepare_confirm2<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        if self.is_multi_stream() {
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        let decrypted = self.open_confirm(app, msg, Role::Responder)?;

        // H0 chains to the H1 from DHPart1 and keys the DHPart1 MAC.
        let peer_h1 = self.peer_h1.ok_or(Abort::Error(WireError::CriticalSwError))?;
        if !secure_eq(&hash::sha256(&[decrypted.h0()]), &peer_h1) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::Dh1HmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        {
            let peer_dhpart = self.peer_dhpart.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let dh_view = DhPartView::parse(peer_dhpart).map_err(|_| Abort::Error(WireError::CriticalSwError))?;
            if !verify_truncated_hmac(decrypted.h0(), dh_view.maced_region(), dh_view.mac()) {
                self.hmac_failed(app, MessageType::DhPart1, SevereCode::Dh1HmacFailed);
                return Err(Abort::Error(WireError::CriticalSwError));
            }
        }

        self.absorb_confirm_flags(app, &decrypted);
        self.update_record(decrypted.cache_expiry());

        app.send_info(Severity::Info, ReportCode::Info(InfoCode::InitiatorDataReady));
        self.build_confirm(app, MessageType::Confirm2)
    }

    /// Responder: Confirm2 closes the handshake. Verify and acknowledge.
    pub fn prepare_conf2ack<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let decrypted = self.open_confirm(app, msg, Role::Initiator)?;

        if self.is_multi_stream() {
            // No DHPart was exchanged: H1 derives from the revealed H0 and
            // retroactively authenticates Commit and Hello.
            let h1 = hash::sha256(&[decrypted.h0()]);
            let peer_commit = self.peer_commit.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let commit_view = CommitView::parse(peer_commit).map_err(|_| Abort::Error(WireError::CriticalSwError))?;
            if !secure_eq(&hash::sha256(&[&h1]), commit_view.h2())
                || !verify_truncated_hmac(&h1, commit_view.maced_region(), commit_view.mac())
            {
                self.hmac_failed(app, MessageType::Commit, SevereCode::CommitHmacFailed);
                return Err(Abort::Error(WireError::CriticalSwError));
            }
        } else {
            let peer_h1 = self.peer_h1.ok_or(Abort::Error(WireError::CriticalSwError))?;
            if !secure_eq(&hash::sha256(&[decrypted.h0()]), &peer_h1) {
                self.counters.hmac_failures += 1;
                app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::Dh2HmacFailed));
                return Err(Abort::Error(WireError::CriticalSwError));
            }
            let peer_dhpart = self.peer_dhpart.as_ref().ok_or(Abort::Error(WireError::CriticalSwError))?;
            let dh_view = DhPartView::parse(peer_dhpart).map_err(|_| Abort::Error(WireError::CriticalSwError))?;
            if !verify_truncated_hmac(decrypted.h0(), dh_view.maced_region(), dh_view.mac()) {
                self.hmac_failed(app, MessageType::DhPart2, SevereCode::Dh2HmacFailed);
                return Err(Abort::Error(WireError::CriticalSwError));
            }
        }

        self.absorb_confirm_flags(app, &decrypted);
        if !self.is_multi_stream() {
            self.update_record(decrypted.cache_expiry());
        }
        Ok(misc::build_ack(MessageType::Conf2Ack))
    }

    /* Multi-stream responder/initiator confirms */

    /// Responder of a dependent stream: the Commit carries the `Mult` key
    /// type and a nonce instead of an hvi.
    pub fn prepare_confirm1_multi<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let view = CommitView::parse(msg).map_err(|_| Abort::Ignore)?;
        if !view.is_multi_stream() {
            // DH commit against a multi-stream-only session.
            return Err(Abort::Error(WireError::UnsupportedPubKey));
        }
        let suite = self.commit_suite(&view)?;
        {
            // A dependent stream must stay on the master's algorithms.
            let params = self.multi_stream.as_ref().unwrap();
            if suite.hash != params.hash || suite.cipher != params.cipher || suite.auth_tag != params.auth_tag {
                return Err(Abort::Error(WireError::HelloMismatch));
            }
        }
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };
        if !secure_eq(&hash::sha256(&[view.h2()]), &peer.h3) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::CommitHmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        if !self.check_stored_hello_mac(app, view.h2()) {
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        let CommitVariant::MultiStream { nonce } = view.variant() else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };
        if !self.note_nonce(nonce) {
            return Err(Abort::Error(WireError::NonceReused));
        }

        self.suite = Some(suite);
        self.peer_h2 = Some(*view.h2());
        self.peer_commit = Some(msg.to_vec());
        self.our_commit = None;

        // We are the Responder: the transcript covers our own Hello and
        // the peer's Commit.
        let own_hello = self.hello.clone();
        self.derive_keys_multi(&own_hello, msg, Role::Responder);

        app.send_info(Severity::Info, ReportCode::Info(InfoCode::ResponderDataReady));
        self.build_confirm(app, MessageType::Confirm1)
    }

    /// Initiator of a dependent stream: Confirm1 arrived for our Commit.
    pub fn prepare_confirm2_multi<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Prepared {
        let decrypted = self.open_confirm(app, msg, Role::Responder)?;

        // Walk the peer's chain from the revealed H0 all the way to the H3
        // committed in its Hello.
        let h1 = hash::sha256(&[decrypted.h0()]);
        let h2 = hash::sha256(&[&h1]);
        let Some(peer) = &self.peer else {
            return Err(Abort::Error(WireError::CriticalSwError));
        };
        if !secure_eq(&hash::sha256(&[&h2]), &peer.h3) {
            self.counters.hmac_failures += 1;
            app.send_info(Severity::Severe, ReportCode::Severe(SevereCode::HelloHmacFailed));
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        if !self.check_stored_hello_mac(app, &h2) {
            return Err(Abort::Error(WireError::CriticalSwError));
        }

        self.absorb_confirm_flags(app, &decrypted);
        app.send_info(Severity::Info, ReportCode::Info(InfoCode::InitiatorDataReady));
        self.build_confirm(app, MessageType::Confirm2)
    }

    /* Key derivation */

    /// Record a multi-stream nonce; false if it was already seen in this
    /// session.
    fn note_nonce(&mut self, nonce: &[u8; NONCE_SIZE]) -> bool {
        if self.seen_nonces.iter().any(|n| secure_eq(n, nonce)) {
            return false;
        }
        if self.seen_nonces.len() >= MAX_SEEN_NONCES {
            self.seen_nonces.remove(0);
        }
        self.seen_nonces.push(*nonce);
        true
    }

    /// Our four secret IDs as sent in a DHPart, keyed by our protocol role
    /// label. Slots without an underlying secret get random filler so the
    /// wire image never reveals which secrets we hold.
    fn own_secret_ids(&self, alg: HashAlgorithm, role_label: &[u8]) -> [[u8; SECRET_ID_SIZE]; 4] {
        let now = unix_now();
        let mut ids = [[0u8; SECRET_ID_SIZE]; 4];
        for id in ids.iter_mut() {
            OsRng.fill_bytes(id);
        }
        if let Some(r) = &self.record {
            if r.has_rs1(now) {
                ids[0] = kdf::secret_id(alg, r.rs1().as_bytes(), role_label);
            }
            if r.has_rs2(now) {
                ids[1] = kdf::secret_id(alg, r.rs2().as_bytes(), role_label);
            }
            if r.has_mitm_key() {
                ids[3] = kdf::secret_id(alg, r.mitm_key().as_bytes(), role_label);
            }
        }
        if let Some(aux) = &self.aux_secret {
            // The aux secret ID is keyed with our own H3, RFC 6189 4.3.
            ids[2] = kdf::secret_id(alg, aux.as_bytes(), &self.h3);
        }
        ids
    }

    /// Match the peer's secret IDs against ours, compute s0 and derive the
    /// key block. `peer_role_label` is the label the peer used for its IDs.
    #[allow(clippy::too_many_arguments)]
    fn compute_secrets<A: ZrtpCallback>(
        &mut self,
        app: &mut A,
        dhss: &SecretVec,
        peer_rs1_id: &[u8; SECRET_ID_SIZE],
        peer_rs2_id: &[u8; SECRET_ID_SIZE],
        peer_aux_id: &[u8; SECRET_ID_SIZE],
        peer_pbx_id: &[u8; SECRET_ID_SIZE],
        total_hash: &[u8],
        peer_role_label: &'static [u8],
    ) -> Result<(), Abort> {
        let suite = self.suite.unwrap();
        let now = unix_now();

        // Cross-match our rs1/rs2 against the peer's, RFC 6189 4.3.1.
        let mut s1: Option<SecretVec> = None;
        let mut matches = SecretMatches::default();
        if let Some(r) = &self.record {
            let rs1_id = r.has_rs1(now).then(|| kdf::secret_id(suite.hash, r.rs1().as_bytes(), peer_role_label));
            let rs2_id = r.has_rs2(now).then(|| kdf::secret_id(suite.hash, r.rs2().as_bytes(), peer_role_label));
            if let Some(id) = &rs1_id {
                if secure_eq(id, peer_rs1_id) || secure_eq(id, peer_rs2_id) {
                    matches.rs1 = true;
                    s1 = Some(SecretVec::from_slice(r.rs1().as_bytes()));
                }
            }
            if s1.is_none() {
                if let Some(id) = &rs2_id {
                    if secure_eq(id, peer_rs1_id) || secure_eq(id, peer_rs2_id) {
                        matches.rs2 = true;
                        s1 = Some(SecretVec::from_slice(r.rs2().as_bytes()));
                    }
                }
            }
        }

        let mut s2: Option<SecretVec> = None;
        if let Some(r) = &self.record {
            if r.has_mitm_key() {
                let id = kdf::secret_id(suite.hash, r.mitm_key().as_bytes(), peer_role_label);
                if secure_eq(&id, peer_pbx_id) {
                    matches.pbx = true;
                    s2 = Some(SecretVec::from_slice(r.mitm_key().as_bytes()));
                }
            }
        }

        let mut s3: Option<SecretVec> = None;
        if let Some(aux) = &self.aux_secret {
            // The peer keyed its aux ID with its own H3.
            if let Some(peer) = &self.peer {
                let id = kdf::secret_id(suite.hash, aux.as_bytes(), &peer.h3);
                if secure_eq(&id, peer_aux_id) {
                    matches.aux = true;
                    s3 = Some(aux.clone());
                } else {
                    app.send_info(Severity::Warning, ReportCode::Warning(WarningCode::NoExpectedAuxMatch));
                }
            }
        }

        // Cache bookkeeping: a record with secrets that did not match is
        // the mismatch case of RFC 6189 4.6.1 and blocks persisting the
        // new rs1 until the user verifies the SAS.
        if self.secrets_cached & (SECRET_RS1 | SECRET_RS2) != 0 {
            if matches.any_rs() {
                self.counters.cache_hits += 1;
            } else {
                self.counters.cache_miss_mismatch(app);
                self.save_record_allowed = false;
            }
        } else {
            self.counters.cache_misses += 1;
            if self.cache.is_none() {
                app.send_info(Severity::Warning, ReportCode::Warning(WarningCode::NoCache));
                self.save_record_allowed = false;
            }
        }
        self.matches = matches;

        #[cfg(feature = "logging")]
        app.event_log(LogEvent::SecretsMatched {
            rs1: matches.rs1,
            rs2: matches.rs2,
            aux: matches.aux,
            pbx: matches.pbx,
        });

        let (zid_i, zid_r) = self.zids_by_role();
        let s0 = kdf::derive_s0(
            suite.hash,
            dhss,
            &zid_i,
            &zid_r,
            total_hash,
            s1.as_ref().map(|s| s.as_bytes()),
            s2.as_ref().map(|s| s.as_bytes()),
            s3.as_ref().map(|s| s.as_bytes()),
        );
        let context = KdfContext::new(&zid_i, &zid_r, total_hash);
        self.keys = Some(kdf::derive_session_keys(suite.hash, &s0, suite.cipher, &context));
        Ok(())
    }

    fn derive_keys_multi(&mut self, responder_hello: &[u8], commit: &[u8], our_role: Role) {
        // In multi-stream mode the Responder's Hello and the Commit are the
        // whole transcript; s0 comes from the master's session key.
        let suite = self.suite.unwrap();
        self.role = our_role;
        let total_hash = hash::digest(suite.hash, &[responder_hello, commit]);
        let (zid_i, zid_r) = self.zids_by_role();
        let context = KdfContext::new(&zid_i, &zid_r, &total_hash);
        let params = self.multi_stream.as_ref().unwrap();
        let s0 = kdf::derive_s0_multi_stream(suite.hash, &params.session_key, &context);
        self.keys = Some(kdf::derive_session_keys(suite.hash, &s0, suite.cipher, &context));
    }

    fn zids_by_role(&self) -> ([u8; ZID_SIZE], [u8; ZID_SIZE]) {
        let peer_zid = self.peer.as_ref().map(|p| p.zid).unwrap_or_default();
        match self.role {
            Role::Responder => (peer_zid, self.own_zid),
            _ => (self.own_zid, peer_zid),
        }
    }

    /* Confirm handling */

    /// Our Confirm encryption/MAC keys by role; `for_role` picks whose keys
    /// the message uses (the sender's).
    fn confirm_keys(&self, for_role: Role) -> (&SecretVec, &SecretVec) {
        let keys = self.keys.as_ref().unwrap();
        match for_role {
            Role::Initiator => (&keys.zrtp_key_i, &keys.hmac_key_i),
            _ => (&keys.zrtp_key_r, &keys.hmac_key_r),
        }
    }

    fn build_confirm<A: ZrtpCallback>(&mut self, app: &mut A, msg_type: MessageType) -> Prepared {
        let suite = self.suite.unwrap();
        let mut flags = 0u8;
        if !self.config.paranoid && self.record.as_ref().map_or(false, |r| r.is_sas_verified()) {
            flags |= confirm::FLAG_SAS_VERIFIED;
        }
        if self.enrollment_mode {
            flags |= confirm::FLAG_ENROLLMENT;
        }
        if self.config.disclosure {
            flags |= confirm::FLAG_DISCLOSURE;
        }

        let signature = if self.config.sas_signature && self.peer.as_ref().map_or(false, |p| p.sas_sign) {
            let sas_hash = self.keys.as_ref().unwrap().sas_hash;
            self.signature_out = app.sign_sas(&sas_hash).filter(|s| !s.is_empty() && s.len() % WORD_SIZE == 0);
            self.signature_out.clone()
        } else {
            None
        };

        let cache_expiry = if self.config.rs_ttl < 0 { u32::MAX } else { self.config.rs_ttl as u32 };

        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let (enc_key, mac_key) = self.confirm_keys(self.role);
        let body = ConfirmBody {
            h0: self.h0.as_bytes(),
            flags,
            cache_expiry,
            signature: signature.as_deref(),
        };
        let msg = confirm::build(
            msg_type,
            &body,
            &iv,
            |buf| cfb::encrypt(suite.cipher, enc_key.as_bytes(), &iv, buf),
            |enc| {
                let mac = hash::hmac(suite.hash, mac_key.as_bytes(), &[enc]);
                mac.as_bytes()[..MAC_SIZE].try_into().unwrap()
            },
        );
        Ok(msg)
    }

    /// Verify and decrypt a received Confirm sent under `sender_role` keys.
    fn open_confirm<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8], sender_role: Role) -> Result<ConfirmDecrypted, Abort> {
        let suite = self.suite.ok_or(Abort::Error(WireError::CriticalSwError))?;
        if self.keys.is_none() {
            return Err(Abort::Error(WireError::CriticalSwError));
        }
        let view = ConfirmView::parse(msg).map_err(|_| Abort::Ignore)?;

        let (enc_key, mac_key) = self.confirm_keys(sender_role);
        let mac = hash::hmac(suite.hash, mac_key.as_bytes(), &[view.encrypted()]);
        if !secure_eq(&mac.as_bytes()[..MAC_SIZE], view.confirm_mac()) {
            self.counters.hmac_failures += 1;
            #[cfg(feature = "logging")]
            app.event_log(LogEvent::HmacFailed(MessageType::Confirm1));
            return Err(Abort::Error(WireError::ConfirmHmacFailed));
        }

        let mut plain = msg.to_vec();
        let iv = *view.iv();
        let enc_start = msg.len() - view.encrypted().len();
        cfb::decrypt(suite.cipher, enc_key.as_bytes(), &iv, &mut plain[enc_start..]);
        ConfirmDecrypted::new(plain).map_err(|_| Abort::Error(WireError::MalformedPacket))
    }

    /// Flags and signature of a verified peer Confirm.
    fn absorb_confirm_flags<A: ZrtpCallback>(&mut self, app: &mut A, decrypted: &ConfirmDecrypted) {
        let flags = decrypted.flags();

        // A peer reporting the SAS as unverified clears our flag too,
        // RFC 6189 section 7.1.
        if flags & confirm::FLAG_SAS_VERIFIED == 0 {
            if let Some(r) = &mut self.record {
                if r.is_sas_verified() {
                    r.set_sas_verified(false);
                }
            }
        }
        self.peer_disclosure_seen = flags & confirm::FLAG_DISCLOSURE != 0;

        if flags & confirm::FLAG_ENROLLMENT != 0
            && self.config.trusted_mitm
            && self.peer.as_ref().map_or(false, |p| p.mitm)
            && !self.config.paranoid
        {
            self.pending_pbx_secret = Some(self.compute_pbx_secret());
            app.ask_enrollment(EnrollmentInfo::Request);
        }

        if let Some(sig) = decrypted.signature() {
            let sas_hash = self.keys.as_ref().unwrap().sas_hash;
            if app.check_sas_signature(&sas_hash, sig) {
                self.signature_in = Some(sig.to_vec());
            } else {
                app.send_info(Severity::Warning, ReportCode::Warning(WarningCode::SasSignatureInvalid));
            }
        }
    }

    /// pbxsecret = KDF(ZRTPSess, "Trusted MiTM key", ZIDi || ZIDr),
    /// RFC 6189 section 7.3.1.
    fn compute_pbx_secret(&self) -> SecretVec {
        let suite = self.suite.unwrap();
        let keys = self.keys.as_ref().unwrap();
        let (zid_i, zid_r) = self.zids_by_role();
        let context = KdfContext::new(&zid_i, &zid_r, &[]);
        kdf::kdf(suite.hash, keys.zrtp_session.as_bytes(), LABEL_TRUSTED_MITM, &context, RS_SIZE)
    }

    /// Rotate the retained secret into the working record and persist it
    /// unless a cache mismatch put saving on hold.
    fn update_record(&mut self, peer_cache_expiry: u32) {
        if self.is_multi_stream() {
            return;
        }
        let Some(keys) = &self.keys else { return };
        let now = unix_now();
        // The effective expiry is the minimum of both sides, RFC 6189
        // section 4.9. 0xffffffff on the wire and a negative local TTL
        // both mean unbounded.
        let ttl = if peer_cache_expiry == u32::MAX {
            self.config.rs_ttl
        } else if self.config.rs_ttl < 0 {
            peer_cache_expiry as i64
        } else {
            self.config.rs_ttl.min(peer_cache_expiry as i64)
        };
        if let Some(r) = &mut self.record {
            r.rotate_rs1(&keys.new_rs1, now, ttl);
            r.mark_secure(now);
            if self.save_record_allowed {
                self.persist_record();
            }
        }
    }

    fn persist_record(&mut self) {
        if let (Some(cache), Some(record)) = (&self.cache, &self.record) {
            if let Ok(mut cache) = cache.lock() {
                let _ = cache.save_record(record);
            }
        }
    }

    /* SRTP hand-off */

    pub fn srtp_ready<A: ZrtpCallback>(&mut self, app: &mut A, part: EnableSecurity) -> bool {
        let Some(suite) = self.suite else { return false };
        let Some(keys) = &self.keys else { return false };
        let secrets = SrtpSecrets {
            cipher: suite.cipher,
            auth_tag: suite.auth_tag,
            key_initiator: keys.srtp_key_i.as_bytes(),
            salt_initiator: keys.srtp_salt_i.as_bytes(),
            key_responder: keys.srtp_key_r.as_bytes(),
            salt_responder: keys.srtp_salt_r.as_bytes(),
            role: self.role,
        };
        app.srtp_secrets_ready(part, &secrets)
    }

    pub fn srtp_off<A: ZrtpCallback>(&mut self, app: &mut A, part: EnableSecurity) {
        app.srtp_secrets_off(part);
    }

    /// Secure state reached: compute and display the SAS.
    pub fn enter_secure<A: ZrtpCallback>(&mut self, app: &mut A) {
        let suite = self.suite.unwrap();
        app.send_info(Severity::Info, ReportCode::Info(InfoCode::SecureStateOn));

        if !self.is_multi_stream() {
            if let Some(keys) = &self.keys {
                let sas_value: [u8; 4] = keys.sas_hash[..4].try_into().unwrap();
                self.sas_string = sas::render_sas(suite.sas, &sas_value);
            }
        }
        let verified = !self.config.paranoid && self.record.as_ref().map_or(false, |r| r.is_sas_verified());
        let cipher_info = format!(
            "{}/{}",
            std::str::from_utf8(suite.cipher.wire_name()).unwrap_or(""),
            std::str::from_utf8(suite.auth_tag.wire_name()).unwrap_or(""),
        );
        app.srtp_secrets_on(&cipher_info, &self.sas_string, verified);
    }

    /* SASRelay, RFC 6189 section 7.3 */

    /// Build an outbound SASRelay (trusted PBX side).
    pub fn build_sas_relay(&mut self, sas_hash: &[u8; 32], render: SasRender) -> Option<Vec<u8>> {
        let suite = self.suite?;
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let (enc_key, mac_key) = self.confirm_keys(self.role);
        Some(confirm::build_sas_relay(
            sas_hash,
            render.wire_name(),
            &iv,
            |buf| cfb::encrypt(suite.cipher, enc_key.as_bytes(), &iv, buf),
            |enc| {
                let mac = hash::hmac(suite.hash, mac_key.as_bytes(), &[enc]);
                mac.as_bytes()[..MAC_SIZE].try_into().unwrap()
            },
        ))
    }

    /// Process an inbound SASRelay. Always acknowledged; the payload is
    /// honored only outside paranoid mode and only from an enrolled peer.
    pub fn handle_sas_relay<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8]) -> Option<Vec<u8>> {
        let suite = self.suite?;
        let view = ConfirmView::parse(msg).ok()?;
        let sender_role = match self.role {
            Role::Initiator => Role::Responder,
            _ => Role::Initiator,
        };
        let (enc_key, mac_key) = self.confirm_keys(sender_role);
        let mac = hash::hmac(suite.hash, mac_key.as_bytes(), &[view.encrypted()]);
        if !secure_eq(&mac.as_bytes()[..MAC_SIZE], view.confirm_mac()) {
            self.counters.hmac_failures += 1;
            return None;
        }
        let mut plain = msg.to_vec();
        let iv = *view.iv();
        let enc_start = msg.len() - view.encrypted().len();
        cfb::decrypt(suite.cipher, enc_key.as_bytes(), &iv, &mut plain[enc_start..]);
        let relay = SasRelayDecrypted::new(plain).ok()?;

        let trusted = self.record.as_ref().map_or(false, |r| r.has_mitm_key() && r.is_sas_verified());
        if !self.config.paranoid && trusted && self.peer.as_ref().map_or(false, |p| p.mitm) {
            if let Some(render) = SasRender::from_wire_name(relay.render_scheme()) {
                let sas_value: [u8; 4] = relay.sas_hash()[..4].try_into().unwrap();
                self.sas_string = sas::render_sas(render, &sas_value);
                // A relayed SAS is by definition unverified for us.
                app.srtp_secrets_on("", &self.sas_string, false);
            }
        } else if !trusted {
            app.send_info(
                Severity::ZrtpError,
                ReportCode::Wire { raw: WireError::UntrustedMitm as u32, known: Some(WireError::UntrustedMitm) },
            );
        }
        Some(misc::build_ack(MessageType::RelayAck))
    }

    /* Retroactive MAC checks */

    fn check_stored_hello_mac<A: ZrtpCallback>(&mut self, app: &mut A, key: &[u8; HASH_IMAGE_SIZE]) -> bool {
        let Some(peer) = &self.peer else { return false };
        let Ok(view) = HelloView::parse(&peer.hello) else { return false };
        if verify_truncated_hmac(key, view.maced_region(), view.mac()) {
            return true;
        }
        self.hmac_failed(app, MessageType::Hello, SevereCode::HelloHmacFailed);
        false
    }

    fn hmac_failed<A: ZrtpCallback>(&mut self, app: &mut A, _msg_type: MessageType, code: SevereCode) {
        self.counters.hmac_failures += 1;
        #[cfg(feature = "logging")]
        app.event_log(LogEvent::HmacFailed(_msg_type));
        app.send_info(Severity::Severe, ReportCode::Severe(code));
    }
}

impl Counters {
    fn cache_miss_mismatch<A: ZrtpCallback>(&mut self, app: &mut A) {
        self.cache_misses += 1;
        #[cfg(feature = "logging")]
        app.event_log(LogEvent::CacheMismatch);
        app.send_info(Severity::Warning, ReportCode::Warning(WarningCode::NoExpectedRsMatch));
    }
}

fn random_zid() -> [u8; ZID_SIZE] {
    let mut zid = [0u8; ZID_SIZE];
    OsRng.fill_bytes(&mut zid);
    zid
}

/// Implicit packet MAC: leftmost 2 words of HMAC-SHA256.
fn truncated_hmac(key: &[u8], data: &[u8]) -> [u8; MAC_SIZE] {
    hash::hmac_sha256(key, &[data])[..MAC_SIZE].try_into().unwrap()
}

fn verify_truncated_hmac(key: &[u8], data: &[u8], mac: &[u8; MAC_SIZE]) -> bool {
    secure_eq(&truncated_hmac(key, data), mac)
}

/// One ZRTP stream. See the crate documentation for the calling contract:
/// all three event sources (`process_message`, `process_timeout`, control
/// calls) must be serialized by the host.
pub struct ZrtpSession {
    core: SessionCore,
    engine: StateEngine,
    started: bool,
}

impl ZrtpSession {
    /// Create an engine instance. `client_id` is truncated or right-padded
    /// to 16 ASCII bytes. A session without a cache performs the handshake
    /// but cannot offer key continuity.
    pub fn new(client_id: &str, config: ZrtpConfig, cache: Option<Arc<Mutex<ZidCache>>>) -> Self {
        let engine = StateEngine::new(
            config.t1_resend,
            config.t1_resend_extend,
            config.t1_cap,
            config.t2_resend,
            config.t2_cap,
        );
        Self {
            core: SessionCore::new(client_id, config, cache),
            engine,
            started: false,
        }
    }

    /// Kick off the protocol: sends the first Hello and arms T1.
    pub fn start<A: ZrtpCallback>(&mut self, app: &mut A) {
        if self.core.stopped || self.started {
            return;
        }
        self.started = true;
        self.engine.process_event(&mut self.core, app, Event::Initial);
    }

    /// Stop the stream: cancels timers, zeroizes secrets and refuses any
    /// further events.
    pub fn stop<A: ZrtpCallback>(&mut self, app: &mut A) {
        if self.core.stopped {
            return;
        }
        self.engine.process_event(&mut self.core, app, Event::Close);
        self.core.wipe_secrets();
        self.core.stopped = true;
    }

    /// Feed one received ZRTP message (without transport framing or CRC).
    /// Malformed packets are dropped without a state change.
    pub fn process_message<A: ZrtpCallback>(&mut self, app: &mut A, msg: &[u8], peer_ssrc: u32) {
        if self.core.stopped {
            return;
        }
        self.core.set_peer_ssrc(peer_ssrc);
        match parse_header(msg) {
            Ok((msg_type, msg)) => {
                if msg_type == MessageType::Hello {
                    self.core.counters.hello_received += 1;
                }
                self.engine.process_event(&mut self.core, app, Event::Packet(msg_type, msg));
            }
            Err(_e) => {
                #[cfg(feature = "logging")]
                app.event_log(LogEvent::Dropped { msg_type: None, reason: "malformed packet" });
            }
        }
    }

    /// The host timer fired.
    pub fn process_timeout<A: ZrtpCallback>(&mut self, app: &mut A) {
        if self.core.stopped {
            return;
        }
        self.engine.process_event(&mut self.core, app, Event::Timer);
    }

    /// The first valid SRTP packet can stand in for a lost Conf2Ack.
    pub fn conf2_ack_secure<A: ZrtpCallback>(&mut self, app: &mut A) {
        if self.core.stopped {
            return;
        }
        self.engine.conf2_ack_secure(&mut self.core, app);
    }

    pub fn state(&self) -> State {
        self.engine.state()
    }

    pub fn in_state(&self, state: State) -> bool {
        self.engine.in_state(state)
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    /// Set the auxiliary secret; legal only before `start`.
    pub fn set_aux_secret(&mut self, secret: &[u8]) -> Result<(), ZrtpError> {
        if self.core.stopped {
            return Err(ZrtpError::SessionClosed);
        }
        if self.started {
            return Err(ZrtpError::WrongState);
        }
        if secret.is_empty() || secret.len() > MAX_AUX_SECRET_SIZE {
            return Err(ZrtpError::InvalidParameter);
        }
        self.core.aux_secret = Some(SecretVec::from_slice(secret));
        Ok(())
    }

    /// Our Hello hash for SDP signaling (RFC 6189 section 8), formatted as
    /// `"<version> <hex>"`. One entry per supported protocol version.
    pub fn hello_hash(&self, index: usize) -> Option<String> {
        if index >= SUPPORTED_VERSIONS.len() {
            return None;
        }
        let version = std::str::from_utf8(SUPPORTED_VERSIONS[index]).unwrap();
        Some(format!("{} {}", version, to_hex(&self.core.hello_hash)))
    }

    pub fn number_supported_versions() -> usize {
        SUPPORTED_VERSIONS.len()
    }

    /// The peer's Hello hash, available once its Hello was received.
    pub fn peer_hello_hash(&self) -> Option<String> {
        let peer = self.core.peer.as_ref()?;
        let version = std::str::from_utf8(&peer.version).unwrap_or("?");
        Some(format!("{} {}", version, to_hex(&peer.hello_hash)))
    }

    pub fn peer_client_id(&self) -> Option<String> {
        let peer = self.core.peer.as_ref()?;
        Some(String::from_utf8_lossy(&peer.client_id).trim_end().to_string())
    }

    pub fn peer_zid(&self) -> Option<[u8; ZID_SIZE]> {
        self.core.peer.as_ref().map(|p| p.zid)
    }

    pub fn own_zid(&self) -> &[u8; ZID_SIZE] {
        &self.core.own_zid
    }

    /// Multi-stream parameters of a secure master stream: an opaque
    /// snapshot for `set_multi_stream_params` on dependent streams.
    pub fn multi_stream_params(&self) -> Option<Vec<u8>> {
        if !self.in_state(State::SecureState) || self.core.is_multi_stream() {
            return None;
        }
        let suite = self.core.suite?;
        let keys = self.core.keys.as_ref()?;
        let mut out = Vec::with_capacity(4 * WORD_SIZE + 2 + keys.zrtp_session.len());
        out.extend_from_slice(suite.hash.wire_name());
        out.extend_from_slice(suite.cipher.wire_name());
        out.extend_from_slice(suite.auth_tag.wire_name());
        out.extend_from_slice(suite.sas.wire_name());
        out.extend_from_slice(&(keys.zrtp_session.len() as u16).to_be_bytes());
        out.extend_from_slice(keys.zrtp_session.as_bytes());
        Some(out)
    }

    /// Make this a dependent stream of the master whose parameters are
    /// given. Must be called before `start`.
    pub fn set_multi_stream_params(&mut self, params: &[u8]) -> Result<(), ZrtpError> {
        if self.core.stopped {
            return Err(ZrtpError::SessionClosed);
        }
        if self.started {
            return Err(ZrtpError::WrongState);
        }
        if params.len() < 4 * WORD_SIZE + 2 {
            return Err(ZrtpError::InvalidParameter);
        }
        let hash = HashAlgorithm::from_wire_name(&params[0..4]).ok_or(ZrtpError::InvalidParameter)?;
        let cipher = CipherAlgorithm::from_wire_name(&params[4..8]).ok_or(ZrtpError::InvalidParameter)?;
        let auth_tag = AuthTag::from_wire_name(&params[8..12]).ok_or(ZrtpError::InvalidParameter)?;
        let sas = SasRender::from_wire_name(&params[12..16]).ok_or(ZrtpError::InvalidParameter)?;
        let len = u16::from_be_bytes(params[16..18].try_into().unwrap()) as usize;
        if params.len() != 18 + len || len != hash.digest_size() {
            return Err(ZrtpError::InvalidParameter);
        }
        self.core.multi_stream = Some(MultiStreamParams {
            hash,
            cipher,
            auth_tag,
            sas,
            session_key: SecretVec::from_slice(&params[18..]),
        });
        Ok(())
    }

    pub fn is_multi_stream(&self) -> bool {
        self.core.is_multi_stream()
    }

    pub fn is_multi_stream_available(&self) -> bool {
        self.core.peer.as_ref().map_or(false, |p| p.multi_stream)
    }

    /// The user confirmed the SAS. Persists the verified flag together
    /// with any retained secret held back by a cache mismatch. A no-op in
    /// paranoid mode.
    pub fn sas_verified(&mut self) {
        if self.core.config.paranoid {
            return;
        }
        if let Some(r) = &mut self.core.record {
            r.set_sas_verified(true);
            self.core.save_record_allowed = true;
            self.core.persist_record();
        }
    }

    pub fn reset_sas_verified(&mut self) {
        if let Some(r) = &mut self.core.record {
            r.set_sas_verified(false);
            self.core.persist_record();
        }
    }

    /// The SAS verification state reported to the application. Always
    /// false in paranoid mode.
    pub fn is_sas_verified(&self) -> bool {
        !self.core.config.paranoid && self.core.record.as_ref().map_or(false, |r| r.is_sas_verified())
    }

    pub fn sas_string(&self) -> &str {
        &self.core.sas_string
    }

    /// The full SAS hash, for PBX relaying and signatures.
    pub fn sas_hash(&self) -> Option<&[u8; 32]> {
        self.core.keys.as_ref().map(|k| &k.sas_hash)
    }

    /// The exported key of RFC 6189 section 4.5.2.
    pub fn exported_key(&self) -> Option<&[u8]> {
        if !self.in_state(State::SecureState) {
            return None;
        }
        self.core.keys.as_ref().map(|k| k.zrtp_export.as_bytes())
    }

    /* Enrollment, RFC 6189 section 7.3 */

    pub fn set_enrollment_mode(&mut self, yes: bool) {
        self.core.enrollment_mode = yes && self.core.config.trusted_mitm;
    }

    pub fn is_enrollment_mode(&self) -> bool {
        self.core.enrollment_mode
    }

    /// Answer a pending enrollment offer. On acceptance the trusted MitM
    /// key is stored in the peer's cache record.
    pub fn accept_enrollment<A: ZrtpCallback>(&mut self, app: &mut A, accepted: bool) {
        let Some(pbx_secret) = self.core.pending_pbx_secret.take() else {
            app.ask_enrollment(EnrollmentInfo::Failed);
            return;
        };
        if !accepted {
            app.ask_enrollment(EnrollmentInfo::Canceled);
            return;
        }
        if let Some(r) = &mut self.core.record {
            let key = Secret::from_bytes(pbx_secret.as_bytes());
            r.set_mitm_key(&key, unix_now());
            self.core.persist_record();
            app.ask_enrollment(EnrollmentInfo::Ok);
        } else {
            app.ask_enrollment(EnrollmentInfo::Failed);
        }
    }

    pub fn is_peer_enrolled(&self) -> bool {
        self.core.record.as_ref().map_or(false, |r| r.has_mitm_key())
    }

    /// Send a SASRelay to an enrolled peer (PBX side). Only legal in the
    /// secure state.
    pub fn send_sas_relay<A: ZrtpCallback>(&mut self, app: &mut A, sas_hash: &[u8; 32], render: SasRender) -> bool {
        if self.core.stopped || !self.in_state(State::SecureState) {
            return false;
        }
        let Some(relay) = self.core.build_sas_relay(sas_hash, render) else {
            return false;
        };
        self.engine.send_sas_relay(&mut self.core, app, relay)
    }

    /// Mark the rs2 slot valid, see RFC 6189 section 4.6.1 note on cache
    /// reconstruction.
    pub fn set_rs2_valid(&mut self) {
        if let Some(r) = &mut self.core.record {
            r.set_rs2_valid();
            self.core.persist_record();
        }
    }

    pub fn secure_since(&self) -> i64 {
        self.core.record.as_ref().map_or(0, |r| r.secure_since())
    }

    pub fn is_peer_disclosure_flag(&self) -> bool {
        self.core.peer_disclosure_seen
    }

    /// Signature block received from the peer, if it verified.
    pub fn signature_data(&self) -> Option<&[u8]> {
        self.core.signature_in.as_deref()
    }

    /// Negotiated algorithms and secret cache/match state.
    pub fn detail_info(&self) -> ZrtpInfo {
        let mut info = ZrtpInfo {
            secrets_cached: self.core.secrets_cached,
            ..ZrtpInfo::default()
        };
        let m = &self.core.matches;
        if m.rs1 {
            info.secrets_matched |= SECRET_RS1;
        }
        if m.rs2 {
            info.secrets_matched |= SECRET_RS2;
        }
        if m.pbx {
            info.secrets_matched |= SECRET_PBX;
        }
        if m.aux {
            info.secrets_matched |= SECRET_AUX;
        }
        if let Some(suite) = self.core.suite {
            info.hash = wire_str(suite.hash.wire_name());
            info.cipher = wire_str(suite.cipher.wire_name());
            info.pub_key = wire_str(suite.pub_key.wire_name());
            info.sas_type = wire_str(suite.sas.wire_name());
            info.auth_len = wire_str(suite.auth_tag.wire_name());
        }
        info
    }

    /* Observability */

    pub fn num_counters() -> usize {
        Counters::COUNT
    }

    pub fn read_counters(&self, out: &mut [u32]) -> usize {
        self.core.counters.read(out)
    }

    pub fn num_retry_counters() -> usize {
        RETRY_COUNTERS
    }

    pub fn read_retry_counters(&self, out: &mut [u32]) -> usize {
        let counters = self.engine.retry_counters();
        let n = counters.len().min(out.len());
        out[..n].copy_from_slice(&counters[..n]);
        n
    }
}

fn wire_str(name: &'static [u8; 4]) -> &'static str {
    std::str::from_utf8(name).unwrap_or("")
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::misc::{build_ping, PingAckView};

    #[derive(Default)]
    struct CollectApp {
        out: Vec<Vec<u8>>,
    }

    impl ZrtpCallback for CollectApp {
        fn send_data(&mut self, data: &[u8]) -> bool {
            self.out.push(data.to_vec());
            true
        }
        fn activate_timer(&mut self, _ms: i32) -> bool {
            true
        }
        fn cancel_timer(&mut self) -> bool {
            true
        }
        fn send_info(&mut self, _severity: Severity, _code: ReportCode) {}
        fn negotiation_failed(&mut self, _severity: Severity, _code: ReportCode) {}
        fn not_supported_by_other(&mut self) {}
        fn srtp_secrets_ready(&mut self, _part: EnableSecurity, _secrets: &SrtpSecrets<'_>) -> bool {
            true
        }
        fn srtp_secrets_off(&mut self, _part: EnableSecurity) {}
        fn srtp_secrets_on(&mut self, _cipher_info: &str, _sas: &str, _verified: bool) {}
    }

    fn session() -> ZrtpSession {
        ZrtpSession::new("unit test", ZrtpConfig::new(), None)
    }

    #[test]
    fn version_digits() {
        assert_eq!(version_int(b"1.10"), 11);
        assert_eq!(version_int(b"1.20"), 12);
    }

    #[test]
    fn hello_hash_is_version_and_hex() {
        let s = session();
        let h = s.hello_hash(0).unwrap();
        assert!(h.starts_with("1.10 "));
        assert_eq!(h.len(), 5 + 64);
        assert!(s.hello_hash(1).is_none());
    }

    #[test]
    fn aux_secret_only_before_start() {
        let mut app = CollectApp::default();
        let mut s = session();
        assert_eq!(s.set_aux_secret(b"pre-shared"), Ok(()));
        assert_eq!(s.set_aux_secret(&[]), Err(ZrtpError::InvalidParameter));
        s.start(&mut app);
        assert_eq!(s.set_aux_secret(b"too late"), Err(ZrtpError::WrongState));
    }

    #[test]
    fn start_sends_hello_and_counts_it() {
        let mut app = CollectApp::default();
        let mut s = session();
        s.start(&mut app);
        assert_eq!(s.state(), State::Detect);
        assert_eq!(app.out.len(), 1);
        assert_eq!(&app.out[0][4..12], MSG_HELLO);
        let mut counters = [0u32; 16];
        s.read_counters(&mut counters);
        assert_eq!(counters[0], 1);
    }

    #[test]
    fn ping_is_answered_in_any_state() {
        let mut app = CollectApp::default();
        let mut s = session();
        let ping = build_ping(VERSION_1_10, &[0x42; 8]);
        s.process_message(&mut app, &ping, 0x1234);
        assert_eq!(app.out.len(), 1);
        let (t, m) = parse_header(&app.out[0]).unwrap();
        assert_eq!(t, MessageType::PingAck);
        let ack = PingAckView::parse(m).unwrap();
        assert_eq!(ack.received_endpoint_hash(), &[0x42; 8]);
        assert_eq!(ack.received_ssrc(), 0x1234);
    }

    #[test]
    fn malformed_packets_are_dropped_without_state_change() {
        let mut app = CollectApp::default();
        let mut s = session();
        s.start(&mut app);
        app.out.clear();
        s.process_message(&mut app, &[0u8; 5], 1);
        s.process_message(&mut app, b"\x50\x5a\x00\x03NotAType", 1);
        assert_eq!(s.state(), State::Detect);
        assert!(app.out.is_empty());
    }

    #[test]
    fn multi_stream_params_are_validated() {
        let mut s = session();
        let mut params = Vec::new();
        params.extend_from_slice(b"S256");
        params.extend_from_slice(b"AES1");
        params.extend_from_slice(b"HS32");
        params.extend_from_slice(b"B32 ");
        params.extend_from_slice(&(32u16).to_be_bytes());
        params.extend_from_slice(&[7u8; 32]);
        assert_eq!(s.set_multi_stream_params(&params), Ok(()));
        assert!(s.is_multi_stream());

        let mut bad = params.clone();
        bad[0..4].copy_from_slice(b"X999");
        let mut s2 = session();
        assert_eq!(s2.set_multi_stream_params(&bad), Err(ZrtpError::InvalidParameter));
        let mut s3 = session();
        assert_eq!(s3.set_multi_stream_params(&params[..20]), Err(ZrtpError::InvalidParameter));
    }

    #[test]
    fn stop_refuses_further_events() {
        let mut app = CollectApp::default();
        let mut s = session();
        s.start(&mut app);
        s.stop(&mut app);
        app.out.clear();
        let ping = build_ping(VERSION_1_10, &[1; 8]);
        s.process_message(&mut app, &ping, 1);
        s.process_timeout(&mut app);
        assert!(app.out.is_empty());
    }
}
