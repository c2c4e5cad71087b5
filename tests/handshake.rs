/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! End-to-end handshakes between two engine instances wired back to back
//! through in-memory queues. The harness is fully deterministic: messages
//! are delivered losslessly and timers fire only when a test pumps them.

use std::sync::{Arc, Mutex};

use zrtp::cache::{MemoryZidStorage, ZidCache};
use zrtp::config::ZrtpConfig;
use zrtp::crypto::rand_core::OsRng;
use zrtp::{
    EnableSecurity, ReportCode, Role, Severity, SrtpSecrets, State, WarningCode, WireError, ZrtpCallback,
    ZrtpSession, SECRET_RS1,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct OwnedSecrets {
    key_i: Vec<u8>,
    salt_i: Vec<u8>,
    key_r: Vec<u8>,
    salt_r: Vec<u8>,
}

#[derive(Default)]
struct TestApp {
    queue: Vec<Vec<u8>>,
    sent_types: Vec<String>,
    timer: Option<i32>,
    timer_history: Vec<i32>,
    warnings: Vec<WarningCode>,
    failed: Option<(Severity, ReportCode)>,
    not_supported: bool,
    secrets: Option<OwnedSecrets>,
    role: Option<Role>,
    sas: Option<(String, bool)>,
}

impl ZrtpCallback for TestApp {
    fn send_data(&mut self, data: &[u8]) -> bool {
        self.sent_types.push(String::from_utf8_lossy(&data[4..12]).to_string());
        self.queue.push(data.to_vec());
        true
    }

    fn activate_timer(&mut self, ms: i32) -> bool {
        self.timer = Some(ms);
        self.timer_history.push(ms);
        true
    }

    fn cancel_timer(&mut self) -> bool {
        self.timer = None;
        true
    }

    fn send_info(&mut self, _severity: Severity, code: ReportCode) {
        if let ReportCode::Warning(w) = code {
            self.warnings.push(w);
        }
    }

    fn negotiation_failed(&mut self, severity: Severity, code: ReportCode) {
        self.failed = Some((severity, code));
    }

    fn not_supported_by_other(&mut self) {
        self.not_supported = true;
    }

    fn srtp_secrets_ready(&mut self, _part: EnableSecurity, secrets: &SrtpSecrets<'_>) -> bool {
        self.secrets = Some(OwnedSecrets {
            key_i: secrets.key_initiator.to_vec(),
            salt_i: secrets.salt_initiator.to_vec(),
            key_r: secrets.key_responder.to_vec(),
            salt_r: secrets.salt_responder.to_vec(),
        });
        self.role = Some(secrets.role);
        true
    }

    fn srtp_secrets_off(&mut self, _part: EnableSecurity) {}

    fn srtp_secrets_on(&mut self, _cipher_info: &str, sas: &str, verified: bool) {
        self.sas = Some((sas.to_string(), verified));
    }
}

fn open_cache() -> Arc<Mutex<ZidCache>> {
    Arc::new(Mutex::new(
        ZidCache::open(Box::new(MemoryZidStorage::new()), &mut OsRng).unwrap(),
    ))
}

fn deliver(src: &mut TestApp, dst: &mut ZrtpSession, dst_app: &mut TestApp) -> usize {
    let msgs: Vec<_> = src.queue.drain(..).collect();
    let n = msgs.len();
    for msg in msgs {
        dst.process_message(dst_app, &msg, 0x1111);
    }
    n
}

/// Run both sides until the wire goes quiet.
fn run(a: &mut ZrtpSession, app_a: &mut TestApp, b: &mut ZrtpSession, app_b: &mut TestApp) {
    a.start(app_a);
    b.start(app_b);
    for _ in 0..64 {
        let moved = deliver(app_a, b, app_b) + deliver(app_b, a, app_a);
        if moved == 0 {
            break;
        }
    }
}

fn stored_rs1(cache: &Arc<Mutex<ZidCache>>, peer_zid: &[u8; 12]) -> Vec<u8> {
    let mut cache = cache.lock().unwrap();
    cache.get_record(peer_zid).unwrap().unwrap().rs1().as_bytes().to_vec()
}

fn stored_rs2(cache: &Arc<Mutex<ZidCache>>, peer_zid: &[u8; 12]) -> Vec<u8> {
    let mut cache = cache.lock().unwrap();
    cache.get_record(peer_zid).unwrap().unwrap().rs2().as_bytes().to_vec()
}

struct Pair {
    a: ZrtpSession,
    b: ZrtpSession,
    app_a: TestApp,
    app_b: TestApp,
}

fn new_pair(cache_a: &Arc<Mutex<ZidCache>>, cache_b: &Arc<Mutex<ZidCache>>) -> Pair {
    Pair {
        a: ZrtpSession::new("test endpoint A", ZrtpConfig::new(), Some(cache_a.clone())),
        b: ZrtpSession::new("test endpoint B", ZrtpConfig::new(), Some(cache_b.clone())),
        app_a: TestApp::default(),
        app_b: TestApp::default(),
    }
}

impl Pair {
    fn run(&mut self) {
        run(&mut self.a, &mut self.app_a, &mut self.b, &mut self.app_b);
    }

    fn assert_secure(&self) {
        assert_eq!(self.a.state(), State::SecureState);
        assert_eq!(self.b.state(), State::SecureState);
    }
}

#[test]
fn fresh_peers_dh_handshake() {
    let cache_a = open_cache();
    let cache_b = open_cache();
    let mut p = new_pair(&cache_a, &cache_b);
    p.run();
    p.assert_secure();

    // Roles are complementary and both sides derived identical SRTP
    // material.
    let (ra, rb) = (p.app_a.role.unwrap(), p.app_b.role.unwrap());
    assert!(matches!(
        (ra, rb),
        (Role::Initiator, Role::Responder) | (Role::Responder, Role::Initiator)
    ));
    assert_eq!(p.app_a.secrets, p.app_b.secrets);
    assert!(!p.app_a.secrets.as_ref().unwrap().key_i.is_empty());
    assert_eq!(p.app_a.secrets.as_ref().unwrap().salt_i.len(), 14);

    // Base-32 SAS: four characters, equal on both sides, unverified.
    let (sas_a, verified_a) = p.app_a.sas.clone().unwrap();
    let (sas_b, verified_b) = p.app_b.sas.clone().unwrap();
    assert_eq!(sas_a, sas_b);
    assert_eq!(sas_a.len(), 4);
    assert!(!verified_a && !verified_b);
    assert!(!p.a.is_sas_verified() && !p.b.is_sas_verified());

    // Negotiated suite is the mandatory one.
    let info = p.a.detail_info();
    assert_eq!(info.hash, "S256");
    assert_eq!(info.cipher, "AES1");
    assert_eq!(info.pub_key, "DH3k");
    assert_eq!(info.sas_type, "B32 ");

    // Both caches hold the same fresh rs1 and a secure-since timestamp.
    assert!(p.a.secure_since() > 0);
    assert!(p.b.secure_since() > 0);
    let rs1_at_a = stored_rs1(&cache_a, p.b.own_zid());
    let rs1_at_b = stored_rs1(&cache_b, p.a.own_zid());
    assert_eq!(rs1_at_a, rs1_at_b);
    assert_ne!(rs1_at_a, vec![0u8; 32]);
}

#[test]
fn retained_secret_continuity() {
    let cache_a = open_cache();
    let cache_b = open_cache();

    let mut first = new_pair(&cache_a, &cache_b);
    first.run();
    first.assert_secure();
    let first_secrets = first.app_a.secrets.clone().unwrap();
    let zid_a = *first.a.own_zid();
    let zid_b = *first.b.own_zid();
    let old_rs1 = stored_rs1(&cache_a, &zid_b);

    let mut second = new_pair(&cache_a, &cache_b);
    second.run();
    second.assert_secure();

    // The cached rs1 matched on both sides.
    assert_ne!(second.a.detail_info().secrets_matched & SECRET_RS1, 0);
    assert_ne!(second.b.detail_info().secrets_matched & SECRET_RS1, 0);
    assert!(second.app_a.warnings.is_empty());
    let mut counters = [0u32; 16];
    second.a.read_counters(&mut counters);
    assert_eq!(counters[4], 1, "one cache hit expected");

    // Fresh s0: the SRTP keys of run two differ from run one.
    assert_ne!(second.app_a.secrets.clone().unwrap(), first_secrets);

    // rs1 rotated: the old rs1 is now rs2, a new rs1 took its place.
    let new_rs1 = stored_rs1(&cache_a, &zid_b);
    assert_ne!(new_rs1, old_rs1);
    assert_eq!(stored_rs2(&cache_a, &zid_b), old_rs1);
    assert_eq!(new_rs1, stored_rs1(&cache_b, &zid_a));
}

#[test]
fn finite_cache_expiry_negotiates_against_forever() {
    let cache_a = open_cache();
    let cache_b = open_cache();

    // A advertises a one hour cache expiry, B is configured for forever.
    // Both sides must store the new rs1 with the finite TTL, not treat it
    // as immediately expired.
    let mut config_a = ZrtpConfig::new();
    config_a.set_retained_secret_ttl(3600);
    let mut first = Pair {
        a: ZrtpSession::new("finite ttl endpoint", config_a.clone(), Some(cache_a.clone())),
        b: ZrtpSession::new("forever endpoint", ZrtpConfig::new(), Some(cache_b.clone())),
        app_a: TestApp::default(),
        app_b: TestApp::default(),
    };
    first.run();
    first.assert_secure();

    let mut second = Pair {
        a: ZrtpSession::new("finite ttl endpoint", config_a, Some(cache_a.clone())),
        b: ZrtpSession::new("forever endpoint", ZrtpConfig::new(), Some(cache_b.clone())),
        app_a: TestApp::default(),
        app_b: TestApp::default(),
    };
    second.run();
    second.assert_secure();

    // The retained secret from run one was still alive on both sides.
    assert_ne!(second.a.detail_info().secrets_matched & SECRET_RS1, 0);
    assert_ne!(second.b.detail_info().secrets_matched & SECRET_RS1, 0);
    assert!(!second.app_a.warnings.contains(&WarningCode::NoExpectedRsMatch));
    assert!(!second.app_b.warnings.contains(&WarningCode::NoExpectedRsMatch));
}

#[test]
fn cache_mismatch_defers_rs1_until_verified() {
    let cache_a = open_cache();
    let cache_b = open_cache();

    let mut first = new_pair(&cache_a, &cache_b);
    first.run();
    first.assert_secure();
    let zid_a = *first.a.own_zid();
    let zid_b = *first.b.own_zid();

    // Corrupt B's copy of the retained secret.
    {
        let mut cache = cache_b.lock().unwrap();
        let mut record = cache.get_record(&zid_a).unwrap().unwrap();
        record.corrupt_rs1();
        cache.save_record(&record).unwrap();
    }
    let rs1_at_a_before = stored_rs1(&cache_a, &zid_b);
    let rs1_at_b_before = stored_rs1(&cache_b, &zid_a);

    let mut second = new_pair(&cache_a, &cache_b);
    second.run();
    second.assert_secure();

    // Both sides report the mismatch and neither persisted a new rs1.
    assert!(second.app_a.warnings.contains(&WarningCode::NoExpectedRsMatch));
    assert!(second.app_b.warnings.contains(&WarningCode::NoExpectedRsMatch));
    assert_eq!(stored_rs1(&cache_a, &zid_b), rs1_at_a_before);
    assert_eq!(stored_rs1(&cache_b, &zid_a), rs1_at_b_before);

    // The user confirms the SAS; only then the new rs1 lands in storage,
    // identically on both sides.
    second.a.sas_verified();
    second.b.sas_verified();
    let rs1_at_a = stored_rs1(&cache_a, &zid_b);
    let rs1_at_b = stored_rs1(&cache_b, &zid_a);
    assert_eq!(rs1_at_a, rs1_at_b);
    assert_ne!(rs1_at_a, rs1_at_a_before);
    assert!(second.a.is_sas_verified());
}

#[test]
fn commit_contention_resolves_to_one_initiator() {
    let cache_a = open_cache();
    let cache_b = open_cache();
    let mut p = new_pair(&cache_a, &cache_b);
    // Simultaneous start makes both sides send a Commit; the larger hvi
    // stays Initiator.
    p.run();
    p.assert_secure();

    let commits_a = p.app_a.sent_types.iter().filter(|t| t.as_str() == "Commit  ").count();
    let commits_b = p.app_b.sent_types.iter().filter(|t| t.as_str() == "Commit  ").count();
    assert!(commits_a >= 1 && commits_b >= 1, "both sides entered contention");

    let (ra, rb) = (p.app_a.role.unwrap(), p.app_b.role.unwrap());
    assert_ne!(ra, rb);

    // The loser really walked the Responder path: it sent the DHPart1.
    let (loser_app, winner_app) = if ra == Role::Responder {
        (&p.app_a, &p.app_b)
    } else {
        (&p.app_b, &p.app_a)
    };
    assert!(loser_app.sent_types.iter().any(|t| t == "DHPart1 "));
    assert!(!winner_app.sent_types.iter().any(|t| t == "DHPart1 "));
    assert_eq!(p.app_a.secrets, p.app_b.secrets);
}

/// RFC 3526 3072 bit prime, used to construct the degenerate p-1 value.
const MODP_3072_HEX: &str = "\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

#[test]
fn degenerate_dh_public_value_aborts_with_dh_error() {
    let cache_a = open_cache();
    let cache_b = open_cache();
    let mut p = new_pair(&cache_a, &cache_b);
    p.a.start(&mut p.app_a);
    p.b.start(&mut p.app_b);

    let mut p_minus_1 = hex::decode(MODP_3072_HEX).unwrap();
    *p_minus_1.last_mut().unwrap() = 0xFE;

    // Pump manually and replace the pv of every DHPart1 in flight with
    // p-1. The receiving Initiator must reject it before any key is
    // derived. pv starts after the header, H1 and the four secret IDs.
    let poison = |msg: &mut Vec<u8>| {
        if &msg[4..12] == b"DHPart1 " {
            msg[76..76 + 384].copy_from_slice(&p_minus_1);
        }
    };
    for _ in 0..64 {
        let msgs: Vec<_> = p.app_a.queue.drain(..).collect();
        let mut moved = msgs.len();
        for mut msg in msgs {
            poison(&mut msg);
            p.b.process_message(&mut p.app_b, &msg, 1);
        }
        let msgs: Vec<_> = p.app_b.queue.drain(..).collect();
        moved += msgs.len();
        for mut msg in msgs {
            poison(&mut msg);
            p.a.process_message(&mut p.app_a, &msg, 1);
        }
        if moved == 0 {
            break;
        }
    }

    // One side was the Initiator and saw the bad value; it failed with the
    // DH error code and told the peer, which failed in turn.
    let dh_error = |app: &TestApp| {
        matches!(
            app.failed,
            Some((Severity::ZrtpError, ReportCode::Wire { known: Some(WireError::DhBadPublicValue), .. }))
        )
    };
    let (victim, peer) = if dh_error(&p.app_a) { (&p.app_a, &p.app_b) } else { (&p.app_b, &p.app_a) };
    assert!(dh_error(victim));
    assert!(victim.sent_types.iter().any(|t| t == "Error   "));
    assert!(peer.failed.is_some());
    assert_eq!(p.a.state(), State::Fail);
    assert_eq!(p.b.state(), State::Fail);
}

#[test]
fn no_peer_response_exhausts_t1() {
    let cache_a = open_cache();
    let mut a = ZrtpSession::new("lonely endpoint", ZrtpConfig::new(), Some(cache_a));
    let mut app = TestApp::default();
    a.start(&mut app);
    assert_eq!(app.timer, Some(50));

    let mut fired = 0;
    while app.timer.take().is_some() && fired < 100 {
        a.process_timeout(&mut app);
        fired += 1;
    }

    // Initial Hello plus 21 resends (the counter is checked after each
    // resend), then the engine gives up.
    let hellos = app.sent_types.iter().filter(|t| t.as_str() == "Hello   ").count();
    assert_eq!(hellos, 22);
    assert!(app.not_supported);
    assert_eq!(a.state(), State::Fail);
    assert!(app.timer.is_none());

    // Exponential backoff capped at 200 ms.
    assert_eq!(&app.timer_history[..4], &[50, 100, 200, 200]);
    assert!(app.timer_history.iter().all(|ms| *ms <= 200));

    // Nothing further goes out once the session failed.
    let sends_before = app.sent_types.len();
    a.process_timeout(&mut app);
    assert_eq!(app.sent_types.len(), sends_before);
}

#[test]
fn multi_stream_skips_dh_exchange() {
    let cache_a = open_cache();
    let cache_b = open_cache();
    let mut master = new_pair(&cache_a, &cache_b);
    master.run();
    master.assert_secure();

    let params_a = master.a.multi_stream_params().unwrap();
    let params_b = master.b.multi_stream_params().unwrap();

    let mut sub = new_pair(&cache_a, &cache_b);
    sub.a.set_multi_stream_params(&params_a).unwrap();
    sub.b.set_multi_stream_params(&params_b).unwrap();
    sub.run();
    sub.assert_secure();

    for app in [&sub.app_a, &sub.app_b] {
        assert!(!app.sent_types.iter().any(|t| t == "DHPart1 " || t == "DHPart2 "));
    }
    assert_eq!(sub.app_a.secrets, sub.app_b.secrets);
    // Dependent streams get fresh SRTP keys from the same master key.
    assert_ne!(sub.app_a.secrets, master.app_a.secrets);
}

#[test]
fn paranoid_mode_never_reports_verified() {
    let cache_a = open_cache();
    let cache_b = open_cache();

    let mut config_a = ZrtpConfig::new();
    config_a.set_paranoid_mode(true);
    let mut p = Pair {
        a: ZrtpSession::new("paranoid endpoint", config_a, Some(cache_a.clone())),
        b: ZrtpSession::new("normal endpoint", ZrtpConfig::new(), Some(cache_b.clone())),
        app_a: TestApp::default(),
        app_b: TestApp::default(),
    };
    p.run();
    p.assert_secure();

    assert_eq!(p.app_a.sas.clone().unwrap().1, false);

    // The verify API is a no-op; the persisted flag never becomes true.
    p.a.sas_verified();
    assert!(!p.a.is_sas_verified());
    let zid_b = *p.b.own_zid();
    let mut cache = cache_a.lock().unwrap();
    assert!(!cache.get_record(&zid_b).unwrap().unwrap().is_sas_verified());
    drop(cache);

    // Key continuity still evolved normally on both sides.
    let zid_a = *p.a.own_zid();
    assert_eq!(stored_rs1(&cache_a, &zid_b), stored_rs1(&cache_b, &zid_a));
}

#[test]
fn second_run_after_verification_keeps_flag() {
    let cache_a = open_cache();
    let cache_b = open_cache();

    let mut first = new_pair(&cache_a, &cache_b);
    first.run();
    first.assert_secure();
    first.a.sas_verified();
    first.b.sas_verified();

    let mut second = new_pair(&cache_a, &cache_b);
    second.run();
    second.assert_secure();
    assert!(second.a.is_sas_verified());
    assert_eq!(second.app_a.sas.clone().unwrap().1, true);
}
