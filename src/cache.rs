/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The ZID cache: long-lived identity and retained-secret state per peer.
//!
//! Storage is abstract; implementors persist fixed-layout record images
//! however they like. An in-memory backend is provided for applications
//! that accept losing key continuity across restarts, and doubles as the
//! test backend.

use std::collections::HashMap;

use rand_core::{CryptoRng, RngCore};

use crate::crypto::secret::Secret;
use crate::proto::{RS_SIZE, ZID_SIZE};

const FLAG_VALID: u8 = 0x01;
const FLAG_SAS_VERIFIED: u8 = 0x02;
const FLAG_RS1_VALID: u8 = 0x04;
const FLAG_RS2_VALID: u8 = 0x08;
const FLAG_MITM_KEY: u8 = 0x10;
const FLAG_OWN_ZID: u8 = 0x20;

/// Serialized size of one record image, see `ZidRecord::serialize`.
pub const RECORD_SIZE: usize = ZID_SIZE + 1 + 3 * (RS_SIZE + 8) + 2 * 8 + 8;

/// Longest peer name stored next to a record.
pub const MAX_PEER_NAME: usize = 200;

/// One cache record: a remote peer's ZID bound to its retained-secret
/// history and trust flags.
#[derive(Clone)]
pub struct ZidRecord {
    zid: [u8; ZID_SIZE],
    flags: u8,
    rs1: Secret<RS_SIZE>,
    rs1_last_use: i64,
    rs1_ttl: i64,
    rs2: Secret<RS_SIZE>,
    rs2_last_use: i64,
    rs2_ttl: i64,
    mitm_key: Secret<RS_SIZE>,
    mitm_last_use: i64,
    secure_since: i64,
}

impl ZidRecord {
    /// A fresh record for a peer never seen before. `secure_since` stays
    /// zero until the first successful handshake.
    pub fn new(zid: [u8; ZID_SIZE]) -> Self {
        Self {
            zid,
            flags: FLAG_VALID,
            rs1: Secret::new(),
            rs1_last_use: 0,
            rs1_ttl: -1,
            rs2: Secret::new(),
            rs2_last_use: 0,
            rs2_ttl: -1,
            mitm_key: Secret::new(),
            mitm_last_use: 0,
            secure_since: 0,
        }
    }

    pub fn zid(&self) -> &[u8; ZID_SIZE] {
        &self.zid
    }

    pub fn is_valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    pub fn is_own_zid(&self) -> bool {
        self.flags & FLAG_OWN_ZID != 0
    }

    pub(crate) fn mark_own_zid(&mut self) {
        self.flags |= FLAG_OWN_ZID;
    }

    pub fn is_sas_verified(&self) -> bool {
        self.flags & FLAG_SAS_VERIFIED != 0
    }

    pub fn set_sas_verified(&mut self, verified: bool) {
        if verified {
            self.flags |= FLAG_SAS_VERIFIED;
        } else {
            self.flags &= !FLAG_SAS_VERIFIED;
        }
    }

    fn expired(last_use: i64, ttl: i64, now: i64) -> bool {
        ttl >= 0 && last_use.saturating_add(ttl) < now
    }

    /// rs1 usable for matching: present and not past its TTL. An expired
    /// secret stays in the record but never matches.
    pub fn has_rs1(&self, now: i64) -> bool {
        self.flags & FLAG_RS1_VALID != 0 && !Self::expired(self.rs1_last_use, self.rs1_ttl, now)
    }

    pub fn has_rs2(&self, now: i64) -> bool {
        self.flags & FLAG_RS2_VALID != 0 && !Self::expired(self.rs2_last_use, self.rs2_ttl, now)
    }

    pub fn has_mitm_key(&self) -> bool {
        self.flags & FLAG_MITM_KEY != 0
    }

    pub fn rs1(&self) -> &Secret<RS_SIZE> {
        &self.rs1
    }

    pub fn rs2(&self) -> &Secret<RS_SIZE> {
        &self.rs2
    }

    pub fn mitm_key(&self) -> &Secret<RS_SIZE> {
        &self.mitm_key
    }

    pub fn secure_since(&self) -> i64 {
        self.secure_since
    }

    pub(crate) fn mark_secure(&mut self, now: i64) {
        if self.secure_since == 0 {
            self.secure_since = now;
        }
    }

    /// Install a freshly derived rs1. The previous rs1 becomes rs2, the
    /// previous rs2 is discarded.
    pub fn rotate_rs1(&mut self, new_rs1: &Secret<RS_SIZE>, now: i64, ttl: i64) {
        self.rs2.overwrite(&self.rs1);
        self.rs2_last_use = self.rs1_last_use;
        self.rs2_ttl = self.rs1_ttl;
        if self.flags & FLAG_RS1_VALID != 0 {
            self.flags |= FLAG_RS2_VALID;
        } else {
            self.flags &= !FLAG_RS2_VALID;
        }
        self.rs1.overwrite(new_rs1);
        self.rs1_last_use = now;
        self.rs1_ttl = ttl;
        self.flags |= FLAG_RS1_VALID;
    }

    /// Invalidate rs1 in place, used by tests and cache maintenance.
    pub fn corrupt_rs1(&mut self) {
        self.rs1 = Secret::new();
    }

    pub(crate) fn set_rs2_valid(&mut self) {
        self.flags |= FLAG_RS2_VALID;
    }

    pub(crate) fn set_mitm_key(&mut self, key: &Secret<RS_SIZE>, now: i64) {
        self.mitm_key.overwrite(key);
        self.mitm_last_use = now;
        self.flags |= FLAG_MITM_KEY;
    }

    pub(crate) fn touch(&mut self, now: i64) {
        self.rs1_last_use = now;
    }

    /// Fixed-layout record image: zid, flags, rs1/lastUse/ttl, rs2/lastUse/
    /// ttl, mitm/lastUse, secureSince. All integers big-endian.
    pub fn serialize(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        let mut at = 0;
        let mut put = |src: &[u8], at: &mut usize| {
            out[*at..*at + src.len()].copy_from_slice(src);
            *at += src.len();
        };
        put(&self.zid, &mut at);
        put(&[self.flags], &mut at);
        put(self.rs1.as_bytes(), &mut at);
        put(&self.rs1_last_use.to_be_bytes(), &mut at);
        put(&self.rs1_ttl.to_be_bytes(), &mut at);
        put(self.rs2.as_bytes(), &mut at);
        put(&self.rs2_last_use.to_be_bytes(), &mut at);
        put(&self.rs2_ttl.to_be_bytes(), &mut at);
        put(self.mitm_key.as_bytes(), &mut at);
        put(&self.mitm_last_use.to_be_bytes(), &mut at);
        put(&self.secure_since.to_be_bytes(), &mut at);
        debug_assert_eq!(at, RECORD_SIZE);
        out
    }

    pub fn deserialize(image: &[u8; RECORD_SIZE]) -> Self {
        let mut at = 0;
        let take = |n: usize, at: &mut usize| {
            let s = &image[*at..*at + n];
            *at += n;
            s
        };
        let zid: [u8; ZID_SIZE] = take(ZID_SIZE, &mut at).try_into().unwrap();
        let flags = take(1, &mut at)[0];
        let rs1 = Secret::from_bytes(take(RS_SIZE, &mut at));
        let rs1_last_use = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        let rs1_ttl = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        let rs2 = Secret::from_bytes(take(RS_SIZE, &mut at));
        let rs2_last_use = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        let rs2_ttl = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        let mitm_key = Secret::from_bytes(take(RS_SIZE, &mut at));
        let mitm_last_use = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        let secure_since = i64::from_be_bytes(take(8, &mut at).try_into().unwrap());
        Self {
            zid,
            flags,
            rs1,
            rs1_last_use,
            rs1_ttl,
            rs2,
            rs2_last_use,
            rs2_ttl,
            mitm_key,
            mitm_last_use,
            secure_since,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CacheError {
    /// The storage backend failed; the engine continues without retained
    /// secrets and reports a cache warning.
    Backend,
}

/// Abstract record CRUD. A record write must be transactional: either the
/// whole updated image lands or nothing does.
pub trait ZidCacheStorage: Send {
    fn read_local_zid(&mut self) -> Result<Option<[u8; ZID_SIZE]>, CacheError>;
    fn write_local_zid(&mut self, zid: &[u8; ZID_SIZE]) -> Result<(), CacheError>;

    fn read_remote_record(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<ZidRecord>, CacheError>;
    fn insert_remote_record(&mut self, record: &ZidRecord) -> Result<(), CacheError>;
    fn update_remote_record(&mut self, record: &ZidRecord) -> Result<(), CacheError>;

    fn read_name(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<String>, CacheError>;
    fn write_name(&mut self, peer_zid: &[u8; ZID_SIZE], name: &str) -> Result<(), CacheError>;

    /// Visit every stored remote record.
    fn for_each_record(&mut self, visitor: &mut dyn FnMut(&ZidRecord)) -> Result<(), CacheError>;

    /// Drop records whose secrets are all expired at `now`.
    fn clean(&mut self, now: i64) -> Result<(), CacheError>;

    fn close(&mut self);
}

/// Volatile storage backend.
#[derive(Default)]
pub struct MemoryZidStorage {
    local_zid: Option<[u8; ZID_SIZE]>,
    records: HashMap<[u8; ZID_SIZE], ZidRecord>,
    names: HashMap<[u8; ZID_SIZE], String>,
}

impl MemoryZidStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ZidCacheStorage for MemoryZidStorage {
    fn read_local_zid(&mut self) -> Result<Option<[u8; ZID_SIZE]>, CacheError> {
        Ok(self.local_zid)
    }

    fn write_local_zid(&mut self, zid: &[u8; ZID_SIZE]) -> Result<(), CacheError> {
        self.local_zid = Some(*zid);
        Ok(())
    }

    fn read_remote_record(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<ZidRecord>, CacheError> {
        Ok(self.records.get(peer_zid).cloned())
    }

    fn insert_remote_record(&mut self, record: &ZidRecord) -> Result<(), CacheError> {
        self.records.insert(record.zid, record.clone());
        Ok(())
    }

    fn update_remote_record(&mut self, record: &ZidRecord) -> Result<(), CacheError> {
        self.records.insert(record.zid, record.clone());
        Ok(())
    }

    fn read_name(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<String>, CacheError> {
        Ok(self.names.get(peer_zid).cloned())
    }

    fn write_name(&mut self, peer_zid: &[u8; ZID_SIZE], name: &str) -> Result<(), CacheError> {
        self.names.insert(*peer_zid, name.to_string());
        Ok(())
    }

    fn for_each_record(&mut self, visitor: &mut dyn FnMut(&ZidRecord)) -> Result<(), CacheError> {
        for r in self.records.values() {
            visitor(r);
        }
        Ok(())
    }

    fn clean(&mut self, now: i64) -> Result<(), CacheError> {
        self.records.retain(|_, r| r.has_rs1(now) || r.has_rs2(now) || r.has_mitm_key());
        Ok(())
    }

    fn close(&mut self) {}
}

/// The cache facade sessions talk to. May be shared across streams to the
/// same local ZID; the caller serializes access.
pub struct ZidCache {
    storage: Box<dyn ZidCacheStorage>,
    local_zid: [u8; ZID_SIZE],
}

impl ZidCache {
    /// Open the cache. If the backend holds no local ZID yet, generate 96
    /// random bits and persist them as this endpoint's identity.
    pub fn open<R: RngCore + CryptoRng>(
        mut storage: Box<dyn ZidCacheStorage>,
        rng: &mut R,
    ) -> Result<Self, CacheError> {
        let local_zid = match storage.read_local_zid()? {
            Some(zid) => zid,
            None => {
                let mut zid = [0u8; ZID_SIZE];
                rng.fill_bytes(&mut zid);
                storage.write_local_zid(&zid)?;
                zid
            }
        };
        Ok(Self { storage, local_zid })
    }

    pub fn own_zid(&self) -> &[u8; ZID_SIZE] {
        &self.local_zid
    }

    /// Fetch the record for a peer, creating and persisting a fresh one on
    /// first contact. A peer claiming our own ZID gets nothing.
    pub fn get_record(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<ZidRecord>, CacheError> {
        if peer_zid == &self.local_zid {
            return Ok(None);
        }
        if let Some(record) = self.storage.read_remote_record(peer_zid)? {
            return Ok(Some(record));
        }
        let record = ZidRecord::new(*peer_zid);
        self.storage.insert_remote_record(&record)?;
        Ok(Some(record))
    }

    pub fn save_record(&mut self, record: &ZidRecord) -> Result<(), CacheError> {
        self.storage.update_remote_record(record)
    }

    pub fn get_peer_name(&mut self, peer_zid: &[u8; ZID_SIZE]) -> Result<Option<String>, CacheError> {
        self.storage.read_name(peer_zid)
    }

    pub fn put_peer_name(&mut self, peer_zid: &[u8; ZID_SIZE], name: &str) -> Result<(), CacheError> {
        let clipped = if name.len() > MAX_PEER_NAME {
            let mut end = MAX_PEER_NAME;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            &name[..end]
        } else {
            name
        };
        self.storage.write_name(peer_zid, clipped)
    }

    pub fn iterate_records(&mut self, visitor: &mut dyn FnMut(&ZidRecord)) -> Result<(), CacheError> {
        self.storage.for_each_record(visitor)
    }

    pub fn cleanup(&mut self, now: i64) -> Result<(), CacheError> {
        self.storage.clean(now)
    }

    pub fn close(&mut self) {
        self.storage.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn open_cache() -> ZidCache {
        ZidCache::open(Box::new(MemoryZidStorage::new()), &mut OsRng).unwrap()
    }

    #[test]
    fn local_zid_is_generated_and_kept() {
        let first = {
            let cache = ZidCache::open(Box::new(MemoryZidStorage::new()), &mut OsRng).unwrap();
            *cache.own_zid()
        };
        assert_ne!(first, [0u8; ZID_SIZE]);
        // A backend that already holds a ZID keeps it.
        let mut storage = MemoryZidStorage::new();
        storage.write_local_zid(&first).unwrap();
        let cache = ZidCache::open(Box::new(storage), &mut OsRng).unwrap();
        assert_eq!(cache.own_zid(), &first);
    }

    #[test]
    fn own_zid_lookup_is_guarded() {
        let mut cache = open_cache();
        let own = *cache.own_zid();
        assert!(cache.get_record(&own).unwrap().is_none());
    }

    #[test]
    fn fresh_record_has_no_secrets_and_zero_secure_since() {
        let mut cache = open_cache();
        let rec = cache.get_record(&[1; ZID_SIZE]).unwrap().unwrap();
        assert!(rec.is_valid());
        assert!(!rec.has_rs1(1000));
        assert!(!rec.has_rs2(1000));
        assert!(!rec.is_sas_verified());
        assert_eq!(rec.secure_since(), 0);
    }

    #[test]
    fn rs1_rotation() {
        let mut rec = ZidRecord::new([2; ZID_SIZE]);
        let first = Secret::from_bytes(&[0xaa; RS_SIZE]);
        let second = Secret::from_bytes(&[0xbb; RS_SIZE]);

        rec.rotate_rs1(&first, 100, -1);
        assert!(rec.has_rs1(100));
        assert!(!rec.has_rs2(100));
        assert!(rec.rs1().eq_bytes(&[0xaa; RS_SIZE]));

        rec.rotate_rs1(&second, 200, -1);
        assert!(rec.rs1().eq_bytes(&[0xbb; RS_SIZE]));
        assert!(rec.has_rs2(200));
        assert!(rec.rs2().eq_bytes(&[0xaa; RS_SIZE]));
    }

    #[test]
    fn ttl_expiry_disables_matching() {
        let mut rec = ZidRecord::new([3; ZID_SIZE]);
        rec.rotate_rs1(&Secret::from_bytes(&[1; RS_SIZE]), 1000, 60);
        assert!(rec.has_rs1(1030));
        assert!(!rec.has_rs1(1100));
        // Negative TTL means forever.
        rec.rotate_rs1(&Secret::from_bytes(&[2; RS_SIZE]), 1000, -1);
        assert!(rec.has_rs1(i64::MAX));
    }

    #[test]
    fn record_image_round_trip() {
        let mut rec = ZidRecord::new([4; ZID_SIZE]);
        rec.rotate_rs1(&Secret::from_bytes(&[9; RS_SIZE]), 123, 456);
        rec.set_sas_verified(true);
        rec.mark_secure(789);
        let image = rec.serialize();
        let back = ZidRecord::deserialize(&image);
        assert_eq!(back.zid(), rec.zid());
        assert!(back.is_sas_verified());
        assert!(back.has_rs1(200));
        assert!(back.rs1().eq_bytes(&[9; RS_SIZE]));
        assert_eq!(back.secure_since(), 789);
    }

    #[test]
    fn peer_names_are_bounded() {
        let mut cache = open_cache();
        let long = "x".repeat(300);
        cache.put_peer_name(&[5; ZID_SIZE], &long).unwrap();
        assert_eq!(cache.get_peer_name(&[5; ZID_SIZE]).unwrap().unwrap().len(), MAX_PEER_NAME);
    }
}
