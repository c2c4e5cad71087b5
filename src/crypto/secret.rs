/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Containers for ZRTP key material.
//!
//! Two shapes cover everything the protocol handles: `Secret<L>` for values
//! whose width is fixed by the protocol (H0, retained secrets, the MitM
//! key) and `SecretVec` for material whose width is only known after
//! algorithm negotiation (the DH result, s0 and the whole derived key
//! block). Both wipe themselves on drop so aborted handshakes do not leave
//! keys behind, and neither can be compared other than in constant time.

use zeroize::{Zeroize, Zeroizing};

/// Constant time byte slice equality.
///
/// Every comparison of secret IDs, truncated MACs, hvi values and hash
/// chain images goes through here; nothing secret-derived is ever compared
/// with `==` on raw slices.
#[inline]
pub fn secure_eq<A: AsRef<[u8]> + ?Sized, B: AsRef<[u8]> + ?Sized>(a: &A, b: &B) -> bool {
    let (a, b) = (a.as_ref(), b.as_ref());
    if a.len() == b.len() {
        let mut x = 0u8;
        for (aa, bb) in a.iter().zip(b.iter()) {
            x |= *aa ^ *bb;
        }
        x == 0
    } else {
        false
    }
}

/// A fixed-width secret, zeroized on drop.
///
/// This cannot stop a careless caller from copying the bytes out, but
/// keeping all protocol-internal key material in this type means the
/// normal lifecycle (including every abort path) ends with the memory
/// wiped rather than waiting for the allocator to reuse it.
#[derive(Clone)]
#[repr(transparent)]
pub struct Secret<const L: usize>(pub [u8; L]);

impl<const L: usize> Secret<L> {
    /// A new all-zero secret, ready to be filled in place.
    #[inline(always)]
    pub fn new() -> Self {
        Self([0_u8; L])
    }

    /// Copy a slice into a secret; panics if the length does not match.
    /// The source stays intact and remains the caller's responsibility.
    #[inline(always)]
    pub fn from_bytes(b: &[u8]) -> Self {
        Self(b.try_into().unwrap())
    }

    /// Move a slice into a secret and wipe the source. Panics if the
    /// length does not match.
    pub fn from_bytes_then_delete(b: &mut [u8]) -> Self {
        let ret = Self(b[..].try_into().unwrap());
        b.zeroize();
        ret
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8; L] {
        &self.0
    }

    /// Replace the contents with those of another secret of the same width.
    pub fn overwrite(&mut self, src: &Self) {
        self.0.copy_from_slice(&src.0);
    }

    pub fn eq_bytes(&self, other: &[u8]) -> bool {
        secure_eq(&self.0, other)
    }
}

impl<const L: usize> Drop for Secret<L> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<const L: usize> Default for Secret<L> {
    #[inline(always)]
    fn default() -> Self {
        Self([0_u8; L])
    }
}

impl<const L: usize> AsRef<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const L: usize> AsMut<[u8]> for Secret<L> {
    #[inline(always)]
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl<const L: usize> PartialEq for Secret<L> {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&self.0, &other.0)
    }
}
impl<const L: usize> Eq for Secret<L> {}

/// Container for secrets whose length is only known after algorithm
/// negotiation, e.g. `s0` and everything derived from it. Zeroed on drop.
#[derive(Clone, Default)]
pub struct SecretVec(Zeroizing<Vec<u8>>);

impl SecretVec {
    #[inline(always)]
    pub fn new() -> Self {
        Self(Zeroizing::new(Vec::new()))
    }

    pub fn from_slice(b: &[u8]) -> Self {
        Self(Zeroizing::new(b.to_vec()))
    }

    /// Take ownership of an existing buffer without copying it.
    pub fn from_vec(v: Vec<u8>) -> Self {
        Self(Zeroizing::new(v))
    }

    /// Copy a slice into a secret, then wipe the source.
    pub fn from_bytes_then_delete(b: &mut [u8]) -> Self {
        let ret = Self::from_slice(b);
        b.zeroize();
        ret
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Wipe the contents now instead of waiting for drop.
    pub fn purge(&mut self) {
        self.0.zeroize();
        self.0.clear();
    }
}

impl AsRef<[u8]> for SecretVec {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for SecretVec {
    fn eq(&self, other: &Self) -> bool {
        secure_eq(&*self.0, &*other.0)
    }
}
impl Eq for SecretVec {}

/// Secrets never appear in debug output.
impl std::fmt::Debug for SecretVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretVec({} bytes)", self.0.len())
    }
}

impl<const L: usize> std::fmt::Debug for Secret<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret({} bytes)", L)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_eq_basics() {
        assert!(secure_eq(b"abcd", b"abcd"));
        assert!(!secure_eq(b"abcd", b"abce"));
        assert!(!secure_eq(b"abcd", b"abc"));
    }

    #[test]
    fn from_bytes_then_delete_wipes_source() {
        let mut src = [7u8; 16];
        let s: Secret<16> = Secret::from_bytes_then_delete(&mut src);
        assert_eq!(src, [0u8; 16]);
        assert_eq!(s.as_bytes(), &[7u8; 16]);
    }

    #[test]
    fn secret_vec_purge() {
        let mut v = SecretVec::from_slice(&[1, 2, 3]);
        assert_eq!(v.len(), 3);
        v.purge();
        assert!(v.is_empty());
    }
}
