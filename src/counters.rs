/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

/// Read-only statistics the application can poll for observability.
///
/// The layout of the exported array is append-only: new counters get new
/// trailing slots.
#[derive(Default, Clone)]
pub(crate) struct Counters {
    pub hello_sent: u32,
    pub hello_received: u32,
    pub commit_as_initiator: u32,
    pub commit_as_responder: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub hmac_failures: u32,
    pub aborts_no_peer_response: u32,
    pub aborts_auth_error: u32,
    pub aborts_dh_error: u32,
    pub aborts_protocol_error: u32,
    pub aborts_other: u32,
}

impl Counters {
    pub const COUNT: usize = 12;

    pub fn read(&self, out: &mut [u32]) -> usize {
        let values = [
            self.hello_sent,
            self.hello_received,
            self.commit_as_initiator,
            self.commit_as_responder,
            self.cache_hits,
            self.cache_misses,
            self.hmac_failures,
            self.aborts_no_peer_response,
            self.aborts_auth_error,
            self.aborts_dh_error,
            self.aborts_protocol_error,
            self.aborts_other,
        ];
        let n = values.len().min(out.len());
        out[..n].copy_from_slice(&values[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_is_bounded_by_output_slice() {
        let mut c = Counters::default();
        c.hello_sent = 3;
        c.cache_hits = 7;
        let mut out = [0u32; Counters::COUNT];
        assert_eq!(c.read(&mut out), Counters::COUNT);
        assert_eq!(out[0], 3);
        assert_eq!(out[4], 7);
        let mut short = [0u32; 2];
        assert_eq!(c.read(&mut short), 2);
    }
}
