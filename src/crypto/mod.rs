/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
pub(crate) mod cipher;
pub(crate) mod dh;
pub(crate) mod hash;
pub mod secret;

// We re-export our RNG dependency so it is less of a headache for the
// implementor to use the same exact version of it.
pub use rand_core;

pub use secret::{secure_eq, Secret, SecretVec};
