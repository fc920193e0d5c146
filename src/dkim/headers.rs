/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::fmt::{Display, Formatter};

use crate::common::headers::wrap_signature;

use super::Signature;

impl Display for Signature {
    /// The header value only, in the fixed multi-line layout inserted into
    /// messages. The signature bytes fold at 64 characters.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "a={}; bh={};\r\n        c={}/{}; d={};\r\n        h={};\r\n        s={}; t={}; v={};\r\n        b={}",
            self.a,
            self.bh,
            self.ch,
            self.cb,
            self.d,
            self.h,
            self.s,
            self.t,
            self.v,
            wrap_signature(&self.b),
        )
    }
}
