/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::fmt::{Display, Formatter};

use crate::common::headers::wrap_signature;

use super::{AuthenticationResults, MessageSignature, Seal};

impl Display for Seal {
    /// The header value only, in the fixed layout used both on the wire and
    /// inside the Seal pre-image.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "i={}; a={}; t={}; cv={};\r\n        d={}; s={};\r\n        b={}",
            self.i,
            self.a,
            self.t,
            self.cv.map(|cv| cv.as_str()).unwrap_or(""),
            self.d,
            self.s,
            wrap_signature(&self.b),
        )
    }
}

impl Display for MessageSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "i={}; a={}; c={}/{}; d={}; s={};\r\n        h={};\r\n        bh={}; t={};\r\n        b={}",
            self.i,
            self.a,
            self.ch,
            self.cb,
            self.d,
            self.s,
            self.h,
            self.bh,
            self.t,
            wrap_signature(&self.b),
        )
    }
}

impl Display for AuthenticationResults {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "i={}; {};", self.i, self.authserv_id)?;
        for result in &self.results {
            write!(f, "\r\n        {};", result)?;
        }
        Ok(())
    }
}
