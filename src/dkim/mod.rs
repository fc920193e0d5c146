/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::fmt::Write;

use crate::common::canonical::Canonicalization;
use crate::common::crypto::Algorithm;
use crate::{VerifyResult, VerifyStatus};

pub mod headers;
pub mod parse;
pub mod sign;
pub mod verify;

/// A DKIM-Signature header, parsed or under construction. Parsed records
/// keep their raw bytes because verification reconstructs the signed
/// pre-image from them.
#[derive(Debug, Clone)]
pub struct Signature {
    pub v: u32,
    pub a: Algorithm,
    pub b: String,
    pub bh: String,
    pub ch: Canonicalization,
    pub cb: Canonicalization,
    pub d: String,
    pub h: String,
    pub i: String,
    pub l: u64,
    pub q: String,
    pub s: String,
    pub t: u64,
    pub x: u64,
    pub verify_result: Option<VerifyResult>,
    pub(crate) raw: String,
}

impl Default for Signature {
    fn default() -> Self {
        Signature {
            v: 0,
            a: Algorithm::RsaSha256,
            b: String::new(),
            bh: String::new(),
            ch: Canonicalization::Simple,
            cb: Canonicalization::Simple,
            d: String::new(),
            h: String::new(),
            i: String::new(),
            l: 0,
            q: String::new(),
            s: String::new(),
            t: 0,
            x: 0,
            verify_result: None,
            raw: String::new(),
        }
    }
}

impl Signature {
    /// The `dkim=` clause this signature contributes to an
    /// Authentication-Results value.
    pub fn result_string(&self) -> String {
        let result = match &self.verify_result {
            Some(result)
                if !matches!(result.status(), VerifyStatus::Neutral | VerifyStatus::None) =>
            {
                result
            }
            _ => return "dkim=none".to_string(),
        };

        let mut line = format!("dkim={} ({})", result.status(), result.message());
        if !self.d.is_empty() {
            write!(line, " header.d={}", self.d).ok();
        }
        if !self.s.is_empty() {
            write!(line, " header.s={}", self.s).ok();
        }
        if !self.i.is_empty() {
            write!(line, " header.i={}", self.i).ok();
        }
        line
    }
}
