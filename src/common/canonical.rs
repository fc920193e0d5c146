/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::fmt::Display;

use crate::{Error, Result};

use super::Writer;

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Canonicalization {
    #[default]
    Simple,
    Relaxed,
}

impl Canonicalization {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "simple" => Ok(Canonicalization::Simple),
            "relaxed" => Ok(Canonicalization::Relaxed),
            _ => Err(Error::UnsupportedCanonicalization),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Canonicalization::Simple => "simple",
            Canonicalization::Relaxed => "relaxed",
        }
    }
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits a `c=` tag value into (header, body) canonicalizations. An empty
/// value means simple/simple; a single token applies to the header and the
/// body falls back to simple.
pub fn parse_canonicalization_pair(value: &str) -> Result<(Canonicalization, Canonicalization)> {
    if value.is_empty() {
        return Ok((Canonicalization::Simple, Canonicalization::Simple));
    }
    match value.split_once('/') {
        None => Ok((Canonicalization::parse(value)?, Canonicalization::Simple)),
        Some((header, body)) => Ok((
            Canonicalization::parse(header)?,
            Canonicalization::parse(body)?,
        )),
    }
}

/// Canonicalizes one unfolded header line. The line keeps its trailing CRLF
/// under `simple`; under `relaxed` the output is always `name:value\r\n`.
pub fn canonicalize_header(line: &str, canonicalization: Canonicalization) -> String {
    match canonicalization {
        Canonicalization::Simple => line.to_string(),
        Canonicalization::Relaxed => relaxed_header(line),
    }
}

fn relaxed_header(line: &str) -> String {
    let Some((name, value)) = line.split_once(':') else {
        return format!("{}:\r\n", line.trim().to_ascii_lowercase());
    };

    let name = name.trim().to_ascii_lowercase();
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}:{}\r\n", name, value)
}

/// Converts bare LF line endings to CRLF across chunk boundaries.
#[derive(Debug, Default)]
struct CrlfFixer {
    cr: bool,
}

impl CrlfFixer {
    fn fix(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut fixed = Vec::with_capacity(chunk.len());
        for &ch in chunk {
            let prev_cr = self.cr;
            self.cr = false;
            match ch {
                b'\r' => self.cr = true,
                b'\n' if !prev_cr => fixed.push(b'\r'),
                _ => {}
            }
            fixed.push(ch);
        }
        fixed
    }
}

/// Streaming `simple` body canonicalization: bare LF becomes CRLF and the
/// trailing run of CRLFs collapses to a single CRLF on close. An empty body
/// canonicalizes to exactly one CRLF.
#[derive(Debug)]
pub struct SimpleBodyCanonicalizer<W: Writer> {
    inner: W,
    crlf_buf: Vec<u8>,
    fixer: CrlfFixer,
}

impl<W: Writer> SimpleBodyCanonicalizer<W> {
    pub fn new(inner: W) -> Self {
        SimpleBodyCanonicalizer {
            inner,
            crlf_buf: Vec::new(),
            fixer: CrlfFixer::default(),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        let mut buf = std::mem::take(&mut self.crlf_buf);
        buf.extend_from_slice(chunk);
        let buf = self.fixer.fix(&buf);

        let mut end = buf.len();
        // A trailing CR may complete a CRLF with the next chunk.
        if end > 0 && buf[end - 1] == b'\r' {
            end -= 1;
        }
        while end >= 2 && buf[end - 2] == b'\r' && buf[end - 1] == b'\n' {
            end -= 2;
        }

        self.crlf_buf = buf[end..].to_vec();
        if end > 0 {
            self.inner.write(&buf[..end]);
        }
    }

    pub fn close(mut self) -> W {
        if self.crlf_buf.last() == Some(&b'\r') {
            let pending = std::mem::take(&mut self.crlf_buf);
            self.inner.write(&pending);
        }
        self.inner.write(CRLF);
        self.inner
    }
}

/// Streaming `relaxed` body canonicalization: as `simple`, and WSP runs
/// within a line collapse to a single SP with trailing WSP removed. An empty
/// body produces no output at all.
#[derive(Debug)]
pub struct RelaxedBodyCanonicalizer<W: Writer> {
    inner: W,
    crlf_buf: Vec<u8>,
    wsp: bool,
    written: bool,
    fixer: CrlfFixer,
}

impl<W: Writer> RelaxedBodyCanonicalizer<W> {
    pub fn new(inner: W) -> Self {
        RelaxedBodyCanonicalizer {
            inner,
            crlf_buf: Vec::new(),
            wsp: false,
            written: false,
            fixer: CrlfFixer::default(),
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        let chunk = self.fixer.fix(chunk);
        let mut canonical = Vec::with_capacity(chunk.len());
        for &ch in chunk.iter() {
            match ch {
                b' ' | b'\t' => self.wsp = true,
                b'\r' | b'\n' => {
                    self.wsp = false;
                    self.crlf_buf.push(ch);
                }
                _ => {
                    if !self.crlf_buf.is_empty() {
                        canonical.append(&mut self.crlf_buf);
                    }
                    if self.wsp {
                        canonical.push(b' ');
                        self.wsp = false;
                    }
                    canonical.push(ch);
                }
            }
        }

        if !canonical.is_empty() {
            self.written = true;
            self.inner.write(&canonical);
        }
    }

    pub fn close(mut self) -> W {
        if self.written {
            self.inner.write(CRLF);
        }
        self.inner
    }
}

/// A body canonicalizer of either flavor, picked at run time.
#[derive(Debug)]
pub enum BodyCanonicalizer<W: Writer> {
    Simple(SimpleBodyCanonicalizer<W>),
    Relaxed(RelaxedBodyCanonicalizer<W>),
}

impl<W: Writer> BodyCanonicalizer<W> {
    pub fn new(canonicalization: Canonicalization, inner: W) -> Self {
        match canonicalization {
            Canonicalization::Simple => {
                BodyCanonicalizer::Simple(SimpleBodyCanonicalizer::new(inner))
            }
            Canonicalization::Relaxed => {
                BodyCanonicalizer::Relaxed(RelaxedBodyCanonicalizer::new(inner))
            }
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        match self {
            BodyCanonicalizer::Simple(canonicalizer) => canonicalizer.write(chunk),
            BodyCanonicalizer::Relaxed(canonicalizer) => canonicalizer.write(chunk),
        }
    }

    pub fn close(self) -> W {
        match self {
            BodyCanonicalizer::Simple(canonicalizer) => canonicalizer.close(),
            BodyCanonicalizer::Relaxed(canonicalizer) => canonicalizer.close(),
        }
    }
}
