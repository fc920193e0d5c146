/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs LLC <hello@stalw.art>
 *
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

use std::collections::HashMap;
use std::io::BufRead;

use mail_builder::encoders::base64::base64_encode;

use crate::{Error, Result};

use super::canonical::{canonicalize_header, Canonicalization};
use super::crypto::{HashAlgorithm, PrivateKey};

const CRLF: &str = "\r\n";

/// Reads the header section of a message, reassembling folded lines. Each
/// returned line is a complete unfolded header terminated by CRLF, with the
/// original bytes of every continuation preserved. Fails if the stream ends
/// before the blank line.
pub fn read_header(reader: &mut impl BufRead) -> Result<Vec<String>> {
    let mut headers: Vec<String> = Vec::new();

    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || line.last() != Some(&b'\n') {
            return Err(Error::ParseError(
                "message ended before end of headers".to_string(),
            ));
        }
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let line = String::from_utf8_lossy(&line).into_owned();

        if line.is_empty() {
            return Ok(headers);
        } else if !headers.is_empty() && (line.starts_with(' ') || line.starts_with('\t')) {
            let previous = headers.last_mut().unwrap();
            previous.push_str(&line);
            previous.push_str(CRLF);
        } else {
            headers.push(line + CRLF);
        }
    }
}

/// Splits a header line at the first colon; both sides are trimmed. A line
/// without a colon yields the whole line as the name.
pub fn parse_header_field(header: &str) -> (&str, &str) {
    match header.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (header.trim(), ""),
    }
}

/// Parses a `tag=value; tag=value` header value into a map. Tags and values
/// are trimmed; empty fields are skipped.
pub fn parse_header_params(value: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();
    for field in value.split(';') {
        match field.split_once('=') {
            Some((tag, value)) => {
                params.insert(tag.trim().to_string(), value.trim().to_string());
            }
            None => {
                if !field.trim().is_empty() {
                    return Err(Error::ParseError("malformed tag list".to_string()));
                }
            }
        }
    }
    Ok(params)
}

/// Removes every whitespace character, folding included.
pub fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|ch| !ch.is_whitespace()).collect()
}

/// Folds base64 signature bytes into 64-character lines joined by CRLF and
/// nine spaces of continuation indent.
pub(crate) fn wrap_signature(signature: &str) -> String {
    signature
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\r\n         ")
}

/// Replaces the value of the `b=` tag with the empty string while leaving
/// every other byte untouched, line folds included. Applying it twice is the
/// same as applying it once.
pub fn delete_signature(header: &str) -> String {
    header
        .split(';')
        .map(|field| match field.split_once('=') {
            Some((tag, _)) if tag.trim() == "b" => format!("{}=", tag),
            _ => field.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn header_name_is(header: &str, name: &str) -> bool {
    match header.split_once(':') {
        Some((field, _)) => field.trim().eq_ignore_ascii_case(name),
        None => false,
    }
}

fn unique_lowercase(keys: &[impl AsRef<str>]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for key in keys {
        let key = key.as_ref().to_ascii_lowercase();
        if !unique.contains(&key) {
            unique.push(key);
        }
    }
    unique
}

/// DKIM selection: for each listed name, every occurrence of that header in
/// last-first order. Duplicated headers are all covered so a later injection
/// invalidates the signature.
pub fn extract_headers_dkim(headers: &[String], keys: &[impl AsRef<str>]) -> Vec<String> {
    let mut extracted = Vec::new();
    for key in unique_lowercase(keys) {
        for header in headers.iter().rev() {
            if header_name_is(header, &key) {
                extracted.push(header.clone());
            }
        }
    }
    extracted
}

/// ARC selection: for each listed name, only the last occurrence.
pub fn extract_headers_arc(headers: &[String], keys: &[impl AsRef<str>]) -> Vec<String> {
    let mut extracted = Vec::new();
    for key in unique_lowercase(keys) {
        if let Some(header) = headers.iter().rev().find(|header| header_name_is(header, &key)) {
            extracted.push(header.clone());
        }
    }
    extracted
}

/// The first header with the given field name, raw.
pub fn extract_header(headers: &[String], key: &str) -> Option<String> {
    headers
        .iter()
        .find(|header| header_name_is(header, key))
        .cloned()
}

/// Extracts the addr-spec from a `From:`-style header value, honouring
/// quoted display names and angle brackets.
pub fn parse_address(value: &str) -> String {
    let mut quoted = false;
    let mut in_brackets = false;
    let mut start = 0;
    let mut end = 0;

    for (index, ch) in value.char_indices() {
        match ch {
            '"' if !in_brackets => quoted = !quoted,
            '<' if !quoted => {
                in_brackets = true;
                start = index;
            }
            '>' if !quoted => {
                in_brackets = false;
                end = index;
            }
            _ => {}
        }
    }

    let address = if start < end {
        &value[start + 1..end]
    } else {
        value
    };
    address.trim().to_string()
}

/// The domain part of the address found in a header value.
pub fn parse_address_domain(value: &str) -> Result<String> {
    let address = parse_address(value);
    if address.is_empty() {
        return Err(Error::InvalidAddress);
    }
    match address.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Ok(domain.to_string()),
        _ => Err(Error::InvalidAddress),
    }
}

/// Canonicalizes and concatenates the signed headers, strips the final CRLF
/// and returns the pre-image bytes to sign or verify.
pub(crate) fn header_preimage(headers: &[String], canonicalization: Canonicalization) -> Vec<u8> {
    let mut preimage = String::new();
    for header in headers {
        preimage.push_str(&canonicalize_header(header, canonicalization));
    }
    let preimage = preimage.strip_suffix(CRLF).unwrap_or(&preimage);
    preimage.as_bytes().to_vec()
}

/// Signs the canonicalized header pre-image and returns the base64 `b=`
/// value. New signatures always hash with SHA-256; the key type picks the
/// signature algorithm.
pub(crate) fn sign_headers(
    headers: &[String],
    canonicalization: Canonicalization,
    key: &PrivateKey,
) -> Result<String> {
    let preimage = header_preimage(headers, canonicalization);
    let signature = key.sign(HashAlgorithm::Sha256, &preimage)?;
    let encoded = base64_encode(&signature)?;
    String::from_utf8(encoded).map_err(|_| Error::Base64)
}

/// Converts milter-style bare LF line breaks into CRLF.
pub fn normalize_to_crlf(value: &str) -> String {
    let mut normalized = String::with_capacity(value.len());
    let mut prev_cr = false;
    for ch in value.chars() {
        if ch == '\n' && !prev_cr {
            normalized.push('\r');
        }
        prev_cr = ch == '\r';
        normalized.push(ch);
    }
    normalized
}
