//! Output-text parsing for the supported search programs.
//!
//! Three line-oriented grammars. VanitySearch prints a labeled address
//! line followed by a labeled private-key line; its v2/v3 builds may
//! wrap the key hex across several lines. BitCrack prints independent
//! `<address> <hex>` lines with no context.

use std::collections::HashSet;

use shared::types::{Address, FoundPair, PrivateKey, ProgramKind};

const ADDRESS_LABELS: &[&str] = &["Pub Addr:", "PubAddress:", "Public Addr:", "Public Address:"];
const KEY_LABEL: &str = "Priv (HEX):";

#[derive(Debug, Default)]
pub struct ParsedOutput {
    /// Keys for pool addresses, queued for submission.
    pub candidates: Vec<PrivateKey>,
    /// Keys that hit a locally configured target address.
    pub found: Vec<FoundPair>,
}

impl ParsedOutput {
    fn classify(&mut self, address: Option<&str>, key: PrivateKey, targets: &HashSet<Address>) {
        match address {
            Some(addr) if targets.contains(&Address(addr.to_string())) => {
                self.found.push(FoundPair {
                    address: Address(addr.to_string()),
                    key,
                });
            }
            _ => self.candidates.push(key),
        }
    }
}

pub fn parse_output(text: &str, kind: ProgramKind, targets: &HashSet<Address>) -> ParsedOutput {
    match kind {
        ProgramKind::Vanity => parse_vanity(text, targets),
        ProgramKind::VanityV2 => parse_vanity_v2(text, targets),
        ProgramKind::BitCrack => parse_bitcrack(text, targets),
    }
}

/// Line announcing the public address that the next key line belongs to.
fn address_from_label(line: &str) -> Option<String> {
    for label in ADDRESS_LABELS {
        if let Some(pos) = line.find(label) {
            return Some(line[pos + label.len()..].trim().to_string());
        }
    }
    None
}

/// `<address> <hex>` pair or a bare 64-digit hex string.
fn parse_plain_line(line: &str, out: &mut ParsedOutput, targets: &HashSet<Address>) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() >= 2 {
        if let Some(key) = PrivateKey::parse(parts[1]) {
            out.classify(Some(parts[0]), key, targets);
        }
    } else if let Some(key) = PrivateKey::parse(line.trim()) {
        out.classify(None, key, targets);
    }
}

fn parse_vanity(text: &str, targets: &HashSet<Address>) -> ParsedOutput {
    let mut out = ParsedOutput::default();
    let mut current_address: Option<String> = None;

    for line in text.lines() {
        if let Some(addr) = address_from_label(line) {
            current_address = if addr.is_empty() { None } else { Some(addr) };
            continue;
        }
        if let Some(pos) = line.find(KEY_LABEL) {
            let raw = &line[pos + KEY_LABEL.len()..];
            if let Some(key) = PrivateKey::parse(raw) {
                if let Some(addr) = current_address.take() {
                    out.classify(Some(addr.as_str()), key, targets);
                }
            }
            continue;
        }
        parse_plain_line(line, &mut out, targets);
    }
    out
}

/// Same context tracking as classic vanity, but the hex digits of a key
/// may continue onto the following lines. Raw hex characters are
/// accumulated until 64 are available; the first 64 win.
fn parse_vanity_v2(text: &str, targets: &HashSet<Address>) -> ParsedOutput {
    let mut out = ParsedOutput::default();
    let mut current_address: Option<String> = None;
    let lines: Vec<&str> = text.lines().collect();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some(addr) = address_from_label(line) {
            current_address = if addr.is_empty() { None } else { Some(addr) };
        } else if let Some(pos) = line.find(KEY_LABEL) {
            let seg = line[pos + KEY_LABEL.len()..].replace("0x", "");
            let mut buf: String = seg.chars().filter(char::is_ascii_hexdigit).collect();
            let mut j = i + 1;
            while buf.len() < 64 && j < lines.len() {
                buf.extend(lines[j].chars().filter(char::is_ascii_hexdigit));
                j += 1;
            }
            if buf.len() >= 64 {
                let key = PrivateKey::from_canonical(buf[..64].to_uppercase());
                if let Some(addr) = current_address.take() {
                    out.classify(Some(addr.as_str()), key, targets);
                }
                i = j - 1;
            }
        } else {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Some(key) = PrivateKey::parse(parts[1]) {
                    out.classify(Some(parts[0]), key, targets);
                }
            }
        }
        i += 1;
    }
    out
}

fn parse_bitcrack(text: &str, targets: &HashSet<Address>) -> ParsedOutput {
    let mut out = ParsedOutput::default();
    for line in text.lines() {
        parse_plain_line(line, &mut out, targets);
    }
    out
}
