//! BIP-32 style derivation paths

use crate::errors::{CustodyError, Result};
use std::fmt;
use std::str::FromStr;

/// Top bit marking a hardened index
pub const HARDENED_BIT: u32 = 0x8000_0000;

/// Parsed derivation path, e.g. `m/44'/60'/0'/0/0`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn indices(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Big-endian concatenation of the indices
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|i| i.to_be_bytes()).collect()
    }
}

fn parse_segment(segment: &str) -> Result<u32> {
    let (digits, hardened) = match segment.strip_suffix(|c: char| matches!(c, '\'' | 'h' | 'H')) {
        Some(rest) => (rest, true),
        None => (segment, false),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CustodyError::Format(format!(
            "invalid derivation path segment '{}'",
            segment
        )));
    }

    let index: u32 = digits.parse().map_err(|_| {
        CustodyError::Format(format!("derivation index out of range: '{}'", segment))
    })?;
    if index & HARDENED_BIT != 0 {
        return Err(CustodyError::Format(format!(
            "derivation index out of range: '{}'",
            segment
        )));
    }

    Ok(if hardened { index | HARDENED_BIT } else { index })
}

impl FromStr for DerivationPath {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        let mut segments = s.trim().split('/');
        match segments.next() {
            Some("m") | Some("M") => {}
            _ => {
                return Err(CustodyError::Format(format!(
                    "derivation path must start with 'm': '{}'",
                    s
                )))
            }
        }

        segments
            .map(parse_segment)
            .collect::<Result<Vec<_>>>()
            .map(DerivationPath)
    }
}

impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for index in &self.0 {
            if index & HARDENED_BIT != 0 {
                write!(f, "/{}'", index & !HARDENED_BIT)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}
