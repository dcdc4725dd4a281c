//! OpenPGP ASCII armor: base64 body with a CRC-24 checksum line.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const CRC24_INIT: u32 = 0x00B7_04CE;
const CRC24_POLY: u32 = 0x0186_4CFB;
const LINE_WIDTH: usize = 64;

pub const MESSAGE: &str = "MESSAGE";
pub const PUBLIC_KEY_BLOCK: &str = "PUBLIC KEY BLOCK";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArmorError {
    #[error("no armor header line")]
    MissingHeader,
    #[error("armor footer missing or does not match header {0:?}")]
    BadFooter(String),
    #[error("invalid base64 in armor body: {0}")]
    Base64(String),
    #[error("armor checksum mismatch")]
    ChecksumMismatch,
}

#[must_use]
pub fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= u32::from(*byte) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x0100_0000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0x00FF_FFFF
}

/// Wraps `data` in an armor block labelled `-----BEGIN PGP {label}-----`.
#[must_use]
pub fn armor(label: &str, data: &[u8]) -> String {
    let body = STANDARD.encode(data);
    let crc = crc24(data).to_be_bytes();
    let mut out = format!("-----BEGIN PGP {label}-----\n\n");
    for chunk in body.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII, so every chunk is valid UTF-8.
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push('=');
    out.push_str(&STANDARD.encode(&crc[1..]));
    out.push('\n');
    out.push_str(&format!("-----END PGP {label}-----\n"));
    out
}

/// Returns true if `data` starts (after whitespace) with an armor header.
#[must_use]
pub fn looks_armored(data: &[u8]) -> bool {
    data.trim_ascii_start().starts_with(b"-----BEGIN PGP ")
}

/// Parses the first armor block in `text`, returning its label and payload.
///
/// Armor headers (`Key: value` lines) are skipped. The checksum line is
/// optional, but verified when present.
///
/// # Errors
///
/// Returns `ArmorError` if no well-formed block is found or the checksum
/// does not match.
pub fn dearmor(text: &str) -> Result<(String, Vec<u8>), ArmorError> {
    let mut lines = text.lines().map(str::trim_end);
    let label = lines
        .by_ref()
        .find_map(|line| {
            line.strip_prefix("-----BEGIN PGP ")
                .and_then(|rest| rest.strip_suffix("-----"))
        })
        .ok_or(ArmorError::MissingHeader)?
        .to_string();
    let footer = format!("-----END PGP {label}-----");

    let mut body = String::new();
    let mut checksum = None;
    let mut in_headers = true;
    let mut closed = false;
    for line in lines {
        if line == footer {
            closed = true;
            break;
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if line.contains(": ") {
                continue;
            }
            in_headers = false;
        }
        if let Some(sum) = line.strip_prefix('=') {
            checksum = Some(sum.to_string());
        } else {
            body.push_str(line.trim());
        }
    }
    if !closed {
        return Err(ArmorError::BadFooter(label));
    }

    let data = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| ArmorError::Base64(e.to_string()))?;
    if let Some(sum) = checksum {
        let expected = STANDARD
            .decode(sum.as_bytes())
            .map_err(|e| ArmorError::Base64(e.to_string()))?;
        if expected.as_slice() != &crc24(&data).to_be_bytes()[1..] {
            return Err(ArmorError::ChecksumMismatch);
        }
    }
    Ok((label, data))
}
