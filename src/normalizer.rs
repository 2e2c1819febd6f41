//! Payload to text normalization.
//!
//! Single entry point that turns raw chat payload bytes into the text the
//! rules are matched against:
//!
//! 1. optional zlib inflate (raw bytes on failure)
//! 2. skip the protocol header
//! 3. detect encoding and decode, skipping invalid sequences
//! 4. strip configured punctuation and whitespace
//! 5. collapse confusable characters
//! 6. deobfuscate
//!
//! No step can fail the pipeline; a broken payload only yields less text.

use crate::confusables::ConfusablesTable;
use crate::deobfuscate::Deobfuscator;
use crate::interceptor::Direction;
use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::io::Read;
use std::sync::OnceLock;

/// Inflated payloads are cut off at this size.
const MAX_INFLATED_BYTES: u64 = 1024 * 1024;

/// Bytes needed before an automatic detection is pinned for the session.
const MIN_DETECTION_BYTES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextEncoding::Utf8 => write!(f, "utf-8"),
            TextEncoding::Utf16Le => write!(f, "utf-16le"),
            TextEncoding::Utf16Be => write!(f, "utf-16be"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingSetting {
    /// Detect from the first payload of a session, then keep it.
    Auto,
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl fmt::Display for EncodingSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingSetting::Auto => write!(f, "auto"),
            EncodingSetting::Utf8 => write!(f, "utf-8"),
            EncodingSetting::Utf16Le => write!(f, "utf-16le"),
            EncodingSetting::Utf16Be => write!(f, "utf-16be"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub ignore_start: usize,
    pub strip_punctuation: BTreeSet<char>,
    pub strip_whitespace: BTreeSet<char>,
    pub skeletonize: bool,
    pub zlib_decompress: bool,
    pub encoding: EncodingSetting,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            ignore_start: 0,
            strip_punctuation: BTreeSet::new(),
            strip_whitespace: BTreeSet::new(),
            skeletonize: true,
            zlib_decompress: false,
            encoding: EncodingSetting::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedText {
    pub text: String,
    pub encoding: TextEncoding,
    pub inflated: bool,
}

pub struct Normalizer {
    config: NormalizerConfig,
    confusables: ConfusablesTable,
    deobfuscator: Deobfuscator,
    pinned: OnceLock<TextEncoding>,
}

impl Normalizer {
    pub fn new(
        config: NormalizerConfig,
        confusables: ConfusablesTable,
        deobfuscator: Deobfuscator,
    ) -> Self {
        let pinned = OnceLock::new();
        let fixed = match config.encoding {
            EncodingSetting::Auto => None,
            EncodingSetting::Utf8 => Some(TextEncoding::Utf8),
            EncodingSetting::Utf16Le => Some(TextEncoding::Utf16Le),
            EncodingSetting::Utf16Be => Some(TextEncoding::Utf16Be),
        };
        if let Some(encoding) = fixed {
            let _ = pinned.set(encoding);
        }

        Self {
            config,
            confusables,
            deobfuscator,
            pinned,
        }
    }

    /// Returns `None` when the payload carries no text at all.
    pub fn normalize(&self, payload: &[u8], direction: Direction) -> Option<NormalizedText> {
        let (bytes, inflated) = self.inflate(payload);

        let Some(body) = bytes.get(self.config.ignore_start..).filter(|b| !b.is_empty()) else {
            log::trace!(
                "{direction} payload of {} bytes has no body past the {}-byte header",
                bytes.len(),
                self.config.ignore_start
            );
            return None;
        };

        let encoding = self.session_encoding(body);
        let decoded = decode(body, encoding);

        let stripped: String = decoded
            .chars()
            .filter(|c| {
                !self.config.strip_punctuation.contains(c) && !self.config.strip_whitespace.contains(c)
            })
            .collect();

        let skeleton = if self.config.skeletonize {
            self.confusables.skeletonize(&stripped)
        } else {
            stripped
        };

        let text = self.deobfuscator.apply(&skeleton);
        if text.is_empty() {
            return None;
        }

        Some(NormalizedText {
            text,
            encoding,
            inflated,
        })
    }

    /// Encoding in force for this session, if one has been determined.
    pub fn pinned_encoding(&self) -> Option<TextEncoding> {
        self.pinned.get().copied()
    }

    fn inflate<'a>(&self, payload: &'a [u8]) -> (std::borrow::Cow<'a, [u8]>, bool) {
        if !self.config.zlib_decompress {
            return (std::borrow::Cow::Borrowed(payload), false);
        }

        let mut out = Vec::new();
        match ZlibDecoder::new(payload)
            .take(MAX_INFLATED_BYTES)
            .read_to_end(&mut out)
        {
            Ok(_) => (std::borrow::Cow::Owned(out), true),
            Err(e) => {
                log::trace!("Payload is not zlib data ({e}), using raw bytes");
                (std::borrow::Cow::Borrowed(payload), false)
            }
        }
    }

    fn session_encoding(&self, body: &[u8]) -> TextEncoding {
        if let Some(encoding) = self.pinned.get() {
            return *encoding;
        }

        let detected = detect_encoding(body);
        if body.len() < MIN_DETECTION_BYTES {
            return detected;
        }

        let pinned = *self.pinned.get_or_init(|| detected);
        if pinned == detected {
            log::info!("Payload encoding detected as {pinned}");
        }
        pinned
    }
}

/// Byte-order heuristics: BOM first, then the position of zero bytes.
pub fn detect_encoding(bytes: &[u8]) -> TextEncoding {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return TextEncoding::Utf8;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return TextEncoding::Utf16Le;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return TextEncoding::Utf16Be;
    }

    let pairs = bytes.len() / 2;
    if pairs == 0 {
        return TextEncoding::Utf8;
    }

    let zeros_even = bytes.iter().step_by(2).filter(|b| **b == 0).count();
    let zeros_odd = bytes.iter().skip(1).step_by(2).filter(|b| **b == 0).count();

    if zeros_odd > zeros_even && zeros_odd * 2 >= pairs {
        TextEncoding::Utf16Le
    } else if zeros_even > zeros_odd && zeros_even * 2 >= pairs {
        TextEncoding::Utf16Be
    } else {
        TextEncoding::Utf8
    }
}

/// Decodes `bytes`, dropping a leading BOM, invalid sequences and control
/// characters other than tab, CR and LF.
pub fn decode(bytes: &[u8], encoding: TextEncoding) -> String {
    let mut skipped = 0usize;
    let mut out = String::with_capacity(bytes.len());

    match encoding {
        TextEncoding::Utf8 => {
            let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
            for chunk in bytes.utf8_chunks() {
                out.push_str(chunk.valid());
                skipped += chunk.invalid().len();
            }
        }
        TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
            let little_endian = encoding == TextEncoding::Utf16Le;
            let bom: [u8; 2] = if little_endian { [0xFF, 0xFE] } else { [0xFE, 0xFF] };
            let bytes = bytes.strip_prefix(&bom[..]).unwrap_or(bytes);
            let chunks = bytes.chunks_exact(2);
            skipped += chunks.remainder().len();
            let units = chunks.map(|pair| {
                if little_endian {
                    u16::from_le_bytes([pair[0], pair[1]])
                } else {
                    u16::from_be_bytes([pair[0], pair[1]])
                }
            });
            for unit in char::decode_utf16(units) {
                match unit {
                    Ok(ch) => out.push(ch),
                    Err(_) => skipped += 2,
                }
            }
        }
    }

    if skipped > 0 {
        log::debug!("Skipped {skipped} undecodable bytes while decoding {encoding} payload");
    }

    out.retain(|c| !c.is_control() || matches!(c, '\t' | '\r' | '\n'));
    out
}
