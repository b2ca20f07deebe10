//! ISO 7816-4 APDU framing.
//!
//! Detects complete frames in a raw byte stream and decodes the command
//! header (cases 1-4, short and extended length encodings). A streaming
//! framer cannot always tell a finished short frame from the prefix of a
//! longer one; the pump resolves that by passing an `idle` flag once the
//! inter-byte idle window has elapsed with no new bytes.
//!
//! Responses are opaque: payload plus two trailing status bytes, framed by
//! the pending command's Le when one is known, otherwise by the idle flush,
//! always bounded by [`MAX_RESPONSE_LEN`].

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

use crate::ring::ByteView;

/// Extended Le maximum (65 536) plus the two status bytes.
pub const MAX_RESPONSE_LEN: usize = 65_538;

/// CLA value reserved by ISO 7816-4 (also the 14443 PPS start byte); never a
/// valid command class, so it marks line noise.
const CLA_RESERVED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApduCase {
    Case1,
    Case2,
    Case3,
    Case4,
}

impl fmt::Display for ApduCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApduCase::Case1 => write!(f, "case 1"),
            ApduCase::Case2 => write!(f, "case 2"),
            ApduCase::Case3 => write!(f, "case 3"),
            ApduCase::Case4 => write!(f, "case 4"),
        }
    }
}

/// Why a byte sequence failed to frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFault {
    /// First byte is the reserved 0xFF class.
    ReservedClass,
    /// Idle window elapsed mid-header or mid-body.
    Truncated,
    /// Extended Lc of zero followed by more bytes.
    ZeroExtendedLength,
    /// Bytes left over after a complete frame (strict parse only).
    TrailingGarbage,
    /// Advisory BCC mismatch; the frame is still forwarded.
    Checksum,
}

impl fmt::Display for FrameFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFault::ReservedClass => write!(f, "reserved class byte"),
            FrameFault::Truncated => write!(f, "truncated frame"),
            FrameFault::ZeroExtendedLength => write!(f, "extended Lc of zero"),
            FrameFault::TrailingGarbage => write!(f, "trailing bytes after frame"),
            FrameFault::Checksum => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for FrameFault {}

/// Outcome of a completeness check over buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Keep reading; the decision needs more bytes (or the idle flush).
    NeedMore,
    /// A complete frame of exactly this many bytes is at the front.
    Complete(usize),
    /// The front of the buffer cannot be a frame; drain it.
    Malformed(FrameFault),
}

/// Decoded command header. Copyable so the hot path never clones payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApduHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    /// Command data length (0 when absent).
    pub lc: usize,
    /// Decoded expected response length; `0x00` encodings map to 256/65536.
    pub le: Option<usize>,
    pub case: ApduCase,
    pub extended: bool,
    /// Total encoded frame length.
    pub len: usize,
}

impl ApduHeader {
    /// Opaque identifier pairing a command with its response in the latency
    /// meter: header bytes plus encoded length.
    pub fn fingerprint(&self) -> u64 {
        (u64::from(self.cla) << 56)
            | (u64::from(self.ins) << 48)
            | (u64::from(self.p1) << 40)
            | (u64::from(self.p2) << 32)
            | (self.len as u64 & 0xFFFF_FFFF)
    }
}

/// A fully parsed command APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduFrame {
    pub header: ApduHeader,
    pub data: Bytes,
    pub valid: bool,
}

impl ApduFrame {
    /// Strict parse: `bytes` must hold exactly one complete frame.
    pub fn parse(bytes: &[u8]) -> Result<ApduFrame, FrameFault> {
        let view = ByteView::of(bytes);
        let header = parse_header(&view)?;
        let data = if header.lc > 0 {
            let off = if header.extended { 7 } else { 5 };
            Bytes::copy_from_slice(&bytes[off..off + header.lc])
        } else {
            Bytes::new()
        };
        Ok(ApduFrame {
            header,
            data,
            valid: true,
        })
    }

    /// Canonical wire encoding; `parse(serialize(f)) == f` for valid frames.
    pub fn serialize(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(h.len);
        out.extend_from_slice(&[h.cla, h.ins, h.p1, h.p2]);
        if h.extended {
            if h.lc > 0 {
                out.push(0x00);
                out.extend_from_slice(&(h.lc as u16).to_be_bytes());
                out.extend_from_slice(&self.data);
                if let Some(le) = h.le {
                    out.extend_from_slice(&encode_le16(le));
                }
            } else if let Some(le) = h.le {
                out.push(0x00);
                out.extend_from_slice(&encode_le16(le));
            }
        } else {
            if h.lc > 0 {
                out.push(h.lc as u8);
                out.extend_from_slice(&self.data);
            }
            if let Some(le) = h.le {
                out.push(if le == 256 { 0x00 } else { le as u8 });
            }
        }
        out
    }

    pub fn fingerprint(&self) -> u64 {
        self.header.fingerprint()
    }
}

fn encode_le16(le: usize) -> [u8; 2] {
    if le == 65_536 {
        [0x00, 0x00]
    } else {
        (le as u16).to_be_bytes()
    }
}

fn decode_le8(b: u8) -> usize {
    if b == 0 {
        256
    } else {
        b as usize
    }
}

fn decode_le16(hi: u8, lo: u8) -> usize {
    let le = (usize::from(hi) << 8) | usize::from(lo);
    if le == 0 {
        65_536
    } else {
        le
    }
}

/// Decode the header of a complete frame (the whole view is the frame).
pub fn parse_header(view: &ByteView<'_>) -> Result<ApduHeader, FrameFault> {
    let framer = Framer::default();
    match framer.command_status(view, true) {
        FrameStatus::Complete(n) if n == view.len() => Ok(decode_header(view, n)),
        FrameStatus::Complete(_) => Err(FrameFault::TrailingGarbage),
        FrameStatus::NeedMore => Err(FrameFault::Truncated),
        FrameStatus::Malformed(fault) => Err(fault),
    }
}

/// Field extraction for a frame already known to be complete at `len`.
fn decode_header(view: &ByteView<'_>, len: usize) -> ApduHeader {
    let b = |i: usize| view.byte(i).unwrap_or(0);
    let (cla, ins, p1, p2) = (b(0), b(1), b(2), b(3));
    let mut h = ApduHeader {
        cla,
        ins,
        p1,
        p2,
        lc: 0,
        le: None,
        case: ApduCase::Case1,
        extended: false,
        len,
    };
    if len == 4 {
        return h;
    }
    let p3 = b(4);
    if p3 != 0 {
        let lc = p3 as usize;
        if len == 5 {
            h.case = ApduCase::Case2;
            h.le = Some(lc);
        } else if len == 5 + lc {
            h.case = ApduCase::Case3;
            h.lc = lc;
        } else {
            h.case = ApduCase::Case4;
            h.lc = lc;
            h.le = Some(decode_le8(b(5 + lc)));
        }
        return h;
    }
    if len == 5 {
        // Lone 0x00 length byte: Case 2 short asking for the 256-byte max.
        h.case = ApduCase::Case2;
        h.le = Some(256);
        return h;
    }
    h.extended = true;
    let lc = (usize::from(b(5)) << 8) | usize::from(b(6));
    if len == 7 {
        h.case = ApduCase::Case2;
        h.le = Some(decode_le16(b(5), b(6)));
        return h;
    }
    h.lc = lc;
    if len == 7 + lc {
        h.case = ApduCase::Case3;
    } else {
        h.case = ApduCase::Case4;
        h.le = Some(decode_le16(b(7 + lc), b(7 + lc + 1)));
    }
    h
}

/// Streaming framing decisions for one direction.
#[derive(Debug, Clone)]
pub struct Framer {
    max_response_len: usize,
    verify_checksum: bool,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Framer {
    pub fn new(verify_checksum: bool) -> Self {
        Self {
            max_response_len: MAX_RESPONSE_LEN,
            verify_checksum,
        }
    }

    /// Is a complete command at the front of `view`?
    ///
    /// `idle` means the inter-byte idle window elapsed since the last byte
    /// arrived; it is what flushes the shorter reading of an ambiguous
    /// prefix (case 1 vs 3, case 2 vs 4, 7-byte extended Le vs extended Lc).
    pub fn command_status(&self, view: &ByteView<'_>, idle: bool) -> FrameStatus {
        let len = view.len();
        if len == 0 {
            return FrameStatus::NeedMore;
        }
        if view.byte(0) == Some(CLA_RESERVED) {
            return FrameStatus::Malformed(FrameFault::ReservedClass);
        }
        if len < 4 {
            return Self::stalled(idle);
        }
        if len == 4 {
            return if idle {
                FrameStatus::Complete(4)
            } else {
                FrameStatus::NeedMore
            };
        }
        let p3 = view.byte(4).unwrap_or(0);
        if p3 != 0 {
            let lc = p3 as usize;
            let case3 = 5 + lc;
            if len >= case3 + 1 {
                return FrameStatus::Complete(case3 + 1);
            }
            if len == case3 {
                return if idle {
                    FrameStatus::Complete(case3)
                } else {
                    FrameStatus::NeedMore
                };
            }
            if len == 5 {
                // Could be a finished case 2 or an arriving case 3 body.
                return if idle {
                    FrameStatus::Complete(5)
                } else {
                    FrameStatus::NeedMore
                };
            }
            return Self::stalled(idle);
        }
        // p3 == 0: extended marker, or a short Le of 0x00 if nothing follows.
        if len == 5 {
            return if idle {
                FrameStatus::Complete(5)
            } else {
                FrameStatus::NeedMore
            };
        }
        if len == 6 {
            return Self::stalled(idle);
        }
        let lc = (usize::from(view.byte(5).unwrap_or(0)) << 8) | usize::from(view.byte(6).unwrap_or(0));
        if lc == 0 {
            // A 7-byte frame is case 2 extended; anything longer claims a
            // zero-length body with data behind it.
            if len == 7 {
                return if idle {
                    FrameStatus::Complete(7)
                } else {
                    FrameStatus::NeedMore
                };
            }
            return FrameStatus::Malformed(FrameFault::ZeroExtendedLength);
        }
        if len == 7 {
            // Finished case 2 extended, or the Lc of an arriving case 3/4.
            return if idle {
                FrameStatus::Complete(7)
            } else {
                FrameStatus::NeedMore
            };
        }
        let case3 = 7 + lc;
        if len >= case3 + 2 {
            return FrameStatus::Complete(case3 + 2);
        }
        if len == case3 {
            return if idle {
                FrameStatus::Complete(case3)
            } else {
                FrameStatus::NeedMore
            };
        }
        Self::stalled(idle)
    }

    /// Is a complete response at the front of `view`?
    ///
    /// `expected_le` is the pending command's decoded Le; the response can
    /// still be shorter (an error status arrives as just `SW1 SW2`), which
    /// the idle flush picks up.
    pub fn response_status(
        &self,
        view: &ByteView<'_>,
        expected_le: Option<usize>,
        idle: bool,
    ) -> FrameStatus {
        let len = view.len();
        if len >= self.max_response_len {
            return FrameStatus::Complete(self.max_response_len);
        }
        if let Some(le) = expected_le {
            let want = (le + 2).min(self.max_response_len);
            if len >= want {
                return FrameStatus::Complete(want);
            }
        }
        if idle && len >= 2 {
            return FrameStatus::Complete(len);
        }
        FrameStatus::NeedMore
    }

    /// Advisory BCC over the whole frame: a frame carrying its checksum XORs
    /// to zero. Always passes when verification is disabled.
    pub fn checksum_ok(&self, view: &ByteView<'_>, len: usize) -> bool {
        if !self.verify_checksum {
            return true;
        }
        view.slice(0, len).iter().fold(0u8, |acc, b| acc ^ b) == 0
    }

    fn stalled(idle: bool) -> FrameStatus {
        if idle {
            FrameStatus::Malformed(FrameFault::Truncated)
        } else {
            FrameStatus::NeedMore
        }
    }
}

/// XOR checksum as used by the 14443-3 short-frame path.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}
