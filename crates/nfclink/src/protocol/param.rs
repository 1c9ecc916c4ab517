// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 nfclink contributors

//! LLC parameter TLV codec
//!
//! Encodes and decodes the parameter list carried by the magic-prefixed ATR
//! general bytes and by CONNECT/CC/PAX/SNL PDUs (TS-LLCP 1.1 Section 4.4).
//!
//! The decoder is tolerant: TLVs with an unexpected length are skipped and a
//! truncated trailing TLV ends the walk. The encoder emits parameters in the
//! order given and honors an optional length budget, dropping the last
//! partially-fitting TLV entirely.

use super::{LTO_DEFAULT_MS, MIU_MIN, SAP_MASK};

/// Parameter type octets (TS-LLCP 1.1 Table 6).
pub const TYPE_VERSION: u8 = 0x01;
pub const TYPE_MIUX: u8 = 0x02;
pub const TYPE_WKS: u8 = 0x03;
pub const TYPE_LTO: u8 = 0x04;
pub const TYPE_RW: u8 = 0x05;
pub const TYPE_SN: u8 = 0x06;
pub const TYPE_OPT: u8 = 0x07;
pub const TYPE_SDREQ: u8 = 0x08;
pub const TYPE_SDRES: u8 = 0x09;

/// One decoded LLC parameter.
///
/// Values are stored in engine units, not wire units: `Miu` carries the
/// effective MIU (wire MIUX + 128), `Lto` carries milliseconds (wire value is
/// in 10 ms steps, zero meaning the 100 ms default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Param {
    /// 4.5.1 Version Number: `(major << 4) | minor`.
    Version(u8),
    /// 4.5.2 Maximum Information Unit Extension, as effective MIU.
    Miu(u16),
    /// 4.5.3 Well-Known Service List bitmap.
    Wks(u16),
    /// 4.5.4 Link Timeout in milliseconds.
    Lto(u32),
    /// 4.5.5 Receive Window Size (low nibble).
    Rw(u8),
    /// 4.5.6 Service Name, UTF-8 without terminator.
    ServiceName(String),
    /// 4.5.7 Option octet.
    Opt(u8),
    /// 4.5.8 Service Discovery Request (LLCP 1.1).
    SdReq { tid: u8, uri: String },
    /// 4.5.9 Service Discovery Response (LLCP 1.1).
    SdRes { tid: u8, sap: u8 },
}

impl Param {
    /// Wire type octet for this parameter.
    pub fn type_code(&self) -> u8 {
        match self {
            Param::Version(_) => TYPE_VERSION,
            Param::Miu(_) => TYPE_MIUX,
            Param::Wks(_) => TYPE_WKS,
            Param::Lto(_) => TYPE_LTO,
            Param::Rw(_) => TYPE_RW,
            Param::ServiceName(_) => TYPE_SN,
            Param::Opt(_) => TYPE_OPT,
            Param::SdReq { .. } => TYPE_SDREQ,
            Param::SdRes { .. } => TYPE_SDRES,
        }
    }
}

/// Append the TLV encoding of `params` to `dest`.
///
/// With `max_len` set, encoding stops once `dest` reaches the budget; a TLV
/// that would overshoot it is removed again so the output never carries a
/// partial parameter.
pub fn encode(params: &[Param], dest: &mut Vec<u8>, max_len: Option<usize>) {
    for param in params {
        let mark = dest.len();
        match param {
            Param::Version(v) => dest.extend_from_slice(&[TYPE_VERSION, 0x01, *v]),
            Param::Miu(miu) => {
                let miux = miu.max(&MIU_MIN) - MIU_MIN;
                dest.extend_from_slice(&[TYPE_MIUX, 0x02, ((miux >> 8) & 0x07) as u8, miux as u8]);
            }
            Param::Wks(wks) => {
                dest.extend_from_slice(&[TYPE_WKS, 0x02, (wks >> 8) as u8, *wks as u8]);
            }
            Param::Lto(ms) => {
                let v = (ms / 10).min(0xff) as u8;
                dest.extend_from_slice(&[TYPE_LTO, 0x01, v]);
            }
            Param::Rw(rw) => dest.extend_from_slice(&[TYPE_RW, 0x01, rw.min(&0x0f) & 0x0f]),
            Param::ServiceName(sn) => {
                let bytes = sn.as_bytes();
                let l = bytes.len().min(0xff);
                dest.extend_from_slice(&[TYPE_SN, l as u8]);
                dest.extend_from_slice(&bytes[..l]);
            }
            Param::Opt(opt) => dest.extend_from_slice(&[TYPE_OPT, 0x01, *opt]),
            Param::SdReq { tid, uri } => {
                let bytes = uri.as_bytes();
                let l = bytes.len().min(0xfe);
                dest.extend_from_slice(&[TYPE_SDREQ, (l + 1) as u8, *tid]);
                dest.extend_from_slice(&bytes[..l]);
            }
            Param::SdRes { tid, sap } => {
                dest.extend_from_slice(&[TYPE_SDRES, 0x02, *tid, *sap]);
            }
        }
        if let Some(budget) = max_len {
            if dest.len() >= budget {
                if dest.len() > budget {
                    dest.truncate(mark);
                }
                break;
            }
        }
    }
}

/// Decode a TLV list, skipping malformed entries.
///
/// A TLV whose length octet disagrees with its type is dropped but the walk
/// continues at the following TLV; a truncated tail ends the walk silently.
pub fn decode(tlvs: &[u8]) -> Vec<Param> {
    let mut params = Vec::new();
    let mut off = 0;

    while off + 2 <= tlvs.len() {
        let t = tlvs[off];
        let l = tlvs[off + 1] as usize;
        if off + 2 + l > tlvs.len() {
            break;
        }
        let v = &tlvs[off + 2..off + 2 + l];

        let param = match t {
            TYPE_VERSION if l == 1 => Some(Param::Version(v[0])),
            TYPE_MIUX if l == 2 => {
                let miux = (u16::from_be_bytes([v[0], v[1]])) & 0x07ff;
                Some(Param::Miu(miux + MIU_MIN))
            }
            TYPE_WKS if l == 2 => Some(Param::Wks(u16::from_be_bytes([v[0], v[1]]))),
            TYPE_LTO if l == 1 => {
                // Zero means the 100 ms default (4.5.4)
                let ms = if v[0] != 0 {
                    10 * u32::from(v[0])
                } else {
                    LTO_DEFAULT_MS
                };
                Some(Param::Lto(ms))
            }
            TYPE_RW if l == 1 => Some(Param::Rw(v[0] & 0x0f)),
            TYPE_SN => Some(Param::ServiceName(
                String::from_utf8_lossy(v).into_owned(),
            )),
            TYPE_OPT if l == 1 => Some(Param::Opt(v[0])),
            TYPE_SDREQ if l >= 1 => Some(Param::SdReq {
                tid: v[0],
                uri: String::from_utf8_lossy(&v[1..]).into_owned(),
            }),
            TYPE_SDRES if l == 2 => Some(Param::SdRes {
                tid: v[0],
                sap: v[1] & SAP_MASK,
            }),
            _ => None,
        };
        if let Some(param) = param {
            params.push(param);
        }
        off += 2 + l;
    }
    params
}

/// First service name in the list, if any.
pub fn find_service_name(params: &[Param]) -> Option<&str> {
    params.iter().find_map(|p| match p {
        Param::ServiceName(sn) => Some(sn.as_str()),
        _ => None,
    })
}
