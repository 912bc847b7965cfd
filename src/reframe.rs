//! H.264 reframing from container framing to Annex B
//!
//! The upstream delivers video access units either already start-code
//! delimited or as 4-byte length-prefixed (AVCC) NAL units. The outbound
//! track wants Annex B, with SPS and PPS repeated in front of every key frame.

use tracing::debug;

use crate::model::stream::VideoParams;

/// 4-byte Annex B start code.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const LENGTH_PREFIX: usize = 4;

/// Converts one video access unit into an Annex B buffer.
///
/// Key frames get `START_CODE ‖ SPS ‖ START_CODE ‖ PPS` in front of the
/// reframed payload. Empty parameter sets are not written.
pub fn reframe(data: &[u8], is_key_frame: bool, params: &VideoParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + params.sps.len() + params.pps.len() + 16);

    if is_key_frame {
        write_unit(&mut out, &params.sps);
        write_unit(&mut out, &params.pps);
    }

    if data.starts_with(&START_CODE) {
        out.extend_from_slice(data);
        return out;
    }

    match split_length_prefixed(data) {
        Some(units) => {
            for unit in units {
                write_unit(&mut out, unit);
            }
        }
        None => {
            // Not AVCC after all, so treat it as a single raw NAL unit.
            debug!(len = data.len(), "payload is not length-prefixed, wrapping as one unit");
            write_unit(&mut out, data);
        }
    }

    out
}

/// Splits 4-byte big-endian length-prefixed NAL units.
///
/// Returns `None` unless the prefixes tile `data` exactly.
pub fn split_length_prefixed(data: &[u8]) -> Option<Vec<&[u8]>> {
    let mut units = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let prefix = data.get(pos..pos + LENGTH_PREFIX)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        pos += LENGTH_PREFIX;

        let unit = data.get(pos..pos.checked_add(len)?)?;
        units.push(unit);
        pos += len;
    }

    Some(units)
}

fn write_unit(out: &mut Vec<u8>, unit: &[u8]) {
    if unit.is_empty() {
        return;
    }
    out.extend_from_slice(&START_CODE);
    out.extend_from_slice(unit);
}
