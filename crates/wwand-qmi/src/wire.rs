//! QMUX frame and QMI TLV codec.
//!
//! Layout of a QMUX frame as carried over the character device:
//!
//! ```text
//! | i/f type (0x01) | length u16 | ctl flags u8 | service u8 | client u8 |
//! | msg ctl u8 | tx id (u8 for CTL, u16 otherwise) | msg id u16 |
//! | msg length u16 | TLVs ... |
//! ```
//!
//! All integers are little-endian. `length` covers everything after the
//! i/f type octet. Each TLV is `| type u8 | length u16 | value |`.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::QMI_ERR_NO_EFFECT;
use crate::{QmiError, ServiceType};

pub(crate) const QMUX_IF_TYPE: u8 = 0x01;

/// Message control flags in the service header.
const MSG_CTL_REQUEST: u8 = 0x00;
const MSG_CTL_RESPONSE: u8 = 0x02;
const MSG_CTL_INDICATION: u8 = 0x04;

/// The mandatory result TLV present in every response.
const TLV_RESULT: u8 = 0x02;

/// Whether a decoded frame is a solicited response or an unsolicited
/// indication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Response,
    Indication,
}

/// A decoded inbound QMUX frame. The TLV payload is kept raw; services parse
/// it with [`Tlvs`].
#[derive(Debug)]
pub(crate) struct Frame {
    pub service: u8,
    pub client: u8,
    pub kind: FrameKind,
    pub tx_id: u16,
    pub msg_id: u16,
    pub payload: Vec<u8>,
}

/// Encode a request frame. CTL requests carry a one-byte transaction id;
/// every other service uses two bytes.
pub(crate) fn encode_request(
    service: ServiceType,
    client: u8,
    tx_id: u16,
    msg_id: u16,
    tlvs: &[u8],
) -> BytesMut {
    let ctl = service == ServiceType::Ctl;
    let tx_len = if ctl { 1 } else { 2 };
    let sdu_len = 1 + tx_len + 2 + 2 + tlvs.len();

    let mut buf = BytesMut::with_capacity(6 + sdu_len);
    buf.put_u8(QMUX_IF_TYPE);
    buf.put_u16_le((5 + sdu_len) as u16);
    buf.put_u8(0x00); // sender: control point
    buf.put_u8(service.as_u8());
    buf.put_u8(client);
    buf.put_u8(MSG_CTL_REQUEST);
    if ctl {
        buf.put_u8(tx_id as u8);
    } else {
        buf.put_u16_le(tx_id);
    }
    buf.put_u16_le(msg_id);
    buf.put_u16_le(tlvs.len() as u16);
    buf.put_slice(tlvs);
    buf
}

/// Decode one frame from the front of `buf`, consuming it. Returns `None`
/// when `buf` does not yet hold a complete frame.
pub(crate) fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, QmiError> {
    if buf.len() < 3 {
        return Ok(None);
    }
    if buf[0] != QMUX_IF_TYPE {
        return Err(QmiError::Malformed("bad QMUX i/f type"));
    }
    let frame_len = u16::from_le_bytes([buf[1], buf[2]]) as usize + 1;
    if buf.len() < frame_len {
        return Ok(None);
    }

    if frame_len < 12 {
        return Err(QmiError::Malformed("QMUX frame too short"));
    }
    let mut frame = buf.split_to(frame_len);
    frame.advance(3); // i/f type + length
    frame.advance(1); // ctl flags
    let service = frame.get_u8();
    let client = frame.get_u8();

    let msg_ctl = frame.get_u8();
    let ctl = service == ServiceType::Ctl.as_u8();
    if !ctl && frame.remaining() < 6 {
        return Err(QmiError::Malformed("QMUX frame too short"));
    }
    let tx_id = if ctl {
        u16::from(frame.get_u8())
    } else {
        frame.get_u16_le()
    };
    let kind = match msg_ctl & MSG_CTL_INDICATION {
        0 if msg_ctl & MSG_CTL_RESPONSE != 0 => FrameKind::Response,
        0 => return Err(QmiError::Malformed("unexpected request frame from modem")),
        _ => FrameKind::Indication,
    };

    let msg_id = frame.get_u16_le();
    let payload_len = frame.get_u16_le() as usize;
    if frame.len() < payload_len {
        return Err(QmiError::Malformed("TLV payload shorter than message length"));
    }
    let payload = frame[..payload_len].to_vec();

    Ok(Some(Frame {
        service,
        client,
        kind,
        tx_id,
        msg_id,
        payload,
    }))
}

// ─── TLV writing ────────────────────────────────────────────────────────

/// Builder for the TLV section of a request.
#[derive(Default)]
pub(crate) struct TlvWriter {
    buf: BytesMut,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, tlv_type: u8, value: u8) -> &mut Self {
        self.put_bytes(tlv_type, &[value])
    }

    pub fn put_u16(&mut self, tlv_type: u8, value: u16) -> &mut Self {
        self.put_bytes(tlv_type, &value.to_le_bytes())
    }

    pub fn put_u32(&mut self, tlv_type: u8, value: u32) -> &mut Self {
        self.put_bytes(tlv_type, &value.to_le_bytes())
    }

    pub fn put_bytes(&mut self, tlv_type: u8, value: &[u8]) -> &mut Self {
        self.buf.put_u8(tlv_type);
        self.buf.put_u16_le(value.len() as u16);
        self.buf.put_slice(value);
        self
    }

    pub fn finish(&self) -> &[u8] {
        &self.buf
    }
}

// ─── TLV reading ────────────────────────────────────────────────────────

/// Parsed view over a response or indication TLV payload.
pub(crate) struct Tlvs {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Tlvs {
    pub fn parse(mut payload: &[u8]) -> Result<Self, QmiError> {
        let mut entries = Vec::new();
        while payload.has_remaining() {
            if payload.remaining() < 3 {
                return Err(QmiError::Malformed("truncated TLV header"));
            }
            let tlv_type = payload.get_u8();
            let len = payload.get_u16_le() as usize;
            if payload.remaining() < len {
                return Err(QmiError::Malformed("truncated TLV value"));
            }
            entries.push((tlv_type, payload[..len].to_vec()));
            payload.advance(len);
        }
        Ok(Tlvs { entries })
    }

    pub fn get(&self, tlv_type: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tlv_type)
            .map(|(_, v)| v.as_slice())
    }

    pub fn require(&self, tlv_type: u8, what: &'static str) -> Result<&[u8], QmiError> {
        self.get(tlv_type).ok_or(QmiError::MissingField(what))
    }

    pub fn get_u8(&self, tlv_type: u8) -> Option<u8> {
        self.get(tlv_type).filter(|v| v.len() == 1).map(|v| v[0])
    }

    pub fn get_u16(&self, tlv_type: u8) -> Option<u16> {
        self.get(tlv_type)
            .filter(|v| v.len() == 2)
            .map(|v| u16::from_le_bytes([v[0], v[1]]))
    }

    pub fn get_u32(&self, tlv_type: u8) -> Option<u32> {
        self.get(tlv_type)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_le_bytes([v[0], v[1], v[2], v[3]]))
    }

    /// Decode the mandatory result TLV and map it onto the error model:
    /// success passes through, `NO_EFFECT` and other modem errors become
    /// their respective variants.
    pub fn check_result(&self) -> Result<(), QmiError> {
        let raw = self.require(TLV_RESULT, "result TLV")?;
        if raw.len() != 4 {
            return Err(QmiError::Malformed("result TLV has wrong length"));
        }
        let result = u16::from_le_bytes([raw[0], raw[1]]);
        let error = u16::from_le_bytes([raw[2], raw[3]]);
        if result == 0 {
            return Ok(());
        }
        if error == QMI_ERR_NO_EFFECT {
            return Err(QmiError::NoEffect);
        }
        Err(QmiError::Modem { result, error })
    }

    /// Raw `(result, error)` words for callers that need the error code even
    /// when the overall status is a failure (session start diagnostics).
    pub fn result_words(&self) -> Result<(u16, u16), QmiError> {
        let raw = self.require(TLV_RESULT, "result TLV")?;
        if raw.len() != 4 {
            return Err(QmiError::Malformed("result TLV has wrong length"));
        }
        Ok((
            u16::from_le_bytes([raw[0], raw[1]]),
            u16::from_le_bytes([raw[2], raw[3]]),
        ))
    }
}
