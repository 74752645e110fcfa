use crate::prelude::*;
use crate::error::Error;

use {
    bytes::{Buf, BufMut, Bytes, BytesMut},
    std::fmt,
    tokio_util::codec::{Decoder, Encoder},
};

// Frame layout: [55 aa][header 2..17][reserved][len][payload][checksum]
pub const PREAMBLE: [u8; 2] = [0x55, 0xaa];
const HEADER_START: usize = 2;
const HEADER_END: usize = 17;
const LENGTH_OFFSET: usize = 18;
const PAYLOAD_OFFSET: usize = 19;
const ID_OFFSET: usize = 11;
const TERMINATOR_LEN: usize = 2;
pub const MIN_FRAME_LEN: usize = PAYLOAD_OFFSET + TERMINATOR_LEN;
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + u8::MAX as usize;

const ADVERTISEMENT: [u8; 16] = [
    0x55, 0xaa, 0x00, 0x0c, 0x01, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x13,
];
const MODEL_INFO_REQUEST: [u8; 21] = [
    0x55, 0xaa, 0x00, 0x11, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x80, 0x01, 0x00,
    0x00, 0x00, 0x7a, 0x02, 0x0e,
];
const VALUES_REQUEST: [u8; 21] = [
    0x55, 0xaa, 0x00, 0x11, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x02, 0x80, 0x01, 0x03,
    0xe8, 0x00, 0x4a, 0x02, 0xcc,
];

/// The inverter answers a values request with the identifier of the request.
pub const VALUES_RESPONSE_ID: MessageId = MessageId([
    VALUES_REQUEST[ID_OFFSET],
    VALUES_REQUEST[ID_OFFSET + 1],
    VALUES_REQUEST[ID_OFFSET + 2],
]);

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 3]);

impl MessageId {
    fn from_frame(input: &[u8]) -> Self {
        let mut id = [0; 3];
        id.copy_from_slice(&input[ID_OFFSET..ID_OFFSET + 3]);
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Utils::hex(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// Outbound messages. All of them are fixed templates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Advertisement,
    ModelInfo,
    Values,
}

impl Request {
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            Request::Advertisement => &ADVERTISEMENT,
            Request::ModelInfo => &MODEL_INFO_REQUEST,
            Request::Values => &VALUES_REQUEST,
        }
    }

    /// Identifier a response must carry to answer this request, `None` when
    /// any response will do.
    pub fn response_id(&self) -> Option<MessageId> {
        match self {
            Request::Values => Some(VALUES_RESPONSE_ID),
            Request::Advertisement | Request::ModelInfo => None,
        }
    }
}

/// One decoded inbound frame. Never modified after decoding.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    header: Bytes,
    message_id: MessageId,
    payload: Bytes,
    terminator: [u8; 2],
    checksum: u16,
}

impl Frame {
    /// Slices a complete frame into its parts. The payload size comes from the
    /// length byte; the checksum is computed but not enforced.
    pub fn decode(input: &[u8]) -> Result<Self, Error> {
        let len = input.len();
        if len < MIN_FRAME_LEN {
            return Err(Error::MalformedFrame(format!(
                "{} bytes is shorter than the minimum of {}",
                len, MIN_FRAME_LEN
            )));
        }

        if input[0..2] != PREAMBLE {
            return Err(Error::MalformedFrame(format!(
                "invalid preamble {}",
                Utils::hex(&input[0..2])
            )));
        }

        let payload_len = input[LENGTH_OFFSET] as usize;
        let payload_end = PAYLOAD_OFFSET + payload_len;
        if len < payload_end + TERMINATOR_LEN {
            return Err(Error::MalformedFrame(format!(
                "length byte says {} payload bytes but frame is only {} bytes",
                payload_len, len
            )));
        }

        let mut terminator = [0; 2];
        terminator.copy_from_slice(&input[payload_end..payload_end + TERMINATOR_LEN]);

        Ok(Self {
            header: Bytes::copy_from_slice(&input[HEADER_START..HEADER_END]),
            message_id: MessageId::from_frame(input),
            payload: Bytes::copy_from_slice(&input[PAYLOAD_OFFSET..payload_end]),
            terminator,
            checksum: Utils::checksum(&input[..payload_end]),
        })
    }

    /// Builds a well-formed frame carrying `payload`, the way an inverter
    /// would answer.
    pub fn build(message_id: MessageId, payload: &[u8]) -> Result<Bytes, Error> {
        let payload_len = u8::try_from(payload.len()).map_err(|_| {
            Error::MalformedFrame(format!("payload of {} bytes is too long", payload.len()))
        })?;

        let mut r = BytesMut::with_capacity(MIN_FRAME_LEN + payload.len());
        r.put_slice(&PREAMBLE);
        r.put_bytes(0, PAYLOAD_OFFSET - PREAMBLE.len());
        r[4] = 0x01;
        r[ID_OFFSET..ID_OFFSET + 3].copy_from_slice(&message_id.0);
        r[LENGTH_OFFSET] = payload_len;
        r.put_slice(payload);
        let checksum = Utils::checksum(&r);
        r.put_u16(checksum);

        Ok(r.freeze())
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn terminator(&self) -> [u8; 2] {
        self.terminator
    }

    pub fn checksum_ok(&self) -> bool {
        u16::from_be_bytes(self.terminator) == self.checksum
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.message_id)
            .field("header", &Utils::hex(&self.header))
            .field("payload", &Utils::hex(&self.payload))
            .field("terminator", &Utils::hex(&self.terminator))
            .finish()
    }
}

/// Splits a byte stream into raw frames and writes request templates.
///
/// Bytes before a preamble are thrown away so the stream can recover from
/// noise. A preamble whose frame fails its checksum is skipped when a
/// checksummed frame follows it in the buffer; otherwise the frame is passed
/// on and structural checks are left to [`Frame::decode`].
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match src.windows(2).position(|w| w == PREAMBLE) {
                Some(0) => {}
                Some(n) => {
                    warn!("discarding {} bytes before frame preamble", n);
                    src.advance(n);
                }
                None => {
                    // a trailing 0x55 may be the first half of the next preamble
                    let keep = usize::from(src.last() == Some(&PREAMBLE[0]));
                    let discard = src.len() - keep;
                    if discard > 0 {
                        warn!("discarding {} bytes without frame preamble", discard);
                        src.advance(discard);
                    }
                    return Ok(None);
                }
            }

            if src.len() < MIN_FRAME_LEN {
                src.reserve(MIN_FRAME_LEN - src.len());
                return Ok(None);
            }

            let frame_len = MIN_FRAME_LEN + src[LENGTH_OFFSET] as usize;
            if Self::checked_frame_len(&src[..]) == Some(frame_len) {
                return Ok(Some(src.split_to(frame_len)));
            }

            // the preamble may belong to device chatter rather than a frame
            match Self::next_candidate(&src[..]) {
                Candidate::Complete(n) => {
                    warn!("discarding {} bytes of a false frame start", n);
                    src.advance(n);
                    continue;
                }
                Candidate::Partial => return Ok(None),
                Candidate::Missing => {}
            }

            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            // complete but with a bad checksum, the session reports it
            return Ok(Some(src.split_to(frame_len)));
        }
    }
}

enum Candidate {
    // a checksummed frame starts at this offset
    Complete(usize),
    // a later preamble whose frame has not fully arrived
    Partial,
    Missing,
}

impl FrameCodec {
    // Length of the frame at the start of `src` when it is complete and its
    // checksum matches.
    fn checked_frame_len(src: &[u8]) -> Option<usize> {
        if src.len() < MIN_FRAME_LEN || src[..2] != PREAMBLE {
            return None;
        }
        let frame_len = MIN_FRAME_LEN + src[LENGTH_OFFSET] as usize;
        let body_end = frame_len - TERMINATOR_LEN;
        let terminator = src.get(body_end..frame_len)?;
        (Utils::checksum(&src[..body_end]).to_be_bytes() == terminator).then_some(frame_len)
    }

    fn next_candidate(src: &[u8]) -> Candidate {
        let mut partial = false;
        for i in 1..src.len().saturating_sub(1) {
            if src[i..i + 2] != PREAMBLE {
                continue;
            }
            let rest = &src[i..];
            if Self::checked_frame_len(rest).is_some() {
                return Candidate::Complete(i);
            }
            if rest.len() < MIN_FRAME_LEN
                || rest.len() < MIN_FRAME_LEN + rest[LENGTH_OFFSET] as usize
            {
                partial = true;
            }
        }

        if partial {
            Candidate::Partial
        } else {
            Candidate::Missing
        }
    }
}

impl Encoder<Request> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(request.bytes());
        Ok(())
    }
}
