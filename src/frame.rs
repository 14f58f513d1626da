use color_eyre::eyre;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ESC: u8 = 0x1B;

pub const HEADER_LEN: usize = 8;
const SEQUENCE_WRAP: u16 = 65_000;

/// Parsed device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sequence: u16,
    pub msg_type: u16,
    pub status: u16,
    pub data: Vec<u8>,
}

/// Message sequence numbers; wrap back to 1 after 65000.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    current: u16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { current: 1 }
    }

    pub fn next(&mut self) -> u16 {
        self.current = if self.current > SEQUENCE_WRAP {
            1
        } else {
            self.current + 1
        };
        self.current
    }
}

pub fn checksum(message: &[u8]) -> u8 {
    let sum = message
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte));
    sum.wrapping_neg()
}

pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for &byte in data {
        if matches!(byte, STX | ETX | ESC) {
            out.push(ESC);
        }
        out.push(byte);
    }
    out
}

pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte == ESC
            && let Some(escaped) = bytes.next()
        {
            out.push(escaped);
            continue;
        }
        out.push(byte);
    }
    out
}

pub fn build_frame(sequence: u16, msg_type: u16, payload: &[u8]) -> eyre::Result<Vec<u8>> {
    let length = u16::try_from(HEADER_LEN + payload.len())
        .map_err(|_| eyre::eyre!("payload too large: {} bytes", payload.len()))?;
    let [len_hi, len_lo] = length.to_be_bytes();
    let [seq_hi, seq_lo] = sequence.to_be_bytes();
    let [type_hi, type_lo] = msg_type.to_be_bytes();

    let mut message = Vec::with_capacity(HEADER_LEN + payload.len());
    message.extend_from_slice(&[len_hi, len_lo, 0, seq_hi, seq_lo, 0, type_hi, type_lo]);
    message.extend_from_slice(payload);
    message[2] = checksum(&message);

    let mut frame = Vec::with_capacity(message.len() + 4);
    frame.push(STX);
    frame.extend(escape(&message));
    frame.push(ETX);
    Ok(frame)
}

/// Locate the first complete `STX .. ETX` frame in `buffer`.
///
/// Returns the inclusive byte range. An ETX preceded by ESC is payload.
pub fn find_frame(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.iter().position(|&byte| byte == STX)?;
    let mut index = start + 1;
    while index < buffer.len() {
        match buffer[index] {
            ESC => index += 2,
            ETX => return Some((start, index)),
            _ => index += 1,
        }
    }
    None
}

pub fn parse_frame(frame: &[u8]) -> eyre::Result<Response> {
    if frame.len() < 2 || frame[0] != STX || frame[frame.len() - 1] != ETX {
        return Err(eyre::eyre!("frame is not delimited by STX/ETX"));
    }
    let message = unescape(&frame[1..frame.len() - 1]);
    if message.len() < HEADER_LEN {
        return Err(eyre::eyre!(
            "response too short: {} bytes",
            message.len()
        ));
    }
    if checksum(&message) != 0 {
        return Err(eyre::eyre!(
            "invalid response checksum: 0x{:02X}",
            message[2]
        ));
    }

    let sequence = u16::from_be_bytes([message[3], message[4]]);
    let msg_type = u16::from_be_bytes([message[6], message[7]]);
    let (status, data) = if message.len() >= HEADER_LEN + 2 {
        (
            u16::from_be_bytes([message[8], message[9]]),
            message[HEADER_LEN + 2..].to_vec(),
        )
    } else {
        (0, Vec::new())
    };

    Ok(Response {
        sequence,
        msg_type,
        status,
        data,
    })
}
