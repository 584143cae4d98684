//! FastCGI 1.0 record layer.
//!
//! Every record is an 8-byte header followed by `content_length` bytes of
//! content and `padding_length` bytes of padding. Name-value pairs use the
//! 1-or-4 byte length encoding from the protocol.

use std::io::{self, Read, Write};

pub const VERSION_1: u8 = 1;

pub const BEGIN_REQUEST: u8 = 1;
pub const ABORT_REQUEST: u8 = 2;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const STDERR: u8 = 7;
pub const DATA: u8 = 8;
pub const GET_VALUES: u8 = 9;
pub const GET_VALUES_RESULT: u8 = 10;
pub const UNKNOWN_TYPE: u8 = 11;

pub const RESPONDER: u16 = 1;
pub const KEEP_CONN: u8 = 1;

pub const REQUEST_COMPLETE: u8 = 0;
pub const CANT_MPX_CONN: u8 = 1;
pub const UNKNOWN_ROLE: u8 = 3;

/// Management records use request id 0.
pub const NULL_REQUEST_ID: u16 = 0;

/// Largest content a single record can carry.
pub const MAX_CONTENT: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub const LEN: usize = 8;

    pub fn parse(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            version: bytes[0],
            kind: bytes[1],
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.kind,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0,
        ]
    }
}

/// A decoded record with its padding discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

/// Read one record. `Ok(None)` means the peer closed the connection cleanly
/// between records.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<Option<Record>> {
    let mut raw = [0u8; Header::LEN];
    let mut filled = 0;
    while filled < raw.len() {
        match reader.read(&mut raw[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    let header = Header::parse(&raw);
    if header.version != VERSION_1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported FastCGI version {}", header.version),
        ));
    }
    let mut content = vec![0u8; usize::from(header.content_length)];
    reader.read_exact(&mut content)?;
    let mut padding = [0u8; 255];
    reader.read_exact(&mut padding[..usize::from(header.padding_length)])?;
    Ok(Some(Record {
        kind: header.kind,
        request_id: header.request_id,
        content,
    }))
}

/// Write one record, padding the content to a multiple of 8 bytes.
pub fn write_record<W: Write>(
    writer: &mut W,
    kind: u8,
    request_id: u16,
    content: &[u8],
) -> io::Result<()> {
    let content_length = u16::try_from(content.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "record content too large")
    })?;
    #[allow(clippy::cast_possible_truncation)]
    let padding_length = ((8 - content.len() % 8) % 8) as u8;
    let header = Header {
        version: VERSION_1,
        kind,
        request_id,
        content_length,
        padding_length,
    };
    writer.write_all(&header.encode())?;
    writer.write_all(content)?;
    writer.write_all(&[0u8; 8][..usize::from(padding_length)])
}

/// Write `data` as a stream of records of at most [`MAX_CONTENT`] bytes.
/// Does not write the empty terminating record.
pub fn write_stream<W: Write>(
    writer: &mut W,
    kind: u8,
    request_id: u16,
    data: &[u8],
) -> io::Result<()> {
    for chunk in data.chunks(MAX_CONTENT) {
        write_record(writer, kind, request_id, chunk)?;
    }
    Ok(())
}

/// Body of a `BEGIN_REQUEST` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginRequest {
    pub role: u16,
    pub flags: u8,
}

impl BeginRequest {
    pub fn parse(content: &[u8]) -> Option<Self> {
        if content.len() < 8 {
            return None;
        }
        Some(Self {
            role: u16::from_be_bytes([content[0], content[1]]),
            flags: content[2],
        })
    }

    pub fn keep_conn(&self) -> bool {
        self.flags & KEEP_CONN != 0
    }
}

/// Body of an `END_REQUEST` record.
pub fn end_request_body(app_status: u32, protocol_status: u8) -> [u8; 8] {
    let app = app_status.to_be_bytes();
    [app[0], app[1], app[2], app[3], protocol_status, 0, 0, 0]
}

/// Body of an `UNKNOWN_TYPE` record.
pub fn unknown_type_body(kind: u8) -> [u8; 8] {
    [kind, 0, 0, 0, 0, 0, 0, 0]
}

fn read_length(data: &[u8], pos: &mut usize) -> Option<usize> {
    let first = *data.get(*pos)?;
    if first & 0x80 == 0 {
        *pos += 1;
        return Some(usize::from(first));
    }
    let bytes = data.get(*pos..*pos + 4)?;
    *pos += 4;
    let len = u32::from_be_bytes([bytes[0] & 0x7f, bytes[1], bytes[2], bytes[3]]);
    usize::try_from(len).ok()
}

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(len as u8);
    } else {
        #[allow(clippy::cast_possible_truncation)]
        let len = (len as u32) | 0x8000_0000;
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Decode a name-value pair stream. Invalid UTF-8 is replaced.
pub fn decode_pairs(data: &[u8]) -> io::Result<Vec<(String, String)>> {
    let truncated = || io::Error::new(io::ErrorKind::InvalidData, "truncated name-value pair");
    let mut pairs = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let name_len = read_length(data, &mut pos).ok_or_else(truncated)?;
        let value_len = read_length(data, &mut pos).ok_or_else(truncated)?;
        let name = data.get(pos..pos + name_len).ok_or_else(truncated)?;
        pos += name_len;
        let value = data.get(pos..pos + value_len).ok_or_else(truncated)?;
        pos += value_len;
        pairs.push((
            String::from_utf8_lossy(name).into_owned(),
            String::from_utf8_lossy(value).into_owned(),
        ));
    }
    Ok(pairs)
}

pub fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in pairs {
        write_length(&mut out, name.len());
        write_length(&mut out, value.len());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(value.as_bytes());
    }
    out
}
