//! MySQL packet primitives and server-reply parsing.
//!
//! Only the packets the bulk-ingestion paths have to understand are modeled
//! here: OK, ERR, EOF, the LOCAL INFILE request, and column definitions for
//! the destination-metadata query.
//! Reference: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basics.html

use crate::error::{Error, Result};
use crate::value::ValueType;
use bytes::{Buf, BufMut, BytesMut};

/// Largest payload a single MySQL packet can carry.
pub const MAX_PAYLOAD: usize = 0xFF_FFFF;

/// COM_QUERY command byte.
pub const COM_QUERY: u8 = 0x03;

// Capability flags
pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

/// Character set id the server uses to mark binary string columns.
const BINARY_CHARSET: u16 = 63;

/// Column flag marking unsigned numeric columns.
const UNSIGNED_FLAG: u16 = 1 << 5;

/// Capability bits negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u32);

impl Capabilities {
    pub fn local_files(self) -> bool {
        self.0 & CLIENT_LOCAL_FILES != 0
    }

    pub fn protocol_41(self) -> bool {
        self.0 & CLIENT_PROTOCOL_41 != 0
    }

    pub fn deprecate_eof(self) -> bool {
        self.0 & CLIENT_DEPRECATE_EOF != 0
    }
}

/// OK packet
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn into_error(self) -> Error {
        Error::Server {
            code: self.code,
            sql_state: self.sql_state,
            message: self.message,
        }
    }
}

/// Request for the client to stream a file, following a LOCAL INFILE
/// statement. The filename echoes whatever the statement named and is
/// advisory only.
#[derive(Debug, Clone)]
pub struct LocalInfileRequest {
    pub filename: Vec<u8>,
}

/// Column definition packet (result-set metadata).
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub name: String,
    pub character_set: u16,
    pub column_type: u8,
    pub flags: u16,
}

impl ColumnDefinition {
    /// Logical type the column expects in the row stream.
    pub fn value_type(&self) -> ValueType {
        match self.column_type {
            // TINY, SHORT, LONG, LONGLONG, INT24, YEAR
            0x01 | 0x02 | 0x03 | 0x08 | 0x09 | 0x0d => {
                if self.flags & UNSIGNED_FLAG != 0 {
                    ValueType::UInt
                } else {
                    ValueType::Int
                }
            }
            0x04 => ValueType::Float,
            0x05 => ValueType::Double,
            // DECIMAL, NEWDECIMAL
            0x00 | 0xf6 => ValueType::Decimal,
            0x0a => ValueType::Date,
            0x0b => ValueType::Time,
            // TIMESTAMP, DATETIME
            0x07 | 0x0c => ValueType::DateTime,
            // BIT, blobs, VAR_STRING, STRING, GEOMETRY
            0x10 | 0xf9..=0xfc | 0xfd | 0xfe | 0xff => {
                if self.character_set == BINARY_CHARSET {
                    ValueType::Bytes
                } else {
                    ValueType::Text
                }
            }
            // VARCHAR, JSON, ENUM, SET and anything unrecognized travel as text
            _ => ValueType::Text,
        }
    }

    /// True for columns whose bytes must be hex-encoded in the stream and
    /// decoded server-side through `UNHEX`.
    pub fn is_binary(&self) -> bool {
        matches!(self.value_type(), ValueType::Bytes)
    }
}

/// One server reply, classified as far as the bulk paths need.
#[derive(Debug)]
pub enum ServerReply {
    Ok(OkPacket),
    Err(ErrPacket),
    LocalInfile(LocalInfileRequest),
    /// Anything else (e.g. a result-set header).
    Raw(BytesMut),
}

impl ServerReply {
    pub fn parse(mut payload: BytesMut, capabilities: Capabilities) -> Result<ServerReply> {
        match payload.first().copied() {
            Some(0x00) => Ok(ServerReply::Ok(parse_ok_packet(&mut payload, capabilities)?)),
            Some(0xff) => Ok(ServerReply::Err(parse_err_packet(&mut payload, capabilities)?)),
            Some(0xfb) => Ok(ServerReply::LocalInfile(parse_local_infile_request(
                &mut payload,
            )?)),
            Some(_) => Ok(ServerReply::Raw(payload)),
            None => Err(Error::Protocol("empty server reply".to_string())),
        }
    }
}

/// Writes the 4-byte packet header: 3-byte little-endian length plus the
/// sequence id.
pub fn write_packet_header(dst: &mut BytesMut, payload_len: usize, sequence_id: u8) {
    dst.put_u8((payload_len & 0xff) as u8);
    dst.put_u8(((payload_len >> 8) & 0xff) as u8);
    dst.put_u8(((payload_len >> 16) & 0xff) as u8);
    dst.put_u8(sequence_id);
}

/// Decodes a packet header into `(payload_len, sequence_id)`.
pub fn read_packet_header(header: [u8; 4]) -> (usize, u8) {
    let len = (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    (len, header[3])
}

fn need(buf: &BytesMut, n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(Error::Protocol(format!(
            "truncated packet: need {} more bytes, have {}",
            n,
            buf.len()
        )));
    }
    Ok(())
}

/// Reads a length-encoded integer from the front of `buf`.
pub fn read_lenenc_int(buf: &mut BytesMut) -> Result<u64> {
    need(buf, 1)?;
    let first = buf.get_u8();
    match first {
        0..=0xfa => Ok(first as u64),
        0xfc => {
            need(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        0xfd => {
            need(buf, 3)?;
            let (a, b, c) = (buf.get_u8() as u64, buf.get_u8() as u64, buf.get_u8() as u64);
            Ok(a | (b << 8) | (c << 16))
        }
        0xfe => {
            need(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        0xfb => Ok(0), // NULL marker in row data
        0xff => Err(Error::Protocol(
            "invalid length-encoded integer marker 0xff".to_string(),
        )),
    }
}

fn read_lenenc_string(buf: &mut BytesMut) -> Result<BytesMut> {
    let len = read_lenenc_int(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

// ============================================================================
// Parsing
// ============================================================================

pub fn parse_ok_packet(buf: &mut BytesMut, capabilities: Capabilities) -> Result<OkPacket> {
    need(buf, 1)?;
    buf.advance(1); // header 0x00 (or 0xfe for a DEPRECATE_EOF terminator)
    let affected_rows = read_lenenc_int(buf)?;
    let last_insert_id = read_lenenc_int(buf)?;

    let (status_flags, warnings) = if capabilities.protocol_41() {
        need(buf, 4)?;
        (buf.get_u16_le(), buf.get_u16_le())
    } else {
        (0, 0)
    };

    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
    })
}

pub fn parse_err_packet(buf: &mut BytesMut, capabilities: Capabilities) -> Result<ErrPacket> {
    need(buf, 3)?;
    buf.advance(1); // header 0xff
    let code = buf.get_u16_le();

    let sql_state = if capabilities.protocol_41() {
        need(buf, 6)?;
        buf.advance(1); // '#' marker
        let state = buf.split_to(5);
        String::from_utf8_lossy(&state).to_string()
    } else {
        String::new()
    };

    let message = String::from_utf8_lossy(&buf.split()).to_string();

    Ok(ErrPacket {
        code,
        sql_state,
        message,
    })
}

pub fn parse_local_infile_request(buf: &mut BytesMut) -> Result<LocalInfileRequest> {
    need(buf, 1)?;
    let header = buf.get_u8();
    if header != 0xfb {
        return Err(Error::Protocol(format!(
            "expected 0xfb (local infile request) but found 0x{:02x}",
            header
        )));
    }
    Ok(LocalInfileRequest {
        filename: buf.split().to_vec(),
    })
}

pub fn parse_column_definition(buf: &mut BytesMut) -> Result<ColumnDefinition> {
    let _catalog = read_lenenc_string(buf)?;
    let _schema = read_lenenc_string(buf)?;
    let _table = read_lenenc_string(buf)?;
    let _org_table = read_lenenc_string(buf)?;
    let name = read_lenenc_string(buf)?;
    let _org_name = read_lenenc_string(buf)?;
    need(buf, 13)?;
    buf.advance(1); // length of fixed fields [0c]
    let character_set = buf.get_u16_le();
    let _column_length = buf.get_u32_le();
    let column_type = buf.get_u8();
    let flags = buf.get_u16_le();
    let _decimals = buf.get_u8();
    buf.advance(2); // filler

    Ok(ColumnDefinition {
        name: String::from_utf8_lossy(&name).to_string(),
        character_set,
        column_type,
        flags,
    })
}
