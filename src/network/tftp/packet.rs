// file: src/network/tftp/packet.rs
// version: 1.0.0
// guid: 2a3b4c5d-6e7f-4a8b-9c0d-1e2f3a4b5c6d

//! TFTP packets (RFC 1350 read subset)

use crate::error::K8sInitError;
use crate::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;

pub const BLOCK_SIZE: usize = 512;

pub const ERR_NOT_DEFINED: u16 = 0;
pub const ERR_FILE_NOT_FOUND: u16 = 1;
pub const ERR_ILLEGAL_OPERATION: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    ReadRequest { filename: String, mode: String },
    WriteRequest { filename: String, mode: String },
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: u16, message: String },
}

fn take_cstring(buf: &mut Bytes) -> Result<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| K8sInitError::network("unterminated tftp string"))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

impl TftpPacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(K8sInitError::network(format!(
                "tftp packet too short: {} bytes",
                data.len()
            )));
        }
        let mut buf = Bytes::copy_from_slice(data);
        let opcode = buf.get_u16();
        Ok(match opcode {
            OPCODE_RRQ | OPCODE_WRQ => {
                let filename = take_cstring(&mut buf)?;
                let mode = take_cstring(&mut buf)?.to_ascii_lowercase();
                if opcode == OPCODE_RRQ {
                    TftpPacket::ReadRequest { filename, mode }
                } else {
                    TftpPacket::WriteRequest { filename, mode }
                }
            }
            OPCODE_DATA => TftpPacket::Data {
                block: buf.get_u16(),
                payload: buf,
            },
            OPCODE_ACK => TftpPacket::Ack {
                block: buf.get_u16(),
            },
            OPCODE_ERROR => {
                let code = buf.get_u16();
                let message = if buf.is_empty() {
                    String::new()
                } else {
                    take_cstring(&mut buf)?
                };
                TftpPacket::Error { code, message }
            }
            other => {
                return Err(K8sInitError::network(format!("unknown tftp opcode {}", other)))
            }
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + BLOCK_SIZE);
        match self {
            TftpPacket::ReadRequest { filename, mode }
            | TftpPacket::WriteRequest { filename, mode } => {
                let opcode = if matches!(self, TftpPacket::ReadRequest { .. }) {
                    OPCODE_RRQ
                } else {
                    OPCODE_WRQ
                };
                buf.put_u16(opcode);
                buf.put_slice(filename.as_bytes());
                buf.put_u8(0);
                buf.put_slice(mode.as_bytes());
                buf.put_u8(0);
            }
            TftpPacket::Data { block, payload } => {
                buf.put_u16(OPCODE_DATA);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            TftpPacket::Ack { block } => {
                buf.put_u16(OPCODE_ACK);
                buf.put_u16(*block);
            }
            TftpPacket::Error { code, message } => {
                buf.put_u16(OPCODE_ERROR);
                buf.put_u16(*code);
                buf.put_slice(message.as_bytes());
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }
}
