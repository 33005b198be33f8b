// file: src/network/dhcp/packet.rs
// version: 1.0.0
// guid: 8c9d0e1f-2a3b-4c4d-9e5f-6a7b8c9d0e1f

//! DHCPv4 message codec (BOOTP header, magic cookie, TLV options)

use crate::error::K8sInitError;
use crate::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

pub const OP_BOOT_REQUEST: u8 = 1;
pub const OP_BOOT_REPLY: u8 = 2;
pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// Smallest BOOTP message most clients accept
pub const MIN_PACKET_LEN: usize = 300;
const HEADER_LEN: usize = 236;
pub const BROADCAST_FLAG: u16 = 0x8000;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS: u8 = 6;
pub const OPT_NTP_SERVERS: u8 = 42;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_TFTP_SERVER_NAME: u8 = 66;
pub const OPT_BOOTFILE_NAME: u8 = 67;
pub const OPT_USER_CLASS: u8 = 77;
pub const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn code(&self) -> u8 {
        match self {
            MessageType::Discover => 1,
            MessageType::Offer => 2,
            MessageType::Request => 3,
            MessageType::Decline => 4,
            MessageType::Ack => 5,
            MessageType::Nak => 6,
            MessageType::Release => 7,
            MessageType::Inform => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    /// Options in wire order, pad and end excluded
    pub options: Vec<(u8, Vec<u8>)>,
}

impl Default for DhcpPacket {
    fn default() -> Self {
        Self {
            op: OP_BOOT_REQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            sname: [0; 64],
            file: [0; 128],
            options: Vec::new(),
        }
    }
}

fn get_addr(buf: &mut Bytes) -> Ipv4Addr {
    Ipv4Addr::from(buf.get_u32())
}

impl DhcpPacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + MAGIC_COOKIE.len() {
            return Err(K8sInitError::network(format!(
                "dhcp packet too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = Bytes::copy_from_slice(data);
        let mut packet = DhcpPacket {
            op: buf.get_u8(),
            htype: buf.get_u8(),
            hlen: buf.get_u8(),
            hops: buf.get_u8(),
            xid: buf.get_u32(),
            secs: buf.get_u16(),
            flags: buf.get_u16(),
            ciaddr: get_addr(&mut buf),
            yiaddr: get_addr(&mut buf),
            siaddr: get_addr(&mut buf),
            giaddr: get_addr(&mut buf),
            ..Default::default()
        };
        buf.copy_to_slice(&mut packet.chaddr);
        buf.copy_to_slice(&mut packet.sname);
        buf.copy_to_slice(&mut packet.file);

        let mut cookie = [0u8; 4];
        buf.copy_to_slice(&mut cookie);
        if cookie != MAGIC_COOKIE {
            return Err(K8sInitError::network("dhcp magic cookie mismatch"));
        }

        while buf.has_remaining() {
            let code = buf.get_u8();
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {}
            }
            if !buf.has_remaining() {
                return Err(K8sInitError::network(format!("truncated dhcp option {}", code)));
            }
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return Err(K8sInitError::network(format!("truncated dhcp option {}", code)));
            }
            let value = buf.split_to(len).to_vec();
            packet.options.push((code, value));
        }

        Ok(packet)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_PACKET_LEN + 64);
        buf.put_u8(self.op);
        buf.put_u8(self.htype);
        buf.put_u8(self.hlen);
        buf.put_u8(self.hops);
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        buf.put_u32(self.ciaddr.into());
        buf.put_u32(self.yiaddr.into());
        buf.put_u32(self.siaddr.into());
        buf.put_u32(self.giaddr.into());
        buf.put_slice(&self.chaddr);
        buf.put_slice(&self.sname);
        buf.put_slice(&self.file);
        buf.put_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            // Values longer than 255 bytes are split per RFC 3396
            for chunk in value.chunks(255) {
                buf.put_u8(*code);
                buf.put_u8(chunk.len() as u8);
                buf.put_slice(chunk);
            }
            if value.is_empty() {
                buf.put_u8(*code);
                buf.put_u8(0);
            }
        }
        buf.put_u8(OPT_END);

        if buf.len() < MIN_PACKET_LEN {
            buf.put_bytes(OPT_PAD, MIN_PACKET_LEN - buf.len());
        }
        buf.freeze()
    }

    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    /// Replace the value of `code`, keeping its position, or append it
    pub fn set_option(&mut self, code: u8, value: Vec<u8>) {
        match self.options.iter_mut().find(|(c, _)| *c == code) {
            Some((_, v)) => *v = value,
            None => self.options.push((code, value)),
        }
    }

    pub fn set_addr_option(&mut self, code: u8, addr: Ipv4Addr) {
        self.set_option(code, addr.octets().to_vec());
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.option(OPT_MESSAGE_TYPE) {
            Some([code]) => MessageType::from_code(*code),
            _ => None,
        }
    }

    pub fn set_message_type(&mut self, mt: MessageType) {
        self.set_option(OPT_MESSAGE_TYPE, vec![mt.code()]);
    }

    /// RFC 3004 user classes. Clients such as iPXE send a bare string
    /// instead of length-prefixed entries; that is returned as one class.
    pub fn user_class(&self) -> Vec<String> {
        let Some(data) = self.option(OPT_USER_CLASS) else {
            return Vec::new();
        };

        let mut classes = Vec::new();
        let mut rest = data;
        while let Some((&len, tail)) = rest.split_first() {
            let len = len as usize;
            if len == 0 || len > tail.len() {
                return vec![String::from_utf8_lossy(data).into_owned()];
            }
            classes.push(String::from_utf8_lossy(&tail[..len]).into_owned());
            rest = &tail[len..];
        }
        classes
    }

    /// Hardware address as `aa:bb:cc:dd:ee:ff`
    pub fn client_hw_addr(&self) -> String {
        let len = (self.hlen as usize).min(self.chaddr.len());
        self.chaddr[..len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Write a NUL terminated string into the BOOTP `file` field
    pub fn set_file(&mut self, name: &str) {
        self.file = [0; 128];
        let bytes = name.as_bytes();
        let len = bytes.len().min(self.file.len() - 1);
        self.file[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn file_name(&self) -> String {
        let end = self.file.iter().position(|b| *b == 0).unwrap_or(self.file.len());
        String::from_utf8_lossy(&self.file[..end]).into_owned()
    }
}
