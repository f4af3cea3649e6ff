//! UDP 헤더 (8바이트, big-endian)

use bytes::Bytes;

use crate::packet::Packet;
use crate::UDP6_HEADER_SIZE;

/// UDP 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// 헤더 포함 길이
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn new(source_port: u16, destination_port: u16, payload_len: usize) -> Self {
        Self {
            source_port,
            destination_port,
            length: (UDP6_HEADER_SIZE + payload_len) as u16,
            checksum: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; UDP6_HEADER_SIZE] {
        let mut buf = [0u8; UDP6_HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; UDP6_HEADER_SIZE]) -> Self {
        Self {
            source_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            destination_port: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
        }
    }

    /// 패킷 앞에서 헤더 읽기 (짧으면 None)
    pub fn parse(packet: &Packet) -> Option<Self> {
        packet
            .copy_prefix::<UDP6_HEADER_SIZE>()
            .map(|bytes| Self::from_bytes(&bytes))
    }

    pub fn to_block(&self) -> Bytes {
        Bytes::copy_from_slice(&self.to_bytes())
    }
}
