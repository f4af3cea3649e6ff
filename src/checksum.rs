//! 인터넷 체크섬 (one's complement)
//!
//! - IPv6 pseudo-header: source(16) + destination(16) + upper-layer length(4) + next header(4)
//! - 길이를 제외한 pseudo-header 합은 인스턴스 구성 시 한 번 계산해 캐시
//! - 블록 경계가 홀수여도 바이트 패리티를 이어서 합산

use std::net::Ipv6Addr;

use bytes::Bytes;

use crate::packet::Packet;

/// one's complement 누산기
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u64,
    /// 이전 블록에서 남은 상위 바이트
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// 캐시된 부분합에서 시작
    pub fn from_seed(seed: u16) -> Self {
        Self {
            sum: seed as u64,
            pending: None,
        }
    }

    pub fn add_u16(&mut self, value: u16) {
        self.sum += value as u64;
    }

    pub fn add_u32(&mut self, value: u32) {
        self.sum += (value >> 16) as u64;
        self.sum += (value & 0xFFFF) as u64;
    }

    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if let Some(high) = self.pending.take() {
            self.sum += u16::from_be_bytes([high, data[0]]) as u64;
            data = &data[1..];
        }

        let mut words = data.chunks_exact(2);
        for word in &mut words {
            self.sum += u16::from_be_bytes([word[0], word[1]]) as u64;
        }

        if let Some(&last) = words.remainder().first() {
            self.pending = Some(last);
        }
    }

    pub fn add_blocks<'a, I>(&mut self, blocks: I)
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        for block in blocks {
            self.add_bytes(block);
        }
    }

    /// 16비트로 접은 합 (보수 전)
    pub fn fold(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(high) = self.pending {
            sum += (high as u64) << 8;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    /// 최종 체크섬 (합의 보수)
    pub fn finish(&self) -> u16 {
        !self.fold()
    }
}

/// 길이를 제외한 IPv6 pseudo-header 부분합
pub fn pseudo_header_sum(source: &Ipv6Addr, destination: &Ipv6Addr, next_header: u8) -> u16 {
    let mut ck = Checksum::new();
    ck.add_bytes(&source.octets());
    ck.add_bytes(&destination.octets());
    ck.add_u16(next_header as u16);
    ck.fold()
}

/// 캐시된 부분합 + 길이 + 세그먼트로 전송할 체크섬 계산
///
/// 계산 결과가 0이면 0xFFFF로 보낸다 (IPv6에서 UDP 체크섬은 필수).
pub fn transport_checksum<'a, I>(seed: u16, length: u32, blocks: I) -> u16
where
    I: IntoIterator<Item = &'a Bytes>,
{
    let mut ck = Checksum::from_seed(seed);
    ck.add_u32(length);
    ck.add_blocks(blocks);
    match ck.finish() {
        0 => 0xFFFF,
        value => value,
    }
}

/// 수신 세그먼트 검증 (체크섬 필드 포함 합이 0xFFFF여야 함)
pub fn verify(seed: u16, packet: &Packet) -> bool {
    let mut ck = Checksum::from_seed(seed);
    ck.add_u32(packet.len() as u32);
    ck.add_blocks(packet.blocks());
    ck.finish() == 0
}

/// 주소/프로토콜로부터 바로 계산 (ICMPv6, 하위 계층 체크섬 채우기용)
pub fn compute(
    source: &Ipv6Addr,
    destination: &Ipv6Addr,
    next_header: u8,
    segment: &[u8],
) -> u16 {
    let seed = pseudo_header_sum(source, destination, next_header);
    let mut ck = Checksum::from_seed(seed);
    ck.add_u32(segment.len() as u32);
    ck.add_bytes(segment);
    match ck.finish() {
        0 => 0xFFFF,
        value => value,
    }
}
