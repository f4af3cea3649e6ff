//! 서비스 통계

use std::time::{Duration, Instant};

/// 서비스 전체 통계
#[derive(Debug, Clone)]
pub struct UdpStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 하위 계층에서 받은 데이터그램 수
    pub received: u64,

    /// 받은 바이트 (헤더 포함)
    pub received_bytes: u64,

    /// 인스턴스 큐에 넣은 횟수 (팬아웃 포함)
    pub enqueued: u64,

    /// 토큰으로 전달된 데이터그램 수
    pub delivered: u64,

    /// 전달된 페이로드 바이트
    pub delivered_bytes: u64,

    /// 길이 불일치 등으로 버린 수
    pub dropped_malformed: u64,

    /// 체크섬 실패로 버린 수
    pub dropped_checksum: u64,

    /// 일치하는 인스턴스가 없던 수
    pub no_listener: u64,

    /// 타임아웃으로 제거된 수
    pub evicted: u64,

    /// 클라이언트가 회수한 수
    pub recycled: u64,

    /// 받은 ICMP 에러 수
    pub icmp_received: u64,

    /// 소유 인스턴스를 못 찾은 ICMP 에러 수
    pub icmp_unmatched: u64,

    /// 보낸 ICMP 에러 수
    pub icmp_sent: u64,

    /// 하위 계층에 넘긴 송신 수
    pub transmitted: u64,

    /// 송신 바이트 (헤더 포함)
    pub transmitted_bytes: u64,

    /// 성공 완료된 송신 수
    pub transmit_completed: u64,

    /// 실패한 송신 수 (넘기기 실패 포함)
    pub transmit_failed: u64,

    /// 취소된 송신 수
    pub transmit_aborted: u64,
}

impl UdpStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            received: 0,
            received_bytes: 0,
            enqueued: 0,
            delivered: 0,
            delivered_bytes: 0,
            dropped_malformed: 0,
            dropped_checksum: 0,
            no_listener: 0,
            evicted: 0,
            recycled: 0,
            icmp_received: 0,
            icmp_unmatched: 0,
            icmp_sent: 0,
            transmitted: 0,
            transmitted_bytes: 0,
            transmit_completed: 0,
            transmit_failed: 0,
            transmit_aborted: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 수신 처리율 (bytes/sec)
    pub fn receive_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.received_bytes as f64 / elapsed
    }

    /// 송신 처리율 (bytes/sec)
    pub fn transmit_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.transmitted_bytes as f64 / elapsed
    }

    /// 수신 중 버린 비율
    pub fn drop_rate(&self) -> f64 {
        if self.received == 0 {
            return 0.0;
        }
        let dropped = self.dropped_malformed + self.dropped_checksum + self.no_listener;
        dropped as f64 / self.received as f64
    }

    /// 큐에 들어간 것 중 전달된 비율
    pub fn delivery_ratio(&self) -> f64 {
        if self.enqueued == 0 {
            return 0.0;
        }
        self.delivered as f64 / self.enqueued as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Rx: {} ({} B) | Delivered: {}/{} | Evicted: {} | Drops: {:.2}% | Tx: {}/{} ok, {} failed, {} aborted | ICMP in/out: {}/{}",
            self.elapsed().as_secs_f64(),
            self.received,
            self.received_bytes,
            self.delivered,
            self.enqueued,
            self.evicted,
            self.drop_rate() * 100.0,
            self.transmit_completed,
            self.transmitted,
            self.transmit_failed,
            self.transmit_aborted,
            self.icmp_received,
            self.icmp_sent,
        )
    }
}

impl Default for UdpStats {
    fn default() -> Self {
        Self::new()
    }
}
