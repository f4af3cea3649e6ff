//! 포트 할당/바인딩
//!
//! - accept_any_port: 예약 없이 항상 성공
//! - 지정 포트: 같은 (주소, 포트)를 다른 인스턴스가 쓰면 거부 (중복 허용 시 통과)
//! - 포트 0: 서비스 공유 커서부터 순환 탐색

use std::net::Ipv6Addr;

use rand::Rng;
use tracing::debug;

use crate::config::InstanceConfig;
use crate::{Error, Result};

/// 자동 할당 포트 커서 (서비스당 하나)
#[derive(Debug, Clone)]
pub struct PortCursor {
    floor: u16,
    next: u16,
}

impl PortCursor {
    /// floor 이상에서 무작위 시작점
    pub fn random(floor: u16) -> Self {
        let span = (u16::MAX - floor).min(1023);
        let offset = rand::thread_rng().gen_range(0..=span);
        Self {
            floor,
            next: floor + offset,
        }
    }

    /// 고정 시작점
    pub fn starting_at(floor: u16, next: u16) -> Self {
        Self {
            floor,
            next: next.max(floor),
        }
    }

    pub fn current(&self) -> u16 {
        self.next
    }

    /// 다음 후보로 이동 (65535 다음은 floor)
    pub fn advance(&mut self) {
        self.next = if self.next == u16::MAX {
            self.floor
        } else {
            self.next + 1
        };
    }
}

/// 설정에 포트를 바인딩 (포트 0이면 할당 결과를 기록)
///
/// `in_use(address, port)`는 다른 구성된 인스턴스가 해당 쌍을 점유했는지 답한다.
pub fn bind<F>(cursor: &mut PortCursor, config: &mut InstanceConfig, in_use: F) -> Result<()>
where
    F: Fn(&Ipv6Addr, u16) -> bool,
{
    if config.accept_any_port {
        return Ok(());
    }

    let address = config.station_address;

    if config.station_port != 0 {
        if !config.allow_duplicate_port && in_use(&address, config.station_port) {
            debug!("포트 충돌: [{}]:{}", address, config.station_port);
            return Err(Error::AccessDenied);
        }
    } else {
        if !config.allow_duplicate_port {
            let start = cursor.current();
            while in_use(&address, cursor.current()) {
                cursor.advance();
                if cursor.current() == start {
                    return Err(Error::OutOfResources);
                }
            }
        }
        config.station_port = cursor.current();
        debug!("포트 할당: [{}]:{}", address, config.station_port);
    }

    cursor.advance();
    Ok(())
}
