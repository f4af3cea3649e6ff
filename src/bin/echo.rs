//! UDP6 에코 데모
//!
//! 루프백 IP 위에서 두 인스턴스가 데이터그램을 주고받는다.
//! - 서버: [::1]:PORT 에 바인딩, 받은 데이터그램을 발신지로 되돌려 보냄
//! - 클라이언트: 자동 할당 포트, 원격 = 서버
//!
//! 사용법:
//!   cargo run --release --bin udp6-echo -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin udp6-echo -- --count 100 --size 1200
//!   RUST_LOG=udp6=debug cargo run --bin udp6-echo -- -n 3

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use udp6::{
    Error, InstanceConfig, LoopbackIp, ReceiveToken, RxData, Service, ServiceConfig, SessionData,
    TransmitToken, TxData, Udp6Protocol, UDP6_MAX_PAYLOAD,
};

/// 데모 설정
struct EchoConfig {
    count: usize,
    size: usize,
    port: u16,
    timeout: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            count: 10,
            size: 512,
            port: 7,
            timeout: Duration::from_millis(1000),
        }
    }
}

fn parse_args() -> EchoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-n" => {
                if i + 1 < args.len() {
                    config.count = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--size" | "-s" => {
                if i + 1 < args.len() {
                    config.size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    config.port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--timeout-ms" | "-t" => {
                if i + 1 < args.len() {
                    let ms: u64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    config.timeout = Duration::from_millis(ms);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"UDP6 Echo - UDP-over-IPv6 엔진 루프백 데모

사용법:
  cargo run --release --bin udp6-echo -- [OPTIONS]

옵션:
  -n, --count <N>          보낼 데이터그램 수 (기본: 10)
  -s, --size <BYTES>       페이로드 크기 (기본: 512, 최대 65527)
  -p, --port <PORT>        서버 포트 (기본: 7)
  -t, --timeout-ms <MS>    왕복 대기 및 수신 타임아웃 (기본: 1000)
  -h, --help               이 도움말 출력

로그 레벨은 RUST_LOG 환경 변수로 지정 (예: RUST_LOG=udp6=debug)
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 순번이 들어간 페이로드
fn make_payload(seq: usize, size: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u64(seq as u64);
    while buf.len() < size {
        buf.put_u8((buf.len() % 251) as u8);
    }
    buf.truncate(size);
    buf.freeze()
}

/// 토큰이 완료될 때까지 하위 계층 구동
async fn drive<F>(service: &Service, done: F, timeout: Duration) -> Result<(), Error>
where
    F: Fn() -> bool,
{
    let result = tokio::time::timeout(timeout, async {
        while !done() {
            service.poll()?;
            tokio::task::yield_now().await;
        }
        Ok::<(), Error>(())
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => Err(Error::NotReady),
    }
}

fn received(token: &ReceiveToken) -> Result<RxData, Error> {
    token.take().unwrap_or(Err(Error::NotReady))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut opts = parse_args();
    opts.size = opts.size.clamp(1, UDP6_MAX_PAYLOAD);
    info!(
        "UDP6 echo: {} datagrams x {} bytes, port {}",
        opts.count, opts.size, opts.port
    );

    let ip = Arc::new(LoopbackIp::new().with_echo());
    let service = Service::new(ServiceConfig::default(), ip)?;
    service.spawn_timer();

    let server = service.create_instance();
    server.configure(Some(
        &InstanceConfig::bound(Ipv6Addr::LOCALHOST, opts.port).with_receive_timeout(opts.timeout),
    ))?;

    let client = service.create_instance();
    client.configure(Some(
        &InstanceConfig::bound(Ipv6Addr::LOCALHOST, 0)
            .with_remote(Ipv6Addr::LOCALHOST, opts.port)
            .with_receive_timeout(opts.timeout),
    ))?;
    let client_port = client.mode_data()?.config.station_port;
    info!("client bound to [::1]:{}", client_port);

    let start = Instant::now();
    let mut echoed = 0usize;
    let mut rtt_total = Duration::ZERO;

    for seq in 0..opts.count {
        let payload = make_payload(seq, opts.size);
        let sent_at = Instant::now();

        let request = ReceiveToken::new();
        server.receive(&request)?;
        let reply = ReceiveToken::new();
        client.receive(&reply)?;

        let tx = TransmitToken::new(TxData::new(payload.clone()));
        client.transmit(&tx)?;

        if let Err(e) = drive(&service, || request.is_complete(), opts.timeout).await {
            warn!("#{} 서버 수신 실패: {}", seq, e);
            client.cancel(None)?;
            server.cancel(None)?;
            continue;
        }

        let rx = received(&request)?;
        let back = SessionData::to(rx.session.source_address, rx.session.source_port);
        let echo = TransmitToken::new(TxData::new(rx.payload()).with_session(back));
        rx.recycle();
        server.transmit(&echo)?;

        if let Err(e) = drive(&service, || reply.is_complete(), opts.timeout).await {
            warn!("#{} 응답 대기 실패: {}", seq, e);
            client.cancel(None)?;
            continue;
        }

        let answer = received(&reply)?;
        if answer.payload() == payload {
            echoed += 1;
            rtt_total += sent_at.elapsed();
        } else {
            warn!("#{} 페이로드 불일치", seq);
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Echo Complete ===");
    println!("Echoed: {}/{}", echoed, opts.count);
    println!("Elapsed: {:.2}ms", elapsed.as_secs_f64() * 1000.0);
    if echoed > 0 {
        println!(
            "Avg RTT: {:.1}us",
            rtt_total.as_secs_f64() * 1_000_000.0 / echoed as f64
        );
    }
    println!("{}", service.stats().summary());

    client.close();
    server.close();
    service.shutdown();
    Ok(())
}
