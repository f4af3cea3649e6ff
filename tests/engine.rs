//! 루프백 IP 위에서 엔진 전체 동작 검증

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use udp6::checksum;
use udp6::header::UdpHeader;
use udp6::loopback::build_udp;
use udp6::{
    Error, Event, IcmpError, Instance, InstanceConfig, Ip6Session, LoopbackIp, ReceiveToken,
    Service, ServiceConfig, SessionData, TransmitToken, TxData, Udp6Protocol, IP_PROTO_ICMPV6,
    IP_PROTO_UDP,
};

fn remote() -> Ipv6Addr {
    "fe80::2".parse().unwrap()
}

fn group() -> Ipv6Addr {
    "ff02::fb".parse().unwrap()
}

fn setup_with(ip: LoopbackIp, config: ServiceConfig) -> (Arc<LoopbackIp>, Service) {
    let ip = Arc::new(ip);
    let service = Service::new(config, ip.clone()).unwrap();
    (ip, service)
}

fn setup() -> (Arc<LoopbackIp>, Service) {
    setup_with(LoopbackIp::new(), ServiceConfig::default())
}

fn bound(service: &Service, config: InstanceConfig) -> Instance {
    let instance = service.create_instance();
    instance.configure(Some(&config)).unwrap();
    instance
}

fn inbound(destination: Ipv6Addr) -> Ip6Session {
    Ip6Session::new(remote(), destination)
}

fn payload_of(token: &ReceiveToken) -> Bytes {
    token.take().expect("완료되지 않음").expect("에러 완료").payload()
}

#[test]
fn test_receive_from_remote() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"0123456789");
    service.poll().unwrap();

    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();
    assert!(token.is_complete());

    let rx = token.take().unwrap().unwrap();
    assert_eq!(rx.data_length, 10);
    assert_eq!(rx.payload(), Bytes::from_static(b"0123456789"));
    assert_eq!(
        rx.session,
        SessionData {
            source_address: remote(),
            source_port: 9999,
            destination_address: Ipv6Addr::LOCALHOST,
            destination_port: 5000,
        }
    );

    assert_eq!(ip.released(), 0);
    rx.recycle();
    assert_eq!(ip.released(), 1);

    let stats = service.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.recycled, 1);
}

#[test]
fn test_unmatched_port_triggers_port_unreachable() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5001, b"0123456789");
    service.poll().unwrap();

    assert!(!token.is_complete());
    assert_eq!(ip.released(), 1);

    let sent = ip.take_sent();
    assert_eq!(sent.len(), 1);
    let icmp = &sent[0];
    assert_eq!(icmp.child, None);
    assert_eq!(icmp.protocol, IP_PROTO_ICMPV6);
    assert_eq!(icmp.icmp_type_code(), Some((1, 4)));
    assert_eq!(icmp.source, Ipv6Addr::LOCALHOST);
    assert_eq!(icmp.destination, remote());

    let stats = service.stats();
    assert_eq!(stats.no_listener, 1);
    assert_eq!(stats.icmp_sent, 1);
}

#[test]
fn test_no_port_unreachable_for_multicast() {
    let (ip, service) = setup();
    let _instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    ip.inject_udp(inbound(group()), 9999, 5353, b"query");
    service.poll().unwrap();

    assert!(ip.sent().is_empty());
    assert_eq!(service.stats().no_listener, 1);
    assert_eq!(ip.released(), 1);
}

#[test]
fn test_receive_tokens_complete_in_order() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    let tokens: Vec<ReceiveToken> = (0..3).map(|_| ReceiveToken::new()).collect();
    for token in &tokens {
        instance.receive(token).unwrap();
    }

    for payload in [&b"one"[..], b"two", b"three"] {
        ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, payload);
    }
    service.poll().unwrap();

    assert_eq!(payload_of(&tokens[0]), Bytes::from_static(b"one"));
    assert_eq!(payload_of(&tokens[1]), Bytes::from_static(b"two"));
    assert_eq!(payload_of(&tokens[2]), Bytes::from_static(b"three"));
}

#[test]
fn test_icmp_error_precedes_queued_data() {
    let (ip, service) = setup();
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"data");
    let original = Ip6Session::new(Ipv6Addr::LOCALHOST, remote());
    let embedded = UdpHeader::new(5000, 9999, 4).to_block();
    ip.inject_icmp(IcmpError::HostUnreachable, original, embedded);
    service.poll().unwrap();

    let first = ReceiveToken::new();
    let second = ReceiveToken::new();
    instance.receive(&first).unwrap();
    instance.receive(&second).unwrap();

    assert_eq!(
        first.take().unwrap().unwrap_err(),
        Error::Icmp(IcmpError::HostUnreachable)
    );
    assert_eq!(payload_of(&second), Bytes::from_static(b"data"));
}

#[test]
fn test_icmp_error_reaches_single_owner() {
    let (ip, service) = setup();
    let owner = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
    let mut promiscuous = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 6000);
    promiscuous.accept_promiscuous = true;
    let bystander = bound(&service, promiscuous);

    let owner_token = ReceiveToken::new();
    let bystander_token = ReceiveToken::new();
    owner.receive(&owner_token).unwrap();
    bystander.receive(&bystander_token).unwrap();

    let original = Ip6Session::new(Ipv6Addr::LOCALHOST, remote());
    ip.inject_icmp(IcmpError::PacketTooBig, original, UdpHeader::new(5000, 9999, 0).to_block());
    ip.inject_icmp(IcmpError::PacketTooBig, original, Bytes::from_static(&[0, 1, 2]));
    service.poll().unwrap();

    assert_eq!(
        owner_token.take().unwrap().unwrap_err(),
        Error::Icmp(IcmpError::PacketTooBig)
    );
    assert!(!bystander_token.is_complete());
    assert_eq!(service.stats().icmp_received, 2);
}

#[test]
fn test_undelivered_datagram_times_out() {
    let (ip, service) = setup();
    let config = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000)
        .with_receive_timeout(Duration::from_millis(100));
    let instance = bound(&service, config);

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"stale");
    service.poll().unwrap();

    service.tick();
    assert_eq!(ip.released(), 0);
    service.tick();
    assert_eq!(ip.released(), 1);
    assert_eq!(service.stats().evicted, 1);

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"fresh");
    service.poll().unwrap();
    service.tick();

    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();
    assert_eq!(payload_of(&token), Bytes::from_static(b"fresh"));
}

#[test]
fn test_second_cancel_is_not_found() {
    let (_ip, service) = setup();
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"payload")));
    instance.transmit(&tx).unwrap();
    instance.cancel(Some(tx.event())).unwrap();
    assert_eq!(instance.cancel(Some(tx.event())), Err(Error::NotFound));

    service.poll().unwrap();
    assert_eq!(tx.status(), Some(Err(Error::Aborted)));

    let rx = ReceiveToken::new();
    instance.receive(&rx).unwrap();
    instance.cancel(Some(rx.event())).unwrap();
    assert_eq!(rx.take().unwrap().unwrap_err(), Error::Aborted);
    assert_eq!(instance.cancel(Some(rx.event())), Err(Error::NotFound));

    assert_eq!(instance.cancel(None), Ok(()));
    assert_eq!(instance.cancel(Some(&Event::new())), Err(Error::NotFound));
}

#[test]
fn test_cancel_all_aborts_everything() {
    let (_ip, service) = setup();
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"x")));
    let rx = ReceiveToken::new();
    instance.transmit(&tx).unwrap();
    instance.receive(&rx).unwrap();

    instance.cancel(None).unwrap();
    assert_eq!(rx.take().unwrap().unwrap_err(), Error::Aborted);
    service.poll().unwrap();
    assert_eq!(tx.status(), Some(Err(Error::Aborted)));
}

#[test]
fn test_port_binding_uniqueness() {
    let (_ip, service) = setup();
    let _first = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    let second = service.create_instance();
    assert_eq!(
        second.configure(Some(&InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000))),
        Err(Error::AccessDenied)
    );

    let mut shared = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000);
    shared.allow_duplicate_port = true;
    second.configure(Some(&shared)).unwrap();

    let other_address = service.create_instance();
    other_address
        .configure(Some(&InstanceConfig::bound("::2".parse().unwrap(), 5000)))
        .unwrap();

    let auto_a = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 0));
    let auto_b = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 0));
    let port_a = auto_a.mode_data().unwrap().config.station_port;
    let port_b = auto_b.mode_data().unwrap().config.station_port;
    assert!(port_a >= 1024 && port_b >= 1024);
    assert_ne!(port_a, port_b);
}

#[test]
fn test_multicast_fan_out_releases_once() {
    let (ip, service) = setup();
    let first = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5353));
    let mut dup = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5353);
    dup.allow_duplicate_port = true;
    let second = bound(&service, dup);

    for instance in [&first, &second] {
        instance.groups(true, Some(group())).unwrap();
    }

    ip.inject_udp(inbound(group()), 9999, 5353, b"announce");
    service.poll().unwrap();
    assert_eq!(service.stats().enqueued, 2);

    let a = ReceiveToken::new();
    first.receive(&a).unwrap();
    let rx_a = a.take().unwrap().unwrap();
    assert_eq!(rx_a.session.destination_address, group());
    assert_eq!(ip.released(), 0);

    let b = ReceiveToken::new();
    second.receive(&b).unwrap();
    let rx_b = b.take().unwrap().unwrap();
    assert_eq!(rx_a.payload(), rx_b.payload());

    rx_a.recycle();
    assert_eq!(ip.released(), 0);
    drop(rx_b);
    assert_eq!(ip.released(), 1);
}

#[test]
fn test_multicast_timeout_on_one_instance_keeps_shared_buffer() {
    let (ip, service) = setup();
    let short = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5353)
        .with_receive_timeout(Duration::from_millis(100));
    let expiring = bound(&service, short);
    let mut dup = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5353);
    dup.allow_duplicate_port = true;
    let consumer = bound(&service, dup);

    for instance in [&expiring, &consumer] {
        instance.groups(true, Some(group())).unwrap();
    }

    ip.inject_udp(inbound(group()), 9999, 5353, b"announce");
    service.poll().unwrap();
    assert_eq!(service.stats().enqueued, 2);

    service.tick();
    service.tick();
    assert_eq!(service.stats().evicted, 1);
    assert_eq!(ip.released(), 0);

    let token = ReceiveToken::new();
    consumer.receive(&token).unwrap();
    let rx = token.take().unwrap().unwrap();
    assert_eq!(rx.payload(), Bytes::from_static(b"announce"));
    assert_eq!(ip.released(), 0);

    rx.recycle();
    assert_eq!(ip.released(), 1);

    let late = ReceiveToken::new();
    expiring.receive(&late).unwrap();
    assert!(!late.is_complete());
}

#[test]
fn test_multicast_needs_membership() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5353));
    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();

    ip.inject_udp(inbound(group()), 9999, 5353, b"ignored");
    service.poll().unwrap();
    assert!(!token.is_complete());

    instance.groups(true, Some(group())).unwrap();
    ip.inject_udp(inbound(group()), 9999, 5353, b"heard");
    service.poll().unwrap();
    assert_eq!(payload_of(&token), Bytes::from_static(b"heard"));
}

#[test]
fn test_groups_validation() {
    let (ip, service) = setup();
    let instance = service.create_instance();
    assert_eq!(instance.groups(true, Some(group())), Err(Error::NotStarted));

    instance
        .configure(Some(&InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000)))
        .unwrap();
    assert!(matches!(instance.groups(true, None), Err(Error::InvalidParameter(_))));
    assert!(matches!(
        instance.groups(true, Some(remote())),
        Err(Error::InvalidParameter(_))
    ));

    instance.groups(true, Some(group())).unwrap();
    assert_eq!(instance.groups(true, Some(group())), Err(Error::AlreadyStarted));
    assert_eq!(ip.groups_of(instance.id()), vec![group()]);

    let other: Ipv6Addr = "ff02::1:3".parse().unwrap();
    assert_eq!(instance.groups(false, Some(other)), Err(Error::NotFound));

    instance.groups(true, Some(other)).unwrap();
    instance.groups(false, None).unwrap();
    assert!(ip.groups_of(instance.id()).is_empty());
}

#[test]
fn test_reset_aborts_outstanding_tokens() {
    let (ip, service) = setup();
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );
    instance.groups(true, Some(group())).unwrap();

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"late")));
    let rx = ReceiveToken::new();
    instance.transmit(&tx).unwrap();
    instance.receive(&rx).unwrap();

    instance.configure(None).unwrap();
    assert_eq!(tx.status(), Some(Err(Error::Aborted)));
    assert_eq!(rx.take().unwrap().unwrap_err(), Error::Aborted);
    assert!(!ip.is_child_configured(instance.id()));
    assert!(ip.groups_of(instance.id()).is_empty());

    // 하위 계층의 늦은 완료는 무시
    service.poll().unwrap();
    assert!(tx.status().is_none());

    assert_eq!(instance.receive(&ReceiveToken::new()), Err(Error::NotStarted));
    assert_eq!(instance.mode_data().unwrap_err(), Error::NotStarted);
}

#[test]
fn test_reconfigure_limited_fields() {
    let (_ip, service) = setup();
    let config = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000);
    let instance = bound(&service, config.clone());

    let mut tuned = config.clone();
    tuned.hop_limit = 8;
    tuned.receive_timeout = Duration::from_secs(2);
    instance.configure(Some(&tuned)).unwrap();

    let mode = instance.mode_data().unwrap();
    assert_eq!(mode.config.hop_limit, 8);
    assert_eq!(mode.ip.hop_limit, 8);
    assert_eq!(mode.config.receive_timeout, Duration::from_secs(2));

    let moved = InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5001);
    assert_eq!(instance.configure(Some(&moved)), Err(Error::AlreadyStarted));

    let multicast_station = InstanceConfig::bound(group(), 5000);
    let fresh = service.create_instance();
    assert!(matches!(
        fresh.configure(Some(&multicast_station)),
        Err(Error::InvalidParameter(_))
    ));
}

#[test]
fn test_unconfigured_instance_rejects_io() {
    let (_ip, service) = setup();
    let instance = service.create_instance();

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"x")));
    assert_eq!(instance.transmit(&tx), Err(Error::NotStarted));
    assert_eq!(instance.receive(&ReceiveToken::new()), Err(Error::NotStarted));
    assert_eq!(instance.cancel(None), Err(Error::NotStarted));
    assert_eq!(instance.mode_data().unwrap_err(), Error::NotStarted);
    assert!(!instance.ip_mode_data().unwrap().is_configured);

    // 구성되지 않은 리셋은 무시
    assert_eq!(instance.configure(None), Ok(()));
}

#[test]
fn test_duplicate_tokens_and_queue_caps() {
    let config = ServiceConfig {
        max_receive_tokens: 2,
        max_transmit_tokens: 1,
        ..ServiceConfig::default()
    };
    let (_ip, service) = setup_with(LoopbackIp::new(), config);
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );

    let event = Event::new();
    let rx = ReceiveToken::with_event(event.clone());
    instance.receive(&rx).unwrap();
    assert_eq!(instance.receive(&rx), Err(Error::AccessDenied));

    let sharing = TransmitToken::with_event(event, TxData::new(Bytes::from_static(b"x")));
    assert_eq!(instance.transmit(&sharing), Err(Error::AccessDenied));

    instance.receive(&ReceiveToken::new()).unwrap();
    assert_eq!(instance.receive(&ReceiveToken::new()), Err(Error::NotReady));

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"a")));
    instance.transmit(&tx).unwrap();
    let blocked = TransmitToken::new(TxData::new(Bytes::from_static(b"b")));
    assert_eq!(instance.transmit(&blocked), Err(Error::NotReady));
}

#[test]
fn test_transmit_over_echo_loopback() {
    let (ip, service) = setup_with(LoopbackIp::new().with_echo(), ServiceConfig::default());
    let listener = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 6000));
    let sender = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::UNSPECIFIED, 0).with_remote(Ipv6Addr::LOCALHOST, 6000),
    );
    let sender_port = sender.mode_data().unwrap().config.station_port;

    let rx = ReceiveToken::new();
    listener.receive(&rx).unwrap();

    let tx = TransmitToken::new(TxData::from_fragments(vec![
        Bytes::from_static(b"hello "),
        Bytes::from_static(b"ipv6"),
    ]));
    sender.transmit(&tx).unwrap();
    service.poll().unwrap();

    assert_eq!(tx.status(), Some(Ok(())));
    let data = rx.take().unwrap().unwrap();
    assert_eq!(data.payload(), Bytes::from_static(b"hello ipv6"));
    assert_eq!(data.session.source_port, sender_port);

    let sent = ip.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].protocol, IP_PROTO_UDP);
    assert_eq!(sent[0].child, Some(sender.id()));
    let header = sent[0].udp_header().unwrap();
    assert_eq!(header.length, 18);
    assert_ne!(header.checksum, 0);
    assert_eq!(
        checksum::compute(&sent[0].source, &sent[0].destination, IP_PROTO_UDP, &{
            let mut zeroed = sent[0].payload.to_vec();
            zeroed[6..8].copy_from_slice(&[0, 0]);
            zeroed
        }),
        header.checksum
    );

    let stats = service.stats();
    assert_eq!(stats.transmitted, 1);
    assert_eq!(stats.transmit_completed, 1);
}

#[test]
fn test_port_unreachable_is_reported_to_sender() {
    let (_ip, service) = setup_with(LoopbackIp::new().with_echo(), ServiceConfig::default());
    let sender = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 0).with_remote(Ipv6Addr::LOCALHOST, 5001),
    );

    let rx = ReceiveToken::new();
    sender.receive(&rx).unwrap();
    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"anyone?")));
    sender.transmit(&tx).unwrap();
    service.poll().unwrap();

    assert_eq!(tx.status(), Some(Ok(())));
    assert_eq!(rx.take().unwrap().unwrap_err(), Error::Icmp(IcmpError::PortUnreachable));
}

#[test]
fn test_transmit_validation_errors() {
    let (_ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    let no_destination = TransmitToken::new(TxData::new(Bytes::from_static(b"x")));
    assert!(matches!(
        instance.transmit(&no_destination),
        Err(Error::InvalidParameter(_))
    ));

    let mut lying = TxData::new(Bytes::from_static(b"abc")).with_session(SessionData::to(remote(), 9));
    lying.data_length = 4;
    assert!(matches!(
        instance.transmit(&TransmitToken::new(lying)),
        Err(Error::InvalidParameter(_))
    ));

    let huge = TxData::new(Bytes::from(vec![0u8; 65528])).with_session(SessionData::to(remote(), 9));
    assert_eq!(
        instance.transmit(&TransmitToken::new(huge)),
        Err(Error::BadBufferSize { max_size: 65527 })
    );
}

#[test]
fn test_send_failure_returns_synchronously() {
    let (_ip, service) = setup_with(LoopbackIp::new().with_failing_sends(), ServiceConfig::default());
    let instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_remote(remote(), 9999),
    );

    let tx = TransmitToken::new(TxData::new(Bytes::from_static(b"x")));
    assert!(matches!(instance.transmit(&tx), Err(Error::DeviceError(_))));
    assert!(!tx.is_complete());
    // 토큰이 남아 있지 않으므로 AccessDenied가 아님
    assert!(matches!(instance.transmit(&tx), Err(Error::DeviceError(_))));
    assert_eq!(service.stats().transmit_failed, 2);
}

#[test]
fn test_no_mapping_still_configures() {
    let (_ip, service) = setup_with(LoopbackIp::new().with_no_mapping(), ServiceConfig::default());
    let instance = service.create_instance();

    let config = InstanceConfig::bound(Ipv6Addr::UNSPECIFIED, 5000);
    assert_eq!(instance.configure(Some(&config)), Err(Error::NoMapping));
    assert_eq!(instance.mode_data().unwrap().config.station_port, 5000);
}

#[test]
fn test_corrupted_datagram_dropped_silently() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();

    let session = inbound(Ipv6Addr::LOCALHOST);
    let mut datagram = build_udp(&session, 9999, 5000, b"payload").to_vec();
    datagram[10] ^= 0xFF;
    ip.inject(session, Bytes::from(datagram));
    ip.inject(session, Bytes::from_static(&[0x27, 0x0F, 0x13, 0x88, 0x00]));
    service.poll().unwrap();

    assert!(!token.is_complete());
    assert!(ip.sent().is_empty());
    let stats = service.stats();
    assert_eq!(stats.dropped_checksum, 1);
    assert_eq!(stats.dropped_malformed, 1);
    assert_eq!(ip.released(), 2);
}

#[test]
fn test_dropping_instance_releases_resources() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
    instance.groups(true, Some(group())).unwrap();
    let id = instance.id();

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"queued");
    service.poll().unwrap();
    assert_eq!(service.instance_count(), 1);

    instance.close();
    assert_eq!(service.instance_count(), 0);
    assert!(!ip.is_child_configured(id));
    assert!(ip.groups_of(id).is_empty());
    assert_eq!(ip.released(), 1);

    // 포트가 다시 사용 가능
    let _again = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
}

#[test]
fn test_closed_instance_keeps_delivered_buffer() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"held");
    service.poll().unwrap();

    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();
    let rx = token.take().unwrap().unwrap();

    instance.close();
    assert_eq!(service.instance_count(), 0);
    assert_eq!(ip.released(), 0);
    assert_eq!(rx.payload(), Bytes::from_static(b"held"));

    rx.recycle();
    assert_eq!(ip.released(), 1);
    assert_eq!(service.stats().recycled, 1);
}

#[test]
fn test_zero_port_floor_rejected() {
    let config = ServiceConfig {
        port_floor: 0,
        ..ServiceConfig::default()
    };
    let result = Service::new(config, Arc::new(LoopbackIp::new()));
    assert!(matches!(result, Err(Error::InvalidParameter(_))));
}

#[tokio::test]
async fn test_timer_task_evicts() {
    let config = ServiceConfig {
        tick_interval_ms: 10,
        ..ServiceConfig::default()
    };
    let (ip, service) = setup_with(LoopbackIp::new(), config);
    let _instance = bound(
        &service,
        InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000).with_receive_timeout(Duration::from_millis(30)),
    );
    service.spawn_timer();

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"expiring");
    service.poll().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.stats().evicted, 1);
    assert_eq!(ip.released(), 1);
}

#[tokio::test]
async fn test_wait_for_delivery() {
    let (ip, service) = setup();
    let instance = bound(&service, InstanceConfig::bound(Ipv6Addr::LOCALHOST, 5000));
    let token = ReceiveToken::new();
    instance.receive(&token).unwrap();

    let waiter = token.clone();
    let handle = tokio::spawn(async move { waiter.wait().await });

    ip.inject_udp(inbound(Ipv6Addr::LOCALHOST), 9999, 5000, b"async");
    service.poll().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("대기 타임아웃")
        .unwrap();
    assert_eq!(outcome.unwrap().unwrap().payload(), Bytes::from_static(b"async"));
}
