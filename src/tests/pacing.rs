//! Pacer behavior at the transport level, on a mocked clock.

use quanta::Clock;

use super::mock::CaptureDriver;
use super::*;

/// Ten back-to-back full-size messages: the NIC queue estimate never
/// runs more than one packet past `now + max_nic_queue_ns`, and the
/// opportunistic pump drains the backlog as time passes.
#[test]
fn nic_queue_stays_bounded() {
    init_logger();
    let config = HomaConfig {
        link_mbps: 10_000,
        max_nic_queue_ns: 5_000,
        max_gso_size: 1400,
        ..HomaConfig::default()
    };
    let (clock, mock) = Clock::mock();
    let (capture, driver) = CaptureDriver::shared();
    let homa = Homa::with_clock(config, driver, clock).unwrap();
    let sock = homa.socket().unwrap();

    let dest = SocketAddrV4::new(SERVER_ADDR, SERVER_PORT);
    for _ in 0..10 {
        sock.send(dest, &vec![0u8; 1400]).unwrap();
    }

    // One frame is 1400 payload bytes plus headers.
    let frame_wire = 1400 + 48;
    let cost = homa.pacer().packet_ns(frame_wire);
    assert!(homa.pacer().link_idle_ns() <= 5_000 + cost);

    // The queue limit held some messages back.
    let sent_immediately = capture.count(PktType::Data);
    assert!(sent_immediately >= 1);
    assert!(sent_immediately < 10);

    // As (mock) time passes, the pump releases the rest without ever
    // overshooting the bound.
    let mut rounds = 0;
    while capture.count(PktType::Data) < 10 {
        mock.increment(Duration::from_micros(5));
        homa.check_pacer();
        assert!(homa.pacer().link_idle_ns() <= homa.now_ns() + 5_000 + cost);
        rounds += 1;
        assert!(rounds < 1_000, "pacer failed to drain the backlog");
    }

    // Everything got released and nothing is left throttled.
    assert!(homa.pacer().is_idle());
}

/// Packets below `throttle_min_bytes` are never held back, no matter
/// how full the queue estimate is.
#[test]
fn small_packets_skip_the_pacer() {
    init_logger();
    let config = HomaConfig {
        link_mbps: 10_000,
        max_nic_queue_ns: 5_000,
        throttle_min_bytes: 200,
        max_gso_size: 1400,
        ..HomaConfig::default()
    };
    let (clock, _mock) = Clock::mock();
    let (capture, driver) = CaptureDriver::shared();
    let homa = Homa::with_clock(config, driver, clock).unwrap();
    let sock = homa.socket().unwrap();

    let dest = SocketAddrV4::new(SERVER_ADDR, SERVER_PORT);
    // Fill the queue estimate with big sends.
    for _ in 0..10 {
        sock.send(dest, &vec![0u8; 1400]).unwrap();
    }
    let before = capture.count(PktType::Data);

    // Tiny sends still go straight out.
    for _ in 0..5 {
        sock.send(dest, &vec![0u8; 50]).unwrap();
    }
    assert_eq!(capture.count(PktType::Data), before + 5);
}
