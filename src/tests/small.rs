//! End-to-end tests for small (unscheduled) RPCs over the loopback
//! network.

use super::mock::TestNet;
use super::*;

fn two_nodes(config: &HomaConfig) -> (TestNet, Arc<Homa>, Arc<Homa>) {
    init_logger();
    let net = TestNet::new();
    let client = Homa::new(config.clone(), net.driver(CLIENT_ADDR)).unwrap();
    let server = Homa::new(config.clone(), net.driver(SERVER_ADDR)).unwrap();
    net.register(CLIENT_ADDR, &client);
    net.register(SERVER_ADDR, &server);
    (net, client, server)
}

/// A 100-byte request and response: one DATA packet each way, no GRANTs,
/// and both RPCs reaped once the timers run.
#[test]
fn single_rpc() {
    let config = HomaConfig::default();
    let (net, client, server) = two_nodes(&config);

    let ssock = server.socket().unwrap();
    ssock.bind(SERVER_PORT).unwrap();
    let csock = client.socket().unwrap();

    let server_thread = {
        let ssock = ssock.clone();
        thread::spawn(move || {
            let req = ssock.recv(RecvFlags::REQUEST, 0).unwrap();
            assert_eq!(req.data, vec![7u8; 100]);
            assert_eq!(*req.source.ip(), CLIENT_ADDR);
            ssock.reply(req.source, req.id, &vec![9u8; 100]).unwrap();
        })
    };

    let dest = SocketAddrV4::new(SERVER_ADDR, SERVER_PORT);
    let id = csock.send(dest, &vec![7u8; 100]).unwrap();
    assert_ne!(id, 0);

    let resp = csock.recv(RecvFlags::RESPONSE, id).unwrap();
    assert_eq!(resp.id, id);
    assert_eq!(resp.data, vec![9u8; 100]);
    server_thread.join().unwrap();

    // Unscheduled traffic only: a grant was never needed.
    assert_eq!(net.count(PktType::Grant), 0);
    assert_eq!(net.count(PktType::Data), 2);

    // The server RPC retires after `resend_ticks` silent ticks; the
    // client RPC died when its response was delivered. A reap pass on
    // each side then empties the dead lists.
    for _ in 0..config.resend_ticks + 1 {
        server.timer_tick();
    }
    assert_eq!(
        csock.recv(RecvFlags::RESPONSE | RecvFlags::NONBLOCKING, 0),
        Err(HomaError::WouldBlock)
    );
    assert_eq!(
        ssock.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0),
        Err(HomaError::WouldBlock)
    );
    for sock in [&csock, &ssock] {
        let inner = sock.inner.lock().unwrap();
        assert!(inner.active.is_empty());
        assert!(inner.dead.is_empty());
        assert!(inner.client_rpcs.is_empty());
        assert!(inner.server_rpcs.is_empty());
    }
    assert_eq!(client.metrics().rpcs_reaped, 1);
    assert_eq!(server.metrics().rpcs_reaped, 1);
}

/// Several RPCs in flight on one socket, including multi-frame messages,
/// each response matched to its request by id.
#[test]
fn concurrent_rpcs() {
    let config = HomaConfig {
        max_gso_size: 1400,
        ..HomaConfig::default()
    };
    let (_net, client, server) = two_nodes(&config);

    let ssock = server.socket().unwrap();
    ssock.bind(SERVER_PORT).unwrap();
    let csock = client.socket().unwrap();

    const N: usize = 8;
    let server_thread = {
        let ssock = ssock.clone();
        thread::spawn(move || {
            for _ in 0..N {
                let req = ssock.recv(RecvFlags::REQUEST, 0).unwrap();
                // Echo the request back.
                ssock.reply(req.source, req.id, &req.data).unwrap();
            }
        })
    };

    let dest = SocketAddrV4::new(SERVER_ADDR, SERVER_PORT);
    let mut expected = Vec::new();
    for i in 0..N {
        let len = 100 + i * 700; // some single-frame, some multi-frame
        let payload: Vec<u8> = (0..len).map(|j| (i + j) as u8).collect();
        let id = csock.send(dest, &payload).unwrap();
        expected.push((id, payload));
    }
    for (id, payload) in expected {
        let resp = csock.recv(RecvFlags::RESPONSE, id).unwrap();
        assert_eq!(resp.data, payload);
    }
    server_thread.join().unwrap();
}

/// `poll` reports request readiness without consuming it.
#[test]
fn poll_readiness() {
    let config = HomaConfig::default();
    let (_net, client, server) = two_nodes(&config);

    let ssock = server.socket().unwrap();
    ssock.bind(SERVER_PORT).unwrap();
    let csock = client.socket().unwrap();

    assert!(!ssock.poll().request);
    let dest = SocketAddrV4::new(SERVER_ADDR, SERVER_PORT);
    csock.send(dest, b"ping").unwrap();

    wait_for(|| ssock.poll().request);
    assert!(!ssock.poll().response);

    let req = ssock.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0).unwrap();
    assert_eq!(req.data, b"ping");
    assert!(!ssock.poll().request);
}

/// Two sockets on one instance demux by port.
#[test]
fn two_server_sockets() {
    let config = HomaConfig::default();
    let (_net, client, server) = two_nodes(&config);

    let sock_a = server.socket().unwrap();
    sock_a.bind(101).unwrap();
    let sock_b = server.socket().unwrap();
    sock_b.bind(102).unwrap();
    let csock = client.socket().unwrap();

    csock.send(SocketAddrV4::new(SERVER_ADDR, 101), b"to-a").unwrap();
    csock.send(SocketAddrV4::new(SERVER_ADDR, 102), b"to-b").unwrap();

    wait_for(|| sock_a.poll().request && sock_b.poll().request);
    let a = sock_a.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0).unwrap();
    let b = sock_b.recv(RecvFlags::REQUEST | RecvFlags::NONBLOCKING, 0).unwrap();
    assert_eq!(a.data, b"to-a");
    assert_eq!(b.data, b"to-b");
}
