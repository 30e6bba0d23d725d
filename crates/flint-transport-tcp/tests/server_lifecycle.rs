//! TCP 服务器生命周期与接受路径的端到端用例。

use bytes::Bytes;
use flint_core::runtime::CoreServices;
use flint_reactor::selector::Reactor;
use flint_transport_tcp::{
    ChannelHandoff, Connection, PlainConn, ReadOutcome, TcpServer, TcpServerConf, WriteItem,
};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn echo_pump(mut conn: PlainConn) {
    loop {
        match conn.read() {
            Ok(ReadOutcome::Data(data)) => {
                let _ = conn.queue_write(WriteItem::Data(data));
                let _ = conn.write();
            }
            Ok(ReadOutcome::Stall) => {
                let waiter = conn.await_readable(false);
                waiter.on_complete(move |result| {
                    let mut conn = conn;
                    match result {
                        Ok(()) => echo_pump(conn),
                        Err(_) => {
                            conn.close(Duration::ZERO);
                        }
                    }
                });
                return;
            }
            Ok(ReadOutcome::Fin) | Ok(ReadOutcome::CloseNotify) => {
                let _ = conn.queue_write(WriteItem::Fin);
                let _ = conn.write();
                conn.close(Duration::ZERO);
                return;
            }
            Err(_) => {
                conn.close(Duration::ZERO);
                return;
            }
        }
    }
}

fn echo_server(reactor: &Arc<Reactor>, conf: TcpServerConf) -> (TcpServer, SocketAddr) {
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
    let conf = conf.handler(
        addr,
        Arc::new(|handoff: ChannelHandoff| echo_pump(handoff.into_plain_conn())),
    );
    let server = TcpServer::new(Arc::clone(reactor), conf);
    server.start().expect("server starts");
    let bound = server.local_addrs()[0];
    (server, bound)
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn echo_roundtrip_over_accepted_connection() {
    let reactor = Reactor::new(CoreServices::start());
    let (server, addr) = echo_server(
        &reactor,
        TcpServerConf::new()
            .selector_ids(vec![0, 1])
            .socket_conf(flint_transport_tcp::default_socket_conf(true, None)),
    );

    let mut client = std::net::TcpStream::connect(addr).expect("client connects");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("client timeout");
    client.write_all(b"hello flint").expect("client writes");
    let mut received = [0u8; 11];
    client.read_exact(&mut received).expect("client reads echo");
    assert_eq!(&received, b"hello flint");

    // 明文端口对首字节 0x16 不做任何分流：载荷原样往返。
    let tls_looking = [0x16u8, 0x03, 0x01, 0x00];
    client.write_all(&tls_looking).expect("client writes 0x16 payload");
    let mut echoed_back = [0u8; 4];
    client
        .read_exact(&mut echoed_back)
        .expect("0x16-first payload round-trips");
    assert_eq!(echoed_back, tls_looking);

    client
        .shutdown(std::net::Shutdown::Write)
        .expect("client fin");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).expect("server fin echoed");
    assert!(rest.is_empty());

    wait_for("connection table drain", || server.conn_count() == 0);
    server.stop(Duration::from_secs(1)).expect("server stops");
    assert_eq!(server.phase(), "init");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn illegal_transitions_are_rejected() {
    let reactor = Reactor::new(CoreServices::start());
    let server = TcpServer::new(Arc::clone(&reactor), TcpServerConf::new());
    let err = server
        .pause_accepting()
        .expect_err("pause from init is illegal");
    assert!(err.message().contains("illegal state"));
    let err = server.stop_all().expect_err("stop_all from init is illegal");
    assert!(err.message().contains("illegal state"));

    server.start().expect("start from init");
    let err = server.start().expect_err("double start is illegal");
    assert!(err.message().contains("illegal state"));
    let err = server
        .stop_accepting()
        .expect_err("stop_accepting needs paused");
    assert!(err.message().contains("illegal state"));

    server.pause_accepting().expect("pause from accepting");
    server.resume_accepting().expect("resume from paused");
    server.pause_accepting().expect("pause again");
    server.stop_accepting().expect("stop_accepting from paused");
    server.stop_all().expect("stop_all from stopped");
    assert_eq!(server.phase(), "init");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn paused_server_closes_accepted_sockets() {
    let reactor = Reactor::new(CoreServices::start());
    let (server, addr) = echo_server(&reactor, TcpServerConf::new().selector_ids(vec![0]));
    server.pause_accepting().expect("pause");

    let mut client = std::net::TcpStream::connect(addr).expect("connect while paused");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("client timeout");
    let mut buf = [0u8; 1];
    // 暂停状态下套接字即收即关：读到 EOF 或连接复位都算关闭。
    match client.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("paused server must not serve data"),
    }

    server.resume_accepting().expect("resume");
    let mut client = std::net::TcpStream::connect(addr).expect("connect after resume");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("client timeout");
    client.write_all(b"ok").expect("client writes");
    let mut received = [0u8; 2];
    client.read_exact(&mut received).expect("echo after resume");
    assert_eq!(&received, b"ok");

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn per_ip_cap_closes_excess_connection() {
    let reactor = Reactor::new(CoreServices::start());
    let (server, addr) = echo_server(
        &reactor,
        TcpServerConf::new()
            .selector_ids(vec![0])
            .max_connections_per_ip(2),
    );

    let first = std::net::TcpStream::connect(addr).expect("first connect");
    let second = std::net::TcpStream::connect(addr).expect("second connect");
    wait_for("two admitted connections", || server.conn_count() == 2);

    let mut third = std::net::TcpStream::connect(addr).expect("third connect");
    third
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("third timeout");
    let mut buf = [0u8; 1];
    match third.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("third connection must be closed before any data"),
    }
    assert_eq!(server.conn_count(), 2, "上限之内的连接不受影响");

    drop(first);
    drop(second);
    wait_for("counts drain after close", || server.conn_count() == 0);

    // 计数回收后再次接入成功。
    let mut fourth = std::net::TcpStream::connect(addr).expect("fourth connect");
    fourth
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("fourth timeout");
    fourth.write_all(b"x").expect("fourth writes");
    let mut one = [0u8; 1];
    fourth.read_exact(&mut one).expect("fourth echoed");

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn stop_releases_port_for_rebind() {
    let reactor = Reactor::new(CoreServices::start());
    let (server, addr) = echo_server(&reactor, TcpServerConf::new().selector_ids(vec![0]));
    server.stop(Duration::from_millis(200)).expect("stop");
    assert_eq!(server.phase(), "init");

    // 端口已释放：同地址可再次绑定。
    let rebound = std::net::TcpListener::bind(addr).expect("port released after stop");
    drop(rebound);
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn conn_count_tracks_live_connections() {
    let reactor = Reactor::new(CoreServices::start());
    let (server, addr) = echo_server(&reactor, TcpServerConf::new().selector_ids(vec![0, 1, 2]));

    let clients: Vec<std::net::TcpStream> = (0..6)
        .map(|_| std::net::TcpStream::connect(addr).expect("client connects"))
        .collect();
    wait_for("all clients admitted", || server.conn_count() == 6);

    drop(clients);
    wait_for("all connections drained", || server.conn_count() == 0);
    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}
