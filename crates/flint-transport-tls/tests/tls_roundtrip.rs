//! TLS 端口的端到端用例：同端口明文/TLS 分流、TLS 回显与握手超时。

use flint_core::runtime::CoreServices;
use flint_reactor::selector::Reactor;
use flint_transport_tcp::conn::{Connection, ReadOutcome, WriteItem};
use flint_transport_tcp::server::{TcpServer, TcpServerConf};
use flint_transport_tls::{TlsAcceptorConf, accept_handler};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn echo_pump(mut conn: Box<dyn Connection>) {
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
            Ok(ReadOutcome::CloseNotify) => {
                let _ = conn.queue_write(WriteItem::CloseNotify);
                let _ = conn.queue_write(WriteItem::Fin);
                let _ = conn.write();
                conn.close(Duration::ZERO);
                return;
            }
            Ok(ReadOutcome::Fin) | Err(_) => {
                conn.close(Duration::ZERO);
                return;
            }
        }
    }
}

struct TestPki {
    cert: CertificateDer<'static>,
    server_config: Arc<rustls::ServerConfig>,
}

fn test_pki() -> TestPki {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed certificate");
    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], PrivateKeyDer::Pkcs8(key))
        .expect("build server config");
    TestPki {
        cert,
        server_config: Arc::new(server_config),
    }
}

fn tls_server(
    reactor: &Arc<Reactor>,
    acceptor: TlsAcceptorConf,
) -> (TcpServer, SocketAddr) {
    let addr: SocketAddr = "127.0.0.1:0".parse().expect("loopback addr");
    let conf = TcpServerConf::new().selector_ids(vec![0]).handler(
        addr,
        accept_handler(acceptor, Arc::new(echo_pump)),
    );
    let server = TcpServer::new(Arc::clone(reactor), conf);
    server.start().expect("tls server starts");
    let bound = server.local_addrs()[0];
    (server, bound)
}

fn tls_client(
    cert: &CertificateDer<'static>,
    addr: SocketAddr,
) -> (rustls::ClientConnection, std::net::TcpStream) {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).expect("trust test certificate");
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let server_name = ServerName::try_from("localhost").expect("server name");
    let client = rustls::ClientConnection::new(Arc::new(config), server_name)
        .expect("client connection");
    let sock = std::net::TcpStream::connect(addr).expect("tcp connect");
    sock.set_read_timeout(Some(Duration::from_secs(3)))
        .expect("client read timeout");
    (client, sock)
}

#[test]
fn tls_echo_roundtrip() {
    let reactor = Reactor::new(CoreServices::start());
    let pki = test_pki();
    let (server, addr) = tls_server(
        &reactor,
        TlsAcceptorConf::new(Arc::clone(&pki.server_config)),
    );

    let (mut client, mut sock) = tls_client(&pki.cert, addr);
    let mut stream = rustls::Stream::new(&mut client, &mut sock);
    stream.write_all(b"hello tls").expect("tls write");
    stream.flush().expect("tls flush");
    let mut received = [0u8; 9];
    stream.read_exact(&mut received).expect("tls echo");
    assert_eq!(&received, b"hello tls");

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn detector_routes_plaintext_and_tls_on_same_port() {
    let reactor = Reactor::new(CoreServices::start());
    let pki = test_pki();
    let (server, addr) = tls_server(
        &reactor,
        TlsAcceptorConf::new(Arc::clone(&pki.server_config)).allow_plain(true),
    );

    // 明文分支：首字节非 0x16。
    let mut plain = std::net::TcpStream::connect(addr).expect("plain connect");
    plain
        .set_read_timeout(Some(Duration::from_secs(3)))
        .expect("plain timeout");
    plain.write_all(b"PING").expect("plain write");
    let mut received = [0u8; 4];
    plain.read_exact(&mut received).expect("plain echo");
    assert_eq!(&received, b"PING");
    drop(plain);

    // TLS 分支：同一端口，首字节 0x16。
    let (mut client, mut sock) = tls_client(&pki.cert, addr);
    let mut stream = rustls::Stream::new(&mut client, &mut sock);
    stream.write_all(b"secret").expect("tls write");
    let mut received = [0u8; 6];
    stream.read_exact(&mut received).expect("tls echo");
    assert_eq!(&received, b"secret");

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn silent_client_is_closed_after_handshake_timeout() {
    let reactor = Reactor::new(CoreServices::start());
    let pki = test_pki();
    let (server, addr) = tls_server(
        &reactor,
        TlsAcceptorConf::new(Arc::clone(&pki.server_config))
            .handshake_timeout(Duration::from_millis(300)),
    );

    let mut silent = std::net::TcpStream::connect(addr).expect("silent connect");
    silent
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("silent timeout");
    let mut buf = [0u8; 1];
    match silent.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("silent client must not receive data"),
    }

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}

#[test]
fn close_notify_roundtrip() {
    let reactor = Reactor::new(CoreServices::start());
    let pki = test_pki();
    let (server, addr) = tls_server(
        &reactor,
        TlsAcceptorConf::new(Arc::clone(&pki.server_config)),
    );

    let (mut client, mut sock) = tls_client(&pki.cert, addr);
    {
        let mut stream = rustls::Stream::new(&mut client, &mut sock);
        stream.write_all(b"bye").expect("tls write");
        let mut received = [0u8; 3];
        stream.read_exact(&mut received).expect("tls echo");
    }
    client.send_close_notify();
    while client.wants_write() {
        client.write_tls(&mut sock).expect("flush close notify");
    }
    // 服务器以 close-notify + FIN 应答；客户端读到干净的 TLS EOF。
    let mut stream = rustls::Stream::new(&mut client, &mut sock);
    let mut rest = Vec::new();
    match stream.read_to_end(&mut rest) {
        Ok(_) => assert!(rest.is_empty(), "close-notify 之后不应再有应用数据"),
        Err(err) => panic!("expected clean tls eof, got {err}"),
    }

    server.stop(Duration::from_secs(1)).expect("server stops");
    reactor.shutdown();
    reactor.services().shutdown();
}
