//! 最小可运行的 WebSocket 回显服务器（跳过 HTTP 升级，直接讲帧协议）。
//!
//! 运行：`cargo run --example echo_server -- 127.0.0.1:9002`
//! 验证：任何以 RFC 6455 帧直连的客户端（或本仓库的线上用例）均可回显。

use bytes::Bytes;
use flint_core::runtime::CoreServices;
use flint_reactor::selector::Reactor;
use flint_transport_tcp::server::{TcpServer, TcpServerConf, default_socket_conf};
use flint_ws::{InboundEvent, WsChannel, WsConf};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn echo(ws: WsChannel) {
    read_loop(ws, Vec::new(), false);
}

fn read_loop(ws: WsChannel, mut acc: Vec<u8>, is_text: bool) {
    let promise = ws.read();
    promise.on_complete(move |result| match result {
        Ok(InboundEvent::TextStart) => read_loop(ws, Vec::new(), true),
        Ok(InboundEvent::BinaryStart) => read_loop(ws, Vec::new(), false),
        Ok(InboundEvent::Body(body)) => {
            acc.extend_from_slice(&body);
            read_loop(ws, acc, is_text)
        }
        Ok(InboundEvent::End) => {
            if is_text {
                let _ = ws.write_text(String::from_utf8_lossy(&acc).into_owned());
            } else {
                let _ = ws.write_binary(Bytes::from(acc));
            }
            read_loop(ws, Vec::new(), false)
        }
        Ok(InboundEvent::Close { code, reason }) => {
            let _ = ws.write_close(code, reason);
        }
        Ok(InboundEvent::Fin) | Err(_) => {
            let _ = ws.close();
        }
    });
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flint=debug".into()),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9002".into())
        .parse()
        .expect("listen address");

    let reactor = Reactor::new(CoreServices::start());
    let ws_conf = WsConf {
        dump_traffic: true,
        ..WsConf::default()
    };
    let conf = TcpServerConf::new()
        .socket_conf(default_socket_conf(true, None))
        .handler(
            addr,
            Arc::new(move |handoff: flint_transport_tcp::ChannelHandoff| {
                let selector = handoff.selector().clone();
                let conn = Box::new(handoff.into_plain_conn());
                echo(WsChannel::new(conn, ws_conf.clone(), selector));
            }),
        );
    let server = TcpServer::new(reactor, conf);
    server.start().expect("server starts");
    tracing::info!(address = %addr, "websocket echo server accepting");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
