//! Echo server on top of WebSocketServer
//!
//! Every connection runs on one LocalSet; text and binary messages are
//! sent straight back.
//! Run with: cargo run --example echo_server

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::LocalSet;

use sockudo_wire::{ServerOptions, TokioStream, WebSocketServer};

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::io::Result<()> {
    let addr: SocketAddr = "127.0.0.1:9001".parse().expect("valid address");
    let listener = TcpListener::bind(addr).await?;

    println!("Echo server listening on ws://{}", addr);

    let local = LocalSet::new();
    local
        .run_until(async move {
            loop {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true).ok();
                tokio::task::spawn_local(async move {
                    handle_connection(stream).await;
                    println!("{peer} disconnected");
                });
            }
        })
        .await
}

async fn handle_connection(tcp: TcpStream) {
    let (stream, reader) = TokioStream::spawn(tcp);
    let server = WebSocketServer::new(stream, &["echo"], ServerOptions::default());

    server.on_connected(|url, ws| {
        println!("websocket connected on {url} (protocol {:?})", ws.protocol());

        let weak = ws.downgrade();
        ws.on_text(move |text, _| {
            if let Some(ws) = weak.upgrade() {
                ws.send_text(vec![text.to_owned().into()], |_, _| {});
            }
        });

        let weak = ws.downgrade();
        ws.on_binary(move |data, _| {
            if let Some(ws) = weak.upgrade() {
                ws.send_binary(vec![data.to_vec().into()], |_, _| {});
            }
        });

        ws.on_closed(|code, reason| println!("closed: {code} {reason}"));
    });

    server.on_rejected(|e| eprintln!("upgrade rejected: {e}"));

    reader.run(&server).await;
}
