// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! End to end tests against a scripted mock server: one tokio listener per
//! test playing the server side of the wire protocol.

use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use xrootd_rs::prelude::*;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> Config {
    Config::new()
        .with_connection_window(5)
        .with_connection_retry(1)
        .with_stream_timeout(30)
        .with_worker_threads(2)
}

async fn started_post_master(config: Config) -> PostMaster {
    let pm = PostMaster::new(config);
    assert!(pm.initialize());
    assert!(pm.start());
    pm
}

async fn serve_handshake(socket: &mut TcpStream) {
    let mut greeting = [0u8; 20];
    socket.read_exact(&mut greeting).await.unwrap();
    assert_eq!(&greeting[12..16], &4u32.to_be_bytes());
    let header: [u8; 8] = ResponseHeader {
        sid: 0,
        status: 0,
        dlen: 8,
    }
    .into();
    socket.write_all(&header).await.unwrap();
    socket.write_all(&0x310u32.to_be_bytes()).await.unwrap();
    socket.write_all(&1u32.to_be_bytes()).await.unwrap();
}

async fn read_request(socket: &mut TcpStream) -> Option<([u8; 2], u16, Vec<u8>)> {
    let mut header = [0u8; 24];
    if socket.read_exact(&mut header).await.is_err() {
        return None;
    }
    let sid = [header[0], header[1]];
    let code = u16::from_be_bytes([header[2], header[3]]);
    let dlen = u32::from_be_bytes([header[20], header[21], header[22], header[23]]) as usize;
    let mut body = vec![0u8; dlen];
    if dlen > 0 && socket.read_exact(&mut body).await.is_err() {
        return None;
    }
    Some((sid, code, body))
}

async fn respond(socket: &mut TcpStream, sid: [u8; 2], status: u16, body: &[u8]) {
    let header: [u8; 8] = ResponseHeader {
        sid: u16::from_be_bytes(sid),
        status,
        dlen: body.len() as u32,
    }
    .into();
    socket.write_all(&header).await.unwrap();
    socket.write_all(body).await.unwrap();
}

async fn hold_until_closed(socket: &mut TcpStream) {
    let mut sink = [0u8; 64];
    loop {
        match socket.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

fn sid_manager(pm: &PostMaster, url: &Url) -> Arc<SidManager> {
    match pm.query_transport(url, TransportQuery::SidManager).unwrap() {
        AnyObject::SidManager(mgr) => mgr,
        other => panic!("expected a sid manager, got {:?}", other),
    }
}

#[tokio::test]
async fn simple_round_trip() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, code, body) = read_request(&mut socket).await.unwrap();
        assert_eq!(code, 3001);
        assert!(body.is_empty());
        respond(&mut socket, sid, 0, b"HELLO").await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let response = pm
        .send_recv(&url, Message::request(RequestCode::Query, ""), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(response.as_buffer().unwrap().as_slice(), b"HELLO");
    assert_eq!(sid_manager(&pm, &url).allocated_count(), 0);

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn partials_are_reassembled_in_order() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, _, _) = read_request(&mut socket).await.unwrap();
        respond(&mut socket, sid, 4000, b"ABC").await;
        respond(&mut socket, sid, 4000, b"DE").await;
        respond(&mut socket, sid, 0, b"F").await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let response = pm
        .send_recv(&url, Message::request(RequestCode::Query, ""), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(response.as_buffer().unwrap().as_slice(), b"ABCDEF");

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn wait_then_success() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, _, _) = read_request(&mut socket).await.unwrap();
        let mut wait_body = 1i32.to_be_bytes().to_vec();
        wait_body.extend_from_slice(b"busy");
        respond(&mut socket, sid, 4005, &wait_body).await;
        // the client resends the same request after the pause
        let (sid2, code2, _) = read_request(&mut socket).await.unwrap();
        assert_eq!(sid2, sid);
        assert_eq!(code2, 3001);
        respond(&mut socket, sid2, 0, b"DONE").await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let response = pm
        .send_recv(&url, Message::request(RequestCode::Query, ""), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(response.as_buffer().unwrap().as_slice(), b"DONE");
    assert_eq!(sid_manager(&pm, &url).allocated_count(), 0);

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn redirect_once_rewrites_the_request() {
    init_logger();
    let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let second_port = second.local_addr().unwrap().port();

    let redirector = tokio::spawn(async move {
        let (mut socket, _) = first.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, code, _) = read_request(&mut socket).await.unwrap();
        assert_eq!(code, 3017);
        let mut body = (second_port as i32).to_be_bytes().to_vec();
        body.extend_from_slice(b"127.0.0.1?foo=bar");
        respond(&mut socket, sid, 4004, &body).await;
        hold_until_closed(&mut socket).await;
    });
    let target = tokio::spawn(async move {
        let (mut socket, _) = second.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, code, body) = read_request(&mut socket).await.unwrap();
        assert_eq!(code, 3017);
        // the redirect CGI is appended to the request path
        assert_eq!(body, b"/data?foo=bar".to_vec());
        respond(&mut socket, sid, 0, b"id 1048576 51 1621340400").await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", first_port)).unwrap();
    let response = pm
        .send_recv(&url, Message::request(RequestCode::Stat, "/data"), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    match response {
        AnyObject::Stat(StatInfo::Object { size, .. }) => assert_eq!(size, 1048576),
        other => panic!("expected stat info, got {:?}", other),
    }
    // the first endpoint's id came back, the second endpoint's id was freed
    assert_eq!(sid_manager(&pm, &url).allocated_count(), 0);
    let second_url = Url::parse(&format!("root://127.0.0.1:{}//data", second_port)).unwrap();
    assert_eq!(sid_manager(&pm, &second_url).allocated_count(), 0);

    pm.finalize().await;
    pm.stop().await;
    redirector.await.unwrap();
    target.await.unwrap();
}

#[tokio::test]
async fn redirect_loop_hits_the_limit() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let mut served = 0u32;
        while let Some((sid, _, _)) = read_request(&mut socket).await {
            let mut body = (port as i32).to_be_bytes().to_vec();
            body.extend_from_slice(b"127.0.0.1");
            respond(&mut socket, sid, 4004, &body).await;
            served += 1;
        }
        served
    });

    let pm = started_post_master(test_config().with_redirect_limit(2)).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let err = pm
        .send_recv(&url, Message::request(RequestCode::Stat, "/data"), Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RedirectLimit);
    assert!(err.is_fatal());

    pm.finalize().await;
    pm.stop().await;
    // the original send plus one resend per allowed redirect
    assert_eq!(server.await.unwrap(), 3);
}

#[tokio::test]
async fn error_response_carries_the_server_errno() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, _, _) = read_request(&mut socket).await.unwrap();
        let mut body = 3011i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"no such file\0");
        respond(&mut socket, sid, 4003, &body).await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let err = pm
        .send_recv(&url, Message::request(RequestCode::Stat, "/nope"), Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ErrorResponse);
    assert_eq!(err.errno, 3011);

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn disconnect_fails_a_stateful_operation() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        // swallow the open request and drop the connection
        let _ = read_request(&mut socket).await.unwrap();
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let err = pm
        .send_recv(&url, Message::request(RequestCode::Open, "/data"), Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StreamDisconnect);

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}

#[tokio::test]
async fn unreachable_endpoint_reports_a_connection_error() {
    init_logger();
    // bind then drop to get a refusing port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let err = pm
        .send_recv(&url, Message::request(RequestCode::Stat, "/data"), Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ConnectionError);

    pm.finalize().await;
    pm.stop().await;
}

#[tokio::test]
async fn push_messages_reach_the_listener() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        serve_handshake(&mut socket).await;
        let (sid, _, _) = read_request(&mut socket).await.unwrap();
        // an unsolicited event before the response
        respond(&mut socket, [0, 0], 4001, b"evt!").await;
        respond(&mut socket, sid, 0, b"OK").await;
        hold_until_closed(&mut socket).await;
    });

    let pm = started_post_master(test_config()).await;
    let url = Url::parse(&format!("root://127.0.0.1:{}//data", port)).unwrap();
    let push = {
        let pm = pm.clone();
        let url = url.clone();
        tokio::spawn(async move {
            pm.receive_filtered(
                &url,
                Box::new(|msg| msg.response_body() == b"evt!"),
                Duration::from_secs(10),
            )
            .await
        })
    };
    // give the listener a moment to register before the traffic starts
    tokio::time::sleep(Duration::from_millis(50)).await;
    let response = pm
        .send_recv(&url, Message::request(RequestCode::Query, ""), Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(response.as_buffer().unwrap().as_slice(), b"OK");
    let push = push.await.unwrap().unwrap();
    assert_eq!(push.response_body(), b"evt!");

    pm.finalize().await;
    pm.stop().await;
    server.await.unwrap();
}
