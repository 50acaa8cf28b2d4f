//! End-to-end resolution scenarios, each driven against mock
//! nameservers bound to loopback addresses rather than real servers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use dns_proto::protocol::types::test_util::*;
use dns_proto::protocol::types::*;
use dns_resolver::cache::SharedCache;
use dns_resolver::resolve::{resolve, ResolverContext};
use dns_resolver::util::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes_to};

fn question(name: &str) -> Question {
    Question {
        name: domain(name),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    }
}

fn context_with_hints(root_hints: Vec<SocketAddr>) -> ResolverContext {
    let mut context = ResolverContext::new(SharedCache::new(), Vec::new());
    context.root_hints = root_hints;
    context.attempt_timeout = Duration::from_millis(500);
    context
}

/// Spawn a UDP-only mock nameserver on an ephemeral loopback port,
/// answering every request with whatever `respond` builds from the
/// incoming question. Returns the bound address.
async fn spawn_udp_mock<F>(respond: F) -> SocketAddr
where
    F: Fn(&Question) -> Message + Send + Sync + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let Ok((size, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_octets(&buf[..size]) else {
                continue;
            };
            let Some(question) = request.questions.first() else {
                continue;
            };

            let mut response = respond(question);
            response.header.id = request.header.id;
            let mut octets = response.into_octets().unwrap();
            let _ = send_udp_bytes_to(&socket, peer, &mut octets).await;
        }
    });

    addr
}

/// Spawn a mock nameserver that replies truncated over UDP and fully
/// over TCP, both bound to the same port (as real DNS requires).
async fn spawn_truncating_mock(full_answer: ResourceRecord) -> SocketAddr {
    let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = udp_socket.local_addr().unwrap();
    let tcp_listener = TcpListener::bind(addr).await.unwrap();

    let answer = full_answer.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        loop {
            let Ok((size, peer)) = udp_socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_octets(&buf[..size]) else {
                continue;
            };
            // a real nameserver can set TC=1 on a deliberately bare
            // response even under 512 bytes (it doesn't want to
            // answer over UDP at all); send the raw bytes directly
            // rather than through `send_udp_bytes_to`, which exists to
            // derive TC from actual oversize, not to fake it.
            let mut response = request.make_response();
            response.header.is_truncated = true;
            let octets = response.into_octets().unwrap();
            let _ = udp_socket.send_to(&octets, peer).await;
        }
    });

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp_listener.accept().await else {
                return;
            };
            let answer = answer.clone();
            tokio::spawn(async move {
                let Ok(bytes) = read_tcp_bytes(&mut stream).await else {
                    return;
                };
                let Ok(request) = Message::from_octets(bytes.as_ref()) else {
                    return;
                };
                let mut response = request.make_response();
                response.answers = vec![answer];
                let mut octets = response.into_octets().unwrap();
                let _ = send_tcp_bytes(&mut stream, &mut octets).await;
            });
        }
    });

    addr
}

#[tokio::test]
async fn root_answers_directly() {
    let target = "www.example.com.";
    let answer = a_record(target, Ipv4Addr::new(93, 184, 216, 34));

    let root = spawn_udp_mock({
        let answer = answer.clone();
        move |_question| {
            let mut response = Message::from_question(0, question(target)).make_response();
            response.answers = vec![answer.clone()];
            response
        }
    })
    .await;

    let context = context_with_hints(vec![root]);
    let result = resolve(&context, &question(target)).await.unwrap();

    assert_eq!(vec![answer], result);
}

#[tokio::test]
async fn two_hop_delegation() {
    let target = "www.example.com.";
    let answer = a_record(target, Ipv4Addr::new(93, 184, 216, 34));

    let authoritative = spawn_udp_mock({
        let answer = answer.clone();
        move |_question| {
            let mut response = Message::from_question(0, question(target)).make_response();
            response.answers = vec![answer.clone()];
            response
        }
    })
    .await;

    let glue_ip = match authoritative.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => unreachable!("mock server always binds an IPv4 loopback address"),
    };
    let ns_name = "a.gtld-servers.net.";

    let root = spawn_udp_mock(move |q| {
        let mut response = Message::from_question(0, q.clone()).make_response();
        response.authority = vec![ns_record("com.", ns_name)];
        response.additional = vec![a_record(ns_name, glue_ip)];
        response
    })
    .await;

    let mut context = context_with_hints(vec![root]);
    // the referral's glue carries only an address, not a port; every
    // hop beyond the root hints is dialed on `upstream_port`.
    context.upstream_port = authoritative.port();

    let result = resolve(&context, &question(target)).await.unwrap();
    assert_eq!(vec![answer], result);
}

#[tokio::test]
async fn glueless_referral_resolves_nameserver_first() {
    let target = "example.com.";
    let ns_name = "ns1.example.com.";
    let answer = a_record(target, Ipv4Addr::new(192, 0, 2, 200));

    let authoritative = spawn_udp_mock({
        let answer = answer.clone();
        move |_question| {
            let mut response = Message::from_question(0, question(target)).make_response();
            response.answers = vec![answer.clone()];
            response
        }
    })
    .await;

    // the NS name resolves to the authoritative mock's own address, so
    // once its A record comes back the glueless hop lands exactly on
    // the server that actually answers `target`.
    let ns_address = match authoritative.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => unreachable!("mock server always binds an IPv4 loopback address"),
    };

    let root_addr = spawn_udp_mock(move |q| {
        if q.name == domain(ns_name) {
            let mut response = Message::from_question(0, q.clone()).make_response();
            response.answers = vec![a_record(ns_name, ns_address)];
            response
        } else {
            let mut response = Message::from_question(0, q.clone()).make_response();
            response.authority = vec![ns_record("com.", ns_name)];
            response
        }
    })
    .await;

    let mut context = context_with_hints(vec![root_addr]);
    context.upstream_port = authoritative.port();

    let result = resolve(&context, &question(target)).await.unwrap();
    assert_eq!(vec![answer], result);
}

#[tokio::test]
async fn truncated_response_falls_back_to_tcp() {
    let target = "big.example.com.";
    let answer = a_record(target, Ipv4Addr::new(198, 51, 100, 9));

    let server = spawn_truncating_mock(answer.clone()).await;
    let context = context_with_hints(vec![server]);

    let result = resolve(&context, &question(target)).await.unwrap();
    assert_eq!(vec![answer], result);
}

#[tokio::test]
async fn cached_answer_is_returned_without_any_upstream_call() {
    let target = "cached.example.com.";
    let answer = a_record(target, Ipv4Addr::new(203, 0, 113, 7));

    let cache = SharedCache::new();
    cache.set(&question(target), &[answer.clone()]);

    // No root hints at all: any attempt to go upstream would fail
    // immediately, so success here proves the cache was consulted
    // first.
    let mut context = context_with_hints(Vec::new());
    context.cache = cache;

    let result = resolve(&context, &question(target)).await.unwrap();
    // the cache reports a TTL relative to now rather than the stored
    // one, so compare everything except that.
    assert_eq!(1, result.len());
    assert_eq!(answer.name, result[0].name);
    assert_eq!(answer.rtype_with_data, result[0].rtype_with_data);
}

#[tokio::test]
async fn unreachable_server_yields_resolution_error() {
    // nothing listens on this loopback port; every attempt to every
    // server must fail within the attempt timeout.
    let context = context_with_hints(vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1)]);
    let result = resolve(&context, &question("unreachable.example.")).await;

    assert!(result.is_err());
}
