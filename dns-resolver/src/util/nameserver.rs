use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_proto::protocol::types::*;

use crate::util::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes};
use crate::util::types::ResolutionError;

/// Send a message to a remote nameserver, preferring UDP.  If the
/// response comes back truncated, retries over TCP; if the TCP retry
/// also fails, the truncated UDP response is returned anyway, since
/// the record types this resolver cares about (A, NS) are small
/// enough that a truncated response is usually still usable.
///
/// If an error occurs while sending the message, or the response does
/// not match the request, and TCP is no help either, `None` is
/// returned.
pub async fn query_nameserver(
    address: SocketAddr,
    question: &Question,
    recursion_desired: bool,
    attempt_timeout: Duration,
) -> Option<Message> {
    let mut request = Message::from_question(rand::thread_rng().gen(), question.clone());
    request.header.recursion_desired = recursion_desired;

    let mut serialised_request = match request.clone().into_octets() {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(message = ?request, ?error, "could not serialise message");
            return None;
        }
    };

    let udp_response =
        query_nameserver_udp(address, &mut serialised_request, attempt_timeout).await;

    if let Some(response) = &udp_response {
        if response_matches_request(&request, response) {
            return udp_response;
        }

        if response.header.is_truncated {
            if let Some(tcp_response) =
                query_nameserver_tcp(address, &mut serialised_request, attempt_timeout).await
            {
                if response_matches_request(&request, &tcp_response) {
                    return Some(tcp_response);
                }
            }

            tracing::debug!(?address, "TCP retry after truncation failed, using truncated response");
            return udp_response;
        }
    }

    None
}

/// Send a message to a remote nameserver over UDP, returning the
/// response.  The response is NOT validated: consumers MUST validate
/// it with `response_matches_request` before using it.
pub async fn query_nameserver_udp(
    address: SocketAddr,
    serialised_request: &mut [u8],
    attempt_timeout: Duration,
) -> Option<Message> {
    match timeout(
        attempt_timeout,
        query_nameserver_udp_notimeout(address, serialised_request),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => None,
    }
}

/// Timeout-less version of `query_nameserver_udp`.
async fn query_nameserver_udp_notimeout(
    address: SocketAddr,
    serialised_request: &mut [u8],
) -> Option<Message> {
    if serialised_request.len() > 512 {
        return None;
    }

    let mut buf = vec![0u8; 512];
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    sock.connect(address).await.ok()?;
    send_udp_bytes(&sock, serialised_request).await.ok()?;
    let n = sock.recv(&mut buf).await.ok()?;

    Message::from_octets(&buf[..n]).ok()
}

/// Send a message to a remote nameserver over TCP, returning the
/// response.  Has the same validation caveat as `query_nameserver_udp`.
pub async fn query_nameserver_tcp(
    address: SocketAddr,
    serialised_request: &mut [u8],
    attempt_timeout: Duration,
) -> Option<Message> {
    match timeout(
        attempt_timeout,
        query_nameserver_tcp_notimeout(address, serialised_request),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => None,
    }
}

/// Timeout-less version of `query_nameserver_tcp`.
async fn query_nameserver_tcp_notimeout(
    address: SocketAddr,
    serialised_request: &mut [u8],
) -> Option<Message> {
    let mut stream = TcpStream::connect(address).await.ok()?;
    send_tcp_bytes(&mut stream, serialised_request).await.ok()?;
    let bytes = read_tcp_bytes(&mut stream).await.ok()?;

    Message::from_octets(bytes.as_ref()).ok()
}

/// Try every server in turn, up to `attempts` times each, returning
/// the first validated response. Every attempt is bounded by
/// `attempt_timeout`; there is no overall deadline here, that's the
/// caller's job (the walk as a whole is bounded, see §4.3.4 of the
/// design this implements).
pub async fn query_one_of(
    servers: &[SocketAddr],
    question: &Question,
    attempts: usize,
    attempt_timeout: Duration,
) -> Result<Message, ResolutionError> {
    for &address in servers {
        for attempt in 0..attempts.max(1) {
            tracing::trace!(%address, attempt, ?question.name, "querying nameserver");
            if let Some(response) =
                query_nameserver(address, question, false, attempt_timeout).await
            {
                return Ok(response);
            }
        }
    }

    Err(ResolutionError::AllServersFailed)
}

/// Very basic validation that a nameserver response matches a
/// message:
///
/// - Check the ID, opcode, and questions match the question.
///
/// - Check it is a response.
///
/// - Check the response code is either `NoError` or `NameError`.
///
/// - Check it is not truncated.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if response.header.is_truncated {
        return false;
    }
    if !(response.header.rcode == Rcode::NoError || response.header.rcode == Rcode::NameError) {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn response_matches_request_accepts() {
        let (request, response) = matching_nameserver_response();

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_id() {
        let (request, mut response) = matching_nameserver_response();
        response.header.id += 1;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_qr() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_response = false;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_opcode() {
        let (request, mut response) = matching_nameserver_response();
        response.header.opcode = Opcode::Status;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_aa() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_authoritative = !response.header.is_authoritative;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_tc() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_truncated = true;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_rd() {
        let (request, mut response) = matching_nameserver_response();
        response.header.recursion_desired = !response.header.recursion_desired;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_ra() {
        let (request, mut response) = matching_nameserver_response();
        response.header.recursion_available = !response.header.recursion_available;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_rcode() {
        let (request, mut response) = matching_nameserver_response();
        response.header.rcode = Rcode::ServerFailure;

        assert!(!response_matches_request(&request, &response));
    }

    /// When a truncated UDP response comes back and the TCP retry
    /// can't even connect, the truncated response is still handed
    /// back rather than treating the whole attempt as a failure.
    #[tokio::test]
    async fn query_nameserver_falls_back_to_truncated_response_when_tcp_is_unreachable() {
        use dns_proto::protocol::types::test_util::domain;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            loop {
                let Ok((size, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let Ok(request) = Message::from_octets(&buf[..size]) else {
                    continue;
                };
                let mut response = request.make_response();
                response.header.is_truncated = true;
                let octets = response.into_octets().unwrap();
                let _ = socket.send_to(&octets, peer).await;
            }
        });

        let question = Question {
            name: domain("www.example.com."),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };

        // nothing is listening on TCP at this address, so the retry
        // fails to connect and the degraded truncated response wins.
        let response = query_nameserver(address, &question, false, Duration::from_millis(500))
            .await
            .expect("truncated response is returned even when TCP retry fails");

        assert!(response.header.is_truncated);
    }
}

#[cfg(test)]
pub mod test_util {
    use dns_proto::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    use super::*;

    pub fn matching_nameserver_response() -> (Message, Message) {
        nameserver_response(
            "www.example.com.",
            &[a_record("www.example.com.", Ipv4Addr::new(1, 1, 1, 1))],
            &[],
            &[],
        )
    }

    pub fn nameserver_response(
        name: &str,
        answers: &[ResourceRecord],
        authority: &[ResourceRecord],
        additional: &[ResourceRecord],
    ) -> (Message, Message) {
        let request = Message::from_question(
            1234,
            Question {
                name: domain(name),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );

        let mut response = request.make_response();
        response.answers = answers.into();
        response.authority = authority.into();
        response.additional = additional.into();

        (request, response)
    }
}
