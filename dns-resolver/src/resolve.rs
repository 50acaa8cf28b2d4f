use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_recursion::async_recursion;
use tracing::Instrument;

use dns_proto::protocol::types::*;

use crate::cache::SharedCache;
use crate::util::nameserver::query_one_of;
use crate::util::types::ResolutionError;

/// Hard cap on how many delegation hops a single query may take.
/// Each hop is supposed to move strictly toward a more specific
/// delegation; this defends against a malicious or misconfigured zone
/// whose NS chain never bottoms out.
const MAX_ITERATIONS: usize = 16;

/// Total wall-clock budget for one query's walk from the root hints to
/// an answer, independent of how the individual hops spend their time.
const QUERY_DEADLINE: Duration = Duration::from_secs(10);

/// Resolver configuration and shared state, threaded explicitly into
/// every resolution instead of being reached for as global state: a
/// package-level cache and a package-level upstream socket would be
/// the naive port, but that makes the resolver untestable in
/// isolation and impossible to run more than one of in a process.
#[derive(Debug, Clone)]
pub struct ResolverContext {
    pub cache: SharedCache,
    pub root_hints: Vec<SocketAddr>,
    pub attempts_per_server: usize,
    pub attempt_timeout: Duration,
    /// Port that glue records and recursively-resolved nameserver
    /// addresses are dialed on. Always 53 outside of tests: real
    /// nameservers don't advertise a port, but a test double bound to
    /// an unprivileged ephemeral port needs every hop to dial it
    /// instead.
    pub upstream_port: u16,
}

impl ResolverContext {
    /// `root_hints` addresses are dialed on port 53.
    pub fn new(cache: SharedCache, root_hints: Vec<Ipv4Addr>) -> Self {
        let upstream_port = 53;
        Self {
            cache,
            root_hints: root_hints
                .into_iter()
                .map(|addr| SocketAddr::new(IpAddr::V4(addr), upstream_port))
                .collect(),
            attempts_per_server: 2,
            attempt_timeout: Duration::from_secs(3),
            upstream_port,
        }
    }
}

/// Resolve a single question: a cache hit returns immediately,
/// otherwise walk the delegation hierarchy from the root hints down,
/// following referrals until an answer is found or the walk is
/// abandoned.
pub async fn resolve(
    context: &ResolverContext,
    question: &Question,
) -> Result<Vec<ResourceRecord>, ResolutionError> {
    match tokio::time::timeout(QUERY_DEADLINE, resolve_within_deadline(context, question))
        .instrument(tracing::debug_span!("resolve", ?question.name, ?question.qtype))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(ResolutionError::Timeout),
    }
}

async fn resolve_within_deadline(
    context: &ResolverContext,
    question: &Question,
) -> Result<Vec<ResourceRecord>, ResolutionError> {
    let (cached, hit) = context
        .cache
        .get(&question.name, &question.qtype, &question.qclass);
    if hit {
        tracing::debug!("cache hit");
        return Ok(cached);
    }

    let mut current_servers = context.root_hints.clone();

    for iteration in 0..MAX_ITERATIONS {
        tracing::debug!(iteration, servers = current_servers.len(), "querying delegation");

        let response = query_one_of(
            &current_servers,
            question,
            context.attempts_per_server,
            context.attempt_timeout,
        )
        .await?;

        if !response.answers.is_empty() {
            context.cache.set(question, &response.answers);
            return Ok(response.answers);
        }

        let next_servers = extract_next_servers(context, &response).await?;
        if next_servers.is_empty() {
            return Err(ResolutionError::AllServersFailed);
        }
        current_servers = next_servers;
    }

    Err(ResolutionError::ResolutionBoundExceeded)
}

/// Pull the next hop's dialable addresses out of a referral response:
/// NS hostnames from the authority section, resolved to addresses via
/// glue A records in the additional section where present.
///
/// When a referral names a nameserver with no matching glue (a
/// "glueless referral"), one of the NS names is recursively resolved
/// to an address instead of giving up; this can itself bottom out in
/// another glueless referral, which is why this function is
/// recursive.
#[async_recursion]
async fn extract_next_servers(
    context: &ResolverContext,
    response: &Message,
) -> Result<Vec<SocketAddr>, ResolutionError> {
    let mut ns_names = Vec::new();
    for rr in &response.authority {
        if let RecordTypeWithData::NS { nsdname } = &rr.rtype_with_data {
            ns_names.push(nsdname.clone());
        }
    }

    if ns_names.is_empty() {
        return Ok(Vec::new());
    }

    let glue = response
        .additional
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } if ns_names.contains(&rr.name) => {
                Some(SocketAddr::new(IpAddr::V4(*address), context.upstream_port))
            }
            _ => None,
        })
        .collect::<Vec<_>>();

    if !glue.is_empty() {
        return Ok(glue);
    }

    tracing::debug!(nsdname = ?ns_names[0], "glueless referral, resolving nameserver address");

    let ns_question = Question {
        name: ns_names[0].clone(),
        qtype: QueryType::Record(RecordType::A),
        qclass: QueryClass::Record(RecordClass::IN),
    };
    let answers = resolve(context, &ns_question).await?;

    Ok(answers
        .iter()
        .filter_map(|rr| match &rr.rtype_with_data {
            RecordTypeWithData::A { address } => {
                Some(SocketAddr::new(IpAddr::V4(*address), context.upstream_port))
            }
            _ => None,
        })
        .collect())
}
