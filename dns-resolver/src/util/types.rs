use dns_proto::protocol::types::Rcode;

/// An error that can occur while resolving a question, once the
/// question itself is known to be well-formed (a malformed query from
/// the client never reaches the resolver at all: it's caught by the
/// codec's own `Error` type and answered with a format-error response
/// before `resolve` is ever called).
///
/// A malformed response from an upstream server is not a variant here
/// either: it's treated as this attempt simply failing, so the walk
/// retries the next attempt or server, same as a timeout would.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionError {
    /// A single upstream attempt exhausted its deadline.
    Timeout,
    /// Every server in the current delegation set failed.
    AllServersFailed,
    /// The iteration cap on the delegation walk was hit.
    ResolutionBoundExceeded,
}

impl ResolutionError {
    /// The response code this error should be reported to the client
    /// as, on an otherwise well-formed response message.
    pub fn rcode(&self) -> Rcode {
        match self {
            ResolutionError::Timeout
            | ResolutionError::AllServersFailed
            | ResolutionError::ResolutionBoundExceeded => Rcode::ServerFailure,
        }
    }
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolutionError::Timeout => write!(f, "timed out"),
            ResolutionError::AllServersFailed => write!(f, "all servers failed"),
            ResolutionError::ResolutionBoundExceeded => {
                write!(f, "exceeded the iteration bound on the delegation walk")
            }
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_bound_exceeded_maps_to_server_failure() {
        assert_eq!(Rcode::ServerFailure, ResolutionError::ResolutionBoundExceeded.rcode());
    }
}
