//! Broker connections: per-endpoint sockets, request correlation, retries
//! and leader discovery.

mod backoff;
mod broker;
mod manager;

pub use backoff::Backoff;
pub use broker::BrokerConnection;
pub use manager::ConnectionManager;

use crate::error::ClientError;
use crate::protocol::Response;

pub(crate) fn unexpected_response(expected: &str, got: &Response) -> ClientError {
    ClientError::MalformedFrame(format!(
        "expected {} response, got {}",
        expected,
        got.kind()
    ))
}
