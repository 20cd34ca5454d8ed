//! IP echo endpoint.

use crate::network::client_ip::ClientIp;

/// Returns the caller's resolved network address as the response body.
pub async fn echo_ip_handler(client_ip: ClientIp) -> String {
    client_ip.to_string()
}
