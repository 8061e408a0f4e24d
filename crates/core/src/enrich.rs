use serde::Deserialize;
use tracing::debug;

use crate::error::Result;

pub const IPIFY_ENDPOINT: &str = "https://api.ipify.org?format=json";

#[derive(Debug, Deserialize)]
struct IpResponse {
    ip: String,
}

/// Looks up the public IP address of the current client.
///
/// Kept off the session-end path: a caller that wants it awaits this
/// before termination and stores the result with `Tracker::set_location`.
pub async fn fetch_ip_address(client: &reqwest::Client, endpoint: &str) -> Result<String> {
    let response = client
        .get(endpoint)
        .send()
        .await?
        .error_for_status()?
        .json::<IpResponse>()
        .await?;

    debug!(ip = %response.ip, "resolved client ip address");
    Ok(response.ip)
}

/// Shape stored in the session's `location` field.
pub fn ip_location(ip: &str) -> serde_json::Value {
    serde_json::json!({ "ip": ip })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipify_response_parses() {
        let response: IpResponse =
            serde_json::from_str(r#"{"ip":"203.0.113.9"}"#).unwrap();
        assert_eq!(response.ip, "203.0.113.9");
        assert!(serde_json::from_str::<IpResponse>(r#"{"address":"x"}"#).is_err());
    }

    #[test]
    fn test_ip_location_shape() {
        assert_eq!(ip_location("203.0.113.9")["ip"], "203.0.113.9");
    }
}
