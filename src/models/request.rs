use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use uuid::Uuid;

/// Per-request working state threaded through C4→C12. Built once at the
/// HTTP entry point and mutated in place as the pipeline resolves the
/// campaign, session, and upstream target.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub ja4: Option<String>,
    pub ja3: Option<String>,
    pub country_code: Option<String>,

    pub method: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub headers: HashMap<String, String>,

    /// The victim's User-Agent exactly as received, before any rewrite.
    /// The event emitter always reports this value (§4.11).
    pub original_user_agent: Option<String>,

    pub campaign_recipient_id: Option<Uuid>,
    pub url_identifier_param: Option<String>,

    pub session_id: Option<Uuid>,

    pub timestamp: Instant,
}

impl RequestContext {
    pub fn new(client_ip: IpAddr, method: String, path: String, query: String, host: String) -> Self {
        Self {
            client_ip,
            ja4: None,
            ja3: None,
            country_code: None,
            method,
            path,
            query,
            host,
            headers: HashMap::new(),
            original_user_agent: None,
            campaign_recipient_id: None,
            url_identifier_param: None,
            session_id: None,
            timestamp: Instant::now(),
        }
    }

    pub fn full_path(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Resolves the client IP per the header precedence in §4.6:
    /// `X-Forwarded-For` (first element), `X-Real-IP`, `X-Client-IP`,
    /// `CF-Connecting-IP`, `True-Client-IP`, else the connection's remote
    /// address (already the fallback baked into `client_ip`).
    pub fn resolve_client_ip(headers: &HashMap<String, String>, remote_ip: IpAddr) -> IpAddr {
        const HEADER_PRECEDENCE: [&str; 5] = [
            "x-forwarded-for",
            "x-real-ip",
            "x-client-ip",
            "cf-connecting-ip",
            "true-client-ip",
        ];

        for header in HEADER_PRECEDENCE {
            if let Some(value) = headers.get(header) {
                let candidate = value.split(',').next().unwrap_or(value).trim();
                if let Ok(ip) = candidate.parse::<IpAddr>() {
                    return ip;
                }
            }
        }
        remote_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_x_forwarded_for_first_element() {
        let mut headers = HashMap::new();
        headers.insert("x-forwarded-for".to_string(), "203.0.113.9, 10.0.0.1".to_string());
        let remote: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(
            RequestContext::resolve_client_ip(&headers, remote),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn falls_back_to_remote_addr_when_no_headers_present() {
        let headers = HashMap::new();
        let remote: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(RequestContext::resolve_client_ip(&headers, remote), remote);
    }
}
