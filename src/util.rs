//! Small helpers shared across the proxy engine that don't belong to any
//! one component.

/// Current instant as an RFC 3339 timestamp, used for capture/event
/// `capture_time`/`bundle_time` fields (§4.9, §4.11).
pub fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Naive effective-top-level-domain+1 of a hostname, with a leading dot, so
/// a cookie's `Domain` attribute scopes to every subdomain of the phishing
/// host (§4.8 step 2, §6: "Domain = effective top-level domain of the
/// phishing host with a leading dot"). Takes the last two dot-separated
/// labels; hosts with two or fewer labels, or that parse as an IP address,
/// are returned with a leading dot over the whole host since there is no
/// narrower registrable domain to drop.
pub fn effective_top_level_domain(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        format!(".{host}")
    } else {
        format!(".{}", labels[labels.len() - 2..].join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etld_plus_one_drops_subdomain_labels() {
        assert_eq!(effective_top_level_domain("login.phish.test"), ".phish.test");
        assert_eq!(effective_top_level_domain("phish.test"), ".phish.test");
        assert_eq!(effective_top_level_domain("localhost"), ".localhost");
    }

    #[test]
    fn etld_plus_one_leaves_ip_addresses_bare() {
        assert_eq!(effective_top_level_domain("127.0.0.1"), "127.0.0.1");
    }
}
