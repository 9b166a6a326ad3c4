//! Access & Filter Gate (C6, §4.6). Runs after the request context is
//! initialized and before session creation or any upstream I/O.

use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;

use crate::config::proxy_config::{AccessControl, AccessMode, HostConfig, OnDeny};
use crate::models::campaign::{AccessListEntry, Campaign, ListPolarity};
use crate::storage::geoip::GeoIp;
use crate::storage::rate_limit_store::RateLimitStore;
use crate::storage::session_store::SessionStore;

use super::url_rewrite::{self, ForwardRewrite};

/// Outcome of running the gate for one request.
pub enum GateDecision {
    /// Continue the pipeline; `path` has possibly been rewritten in place
    /// (URL-rewrite reverse lookup, §4.6 step 1).
    Proceed { path: String },
    /// Serve a 302 immediately (URL-rewrite forward, §4.6 step 2).
    Redirect { location: String },
    /// Deny per `on-deny` (no campaign-recipient / access-mode failure).
    Deny(OnDeny),
    /// Deny due to the IP/JA4/country filter; the deny page, if the
    /// campaign has one, should be rendered instead of a bare 404.
    FilterDenied,
}

/// Step 1-2: resolves the effective inbound path after reverse URL-rewrite
/// lookup, then checks forward `rewrite-urls` rules. Returns `Some` only
/// when a redirect must be issued immediately.
pub fn apply_url_rewrites(
    sessions: &SessionStore,
    host_cfg: &HostConfig,
    path: &str,
    query: &std::collections::HashMap<String, String>,
) -> (String, Option<ForwardRewrite>) {
    let resolved_path = sessions.get_url_mapping(path).unwrap_or_else(|| path.to_string());

    if let Some(forward) = url_rewrite::forward_rewrite(&host_cfg.rules.rewrite_urls, &resolved_path, query) {
        return (resolved_path, Some(forward));
    }
    (resolved_path, None)
}

/// Step 3: access-mode evaluation. `has_lure` is true when the inbound URL
/// carries a recognized campaign-recipient-id.
pub fn check_access_mode(
    access: &AccessControl,
    client_ip: IpAddr,
    proxy_id: &str,
    has_lure: bool,
    rate_limits: &RateLimitStore,
) -> Option<OnDeny> {
    match access.mode {
        AccessMode::Public => None,
        AccessMode::Private => {
            if has_lure || rate_limits.allow_list_is_allowed(client_ip, proxy_id) {
                None
            } else {
                Some(access.on_deny.clone())
            }
        }
    }
}

/// Admits `client_ip` to `proxy_id`'s private-mode gate for future
/// requests, called once a lure has successfully landed (§4.6 step 3).
pub fn admit_to_allow_list(rate_limits: &RateLimitStore, client_ip: IpAddr, proxy_id: &str, ttl: Duration) {
    rate_limits.allow_list_add(client_ip, proxy_id, ttl);
}

/// Step 4: IP/JA4/country filter, only evaluated when a campaign-recipient
/// is present and the campaign's list is non-empty.
pub fn check_filter(campaign: &Campaign, client_ip: IpAddr, ja4: Option<&str>, geoip: &dyn GeoIp) -> bool {
    if campaign.allow_deny_list.is_empty() {
        return true;
    }

    let country = geoip.lookup_country(client_ip);
    let polarity = campaign.list_polarity().unwrap_or(ListPolarity::Allow);

    match polarity {
        ListPolarity::Allow => campaign
            .allow_deny_list
            .iter()
            .any(|entry| entry_matches(entry, client_ip, ja4, country.as_deref())),
        ListPolarity::Deny => !campaign
            .allow_deny_list
            .iter()
            .any(|entry| entry_fails(entry, client_ip, ja4, country.as_deref())),
    }
}

/// Allow-list semantics: all three sub-filters present on the entry must
/// pass for that entry to admit the request.
fn entry_matches(entry: &AccessListEntry, ip: IpAddr, ja4: Option<&str>, country: Option<&str>) -> bool {
    ip_matches(entry.cidr.as_deref(), ip) && ja4_matches(entry.ja4.as_deref(), ja4) && country_matches(entry.country.as_deref(), country)
}

/// Deny-list semantics: the request fails this entry if any sub-filter
/// present on the entry fails.
fn entry_fails(entry: &AccessListEntry, ip: IpAddr, ja4: Option<&str>, country: Option<&str>) -> bool {
    let ip_fails = entry.cidr.as_deref().is_some_and(|cidr| !ip_in_cidr(cidr, ip));
    let ja4_fails = entry.ja4.as_deref().is_some_and(|want| ja4 != Some(want));
    let country_fails = entry.country.as_deref().is_some_and(|want| country != Some(want));
    ip_fails || ja4_fails || country_fails
}

fn ip_matches(cidr: Option<&str>, ip: IpAddr) -> bool {
    match cidr {
        Some(c) => ip_in_cidr(c, ip),
        None => true,
    }
}

fn ja4_matches(want: Option<&str>, got: Option<&str>) -> bool {
    match want {
        Some(w) => got == Some(w),
        None => true,
    }
}

fn country_matches(want: Option<&str>, got: Option<&str>) -> bool {
    match want {
        Some(w) => got == Some(w),
        None => true,
    }
}

fn ip_in_cidr(cidr: &str, ip: IpAddr) -> bool {
    cidr.parse::<IpNet>().map(|net| net.contains(&ip)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn allow_list_campaign(entries: Vec<AccessListEntry>) -> Campaign {
        Campaign {
            id: uuid::Uuid::new_v4(),
            name: "t".to_string(),
            active: true,
            anonymous: false,
            save_submitted_data: true,
            obfuscate: false,
            deny_page: None,
            allow_deny_list: entries,
            webhook_id: None,
        }
    }

    struct FixedGeoIp(Option<String>);
    impl GeoIp for FixedGeoIp {
        fn lookup_country(&self, _ip: IpAddr) -> Option<String> {
            self.0.clone()
        }
    }

    #[test]
    fn allow_list_requires_every_subfilter_on_one_entry() {
        let campaign = allow_list_campaign(vec![AccessListEntry {
            kind: ListPolarity::Allow,
            cidr: Some("10.0.0.0/8".to_string()),
            ja4: Some("abc".to_string()),
            country: Some("US".to_string()),
        }]);
        let geoip = FixedGeoIp(Some("US".to_string()));
        let ip: IpAddr = "10.1.2.3".parse().unwrap();

        assert!(check_filter(&campaign, ip, Some("abc"), &geoip));
        assert!(!check_filter(&campaign, ip, Some("different"), &geoip));
    }

    #[test]
    fn deny_list_fails_on_any_subfilter_mismatch() {
        let campaign = allow_list_campaign(vec![AccessListEntry {
            kind: ListPolarity::Deny,
            cidr: Some("10.0.0.0/8".to_string()),
            ja4: None,
            country: None,
        }]);
        let geoip = FixedGeoIp(None);
        let blocked: IpAddr = "10.1.2.3".parse().unwrap();
        let allowed: IpAddr = "8.8.8.8".parse().unwrap();

        assert!(!check_filter(&campaign, blocked, None, &geoip));
        assert!(check_filter(&campaign, allowed, None, &geoip));
    }

    #[test]
    fn empty_list_passes_everything() {
        let campaign = allow_list_campaign(vec![]);
        let geoip = FixedGeoIp(None);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert!(check_filter(&campaign, ip, None, &geoip));
    }
}
