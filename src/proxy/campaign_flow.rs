//! Campaign State Machine (C10, §4.10). Tracks one victim's progress
//! through `evasion -> before -> landing -> after -> done`, driven by
//! capture completion (§4.9) and the inbound request's query parameters.

use std::collections::HashMap;

use uuid::Uuid;

use crate::crypto::state_cipher;
use crate::models::campaign::{Campaign, PageRef, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Evasion,
    Before,
    Landing,
    After,
    Done,
    Deny,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evasion => "evasion",
            Self::Before => "before",
            Self::Landing => "landing",
            Self::After => "after",
            Self::Done => "done",
            Self::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "evasion" => Some(Self::Evasion),
            "before" => Some(Self::Before),
            "landing" => Some(Self::Landing),
            "after" => Some(Self::After),
            "done" => Some(Self::Done),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Current-page inference (§4.10): prefer a decrypted `state-identifier`,
/// fall back to `url-identifier` presence, default to `landing`.
pub fn infer_current_page(query: &HashMap<String, String>, template: &Template, campaign_id: Uuid) -> PageType {
    if let Some(state_value) = query.get(&template.state_identifier) {
        if let Ok(decrypted) = state_cipher::decrypt(state_value, campaign_id) {
            if let Some(page) = PageType::parse(&decrypted) {
                return page;
            }
        }
    }

    if query.contains_key(&template.url_identifier) {
        if template.before_landing_page.is_some() {
            return PageType::Before;
        }
        return PageType::Landing;
    }

    PageType::Landing
}

/// Next-page table (§4.10).
pub fn next_page(current: PageType, template: &Template) -> PageType {
    match current {
        PageType::Evasion => {
            if template.before_landing_page.is_some() {
                PageType::Before
            } else {
                PageType::Landing
            }
        }
        PageType::Before => PageType::Landing,
        PageType::Landing => {
            if template.after_landing_page.is_some() {
                PageType::After
            } else {
                PageType::Done
            }
        }
        PageType::After | PageType::Done | PageType::Deny => PageType::Done,
    }
}

fn page_ref_for(page: PageType, template: &Template) -> Option<&PageRef> {
    match page {
        PageType::Before => template.before_landing_page.as_ref(),
        PageType::Landing => Some(&template.landing_page),
        PageType::After => template.after_landing_page.as_ref(),
        _ => None,
    }
}

/// Destination URL construction (§4.10): the configured page's own domain
/// if the template carries one for `next`, else the current phishing host;
/// query carries the campaign-recipient-id and a freshly encrypted
/// state-identifier. `after -> done`'s dedicated redirect URL short-circuits
/// this when configured.
pub fn destination_url(
    next: PageType,
    template: &Template,
    campaign_id: Uuid,
    campaign_recipient_id: Uuid,
    current_phishing_host: &str,
) -> Option<String> {
    if next == PageType::Done {
        if let Some(redirect_url) = &template.after_landing_redirect_url {
            return Some(redirect_url.clone());
        }
        return None;
    }

    let host = page_ref_for(next, template)
        .map(|p| p.domain.clone())
        .unwrap_or_else(|| current_phishing_host.to_string());

    let state_value = state_cipher::encrypt(next.as_str(), campaign_id).ok()?;

    Some(format!(
        "https://{host}/?{url_id}={rid}&{state_id}={state}",
        host = host,
        url_id = template.url_identifier,
        rid = campaign_recipient_id,
        state_id = template.state_identifier,
        state = state_value,
    ))
}

/// Evasion short-circuit (§4.10): fires on the very first visit (no
/// `state-identifier` present yet) when the campaign has an evasion page
/// and the URL carries a recognized campaign-recipient-id.
pub fn should_serve_evasion(
    campaign: &Campaign,
    template: &Template,
    query: &HashMap<String, String>,
    has_campaign_recipient: bool,
) -> bool {
    template.evasion_page.is_some() && has_campaign_recipient && !query.contains_key(&template.state_identifier)
}

/// Deny short-circuit (§4.10): the decrypted state-identifier is literally
/// `"deny"`.
pub fn should_serve_deny(query: &HashMap<String, String>, template: &Template, campaign_id: Uuid) -> bool {
    query
        .get(&template.state_identifier)
        .and_then(|v| state_cipher::decrypt(v, campaign_id).ok())
        .map(|decrypted| decrypted == "deny")
        .unwrap_or(false)
}

/// Computes the page to stage for the next response once a completion edge
/// fires (§4.9's "on every capture, the engine calls the campaign flow
/// progression"), and whether a redirect should actually be produced from
/// it. `next_page` already accounts for `done`; rather than dropping a
/// `done` transition with a configured `after-landing-redirect-url` on the
/// floor, the literal redirect URL is staged directly so the response
/// pipeline only ever has to resolve one staged string uniformly.
pub fn stage_value_for(current: PageType, template: &Template) -> Option<String> {
    let next = next_page(current, template);
    if next == current {
        return None;
    }
    if next == PageType::Done {
        return template.after_landing_redirect_url.clone().or(Some("done".to_string()));
    }
    Some(next.as_str().to_string())
}

/// Resolves a value previously staged by [`stage_value_for`] into a 302
/// target: a known page name becomes a proper campaign-flow destination
/// URL, anything else (the literal `after-landing-redirect-url`, or the
/// bare string `"done"` with nothing further to visit) is returned as-is,
/// with `"done"` itself suppressing the redirect entirely.
pub fn resolve_staged_redirect(
    staged: &str,
    template: &Template,
    campaign_id: Uuid,
    campaign_recipient_id: Uuid,
    current_phishing_host: &str,
) -> Option<String> {
    if staged == "done" {
        return None;
    }
    match PageType::parse(staged) {
        Some(page) => destination_url(page, template, campaign_id, campaign_recipient_id, current_phishing_host),
        None => Some(staged.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(before: bool, after: bool) -> Template {
        Template {
            url_identifier: "u".to_string(),
            state_identifier: "s".to_string(),
            evasion_page: None,
            before_landing_page: before.then(|| PageRef {
                domain: "before.phish.test".to_string(),
                html: String::new(),
            }),
            landing_page: PageRef {
                domain: "phish.test".to_string(),
                html: String::new(),
            },
            after_landing_page: after.then(|| PageRef {
                domain: "after.phish.test".to_string(),
                html: String::new(),
            }),
            after_landing_redirect_url: None,
        }
    }

    #[test]
    fn next_page_skips_absent_before_and_after() {
        let t = template(false, false);
        assert_eq!(next_page(PageType::Evasion, &t), PageType::Landing);
        assert_eq!(next_page(PageType::Landing, &t), PageType::Done);
    }

    #[test]
    fn next_page_visits_configured_before_and_after() {
        let t = template(true, true);
        assert_eq!(next_page(PageType::Evasion, &t), PageType::Before);
        assert_eq!(next_page(PageType::Before, &t), PageType::Landing);
        assert_eq!(next_page(PageType::Landing, &t), PageType::After);
        assert_eq!(next_page(PageType::After, &t), PageType::Done);
    }

    #[test]
    fn infer_current_page_prefers_decrypted_state() {
        let t = template(true, false);
        let campaign_id = Uuid::new_v4();
        let state = state_cipher::encrypt("before", campaign_id).unwrap();
        let mut query = HashMap::new();
        query.insert("s".to_string(), state);
        query.insert("u".to_string(), Uuid::new_v4().to_string());
        assert_eq!(infer_current_page(&query, &t, campaign_id), PageType::Before);
    }

    #[test]
    fn infer_current_page_falls_back_to_before_when_no_state() {
        let t = template(true, false);
        let campaign_id = Uuid::new_v4();
        let mut query = HashMap::new();
        query.insert("u".to_string(), Uuid::new_v4().to_string());
        assert_eq!(infer_current_page(&query, &t, campaign_id), PageType::Before);
    }

    #[test]
    fn destination_url_uses_after_landing_redirect_url_for_done() {
        let mut t = template(false, true);
        t.after_landing_redirect_url = Some("https://real-site.example.com/".to_string());
        let campaign_id = Uuid::new_v4();
        let url = destination_url(PageType::Done, &t, campaign_id, Uuid::new_v4(), "phish.test");
        assert_eq!(url, Some("https://real-site.example.com/".to_string()));
    }

    #[test]
    fn destination_url_targets_configured_page_domain() {
        let t = template(true, false);
        let campaign_id = Uuid::new_v4();
        let rid = Uuid::new_v4();
        let url = destination_url(PageType::Before, &t, campaign_id, rid, "phish.test").unwrap();
        assert!(url.starts_with("https://before.phish.test/"));
        assert!(url.contains(&format!("u={rid}")));
    }

    #[test]
    fn stage_value_for_after_with_redirect_url_stages_literal_url() {
        let mut t = template(false, true);
        t.after_landing_redirect_url = Some("https://real-site.example.com/".to_string());
        assert_eq!(
            stage_value_for(PageType::After, &t),
            Some("https://real-site.example.com/".to_string())
        );
    }

    #[test]
    fn stage_value_for_done_with_no_redirect_url_stages_done() {
        let t = template(false, false);
        assert_eq!(stage_value_for(PageType::Landing, &t), Some("done".to_string()));
    }

    #[test]
    fn resolve_staged_redirect_treats_done_as_no_redirect() {
        let t = template(false, false);
        let campaign_id = Uuid::new_v4();
        assert_eq!(
            resolve_staged_redirect("done", &t, campaign_id, Uuid::new_v4(), "phish.test"),
            None
        );
    }

    #[test]
    fn resolve_staged_redirect_passes_through_literal_urls() {
        let t = template(false, false);
        let campaign_id = Uuid::new_v4();
        assert_eq!(
            resolve_staged_redirect("https://real.example.com/", &t, campaign_id, Uuid::new_v4(), "phish.test"),
            Some("https://real.example.com/".to_string())
        );
    }

    #[test]
    fn deny_state_is_detected() {
        let t = template(false, false);
        let campaign_id = Uuid::new_v4();
        let mut query = HashMap::new();
        query.insert("s".to_string(), state_cipher::encrypt("deny", campaign_id).unwrap());
        assert!(should_serve_deny(&query, &t, campaign_id));
    }
}
