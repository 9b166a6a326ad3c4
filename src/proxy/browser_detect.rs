//! Browser/OS detection from a victim's User-Agent (C5), used to pick the
//! outbound impersonation profile. Substring rules, order-sensitive: Edge
//! must be checked before Chrome (Edge's UA contains "chrome"), and
//! Android before Linux (Android's UA contains "linux") — exactly the
//! ordering spec.md §4.5 calls out.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Browser {
    Chrome,
    Firefox,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
}

/// `safari` and unrecognized UAs fall back to `chrome` (§4.5); `edge` also
/// maps to a chrome-based impersonation profile downstream since the
/// impersonation crate has no distinct Edge fingerprint, but the detected
/// `Browser::Edge` is kept distinct here since a future profile may use it.
pub fn detect_browser(user_agent: &str) -> Browser {
    let ua = user_agent.to_lowercase();
    if ua.contains("edg/") || ua.contains("edge/") || ua.contains("edga/") || ua.contains("edgios/") {
        Browser::Edge
    } else if ua.contains("firefox/") {
        Browser::Firefox
    } else {
        // chrome, safari, and anything unrecognized default to chrome.
        Browser::Chrome
    }
}

pub fn detect_platform(user_agent: &str) -> Platform {
    let ua = user_agent.to_lowercase();
    if ua.contains("android") {
        Platform::Android
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        Platform::Ios
    } else if ua.contains("windows") {
        Platform::Windows
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        Platform::MacOs
    } else if ua.contains("linux") {
        Platform::Linux
    } else {
        Platform::Windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_is_detected_before_chrome() {
        let ua = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
        assert_eq!(detect_browser(ua), Browser::Edge);
    }

    #[test]
    fn android_is_detected_before_linux() {
        let ua = "Mozilla/5.0 (Linux; Android 13; Pixel 7)";
        assert_eq!(detect_platform(ua), Platform::Android);
    }

    #[test]
    fn unrecognized_browser_defaults_to_chrome() {
        let ua = "curl/8.0.1";
        assert_eq!(detect_browser(ua), Browser::Chrome);
    }

    #[test]
    fn unrecognized_platform_defaults_to_windows() {
        assert_eq!(detect_platform("some-bot/1.0"), Platform::Windows);
    }
}
