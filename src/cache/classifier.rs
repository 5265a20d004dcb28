//! Viewport classification from request headers.

use std::collections::BTreeSet;

use axum::http::{HeaderMap, header::USER_AGENT};

use super::keys::ViewportClass;

// Matched against the lowercased user agent. Tablets are checked first because
// most tablet agents also advertise "mobile".
const TABLET_TOKENS: &[&str] = &[
    "ipad",
    "tablet",
    "kindle",
    "silk/",
    "playbook",
    "nexus 7",
    "nexus 9",
    "nexus 10",
    "sm-t",
    "xoom",
];

const MOBILE_TOKENS: &[&str] = &[
    "mobi",
    "iphone",
    "ipod",
    "android",
    "blackberry",
    "bb10",
    "opera mini",
    "iemobile",
    "windows phone",
    "webos",
];

/// Request data the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSignals {
    pub user_agent: String,
}

impl ClientSignals {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        Self::new(user_agent)
    }
}

/// Maps a client to exactly one of `mobile`, `tablet` or `desktop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewportClassifier;

impl ViewportClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, signals: &ClientSignals) -> ViewportClass {
        let agent = signals.user_agent.to_ascii_lowercase();
        if is_tablet(&agent) {
            ViewportClass::tablet()
        } else if is_mobile(&agent) {
            ViewportClass::mobile()
        } else {
            ViewportClass::desktop()
        }
    }

    /// Every class `classify` can return.
    pub fn classes(&self) -> BTreeSet<ViewportClass> {
        [
            ViewportClass::mobile(),
            ViewportClass::tablet(),
            ViewportClass::desktop(),
        ]
        .into_iter()
        .collect()
    }
}

fn is_tablet(agent: &str) -> bool {
    // Android tablets omit the "mobile" token that Android phones send.
    TABLET_TOKENS.iter().any(|token| agent.contains(token))
        || (agent.contains("android") && !agent.contains("mobile"))
}

fn is_mobile(agent: &str) -> bool {
    MOBILE_TOKENS.iter().any(|token| agent.contains(token))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 13_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.3 Mobile/15E148 Safari/604.1";
    const ANDROID_PHONE: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Mobile Safari/537.36";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
    const DESKTOP: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    fn classify(agent: &str) -> ViewportClass {
        ViewportClassifier::new().classify(&ClientSignals::new(agent))
    }

    #[test]
    fn phones_are_mobile() {
        assert_eq!(classify(IPHONE), ViewportClass::mobile());
        assert_eq!(classify(ANDROID_PHONE), ViewportClass::mobile());
    }

    #[test]
    fn tablet_wins_over_mobile_token() {
        assert_eq!(classify(IPAD), ViewportClass::tablet());
        assert_eq!(classify(ANDROID_TABLET), ViewportClass::tablet());
    }

    #[test]
    fn everything_else_is_desktop() {
        assert_eq!(classify(DESKTOP), ViewportClass::desktop());
        assert_eq!(classify(""), ViewportClass::desktop());
    }

    #[test]
    fn signals_read_user_agent_header() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(IPAD));
        let signals = ClientSignals::from_headers(&headers);
        assert_eq!(signals.user_agent, IPAD);

        let empty = ClientSignals::from_headers(&HeaderMap::new());
        assert_eq!(empty, ClientSignals::default());
    }

    #[test]
    fn classes_cover_every_outcome() {
        let classifier = ViewportClassifier::new();
        let classes = classifier.classes();
        for agent in [IPHONE, IPAD, DESKTOP] {
            assert!(classes.contains(&classifier.classify(&ClientSignals::new(agent))));
        }
        assert_eq!(classes.len(), 3);
    }
}
