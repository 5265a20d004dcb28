//! Per-request inline decision.
//!
//! Critical CSS is only worth inlining for a real browser that has not yet
//! cached the current stylesheets. Automated clients (including the renderer
//! itself) and clients carrying a current version marker get the page as is.

use std::time::Duration;

use axum::http::{
    HeaderMap,
    header::{COOKIE, USER_AGENT},
};
use time::{
    OffsetDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};

use super::config::GateConfig;

/// Header set by the HTML fetcher so rendering requests see the raw page.
pub const RENDER_FETCH_HEADER: &str = "x-abovefold-render";

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateInputs {
    pub automation_context: bool,
    pub version_match: bool,
}

/// Cookie telling later requests that the client holds the current stylesheets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientVersionMarker {
    pub name: String,
    pub value: String,
    pub ttl: Duration,
}

impl ClientVersionMarker {
    /// `Set-Cookie` header value, with `Expires` computed from `now`.
    pub fn set_cookie_value(&self, now: OffsetDateTime) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}",
            self.name,
            self.value,
            self.ttl.as_secs()
        );
        let expires = (now + self.ttl).to_offset(UtcOffset::UTC).format(HTTP_DATE);
        if let Ok(expires) = expires {
            cookie.push_str("; Expires=");
            cookie.push_str(&expires);
        }
        cookie.push_str("; SameSite=Lax");
        cookie
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Automated client: leave the response untouched.
    Bypass,
    /// Client already holds current stylesheets: leave the response untouched.
    Passthrough,
    /// Inline critical CSS and issue the marker.
    Inline { marker: ClientVersionMarker },
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Bypass => "bypass",
            GateDecision::Passthrough => "passthrough",
            GateDecision::Inline { .. } => "inline",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheGateKeeper {
    config: GateConfig,
}

impl CacheGateKeeper {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn decide(&self, inputs: GateInputs) -> GateDecision {
        if inputs.automation_context {
            GateDecision::Bypass
        } else if inputs.version_match {
            GateDecision::Passthrough
        } else {
            GateDecision::Inline {
                marker: self.marker(),
            }
        }
    }

    pub fn inputs_for(&self, headers: &HeaderMap) -> GateInputs {
        GateInputs {
            automation_context: self.is_automation(headers),
            version_match: self.version_matches(headers),
        }
    }

    pub fn marker(&self) -> ClientVersionMarker {
        ClientVersionMarker {
            name: self.config.cookie_name.clone(),
            value: self.config.content_version.clone(),
            ttl: self.config.marker_ttl,
        }
    }

    /// True when a `Cookie` header carries the marker with the current version.
    pub fn version_matches(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .any(|(name, value)| {
                name.trim() == self.config.cookie_name
                    && value.trim().trim_matches('"') == self.config.content_version
            })
    }

    pub fn is_automation(&self, headers: &HeaderMap) -> bool {
        if headers.contains_key(RENDER_FETCH_HEADER) {
            return true;
        }

        let Some(agent) = headers.get(USER_AGENT).and_then(|value| value.to_str().ok()) else {
            return false;
        };
        let agent = agent.to_ascii_lowercase();
        self.config
            .automation_user_agents
            .iter()
            .any(|token| agent.contains(token.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use time::macros::datetime;

    use super::*;

    fn gate() -> CacheGateKeeper {
        CacheGateKeeper::new(GateConfig {
            content_version: "1.0.0".to_string(),
            ..GateConfig::default()
        })
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn decision_table() {
        let gate = gate();
        let cases = [
            (true, true, "bypass"),
            (true, false, "bypass"),
            (false, true, "passthrough"),
            (false, false, "inline"),
        ];
        for (automation_context, version_match, expected) in cases {
            let decision = gate.decide(GateInputs {
                automation_context,
                version_match,
            });
            assert_eq!(decision.label(), expected);
        }
    }

    #[test]
    fn inline_carries_current_marker() {
        let decision = gate().decide(GateInputs {
            automation_context: false,
            version_match: false,
        });
        let GateDecision::Inline { marker } = decision else {
            panic!("expected inline decision");
        };
        assert_eq!(marker.name, "abovefold-css");
        assert_eq!(marker.value, "1.0.0");
        assert_eq!(marker.ttl, Duration::from_secs(2_419_200));
    }

    #[test]
    fn version_match_requires_exact_value() {
        let gate = gate();
        assert!(gate.version_matches(&headers(&[("cookie", "a=b; abovefold-css=1.0.0")])));
        assert!(!gate.version_matches(&headers(&[("cookie", "abovefold-css=0.9.0")])));
        assert!(!gate.version_matches(&headers(&[("cookie", "other=1.0.0")])));
        assert!(!gate.version_matches(&HeaderMap::new()));
    }

    #[test]
    fn version_match_checks_every_cookie_header() {
        let gate = gate();
        let map = headers(&[("cookie", "session=x"), ("cookie", "abovefold-css=1.0.0")]);
        assert!(gate.version_matches(&map));
    }

    #[test]
    fn render_header_and_crawlers_are_automation() {
        let gate = gate();
        assert!(gate.is_automation(&headers(&[(RENDER_FETCH_HEADER, "1")])));
        assert!(gate.is_automation(&headers(&[(
            "user-agent",
            "Mozilla/5.0 (compatible; Googlebot/2.1)"
        )])));
        assert!(!gate.is_automation(&headers(&[(
            "user-agent",
            "Mozilla/5.0 (X11; Linux x86_64) Firefox/120.0"
        )])));
    }

    #[test]
    fn set_cookie_value_carries_ttl_and_expiry() {
        let marker = gate().marker();
        let value = marker.set_cookie_value(datetime!(2026-01-01 00:00 UTC));
        assert_eq!(
            value,
            "abovefold-css=1.0.0; Path=/; Max-Age=2419200; Expires=Thu, 29 Jan 2026 00:00:00 GMT; SameSite=Lax"
        );
    }
}
