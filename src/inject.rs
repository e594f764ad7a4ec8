//! Rewrites outgoing sign-in requests to carry a broker-issued PRT SSO
//! cookie (the `ms-oapxbc` OAuth2 extension).

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    error::BridgeResult,
    events::EventEmitter,
    protocol::{Account, PrtCookie},
};

pub const DEFAULT_URL_PATTERN: &str = "https://login.microsoftonline.com/*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptedRequest {
    pub url: String,
    #[serde(default)]
    pub request_headers: Vec<Header>,
}

/// A browser match pattern such as `https://login.microsoftonline.com/*`.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    regex: Regex,
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let (scheme, rest) = pattern
            .split_once("://")
            .with_context(|| format!("url pattern {pattern:?} has no scheme"))?;
        let (host, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => anyhow::bail!("url pattern {pattern:?} has no path"),
        };

        let scheme_re = match scheme {
            "*" => "https?".to_string(),
            other => regex::escape(other),
        };
        let host_re = match host {
            "*" => "[^/]+".to_string(),
            h if h.starts_with("*.") => format!(r"(?:[^/]+\.)?{}", regex::escape(&h[2..])),
            h => regex::escape(h),
        };
        let path_re = path
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        let regex = Regex::new(&format!("^{scheme_re}://{host_re}{path_re}$"))
            .with_context(|| format!("url pattern {pattern:?} is not valid"))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

/// Why a request went through untouched. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassReason {
    OutOfScope,
    NotHtml,
    SsoUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    PassThrough(PassReason),
    Inject(Account),
}

/// What the injector needs from the engine.
pub trait SsoContext {
    /// The active account, if the broker is online and one is selected.
    fn sso_account(&self) -> Option<Account>;

    fn acquire_prt_cookie(
        &self,
        account: Account,
        sso_url: &str,
    ) -> impl std::future::Future<Output = BridgeResult<PrtCookie>> + Send;
}

pub fn accepts_html(headers: &[Header]) -> bool {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("accept"))
        .is_some_and(|accept| accept.value.contains("text/html"))
}

#[derive(Debug, Clone)]
pub struct HeaderInjector {
    pattern: UrlPattern,
    events: EventEmitter,
}

impl HeaderInjector {
    pub fn new(pattern: UrlPattern, events: EventEmitter) -> Self {
        Self { pattern, events }
    }

    /// Eligibility filter, first failing check wins.
    pub fn decide<C: SsoContext>(&self, ctx: &C, request: &InterceptedRequest) -> Decision {
        if !self.pattern.matches(&request.url) {
            return Decision::PassThrough(PassReason::OutOfScope);
        }
        if !accepts_html(&request.request_headers) {
            return Decision::PassThrough(PassReason::NotHtml);
        }
        match ctx.sso_account() {
            Some(account) => Decision::Inject(account),
            None => Decision::PassThrough(PassReason::SsoUnavailable),
        }
    }

    /// Returns the header set the request should go out with. Blocks until
    /// the broker answers for eligible requests; any failure degrades to the
    /// unmodified headers.
    pub async fn on_before_send_headers<C: SsoContext>(
        &self,
        ctx: &C,
        request: InterceptedRequest,
    ) -> Vec<Header> {
        let account = match self.decide(ctx, &request) {
            Decision::Inject(account) => account,
            Decision::PassThrough(reason) => {
                tracing::trace!(
                    target = "sso_bridge::inject",
                    url = %request.url,
                    ?reason,
                    "pass through"
                );
                return request.request_headers;
            }
        };

        tracing::info!(
            target = "sso_bridge::inject",
            sso_url = %request.url,
            "request new PrtSsoCookie from broker"
        );
        let mut headers = request.request_headers;
        match ctx.acquire_prt_cookie(account, &request.url).await {
            Ok(cookie) => {
                tracing::info!(
                    target = "sso_bridge::inject",
                    "inject PRT SSO into request headers"
                );
                self.events.emit(
                    "prt_injected",
                    serde_json::json!({"url": request.url, "header": cookie.cookie_name}),
                );
                headers.push(Header::new(cookie.cookie_name, cookie.cookie_content));
            }
            Err(error) => {
                tracing::warn!(
                    target = "sso_bridge::inject",
                    error = %error,
                    "could not acquire PRT SSO cookie"
                );
                self.events.emit(
                    "prt_failed",
                    serde_json::json!({"url": request.url, "error": error.to_string()}),
                );
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::{
        accepts_html, Decision, Header, HeaderInjector, InterceptedRequest, PassReason,
        SsoContext, UrlPattern, DEFAULT_URL_PATTERN,
    };
    use crate::{
        error::{BridgeError, BridgeResult},
        events::EventEmitter,
        protocol::{Account, CommandKind, PrtCookie},
    };

    const AUTHORIZE: &str = "https://login.microsoftonline.com/common/oauth2/authorize";

    struct FakeContext {
        account: Option<Account>,
        reply: Result<PrtCookie, String>,
        calls: AtomicUsize,
    }

    impl FakeContext {
        fn new(account: Option<Account>, reply: Result<PrtCookie, String>) -> Self {
            Self {
                account,
                reply,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl SsoContext for FakeContext {
        fn sso_account(&self) -> Option<Account> {
            self.account.clone()
        }

        async fn acquire_prt_cookie(
            &self,
            _account: Account,
            _url: &str,
        ) -> BridgeResult<PrtCookie> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .map_err(|message| BridgeError::command(CommandKind::AcquirePrtSsoCookie, message))
        }
    }

    fn injector() -> HeaderInjector {
        HeaderInjector::new(
            UrlPattern::parse(DEFAULT_URL_PATTERN).unwrap(),
            EventEmitter::new(false),
        )
    }

    fn html_request(url: &str) -> InterceptedRequest {
        InterceptedRequest {
            url: url.to_string(),
            request_headers: vec![
                Header::new("Accept", "text/html,application/xhtml+xml"),
                Header::new("User-Agent", "Mozilla/5.0"),
            ],
        }
    }

    fn cookie() -> PrtCookie {
        PrtCookie {
            cookie_name: "x-ms-RefreshTokenCredential".into(),
            cookie_content: "abc123".into(),
        }
    }

    #[test]
    fn pattern_matching() {
        let pattern = UrlPattern::parse(DEFAULT_URL_PATTERN).unwrap();
        assert!(pattern.matches(AUTHORIZE));
        assert!(pattern.matches("https://login.microsoftonline.com/"));
        assert!(!pattern.matches("http://login.microsoftonline.com/common"));
        assert!(!pattern.matches("https://login.microsoftonline.com.evil.test/x"));
        assert!(!pattern.matches("https://graph.microsoft.com/v1.0/me"));

        let wildcard = UrlPattern::parse("*://*.microsoftonline.com/*").unwrap();
        assert!(wildcard.matches("http://login.microsoftonline.com/a"));
        assert!(wildcard.matches("https://microsoftonline.com/a"));
        assert!(UrlPattern::parse("login.microsoftonline.com").is_err());
    }

    #[test]
    fn accept_header_lookup_is_case_insensitive() {
        assert!(accepts_html(&[Header::new("accept", "text/html")]));
        assert!(!accepts_html(&[Header::new("Accept", "application/json")]));
        assert!(!accepts_html(&[Header::new("Content-Type", "text/html")]));
        assert!(!accepts_html(&[]));
    }

    #[tokio::test]
    async fn eligible_request_gets_cookie_appended_once() {
        let ctx = FakeContext::new(Some(Account::new("alice@contoso.com")), Ok(cookie()));
        let headers = injector()
            .on_before_send_headers(&ctx, html_request(AUTHORIZE))
            .await;

        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(headers.len(), 3);
        assert_eq!(
            headers
                .iter()
                .filter(|h| h.name == "x-ms-RefreshTokenCredential" && h.value == "abc123")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn broker_error_leaves_headers_unchanged() {
        let ctx = FakeContext::new(
            Some(Account::new("alice@contoso.com")),
            Err("account_unavailable".into()),
        );
        let request = html_request(AUTHORIZE);
        let headers = injector()
            .on_before_send_headers(&ctx, request.clone())
            .await;

        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(headers, request.request_headers);
    }

    #[tokio::test]
    async fn injection_outcomes_are_emitted_as_events() {
        let events = EventEmitter::recording();
        let injector = HeaderInjector::new(
            UrlPattern::parse(DEFAULT_URL_PATTERN).unwrap(),
            events.clone(),
        );

        let ok = FakeContext::new(Some(Account::new("alice@contoso.com")), Ok(cookie()));
        injector.on_before_send_headers(&ok, html_request(AUTHORIZE)).await;
        let failing = FakeContext::new(
            Some(Account::new("alice@contoso.com")),
            Err("account_unavailable".into()),
        );
        injector
            .on_before_send_headers(&failing, html_request(AUTHORIZE))
            .await;

        let recorded = events.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0]["type"], "prt_injected");
        assert_eq!(
            recorded[0]["payload"],
            json!({"url": AUTHORIZE, "header": "x-ms-RefreshTokenCredential"})
        );
        assert_eq!(recorded[1]["type"], "prt_failed");
        assert_eq!(recorded[1]["payload"]["url"], AUTHORIZE);
        assert!(recorded[1]["payload"]["error"]
            .as_str()
            .unwrap()
            .contains("account_unavailable"));
    }

    #[tokio::test]
    async fn non_html_requests_never_reach_the_broker() {
        let ctx = FakeContext::new(Some(Account::new("alice@contoso.com")), Ok(cookie()));
        let request = InterceptedRequest {
            url: AUTHORIZE.into(),
            request_headers: vec![Header::new("Accept", "application/json")],
        };
        assert_eq!(
            injector().decide(&ctx, &request),
            Decision::PassThrough(PassReason::NotHtml)
        );
        let headers = injector()
            .on_before_send_headers(&ctx, request.clone())
            .await;

        assert_eq!(headers, request.request_headers);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_sso_never_reaches_the_broker() {
        let ctx = FakeContext::new(None, Ok(cookie()));
        let request = html_request(AUTHORIZE);
        assert_eq!(
            injector().decide(&ctx, &request),
            Decision::PassThrough(PassReason::SsoUnavailable)
        );
        let headers = injector()
            .on_before_send_headers(&ctx, request.clone())
            .await;

        assert_eq!(headers, request.request_headers);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn out_of_scope_urls_pass_through() {
        let ctx = FakeContext::new(Some(Account::new("alice@contoso.com")), Ok(cookie()));
        let request = html_request("https://example.com/login");
        assert_eq!(
            injector().decide(&ctx, &request),
            Decision::PassThrough(PassReason::OutOfScope)
        );
        let headers = injector()
            .on_before_send_headers(&ctx, request.clone())
            .await;
        assert_eq!(headers, request.request_headers);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }
}
