/* MITM Gateway (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

//! Hook protocol: pluggable observers and interceptors matched per exchange.
//!
//! Every registered [`Hook`] sees `match_request` for each inbound request. Hooks that
//! answer with a pass decision form the exchange's matched set; they later get
//! `on_matched_request` once the request body is complete and, if any of them asked for
//! it, `on_matched_response` with the buffered response. The first `FakeResponse`
//! short-circuits the exchange.

mod rules;

pub use rules::RuleHook;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

use crate::{
    config::HooksConfig,
    proxy::{body::HookBody, flow::ResponseParts, http1},
    utils::ProxyError,
};

/// Request metadata shown to hooks. `url` is always absolute.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub method: Method,
    pub url: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Response metadata shown to hooks.
#[derive(Debug, Clone)]
pub struct HookResponse {
    pub status: StatusCode,
    pub status_message: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl From<&ResponseParts> for HookResponse {
    fn from(parts: &ResponseParts) -> Self {
        Self {
            status: parts.status,
            status_message: parts.status_message().to_string(),
            version: parts.version,
            headers: parts.headers.clone(),
        }
    }
}

/// What a hook wants done with an exchange.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Relay to the real server, optionally overriding host/method/path.
    PassOnRequest {
        intercept_response: bool,
        replace_request: Option<RequestReplacement>,
    },
    /// Relay; returned once the request body is available.
    PassOnRequestBody { intercept_response: bool },
    /// Answer locally; the real server is never contacted.
    FakeResponse(FakeResponse),
}

impl Decision {
    pub fn pass() -> Self {
        Decision::PassOnRequest {
            intercept_response: false,
            replace_request: None,
        }
    }

    pub fn intercept() -> Self {
        Decision::PassOnRequest {
            intercept_response: true,
            replace_request: None,
        }
    }

    pub fn intercept_response(&self) -> bool {
        match self {
            Decision::PassOnRequest {
                intercept_response, ..
            }
            | Decision::PassOnRequestBody { intercept_response } => *intercept_response,
            Decision::FakeResponse(fake) => fake.intercept_response,
        }
    }
}

/// Overrides applied to the upstream request. `host` may carry a `:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestReplacement {
    pub host: Option<String>,
    pub method: Option<Method>,
    pub path: Option<String>,
}

impl RequestReplacement {
    /// Fills fields still unset from `other`; earlier registrations keep precedence.
    fn merge(&mut self, other: RequestReplacement) {
        if self.host.is_none() {
            self.host = other.host;
        }
        if self.method.is_none() {
            self.method = other.method;
        }
        if self.path.is_none() {
            self.path = other.path;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeResponse {
    pub status: StatusCode,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Deliver the fake to the issuing hook's `on_matched_response` as well.
    pub intercept_response: bool,
}

impl FakeResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            status_message: None,
            headers: HeaderMap::new(),
            body: None,
            intercept_response: false,
        }
    }

    /// Body as sent to the client; empty for statuses that cannot carry one.
    pub fn body_bytes(&self) -> Bytes {
        match &self.body {
            Some(body) if http1::status_allows_body(self.status) => body.clone(),
            _ => Bytes::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            self.headers.insert(header::CONTENT_TYPE, value);
        }
        self.body = Some(body.into());
        self
    }

    /// Response head with `Content-Length` matching the body. Statuses that never
    /// carry a body get no length at all.
    pub fn response_parts(&self) -> ResponseParts {
        let mut headers = self.headers.clone();
        headers.remove(header::TRANSFER_ENCODING);
        if http1::status_allows_body(self.status) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body_bytes().len()));
        } else {
            headers.remove(header::CONTENT_LENGTH);
        }
        ResponseParts {
            status: self.status,
            reason: self.status_message.clone(),
            version: Version::HTTP_11,
            headers,
        }
    }
}

/// Capability contract implemented by traffic observers and interceptors.
///
/// Errors never escape the relay: a failing hook is logged and treated as unmatched,
/// unless it reports [`Hook::fail_closed`], in which case a failure while deciding
/// ends the exchange with a 500.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Hooks that may serve fake responses should fail closed so an error can't turn a
    /// block into a pass-through.
    fn fail_closed(&self) -> bool {
        false
    }

    /// `None` means the hook is not interested in this request.
    async fn match_request(&self, request: &HookRequest) -> Result<Option<Decision>>;

    /// Called once the request body is complete. `None` keeps the earlier decision.
    async fn on_matched_request(
        &self,
        _request: &HookRequest,
        _body: Option<&HookBody>,
    ) -> Result<Option<Decision>> {
        Ok(None)
    }

    async fn on_matched_response(
        &self,
        _response: &HookResponse,
        _body: Option<&HookBody>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered, immutable list of hooks shared by every connection.
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new(hooks: Vec<Arc<dyn Hook>>) -> Self {
        Self {
            inner: Arc::new(RegistryInner { hooks }),
        }
    }

    /// Registers one [`RuleHook`] per configured rule, then `extra` in order.
    pub fn from_config(cfg: &HooksConfig, extra: Vec<Arc<dyn Hook>>) -> Result<Self> {
        let mut hooks: Vec<Arc<dyn Hook>> = Vec::with_capacity(cfg.rules.len() + extra.len());
        for rule in &cfg.rules {
            hooks.push(Arc::new(RuleHook::new(rule.clone())?));
        }
        hooks.extend(extra);
        Ok(Self::new(hooks))
    }

    pub fn len(&self) -> usize {
        self.inner.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.hooks.is_empty()
    }

    fn hook(&self, index: usize) -> &Arc<dyn Hook> {
        &self.inner.hooks[index]
    }

    /// Runs `match_request` on every hook in registration order.
    pub async fn dispatch(&self, request: &HookRequest) -> Dispatch {
        let mut matched = MatchedSet {
            registry: self.clone(),
            hooks: Vec::new(),
            replacement: None,
        };

        for (index, hook) in self.inner.hooks.iter().enumerate() {
            match hook.match_request(request).await {
                Ok(None) => {}
                Ok(Some(Decision::FakeResponse(response))) => {
                    tracing::debug!(hook = hook.name(), url = %request.url, "hook serves fake response");
                    return Dispatch::Fake { index, response };
                }
                Ok(Some(Decision::PassOnRequest {
                    intercept_response,
                    replace_request,
                })) => {
                    matched.push(index, intercept_response);
                    if let Some(replacement) = replace_request {
                        matched
                            .replacement
                            .get_or_insert_with(RequestReplacement::default)
                            .merge(replacement);
                    }
                }
                Ok(Some(Decision::PassOnRequestBody { intercept_response })) => {
                    matched.push(index, intercept_response);
                }
                Err(err) if hook.fail_closed() => {
                    tracing::error!(hook = hook.name(), url = %request.url, "fail-closed hook errored: {err:#}");
                    return Dispatch::Fail(ProxyError::HookFailed {
                        hook: hook.name().to_string(),
                        reason: format!("{err:#}"),
                    });
                }
                Err(err) => {
                    tracing::warn!(hook = hook.name(), url = %request.url, "hook errored, treating as unmatched: {err:#}");
                }
            }
        }

        Dispatch::Pass(matched)
    }

    /// Shows a served fake to the hook that produced it, when it asked for that.
    pub async fn observe_fake(&self, index: usize, fake: &FakeResponse, body: Option<&HookBody>) {
        if !fake.intercept_response {
            return;
        }
        let hook = self.hook(index);
        let response = HookResponse::from(&fake.response_parts());
        if let Err(err) = hook.on_matched_response(&response, body).await {
            tracing::warn!(hook = hook.name(), "on_matched_response failed: {err:#}");
        }
    }
}

/// Outcome of running `match_request` across the registry.
pub enum Dispatch {
    /// Serve `response` without contacting the upstream.
    Fake { index: usize, response: FakeResponse },
    /// A fail-closed hook errored.
    Fail(ProxyError),
    /// Relay; the set may be empty.
    Pass(MatchedSet),
}

/// Hooks that matched one exchange and whether each wants the response.
pub struct MatchedSet {
    registry: HookRegistry,
    hooks: Vec<MatchedHook>,
    replacement: Option<RequestReplacement>,
}

#[derive(Debug, Clone, Copy)]
struct MatchedHook {
    index: usize,
    intercept_response: bool,
}

impl MatchedSet {
    fn push(&mut self, index: usize, intercept_response: bool) {
        self.hooks.push(MatchedHook {
            index,
            intercept_response,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn replacement(&self) -> Option<&RequestReplacement> {
        self.replacement.as_ref()
    }

    /// True when any matched hook asked for the response body.
    pub fn intercepts_response(&self) -> bool {
        self.hooks.iter().any(|hook| hook.intercept_response)
    }

    /// Runs `on_matched_request` on each matched hook, in registration order.
    ///
    /// Returns a fake response if a hook produced one at this stage. A failing hook
    /// drops out of the set, or fails the exchange if it is fail-closed.
    pub async fn on_request_complete(
        &mut self,
        request: &HookRequest,
        body: Option<&HookBody>,
    ) -> Result<Option<(usize, FakeResponse)>, ProxyError> {
        let mut survivors = Vec::with_capacity(self.hooks.len());
        let mut late_fake = None;

        for mut entry in self.hooks.drain(..) {
            if late_fake.is_some() {
                survivors.push(entry);
                continue;
            }
            let hook = self.registry.hook(entry.index);
            match hook.on_matched_request(request, body).await {
                Ok(None) => survivors.push(entry),
                Ok(Some(Decision::FakeResponse(fake))) => {
                    late_fake = Some((entry.index, fake));
                    survivors.push(entry);
                }
                Ok(Some(decision)) => {
                    entry.intercept_response |= decision.intercept_response();
                    survivors.push(entry);
                }
                Err(err) if hook.fail_closed() => {
                    tracing::error!(hook = hook.name(), url = %request.url, "fail-closed hook errored on request body: {err:#}");
                    return Err(ProxyError::HookFailed {
                        hook: hook.name().to_string(),
                        reason: format!("{err:#}"),
                    });
                }
                Err(err) => {
                    tracing::warn!(hook = hook.name(), url = %request.url, "on_matched_request failed, dropping hook: {err:#}");
                }
            }
        }

        self.hooks = survivors;
        Ok(late_fake)
    }

    /// Delivers the finished response to every matched hook, in registration order.
    pub async fn on_response_complete(&self, response: &HookResponse, body: Option<&HookBody>) {
        for entry in &self.hooks {
            let hook = self.registry.hook(entry.index);
            if let Err(err) = hook.on_matched_response(response, body).await {
                tracing::warn!(hook = hook.name(), "on_matched_response failed: {err:#}");
            }
        }
    }
}
