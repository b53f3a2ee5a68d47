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

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};

use super::{Decision, FakeResponse, Hook, HookRequest, HookResponse};
use crate::{
    config::{HookRuleConfig, RuleAction},
    proxy::body::HookBody,
};

/// Longest text excerpt a capture rule writes to the log.
const CAPTURE_EXCERPT_CHARS: usize = 512;

/// Hook driven by a `[[hooks.rules]]` table: URL-prefix plus method matching, answering
/// with a canned response (`fake`) or logging the decoded response (`capture`).
#[derive(Debug, Clone)]
pub struct RuleHook {
    rule: HookRuleConfig,
    methods: Vec<Method>,
    status: StatusCode,
}

impl RuleHook {
    pub fn new(rule: HookRuleConfig) -> Result<Self> {
        let methods = rule
            .methods
            .iter()
            .map(|name| {
                Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                    .with_context(|| format!("rule {}: invalid method {name:?}", rule.name))
            })
            .collect::<Result<Vec<_>>>()?;
        let status = StatusCode::from_u16(rule.status)
            .map_err(|_| anyhow!("rule {}: invalid status {}", rule.name, rule.status))?;
        if rule.url_prefix.is_empty() {
            return Err(anyhow!("rule {}: url_prefix must not be empty", rule.name));
        }
        Ok(Self {
            rule,
            methods,
            status,
        })
    }

    fn matches(&self, request: &HookRequest) -> bool {
        let method_ok = self.methods.is_empty() || self.methods.contains(&request.method);
        method_ok && request.url.to_string().starts_with(&self.rule.url_prefix)
    }

    fn fake_response(&self) -> FakeResponse {
        let content_type = self
            .rule
            .content_type
            .as_deref()
            .unwrap_or("text/plain; charset=utf-8");
        FakeResponse::new(self.status)
            .with_body(content_type, Bytes::from(self.rule.body.clone()))
    }
}

#[async_trait]
impl Hook for RuleHook {
    fn name(&self) -> &str {
        &self.rule.name
    }

    fn fail_closed(&self) -> bool {
        self.rule.action == RuleAction::Fake
    }

    async fn match_request(&self, request: &HookRequest) -> Result<Option<Decision>> {
        if !self.matches(request) {
            return Ok(None);
        }
        let decision = match self.rule.action {
            RuleAction::Fake => Decision::FakeResponse(self.fake_response()),
            RuleAction::Capture => Decision::intercept(),
        };
        Ok(Some(decision))
    }

    async fn on_matched_request(
        &self,
        request: &HookRequest,
        body: Option<&HookBody>,
    ) -> Result<Option<Decision>> {
        tracing::debug!(
            rule = %self.rule.name,
            method = %request.method,
            url = %request.url,
            body_len = body.map(HookBody::len).unwrap_or(0),
            "captured request"
        );
        Ok(None)
    }

    async fn on_matched_response(
        &self,
        response: &HookResponse,
        body: Option<&HookBody>,
    ) -> Result<()> {
        let excerpt = match body {
            Some(HookBody::Text(text)) => text.chars().take(CAPTURE_EXCERPT_CHARS).collect(),
            Some(HookBody::Binary(bytes)) => format!("<{} binary bytes>", bytes.len()),
            None => String::from("<not buffered>"),
        };
        tracing::info!(
            rule = %self.rule.name,
            status = response.status.as_u16(),
            body_len = body.map(HookBody::len).unwrap_or(0),
            excerpt = %excerpt,
            "captured response"
        );
        Ok(())
    }
}
