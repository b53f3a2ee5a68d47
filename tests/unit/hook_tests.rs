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

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use mitm_gateway::{
    config::{HookRuleConfig, HooksConfig, RuleAction},
    proxy::{
        hooks::{Dispatch, RuleHook},
        Decision, FakeResponse, Hook, HookBody, HookRegistry, HookRequest, HookResponse,
        RequestReplacement,
    },
    utils::ProxyError,
};

/// Hook with scripted answers that counts how often each method runs.
#[derive(Default)]
struct Scripted {
    name: &'static str,
    on_match: Option<Decision>,
    on_body: Option<Decision>,
    fail_match: bool,
    fail_body: bool,
    fail_closed: bool,
    matches: AtomicUsize,
    bodies: AtomicUsize,
    responses: AtomicUsize,
}

impl Scripted {
    fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Hook for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn fail_closed(&self) -> bool {
        self.fail_closed
    }

    async fn match_request(&self, _request: &HookRequest) -> Result<Option<Decision>> {
        self.matches.fetch_add(1, Ordering::SeqCst);
        if self.fail_match {
            return Err(anyhow!("{} broke while matching", self.name));
        }
        Ok(self.on_match.clone())
    }

    async fn on_matched_request(
        &self,
        _request: &HookRequest,
        _body: Option<&HookBody>,
    ) -> Result<Option<Decision>> {
        self.bodies.fetch_add(1, Ordering::SeqCst);
        if self.fail_body {
            return Err(anyhow!("{} broke on the body", self.name));
        }
        Ok(self.on_body.clone())
    }

    async fn on_matched_response(
        &self,
        _response: &HookResponse,
        _body: Option<&HookBody>,
    ) -> Result<()> {
        self.responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn request(method: Method, url: &str) -> HookRequest {
    HookRequest {
        method,
        url: url.parse::<Uri>().unwrap(),
        version: Version::HTTP_2,
        headers: HeaderMap::new(),
    }
}

fn response() -> HookResponse {
    HookResponse {
        status: StatusCode::OK,
        status_message: "OK".into(),
        version: Version::HTTP_2,
        headers: HeaderMap::new(),
    }
}

fn registry(hooks: Vec<Arc<Scripted>>) -> HookRegistry {
    HookRegistry::new(hooks.into_iter().map(|h| h as Arc<dyn Hook>).collect())
}

#[tokio::test]
async fn first_fake_short_circuits_later_hooks() {
    let observer = Arc::new(Scripted {
        on_match: Some(Decision::intercept()),
        ..Scripted::named("observer")
    });
    let blocker = Arc::new(Scripted {
        on_match: Some(Decision::FakeResponse(FakeResponse::new(StatusCode::NO_CONTENT))),
        ..Scripted::named("blocker")
    });
    let late = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        ..Scripted::named("late")
    });
    let hooks = registry(vec![observer.clone(), blocker.clone(), late.clone()]);

    match hooks.dispatch(&request(Method::GET, "https://api.game.test/x")).await {
        Dispatch::Fake { index, response } => {
            assert_eq!(index, 1);
            assert_eq!(response.status, StatusCode::NO_CONTENT);
        }
        _ => panic!("expected a fake response"),
    }
    assert_eq!(Scripted::count(&observer.matches), 1);
    assert_eq!(Scripted::count(&late.matches), 0);
}

#[tokio::test]
async fn erroring_hooks_fail_open_unless_fail_closed() {
    let flaky = Arc::new(Scripted {
        fail_match: true,
        ..Scripted::named("flaky")
    });
    let watcher = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        ..Scripted::named("watcher")
    });
    let hooks = registry(vec![flaky.clone(), watcher.clone()]);

    match hooks.dispatch(&request(Method::GET, "https://api.game.test/x")).await {
        Dispatch::Pass(matched) => assert_eq!(matched.len(), 1),
        _ => panic!("flaky hook must be treated as unmatched"),
    }

    let guard = Arc::new(Scripted {
        fail_match: true,
        fail_closed: true,
        ..Scripted::named("guard")
    });
    let hooks = registry(vec![guard, watcher]);
    match hooks.dispatch(&request(Method::GET, "https://api.game.test/x")).await {
        Dispatch::Fail(err) => {
            assert!(matches!(err, ProxyError::HookFailed { ref hook, .. } if hook == "guard"));
            assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        }
        _ => panic!("fail-closed hook must fail the exchange"),
    }
}

#[tokio::test]
async fn replacements_merge_with_earlier_hooks_winning() {
    let first = Arc::new(Scripted {
        on_match: Some(Decision::PassOnRequest {
            intercept_response: false,
            replace_request: Some(RequestReplacement {
                host: Some("mirror.game.test".into()),
                ..RequestReplacement::default()
            }),
        }),
        ..Scripted::named("first")
    });
    let second = Arc::new(Scripted {
        on_match: Some(Decision::PassOnRequest {
            intercept_response: false,
            replace_request: Some(RequestReplacement {
                host: Some("ignored.game.test".into()),
                path: Some("/v2/login".into()),
                method: None,
            }),
        }),
        ..Scripted::named("second")
    });
    let hooks = registry(vec![first, second]);

    let Dispatch::Pass(matched) = hooks.dispatch(&request(Method::POST, "https://api.game.test/v1/login")).await else {
        panic!("expected pass");
    };
    let replacement = matched.replacement().expect("replacement");
    assert_eq!(replacement.host.as_deref(), Some("mirror.game.test"));
    assert_eq!(replacement.path.as_deref(), Some("/v2/login"));
    assert!(replacement.method.is_none());
}

#[tokio::test]
async fn body_stage_can_upgrade_interception_and_drop_failures() {
    let upgrader = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        on_body: Some(Decision::PassOnRequestBody {
            intercept_response: true,
        }),
        ..Scripted::named("upgrader")
    });
    let broken = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        fail_body: true,
        ..Scripted::named("broken")
    });
    let hooks = registry(vec![upgrader.clone(), broken.clone()]);
    let req = request(Method::POST, "https://api.game.test/v1/sync");

    let Dispatch::Pass(mut matched) = hooks.dispatch(&req).await else {
        panic!("expected pass");
    };
    assert!(!matched.intercepts_response());

    let body = HookBody::Text("{\"sync\":1}".into());
    let late = matched.on_request_complete(&req, Some(&body)).await.expect("no fail-closed hooks");
    assert!(late.is_none());
    assert!(matched.intercepts_response());
    assert_eq!(matched.len(), 1, "broken hook drops out");

    matched.on_response_complete(&response(), None).await;
    assert_eq!(Scripted::count(&upgrader.responses), 1);
    assert_eq!(Scripted::count(&broken.responses), 0);
}

#[tokio::test]
async fn body_stage_fake_is_returned_to_the_relay() {
    let gate = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        on_body: Some(Decision::FakeResponse(
            FakeResponse::new(StatusCode::FORBIDDEN).with_body("text/plain", "denied"),
        )),
        ..Scripted::named("gate")
    });
    let hooks = registry(vec![gate]);
    let req = request(Method::POST, "https://api.game.test/v1/purchase");

    let Dispatch::Pass(mut matched) = hooks.dispatch(&req).await else {
        panic!("expected pass");
    };
    let (index, fake) = matched
        .on_request_complete(&req, None)
        .await
        .expect("ok")
        .expect("late fake");
    assert_eq!(index, 0);
    let parts = fake.response_parts();
    assert_eq!(parts.status, StatusCode::FORBIDDEN);
    assert_eq!(parts.headers["content-length"], "6");
}

#[test]
fn bodiless_fake_statuses_omit_content_length() {
    for status in [StatusCode::CONTINUE, StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED] {
        let fake = FakeResponse::new(status).with_body("text/plain", "ignored");
        let parts = fake.response_parts();
        assert!(!parts.headers.contains_key("content-length"), "{status}");
        assert!(fake.body_bytes().is_empty(), "{status}");
    }

    let empty = FakeResponse::new(StatusCode::OK).response_parts();
    assert_eq!(empty.headers["content-length"], "0");
}

#[tokio::test]
async fn fake_observer_runs_only_when_requested() {
    let mut fake = FakeResponse::new(StatusCode::OK).with_body("text/plain", "cached");
    let quiet = Arc::new(Scripted::named("quiet"));
    let hooks = registry(vec![quiet.clone()]);

    hooks.observe_fake(0, &fake, None).await;
    assert_eq!(Scripted::count(&quiet.responses), 0);

    fake.intercept_response = true;
    hooks
        .observe_fake(0, &fake, Some(&HookBody::Text("cached".into())))
        .await;
    assert_eq!(Scripted::count(&quiet.responses), 1);
}

fn rule(name: &str, url_prefix: &str, action: RuleAction) -> HookRuleConfig {
    HookRuleConfig {
        name: name.into(),
        url_prefix: url_prefix.into(),
        methods: Vec::new(),
        action,
        status: 204,
        body: String::new(),
        content_type: None,
    }
}

#[tokio::test]
async fn config_rules_register_before_extra_hooks() {
    let cfg = HooksConfig {
        rules: vec![
            rule("silence", "https://crash.game.test/", RuleAction::Fake),
            rule("capture", "https://api.game.test/", RuleAction::Capture),
        ],
        ..HooksConfig::default()
    };
    let extra = Arc::new(Scripted {
        on_match: Some(Decision::pass()),
        ..Scripted::named("extra")
    });
    let hooks = HookRegistry::from_config(&cfg, vec![extra.clone() as Arc<dyn Hook>]).expect("registry");
    assert_eq!(hooks.len(), 3);

    match hooks.dispatch(&request(Method::POST, "https://crash.game.test/report")).await {
        Dispatch::Fake { index, response } => {
            assert_eq!(index, 0);
            assert_eq!(response.status, StatusCode::NO_CONTENT);
        }
        _ => panic!("expected fake"),
    }
    assert_eq!(Scripted::count(&extra.matches), 0);

    let Dispatch::Pass(matched) = hooks.dispatch(&request(Method::GET, "https://api.game.test/profile")).await else {
        panic!("expected pass");
    };
    assert_eq!(matched.len(), 2);
    assert!(matched.intercepts_response());
}

#[test]
fn invalid_rules_are_rejected() {
    let mut bad_method = rule("bad", "https://api.game.test/", RuleAction::Capture);
    bad_method.methods = vec!["NOT A METHOD".into()];
    assert!(RuleHook::new(bad_method).is_err());

    let mut bad_status = rule("bad", "https://api.game.test/", RuleAction::Fake);
    bad_status.status = 42;
    assert!(RuleHook::new(bad_status).is_err());

    assert!(RuleHook::new(rule("empty", "", RuleAction::Capture)).is_err());
}
