//! Router-level authentication tests.
//!
//! Every test builds the real router over the in-memory store and drives it
//! with `tower::ServiceExt::oneshot`. Covers:
//! 1. JWT, PAT and API token principals
//! 2. SSO enforcement for opaque tokens and the SSO redirect for sessions
//! 3. Silent refresh through cookies and refresh-token reuse
//! 4. Impersonation scope gating and the system-admin overlay

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use common::*;

mod jwt_tests {
    use super::*;

    #[tokio::test]
    async fn bearer_access_token_attaches_principal() {
        let h = Harness::new();
        let token = h.access_token(USER, ORG);

        let resp = h.send(get("/v1/me", &token)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], "u-7");
        assert_eq!(body["organization_id"], "org-42");
        assert_eq!(body["authentication_type"], "jwt");
        assert!(body.get("impersonation").is_none());
    }

    #[tokio::test]
    async fn missing_and_garbage_credentials_get_uniform_401() {
        let h = Harness::new();

        let resp = h
            .send(Request::get("/v1/me").body(Body::empty()).unwrap())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));

        let resp = h.send(get("/v1/me", "not-a-token")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));

        let resp = h
            .send(
                Request::get("/v1/me")
                    .header("authorization", "Basic dXNlcjpwYXNz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn expired_access_token_without_refresh_is_rejected() {
        let h = Harness::new();
        let pair = h.pair_issued_at(USER, ORG, Utc::now() - ChronoDuration::minutes(70));

        let resp = h.send(get("/v1/me", &pair.access_token)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));
    }

    #[tokio::test]
    async fn access_cookie_is_accepted() {
        let h = Harness::new();
        let token = h.access_token(USER, ORG);
        let resp = h
            .send(
                Request::get("/v1/me")
                    .header(header::COOKIE, format!("theme=dark; access_token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn public_routes_need_no_credentials() {
        tokio_test::block_on(async {
            let h = Harness::new();

            let resp = h
                .send(Request::get("/healthz").body(Body::empty()).unwrap())
                .await;
            assert_eq!(resp.status(), StatusCode::OK);

            let resp = h
                .send(
                    Request::get("/.well-known/jwks.json")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await;
            assert_eq!(resp.status(), StatusCode::OK);
            let jwks = body_json(resp).await;
            let keys = jwks["keys"].as_array().unwrap();
            assert_eq!(keys.len(), 1);
            assert_eq!(keys[0]["kid"], h.tokens.kid());
        });
    }

    #[tokio::test]
    async fn preflight_requests_skip_authentication() {
        let h = Harness::new();
        let resp = h
            .send(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_ne!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

mod opaque_token_tests {
    use super::*;

    #[tokio::test]
    async fn pat_selects_active_organization_from_header() {
        let h = Harness::new();
        let (_, pat) = h.issue_pat(USER, &[ORG, OTHER_ORG]).await;

        let resp = h.send(get("/v1/me", &pat)).await;
        let body = body_json(resp).await;
        assert_eq!(body["authentication_type"], "pat");
        assert_eq!(body["organization_id"], ORG);
        assert_eq!(body["organization_ids"], json!([ORG, OTHER_ORG]));

        let resp = h
            .send(
                bearer("GET", "/v1/me", &pat)
                    .header("x-organization-id", OTHER_ORG)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(body_json(resp).await["organization_id"], OTHER_ORG);

        // An organization the token is not authorized for falls back to the first.
        let resp = h
            .send(
                bearer("GET", "/v1/me", &pat)
                    .header("x-organization-id", "org-unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(body_json(resp).await["organization_id"], ORG);
    }

    #[tokio::test]
    async fn api_token_runs_as_its_organization() {
        let h = Harness::new();
        let (id, token) = h.issue_api_token(ORG).await;

        let resp = h.send(get("/v1/me", &token)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["authentication_type"], "api_token");
        assert_eq!(body["subject_id"], id);
        assert_eq!(body["organization_id"], ORG);
        assert_eq!(body["is_system_admin"], false);
    }

    #[tokio::test]
    async fn expired_pat_is_rejected() {
        let h = Harness::new();
        let (id, pat) = h.issue_pat(USER, &[ORG]).await;
        h.store
            .update_personal_access_token(&id, |r| {
                r.expires_at = Some(Utc::now() - ChronoDuration::minutes(1))
            })
            .unwrap();

        let resp = h.send(get("/v1/me", &pat)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn tampered_ciphertext_rejects_without_logging_plaintext() {
        let h = Harness::new();
        let (id, pat) = h.issue_pat(USER, &[ORG]).await;
        h.store
            .update_personal_access_token(&id, |r| {
                let last = r.encrypted_token.pop().unwrap();
                r.encrypted_token.push(if last == 'A' { 'B' } else { 'A' });
            })
            .unwrap();

        let (logs, _guard) = capture_logs();
        let resp = h.send(get("/v1/me", &pat)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));

        let output = logs.contents();
        assert!(output.contains("stored token could not be opened"));
        assert!(!output.contains(&pat));
    }

    #[tokio::test]
    async fn altered_token_is_unknown() {
        let h = Harness::new();
        let (_, pat) = h.issue_pat(USER, &[ORG]).await;
        let mut altered = pat.clone();
        altered.push('x');

        let resp = h.send(get("/v1/me", &altered)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

mod sso_tests {
    use super::*;

    #[tokio::test]
    async fn pat_requires_sso_until_authorized() {
        let h = Harness::new();
        h.store.set_sso_policy(ORG, true);
        let (id, pat) = h.issue_pat(USER, &[ORG]).await;

        let resp = h.send(get("/v1/organizations", &pat)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));

        // The owner of the token completes SSO from a browser session.
        let session = h.access_token(USER, ORG);
        let resp = h
            .send(
                bearer("POST", &format!("/v1/sso/tokens/{}/authorize", id), &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = h.send(get("/v1/organizations", &pat)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["organizations"][0]["id"], ORG);
        assert_eq!(body["organizations"][0]["active"], true);
    }

    #[tokio::test]
    async fn stale_authorization_is_unauthorized() {
        let h = Harness::new();
        h.store.set_sso_policy(ORG, true);
        let (id, pat) = h.issue_pat(USER, &[ORG]).await;
        h.store
            .update_personal_access_token(&id, |r| {
                r.sso_authorizations
                    .insert(ORG.into(), Utc::now() - ChronoDuration::days(2));
            })
            .unwrap();

        let resp = h.send(get("/v1/me", &pat)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn every_authorized_organization_is_checked() {
        let h = Harness::new();
        h.store.set_sso_policy(OTHER_ORG, true);
        let (id, pat) = h.issue_pat(USER, &[ORG, OTHER_ORG]).await;

        let resp = h.send(get("/v1/me", &pat)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        h.store
            .update_personal_access_token(&id, |r| {
                r.sso_authorizations.insert(OTHER_ORG.into(), Utc::now());
            })
            .unwrap();
        let resp = h.send(get("/v1/me", &pat)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_token_sso_is_recorded_by_org_members() {
        let h = Harness::new();
        h.store.set_sso_policy(ORG, true);
        let (id, token) = h.issue_api_token(ORG).await;

        let resp = h.send(get("/v1/me", &token)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Opaque tokens cannot authorize themselves.
        let resp = h
            .send(
                bearer("POST", &format!("/v1/sso/tokens/{}/authorize", id), &token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let session = h.access_token(OWNER, ORG);
        let resp = h
            .send(
                bearer("POST", &format!("/v1/sso/tokens/{}/authorize", id), &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(h.store.api_token(&id).unwrap().sso_authorizations.contains_key(ORG));

        let resp = h.send(get("/v1/me", &token)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cannot_authorize_someone_elses_token() {
        let h = Harness::new();
        let (id, _) = h.issue_pat(OWNER, &[ORG]).await;
        let session = h.access_token(USER, ORG);

        let resp = h
            .send(
                bearer("POST", &format!("/v1/sso/tokens/{}/authorize", id), &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(h.store.personal_access_token(&id).unwrap().sso_authorizations.is_empty());
    }

    #[tokio::test]
    async fn failed_session_in_enforced_org_redirects_members_but_not_owners() {
        let h = Harness::new();
        h.store.set_sso_policy(ORG, true);
        let issued_at = Utc::now() - ChronoDuration::minutes(70);

        let member = h.pair_issued_at(USER, ORG, issued_at);
        let resp = h.send(get("/v1/me", &member.access_token)).await;
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers()[header::LOCATION],
            "/v1/sso/login?organization_id=org-42"
        );

        let owner = h.pair_issued_at(OWNER, ORG, issued_at);
        let resp = h.send(get("/v1/me", &owner.access_token)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

mod refresh_tests {
    use super::*;

    fn set_cookies(resp: &axum::http::Response<Body>) -> Vec<String> {
        resp.headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn expired_session_refreshes_silently_once() {
        let h = Harness::new();
        let pair = h.pair_issued_at(USER, ORG, Utc::now() - ChronoDuration::minutes(61));

        let (logs, _guard) = capture_logs();
        let resp = h
            .send(
                Request::get("/v1/me")
                    .header(
                        header::COOKIE,
                        format!(
                            "access_token={}; refresh_token={}",
                            pair.access_token, pair.refresh_token
                        ),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let cookies = set_cookies(&resp);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().any(|c| c.starts_with("access_token=")));
        assert!(cookies.iter().any(|c| c.starts_with("refresh_token=")));
        assert!(cookies.iter().all(|c| c.contains("HttpOnly") && c.contains("SameSite=Lax")));

        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], USER);
        assert_eq!(body["organization_id"], ORG);
        assert_eq!(logs.contents().matches("refresh_attempt").count(), 1);
        assert!(!logs.contents().contains(&pair.refresh_token));
    }

    #[tokio::test]
    async fn refresh_cookie_alone_starts_a_session() {
        let h = Harness::new();
        let pair = h.pair_issued_at(USER, ORG, Utc::now() - ChronoDuration::minutes(50));

        let resp = h
            .send(
                Request::get("/v1/me")
                    .header(header::COOKIE, format!("refresh_token={}", pair.refresh_token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(set_cookies(&resp).len(), 2);
    }

    #[tokio::test]
    async fn consumed_refresh_token_cannot_be_replayed() {
        let h = Harness::new();
        let pair = h.pair_issued_at(USER, ORG, Utc::now() - ChronoDuration::minutes(50));
        let body = json!({ "refresh_token": pair.refresh_token });

        let resp = h
            .send(json_request("POST", "/v1/refresh", "", body.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let fresh = body_json(resp).await;
        let access = fresh["access_token"].as_str().unwrap();
        assert_eq!(h.send(get("/v1/me", access)).await.status(), StatusCode::OK);

        let resp = h.send(json_request("POST", "/v1/refresh", "", body)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await, json!({ "error": "UNAUTHORIZED" }));
    }

    #[tokio::test]
    async fn refresh_token_is_not_an_access_token() {
        let h = Harness::new();
        let pair = h.pair_issued_at(USER, ORG, Utc::now() - ChronoDuration::minutes(50));
        let resp = h.send(get("/v1/me", &pair.refresh_token)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}

mod impersonation_tests {
    use super::*;

    fn impersonated(method: &str, uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        json_request(method, uri, &format!("Impersonation {}", token), body)
    }

    #[tokio::test]
    async fn read_scope_cannot_reach_write_routes() {
        let h = Harness::new();
        let token = h.impersonation_token(&["read"]);

        let resp = h
            .send(impersonated(
                "POST",
                "/v1/integrations/vanta/credentials",
                &token,
                json!({ "api_token": "vt-123" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"], "UNAUTHORIZED_SCOPE");
    }

    #[tokio::test]
    async fn wildcard_scope_admits_write_routes() {
        let h = Harness::new();
        let token = h.impersonation_token(&["*"]);

        let resp = h
            .send(impersonated(
                "POST",
                "/v1/integrations/vanta/credentials",
                &token,
                json!({ "api_token": "vt-123" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["provider_type"], "vanta");
    }

    #[tokio::test]
    async fn request_runs_as_target_and_remembers_impersonator() {
        let h = Harness::new();
        let token = h.impersonation_token(&["read"]);

        let resp = h
            .send(
                Request::get("/v1/me")
                    .header("authorization", format!("Impersonation {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], USER);
        assert_eq!(body["organization_id"], ORG);
        assert_eq!(body["is_system_admin"], false);
        assert_eq!(body["impersonation"]["impersonator_id"], ADMIN);
        assert_eq!(body["impersonation"]["scopes"], json!(["read"]));
    }

    #[tokio::test]
    async fn sensitive_routes_refuse_impersonation() {
        let h = Harness::new();
        let token = h.impersonation_token(&["*"]);

        let resp = h
            .send(impersonated("DELETE", "/v1/integrations/vanta", &token, json!({})))
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn access_token_is_not_an_impersonation_token() {
        let h = Harness::new();
        let access = h.access_token(USER, ORG);
        let resp = h
            .send(
                Request::get("/v1/me")
                    .header("authorization", format!("Impersonation {}", access))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    fn with_session_cookie(token: &str, session: &str) -> Request<Body> {
        Request::get("/v1/me")
            .header("authorization", format!("Impersonation {}", token))
            .header(header::COOKIE, format!("access_token={}", session))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn token_presented_from_another_users_session_is_rejected() {
        let h = Harness::new();
        let token = h.impersonation_token(&["read"]);
        let owner_session = h.access_token(OWNER, ORG);

        let resp = h.send(with_session_cookie(&token, &owner_session)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn impersonators_own_session_is_accepted() {
        let h = Harness::new();
        let token = h.impersonation_token(&["read"]);
        let admin_session = h.access_token(ADMIN, ORG);

        let resp = h.send(with_session_cookie(&token, &admin_session)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], USER);
        assert_eq!(body["impersonation"]["impersonator_id"], ADMIN);
    }
}

mod impersonation_session_tests {
    use super::*;

    fn start(token: &str, body: serde_json::Value) -> Request<Body> {
        json_request("POST", "/v1/impersonation/start", &format!("Bearer {}", token), body)
    }

    fn support_request(target: &str) -> serde_json::Value {
        json!({ "target_user_id": target, "type": "support", "reason": "ticket 1234" })
    }

    #[tokio::test]
    async fn system_admin_opens_a_session_with_default_scopes() {
        let h = Harness::new();
        let admin = h.access_token(ADMIN, ORG);
        let (logs, _guard) = capture_logs();

        let resp = h.send(start(&admin, support_request(USER))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let reply = body_json(resp).await;
        assert_eq!(reply["success"], true);
        assert_eq!(reply["scopes"], json!(["read", "debug"]));
        let session_id = reply["session_id"].as_str().unwrap().to_string();
        let token = reply["token"].as_str().unwrap().to_string();

        let logged = logs.contents();
        assert!(logged.contains("impersonation event"));
        assert!(logged.contains("action=\"start\""));
        assert!(logged.contains(&session_id));

        let resp = h
            .send(
                Request::get("/v1/me")
                    .header("authorization", format!("Impersonation {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let me = body_json(resp).await;
        assert_eq!(me["subject_id"], USER);
        assert_eq!(me["impersonation"]["impersonator_id"], ADMIN);
        assert_eq!(me["impersonation"]["session_id"], session_id.as_str());
    }

    #[tokio::test]
    async fn admin_type_grants_wildcard_scope() {
        let h = Harness::new();
        let admin = h.access_token(ADMIN, ORG);
        let resp = h
            .send(start(
                &admin,
                json!({ "target_user_id": USER, "type": "admin", "reason": "migration", "duration": 2 }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["scopes"], json!(["*"]));
    }

    #[tokio::test]
    async fn members_cannot_impersonate() {
        let h = Harness::new();
        let owner = h.access_token(OWNER, ORG);
        for kind in ["support", "admin", "job"] {
            let resp = h
                .send(start(
                    &owner,
                    json!({ "target_user_id": USER, "type": kind, "reason": "curious" }),
                ))
                .await;
            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(body_json(resp).await["error"], "FORBIDDEN");
        }
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let h = Harness::new();
        let admin = h.access_token(ADMIN, ORG);

        let resp = h
            .send(start(
                &admin,
                json!({ "target_user_id": USER, "type": "root", "reason": "x" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "VALIDATION_ERROR");

        let resp = h
            .send(start(
                &admin,
                json!({ "target_user_id": USER, "type": "support", "reason": "  " }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = h.send(start(&admin, support_request(ADMIN))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn target_must_belong_to_the_organization() {
        let h = Harness::new();
        let admin = h.access_token(ADMIN, ORG);
        let resp = h
            .send(start(
                &admin,
                json!({
                    "target_user_id": OWNER,
                    "organization_id": OTHER_ORG,
                    "type": "support",
                    "reason": "ticket 99"
                }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = h.send(start(&admin, support_request("u-ghost"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cannot_start_while_impersonating() {
        let h = Harness::new();
        let token = h.impersonation_token(&["*"]);
        let resp = h
            .send(json_request(
                "POST",
                "/v1/impersonation/start",
                &format!("Impersonation {}", token),
                support_request(OWNER),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"], "UNAUTHORIZED");
    }

    async fn open_session(h: &Harness) -> (String, String) {
        let admin = h.access_token(ADMIN, ORG);
        let reply = body_json(h.send(start(&admin, support_request(USER))).await).await;
        (
            reply["token"].as_str().unwrap().to_string(),
            reply["session_id"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn end_checks_the_session_id() {
        let h = Harness::new();
        let (token, session_id) = open_session(&h).await;
        let auth = format!("Impersonation {}", token);

        let resp = h
            .send(json_request(
                "POST",
                "/v1/impersonation/end",
                &auth,
                json!({ "session_id": "some-other-session" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "BAD_REQUEST");

        let (logs, _guard) = capture_logs();
        let resp = h
            .send(json_request(
                "POST",
                "/v1/impersonation/end",
                &auth,
                json!({ "session_id": session_id, "reason": "resolved" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["success"], true);
        assert!(logs.contents().contains("action=\"end\""));
    }

    #[tokio::test]
    async fn end_without_a_session_is_a_bad_request() {
        let h = Harness::new();
        let admin = h.access_token(ADMIN, ORG);
        let resp = h
            .send(json_request(
                "POST",
                "/v1/impersonation/end",
                &format!("Bearer {}", admin),
                json!({ "session_id": "anything" }),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

mod admin_overlay_tests {
    use super::*;

    fn acting_as(token: &str, user: &str, org: &str) -> Request<Body> {
        bearer("GET", "/v1/me", token)
            .header("x-user-id", user)
            .header("x-organization-id", org)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn system_admin_acts_as_user_in_organization() {
        let h = Harness::new();
        let token = h.access_token(ADMIN, ORG);

        let resp = h.send(acting_as(&token, USER, OTHER_ORG)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], USER);
        assert_eq!(body["organization_id"], OTHER_ORG);
        assert_eq!(body["is_system_admin"], false);
        assert_eq!(body["acting_admin_id"], ADMIN);
    }

    #[tokio::test]
    async fn headers_are_ignored_for_regular_users() {
        let h = Harness::new();
        let token = h.access_token(USER, ORG);

        let resp = h.send(acting_as(&token, OWNER, ORG)).await;
        let body = body_json(resp).await;
        assert_eq!(body["subject_id"], USER);
        assert!(body.get("acting_admin_id").is_none());
    }

    #[tokio::test]
    async fn unknown_target_is_rejected() {
        let h = Harness::new();
        let token = h.access_token(ADMIN, ORG);
        let resp = h.send(acting_as(&token, "u-missing", ORG)).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn only_system_admins_set_modules() {
        let h = Harness::new();
        let body = json!({ "modules": ["integrations", "compliance"] });

        let user = h.access_token(USER, ORG);
        let resp = h
            .send(json_request(
                "PUT",
                "/v1/organizations/org-42/modules",
                &format!("Bearer {}", user),
                body.clone(),
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let admin = h.access_token(ADMIN, ORG);
        let resp = h
            .send(json_request(
                "PUT",
                "/v1/organizations/org-42/modules",
                &format!("Bearer {}", admin),
                body,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = h.send(get("/v1/modules", &user)).await;
        let mut modules: Vec<String> =
            serde_json::from_value(body_json(resp).await["modules"].clone()).unwrap();
        modules.sort();
        assert_eq!(modules, ["compliance", "integrations"]);
    }
}
