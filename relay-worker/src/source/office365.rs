use std::collections::BTreeSet;
use std::time;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use relay_common::event::Event;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::PollingSource;
use crate::error::{ActivationError, ApiError, SourceError};

pub const DATASOURCE: &str = "office365";

/// Office 365 audit records carry their identifier in `Id`.
pub const ID_FIELD: &str = "Id";

const MANAGEMENT_RESOURCE: &str = "https://manage.office.com";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const NEXT_PAGE_HEADER: &str = "NextPageUri";
const SUBSCRIPTION_ENABLED: &str = "enabled";

/// Content is listed a bit before the cursor: blobs are sometimes published late.
fn window_overlap() -> TimeDelta {
    TimeDelta::minutes(10)
}

/// The API refuses windows longer than a day.
fn max_window() -> TimeDelta {
    TimeDelta::hours(24)
}

/// The API keeps content for seven days.
fn max_backfill() -> TimeDelta {
    TimeDelta::days(7)
}

/// A reference to a blob holding a batch of audit records.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPointer {
    pub content_type: String,
    pub content_id: String,
    pub content_uri: String,
    pub content_created: String,
}

/// One page of content pointers, and where to find the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentPage {
    pub pointers: Vec<ContentPointer>,
    pub next_page: Option<String>,
}

/// Calls of the Office 365 Management Activity API the connector relies on.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Content types with an enabled subscription.
    async fn list_subscriptions(&self) -> Result<BTreeSet<String>, ApiError>;

    async fn activate_subscription(&self, content_type: &str) -> Result<(), ApiError>;

    /// List content created in `[start, end)`. `next_page` is the value returned by the
    /// previous page, if any.
    async fn list_content(
        &self,
        content_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        next_page: Option<&str>,
    ) -> Result<ContentPage, ApiError>;

    /// Fetch the records stored in a content blob.
    async fn get_content(&self, content_uri: &str) -> Result<Vec<Event>, ApiError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    content_type: String,
    status: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    // Returned as a string by the v1 endpoint.
    expires_in: Value,
}

struct AccessToken {
    value: String,
    expires_at: tokio::time::Instant,
}

/// HTTP client of the Management Activity API, authenticated with the client credentials grant.
pub struct HttpManagementApi {
    client: reqwest::Client,
    feed_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    publisher_id: String,
    token: Mutex<Option<AccessToken>>,
}

impl HttpManagementApi {
    pub fn new(
        base_url: &str,
        authority_url: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        publisher_id: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("intake-relay")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            feed_url: format!(
                "{}/{}/activity/feed",
                base_url.trim_end_matches('/'),
                tenant_id
            ),
            token_url: format!(
                "{}/{}/oauth2/token",
                authority_url.trim_end_matches('/'),
                tenant_id
            ),
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            publisher_id: publisher_id.to_owned(),
            token: Mutex::new(None),
        })
    }

    /// Return a valid bearer token, requesting a new one when the cached one is about to expire.
    async fn access_token(&self) -> Result<String, ApiError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > tokio::time::Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let authentication_error = |reason: String| ApiError::AuthenticationError {
            authority: self.token_url.clone(),
            reason,
        };

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("resource", MANAGEMENT_RESOURCE),
            ])
            .send()
            .await
            .map_err(|error| authentication_error(error.to_string()))?;

        if !response.status().is_success() {
            return Err(authentication_error(format!(
                "status {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|error| authentication_error(error.to_string()))?;

        let expires_in = match &token.expires_in {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        }
        .unwrap_or(0);

        // Renew a minute early so requests in flight do not carry an expired token.
        let lifetime = time::Duration::from_secs(expires_in.saturating_sub(60));
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: tokio::time::Instant::now() + lifetime,
        });

        debug!(expires_in, "acquired office365 access token");
        Ok(token.access_token)
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response, ApiError> {
        let token = self.access_token().await?;

        let response = request
            .bearer_auth(token)
            .query(&[("PublisherIdentifier", self.publisher_id.as_str())])
            .send()
            .await
            .map_err(|error| ApiError::RequestError {
                url: url.to_owned(),
                error,
            })?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::UnauthorizedError {
                url: url.to_owned(),
                status: response.status(),
            }),
            status if !status.is_success() => Err(ApiError::StatusError {
                url: url.to_owned(),
                status,
            }),
            _ => Ok(response),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, ApiError> {
        response.json().await.map_err(|error| ApiError::DecodeError {
            url: url.to_owned(),
            error,
        })
    }
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn list_subscriptions(&self) -> Result<BTreeSet<String>, ApiError> {
        let url = format!("{}/subscriptions/list", self.feed_url);
        let response = self.send(self.client.get(&url), &url).await?;
        let subscriptions: Vec<Subscription> = Self::decode(response, &url).await?;

        Ok(subscriptions
            .into_iter()
            .filter(|subscription| subscription.status == SUBSCRIPTION_ENABLED)
            .map(|subscription| subscription.content_type)
            .collect())
    }

    async fn activate_subscription(&self, content_type: &str) -> Result<(), ApiError> {
        let url = format!("{}/subscriptions/start", self.feed_url);
        let request = self
            .client
            .post(&url)
            .query(&[("contentType", content_type)])
            .header(header::CONTENT_LENGTH, 0);

        self.send(request, &url).await?;
        Ok(())
    }

    async fn list_content(
        &self,
        content_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        next_page: Option<&str>,
    ) -> Result<ContentPage, ApiError> {
        let (url, request) = match next_page {
            // The next page URI already carries every query parameter but the publisher.
            Some(next_page) => (next_page.to_owned(), self.client.get(next_page)),
            None => {
                let url = format!("{}/subscriptions/content", self.feed_url);
                let request = self.client.get(&url).query(&[
                    ("contentType", content_type.to_owned()),
                    ("startTime", start.format(TIME_FORMAT).to_string()),
                    ("endTime", end.format(TIME_FORMAT).to_string()),
                ]);
                (url, request)
            }
        };

        let response = self.send(request, &url).await?;
        let next_page = response
            .headers()
            .get(NEXT_PAGE_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_owned);
        let pointers: Vec<ContentPointer> = Self::decode(response, &url).await?;

        Ok(ContentPage {
            pointers,
            next_page,
        })
    }

    async fn get_content(&self, content_uri: &str) -> Result<Vec<Event>, ApiError> {
        let response = self.send(self.client.get(content_uri), content_uri).await?;
        Self::decode(response, content_uri).await
    }
}

/// Split `[start, end)` into consecutive windows the API accepts.
fn split_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let start = start.max(end - max_backfill());
    let mut windows = Vec::new();
    let mut window_start = start;

    while window_start < end {
        let window_end = (window_start + max_window()).min(end);
        windows.push((window_start, window_end));
        window_start = window_end;
    }

    windows
}

/// Polling source reading the Office 365 Management Activity API.
pub struct Office365Source<A> {
    api: A,
    content_types: BTreeSet<String>,
}

impl<A: ManagementApi> Office365Source<A> {
    /// `content_types` are the subscriptions that must be enabled before pulling.
    pub fn new(api: A, content_types: BTreeSet<String>) -> Self {
        Self { api, content_types }
    }

    /// Collect the records of every content blob of `content_type` listed in the window.
    async fn pull_content_type(
        &self,
        content_type: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        events: &mut Vec<Event>,
    ) -> Result<(), SourceError> {
        let mut next_page: Option<String> = None;

        loop {
            let page = match self
                .api
                .list_content(content_type, start, end, next_page.as_deref())
                .await
            {
                Ok(page) => page,
                Err(error) if error.is_systemic() => return Err(error.into()),
                Err(error) => {
                    warn!(content_type, %error, "failed to list office365 content, skipping");
                    metrics::counter!("relay_source_errors_total", "datasource" => DATASOURCE)
                        .increment(1);
                    return Ok(());
                }
            };

            for pointer in page.pointers {
                match self.api.get_content(&pointer.content_uri).await {
                    Ok(records) => events.extend(records),
                    Err(error) if error.is_systemic() => return Err(error.into()),
                    Err(error) => {
                        warn!(
                            content_type,
                            content_id = %pointer.content_id,
                            %error,
                            "failed to fetch office365 content, skipping"
                        );
                        metrics::counter!("relay_source_errors_total", "datasource" => DATASOURCE)
                            .increment(1);
                    }
                }
            }

            match page.next_page {
                Some(page) => next_page = Some(page),
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl<A: ManagementApi> PollingSource for Office365Source<A> {
    fn datasource(&self) -> &'static str {
        DATASOURCE
    }

    fn id_field(&self) -> &str {
        ID_FIELD
    }

    async fn activate(&self) -> Result<(), ActivationError> {
        let enabled = self.api.list_subscriptions().await?;
        let missing: BTreeSet<String> = self.content_types.difference(&enabled).cloned().collect();

        let mut failed = BTreeSet::new();
        for content_type in missing.iter() {
            match self.api.activate_subscription(content_type).await {
                Ok(()) => info!(%content_type, "activated office365 subscription"),
                Err(error) => {
                    warn!(%content_type, %error, "failed to activate office365 subscription");
                    failed.insert(content_type.clone());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ActivationError::SubscriptionsError {
                content_types: failed,
            })
        }
    }

    async fn pull(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Event>, SourceError> {
        let content_types = self.api.list_subscriptions().await?;
        let mut events = Vec::new();

        for (window_start, window_end) in split_window(start - window_overlap(), end) {
            for content_type in content_types.iter() {
                self.pull_content_type(content_type, window_start, window_end, &mut events)
                    .await?;
            }
        }

        debug!(count = events.len(), %start, %end, "pulled office365 events");
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    const TENANT: &str = "5a081dcf-3a2a-426b-938d-9ec84f259b5d";

    fn event(id: &str) -> Event {
        Event::try_from(json!({ "Id": id, "Operation": "UserLoggedIn" })).unwrap()
    }

    fn pointer(uri: &str) -> ContentPointer {
        ContentPointer {
            content_type: "Audit.SharePoint".to_owned(),
            content_id: uri.to_owned(),
            content_uri: uri.to_owned(),
            content_created: "2015-05-23T17:35:00.000Z".to_owned(),
        }
    }

    fn unauthorized() -> ApiError {
        ApiError::UnauthorizedError {
            url: "https://manage.office.com".to_owned(),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    fn unavailable() -> ApiError {
        ApiError::StatusError {
            url: "https://manage.office.com".to_owned(),
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// In-memory ManagementApi. Content URIs missing from `contents` fail with a 503.
    #[derive(Default)]
    struct FakeApi {
        enabled: BTreeSet<String>,
        refuse_activation: BTreeSet<String>,
        pages: HashMap<(String, Option<String>), ContentPage>,
        contents: HashMap<String, Result<Vec<Event>, bool>>,
        activated: StdMutex<Vec<String>>,
        windows: StdMutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl ManagementApi for FakeApi {
        async fn list_subscriptions(&self) -> Result<BTreeSet<String>, ApiError> {
            Ok(self.enabled.clone())
        }

        async fn activate_subscription(&self, content_type: &str) -> Result<(), ApiError> {
            if self.refuse_activation.contains(content_type) {
                return Err(unavailable());
            }
            self.activated.lock().unwrap().push(content_type.to_owned());
            Ok(())
        }

        async fn list_content(
            &self,
            content_type: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            next_page: Option<&str>,
        ) -> Result<ContentPage, ApiError> {
            self.windows.lock().unwrap().push((start, end));
            Ok(self
                .pages
                .get(&(content_type.to_owned(), next_page.map(str::to_owned)))
                .cloned()
                .unwrap_or_default())
        }

        async fn get_content(&self, content_uri: &str) -> Result<Vec<Event>, ApiError> {
            match self.contents.get(content_uri) {
                Some(Ok(events)) => Ok(events.clone()),
                // `true` marks an authorization failure.
                Some(Err(true)) => Err(unauthorized()),
                _ => Err(unavailable()),
            }
        }
    }

    fn types(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn test_activate_only_missing_subscriptions() {
        let api = FakeApi {
            enabled: types(&["Audit.Exchange"]),
            ..Default::default()
        };
        let source = Office365Source::new(api, types(&["Audit.Exchange", "Audit.SharePoint"]));

        source.activate().await.expect("activation failed");
        assert_eq!(
            *source.api.activated.lock().unwrap(),
            vec!["Audit.SharePoint".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_activate_reports_failing_content_types() {
        let api = FakeApi {
            refuse_activation: types(&["DLP.All"]),
            ..Default::default()
        };
        let source = Office365Source::new(api, types(&["Audit.General", "DLP.All"]));

        match source.activate().await {
            Err(ActivationError::SubscriptionsError { content_types }) => {
                assert_eq!(content_types, types(&["DLP.All"]))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            *source.api.activated.lock().unwrap(),
            vec!["Audit.General".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_pull_follows_pages_and_skips_failing_content() {
        let mut api = FakeApi {
            enabled: types(&["Audit.SharePoint"]),
            ..Default::default()
        };
        api.pages.insert(
            ("Audit.SharePoint".to_owned(), None),
            ContentPage {
                pointers: vec![pointer("blob-1"), pointer("blob-broken")],
                next_page: Some("page-2".to_owned()),
            },
        );
        api.pages.insert(
            ("Audit.SharePoint".to_owned(), Some("page-2".to_owned())),
            ContentPage {
                pointers: vec![pointer("blob-2")],
                next_page: None,
            },
        );
        api.contents
            .insert("blob-1".to_owned(), Ok(vec![event("1"), event("2")]));
        api.contents.insert("blob-2".to_owned(), Ok(vec![event("3")]));

        let source = Office365Source::new(api, types(&["Audit.SharePoint"]));
        let end = Utc::now();
        let start = end - TimeDelta::hours(3);

        let events = source.pull(start, end).await.expect("pull failed");
        assert_eq!(events, vec![event("1"), event("2"), event("3")]);

        let windows = source.api.windows.lock().unwrap();
        assert_eq!(windows[0], (start - window_overlap(), end));
    }

    #[tokio::test]
    async fn test_pull_propagates_authorization_failures() {
        let mut api = FakeApi {
            enabled: types(&["Audit.SharePoint"]),
            ..Default::default()
        };
        api.pages.insert(
            ("Audit.SharePoint".to_owned(), None),
            ContentPage {
                pointers: vec![pointer("blob-1")],
                next_page: None,
            },
        );
        api.contents.insert("blob-1".to_owned(), Err(true));

        let source = Office365Source::new(api, types(&["Audit.SharePoint"]));
        let end = Utc::now();

        assert!(matches!(
            source.pull(end - TimeDelta::hours(1), end).await,
            Err(SourceError::ApiError(ApiError::UnauthorizedError { .. }))
        ));
    }

    #[test]
    fn test_split_window() {
        let end = Utc::now();

        let windows = split_window(end - TimeDelta::hours(3), end);
        assert_eq!(windows, vec![(end - TimeDelta::hours(3), end)]);

        let windows = split_window(end - TimeDelta::hours(30), end);
        assert_eq!(
            windows,
            vec![
                (end - TimeDelta::hours(30), end - TimeDelta::hours(6)),
                (end - TimeDelta::hours(6), end),
            ]
        );

        let windows = split_window(end - TimeDelta::days(30), end);
        assert_eq!(windows.len(), 7);
        assert_eq!(windows[0].0, end - TimeDelta::days(7));

        assert!(split_window(end, end).is_empty());
    }

    fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path(format!("/{TENANT}/oauth2/token"))
                .body_contains("grant_type=client_credentials");
            then.status(200).json_body(json!({
                "access_token": "access_token",
                "token_type": "Bearer",
                "expires_in": "3599",
            }));
        })
    }

    fn http_api(server: &MockServer) -> HttpManagementApi {
        HttpManagementApi::new(
            &server.base_url(),
            &server.base_url(),
            TENANT,
            "client-id",
            "client-secret",
            "publisher-id",
            time::Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_list_subscriptions() {
        let server = MockServer::start();
        let token = mock_token(&server);
        let list = server.mock(|when, then| {
            when.method(GET)
                .path(format!("/{TENANT}/activity/feed/subscriptions/list"))
                .query_param("PublisherIdentifier", "publisher-id")
                .header("authorization", "Bearer access_token");
            then.status(200).json_body(json!([
                {"contentType": "Audit.SharePoint", "status": "enabled", "webhook": null},
                {"contentType": "Audit.Exchange", "status": "disabled", "webhook": null},
            ]));
        });

        let api = http_api(&server);
        let enabled = api.list_subscriptions().await.unwrap();
        // The token is cached across calls.
        api.list_subscriptions().await.unwrap();

        assert_eq!(enabled, types(&["Audit.SharePoint"]));
        token.assert_hits(1);
        list.assert_hits(2);
    }

    #[tokio::test]
    async fn test_http_list_content_pages_and_content() {
        let server = MockServer::start();
        mock_token(&server);
        let content_uri = server.url("/blob/1");
        let next_page = server.url("/next-page");

        let body = json!([{
            "contentType": "Audit.SharePoint",
            "contentId": "492638008028$04",
            "contentUri": content_uri,
            "contentCreated": "2015-05-23T17:35:00.000Z",
            "contentExpiration": "2015-05-30T17:35:00.000Z",
        }]);
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/{TENANT}/activity/feed/subscriptions/content"))
                .query_param("contentType", "Audit.SharePoint")
                .query_param("startTime", "2015-05-23T00:00:00")
                .query_param("endTime", "2015-05-24T00:00:00");
            then.status(200)
                .header(NEXT_PAGE_HEADER, next_page.as_str())
                .json_body(body.clone());
        });
        server.mock(|when, then| {
            when.method(GET).path("/next-page");
            then.status(200).json_body(json!([]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/blob/1");
            then.status(200).json_body(json!([
                {"Id": "80c76bd2-9d81-4c57-a97a-accfc3443dca", "Operation": "PasswordLogonInitialAuthUsingPassword"},
            ]));
        });

        let api = http_api(&server);
        let start = DateTime::parse_from_rfc3339("2015-05-23T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let end = start + TimeDelta::days(1);

        let page = api
            .list_content("Audit.SharePoint", start, end, None)
            .await
            .unwrap();
        assert_eq!(page.pointers.len(), 1);
        assert_eq!(page.next_page.as_deref(), Some(next_page.as_str()));

        let last = api
            .list_content("Audit.SharePoint", start, end, page.next_page.as_deref())
            .await
            .unwrap();
        assert_eq!(last, ContentPage::default());

        let events = api.get_content(&page.pointers[0].content_uri).await.unwrap();
        assert_eq!(
            events[0].id(ID_FIELD).as_deref(),
            Some("80c76bd2-9d81-4c57-a97a-accfc3443dca")
        );
    }

    #[tokio::test]
    async fn test_http_errors_are_classified() {
        let server = MockServer::start();
        mock_token(&server);
        server.mock(|when, then| {
            when.method(GET).path("/forbidden");
            then.status(403);
        });
        server.mock(|when, then| {
            when.method(GET).path("/unavailable");
            then.status(503);
        });

        let api = http_api(&server);

        let forbidden = api.get_content(&server.url("/forbidden")).await.unwrap_err();
        assert!(forbidden.is_systemic());

        let unavailable = api.get_content(&server.url("/unavailable")).await.unwrap_err();
        assert!(!unavailable.is_systemic());
    }

    #[tokio::test]
    async fn test_http_authentication_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(format!("/{TENANT}/oauth2/token"));
            then.status(400).json_body(json!({"error": "invalid_client"}));
        });

        let error = http_api(&server).list_subscriptions().await.unwrap_err();
        assert!(matches!(error, ApiError::AuthenticationError { .. }));
        assert!(error.is_systemic());
    }
}
