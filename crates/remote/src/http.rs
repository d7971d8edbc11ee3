use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use goalsync_core::DayStamp;

use crate::{GoalService, RemoteDatapoint, RemoteError};

/// Characters left untouched when a slug or id is placed in a URL path.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Datapoint as the service returns it.
#[derive(Debug, Deserialize)]
struct WireDatapoint {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    value: f64,
    #[serde(default)]
    daystamp: Option<String>,
    #[serde(default)]
    comment: Option<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected datapoint id: {other}"))),
    }
}

impl WireDatapoint {
    fn into_datapoint(self) -> RemoteDatapoint {
        // A day-stamp we cannot read is treated as "some other day" so the
        // reconciler creates instead of overwriting an unknown record.
        let daystamp = self.daystamp.as_deref().and_then(|raw| match raw.parse() {
            Ok(day) => Some(day),
            Err(err) => {
                debug!(%err, "ignoring unreadable remote daystamp");
                None
            }
        });
        RemoteDatapoint {
            id: self.id,
            value: self.value,
            daystamp,
            comment: self.comment.unwrap_or_default(),
        }
    }
}

/// [`GoalService`] over the service's JSON API.
#[derive(Debug, Clone)]
pub struct HttpGoalService {
    client: reqwest::Client,
    base_url: String,
    username: String,
    auth_token: String,
}

impl HttpGoalService {
    pub fn new(
        base_url: &str,
        username: &str,
        auth_token: &str,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Network(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.trim().to_string(),
            auth_token: auth_token.trim().to_string(),
        })
    }

    fn goal_url(&self, slug: &str) -> String {
        format!(
            "{}/users/{}/goals/{}",
            self.base_url,
            utf8_percent_encode(&self.username, PATH_SEGMENT),
            utf8_percent_encode(slug, PATH_SEGMENT),
        )
    }

    fn datapoints_url(&self, slug: &str) -> String {
        format!("{}/datapoints.json", self.goal_url(slug))
    }

    fn datapoint_url(&self, slug: &str, id: &str) -> String {
        format!(
            "{}/datapoints/{}.json",
            self.goal_url(slug),
            utf8_percent_encode(id, PATH_SEGMENT)
        )
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.query(&[("auth_token", self.auth_token.as_str())])
    }

    fn fetch_last_request(&self, slug: &str) -> RequestBuilder {
        let request = self
            .client
            .get(self.datapoints_url(slug))
            .query(&[("count", "1")]);
        self.authed(request)
    }

    fn create_request(&self, slug: &str, value: f64, daystamp: &DayStamp, comment: &str) -> RequestBuilder {
        let payload = json!({
            "value": value,
            "comment": comment,
            "daystamp": daystamp.compact(),
        });
        self.authed(self.client.post(self.datapoints_url(slug)).json(&payload))
    }

    /// The day-stamp of an existing datapoint is immutable, so it is not sent.
    fn update_request(&self, slug: &str, id: &str, value: f64, comment: &str) -> RequestBuilder {
        let payload = json!({
            "value": value,
            "comment": comment,
        });
        self.authed(self.client.put(self.datapoint_url(slug, id)).json(&payload))
    }

    async fn send(&self, request: RequestBuilder, slug: &str) -> Result<String, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if let Some(err) = classify_status(status, slug, &body) {
            return Err(err);
        }
        Ok(body)
    }
}

#[async_trait]
impl GoalService for HttpGoalService {
    async fn fetch_last(&self, slug: &str) -> Result<RemoteDatapoint, RemoteError> {
        let body = self.send(self.fetch_last_request(slug), slug).await?;
        parse_last(&body)
    }

    async fn create(
        &self,
        slug: &str,
        value: f64,
        daystamp: &DayStamp,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError> {
        let request = self.create_request(slug, value, daystamp, comment);
        let body = self.send(request, slug).await?;
        parse_one(&body)
    }

    async fn update(
        &self,
        slug: &str,
        id: &str,
        value: f64,
        comment: &str,
    ) -> Result<RemoteDatapoint, RemoteError> {
        let request = self.update_request(slug, id, value, comment);
        let body = self
            .send(request, slug)
            .await
            .map_err(|err| update_error(err, slug, id))?;
        parse_one(&body)
    }
}

/// The goal was just read successfully, so a 404 on the datapoint URL means
/// the datapoint itself was deleted in the meantime.
fn update_error(err: RemoteError, slug: &str, id: &str) -> RemoteError {
    match err {
        RemoteError::NotFound(_) => RemoteError::DatapointGone {
            slug: slug.to_string(),
            id: id.to_string(),
        },
        other => other,
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Protocol(err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// Map a non-success status onto the error taxonomy.
pub(crate) fn classify_status(status: StatusCode, slug: &str, body: &str) -> Option<RemoteError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("{status}: {}", body.trim());
    Some(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(detail),
        StatusCode::NOT_FOUND => RemoteError::NotFound(slug.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited(detail),
        s if s.is_server_error() => RemoteError::Network(detail),
        _ => RemoteError::Protocol(detail),
    })
}

pub(crate) fn parse_last(body: &str) -> Result<RemoteDatapoint, RemoteError> {
    let points: Vec<WireDatapoint> =
        serde_json::from_str(body).map_err(|err| RemoteError::Protocol(err.to_string()))?;
    Ok(points
        .into_iter()
        .next()
        .map(WireDatapoint::into_datapoint)
        .unwrap_or_else(RemoteDatapoint::none))
}

pub(crate) fn parse_one(body: &str) -> Result<RemoteDatapoint, RemoteError> {
    let point: WireDatapoint =
        serde_json::from_str(body).map_err(|err| RemoteError::Protocol(err.to_string()))?;
    Ok(point.into_datapoint())
}
