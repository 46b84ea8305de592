//! GitLab v4 REST implementation of [`Tracker`].

use std::fmt;
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use super::{Tracker, TrackerFuture};
use crate::models::ticket::{DiscussionThread, Note, Ticket};
use crate::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PER_PAGE: usize = 100;
const MAX_PAGES: u32 = 50;

/// Project-bound GitLab client.
#[derive(Clone)]
pub struct GitlabTracker {
    client: Client,
    api_base: Url,
    token: String,
    project: String,
}

impl fmt::Debug for GitlabTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitlabTracker")
            .field("api_base", &self.api_base.as_str())
            .field("token", &"<redacted>")
            .field("project", &self.project)
            .finish()
    }
}

impl GitlabTracker {
    /// Build a client for `project` on the instance at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the URL is malformed, the token is
    /// empty, or the HTTP client cannot be built.
    pub fn new(base_url: &str, token: &str, project: &str) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(AppError::Config("gitlab token is empty".into()));
        }
        if project.trim().is_empty() {
            return Err(AppError::Config("gitlab project path is empty".into()));
        }

        let trimmed = base_url.trim_end_matches('/');
        let base = if trimmed.ends_with("/api/v4") {
            format!("{trimmed}/")
        } else {
            format!("{trimmed}/api/v4/")
        };
        let api_base = Url::parse(&base)
            .map_err(|err| AppError::Config(format!("invalid gitlab url {base_url}: {err}")))?;

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            api_base,
            token: token.trim().to_owned(),
            project: project.to_owned(),
        })
    }

    /// URL for `projects/<encoded project>/<segments…>`.
    fn project_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.api_base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| AppError::Config("gitlab url cannot be a base".into()))?;
            path.pop_if_empty();
            // `push` percent-encodes the slashes inside the project path.
            path.push("projects").push(&self.project).extend(segments);
        }
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!(
                "gitlab resource not found: {}",
                response.url()
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Tracker(format!(
                "gitlab request failed with status {status}: {body}"
            )));
        }
        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|err| AppError::Tracker(format!("gitlab response was malformed: {err}")))
    }

    async fn fetch_tickets(&self, labels: &[String], state: &str) -> Result<Vec<Ticket>> {
        let joined = labels.join(",");
        let mut filters = Vec::new();
        if !labels.is_empty() {
            filters.push(("labels", joined.as_str()));
        }
        if !state.is_empty() {
            filters.push(("state", state));
        }
        self.fetch_pages(&["issues"], &filters, "issue listing").await
    }

    async fn fetch_ticket(&self, iid: u64) -> Result<Ticket> {
        let url = self.project_url(&["issues", &iid.to_string()])?;
        self.send_json(self.client.get(url)).await
    }

    async fn put_labels(&self, iid: u64, labels: &[String]) -> Result<()> {
        let url = self.project_url(&["issues", &iid.to_string()])?;
        let body = json!({ "labels": labels.join(",") });
        let _: Ticket = self.send_json(self.client.put(url).json(&body)).await?;
        debug!(ticket = iid, ?labels, "labels updated");
        Ok(())
    }

    async fn post_note(&self, iid: u64, body: &str) -> Result<Note> {
        let url = self.project_url(&["issues", &iid.to_string(), "notes"])?;
        self.send_json(self.client.post(url).json(&json!({ "body": body })))
            .await
    }

    async fn fetch_discussions(&self, iid: u64) -> Result<Vec<DiscussionThread>> {
        let iid_segment = iid.to_string();
        self.fetch_pages(&["issues", &iid_segment, "discussions"], &[], "discussions")
            .await
    }

    /// GET every page of a project collection, up to [`MAX_PAGES`].
    async fn fetch_pages<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        filters: &[(&str, &str)],
        what: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut url = self.project_url(segments)?;
            {
                let mut query = url.query_pairs_mut();
                for (key, value) in filters {
                    query.append_pair(key, value);
                }
                query
                    .append_pair("per_page", &PER_PAGE.to_string())
                    .append_pair("page", &page.to_string());
            }

            let batch: Vec<T> = self.send_json(self.client.get(url)).await?;
            let done = batch.len() < PER_PAGE;
            items.extend(batch);
            if done {
                return Ok(items);
            }
        }
        warn!(what, max_pages = MAX_PAGES, "pagination hit page ceiling");
        Ok(items)
    }
}

impl Tracker for GitlabTracker {
    fn project_path(&self) -> &str {
        &self.project
    }

    fn list_tickets<'a>(
        &'a self,
        labels: &'a [String],
        state: &'a str,
    ) -> TrackerFuture<'a, Vec<Ticket>> {
        Box::pin(self.fetch_tickets(labels, state))
    }

    fn get_ticket(&self, iid: u64) -> TrackerFuture<'_, Ticket> {
        Box::pin(self.fetch_ticket(iid))
    }

    fn set_labels<'a>(&'a self, iid: u64, labels: &'a [String]) -> TrackerFuture<'a, ()> {
        Box::pin(self.put_labels(iid, labels))
    }

    fn create_comment<'a>(&'a self, iid: u64, body: &'a str) -> TrackerFuture<'a, Note> {
        Box::pin(self.post_note(iid, body))
    }

    fn list_discussions(&self, iid: u64) -> TrackerFuture<'_, Vec<DiscussionThread>> {
        Box::pin(self.fetch_discussions(iid))
    }
}
