//! GitLab REST v4 client

use super::{CiClient, Job, Pipeline, UpstreamError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const JOBS_PER_PAGE: u32 = 100;

pub struct GitLabClient {
    base_url: Url,
    http_client: Client,
}

impl GitLabClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self, UpstreamError> {
        Self::with_timeout(base_url, token, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(
        base_url: &str,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| UpstreamError::Config(format!("invalid GitLab URL '{base_url}': {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(token)
                .map_err(|_| UpstreamError::Config("token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert("private-token", value);
        }

        let http_client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| UpstreamError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    fn url(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(&format!("api/v4/{path}"))
            .map_err(|e| UpstreamError::Config(format!("invalid request path '{path}': {e}")))
    }

    async fn send(&self, url: Url) -> Result<Option<reqwest::Response>, UpstreamError> {
        debug!(url = %url, "GitLab request");
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| UpstreamError::Http {
                url: url.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(UpstreamError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>, UpstreamError> {
        let Some(response) = self.send(url.clone()).await? else {
            return Ok(None);
        };
        response
            .json()
            .await
            .map(Some)
            .map_err(|source| UpstreamError::Http {
                url: url.to_string(),
                source,
            })
    }

    async fn list_jobs(
        &self,
        project_id: u64,
        pipeline_id: u64,
        scope: Option<&str>,
    ) -> Result<Vec<Job>, UpstreamError> {
        let mut jobs = Vec::new();
        let mut page = 1u32;
        loop {
            let mut url = self.url(&format!("projects/{project_id}/pipelines/{pipeline_id}/jobs"))?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("per_page", &JOBS_PER_PAGE.to_string())
                    .append_pair("page", &page.to_string());
                if let Some(scope) = scope {
                    query.append_pair("scope[]", scope);
                }
            }
            let batch: Vec<Job> = self
                .get_json(url)
                .await?
                .ok_or(UpstreamError::NotFound {
                    entity: "pipeline",
                    id: pipeline_id,
                })?;
            let done = batch.len() < JOBS_PER_PAGE as usize;
            jobs.extend(batch);
            if done {
                break;
            }
            page += 1;
        }
        Ok(jobs)
    }
}

#[async_trait]
impl CiClient for GitLabClient {
    async fn get_pipeline(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Pipeline, UpstreamError> {
        let url = self.url(&format!("projects/{project_id}/pipelines/{pipeline_id}"))?;
        self.get_json(url).await?.ok_or(UpstreamError::NotFound {
            entity: "pipeline",
            id: pipeline_id,
        })
    }

    async fn get_jobs(&self, project_id: u64, pipeline_id: u64) -> Result<Vec<Job>, UpstreamError> {
        self.list_jobs(project_id, pipeline_id, None).await
    }

    async fn get_failed_jobs(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<Vec<Job>, UpstreamError> {
        self.list_jobs(project_id, pipeline_id, Some("failed")).await
    }

    async fn get_job_trace(&self, project_id: u64, job_id: u64) -> Result<String, UpstreamError> {
        let url = self.url(&format!("projects/{project_id}/jobs/{job_id}/trace"))?;
        let Some(response) = self.send(url.clone()).await? else {
            return Ok(String::new());
        };
        response.text().await.map_err(|source| UpstreamError::Http {
            url: url.to_string(),
            source,
        })
    }

    fn name(&self) -> &str {
        "gitlab"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_keep_base_path() {
        let client = GitLabClient::new("https://git.example.com/gitlab", Some("tok")).unwrap();
        let url = client.url("projects/7/jobs/9/trace").unwrap();
        assert_eq!(
            url.as_str(),
            "https://git.example.com/gitlab/api/v4/projects/7/jobs/9/trace"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(matches!(
            GitLabClient::new("not a url", None),
            Err(UpstreamError::Config(_))
        ));
    }
}
