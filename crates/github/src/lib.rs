use std::{pin::pin, sync::OnceLock, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use octocrab::{Octocrab, models::IssueState, params};
use regex::Regex;
use xcbot_core::{
    PullSource, StatusSink,
    config::GitHubConfig,
    models::{CommitState, PullRequest, PullRequestState},
    util::retry_read,
};

/// Commit-status context under which results are reported.
pub const STATUS_CONTEXT: &str = "xcbot";

/// GitHub's hard limit on commit-status description length.
const MAX_DESCRIPTION_LEN: usize = 140;

const FETCH_ATTEMPTS: u32 = 3;

/// GitHub adapter: pull request source and commit-status sink.
#[derive(Clone)]
pub struct GitHub {
    client: Octocrab,
}

impl GitHub {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .set_connect_timeout(Some(timeout))
            .set_read_timeout(Some(timeout))
            .build()
            .context("Failed to create GitHub client")?;
        Ok(Self { client })
    }

    async fn list_open(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>> {
        let page = self
            .client
            .pulls(owner, repo)
            .list()
            .state(params::State::Open)
            .per_page(100)
            .send()
            .await?;
        let mut pulls = Vec::new();
        let mut stream = pin!(page.into_stream(&self.client));
        while let Some(pr) = stream.try_next().await? {
            let state = match pr.state {
                Some(IssueState::Open) => PullRequestState::Open,
                Some(IssueState::Closed) => PullRequestState::Closed,
                _ => PullRequestState::Unrecognized("unknown".to_string()),
            };
            pulls.push(PullRequest {
                owner: owner.to_string(),
                repo: repo.to_string(),
                branch: pr.head.ref_field.clone(),
                number: pr.number,
                title: pr.title.clone().unwrap_or_default(),
                body: pr.body.clone(),
                head_sha: pr.head.sha.clone(),
                state,
                html_url: pr.html_url.as_ref().map(|u| u.to_string()),
            });
        }
        Ok(pulls)
    }
}

#[derive(serde::Serialize)]
struct StatusBody<'a> {
    state: &'a str,
    description: &'a str,
    context: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_url: Option<&'a str>,
}

#[async_trait]
impl PullSource for GitHub {
    async fn open_pull_requests(&self, owner: &str, repo: &str) -> Result<Vec<PullRequest>> {
        retry_read("Fetching pull requests", FETCH_ATTEMPTS, || self.list_open(owner, repo))
            .await
            .with_context(|| format!("Listing open pull requests for {owner}/{repo}"))
    }
}

#[async_trait]
impl StatusSink for GitHub {
    async fn set_status(
        &self,
        pr: &PullRequest,
        state: CommitState,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        let body = StatusBody {
            state: state.as_str(),
            description: truncate(description, MAX_DESCRIPTION_LEN),
            context: STATUS_CONTEXT,
            target_url,
        };
        let route = format!("/repos/{}/{}/statuses/{}", pr.owner, pr.repo, pr.head_sha);
        let _: serde_json::Value = self
            .client
            .post(route, Some(&body))
            .await
            .with_context(|| format!("Setting {} status on {}", state, pr.head_sha))?;
        Ok(())
    }

    async fn add_comment(&self, pr: &PullRequest, body: &str) -> Result<()> {
        self.client
            .issues(pr.owner.clone(), pr.repo.clone())
            .create_comment(pr.number, body)
            .await
            .with_context(|| format!("Commenting on PR #{}", pr.number))?;
        Ok(())
    }
}

/// Truncate to at most `max` bytes on a character boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Extract (owner, repo) from a GitHub clone or web URL.
pub fn extract_github_url(url: &str) -> Option<(&str, &str)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let caps = REGEX
        .get_or_init(|| {
            Regex::new(
                r"^(?:https?://github\.com/|git@github\.com:)(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?(?:/|$)",
            )
            .unwrap()
        })
        .captures(url)?;
    let owner = caps.name("owner").map(|m| m.as_str()).unwrap_or_default();
    let repo = caps.name("repo").map(|m| m.as_str()).unwrap_or_default();
    Some((owner, repo))
}

#[cfg(test)]
mod tests {
    use xcbot_core::config::GitHubConfig;

    use super::{GitHub, extract_github_url, truncate};

    #[tokio::test]
    async fn test_client_builds_with_timeout() {
        let config = GitHubConfig {
            token: "t0ken".to_string(),
            owner: "acme".to_string(),
            repo: "widget".to_string(),
            timeout_secs: 5,
        };
        assert!(GitHub::new(&config).is_ok());
    }

    #[test]
    fn test_extract_github_url() {
        let cases: &[(&str, Option<(&str, &str)>)] = &[
            ("https://github.com/foo/bar", Some(("foo", "bar"))),
            ("http://github.com/foo/bar/", Some(("foo", "bar"))),
            ("https://github.com/foo/bar.git", Some(("foo", "bar"))),
            ("git@github.com:foo/bar.git", Some(("foo", "bar"))),
            ("https://github.com/foo/bar/pull/17", Some(("foo", "bar"))),
            ("https://gitlab.com/foo/bar", None),
            ("https://github.com/foo", None),
        ];
        for &(url, expected) in cases {
            assert_eq!(extract_github_url(url), expected);
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 140), "short");
        assert_eq!(truncate("abcdef", 4), "abcd");
        // Never splits a multi-byte character.
        assert_eq!(truncate("ab…cd", 3), "ab");
    }
}
