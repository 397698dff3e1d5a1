use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use time::{OffsetDateTime, UtcDateTime, format_description::well_known::Rfc3339};
use url::Url;
use xcbot_core::{
    BotDirectory,
    config::ServerConfig,
    models::{Bot, BotStatus, IntegrationResult, IntegrationStep},
    util::retry_read,
};

/// Port of the Xcode Server REST API.
pub const API_PORT: u16 = 20343;

const FETCH_ATTEMPTS: u32 = 3;

// Source control blueprint dictionary keys.
const BLUEPRINT_PRIMARY_REPO: &str = "DVTSourceControlWorkspaceBlueprintPrimaryRemoteRepositoryKey";
const BLUEPRINT_LOCATIONS: &str = "DVTSourceControlWorkspaceBlueprintLocationsKey";
const BLUEPRINT_BRANCH: &str = "DVTSourceControlBranchIdentifierKey";
const BLUEPRINT_REMOTE_REPOS: &str = "DVTSourceControlWorkspaceBlueprintRemoteRepositoriesKey";
const BLUEPRINT_REPO_ID: &str = "DVTSourceControlWorkspaceBlueprintRemoteRepositoryIdentifierKey";
const BLUEPRINT_REPO_URL: &str = "DVTSourceControlWorkspaceBlueprintRemoteRepositoryURLKey";

/// Xcode Server adapter: the bot directory.
#[derive(Clone)]
pub struct XcodeServer {
    name: String,
    base: Url,
    client: reqwest::Client,
    auth: Option<(String, String)>,
}

impl XcodeServer {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Xcode Server serves a self-signed certificate.
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        let base = Url::parse(&format!("https://{}:{}/api/", config.name, API_PORT))
            .with_context(|| format!("Invalid server name {:?}", config.name))?;
        let auth = match (&config.user, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Ok(Self { name: config.name.clone(), base, client, auth })
    }

    fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self.base.join(path).with_context(|| format!("Invalid API path {path:?}"))?;
        let mut req = self.client.request(method, url);
        if let Some((user, password)) = &self.auth {
            req = req.basic_auth(user, Some(password));
        }
        Ok(req)
    }

    async fn fetch_bots(&self) -> Result<Vec<Bot>> {
        let page: ResultsPage<Value> = self
            .request(Method::GET, "bots")?
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse bot list")?;
        let mut bots = Vec::with_capacity(page.results.len());
        for value in &page.results {
            match parse_bot(&self.name, value) {
                Ok(bot) => bots.push(bot),
                Err(err) => tracing::warn!("Skipping unparseable bot: {err:#}"),
            }
        }
        Ok(bots)
    }

    async fn fetch_status(&self, bot: &Bot) -> Result<BotStatus> {
        let page: ResultsPage<IntegrationJson> = self
            .request(Method::GET, &format!("bots/{}/integrations?last=1", bot.id))?
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse integration list")?;
        match page.results.into_iter().next() {
            Some(integration) => Ok(integration.into_status(bot)),
            None => Ok(BotStatus::never_integrated(bot)),
        }
    }
}

#[async_trait]
impl BotDirectory for XcodeServer {
    fn server_name(&self) -> &str { &self.name }

    async fn bots(&self) -> Result<Vec<Bot>> {
        retry_read("Listing bots", FETCH_ATTEMPTS, || self.fetch_bots())
            .await
            .with_context(|| format!("Listing bots on {}", self.name))
    }

    async fn duplicate_bot(&self, template: &Bot, name: &str, branch: &str) -> Result<Bot> {
        // Duplicate first; the copy arrives with the template's name and
        // branch and is retargeted with a follow-up PATCH.
        let value: Value = self
            .request(Method::POST, &format!("bots/{}/duplicate", template.id))?
            .json(&json!({}))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse duplicated bot")?;
        let duplicate = parse_bot(&self.name, &value)?;

        let mut configuration = value.get("configuration").cloned().unwrap_or_else(|| json!({}));
        if let Some(blueprint) = configuration.get_mut("sourceControlBlueprint") {
            set_blueprint_branch(blueprint, branch);
        }
        let body = json!({ "name": name, "configuration": configuration });
        let patched: Value = self
            .request(Method::PATCH, &format!("bots/{}?overwriteBlueprint=true", duplicate.id))?
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to parse renamed bot")?;
        let mut bot = parse_bot(&self.name, &patched)?;
        bot.template_bot_name = Some(template.name.clone());
        Ok(bot)
    }

    async fn start_integration(&self, bot: &Bot) -> Result<()> {
        self.request(Method::POST, &format!("bots/{}/integrations", bot.id))?
            .json(&json!({ "shouldClean": true }))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Starting integration for bot {}", bot.name))?;
        Ok(())
    }

    async fn status(&self, bot: &Bot) -> Result<BotStatus> {
        retry_read("Fetching bot status", FETCH_ATTEMPTS, || self.fetch_status(bot))
            .await
            .with_context(|| format!("Fetching status of bot {}", bot.name))
    }

    async fn delete_bot(&self, bot: &Bot) -> Result<()> {
        self.request(Method::DELETE, &format!("bots/{}", bot.id))?
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Deleting bot {}", bot.name))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ResultsPage<T> {
    #[serde(default)]
    #[allow(dead_code)]
    count: Option<u64>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

/// Build a local `Bot` snapshot out of the server's bot dictionary. The
/// source control blueprint is schemaless from our point of view, so the
/// repo URL and branch are dug out of it leniently.
fn parse_bot(server: &str, value: &Value) -> Result<Bot> {
    let id = value
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Bot dictionary has no _id"))?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Bot {id} has no name"))?;
    let blueprint = value.get("configuration").and_then(|c| c.get("sourceControlBlueprint"));
    let blueprint_id =
        blueprint.and_then(|bp| bp.get(BLUEPRINT_PRIMARY_REPO)).and_then(Value::as_str);
    let branch = blueprint.and_then(|bp| {
        bp.get(BLUEPRINT_LOCATIONS)?
            .get(blueprint_id?)?
            .get(BLUEPRINT_BRANCH)?
            .as_str()
    });
    let source_repo_url = blueprint.and_then(|bp| {
        bp.get(BLUEPRINT_REMOTE_REPOS)?.as_array()?.iter().find_map(|repo| {
            if repo.get(BLUEPRINT_REPO_ID)?.as_str()? == blueprint_id? {
                repo.get(BLUEPRINT_REPO_URL)?.as_str()
            } else {
                None
            }
        })
    });
    Ok(Bot {
        id: id.to_string(),
        tiny_id: value.get("tinyID").and_then(Value::as_str).map(str::to_string),
        name: name.to_string(),
        server: server.to_string(),
        source_repo_url: source_repo_url.map(str::to_string),
        blueprint_id: blueprint_id.map(str::to_string),
        branch: branch.map(str::to_string),
        integration_counter: value
            .get("integration_counter")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        template_bot_name: None,
    })
}

/// Point the blueprint's primary repository at a different branch.
fn set_blueprint_branch(blueprint: &mut Value, branch: &str) {
    let Some(primary) =
        blueprint.get(BLUEPRINT_PRIMARY_REPO).and_then(Value::as_str).map(str::to_string)
    else {
        return;
    };
    let location = blueprint
        .get_mut(BLUEPRINT_LOCATIONS)
        .and_then(|locations| locations.get_mut(&primary))
        .and_then(Value::as_object_mut);
    if let Some(location) = location {
        location.insert(BLUEPRINT_BRANCH.to_string(), json!(branch));
    }
}

#[derive(Debug, Deserialize)]
struct IntegrationJson {
    #[serde(rename = "_id")]
    id: Option<String>,
    number: Option<u64>,
    #[serde(rename = "currentStep")]
    current_step: Option<String>,
    result: Option<String>,
    #[serde(rename = "buildResultSummary")]
    summary: Option<BuildResultSummaryJson>,
    #[serde(rename = "queuedDate")]
    queued_date: Option<String>,
    #[serde(rename = "startedTime")]
    started_time: Option<String>,
    #[serde(rename = "endedTime")]
    ended_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BuildResultSummaryJson {
    #[serde(rename = "errorCount")]
    error_count: Option<u64>,
    #[serde(rename = "warningCount")]
    warning_count: Option<u64>,
    #[serde(rename = "analyzerWarningCount")]
    analyzer_warning_count: Option<u64>,
    #[serde(rename = "testsCount")]
    tests_count: Option<u64>,
    #[serde(rename = "testFailureCount")]
    test_failure_count: Option<u64>,
    #[serde(rename = "codeCoveragePercentage")]
    code_coverage_percentage: Option<f64>,
}

impl IntegrationJson {
    fn into_status(self, bot: &Bot) -> BotStatus {
        let summary = self.summary.unwrap_or(BuildResultSummaryJson {
            error_count: None,
            warning_count: None,
            analyzer_warning_count: None,
            tests_count: None,
            test_failure_count: None,
            code_coverage_percentage: None,
        });
        BotStatus {
            bot_id: bot.id.clone(),
            bot_name: bot.name.clone(),
            server: bot.server.clone(),
            integration_id: self.id,
            integration_number: self.number,
            step: self.current_step.as_deref().map_or(IntegrationStep::Pending, Into::into),
            result: self.result.as_deref().map_or(IntegrationResult::Unknown, Into::into),
            error_count: summary.error_count,
            warning_count: summary.warning_count,
            analyzer_warning_count: summary.analyzer_warning_count,
            test_count: summary.tests_count,
            test_failure_count: summary.test_failure_count,
            code_coverage_percentage: summary.code_coverage_percentage,
            queued_at: parse_timestamp(self.queued_date.as_deref()),
            started_at: parse_timestamp(self.started_time.as_deref()),
            ended_at: parse_timestamp(self.ended_time.as_deref()),
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Option<UtcDateTime> {
    let value = value?;
    match OffsetDateTime::parse(value, &Rfc3339) {
        Ok(timestamp) => Some(timestamp.to_utc()),
        Err(err) => {
            tracing::warn!(%value, "Unparseable timestamp from CI server: {err}");
            None
        }
    }
}
