// CLI commands talking to the Codegrade gateway
use anyhow::{bail, Context, Result};
use codegrade_common::types::{ErrorBody, ExecutionResult, ExecutionStatus, TestCase, TestResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Response of the execute endpoints: the result plus gateway metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    #[serde(default)]
    pub run_only: Option<bool>,
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: u64,
}

pub struct Gateway {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl Gateway {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.post(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(reqwest::StatusCode, String)> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", self.base_url))?;
        let status = response.status();
        let text = response.text().await.context("Failed to read gateway response")?;
        Ok((status, text))
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn load_test_cases(path: &Path) -> Result<Vec<TestCase>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let tests: Vec<TestCase> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse test cases in {}", path.display()))?;
    if tests.is_empty() {
        bail!("{} contains no test cases", path.display());
    }
    Ok(tests)
}

/// Turn a non-200 gateway answer into a readable error
fn gateway_error(status: reqwest::StatusCode, text: &str) -> anyhow::Error {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => {
            let mut message = format!("gateway answered {} ({}): {}", status, body.code, body.error);
            if let Some(reason) = body.reason {
                message.push_str(&format!("\n  reason: {}", reason));
            }
            if let Some(reset_ms) = body.reset_ms {
                message.push_str(&format!("\n  retry in {:.1}s", reset_ms as f64 / 1000.0));
            }
            anyhow::anyhow!(message)
        }
        Err(_) => anyhow::anyhow!("gateway answered {}: {}", status, text),
    }
}

/// Grade `source` against the test cases in `tests`
pub async fn run(
    gateway: &Gateway,
    source: &Path,
    tests: &Path,
    user: &str,
    run_only: bool,
    raw: bool,
) -> Result<bool> {
    let body = json!({
        "sourceCode": read_source(source)?,
        "testCases": load_test_cases(tests)?,
        "runOnly": run_only,
    });

    let request = gateway.post("/v1/execute").header("X-User-Id", user).json(&body);
    let (status, text) = gateway.send(request).await?;
    if !status.is_success() {
        return Err(gateway_error(status, &text));
    }
    report(&text, raw)
}

/// Run `source` through the demo endpoint
pub async fn demo(gateway: &Gateway, source: &Path, raw: bool) -> Result<bool> {
    let body = json!({ "sourceCode": read_source(source)? });

    let (status, text) = gateway.send(gateway.post("/v1/demo/execute").json(&body)).await?;
    if !status.is_success() {
        return Err(gateway_error(status, &text));
    }
    report(&text, raw)
}

/// Print the gateway health payload
pub async fn health(gateway: &Gateway, raw: bool) -> Result<bool> {
    let request = gateway.http.get(format!("{}/health", gateway.base_url));
    let (status, text) = gateway.send(request).await?;
    if !status.is_success() {
        return Err(gateway_error(status, &text));
    }

    let payload: Value = serde_json::from_str(&text).context("Failed to parse health payload")?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        let field = |name: &str| payload[name].as_str().unwrap_or("?").to_string();
        println!("status:   {}", field("status"));
        println!("app:      {}", field("app"));
        println!("auth:     {}", field("auth"));
        println!("executor: {}", field("executor"));
        println!("store:    {}", field("store"));
        println!("uptime:   {}ms", payload["uptimeMs"].as_u64().unwrap_or(0));
        if let Some(latency) = payload["details"]["latencyMs"].as_u64() {
            println!("latency:  {}ms", latency);
        }
        if let Some(code) = payload["details"]["errorCode"].as_str() {
            println!("error:    {}", code);
        }
    }
    Ok(payload["status"] == "ok")
}

fn report(text: &str, raw: bool) -> Result<bool> {
    let graded: GradedResponse =
        serde_json::from_str(text).context("Failed to parse execution result")?;

    if raw {
        let value: Value = serde_json::from_str(text)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", summarize(&graded));
    }
    Ok(graded.result.status == ExecutionStatus::Pass)
}

fn test_line(test: &TestResult) -> String {
    let mark = if test.passed { "PASS" } else { "FAIL" };
    let mut line = format!(
        "  #{:<3} {} {:?} ({}ms)",
        test.test_index, mark, test.outcome, test.execution_ms
    );
    if test.is_hidden {
        line.push_str(" [hidden]");
    }
    if let Some(error) = &test.error {
        line.push_str(&format!(" - {}", error));
    }
    line
}

pub fn summarize(graded: &GradedResponse) -> String {
    let result = &graded.result;
    let passed = result.test_results.iter().filter(|t| t.passed).count();

    let mut out = format!(
        "{} in {}ms ({}/{} tests passed)\n",
        result.status,
        result.execution_ms,
        passed,
        result.test_results.len()
    );
    if let Some(diagnostics) = &result.compile_error {
        out.push_str("compiler output:\n");
        out.push_str(diagnostics);
        out.push('\n');
    }
    for test in &result.test_results {
        out.push_str(&test_line(test));
        out.push('\n');
    }
    if !result.stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(&result.stdout);
        if !result.stdout.ends_with('\n') {
            out.push('\n');
        }
    }
    if let Some(limit) = &graded.rate_limit {
        out.push_str(&format!(
            "rate limit: {}/{} left, resets in {}ms\n",
            limit.remaining, limit.limit, limit.reset_ms
        ));
    }
    out
}
