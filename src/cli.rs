//! Command line interface
//!
//! `kulku run` starts the daemon. Every other subcommand talks to a running
//! daemon over its HTTP API and exits with the status the error code maps to.

use crate::controller::RolloutStatus;
use crate::model::{DesiredSpec, FieldOwner};
use crate::server::ErrorResponse;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use std::path::PathBuf;
use thiserror::Error;

/// kulku - declarative rollouts with metric-gated canaries
#[derive(Parser, Debug)]
#[command(name = "kulku")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Base URL of the daemon's HTTP API
    #[arg(
        long,
        env = "KULKU_SERVER",
        default_value = "http://127.0.0.1:8080",
        global = true
    )]
    pub server: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the controller daemon
    Run(RunArgs),
    /// Show rollout status of one workload, or of all workloads
    Status {
        workload: Option<String>,
        #[arg(short, long, value_enum, default_value_t = Output::Text)]
        output: Output,
    },
    /// Pause an active rollout
    Pause { workload: String },
    /// Resume a paused rollout
    Resume { workload: String },
    /// Skip the remaining canary steps, or roll a failed rollout forward
    Promote { workload: String },
    /// Roll back to an earlier revision
    Rollback {
        workload: String,
        /// Revision id, sequence number or "previous"
        #[arg(long, default_value = "previous")]
        to: String,
    },
    /// Submit a desired spec from a YAML or JSON file
    Apply {
        #[arg(short, long)]
        file: PathBuf,
        /// Writer identity used for field ownership checks
        #[arg(long, value_enum, default_value_t = Writer::Operator)]
        writer: Writer,
    },
    /// Delete a workload and tear down its instances
    Delete { workload: String },
}

/// Overrides for `ControllerConfig` values read from the environment
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub workers: Option<usize>,
    /// JSON snapshot to restore from and flush to
    #[arg(long)]
    pub state_file: Option<String>,
    #[arg(long)]
    pub prometheus_address: Option<String>,
    #[arg(long)]
    pub cdevents_sink_url: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Output {
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Writer {
    Operator,
    Autoscaler,
    RolloutController,
}

impl Writer {
    fn query_value(self) -> &'static str {
        match self {
            Writer::Operator => "operator",
            Writer::Autoscaler => "autoscaler",
            Writer::RolloutController => "rolloutController",
        }
    }
}

impl From<Writer> for FieldOwner {
    fn from(writer: Writer) -> Self {
        match writer {
            Writer::Operator => FieldOwner::Operator,
            Writer::Autoscaler => FieldOwner::Autoscaler,
            Writer::RolloutController => FieldOwner::RolloutController,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{message}")]
    Api { code: String, message: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse spec: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Exit status for an API error code
pub fn exit_code_for(code: &str) -> i32 {
    match code {
        "NO_ACTIVE_ROLLOUT" => 2,
        "INVALID_REVISION" => 3,
        "WORKLOAD_NOT_FOUND" => 4,
        _ => 1,
    }
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Api { code, .. } => exit_code_for(code),
            _ => 1,
        }
    }
}

/// Minimal client for the daemon's `/api/v1` routes
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        ApiClient {
            base: base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/workloads{}", self.base, path)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CliError> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(Self::api_error(response).await)
    }

    async fn api_error(response: reqwest::Response) -> CliError {
        let status = response.status();
        match response.json::<ErrorResponse>().await {
            Ok(body) => CliError::Api {
                code: body.code,
                message: body.error,
            },
            Err(_) => CliError::Api {
                code: "INTERNAL_ERROR".to_string(),
                message: format!("daemon returned {}", status),
            },
        }
    }

    pub async fn list(&self) -> Result<Vec<RolloutStatus>, CliError> {
        Self::decode(self.http.get(self.url("")).send().await?).await
    }

    pub async fn status(&self, workload: &str) -> Result<RolloutStatus, CliError> {
        Self::decode(self.http.get(self.url(&format!("/{}", workload))).send().await?).await
    }

    /// POST one of the rollout verbs (pause, resume, promote)
    pub async fn action(&self, workload: &str, verb: &str) -> Result<RolloutStatus, CliError> {
        let url = self.url(&format!("/{}/{}", workload, verb));
        Self::decode(self.http.post(url).send().await?).await
    }

    pub async fn rollback(&self, workload: &str, to: &str) -> Result<RolloutStatus, CliError> {
        let url = self.url(&format!("/{}/rollback", workload));
        let body = serde_json::json!({ "revision": to });
        Self::decode(self.http.post(url).json(&body).send().await?).await
    }

    pub async fn apply(&self, spec: &DesiredSpec, writer: Writer) -> Result<u64, CliError> {
        let url = self.url(&format!("/{}", spec.workload));
        let response = self
            .http
            .put(url)
            .query(&[("writer", writer.query_value())])
            .json(spec)
            .send()
            .await?;
        let accepted: serde_json::Value = Self::decode(response).await?;
        Ok(accepted["generation"].as_u64().unwrap_or_default())
    }

    pub async fn delete(&self, workload: &str) -> Result<(), CliError> {
        let response = self
            .http
            .delete(self.url(&format!("/{}", workload)))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }
}

/// One-line summary of a workload's rollout
pub fn format_status(status: &RolloutStatus) -> String {
    let rollout = &status.rollout;
    let mut line = format!(
        "{}\tphase={}\tready={}/{}\tcurrent={}\ttarget={}",
        status.workload,
        rollout.phase,
        rollout.counters.ready,
        status.desired_replicas,
        rollout.current_revision.as_deref().unwrap_or("-"),
        rollout.target_revision.as_deref().unwrap_or("-"),
    );
    if let Some(weight) = rollout.traffic_weight {
        line.push_str(&format!("\tweight={}%", weight));
    }
    if let Some(ref reason) = rollout.last_transition_reason {
        line.push_str(&format!("\treason={}", reason));
    }
    if let Some(ref requeue) = rollout.last_requeue_reason {
        line.push_str(&format!("\trequeue={}", requeue));
    }
    if rollout.phase.needs_intervention() {
        if let Some(ref message) = rollout.message {
            line.push_str(&format!("\tmessage={}", message));
        }
    }
    line
}

/// Parse a spec file; JSON is valid YAML
pub fn parse_spec(text: &str) -> Result<DesiredSpec, CliError> {
    Ok(serde_yaml::from_str(text)?)
}

impl Command {
    /// Run a client subcommand against `server`
    ///
    /// `Run` is handled by the binary and is a no-op here.
    pub async fn execute(self, server: &str) -> Result<(), CliError> {
        let client = ApiClient::new(server);
        match self {
            Command::Run(_) => Ok(()),
            Command::Status { workload, output } => {
                let statuses = match workload {
                    Some(w) => vec![client.status(&w).await?],
                    None => client.list().await?,
                };
                match output {
                    Output::Json => println!("{}", serde_json::to_string_pretty(&statuses)?),
                    Output::Text => {
                        for status in &statuses {
                            println!("{}", format_status(status));
                        }
                    }
                }
                Ok(())
            }
            Command::Pause { workload } => print_status(client.action(&workload, "pause").await?),
            Command::Resume { workload } => print_status(client.action(&workload, "resume").await?),
            Command::Promote { workload } => {
                print_status(client.action(&workload, "promote").await?)
            }
            Command::Rollback { workload, to } => print_status(client.rollback(&workload, &to).await?),
            Command::Apply { file, writer } => {
                let text = std::fs::read_to_string(&file).map_err(|source| CliError::Read {
                    path: file.clone(),
                    source,
                })?;
                let spec = parse_spec(&text)?;
                let generation = client.apply(&spec, writer).await?;
                println!("{}\tgeneration={}", spec.workload, generation);
                Ok(())
            }
            Command::Delete { workload } => {
                client.delete(&workload).await?;
                println!("{}\tdeleted", workload);
                Ok(())
            }
        }
    }
}

fn print_status(status: RolloutStatus) -> Result<(), CliError> {
    println!("{}", format_status(&status));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, RolloutState};

    #[test]
    fn test_exit_codes_follow_error_codes() {
        assert_eq!(exit_code_for("NO_ACTIVE_ROLLOUT"), 2);
        assert_eq!(exit_code_for("INVALID_REVISION"), 3);
        assert_eq!(exit_code_for("WORKLOAD_NOT_FOUND"), 4);
        assert_eq!(exit_code_for("STORE_UNAVAILABLE"), 1);
    }

    #[test]
    fn test_parse_rollback_command() {
        let cli = Cli::try_parse_from(["kulku", "rollback", "web", "--to", "3", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Rollback { workload, to } => {
                assert_eq!(workload, "web");
                assert_eq!(to, "3");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from(["kulku", "run", "--port", "9090", "--workers", "2"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.port, Some(9090));
                assert_eq!(args.workers, Some(2));
                assert_eq!(args.state_file, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_spec_yaml() {
        let spec = parse_spec(
            r#"
workload: web
replicas: 6
template:
  hash: v2
  payload:
    image: web:v2
policy:
  maxSurge: "1"
  maxUnavailable: "1"
"#,
        )
        .unwrap();
        assert_eq!(spec.workload, "web");
        assert_eq!(spec.replicas, 6);
        assert_eq!(spec.template.hash, "v2");
        assert_eq!(spec.policy.max_surge(), "1");
    }

    #[test]
    fn test_format_status_line() {
        let mut rollout = RolloutState::new("web");
        rollout.phase = Phase::Analyzing;
        rollout.current_revision = Some("web-a".to_string());
        rollout.target_revision = Some("web-b".to_string());
        rollout.traffic_weight = Some(20);
        rollout.counters.ready = 10;
        let status = RolloutStatus {
            workload: "web".to_string(),
            desired_replicas: 10,
            generation: 2,
            strategy: "canary".to_string(),
            rollout,
        };
        let line = format_status(&status);
        assert!(line.starts_with("web\tphase=Analyzing\tready=10/10"));
        assert!(line.contains("target=web-b"));
        assert!(line.contains("weight=20%"));
    }
}
