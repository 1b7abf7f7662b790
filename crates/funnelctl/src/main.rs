use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "funnelctl")]
#[command(version, about = "Funnelflow operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Control plane host
    #[arg(long)]
    host: Option<String>,

    /// Control plane port
    #[arg(short, long)]
    port: Option<u16>,

    /// Control plane URL (overrides host and port, falls back to FUNNEL_SERVER_URL)
    #[arg(long)]
    server_url: Option<String>,

    /// Emit only the JSON response
    #[arg(short, long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and recover workflow runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
    /// Browse the apps, triggers and actions the server knows about
    Discovered {
        #[command(subcommand)]
        command: DiscoveredCommand,
    },
    /// Deliver events to the control plane
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List runs, newest first
    /// Examples:
    ///     funnelctl runs list --status failed
    ///     funnelctl runs list --sequence 3 --limit 20
    #[command(verbatim_doc_comment)]
    List {
        /// Only runs of this sequence
        #[arg(long = "sequence")]
        sequence_id: Option<i64>,

        /// Only runs in this status (pending, running, completed, failed, waiting)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show a run with its steps and log
    Show { run_id: i64 },
    /// Resume a failed or waiting run from its first unfinished action
    Rerun { run_id: i64 },
    /// Abort a pending or running run and start a new attempt
    ForceRerun { run_id: i64 },
    /// Stop a run
    Cancel { run_id: i64 },
}

#[derive(Subcommand)]
enum DiscoveredCommand {
    /// List apps
    Apps,
    /// List trigger kinds
    Triggers {
        /// Only kinds of this app
        #[arg(long = "app")]
        app_key: Option<String>,
    },
    /// List action kinds
    Actions {
        #[arg(long = "app")]
        app_key: Option<String>,
    },
}

#[derive(Subcommand)]
enum EventsCommand {
    /// Send an event payload for a trigger kind
    /// Examples:
    ///     funnelctl events send checkout purchase_completed --payload '{"order_id":"o-1"}'
    ///     funnelctl events send checkout purchase_completed -f order.json
    #[command(verbatim_doc_comment)]
    Send {
        app_key: String,
        trigger_key: String,

        /// Payload as a JSON string
        #[arg(long, value_name = "JSON", conflicts_with = "file")]
        payload: Option<String>,

        /// Path to a JSON file with the payload
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Integration the event arrived through
        #[arg(long)]
        integration_id: Option<i64>,
    },
}

fn base_url(cli: &Cli) -> String {
    if let Some(url) = &cli.server_url {
        return url.trim_end_matches('/').to_string();
    }
    if let (Some(host), Some(port)) = (cli.host.as_ref(), cli.port) {
        return format!("http://{}:{}", host, port);
    }
    std::env::var("FUNNEL_SERVER_URL")
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "http://localhost:8090".to_string())
}

/// Query string for `GET /workflows`.
fn runs_query(sequence_id: Option<i64>, status: Option<&str>, limit: i64, offset: i64) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", limit.to_string()), ("offset", offset.to_string())];
    if let Some(id) = sequence_id {
        query.push(("sequence_id", id.to_string()));
    }
    if let Some(status) = status {
        query.push(("status", status.to_string()));
    }
    query
}

fn read_payload(payload: Option<&str>, file: Option<&PathBuf>) -> Result<Value> {
    let text = match (payload, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload file: {:?}", path))?,
        (None, None) => bail!("Provide the event payload with --payload or --file"),
    };
    let value: Value = serde_json::from_str(&text).context("Failed to parse payload JSON")?;
    if !value.is_object() {
        bail!("Event payload must be a JSON object");
    }
    Ok(value)
}

struct Api {
    client: Client,
    base_url: String,
    json_only: bool,
}

impl Api {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base_url, path))
    }

    /// Send and return the body. Non-2xx responses are errors, except for
    /// `409` from recovery calls which carries the refusal reason.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<(u16, Value)> {
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;
        let status = response.status();
        let text = response.text().await?;
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        if status.is_success() || status.as_u16() == 409 {
            return Ok((status.as_u16(), body));
        }
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string());
        bail!("Failed to {}: {} - {}", what, status, message)
    }

    fn print(&self, body: &Value) -> Result<()> {
        if self.json_only {
            println!("{}", serde_json::to_string(body)?);
        } else {
            println!("{}", serde_json::to_string_pretty(body)?);
        }
        Ok(())
    }

    async fn list_runs(&self, query: Vec<(&'static str, String)>) -> Result<()> {
        let (_, body) = self
            .send(self.request(Method::GET, "/workflows").query(&query), "list runs")
            .await?;
        if self.json_only {
            return self.print(&body);
        }
        let items = body.get("items").and_then(Value::as_array).cloned().unwrap_or_default();
        if items.is_empty() {
            println!("No runs");
            return Ok(());
        }
        println!("{:<8} {:<10} {:<10} {:<8} {}", "RUN", "SEQUENCE", "STATUS", "ATTEMPT", "CREATED");
        for run in &items {
            println!(
                "{:<8} {:<10} {:<10} {:<8} {}{}",
                run["id"],
                run["sequence_id"],
                run["status"].as_str().unwrap_or("?"),
                run["attempt"],
                run["created_at"].as_str().unwrap_or(""),
                if run["stale"].as_bool().unwrap_or(false) { "  (stale)" } else { "" }
            );
        }
        Ok(())
    }

    async fn show_run(&self, run_id: i64) -> Result<()> {
        let (_, body) = self
            .send(self.request(Method::GET, &format!("/workflows/{}", run_id)), "get run")
            .await?;
        if self.json_only {
            return self.print(&body);
        }

        let run = &body["run"];
        println!("Run:      {}", run_id);
        println!("Status:   {}", run["status"].as_str().unwrap_or("?"));
        println!("Attempt:  {}", run["attempt"]);
        println!("Sequence: {}", run["sequence_id"]);

        if let Some(steps) = body["steps"].as_array() {
            println!("\nSteps:");
            for step in steps {
                print!(
                    "  [{}] {}. {} ({}) {}",
                    step["attempt"],
                    step["position"],
                    step["node_name"].as_str().unwrap_or("?"),
                    step["node_type"].as_str().unwrap_or("?"),
                    step["status"].as_str().unwrap_or("?"),
                );
                if let Some(ms) = step["duration_ms"].as_i64() {
                    print!(" {}ms", ms);
                }
                if let Some(retries) = step["retry_count"].as_i64().filter(|r| *r > 0) {
                    print!(" retries={}", retries);
                }
                println!();
                if let Some(error) = step["error_message"].as_str() {
                    println!("      {}: {}", step["error_code"].as_str().unwrap_or("error"), error);
                }
            }
        }

        if let Some(logs) = body["logs"].as_array() {
            println!("\nLog:");
            for line in logs {
                println!(
                    "  {} {:<5} {}",
                    line["created_at"].as_str().unwrap_or(""),
                    line["level"].as_str().unwrap_or(""),
                    line["message"].as_str().unwrap_or("")
                );
            }
        }
        println!("\nUse --json for full step input and output");
        Ok(())
    }

    async fn recover(&self, run_id: i64, operation: &str) -> Result<()> {
        let path = format!("/workflows/{}/{}", run_id, operation);
        let (status, body) = self.send(self.request(Method::POST, &path), operation).await?;
        if self.json_only {
            return self.print(&body);
        }
        if status == 409 {
            println!(
                "{} refused: {}",
                operation,
                body["reason"].as_str().unwrap_or("run is not in a recoverable status")
            );
        } else {
            println!(
                "{} accepted: run {} is {} (attempt {})",
                operation,
                run_id,
                body["status"].as_str().unwrap_or("?"),
                body["attempt"]
            );
        }
        Ok(())
    }

    async fn discovered(&self, kind: &str, app_key: Option<&str>) -> Result<()> {
        let mut request = self.request(Method::GET, &format!("/discovered/{}", kind));
        if let Some(app_key) = app_key {
            request = request.query(&[("app_key", app_key)]);
        }
        let (_, body) = self.send(request, &format!("list {}", kind)).await?;
        if self.json_only {
            return self.print(&body);
        }
        for item in body.as_array().cloned().unwrap_or_default() {
            let key = match (item["app_key"].as_str(), item["key"].as_str()) {
                (Some(app), Some(key)) => format!("{}.{}", app, key),
                (None, Some(key)) => key.to_string(),
                _ => item.to_string(),
            };
            let label = item["label"].as_str().or_else(|| item["name"].as_str()).unwrap_or("");
            let auth = if item["requires_auth"].as_bool().unwrap_or(false) { " (auth)" } else { "" };
            println!("  {:<36} {}{}", key, label, auth);
        }
        Ok(())
    }

    async fn send_event(&self, app_key: &str, trigger_key: &str, integration_id: Option<i64>, payload: Value) -> Result<()> {
        let mut request = self
            .request(Method::POST, &format!("/events/{}/{}", app_key, trigger_key))
            .json(&payload);
        if let Some(id) = integration_id {
            request = request.query(&[("integration_id", id)]);
        }
        let (_, body) = self.send(request, "send event").await?;
        if self.json_only {
            return self.print(&body);
        }
        let runs = body["run_ids"].as_array().cloned().unwrap_or_default();
        if runs.is_empty() {
            println!("Event {} accepted, no sequence matched", body["event_id"]);
        } else {
            let ids: Vec<String> = runs.iter().map(Value::to_string).collect();
            println!("Event {} accepted, started runs: {}", body["event_id"], ids.join(", "));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let api = Api {
        client: Client::new(),
        base_url: base_url(&cli),
        json_only: cli.json,
    };

    match cli.command {
        Commands::Runs { command } => match command {
            RunsCommand::List {
                sequence_id,
                status,
                limit,
                offset,
            } => {
                api.list_runs(runs_query(sequence_id, status.as_deref(), limit, offset))
                    .await
            }
            RunsCommand::Show { run_id } => api.show_run(run_id).await,
            RunsCommand::Rerun { run_id } => api.recover(run_id, "rerun").await,
            RunsCommand::ForceRerun { run_id } => api.recover(run_id, "force-rerun").await,
            RunsCommand::Cancel { run_id } => api.recover(run_id, "cancel").await,
        },
        Commands::Discovered { command } => match command {
            DiscoveredCommand::Apps => api.discovered("apps", None).await,
            DiscoveredCommand::Triggers { app_key } => api.discovered("triggers", app_key.as_deref()).await,
            DiscoveredCommand::Actions { app_key } => api.discovered("actions", app_key.as_deref()).await,
        },
        Commands::Events { command } => match command {
            EventsCommand::Send {
                app_key,
                trigger_key,
                payload,
                file,
                integration_id,
            } => {
                let payload = read_payload(payload.as_deref(), file.as_ref())?;
                api.send_event(&app_key, &trigger_key, integration_id, payload).await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recovery_commands() {
        let cli = Cli::try_parse_from(["funnelctl", "runs", "force-rerun", "12"]).unwrap();
        assert!(matches!(cli.command, Commands::Runs { command: RunsCommand::ForceRerun { run_id: 12 } }));

        let cli = Cli::try_parse_from(["funnelctl", "--json", "runs", "list", "--status", "failed"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Runs {
                command: RunsCommand::List { status, limit, .. },
            } => {
                assert_eq!(status.as_deref(), Some("failed"));
                assert_eq!(limit, 50);
            }
            _ => panic!("expected runs list"),
        }
    }

    #[test]
    fn test_base_url_precedence() {
        let cli = Cli::try_parse_from([
            "funnelctl",
            "--server-url",
            "http://plane:9000/",
            "--host",
            "other",
            "--port",
            "1",
            "discovered",
            "apps",
        ])
        .unwrap();
        assert_eq!(base_url(&cli), "http://plane:9000");

        let cli = Cli::try_parse_from(["funnelctl", "--host", "plane", "-p", "8091", "discovered", "apps"]).unwrap();
        assert_eq!(base_url(&cli), "http://plane:8091");
    }

    #[test]
    fn test_runs_query() {
        let query = runs_query(Some(3), Some("waiting"), 20, 40);
        assert!(query.contains(&("sequence_id", "3".to_string())));
        assert!(query.contains(&("status", "waiting".to_string())));
        assert!(query.contains(&("offset", "40".to_string())));
        assert_eq!(runs_query(None, None, 50, 0).len(), 2);
    }

    #[test]
    fn test_read_payload() {
        let value = read_payload(Some(r#"{"order_id":"o-1"}"#), None).unwrap();
        assert_eq!(value["order_id"], "o-1");
        assert!(read_payload(Some("[1,2]"), None).is_err());
        assert!(read_payload(Some("{"), None).is_err());
        assert!(read_payload(None, None).is_err());
    }
}
