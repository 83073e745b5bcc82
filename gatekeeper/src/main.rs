use attribution::{AttributionAggregator, FragmentSource, Payload};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gate::client::ConfigClient;
use gate::config::DeviceProfile;
use gate::controller::{GateController, GateDeps, GateState, GateStatus};
use gate::destination;
use gate::errors::GateError;
use gate::notification_link::NotificationLinkStore;
use gate::policy::{FixedPermissions, NotificationGatePolicy, PermissionStatus};
use gate::push_token::PushTokenStore;
use gate::redirect::RedirectResolver;
use metrics_exporter_statsd::StatsdError;
use serde_json::json;
use shared::store::{FilesystemStore, KeyValueStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

mod config;
mod telemetry;

use config::{Config, ConfigError};

#[derive(Parser)]
#[command(name = "gatekeeper", about = "Decides where a fresh app launch should land")]
struct Cli {
    #[arg(long, short, default_value = "gatekeeper.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run one launch through the gate and print where it lands
    Run(RunArgs),
    /// Follow a redirect chain and print the URL it settles on
    Resolve { url: Url },
}

#[derive(Args)]
struct RunArgs {
    /// Attribution fragment as SOURCE=JSON, e.g. conversion={"media_source":"organic"}
    #[arg(long = "fragment", value_parser = parse_fragment)]
    fragments: Vec<(FragmentSource, Payload)>,

    #[arg(long)]
    push_token: Option<String>,

    /// Current notification permission
    #[arg(long, default_value = "not-determined")]
    permission: PermissionStatus,

    /// What the user picks when the platform asks for permission
    #[arg(long, default_value = "authorized")]
    grant: PermissionStatus,

    /// Answer to the notification prompt, if one is shown
    #[arg(long, value_enum, default_value_t = PromptAnswer::Accept)]
    answer: PromptAnswer,

    /// JSON payload of a notification the launch was opened from
    #[arg(long)]
    notification: Option<String>,

    /// Give up if no route is decided within this many seconds
    #[arg(long, default_value_t = 60)]
    wait_secs: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum PromptAnswer {
    Accept,
    Decline,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("could not set up metrics: {0}")]
    Metrics(#[from] StatsdError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("invalid notification payload: {0}")]
    Notification(#[from] serde_json::Error),
    #[error("routing config unreachable, launch stays on the loading screen")]
    Offline,
    #[error("no route decided within {0} seconds")]
    Timeout(u64),
}

fn parse_fragment(raw: &str) -> Result<(FragmentSource, Payload), String> {
    let (source, json) = raw
        .split_once('=')
        .ok_or_else(|| "expected SOURCE=JSON".to_string())?;
    let source = source.parse()?;
    let value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    Ok((source, attribution::value::payload_from_json(value)))
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;

    let logging = config.common.logging.clone().unwrap_or_default();
    let _sentry = telemetry::init_logging(&logging);
    if let Some(metrics) = &config.common.metrics {
        telemetry::init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        match cli.command {
            CliCommand::Run(args) => run(config, args).await,
            CliCommand::Resolve { url } => resolve(config, url).await,
        }
    })
}

async fn run(config: Config, args: RunArgs) -> Result<(), CliError> {
    let store: Arc<dyn KeyValueStore> = match &config.state_path {
        Some(path) => Arc::new(FilesystemStore::new(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let gate = &config.gate;

    let aggregator = AttributionAggregator::new(store.clone());
    for (source, payload) in &args.fragments {
        aggregator.update(*source, payload);
    }

    let push_tokens = PushTokenStore::new(store.clone());
    if args.push_token.is_some() {
        push_tokens.update(args.push_token.as_deref());
    }

    let links = NotificationLinkStore::new();
    if let Some(payload) = &args.notification {
        links.store_from_payload(&serde_json::from_str(payload)?);
    }

    let permissions = Arc::new(FixedPermissions::new(args.permission, args.grant));
    let policy = Arc::new(NotificationGatePolicy::new(
        store.clone(),
        permissions,
        gate.prompt_cooldown(),
    ));
    let routing = Arc::new(ConfigClient::new(gate, aggregator.clone())?);

    let controller = GateController::spawn(
        GateDeps {
            routing,
            policy,
            device: gate.device.clone(),
            push_tokens: push_tokens.clone(),
            attribution: Some(aggregator.clone()),
        },
        gate.timings(),
    );
    controller.start();

    let settled = controller.wait_until(GateStatus::is_settled);
    let mut status = tokio::time::timeout(Duration::from_secs(args.wait_secs), settled)
        .await
        .map_err(|_| CliError::Timeout(args.wait_secs))?;
    if let GateState::NotificationPrompt(_) = status.state {
        match args.answer {
            PromptAnswer::Accept => {
                let permission = controller.accept_prompt().await;
                tracing::info!(permission = ?permission, "Prompt accepted");
            }
            PromptAnswer::Decline => {
                controller.decline_prompt().await;
            }
        }
        status = controller.status();
    }

    if status.loading_error {
        return Err(CliError::Offline);
    }

    let report = match &status.state {
        GateState::Web(url) => {
            let target = links
                .consume()
                .unwrap_or_else(|| web_target(url, &aggregator, &gate.device, &push_tokens));
            json!({"route": "web", "url": target.as_str()})
        }
        other => json!({"route": other.as_str()}),
    };
    println!("{report}");

    Ok(())
}

/// The URL the web container opens for an approved destination.
fn web_target(
    url: &Url,
    aggregator: &AttributionAggregator,
    device: &DeviceProfile,
    push_tokens: &PushTokenStore,
) -> Url {
    destination::augment(
        url,
        &aggregator.snapshot(),
        &aggregator.ensure_install_id(),
        &device.context(push_tokens.current()),
    )
}

async fn resolve(config: Config, url: Url) -> Result<(), CliError> {
    let resolver = RedirectResolver::new(&config.gate.redirects)?;
    let chain = resolver.resolve_chain(url).await;

    println!(
        "{}",
        json!({
            "url": chain.final_url().as_str(),
            "hops": chain.hops(),
            "visited": chain.visited().iter().map(Url::as_str).collect::<Vec<_>>(),
            "termination": chain.termination().as_str(),
        })
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use attribution::RawValue;

    #[test]
    fn test_parse_fragment() {
        let (source, payload) =
            parse_fragment(r#"deep-link={"deep_link_value": "promo", "af_sub1": 7}"#).unwrap();

        assert_eq!(source, FragmentSource::DeepLink);
        assert_eq!(payload["deep_link_value"], RawValue::from("promo"));
        assert_eq!(payload["af_sub1"], RawValue::from(7_i64));
    }

    #[test]
    fn test_parse_fragment_errors() {
        assert!(parse_fragment("conversion").is_err());
        assert!(parse_fragment("billboard={}").is_err());
        assert!(parse_fragment("conversion={not json").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "gatekeeper",
            "--config",
            "gate.yaml",
            "run",
            "--fragment",
            r#"conversion={"media_source":"organic"}"#,
            "--permission",
            "denied",
            "--answer",
            "decline",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("gate.yaml"));
        let CliCommand::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.fragments.len(), 1);
        assert_eq!(args.permission, PermissionStatus::Denied);
        assert_eq!(args.grant, PermissionStatus::Authorized);
        assert!(matches!(args.answer, PromptAnswer::Decline));
    }
}
