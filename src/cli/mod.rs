//! CLI commands for agentrelay using clap.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    CompletionConfig, ConnectPolicy, HostConfig, RuntimeConfig, DEFAULT_HOST_BIND, DEFAULT_HOST_CONNECT,
    ENV_API_KEY, ENV_HOST_ADDRESS,
};
use crate::host::RendezvousHost;
use crate::logging::{LogOptions, ENV_LOG_DIR};
use crate::protocol::AgentId;
use crate::providers::create_provider;
use crate::runtime::WorkerRuntime;
use crate::sql::{
    register_messages, sample_schema, RequesterAgent, ResponseLog, TranslationRequest, TranslationResponse,
    TranslatorAgent, DEFAULT_QUERY, DEFAULT_REQUEST_ID, REQUESTER_AGENT_TYPE, TRANSLATOR_AGENT_TYPE,
};

/// agentrelay - rendezvous host and typed agent workers.
#[derive(Parser)]
#[command(name = "agentrelay")]
#[command(version)]
#[command(about = "Relay typed request/response messages between agent workers", long_about = None)]
pub struct Commands {
    /// Log to the console only
    #[arg(long, global = true, default_value_t = false)]
    pub no_log_file: bool,

    /// Directory for log files
    #[arg(long, global = true, env = ENV_LOG_DIR)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the rendezvous host
    Host(HostArgs),

    /// Run the SQL translator worker
    Translator(TranslatorArgs),

    /// Run the SQL requester worker and send one translation request
    Requester(RequesterArgs),
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// Address to listen on
    #[arg(long = "address", env = ENV_HOST_ADDRESS, default_value = DEFAULT_HOST_BIND)]
    pub address: String,

    /// Seconds between status lines (0 disables them)
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Host to connect to
    #[arg(long = "host", env = ENV_HOST_ADDRESS, default_value = DEFAULT_HOST_CONNECT)]
    pub host: String,

    /// Seconds to wait for a response
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Connection attempts before giving up
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value_t = 3)]
    pub connect_attempts: u32,

    /// Delay before the second connection attempt, doubled afterwards
    #[arg(long, env = "CONNECT_BACKOFF_MS", default_value_t = 1000)]
    pub connect_backoff_ms: u64,
}

impl WorkerArgs {
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig::connected(self.host.clone())
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_connect_policy(ConnectPolicy {
                attempts: self.connect_attempts,
                backoff_ms: self.connect_backoff_ms,
            })
    }
}

#[derive(Args, Debug)]
pub struct TranslatorArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// API key for the completion service
    #[arg(long, env = ENV_API_KEY, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Completion model
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o")]
    pub model: String,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    /// Seconds allowed for one completion
    #[arg(long, env = "COMPLETION_TIMEOUT_SECS", default_value_t = 120)]
    pub completion_timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct RequesterArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Seconds to wait for the translator before sending
    #[arg(long, default_value_t = 5)]
    pub delay_secs: u64,

    /// Natural-language query to translate
    #[arg(long, default_value = DEFAULT_QUERY)]
    pub query: String,

    /// Request id echoed back by the translator
    #[arg(long, default_value = DEFAULT_REQUEST_ID)]
    pub request_id: String,
}

impl Commands {
    /// Logging options for this invocation.
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            role: self.command.role().to_string(),
            file: !self.no_log_file,
            dir: self.log_dir.clone(),
        }
    }

    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Host(args) => cmd_host(args).await,
            Command::Translator(args) => cmd_translator(args).await,
            Command::Requester(args) => cmd_requester(args).await,
        }
    }
}

impl Command {
    pub fn role(&self) -> &'static str {
        match self {
            Command::Host(_) => "host",
            Command::Translator(_) => "translator",
            Command::Requester(_) => "requester",
        }
    }
}

// Command implementations

async fn cmd_host(args: &HostArgs) -> Result<()> {
    let config = HostConfig {
        bind_address: args.address.clone(),
        status_interval_secs: args.status_interval,
        ..Default::default()
    };

    let host = RendezvousHost::start(config).await?;
    tracing::info!("Host is running on {}; press Ctrl+C to stop", host.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, stopping host");
    host.stop().await;
    Ok(())
}

async fn cmd_translator(args: &TranslatorArgs) -> Result<()> {
    tracing::info!("Translator starting, connecting to host at {}", args.worker.host);

    let mut completion = CompletionConfig::from_api_key(args.api_key.clone())?;
    completion.model = args.model.clone();
    completion.base_url = args.base_url.clone();
    completion.timeout_secs = args.completion_timeout_secs;
    let provider = create_provider(&completion)?;
    let timeout = completion.timeout();

    let runtime = WorkerRuntime::new(args.worker.runtime_config())?;
    register_messages(runtime.codecs());
    runtime.start().await?;

    runtime
        .register(TRANSLATOR_AGENT_TYPE, move || {
            TranslatorAgent::new(provider.clone(), timeout)
        })
        .await?;
    tracing::info!(model = %completion.model, "Translator connected and ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, stopping translator");
    runtime.stop().await?;
    Ok(())
}

async fn cmd_requester(args: &RequesterArgs) -> Result<()> {
    tracing::info!("Requester starting, connecting to host at {}", args.worker.host);

    let runtime = WorkerRuntime::new(args.worker.runtime_config())?;
    register_messages(runtime.codecs());
    runtime.start().await?;

    let log = ResponseLog::new();
    let agent_log = log.clone();
    let requester = runtime
        .register(REQUESTER_AGENT_TYPE, move || RequesterAgent::new(agent_log.clone()))
        .await?;
    tracing::info!("Requester connected and ready");

    let session = async {
        tokio::time::sleep(Duration::from_secs(args.delay_secs)).await;
        request_translation(&runtime, &requester, args).await;
        std::future::pending::<()>().await
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = session => {}
    }

    tracing::info!(responses = log.len(), "Interrupt received, stopping requester");
    runtime.stop().await?;
    Ok(())
}

/// Send one translation request and hand the response to the local requester agent.
async fn request_translation(runtime: &WorkerRuntime, requester: &AgentId, args: &RequesterArgs) {
    let translator = AgentId::default_instance(TRANSLATOR_AGENT_TYPE);
    let request = TranslationRequest::new(args.query.clone(), sample_schema(), args.request_id.clone());

    tracing::info!(request_id = %request.request_id, "Sending SQL translation request");
    let response: TranslationResponse = match runtime.send(&request, &translator).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(request_id = %request.request_id, error = %e, "Translation request failed");
            return;
        }
    };

    if let Err(e) = runtime.send::<_, ()>(&response, requester).await {
        tracing::error!(error = %e, "Failed to deliver response to requester agent");
    }
}
