use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;

use crate::config::{default_skills_dir, AgentConfig, ConfigError, SandboxConfig, ToolsConfig};
use crate::context_window::{ContextOverflowConfig, DEFAULT_UNKNOWN_MODEL_CONTEXT_WINDOW};
use crate::model::{ModelConfig, ModelError, OpenAiChatModel};
use crate::router::sandbox::{build_sandbox_router, SandboxApiDoc};
use crate::router::{build_router_with_state, ApiDoc, AppState, AuthConfig};
use crate::stream::MemoryEventStream;
use crate::supervisor::{CommandTeardown, ShutdownTeardown, Teardown, TimeoutSupervisor};
use crate::tasks::TaskManager;
use crate::tools::ToolRegistry;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 2480;
const DEFAULT_SANDBOX_PORT: u16 = 8330;
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Parser, Debug)]
#[command(name = "agentbox", bin_name = "agentbox")]
#[command(about = "Agent task runner and sandbox lifecycle supervisor", version)]
#[command(arg_required_else_help = true)]
pub struct AgentboxCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true, env = "AGENTBOX_TOKEN")]
    token: Option<String>,

    /// Ignore any configured token and serve without auth.
    #[arg(long, short = 'n', global = true)]
    no_token: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent task API.
    Server(ServerArgs),
    /// Run the in-sandbox API with the inactivity timeout supervisor.
    Sandbox(SandboxArgs),
    /// Print an OpenAPI document.
    Openapi(OpenapiArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CorsArgs {
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    #[command(flatten)]
    cors: CorsArgs,

    #[arg(long, env = "AGENTBOX_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long, env = "AGENTBOX_API_BASE", default_value = DEFAULT_API_BASE)]
    api_base: String,

    #[arg(long, env = "AGENTBOX_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// Seconds before a model request is abandoned.
    #[arg(long, default_value_t = 120)]
    model_timeout: u64,

    /// JSON file listing MCP servers, A2A agents and the skills directory.
    #[arg(long, env = "AGENTBOX_TOOLS_CONFIG")]
    tools_config: Option<PathBuf>,

    /// Skills directory used when the tools config does not name one.
    #[arg(long, env = "AGENTBOX_SKILLS_DIR")]
    skills_dir: Option<PathBuf>,

    /// Override the model's context window in tokens.
    #[arg(long)]
    context_window: Option<u32>,

    #[arg(long, default_value_t = DEFAULT_UNKNOWN_MODEL_CONTEXT_WINDOW)]
    unknown_model_context_window: u32,

    /// Seconds before a tool call is treated as failed.
    #[arg(long, default_value_t = 60)]
    tool_timeout: u64,

    #[arg(long, default_value_t = 32)]
    max_steps: usize,

    #[arg(long)]
    system_prompt_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SandboxArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_SANDBOX_PORT)]
    port: u16,

    #[command(flatten)]
    cors: CorsArgs,

    /// Minutes used when activation does not specify a duration.
    #[arg(long, default_value_t = 30)]
    timeout_minutes: u64,

    #[arg(long, default_value_t = 3)]
    auto_extend_minutes: u64,

    /// Do not extend the timeout on API traffic.
    #[arg(long, env = "AGENTBOX_NO_AUTO_EXTEND")]
    no_auto_extend: bool,

    /// Arm the timeout at startup.
    #[arg(long)]
    activate: bool,

    /// Command run on expiry instead of shutting the server down.
    #[arg(long = "teardown-command", num_args = 1.., allow_hyphen_values = true)]
    teardown_command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct OpenapiArgs {
    /// Document the sandbox surface instead of the agent API.
    #[arg(long)]
    sandbox: bool,

    #[arg(long, short = 'o')]
    out: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agentbox() -> Result<(), CliError> {
    let cli = AgentboxCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let token = if cli.no_token { None } else { cli.token.clone() };
    match &cli.command {
        Command::Server(args) => run_server(token, args),
        Command::Sandbox(args) => run_sandbox(args),
        Command::Openapi(args) => write_openapi(args),
    }
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

impl ServerArgs {
    fn agent_config(&self) -> Result<AgentConfig, CliError> {
        let mut config = AgentConfig {
            context_overflow: ContextOverflowConfig {
                context_window: self.context_window,
                unknown_model_context_window: self.unknown_model_context_window,
            },
            tool_timeout: Duration::from_secs(self.tool_timeout),
            max_steps: self.max_steps.max(1),
            ..AgentConfig::default()
        };
        if let Some(path) = &self.system_prompt_file {
            config.system_prompt = std::fs::read_to_string(path)?;
        }
        Ok(config)
    }

    fn model_config(&self) -> ModelConfig {
        ModelConfig {
            name: self.model.clone(),
            api_base: self.api_base.clone(),
            api_key: self.api_key.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            request_timeout: Duration::from_secs(self.model_timeout),
        }
    }

    fn tools_config(&self) -> Result<ToolsConfig, CliError> {
        let mut config = match &self.tools_config {
            Some(path) => ToolsConfig::load(path)?,
            None => ToolsConfig::default(),
        };
        if config.skills_dir.is_none() {
            config.skills_dir = self
                .skills_dir
                .clone()
                .or_else(default_skills_dir)
                .filter(|dir| dir.is_dir());
        }
        Ok(config)
    }
}

fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(token: Option<String>, args: &ServerArgs) -> Result<(), CliError> {
    let auth = match token {
        Some(token) => AuthConfig::with_token(token),
        None => AuthConfig::disabled(),
    };
    let agent_config = args.agent_config()?;
    let tools_config = args.tools_config()?;
    let model = Arc::new(OpenAiChatModel::new(args.model_config())?);
    let cors = build_cors_layer(&args.cors)?;
    let addr = format!("{}:{}", args.host, args.port);

    runtime()?.block_on(async move {
        let registry = Arc::new(ToolRegistry::build(&tools_config, agent_config.tool_timeout).await);
        let streams = Arc::new(MemoryEventStream::new());
        let tasks = Arc::new(TaskManager::new(
            streams,
            model,
            registry.clone(),
            agent_config,
        ));
        let (router, _state) = build_router_with_state(Arc::new(AppState::new(auth, tasks)));
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, model = %args.model, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                registry.shutdown().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_sandbox(args: &SandboxArgs) -> Result<(), CliError> {
    let config = SandboxConfig {
        default_timeout_minutes: args.timeout_minutes,
        expand_enabled: !args.no_auto_extend,
        auto_extend_minutes: args.auto_extend_minutes,
        ..SandboxConfig::default()
    };
    let cors = build_cors_layer(&args.cors)?;
    let addr = format!("{}:{}", args.host, args.port);

    runtime()?.block_on(async move {
        let shutdown = ShutdownTeardown::new();
        let teardown: Arc<dyn Teardown> = if args.teardown_command.is_empty() {
            Arc::new(shutdown.clone())
        } else {
            Arc::new(CommandTeardown::new(args.teardown_command.clone()))
        };
        let supervisor = Arc::new(TimeoutSupervisor::new(config, teardown));
        let ticker = supervisor.clone().spawn_ticker();
        if args.activate {
            supervisor.activate(None).await;
        }
        let router = build_sandbox_router(supervisor).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "sandbox api listening");
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = shutdown.requested() => {}
                }
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()));
        ticker.abort();
        result
    })
}

fn write_openapi(args: &OpenapiArgs) -> Result<(), CliError> {
    let json = if args.sandbox {
        SandboxApiDoc::openapi().to_pretty_json()?
    } else {
        ApiDoc::openapi().to_pretty_json()?
    };
    match &args.out {
        Some(path) => std::fs::write(path, json)?,
        None => {
            let mut out = std::io::stdout();
            out.write_all(json.as_bytes())?;
            out.write_all(b"\n")?;
            out.flush()?;
        }
    }
    Ok(())
}

fn build_cors_layer(args: &CorsArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if args.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &args.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if args.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &args.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if args.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}
