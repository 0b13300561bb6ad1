//! CLI binary for generating text, JSON and images through Grail providers.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use grail::{
    Client, ClientConfig, GeminiAdapter, GenerationOptions, Input, ModelTier, OpenAiAdapter,
    Output, OutputPart, Request, Response,
};

#[derive(Parser)]
#[command(name = "grail", version, about = "Provider-neutral text and image generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one request to one or more providers in parallel
    Generate {
        /// Prompt text, sent after any attachments
        prompt: String,

        /// Provider to call; repeat to fan out
        #[arg(short, long = "provider", value_enum, default_value = "openai")]
        providers: Vec<ProviderKind>,

        /// Local file to attach; repeatable
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Remote file to download and attach; repeatable
        #[arg(short, long = "url")]
        urls: Vec<String>,

        /// Kind of output to request
        #[arg(short, long, value_enum, default_value_t = OutputKind::Text)]
        output: OutputKind,

        /// JSON schema file for --output json
        #[arg(long)]
        schema: Option<PathBuf>,

        /// Number of images for --output image
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Model tier (best or fast); ignored when --model is given
        #[arg(short, long)]
        tier: Option<ModelTier>,

        /// Exact model name
        #[arg(short, long)]
        model: Option<String>,

        /// System prompt
        #[arg(long)]
        system: Option<String>,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long, conflicts_with = "top_p")]
        temperature: Option<f32>,

        #[arg(long)]
        top_p: Option<f32>,

        /// Directory for generated images
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// List the model catalog of each provider
    Models {
        #[arg(short, long = "provider", value_enum, default_values = ["openai", "gemini"])]
        providers: Vec<ProviderKind>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputKind {
    Text,
    Image,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Generate {
            prompt,
            providers,
            files,
            urls,
            output,
            schema,
            count,
            tier,
            model,
            system,
            max_tokens,
            temperature,
            top_p,
            out_dir,
        } => {
            let output = build_output(output, schema.as_deref(), count)?;
            let options = GenerationOptions {
                max_tokens,
                temperature,
                top_p,
                system_prompt: system,
            };
            let clients = providers
                .iter()
                .map(|p| build_client(*p))
                .collect::<anyhow::Result<Vec<_>>>()?;

            let fetcher = clients.first().context("no provider selected")?;
            let inputs = collect_inputs(fetcher, &files, &urls, prompt).await?;
            let mut request = Request::new(inputs, output).with_options(options);
            request.model = model;
            request.tier = tier;

            cmd_generate(clients, request, &out_dir).await?;
        }
        Commands::Models { providers } => {
            for provider in providers {
                cmd_models(&build_client(provider)?).await?;
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "grail=debug,info" } else { "warn" })
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_client(kind: ProviderKind) -> anyhow::Result<Client> {
    let config = |name: &str| ClientConfig {
        span: tracing::info_span!("provider", name),
        ..Default::default()
    };
    Ok(match kind {
        ProviderKind::Openai => Client::with_config(OpenAiAdapter::from_env()?, config("openai")),
        ProviderKind::Gemini => Client::with_config(GeminiAdapter::from_env()?, config("gemini")),
    })
}

fn build_output(kind: OutputKind, schema: Option<&Path>, count: u32) -> anyhow::Result<Output> {
    Ok(match kind {
        OutputKind::Text => Output::text(),
        OutputKind::Image => Output::image(count),
        OutputKind::Json => {
            let schema = match schema {
                Some(path) => {
                    let raw = std::fs::read_to_string(path)
                        .with_context(|| format!("reading schema {}", path.display()))?;
                    Some(serde_json::from_str(&raw).context("schema is not valid JSON")?)
                }
                None => None,
            };
            Output::json(schema)
        }
    })
}

/// Attachments in command-line order, then the prompt.
async fn collect_inputs(
    client: &Client,
    files: &[PathBuf],
    urls: &[String],
    prompt: String,
) -> anyhow::Result<Vec<Input>> {
    let mut inputs = Vec::with_capacity(files.len() + urls.len() + 1);
    for path in files {
        inputs.push(Input::from_path(path).await?);
    }
    for url in urls {
        inputs.push(client.input_file_from_uri(url).await?);
    }
    inputs.push(Input::text(prompt));
    Ok(inputs)
}

async fn cmd_generate(clients: Vec<Client>, request: Request, out_dir: &Path) -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();
    for client in clients {
        let request = request.clone();
        tasks.spawn(async move {
            let name = client.provider_name().to_string();
            (name, client.generate(request).await)
        });
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        let (provider, result) = joined.context("generation task panicked")?;
        match result {
            Ok(response) => print_response(&provider, &response, out_dir)?,
            Err(err) => {
                failures += 1;
                let hint = if err.is_retryable() { " (retryable)" } else { "" };
                eprintln!("[{provider}] error: {err}{hint}");
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} provider(s) failed");
    }
    Ok(())
}

fn print_response(provider: &str, response: &Response, out_dir: &Path) -> anyhow::Result<()> {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut image_index = 0;
    for part in &response.outputs {
        match part {
            OutputPart::Text { text } => println!("[{provider}] {text}"),
            OutputPart::Json { raw } => println!("[{provider}] {}", String::from_utf8_lossy(raw)),
            OutputPart::Image { data, mime, .. } => {
                std::fs::create_dir_all(out_dir)?;
                let path = out_dir.join(format!(
                    "{provider}-{stamp}-{image_index}.{}",
                    extension_for(mime)
                ));
                std::fs::write(&path, data)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("[{provider}] wrote {} ({} bytes)", path.display(), data.len());
                image_index += 1;
            }
        }
    }
    for warning in &response.warnings {
        eprintln!("[{provider}] warning {}: {}", warning.code, warning.message);
    }
    tracing::info!(
        provider,
        input_tokens = response.usage.input_tokens,
        output_tokens = response.usage.output_tokens,
        "usage"
    );
    Ok(())
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

async fn cmd_models(client: &Client) -> anyhow::Result<()> {
    let models = client.list_models().await?;
    println!("{}:", client.provider_name());
    for model in models {
        let tier = model.tier.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        println!("  {:<32} role={:<6} tier={}", model.name, model.role, tier);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
