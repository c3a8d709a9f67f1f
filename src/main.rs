//! llama-session demo binary.
//!
//! Runs the three demo flows (chat, streaming chat, vision) against the
//! built-in scripted backend, printing status lines the way a front end
//! would show them.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tracing::info;

use llama_session::chat::{ChatMessage, ContentPart, Role};
use llama_session::config::{Cli, Command, Config};
use llama_session::inference::engine::{GenerationRequest, GenerationResult};
use llama_session::inference::stub::{StubBackend, StubScript};
use llama_session::notify::ChannelNotifier;
use llama_session::SessionManager;

const DEMO_CHAT_PROMPT: &str = "Tell me a story about a brave robot.";
const DEMO_VISION_PROMPT: &str = "What do you see in this image? Describe it in detail.";

/// Pause per generated token, so streaming is visible.
const DEMO_STEP_DELAY: Duration = Duration::from_millis(40);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "llama_session=debug"
    } else {
        "llama_session=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("llama-session v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        model = %config.model.model_path.display(),
        projector = ?config.model.projector_path,
        context_size = config.model.context_size,
        "Configuration loaded"
    );

    let backend = StubBackend::new(StubScript::words(&cli.script).with_step_delay(DEMO_STEP_DELAY));
    let (notifier, mut events) = ChannelNotifier::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            eprintln!("[status] {}", event.status());
        }
    });

    let manager = SessionManager::with_notifier(Arc::new(backend), &config, Arc::new(notifier));
    let outcome = run(&cli, &config, &manager).await;
    manager.release_all().await;
    drop(manager);

    // Let the status printer drain what is left.
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;
    outcome
}

async fn run(cli: &Cli, config: &Config, manager: &SessionManager) -> anyhow::Result<()> {
    let model = config.model.model_path.as_path();

    match &cli.command {
        Command::Models => {
            let descriptor = manager
                .registry()
                .resolve(model, config.model.projector_path.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }

        Command::Chat { prompt, stream } => {
            let session = manager.init_context(model, None).await?;
            let messages = [
                ChatMessage::system(config.chat.system_prompt.as_str()),
                ChatMessage::user(prompt.as_deref().unwrap_or(DEMO_CHAT_PROMPT)),
            ];
            let formatted = session.format_chat(&messages, None)?;
            let request = GenerationRequest::from_config(formatted, &config.generation);

            let result = if *stream {
                let mut generation = session.submit(request.streaming(true))?;
                let cancel = generation.cancel_token();
                let ctrl_c = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                });
                if let Some(mut tokens) = generation.token_stream() {
                    while let Some(token) = tokens.next().await {
                        print!("{}", token.text);
                        std::io::stdout().flush()?;
                    }
                }
                ctrl_c.abort();
                println!();
                generation.finish().await?
            } else {
                let result = session.complete(request).await?;
                println!("{}", result.text);
                result
            };
            report(&result);
        }

        Command::Vision { media, prompt } => {
            let projector = config
                .model
                .projector_path
                .as_deref()
                .context("vision needs a projector (--projector or model.projector_path)")?;
            let session = manager.init_context(model, Some(projector)).await?;

            let messages = [ChatMessage::with_parts(
                Role::User,
                vec![
                    ContentPart::Text {
                        text: prompt.as_deref().unwrap_or(DEMO_VISION_PROMPT).to_string(),
                    },
                    ContentPart::Media {
                        path: Some(media.clone()),
                    },
                ],
            )];
            let formatted = session.format_chat(&messages, None)?;
            let media_paths = messages.iter().flat_map(|m| m.media_paths()).collect();
            let request = GenerationRequest::multimodal(formatted, media_paths, &config.multimodal);

            let result = session
                .complete_streaming(request, |token| {
                    print!("{}", token.text);
                    let _ = std::io::stdout().flush();
                })
                .await?;
            println!();
            report(&result);
        }
    }

    Ok(())
}

fn report(result: &GenerationResult) {
    info!(
        tokens = result.token_count,
        elapsed_ms = result.elapsed_ms,
        tokens_per_second = result.tokens_per_second,
        prompt_n = result.timings.prompt_n,
        stop = %result.stop_reason,
        "Generation stats"
    );
}
