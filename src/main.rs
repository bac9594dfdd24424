//! llama-stream - streaming generation from the command line
//!
//! Usage: `llama-stream <model.gguf> [prompt]`

use std::io::Write;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llama_stream::inference::{Engine, GenerationOutcome};
use llama_stream::storage::settings::load_settings;

/// How often the output is polled
const POLL_INTERVAL: Duration = Duration::from_millis(16);

const DEFAULT_PROMPT: &str = "Hello";

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llama_stream=info")),
        )
        .init();

    info!("Starting llama-stream v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let Some(model_path) = args.next() else {
        eprintln!("usage: llama-stream <model.gguf> [prompt]");
        return ExitCode::from(2);
    };
    let prompt = args.collect::<Vec<_>>().join(" ");
    let prompt = if prompt.is_empty() {
        DEFAULT_PROMPT.to_string()
    } else {
        prompt
    };

    let settings = load_settings();
    let mut engine = match Engine::with_llama_cpp() {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start engine: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = engine.apply_settings(&settings) {
        error!("Failed to apply settings: {}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = engine.load_model(&model_path, settings.context_size) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }
    if let Err(e) = engine.start_generation_default(prompt) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let mut stdout = std::io::stdout();
    loop {
        let generating = engine.is_generating();
        let text = engine.drain_output();
        if !text.is_empty() {
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
        if !generating {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }
    println!();

    match engine.last_outcome() {
        Some(GenerationOutcome::Failed(e)) => {
            error!("Generation ended abnormally: {}", e);
            ExitCode::FAILURE
        }
        Some(GenerationOutcome::Finished(reason)) => {
            info!(
                "Generation finished ({:?}), context {:.0}% full",
                reason,
                engine.context_fill_ratio() * 100.0
            );
            ExitCode::SUCCESS
        }
        None => ExitCode::SUCCESS,
    }
}
