//! Interactive chat CLI for gpulm-core.
//!
//! ```sh
//! cargo run --example chat --release -- --manifest /path/to/manifest.json --base /path/to/model
//! cargo run --example chat --release -- --temperature 0.5 --max-tokens 1024
//! ```

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};

use gpulm_core::model::shard::LocalFileShardAdapter;
use gpulm_core::tokenizer::StaticTokenizerAdapter;
use gpulm_core::{ChatMessage, GenerateEvent, GenerateOptions, LoadOptions, LoadProgress, Session};

struct Args {
    manifest: String,
    base: String,
    tokenizer: String,
    max_tokens: usize,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    repetition_penalty: f32,
}

fn parse_args() -> Args {
    let mut args = Args {
        manifest: "model/manifest.json".to_string(),
        base: "model".to_string(),
        tokenizer: "model/tokenizer.json".to_string(),
        max_tokens: 512,
        temperature: 0.7,
        top_k: 40,
        top_p: 0.95,
        repetition_penalty: 1.1,
    };

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < raw.len() {
        match raw[i].as_str() {
            "--manifest" => {
                i += 1;
                args.manifest = raw[i].clone();
            }
            "--base" => {
                i += 1;
                args.base = raw[i].clone();
            }
            "--tokenizer" => {
                i += 1;
                args.tokenizer = raw[i].clone();
            }
            "--max-tokens" => {
                i += 1;
                args.max_tokens = raw[i].parse().expect("invalid --max-tokens");
            }
            "--temperature" => {
                i += 1;
                args.temperature = raw[i].parse().expect("invalid --temperature");
            }
            "--top-k" => {
                i += 1;
                args.top_k = raw[i].parse().expect("invalid --top-k");
            }
            "--top-p" => {
                i += 1;
                args.top_p = raw[i].parse().expect("invalid --top-p");
            }
            "--repetition-penalty" => {
                i += 1;
                args.repetition_penalty = raw[i].parse().expect("invalid --repetition-penalty");
            }
            "-h" | "--help" => {
                eprintln!(
                    "gpulm-core chat — interactive GPU transformer inference

Usage: cargo run --example chat --release -- [options]

Options:
  --manifest <path>            Model manifest JSON (default: model/manifest.json)
  --base <path>                Shard base directory (default: model)
  --tokenizer <path>           tokenizer.json path (default: model/tokenizer.json)
  --max-tokens <n>             Max tokens to generate (default: 512)
  --temperature <f>            Sampling temperature (default: 0.7)
  --top-k <n>                  Top-K sampling (default: 40)
  --top-p <f>                  Top-P (nucleus) sampling (default: 0.95)
  --repetition-penalty <f>     Repetition penalty (default: 1.1)
  -h, --help                   Show this help"
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    args
}

#[tokio::main]
async fn main() -> gpulm_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gpulm_core=info".parse().unwrap()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = parse_args();

    eprintln!("gpulm-core — Rust CLI");
    eprintln!("======================\n");
    eprintln!("Loading model from:\n  manifest: {}\n  shards:   {}\n", cli.manifest, cli.base);

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {msg:8} [{bar:30}] {pos}%")
            .unwrap()
            .progress_chars("##-"),
    );

    let options = LoadOptions {
        on_progress: Some(Box::new(move |p: LoadProgress| {
            let pct = (p.fraction * 100.0) as u64;
            let phase = match p.phase {
                gpulm_core::model::loader::LoadPhase::Manifest => "Manifest",
                gpulm_core::model::loader::LoadPhase::Shard => "Shard",
                gpulm_core::model::loader::LoadPhase::Upload => "Upload",
            };
            pb.set_message(phase.to_string());
            pb.set_position(pct);
            if p.fraction >= 1.0 {
                pb.finish_and_clear();
            }
        })),
    };

    let manifest_bytes = std::fs::read(&cli.manifest)?;
    let shard_adapter = Arc::new(LocalFileShardAdapter::new(cli.base.clone(), None));
    let tokenizer = Arc::new(StaticTokenizerAdapter::from_file(&cli.tokenizer)?);

    let mut session = Session::load(&manifest_bytes, shard_adapter, tokenizer, options).await?;

    eprintln!("\nModel loaded! Type your message (Ctrl+D to exit).\n");

    let stdin = io::stdin();
    let mut history: Vec<ChatMessage> = vec![ChatMessage {
        role: "system".into(),
        content: "You are a helpful assistant.".into(),
    }];

    loop {
        eprint!("You: ");
        io::stderr().flush().unwrap();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap() == 0 {
            break; // EOF
        }

        let text = line.trim().to_string();
        if text.is_empty() {
            continue;
        }

        history.push(ChatMessage {
            role: "user".into(),
            content: text,
        });

        print!("\nAssistant: ");
        io::stdout().flush().unwrap();

        let t0 = Instant::now();
        let mut token_count = 0usize;

        let opts = GenerateOptions {
            max_tokens: cli.max_tokens,
            temperature: cli.temperature,
            top_k: cli.top_k,
            top_p: cli.top_p,
            repetition_penalty: cli.repetition_penalty,
            use_chat_template: true,
            ..Default::default()
        };

        // Session::generate takes one prompt string; chat structuring
        // happens inside the tokenizer's chat template, so only the latest
        // user turn is sent as the prompt (the template itself doesn't see
        // prior turns here — a future revision could thread full history
        // through a template-aware entry point).
        let prompt = history.last().map(|m| m.content.clone()).unwrap_or_default();

        let mut stream = Box::pin(session.generate(&prompt, opts));
        let mut assistant_response = String::new();

        while let Some(event) = stream.next().await {
            match event? {
                GenerateEvent::Token(tok) => {
                    print!("{}", tok.token_text);
                    io::stdout().flush().unwrap();
                    assistant_response.push_str(&tok.token_text);
                    token_count += 1;
                }
                GenerateEvent::Done(_) => break,
            }
        }
        drop(stream);

        let elapsed = t0.elapsed().as_secs_f64();
        let tok_sec = token_count as f64 / elapsed;

        println!("\n\n  [{token_count} tokens in {elapsed:.1}s — {tok_sec:.1} tok/s]\n");

        history.push(ChatMessage {
            role: "assistant".into(),
            content: assistant_response,
        });

        // Keep system + last 2 turns to avoid context overflow.
        if history.len() > 5 {
            history.drain(1..history.len() - 2);
        }
    }

    eprintln!("\nBye!");
    Ok(())
}
