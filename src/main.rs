//! `speakwell` command-line entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use speakwell::Config;

#[derive(Parser, Debug)]
#[command(name = "speakwell", version, about = "Spoken English tutoring over a live voice model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a live tutoring session on the default microphone and speaker
    Talk(TalkArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[cfg_attr(not(feature = "audio-device"), allow(dead_code))]
#[derive(Args, Debug)]
struct TalkArgs {
    /// Persona / system instruction text
    #[arg(long, conflicts_with = "persona_file", required_unless_present = "persona_file")]
    persona: Option<String>,
    /// Read the persona from a file
    #[arg(long)]
    persona_file: Option<PathBuf>,
    /// Prebuilt voice name (defaults to live.default_voice)
    #[arg(long)]
    voice: Option<String>,
    /// Do not request input/output transcriptions
    #[arg(long)]
    no_transcripts: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration JSON schema
    Schema,
}

/// A line typed on stdin during `talk`.
#[cfg_attr(not(feature = "audio-device"), allow(dead_code))]
#[derive(Debug, PartialEq)]
enum SessionCommand {
    Next(String),
    Quit,
    Unknown(String),
}

#[cfg_attr(not(feature = "audio-device"), allow(dead_code))]
fn parse_session_command(line: &str) -> Option<SessionCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Some(match verb.to_ascii_lowercase().as_str() {
        "next" if !rest.trim().is_empty() => SessionCommand::Next(rest.trim().to_string()),
        "quit" | "exit" => SessionCommand::Quit,
        _ => SessionCommand::Unknown(line.to_string()),
    })
}

/// The part of `after` not yet printed, or all of it when the rolling
/// window dropped the old prefix.
#[cfg_attr(not(feature = "audio-device"), allow(dead_code))]
fn transcript_delta<'a>(before: &str, after: &'a str) -> Option<&'a str> {
    if after.is_empty() || after == before {
        return None;
    }
    Some(after.strip_prefix(before).unwrap_or(after))
}

fn persona_text(args: &TalkArgs) -> Result<String> {
    match (&args.persona, &args.persona_file) {
        (Some(text), _) => Ok(text.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona file {}", path.display())),
        (None, None) => anyhow::bail!("either --persona or --persona-file is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("speakwell=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Talk(args) => {
            let config = Config::load_or_default()?;
            talk(config, args).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let mut config = Config::load_or_default()?;
                let key_count = config.live.api_keys.len();
                config.live.api_keys = vec!["<redacted>".to_string(); key_count];
                print!("{}", config.to_toml()?);
                Ok(())
            }
            ConfigAction::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
        },
    }
}

#[cfg(not(feature = "audio-device"))]
async fn talk(_config: Config, args: TalkArgs) -> Result<()> {
    persona_text(&args)?;
    anyhow::bail!(
        "this build has no audio device support; rebuild with `--features audio-device` to run a live session"
    )
}

#[cfg(feature = "audio-device")]
async fn talk(config: Config, args: TalkArgs) -> Result<()> {
    use std::sync::Arc;

    use speakwell::voice::{
        CpalCapture, CpalSink, GeminiLiveTransport, KeyRing, SessionContext, VoiceEngine,
        VoiceSessionHandle,
    };
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut context =
        SessionContext::new(persona_text(&args)?).with_transcripts(!args.no_transcripts);
    if let Some(voice) = args.voice {
        context = context.with_voice(voice);
    }

    let sink =
        CpalSink::open(config.playback.sample_rate).context("Failed to open speaker output")?;
    let transport = Arc::new(GeminiLiveTransport::new(config.live.clone()));
    let credentials = Arc::new(KeyRing::from_config(&config.live));
    let (mut engine, inbox) = VoiceEngine::new(
        config,
        transport,
        credentials,
        Box::new(CpalCapture::new()),
        Box::new(sink),
    );
    engine.on_warning(|warning| eprintln!("! {}", warning.message));

    let handle = VoiceSessionHandle::spawn(engine, inbox);
    let printer = tokio::spawn(print_updates(handle.subscribe()));

    handle
        .start(context)
        .await
        .context("Failed to start voice session")?;
    eprintln!("Session live. Type `next <step>` to advance, `quit` to end.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match parse_session_command(&line) {
                    Some(SessionCommand::Next(step)) => match handle.advance(step).await {
                        Ok(path) => tracing::info!(path = ?path, "Advanced to next step"),
                        Err(e) => eprintln!("error: {e}"),
                    },
                    Some(SessionCommand::Quit) => break,
                    Some(SessionCommand::Unknown(other)) => {
                        eprintln!("unknown command: {other} (use `next <step>` or `quit`)");
                    }
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop().await;
    printer.abort();
    let stats = handle.snapshot().stats;
    handle.shutdown().await;
    tracing::info!(
        turns = stats.turns_completed,
        interruptions = stats.interruptions,
        frames_sent = stats.frames_sent,
        "Session ended"
    );
    Ok(())
}

#[cfg(feature = "audio-device")]
async fn print_updates(
    mut snapshots: tokio::sync::watch::Receiver<speakwell::voice::SessionSnapshot>,
) {
    let mut last = speakwell::voice::SessionSnapshot::default();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if let Some(text) = transcript_delta(&last.input_transcript, &snapshot.input_transcript) {
            println!("you   > {text}");
        }
        if let Some(text) = transcript_delta(&last.output_transcript, &snapshot.output_transcript)
        {
            println!("tutor > {text}");
        }
        if snapshot.connection_error != last.connection_error {
            if let Some(error) = &snapshot.connection_error {
                eprintln!("error: {error}");
            }
        }
        last = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_commands() {
        assert_eq!(
            parse_session_command("next Ask about the weekend"),
            Some(SessionCommand::Next("Ask about the weekend".into()))
        );
        assert_eq!(parse_session_command("  QUIT "), Some(SessionCommand::Quit));
        assert_eq!(parse_session_command(""), None);
        assert_eq!(
            parse_session_command("next"),
            Some(SessionCommand::Unknown("next".into()))
        );
    }

    #[test]
    fn transcript_delta_prints_new_suffix() {
        assert_eq!(transcript_delta("Hello", "Hello there"), Some(" there"));
        assert_eq!(transcript_delta("Hello", "Hello"), None);
        assert_eq!(transcript_delta("old text", "new window"), Some("new window"));
        assert_eq!(transcript_delta("Hello", ""), None);
    }

    #[test]
    fn cli_requires_a_persona() {
        assert!(Cli::try_parse_from(["speakwell", "talk"]).is_err());
        let cli = Cli::try_parse_from(["speakwell", "talk", "--persona", "Barista"]).unwrap();
        let Commands::Talk(args) = cli.command else {
            panic!("expected talk");
        };
        assert_eq!(persona_text(&args).unwrap(), "Barista");
    }
}
