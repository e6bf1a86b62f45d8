use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tryon_contracts::events::EventWriter;
use tryon_contracts::features::{CameraAngle, Gender, HexColor, PlacementMode};
use tryon_contracts::prompts::build_prompt;
use tryon_contracts::runs::receipts::{build_receipt, write_receipt, ReceiptRequest};
use tryon_contracts::session::{ProviderSelection, SessionStore, CHAT_KEY, GEMINI_KEY, OPENROUTER_KEY};
use tryon_contracts::{FeatureKind, GenerationOptions};
use tryon_engine::codec::{fetch_remote_asset, read_image_file};
use tryon_engine::orchestrator::render_attempts;
use tryon_engine::providers::{default_provider_registry, model_selector, GeminiProvider};
use tryon_engine::{EngineConfig, GenerationError, GenerationRequest, ImageAsset, ImageError, Orchestrator};

#[derive(Debug, Parser)]
#[command(name = "tryon", version, about = "Virtual try-on, hairstyle and background edits")]
struct Cli {
    /// Session file holding API keys, the provider selection and saved results.
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Prompt(PromptArgs),
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    Saved,
}

#[derive(Debug, Args)]
struct FeatureArgs {
    #[arg(long)]
    feature: FeatureKind,
    #[arg(long)]
    body_build: Option<String>,
    #[arg(long, default_value = "front")]
    angle: CameraAngle,
    #[arg(long, default_value = "unisex")]
    gender: Gender,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    background: Option<String>,
    #[arg(long, default_value = "auto")]
    placement: PlacementMode,
    #[arg(long)]
    placement_notes: Option<String>,
    #[arg(long)]
    notes: Option<String>,
    #[arg(long, value_parser = parse_color)]
    color: Option<HexColor>,
}

impl FeatureArgs {
    fn options(&self) -> GenerationOptions {
        GenerationOptions {
            body_build: self.body_build.clone(),
            angle: self.angle,
            gender: self.gender,
            style_description: self.style.clone(),
            background_description: self.background.clone(),
            placement: self.placement,
            placement_instructions: self.placement_notes.clone(),
            custom_prompt: self.notes.clone(),
            color_override: self.color.clone(),
        }
    }
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[command(flatten)]
    feature: FeatureArgs,
    /// Path, http(s) URL or data URL of the person photo.
    #[arg(long)]
    subject: String,
    #[arg(long)]
    reference: Option<String>,
    /// Provider id; defaults to the selection stored in settings.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "tryon-out")]
    out: PathBuf,
    /// Send images as loaded and keep the provider output uncropped.
    #[arg(long)]
    no_letterbox: bool,
}

#[derive(Debug, Args)]
struct PromptArgs {
    #[command(flatten)]
    feature: FeatureArgs,
    /// Render the variant that refers to a reference image.
    #[arg(long)]
    with_reference: bool,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    SetKey { slot: KeySlot, key: String },
    ClearKey { slot: KeySlot },
    SetProvider { selection: ProviderSelection },
    /// Probe the direct Gemini key (or `--key`) with a minimal request.
    CheckKey {
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KeySlot {
    Openrouter,
    Gemini,
    Chat,
}

impl KeySlot {
    fn session_key(&self) -> &'static str {
        match self {
            KeySlot::Openrouter => OPENROUTER_KEY,
            KeySlot::Gemini => GEMINI_KEY,
            KeySlot::Chat => CHAT_KEY,
        }
    }
}

fn parse_color(raw: &str) -> Result<HexColor, String> {
    HexColor::parse(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() {
    init_tracing();
    match run(Cli::parse()).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tryon error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let state = cli.state.unwrap_or_else(default_state_path);
    match cli.command {
        Command::Generate(args) => run_generate(args, &state).await,
        Command::Prompt(args) => {
            let prompt = build_prompt(args.feature.feature, &args.feature.options(), args.with_reference);
            println!("{prompt}");
            Ok(0)
        }
        Command::Settings { action } => run_settings(action, &state).await,
        Command::Saved => {
            let store = SessionStore::load(&state)?;
            for location in store.saved_images() {
                println!("{location}");
            }
            Ok(0)
        }
    }
}

fn default_state_path() -> PathBuf {
    if let Some(path) = non_empty_env("TRYON_STATE") {
        return PathBuf::from(path);
    }
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tryon")
        .join("session.json")
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn run_generate(args: GenerateArgs, state: &Path) -> Result<i32> {
    let mut store = SessionStore::load(state)?;
    let config = EngineConfig::from_env();
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let credentials = store.credentials().with_overrides(non_empty_env);
    let provider = args
        .provider
        .clone()
        .unwrap_or_else(|| store.provider_selection().provider_id().to_string());

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let run_id = uuid::Uuid::new_v4().to_string();
    let events = EventWriter::open(args.out.join("events.jsonl"), run_id.clone())?;
    info!(run_id = %run_id, provider = %provider, "starting generation");

    let orchestrator = Orchestrator::new(
        config.clone(),
        default_provider_registry(&config, http.clone()),
        credentials,
        model_selector(&config),
        Some(events),
    );
    let options = args.feature.options();
    let outcome = generate(&orchestrator, &http, &args, &provider, options.clone()).await;
    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            report_failure(&err);
            return Ok(1);
        }
    };

    let timestamp = Utc::now().timestamp_millis();
    let file_name = result.artifact_file_name(timestamp);
    let image_path = args.out.join(&file_name);
    fs::write(&image_path, &result.image.bytes)
        .with_context(|| format!("failed to write {}", image_path.display()))?;

    let stem = file_name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&file_name);
    let receipt_path = args.out.join(format!("receipt-{stem}.json"));
    let receipt_request = ReceiptRequest {
        feature: args.feature.feature,
        provider: result.provider.clone(),
        model: Some(result.model.clone()),
        prompt: result.prompt.clone(),
        options,
        subject: Some(args.subject.clone()),
        reference: args.reference.clone(),
    };
    let mut metadata = result.metadata();
    metadata.insert("run_id".to_string(), json!(run_id));
    let receipt = build_receipt(
        &receipt_request,
        &result.attempts,
        &result.provider_response,
        &image_path,
        &receipt_path,
        &metadata,
    );
    write_receipt(&receipt_path, &receipt)?;

    let saved = fs::canonicalize(&image_path).unwrap_or_else(|_| image_path.clone());
    if let Err(err) = store.save_image(&saved.to_string_lossy()) {
        warn!("could not record saved image: {err:#}");
    }
    if let Some(reason) = &result.fallback_reason {
        eprintln!("note: {reason}");
    }
    println!("{}", image_path.display());
    Ok(0)
}

async fn generate(
    orchestrator: &Orchestrator,
    http: &reqwest::Client,
    args: &GenerateArgs,
    provider: &str,
    options: GenerationOptions,
) -> Result<tryon_engine::GenerationResult, GenerationError> {
    let config = orchestrator.config();
    let subject = load_asset(http, &args.subject, config).await?;
    let reference = match args.reference.as_deref() {
        Some(location) => Some(load_asset(http, location, config).await?),
        None => None,
    };
    let mut request = GenerationRequest::new(args.feature.feature, provider);
    request.subject = Some(subject);
    request.reference = reference;
    request.options = options;
    request.model = args.model.clone();
    request.letterbox = !args.no_letterbox;
    orchestrator.generate(request).await
}

async fn load_asset(http: &reqwest::Client, location: &str, config: &EngineConfig) -> Result<ImageAsset, ImageError> {
    let trimmed = location.trim();
    if trimmed.starts_with("data:") || trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return fetch_remote_asset(http, trimmed, None, config).await;
    }
    let path = Path::new(trimmed);
    let mut asset = read_image_file(path, config).await?;
    if asset.name.is_none() {
        asset.name = path.file_name().map(|name| name.to_string_lossy().to_string());
    }
    Ok(asset)
}

fn report_failure(err: &GenerationError) {
    match err {
        GenerationError::Provider { error, attempts } => {
            eprintln!("tryon: {} ({})", error.user_message(), error.class);
            eprintln!("attempts: {}", render_attempts(attempts));
        }
        other => eprintln!("tryon: {}", other.user_message()),
    }
}

async fn run_settings(action: SettingsCommand, state: &Path) -> Result<i32> {
    let mut store = SessionStore::load(state)?;
    match action {
        SettingsCommand::Show => {
            println!("{}", serde_json::to_string_pretty(&settings_summary(&store))?);
        }
        SettingsCommand::SetKey { slot, key } => {
            store.set(slot.session_key(), &key)?;
            println!("saved {} key to {}", slot_label(slot), store.path().display());
        }
        SettingsCommand::ClearKey { slot } => {
            if store.remove(slot.session_key())? {
                println!("cleared {} key", slot_label(slot));
            } else {
                println!("no {} key was stored", slot_label(slot));
            }
        }
        SettingsCommand::SetProvider { selection } => {
            store.set_provider_selection(selection)?;
            println!("provider set to {selection}");
        }
        SettingsCommand::CheckKey { key } => {
            let config = EngineConfig::from_env();
            let credentials = store.credentials().with_overrides(non_empty_env);
            let key = key.or(credentials.gemini);
            let http = reqwest::Client::builder()
                .build()
                .context("failed to build HTTP client")?;
            let check = GeminiProvider::new(&config, http).check_key(key.as_deref()).await;
            println!("{}", check.message);
            if let Some(class) = check.class {
                eprintln!("{}", class.guidance());
            }
            return Ok(if check.valid { 0 } else { 1 });
        }
    }
    Ok(0)
}

fn slot_label(slot: KeySlot) -> &'static str {
    match slot {
        KeySlot::Openrouter => "OpenRouter",
        KeySlot::Gemini => "Gemini",
        KeySlot::Chat => "chat-compatible",
    }
}

fn settings_summary(store: &SessionStore) -> Value {
    let credentials = store.credentials();
    let mut keys = Map::new();
    keys.insert("openrouter".to_string(), json!(credentials.openrouter.as_deref().map(mask_key)));
    keys.insert("gemini".to_string(), json!(credentials.gemini.as_deref().map(mask_key)));
    keys.insert("chat".to_string(), json!(credentials.chat.as_deref().map(mask_key)));
    let selection = store.provider_selection();
    json!({
        "state": store.path().to_string_lossy(),
        "provider": selection.as_str(),
        "provider_id": selection.provider_id(),
        "keys": keys,
        "saved_images": store.saved_images().len(),
    })
}

fn mask_key(key: &str) -> String {
    let visible: String = key.chars().take(6).collect();
    if key.chars().count() <= 10 {
        return "****".to_string();
    }
    format!("{visible}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIXEL_PNG: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn generate_flags_map_onto_options() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "tryon",
            "generate",
            "--feature",
            "virtual-try-on",
            "--subject",
            "me.jpg",
            "--reference",
            "dress.png",
            "--angle",
            "3quarter",
            "--color",
            "ff0000",
            "--body-build",
            "athletic",
        ])?;
        let Command::Generate(args) = cli.command else {
            anyhow::bail!("expected generate");
        };
        let options = args.feature.options();
        assert_eq!(args.feature.feature, FeatureKind::VirtualTryOn);
        assert_eq!(options.angle, CameraAngle::ThreeQuarter);
        assert_eq!(options.color_override.map(|c| c.to_string()), Some("#FF0000".to_string()));
        assert_eq!(options.body_build.as_deref(), Some("athletic"));
        assert!(!args.no_letterbox);
        assert_eq!(args.out, PathBuf::from("tryon-out"));
        Ok(())
    }

    #[test]
    fn bad_colours_are_rejected_by_the_parser() {
        let parsed = Cli::try_parse_from([
            "tryon", "prompt", "--feature", "hair", "--color", "#12",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn keys_are_masked() {
        assert_eq!(mask_key("short"), "****");
        assert_eq!(mask_key("sk-or-v1-abcdefgh"), "sk-or-…");
    }

    #[tokio::test]
    async fn settings_round_trip_through_the_session_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = dir.path().join("session.json");
        run_settings(
            SettingsCommand::SetKey {
                slot: KeySlot::Gemini,
                key: "  AIza-test-key-123  ".to_string(),
            },
            &state,
        )
        .await?;
        run_settings(
            SettingsCommand::SetProvider {
                selection: ProviderSelection::Direct,
            },
            &state,
        )
        .await?;

        let store = SessionStore::load(&state)?;
        assert_eq!(store.credentials().gemini.as_deref(), Some("AIza-test-key-123"));
        assert_eq!(store.provider_selection().provider_id(), "gemini");
        let summary = settings_summary(&store);
        assert_eq!(summary["keys"]["gemini"], json!("AIza-t…"));
        assert_eq!(summary["keys"]["openrouter"], Value::Null);

        run_settings(SettingsCommand::ClearKey { slot: KeySlot::Gemini }, &state).await?;
        assert_eq!(SessionStore::load(&state)?.credentials().gemini, None);
        Ok(())
    }

    #[tokio::test]
    async fn dryrun_generation_writes_artifact_receipt_and_events() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = dir.path().join("session.json");
        let out = dir.path().join("out");
        let (state_arg, out_arg) = (state.to_string_lossy().to_string(), out.to_string_lossy().to_string());
        let cli = Cli::try_parse_from([
            "tryon",
            "--state",
            state_arg.as_str(),
            "generate",
            "--feature",
            "background",
            "--background",
            "a quiet library",
            "--subject",
            PIXEL_PNG,
            "--provider",
            "dryrun",
            "--out",
            out_arg.as_str(),
        ])?;
        assert_eq!(run(cli).await?, 0);

        let mut names: Vec<String> = fs::read_dir(&out)?
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
            .collect::<Result<_, _>>()?;
        names.sort();
        assert_eq!(names.len(), 3, "{names:?}");
        assert!(names.iter().any(|name| name.starts_with("background-") && name.ends_with(".jpeg")));
        assert!(names.iter().any(|name| name.starts_with("receipt-background-")));
        assert!(names.contains(&"events.jsonl".to_string()));

        let saved = SessionStore::load(&state)?.saved_images();
        assert_eq!(saved.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_reference_fails_without_artifacts() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let state = dir.path().join("session.json");
        let out = dir.path().join("out");
        let (state_arg, out_arg) = (state.to_string_lossy().to_string(), out.to_string_lossy().to_string());
        let cli = Cli::try_parse_from([
            "tryon",
            "--state",
            state_arg.as_str(),
            "generate",
            "--feature",
            "virtual-try-on",
            "--subject",
            PIXEL_PNG,
            "--provider",
            "dryrun",
            "--out",
            out_arg.as_str(),
        ])?;
        assert_eq!(run(cli).await?, 1);
        assert!(SessionStore::load(&state)?.saved_images().is_empty());
        Ok(())
    }
}
