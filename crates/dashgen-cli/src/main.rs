use std::env;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use dashgen_contracts::events::{EventPayload, EventWriter};
use dashgen_contracts::models::{ModelRegistry, ModelSpec};
use dashgen_contracts::requests::{
    EditFunction, ImageEditRequest, TextToImageRequest, DEFAULT_EDIT_MODEL, DEFAULT_IMAGE_SIZE,
    DEFAULT_TEXT_TO_IMAGE_MODEL,
};
use dashgen_contracts::settings::Settings;
use dashgen_contracts::tasks::{
    TaskHistory, TaskKind, TaskRecord, TaskState, TaskStatusReport, TaskSubmission,
};
use dashgen_engine::{DashError, DashScopeClient};

#[derive(Debug, Parser)]
#[command(name = "dashgen", version, about = "DashScope image tasks from the terminal")]
struct Cli {
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Edit(EditArgs),
    Status(StatusArgs),
    Models(ModelsArgs),
    Functions,
    History(HistoryArgs),
    Key(KeyArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    size: Option<String>,
    #[arg(long)]
    n: Option<u64>,
    #[arg(long)]
    seed: Option<i64>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    image_url: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "stylization_all")]
    function: String,
    #[arg(long)]
    mask_url: Option<String>,
    #[arg(long)]
    n: Option<u64>,
    #[arg(long)]
    top_scale: Option<f64>,
    #[arg(long)]
    bottom_scale: Option<f64>,
    #[arg(long)]
    left_scale: Option<f64>,
    #[arg(long)]
    right_scale: Option<f64>,
    #[arg(long)]
    upscale_factor: Option<u64>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    wait: bool,
    #[arg(long, default_value_t = 5.0)]
    poll_interval: f64,
    #[arg(long, default_value_t = 300.0)]
    poll_timeout: f64,
}

#[derive(Debug, Parser)]
struct ModelsArgs {
    #[arg(long)]
    edit: bool,
    #[arg(long)]
    capability: Option<String>,
    #[arg(long)]
    recommended: bool,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[command(subcommand)]
    action: Option<HistoryAction>,
}

#[derive(Debug, Subcommand)]
enum HistoryAction {
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    Show {
        #[arg(long)]
        task_id: String,
    },
    Remove {
        #[arg(long)]
        task_id: String,
    },
    Clear,
}

#[derive(Debug, Parser)]
struct KeyArgs {
    #[command(subcommand)]
    action: KeyAction,
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Set { value: String },
    Show,
    Clear,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("dashgen error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut state = AppState::open(cli.state_dir.clone());
    match cli.command {
        Command::Generate(args) => run_generate(&mut state, cli.api_key.as_deref(), args),
        Command::Edit(args) => run_edit(&mut state, cli.api_key.as_deref(), args),
        Command::Status(args) => run_status(&mut state, cli.api_key.as_deref(), args),
        Command::Models(args) => run_models(args),
        Command::Functions => run_functions(),
        Command::History(args) => run_history(&mut state, args),
        Command::Key(args) => run_key(&mut state, args),
    }
}

struct AppState {
    dir: PathBuf,
    settings: Settings,
    history: TaskHistory,
    events: EventWriter,
}

impl AppState {
    fn open(dir_override: Option<PathBuf>) -> Self {
        let dir = resolve_state_dir(dir_override);
        Self {
            settings: Settings::load(dir.join("settings.json")),
            history: TaskHistory::load(dir.join("history.json")),
            events: EventWriter::new(dir.join("events.jsonl")),
            dir,
        }
    }

    fn client(&self, api_key_flag: Option<&str>) -> DashScopeClient {
        let key = api_key_flag
            .map(str::to_string)
            .or_else(|| self.settings.api_key().map(str::to_string));
        DashScopeClient::new(key)
    }
}

fn resolve_state_dir(dir_override: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = dir_override {
        return dir;
    }
    if let Some(dir) = non_empty_env("DASHGEN_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = non_empty_env("HOME") {
        return PathBuf::from(home).join(".dashgen");
    }
    PathBuf::from(".dashgen")
}

fn run_generate(state: &mut AppState, api_key: Option<&str>, args: GenerateArgs) -> Result<i32> {
    let request = TextToImageRequest {
        prompt: args.prompt,
        size: args.size,
        n: args.n,
        seed: args.seed,
        model: args.model,
    };
    let client = state.client(api_key);
    let submission = client.submit_text_to_image(&request, None)?;

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_TEXT_TO_IMAGE_MODEL.to_string());
    let mut record = TaskRecord::new(
        TaskKind::TextToImage,
        &submission.task_id,
        &request.prompt,
        &model,
        &submission.task_status,
    );
    record.size = Some(
        request
            .size
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string()),
    );
    record.count = request.n.unwrap_or(1);
    state.history.add(record)?;
    state.settings.set_last_prompt(&request.prompt)?;
    state.events.emit(
        "task_submitted",
        event_payload(json!({
            "task_id": submission.task_id,
            "kind": TaskKind::TextToImage.as_str(),
            "model": model,
        })),
    )?;

    print_submission(&submission);
    Ok(0)
}

fn run_edit(state: &mut AppState, api_key: Option<&str>, args: EditArgs) -> Result<i32> {
    let function: EditFunction = args
        .function
        .parse()
        .map_err(|message: String| anyhow::anyhow!(message))?;
    let request = ImageEditRequest {
        image_url: args.image_url,
        prompt: args.prompt,
        function,
        mask_url: args.mask_url,
        n: args.n,
        top_scale: args.top_scale,
        bottom_scale: args.bottom_scale,
        left_scale: args.left_scale,
        right_scale: args.right_scale,
        upscale_factor: args.upscale_factor,
        model: args.model,
    };
    let client = state.client(api_key);
    let submission = client.submit_edit(&request, None)?;

    let model = request
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_EDIT_MODEL.to_string());
    let mut record = TaskRecord::new(
        TaskKind::ImageEdit,
        &submission.task_id,
        &request.prompt,
        &model,
        &submission.task_status,
    );
    record.function = Some(function.as_str().to_string());
    record.count = request.n.unwrap_or(1);
    state.history.add(record)?;
    state.settings.set_last_prompt(&request.prompt)?;
    state.events.emit(
        "task_submitted",
        event_payload(json!({
            "task_id": submission.task_id,
            "kind": TaskKind::ImageEdit.as_str(),
            "function": function.as_str(),
            "model": model,
        })),
    )?;

    print_submission(&submission);
    Ok(0)
}

fn run_status(state: &mut AppState, api_key: Option<&str>, args: StatusArgs) -> Result<i32> {
    let client = state.client(api_key);

    if !args.wait {
        let report = poll_once(state, &client, &args.task_id)?;
        print_report(&args.task_id, &report);
        return Ok(0);
    }

    let interval = args.poll_interval.clamp(1.0, 60.0);
    let timeout = args.poll_timeout.clamp(5.0, 1800.0);
    let started = Instant::now();
    loop {
        let report = poll_once(state, &client, &args.task_id)?;
        print_report(&args.task_id, &report);
        match report.state {
            TaskState::Completed => return Ok(0),
            TaskState::Failed => {
                return Err(DashError::TaskFailed {
                    task_id: args.task_id.clone(),
                }
                .into())
            }
            TaskState::Pending => {}
        }
        if started.elapsed().as_secs_f64() >= timeout {
            bail!(
                "timed out waiting for task {} after {:.0}s",
                args.task_id,
                timeout
            );
        }
        thread::sleep(Duration::from_secs_f64(interval));
    }
}

/// One poll, folded back into the history entry the way the original UI
/// updates its task list after every status query.
fn poll_once(
    state: &mut AppState,
    client: &DashScopeClient,
    task_id: &str,
) -> Result<TaskStatusReport> {
    let report = client.task_status(task_id, None)?;
    let polled_at = now_utc_iso();
    state.history.update(task_id, |entry| {
        entry.status = report.state.as_str().to_string();
        entry.result = Some(report.message.clone());
        if !report.images.is_empty() {
            entry.images = report.images.clone();
        }
        entry.last_polled_at = Some(polled_at);
    })?;
    state.events.emit(
        "status_checked",
        event_payload(json!({
            "task_id": task_id,
            "state": report.state.as_str(),
        })),
    )?;
    Ok(report)
}

fn run_models(args: ModelsArgs) -> Result<i32> {
    let registry = if args.edit {
        ModelRegistry::image_edit()
    } else {
        ModelRegistry::text_to_image()
    };
    let mut models: Vec<ModelSpec> = match args.capability.as_deref() {
        Some(capability) => registry.by_capability(capability),
        None => registry.list().cloned().collect(),
    };
    if args.recommended {
        models.retain(|model| model.recommended);
    }
    if models.is_empty() {
        println!("No models match.");
        return Ok(0);
    }
    for model in models {
        let mut heading = model.name.clone();
        if let Some(version) = &model.version {
            match &model.tier {
                Some(tier) => heading.push_str(&format!(" (v{version}, {tier})")),
                None => heading.push_str(&format!(" (v{version})")),
            }
        }
        if model.recommended {
            heading.push_str(" [recommended]");
        }
        println!("{heading}");
        println!("    {}", model.description);
        if args.edit {
            println!("    functions: {}", model.capabilities.join(", "));
        }
    }
    Ok(0)
}

fn run_functions() -> Result<i32> {
    for function in EditFunction::ALL {
        println!("{} ({})", function.as_str(), function.label());
        println!("    {}", function.description());
        let mut notes = Vec::new();
        if function.needs_mask() {
            notes.push("requires --mask-url");
        }
        if function.needs_expand() {
            notes.push("accepts --top-scale/--bottom-scale/--left-scale/--right-scale");
        }
        if function.needs_upscale() {
            notes.push("accepts --upscale-factor");
        }
        if !notes.is_empty() {
            println!("    {}", notes.join("; "));
        }
    }
    Ok(0)
}

fn run_history(state: &mut AppState, args: HistoryArgs) -> Result<i32> {
    match args.action.unwrap_or(HistoryAction::List { limit: None }) {
        HistoryAction::List { limit } => {
            let entries = state.history.recent(limit.unwrap_or(10));
            if entries.is_empty() {
                println!("No tasks recorded yet.");
                return Ok(0);
            }
            for entry in entries {
                println!(
                    "{}  [{}] {}  {}",
                    entry.task_id,
                    entry.status,
                    entry.kind,
                    truncate_text(&entry.prompt, 60)
                );
                let mut detail = format!("    submitted {}", format_relative_time(&entry.created_at));
                if let Some(polled) = &entry.last_polled_at {
                    detail.push_str(&format!(", last checked {}", format_relative_time(polled)));
                }
                println!("{detail}");
            }
            Ok(0)
        }
        HistoryAction::Show { task_id } => {
            let Some(entry) = state.history.get(&task_id) else {
                bail!("no history entry for task {task_id}");
            };
            println!("task id:   {}", entry.task_id);
            println!("kind:      {}", entry.kind);
            println!("status:    {}", entry.status);
            println!("model:     {}", entry.model);
            if let Some(function) = &entry.function {
                println!("function:  {function}");
            }
            if let Some(size) = &entry.size {
                println!("size:      {size}");
            }
            println!("count:     {}", entry.count);
            println!("prompt:    {}", entry.prompt);
            println!("submitted: {}", entry.created_at);
            if let Some(polled) = &entry.last_polled_at {
                println!("last poll: {polled}");
            }
            if let Some(result) = &entry.result {
                println!("result:    {result}");
            }
            for url in &entry.images {
                println!("image:     {url}");
            }
            Ok(0)
        }
        HistoryAction::Remove { task_id } => {
            if !state.history.remove(&task_id)? {
                bail!("no history entry for task {task_id}");
            }
            state.events.emit(
                "task_removed",
                event_payload(json!({ "task_id": task_id })),
            )?;
            println!("Removed task {task_id} from history.");
            Ok(0)
        }
        HistoryAction::Clear => {
            state.history.clear()?;
            state
                .events
                .emit("history_cleared", EventPayload::new())?;
            println!("History cleared.");
            Ok(0)
        }
    }
}

fn run_key(state: &mut AppState, args: KeyArgs) -> Result<i32> {
    match args.action {
        KeyAction::Set { value } => {
            state.settings.set_api_key(value)?;
            println!(
                "API key saved to {}",
                state.dir.join("settings.json").display()
            );
            Ok(0)
        }
        KeyAction::Show => {
            match state.settings.api_key() {
                Some(key) => println!("{}", mask_key(key)),
                None => println!("No API key stored."),
            }
            Ok(0)
        }
        KeyAction::Clear => {
            state.settings.clear_api_key()?;
            println!("Stored API key cleared.");
            Ok(0)
        }
    }
}

fn print_submission(submission: &TaskSubmission) {
    println!("Task submitted: {}", submission.task_id);
    println!("Initial status: {}", submission.task_status);
    if !submission.request_id.is_empty() {
        println!("Request id:     {}", submission.request_id);
    }
    println!(
        "Results are usually ready in ~15s; check with `dashgen status --task-id {}`",
        submission.task_id
    );
}

fn print_report(task_id: &str, report: &TaskStatusReport) {
    println!("Task {task_id}: {}", report.state);
    println!("  {}", report.message);
    for url in &report.images {
        println!("  {url}");
    }
}

fn event_payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "********".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn format_relative_time(timestamp: &str) -> String {
    let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) else {
        return timestamp.to_string();
    };
    let elapsed = Utc::now().signed_duration_since(parsed.with_timezone(&Utc));
    let seconds = elapsed.num_seconds();
    if seconds < 60 {
        return "just now".to_string();
    }
    if seconds < 3_600 {
        return format!("{}m ago", seconds / 60);
    }
    if seconds < 86_400 {
        return format!("{}h ago", seconds / 3_600);
    }
    parsed.format("%Y-%m-%d").to_string()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
