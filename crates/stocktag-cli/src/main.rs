use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use stocktag_contracts::config::{AppConfig, DEFAULT_CONFIG_FILE};
use stocktag_contracts::events::BatchLog;
use stocktag_contracts::models::{ModelMenu, ProviderKind};
use stocktag_contracts::stats::BatchStats;
use stocktag_engine::{provider_for, run_batch, BatchOptions, ExifToolEmbedder};

#[derive(Debug, Parser)]
#[command(name = "stocktag", version, about = "Batch AI titling and tagging for stock photos")]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("stocktag error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let (mut config, warning) = AppConfig::load(&cli.config);
    if let Some(warning) = warning {
        eprintln!("warning: {warning}");
    }
    let menu = ModelMenu::new();

    println!("stocktag — batch AI metadata for stock photos");
    println!("Config: {}", cli.config.display());

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        println!();
        println!("1) Process images");
        println!("2) Settings");
        println!("3) Show configuration");
        println!("0) Quit");
        let Some(choice) = prompt(&stdin, &mut line, "> ")? else {
            break;
        };
        match choice.as_str() {
            "1" => process_images(&config),
            "2" => settings_menu(&stdin, &mut line, &mut config, &menu, &cli.config)?,
            "3" => show_config(&config),
            "0" | "q" => break,
            "" => {}
            other => println!("Unknown choice: {other}"),
        }
    }
    Ok(0)
}

fn prompt(stdin: &io::Stdin, line: &mut String, label: &str) -> Result<Option<String>> {
    print!("{label}");
    io::stdout().flush()?;
    line.clear();
    let read = match stdin.read_line(line) {
        Ok(read) => read,
        Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Some(String::new())),
        Err(err) => return Err(err.into()),
    };
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn process_images(config: &AppConfig) {
    let input_dir = PathBuf::from(config.input_dir.trim());
    if config.input_dir.trim().is_empty() || !input_dir.is_dir() {
        println!("Input directory is not set or does not exist; configure it under Settings.");
        return;
    }
    if config.output_dir.trim().is_empty() {
        println!("Output directory is not set; configure it under Settings.");
        return;
    }
    let output_dir = PathBuf::from(config.output_dir.trim());
    let Some(api_key) = config.active_api_key() else {
        println!(
            "No API key configured for {}; add one under Settings.",
            config.ai_model.label()
        );
        return;
    };

    let provider = provider_for(config.ai_model);
    let embedder = ExifToolEmbedder::new();
    let log = BatchLog::new(output_dir.join("batch-log.jsonl"));
    let opts = BatchOptions {
        input_dir,
        output_dir,
        api_key: api_key.to_string(),
        model: config.active_model().to_string(),
        max_title_chars: config.max_title_chars as usize,
        max_tags: config.max_tags as usize,
        delay_seconds: config.delay.max(0.0),
        show_tokens: config.show_tokens,
    };

    println!(
        "Processing with {} ({}), delay {}s",
        config.ai_model.label(),
        opts.model,
        opts.delay_seconds
    );
    match run_batch(provider.as_ref(), &embedder, &log, &opts) {
        Ok(stats) => print_summary(&stats),
        Err(err) => eprintln!("Batch aborted: {err:#}"),
    }
}

fn print_summary(stats: &BatchStats) {
    println!();
    println!(
        "Done: {} found, {} embedded, {} failed",
        stats.total, stats.success, stats.failed
    );
}

fn show_config(config: &AppConfig) {
    println!("Input directory:  {}", display_or_unset(&config.input_dir));
    println!("Output directory: {}", display_or_unset(&config.output_dir));
    println!("Provider:         {}", config.ai_model.label());
    println!("GPT model:        {}", config.gpt_model);
    println!("Gemini model:     {}", config.gemini_model);
    println!("OpenAI key:       {}", mask_key(&config.gpt_api_key));
    println!("Gemini key:       {}", mask_key(&config.gemini_api_key));
    println!("Max title chars:  {}", config.max_title_chars);
    println!("Max tags:         {}", config.max_tags);
    println!("Show token usage: {}", config.show_tokens);
    println!("Delay (seconds):  {}", config.delay);
}

fn display_or_unset(value: &str) -> &str {
    if value.trim().is_empty() {
        "(unset)"
    } else {
        value
    }
}

fn mask_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return "(unset)".to_string();
    }
    let tail: String = trimmed
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{tail}")
}

fn settings_menu(
    stdin: &io::Stdin,
    line: &mut String,
    config: &mut AppConfig,
    menu: &ModelMenu,
    config_path: &Path,
) -> Result<()> {
    loop {
        println!();
        println!("Settings");
        println!(" 1) Input directory   [{}]", display_or_unset(&config.input_dir));
        println!(" 2) Output directory  [{}]", display_or_unset(&config.output_dir));
        println!(" 3) Provider          [{}]", config.ai_model.label());
        println!(" 4) Model             [{}]", config.active_model());
        println!(" 5) OpenAI API key    [{}]", mask_key(&config.gpt_api_key));
        println!(" 6) Gemini API key    [{}]", mask_key(&config.gemini_api_key));
        println!(" 7) Max title chars   [{}]", config.max_title_chars);
        println!(" 8) Max tags          [{}]", config.max_tags);
        println!(" 9) Show token usage  [{}]", config.show_tokens);
        println!("10) Inter-item delay  [{}s]", config.delay);
        println!(" 0) Back");
        let Some(choice) = prompt(stdin, line, "settings> ")? else {
            return Ok(());
        };

        let changed = match choice.as_str() {
            "1" => set_input_dir(stdin, line, config)?,
            "2" => set_output_dir(stdin, line, config)?,
            "3" => set_provider(stdin, line, config, menu)?,
            "4" => set_model(stdin, line, config, menu)?,
            "5" => set_key(stdin, line, "OpenAI API key", &mut config.gpt_api_key)?,
            "6" => set_key(stdin, line, "Gemini API key", &mut config.gemini_api_key)?,
            "7" => set_positive(stdin, line, "Max title chars", &mut config.max_title_chars)?,
            "8" => set_positive(stdin, line, "Max tags", &mut config.max_tags)?,
            "9" => {
                config.show_tokens = !config.show_tokens;
                println!("Show token usage: {}", config.show_tokens);
                true
            }
            "10" => set_delay(stdin, line, config)?,
            "0" | "" => return Ok(()),
            other => {
                println!("Unknown choice: {other}");
                false
            }
        };
        if changed {
            save_config(config, config_path);
        }
    }
}

fn save_config(config: &AppConfig, path: &Path) {
    if let Err(err) = config.save(path) {
        eprintln!("warning: could not save {} ({err:#})", path.display());
    }
}

fn set_input_dir(stdin: &io::Stdin, line: &mut String, config: &mut AppConfig) -> Result<bool> {
    loop {
        let Some(value) = prompt(stdin, line, "Input directory (empty to cancel): ")? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        if Path::new(&value).is_dir() {
            config.input_dir = value;
            return Ok(true);
        }
        println!("Not a directory: {value}");
    }
}

fn set_output_dir(stdin: &io::Stdin, line: &mut String, config: &mut AppConfig) -> Result<bool> {
    loop {
        let Some(value) = prompt(stdin, line, "Output directory (empty to cancel): ")? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        match std::fs::create_dir_all(&value) {
            Ok(()) => {
                config.output_dir = value;
                return Ok(true);
            }
            Err(err) => println!("Cannot use {value}: {err}"),
        }
    }
}

fn set_provider(
    stdin: &io::Stdin,
    line: &mut String,
    config: &mut AppConfig,
    menu: &ModelMenu,
) -> Result<bool> {
    loop {
        let Some(value) = prompt(stdin, line, "Provider (gpt/gemini, empty to cancel): ")? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        if let Some(kind) = ProviderKind::parse(&value) {
            config.ai_model = kind;
            // Keep the active model inside the new provider's menu.
            let current = config.active_model().to_string();
            if !menu.contains(kind, &current) {
                let fallback = menu.default_model(kind).to_string();
                match kind {
                    ProviderKind::Gpt => config.gpt_model = fallback,
                    ProviderKind::Gemini => config.gemini_model = fallback,
                }
            }
            println!("Provider set to {}", kind.label());
            return Ok(true);
        }
        println!("Unknown provider: {value}");
    }
}

fn set_model(
    stdin: &io::Stdin,
    line: &mut String,
    config: &mut AppConfig,
    menu: &ModelMenu,
) -> Result<bool> {
    let kind = config.ai_model;
    let options = menu.options(kind);
    println!("Models for {}:", kind.label());
    for (idx, name) in options.iter().enumerate() {
        println!("  {}) {}", idx + 1, name);
    }
    loop {
        let Some(value) = prompt(stdin, line, "Model (number or name, empty to cancel): ")? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        let selected = value
            .parse::<usize>()
            .ok()
            .and_then(|number| number.checked_sub(1))
            .and_then(|idx| options.get(idx).cloned())
            .or_else(|| {
                if menu.contains(kind, &value) {
                    Some(value.clone())
                } else {
                    None
                }
            });
        match selected {
            Some(model) => {
                match kind {
                    ProviderKind::Gpt => config.gpt_model = model.clone(),
                    ProviderKind::Gemini => config.gemini_model = model.clone(),
                }
                println!("Model set to {model}");
                return Ok(true);
            }
            None => println!("Not in the menu: {value}"),
        }
    }
}

fn set_key(
    stdin: &io::Stdin,
    line: &mut String,
    label: &str,
    slot: &mut String,
) -> Result<bool> {
    let Some(value) = prompt(stdin, line, &format!("{label} (empty to cancel): "))? else {
        return Ok(false);
    };
    if value.is_empty() {
        return Ok(false);
    }
    *slot = value;
    println!("{label} updated");
    Ok(true)
}

fn set_positive(
    stdin: &io::Stdin,
    line: &mut String,
    label: &str,
    slot: &mut u32,
) -> Result<bool> {
    loop {
        let Some(value) = prompt(stdin, line, &format!("{label} (empty to cancel): "))? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        match value.parse::<u32>() {
            Ok(number) if number >= 1 => {
                *slot = number;
                println!("{label} set to {number}");
                return Ok(true);
            }
            _ => println!("Enter a positive whole number"),
        }
    }
}

fn set_delay(stdin: &io::Stdin, line: &mut String, config: &mut AppConfig) -> Result<bool> {
    loop {
        let Some(value) = prompt(stdin, line, "Delay in seconds (empty to cancel): ")? else {
            return Ok(false);
        };
        if value.is_empty() {
            return Ok(false);
        }
        match value.parse::<f64>() {
            Ok(number) if number >= 0.0 && number.is_finite() => {
                config.delay = number;
                println!("Delay set to {number}s");
                return Ok(true);
            }
            _ => println!("Enter a non-negative number"),
        }
    }
}
