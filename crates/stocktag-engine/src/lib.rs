use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use stocktag_contracts::events::{BatchLog, EventPayload};
use stocktag_contracts::models::ProviderKind;
use stocktag_contracts::record::{normalize_record, MetadataRecord, TokenInfo};
use stocktag_contracts::stats::BatchStats;

/// Longest side of the derived upload copy.
const UPLOAD_MAX_DIMENSION: u32 = 300;
const UPLOAD_JPEG_QUALITY: u8 = 80;
/// Titles shorter than this draw a warning; length is nudged via the
/// prompt, never clamped after the fact.
const SHORT_TITLE_WARN_CHARS: usize = 40;
const MAX_COMPLETION_TOKENS: u64 = 1024;

const ACCEPTED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Clone)]
pub struct GenerateRequest<'a> {
    pub image_path: &'a Path,
    pub api_key: &'a str,
    pub model: &'a str,
    pub max_title_chars: usize,
    pub max_tags: usize,
}

/// Raw provider output before normalization: the structured record recovered
/// from the response text, plus token usage when the provider reported it.
#[derive(Debug, Clone)]
pub struct RawGeneration {
    pub record: Value,
    pub token_info: Option<TokenInfo>,
}

pub trait MetadataProvider {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerateRequest) -> Result<RawGeneration>;
}

pub fn provider_for(kind: ProviderKind) -> Box<dyn MetadataProvider> {
    match kind {
        ProviderKind::Gpt => Box::new(OpenAiProvider::new()),
        ProviderKind::Gemini => Box::new(GeminiProvider::new()),
    }
}

pub struct OpenAiProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("OPENAI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            http: HttpClient::new(),
        }
    }
}

impl Default for OpenAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn openai_instruction(max_title_chars: usize, max_tags: usize) -> String {
    format!(
        "You are a stock photography metadata writer. Look at the image and \
         respond with a single JSON object of the form \
         {{\"title\": string, \"tags\": array of strings}}. \
         The tags array must contain exactly {max_tags} tags: lowercase, \
         single words or short phrases, ordered from most to least relevant. \
         The title must be a descriptive sentence of exactly \
         {max_title_chars} characters, with no quotes and no trailing \
         period. Respond with the JSON object only, no commentary."
    )
}

fn gemini_instruction(max_title_chars: usize, max_tags: usize) -> String {
    let floor = max_title_chars.min(150);
    format!(
        "Describe this stock photo for a photo agency. Reply with one JSON \
         object: {{\"title\": string, \"tags\": array of strings}}. \
         Provide exactly {max_tags} lowercase tags ordered by relevance. \
         The title should be a natural descriptive sentence between {floor} \
         and {max_title_chars} characters. Output only the JSON object."
    )
}

impl MetadataProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "OpenAI"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<RawGeneration> {
        let (encoded, mime) = prepare_image_inline(request.image_path)?;
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": request.model,
            "max_tokens": MAX_COMPLETION_TOKENS,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:{mime};base64,{encoded}") },
                    },
                    {
                        "type": "text",
                        "text": openai_instruction(request.max_title_chars, request.max_tags),
                    },
                ],
            }],
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(request.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        let parsed = response_json_or_error("OpenAI", response)?;

        let text = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("OpenAI response missing message content"))?;

        let record = extract_record_text(text).context("OpenAI response")?;
        Ok(RawGeneration {
            record,
            token_info: parse_openai_usage(&parsed),
        })
    }
}

pub struct GeminiProvider {
    api_base: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataProvider for GeminiProvider {
    fn name(&self) -> &str {
        "Gemini"
    }

    fn generate(&self, request: &GenerateRequest) -> Result<RawGeneration> {
        let (encoded, mime) = prepare_image_inline(request.image_path)?;
        let endpoint = self.endpoint_for_model(request.model);
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": mime, "data": encoded } },
                    { "text": gemini_instruction(request.max_title_chars, request.max_tags) },
                ],
            }],
            "generationConfig": { "maxOutputTokens": MAX_COMPLETION_TOKENS },
        });

        let response = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", request.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        let parsed = response_json_or_error("Gemini", response)?;

        let mut text = String::new();
        if let Some(parts) = parsed
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                    text.push_str(chunk);
                }
            }
        }
        if text.is_empty() {
            bail!("Gemini response missing candidate text");
        }

        let record = extract_record_text(&text).context("Gemini response")?;
        Ok(RawGeneration {
            record,
            token_info: parse_gemini_usage(&parsed),
        })
    }
}

fn parse_openai_usage(payload: &Value) -> Option<TokenInfo> {
    let usage = payload.get("usage")?.as_object()?;
    let info = TokenInfo {
        prompt: usage.get("prompt_tokens").and_then(Value::as_u64),
        completion: usage.get("completion_tokens").and_then(Value::as_u64),
        total: usage.get("total_tokens").and_then(Value::as_u64),
    };
    if info.prompt.is_none() && info.completion.is_none() && info.total.is_none() {
        return None;
    }
    Some(info)
}

fn parse_gemini_usage(payload: &Value) -> Option<TokenInfo> {
    let usage = payload.get("usageMetadata")?.as_object()?;
    let info = TokenInfo {
        prompt: usage.get("promptTokenCount").and_then(Value::as_u64),
        completion: None,
        total: usage.get("totalTokenCount").and_then(Value::as_u64),
    };
    if info.prompt.is_none() && info.total.is_none() {
        return None;
    }
    Some(info)
}

/// Recovers a structured record from free-form response text. Layers are
/// attempted in order, first success wins: a fenced ```json block, the first
/// top-level brace region, then the whole text as JSON.
pub fn extract_record_text(text: &str) -> Result<Value> {
    if let Some(block) = fenced_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }
    if let Some(region) = first_brace_region(text) {
        if let Ok(value) = serde_json::from_str::<Value>(region) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Ok(value);
        }
    }
    bail!("could not parse provider response")
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let body = &text[start + "```json".len()..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn first_brace_region(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Produces a small JPEG copy of the image for cheap transmission. On any
/// failure the original path is returned unchanged and a warning is printed;
/// preprocessing never fails the item.
pub fn compress_for_upload(path: &Path) -> PathBuf {
    match try_compress(path) {
        Ok(upload_path) => upload_path,
        Err(err) => {
            eprintln!(
                "warning: could not compress {} ({}); sending the original",
                path.display(),
                error_chain_text(&err, 256)
            );
            path.to_path_buf()
        }
    }
}

fn try_compress(path: &Path) -> Result<PathBuf> {
    let image = image::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let resized = if image.width().max(image.height()) > UPLOAD_MAX_DIMENSION {
        image.resize(UPLOAD_MAX_DIMENSION, UPLOAD_MAX_DIMENSION, FilterType::Triangle)
    } else {
        image
    };

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, UPLOAD_JPEG_QUALITY);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(resized.to_rgb8()))
        .context("jpeg encode failed")?;

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image");
    let upload_path = path.with_file_name(format!("{stem}-upload.jpg"));
    fs::write(&upload_path, bytes)
        .with_context(|| format!("failed to write {}", upload_path.display()))?;
    Ok(upload_path)
}

/// Reads a file and base64-encodes it for inline inclusion in a request
/// body. A read failure is fatal to the current item.
pub fn encode_image_base64(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}

fn prepare_image_inline(path: &Path) -> Result<(String, &'static str)> {
    let upload_path = compress_for_upload(path);
    let derived = upload_path != path;
    let encoded = encode_image_base64(&upload_path);
    if derived {
        let _ = fs::remove_file(&upload_path);
    }
    let mime = if derived {
        "image/jpeg"
    } else {
        mime_for_path(path).unwrap_or("image/jpeg")
    };
    Ok((encoded?, mime))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("png") => Some("image/png"),
        Some("webp") => Some("image/webp"),
        _ => None,
    }
}

pub trait MetadataEmbedder {
    fn embed(&self, src: &Path, dest: &Path, record: &MetadataRecord) -> Result<()>;
}

/// Writes Title/Description/Subject/Keywords into the destination copy by
/// shelling out to exiftool with `-overwrite_original`, so no backup sibling
/// file is produced. The binary name is overridable via `EXIFTOOL_BIN`.
pub struct ExifToolEmbedder {
    binary: String,
}

impl ExifToolEmbedder {
    pub fn new() -> Self {
        Self {
            binary: env::var("EXIFTOOL_BIN")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "exiftool".to_string()),
        }
    }
}

impl Default for ExifToolEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn exiftool_args(record: &MetadataRecord) -> Vec<String> {
    let mut args = vec![
        "-overwrite_original".to_string(),
        format!("-Title={}", record.title),
        format!("-Description={}", record.title),
    ];
    if !record.tags.is_empty() {
        args.push(format!("-Subject={}", record.tags.join(", ")));
    }
    for (idx, tag) in record.tags.iter().enumerate() {
        // The first assignment replaces whatever the source carried, the
        // rest append.
        if idx == 0 {
            args.push(format!("-Keywords={tag}"));
        } else {
            args.push(format!("-Keywords+={tag}"));
        }
    }
    args
}

impl MetadataEmbedder for ExifToolEmbedder {
    fn embed(&self, src: &Path, dest: &Path, record: &MetadataRecord) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(src, dest).with_context(|| {
            format!("failed copying {} to {}", src.display(), dest.display())
        })?;

        let output = Command::new(&self.binary)
            .args(exiftool_args(record))
            .arg(dest)
            .output()
            .with_context(|| format!("failed to launch {}", self.binary))?;
        if !output.status.success() {
            bail!(
                "{} failed ({}): {}",
                self.binary,
                output.status,
                truncate_text(String::from_utf8_lossy(&output.stderr).trim(), 512)
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub api_key: String,
    pub model: String,
    pub max_title_chars: usize,
    pub max_tags: usize,
    pub delay_seconds: f64,
    pub show_tokens: bool,
}

/// Runs one batch over the input directory: one image at a time, in
/// directory-listing order, a per-item failure never aborting the run.
pub fn run_batch(
    provider: &dyn MetadataProvider,
    embedder: &dyn MetadataEmbedder,
    log: &BatchLog,
    opts: &BatchOptions,
) -> Result<BatchStats> {
    run_batch_with(provider, embedder, log, opts, &mut thread::sleep)
}

pub fn run_batch_with(
    provider: &dyn MetadataProvider,
    embedder: &dyn MetadataEmbedder,
    log: &BatchLog,
    opts: &BatchOptions,
    sleep_fn: &mut dyn FnMut(Duration),
) -> Result<BatchStats> {
    let candidates = list_candidates(&opts.input_dir)?;
    let mut stats = BatchStats {
        total: candidates.len() as u64,
        ..BatchStats::default()
    };

    log_event(
        log,
        "batch_started",
        json!({
            "input_dir": opts.input_dir.to_string_lossy(),
            "output_dir": opts.output_dir.to_string_lossy(),
            "provider": provider.name(),
            "model": opts.model,
            "total": stats.total,
        }),
    );

    if candidates.is_empty() {
        println!(
            "No images found in {} (looking for {})",
            opts.input_dir.display(),
            ACCEPTED_EXTENSIONS.join(", ")
        );
        log_event(log, "batch_finished", json!({ "total": 0 }));
        return Ok(stats);
    }

    for (idx, path) in candidates.iter().enumerate() {
        if idx > 0 && opts.delay_seconds > 0.0 {
            sleep_fn(Duration::from_secs_f64(opts.delay_seconds));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        println!("[{}/{}] {}", idx + 1, stats.total, file_name);

        match process_item(provider, embedder, opts, path) {
            Ok(record) => {
                stats.record_success();
                println!("  title: {}", record.title);
                println!("  tags: {}", record.tags.len());
                if opts.show_tokens {
                    if let Some(info) = &record.token_info {
                        println!("  tokens: {}", format_token_info(info));
                    }
                }
                log_event(
                    log,
                    "item_succeeded",
                    json!({
                        "file": file_name,
                        "title_chars": record.title.chars().count(),
                        "tag_count": record.tags.len(),
                    }),
                );
            }
            Err(err) => {
                stats.record_failure();
                let cause = error_chain_text(&err, 512);
                eprintln!("  failed: {cause}");
                log_event(
                    log,
                    "item_failed",
                    json!({ "file": file_name, "error": cause }),
                );
            }
        }
    }

    log_event(
        log,
        "batch_finished",
        json!({
            "total": stats.total,
            "success": stats.success,
            "failed": stats.failed,
        }),
    );
    Ok(stats)
}

fn process_item(
    provider: &dyn MetadataProvider,
    embedder: &dyn MetadataEmbedder,
    opts: &BatchOptions,
    path: &Path,
) -> Result<MetadataRecord> {
    let generation = provider
        .generate(&GenerateRequest {
            image_path: path,
            api_key: &opts.api_key,
            model: &opts.model,
            max_title_chars: opts.max_title_chars,
            max_tags: opts.max_tags,
        })
        .with_context(|| format!("{} generation failed", provider.name()))?;

    let normalized = normalize_record(&generation.record, opts.max_tags);
    for note in &normalized.corrections {
        eprintln!("  corrected: {note}");
    }
    let mut record = normalized.record;
    record.token_info = generation.token_info;
    if record.title.chars().count() < SHORT_TITLE_WARN_CHARS {
        eprintln!(
            "  warning: title is only {} characters; the prompt targets {}",
            record.title.chars().count(),
            opts.max_title_chars
        );
    }

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("candidate {} has no file name", path.display()))?;
    let dest = opts.output_dir.join(file_name);
    embedder
        .embed(path, &dest, &record)
        .with_context(|| format!("embedding failed for {}", dest.display()))?;

    // Deleting the original is the only "processed" marker; it happens only
    // after the embedded copy exists.
    fs::remove_file(path)
        .with_context(|| format!("failed deleting original {}", path.display()))?;
    Ok(record)
}

/// Lists candidate image files in directory order; extension match only, no
/// content sniffing. An unreadable directory aborts the batch.
pub fn list_candidates(input_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(input_dir)
        .with_context(|| format!("failed reading directory {}", input_dir.display()))?;
    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed reading directory {}", input_dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .map(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if matches {
            candidates.push(path);
        }
    }
    Ok(candidates)
}

fn format_token_info(info: &TokenInfo) -> String {
    let mut parts = Vec::new();
    if let Some(prompt) = info.prompt {
        parts.push(format!("prompt {prompt}"));
    }
    if let Some(completion) = info.completion {
        parts.push(format!("completion {completion}"));
    }
    if let Some(total) = info.total {
        parts.push(format!("total {total}"));
    }
    parts.join(", ")
}

fn log_event(log: &BatchLog, event_type: &str, payload: Value) {
    let payload = payload.as_object().cloned().unwrap_or_else(EventPayload::new);
    if let Err(err) = log.emit(event_type, payload) {
        eprintln!("warning: batch log write failed: {err:#}");
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::fs;
    use std::time::Duration;

    use serde_json::{json, Value};
    use stocktag_contracts::events::BatchLog;
    use stocktag_contracts::record::MetadataRecord;

    use super::{
        compress_for_upload, exiftool_args, extract_record_text, first_brace_region,
        gemini_instruction, list_candidates, openai_instruction, parse_gemini_usage,
        parse_openai_usage, run_batch_with, BatchOptions, GenerateRequest, MetadataEmbedder,
        MetadataProvider, RawGeneration, UPLOAD_MAX_DIMENSION,
    };

    struct StubProvider {
        fail_on: HashSet<String>,
        calls: RefCell<Vec<String>>,
    }

    impl StubProvider {
        fn new(fail_on: &[&str]) -> Self {
            Self {
                fail_on: fail_on.iter().map(|name| name.to_string()).collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl MetadataProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn generate(&self, request: &GenerateRequest) -> anyhow::Result<RawGeneration> {
            let file_name = request
                .image_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string();
            self.calls.borrow_mut().push(file_name.clone());
            if self.fail_on.contains(&file_name) {
                anyhow::bail!("stub refuses {file_name}");
            }
            Ok(RawGeneration {
                record: json!({
                    "title": format!("A long descriptive stock title for {file_name} with plenty of detail"),
                    "tags": ["one", "two"],
                }),
                token_info: None,
            })
        }
    }

    struct CopyEmbedder;

    impl MetadataEmbedder for CopyEmbedder {
        fn embed(
            &self,
            src: &std::path::Path,
            dest: &std::path::Path,
            _record: &MetadataRecord,
        ) -> anyhow::Result<()> {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(src, dest)?;
            Ok(())
        }
    }

    fn options(input_dir: &std::path::Path, output_dir: &std::path::Path) -> BatchOptions {
        BatchOptions {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            api_key: "test-key".to_string(),
            model: "stub-model".to_string(),
            max_title_chars: 200,
            max_tags: 45,
            delay_seconds: 3.0,
            show_tokens: false,
        }
    }

    fn touch(path: &std::path::Path) {
        fs::write(path, b"not a real image").unwrap();
    }

    #[test]
    fn extraction_prefers_fenced_block_over_stray_braces() {
        let text = "Here {\"title\": \"decoy\"} first.\n```json\n{\"title\": \"real\", \"tags\": []}\n```";
        let value = extract_record_text(text).unwrap();
        assert_eq!(value["title"], json!("real"));
    }

    #[test]
    fn extraction_falls_back_to_brace_region() {
        let text = "Sure! Here is your metadata: {\"title\": \"t\", \"tags\": [\"a\"]} enjoy";
        let value = extract_record_text(text).unwrap();
        assert_eq!(value["tags"], json!(["a"]));
    }

    #[test]
    fn extraction_parses_bare_json() {
        let value = extract_record_text("  {\"title\": \"t\", \"tags\": []}  ").unwrap();
        assert_eq!(value["title"], json!("t"));
    }

    #[test]
    fn extraction_fails_on_garbage() {
        let err = extract_record_text("no structured data here").unwrap_err();
        assert!(err.to_string().contains("could not parse"));
    }

    #[test]
    fn unparseable_fenced_block_falls_through_to_brace_region() {
        let text = "```json\nnot json at all\n```\n{\"title\": \"recovered\", \"tags\": []}";
        let value = extract_record_text(text).unwrap();
        assert_eq!(value["title"], json!("recovered"));
    }

    #[test]
    fn brace_region_scanner_handles_nesting() {
        let text = "x {\"a\": {\"b\": 1}} y {\"c\": 2}";
        assert_eq!(first_brace_region(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn instructions_state_the_hard_constraints() {
        let openai = openai_instruction(180, 30);
        assert!(openai.contains("exactly 30 tags"));
        assert!(openai.contains("exactly 180 characters"));

        let gemini = gemini_instruction(200, 45);
        assert!(gemini.contains("exactly 45"));
        assert!(gemini.contains("between 150 and 200 characters"));

        // The soft floor never exceeds the configured ceiling.
        let small = gemini_instruction(120, 5);
        assert!(small.contains("between 120 and 120 characters"));
    }

    #[test]
    fn openai_usage_parses_all_three_counts() {
        let payload = json!({
            "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
        });
        let info = parse_openai_usage(&payload).unwrap();
        assert_eq!(info.prompt, Some(10));
        assert_eq!(info.completion, Some(20));
        assert_eq!(info.total, Some(30));
        assert!(parse_openai_usage(&json!({})).is_none());
    }

    #[test]
    fn gemini_usage_reports_prompt_and_total_only() {
        let payload = json!({
            "usageMetadata": { "promptTokenCount": 7, "totalTokenCount": 19 }
        });
        let info = parse_gemini_usage(&payload).unwrap();
        assert_eq!(info.prompt, Some(7));
        assert_eq!(info.completion, None);
        assert_eq!(info.total, Some(19));
    }

    #[test]
    fn compression_failure_returns_original_path() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("broken.jpg");
        touch(&path);
        assert_eq!(compress_for_upload(&path), path);
    }

    #[test]
    fn compression_caps_longest_side() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("big.png");
        image::RgbImage::new(900, 450).save(&path)?;

        let upload_path = compress_for_upload(&path);
        assert_ne!(upload_path, path);
        assert_eq!(upload_path.file_name().unwrap(), "big-upload.jpg");

        let resized = image::open(&upload_path)?;
        assert!(resized.width().max(resized.height()) <= UPLOAD_MAX_DIMENSION);
        Ok(())
    }

    #[test]
    fn exiftool_args_cover_all_fields_without_backup() {
        let record = MetadataRecord {
            title: "A title".to_string(),
            tags: vec!["cat".to_string(), "dog".to_string()],
            token_info: None,
        };
        let args = exiftool_args(&record);
        assert_eq!(args[0], "-overwrite_original");
        assert!(args.contains(&"-Title=A title".to_string()));
        assert!(args.contains(&"-Description=A title".to_string()));
        assert!(args.contains(&"-Subject=cat, dog".to_string()));
        assert!(args.contains(&"-Keywords=cat".to_string()));
        assert!(args.contains(&"-Keywords+=dog".to_string()));
    }

    #[test]
    fn candidate_listing_filters_extensions_case_insensitively() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        touch(&temp.path().join("a.JPG"));
        touch(&temp.path().join("b.jpeg"));
        touch(&temp.path().join("c.webp"));
        touch(&temp.path().join("notes.txt"));
        touch(&temp.path().join("d.gif"));
        fs::create_dir(temp.path().join("sub.jpg"))?;

        let names: Vec<String> = list_candidates(temp.path())?
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(!names.contains(&"notes.txt".to_string()));
        assert!(!names.contains(&"d.gif".to_string()));
        assert!(!names.contains(&"sub.jpg".to_string()));
        Ok(())
    }

    #[test]
    fn empty_directory_returns_zero_stats_and_no_calls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;

        let provider = StubProvider::new(&[]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let mut sleeps = Vec::new();
        let stats = run_batch_with(
            &provider,
            &CopyEmbedder,
            &log,
            &options(&input, &output),
            &mut |duration| sleeps.push(duration),
        )?;

        assert_eq!(stats.total, 0);
        assert_eq!(stats.success, 0);
        assert_eq!(stats.failed, 0);
        assert!(provider.calls.borrow().is_empty());
        assert!(sleeps.is_empty());
        Ok(())
    }

    #[test]
    fn one_failing_item_never_aborts_the_batch() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;
        // Listing order follows the filesystem; pick names so the failing
        // item sits in the middle regardless.
        touch(&input.join("a.jpg"));
        touch(&input.join("b.jpg"));
        touch(&input.join("c.jpg"));

        let provider = StubProvider::new(&["b.jpg"]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let stats = run_batch_with(
            &provider,
            &CopyEmbedder,
            &log,
            &options(&input, &output),
            &mut |_| {},
        )?;

        assert_eq!(stats.total, 3);
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(provider.calls.borrow().len(), 3);

        // Failed original stays put; successful originals are gone and
        // their embedded copies exist.
        assert!(input.join("b.jpg").exists());
        assert!(!input.join("a.jpg").exists());
        assert!(!input.join("c.jpg").exists());
        assert!(output.join("a.jpg").exists());
        assert!(output.join("c.jpg").exists());
        assert!(!output.join("b.jpg").exists());
        Ok(())
    }

    #[test]
    fn delay_runs_between_items_but_not_after_the_last() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;
        touch(&input.join("a.jpg"));
        touch(&input.join("b.jpg"));
        touch(&input.join("c.jpg"));

        let provider = StubProvider::new(&[]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let mut sleeps: Vec<Duration> = Vec::new();
        let stats = run_batch_with(
            &provider,
            &CopyEmbedder,
            &log,
            &options(&input, &output),
            &mut |duration| sleeps.push(duration),
        )?;

        assert_eq!(stats.total, 3);
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps.iter().all(|d| *d == Duration::from_secs(3)));
        Ok(())
    }

    #[test]
    fn zero_delay_never_sleeps() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;
        touch(&input.join("a.jpg"));
        touch(&input.join("b.jpg"));

        let provider = StubProvider::new(&[]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let mut opts = options(&input, &output);
        opts.delay_seconds = 0.0;
        let mut sleeps: Vec<Duration> = Vec::new();
        run_batch_with(&provider, &CopyEmbedder, &log, &opts, &mut |duration| {
            sleeps.push(duration)
        })?;
        assert!(sleeps.is_empty());
        Ok(())
    }

    #[test]
    fn embedder_failure_preserves_the_original() -> anyhow::Result<()> {
        struct FailingEmbedder;
        impl MetadataEmbedder for FailingEmbedder {
            fn embed(
                &self,
                _src: &std::path::Path,
                _dest: &std::path::Path,
                _record: &MetadataRecord,
            ) -> anyhow::Result<()> {
                anyhow::bail!("disk full")
            }
        }

        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;
        touch(&input.join("a.jpg"));

        let provider = StubProvider::new(&[]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let stats = run_batch_with(
            &provider,
            &FailingEmbedder,
            &log,
            &options(&input, &output),
            &mut |_| {},
        )?;

        assert_eq!(stats.failed, 1);
        assert!(input.join("a.jpg").exists());
        Ok(())
    }

    #[test]
    fn unreadable_input_directory_aborts_the_batch() {
        let temp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&[]);
        let log = BatchLog::new(temp.path().join("batch-log.jsonl"));
        let opts = options(&temp.path().join("missing"), &temp.path().join("out"));
        let err = run_batch_with(&provider, &CopyEmbedder, &log, &opts, &mut |_| {}).unwrap_err();
        assert!(err.to_string().contains("failed reading directory"));
    }

    #[test]
    fn batch_events_are_logged_per_item() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        fs::create_dir_all(&input)?;
        touch(&input.join("a.jpg"));
        touch(&input.join("b.jpg"));

        let provider = StubProvider::new(&["b.jpg"]);
        let log_path = temp.path().join("batch-log.jsonl");
        let log = BatchLog::new(&log_path);
        run_batch_with(
            &provider,
            &CopyEmbedder,
            &log,
            &options(&input, &output),
            &mut |_| {},
        )?;

        let raw = fs::read_to_string(&log_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("batch_started"));
        assert_eq!(types.last().map(String::as_str), Some("batch_finished"));
        assert!(types.contains(&"item_succeeded".to_string()));
        assert!(types.contains(&"item_failed".to_string()));
        Ok(())
    }
}
