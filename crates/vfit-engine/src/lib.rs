use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use vfit_contracts::assets::{extension_for_mime, ImageAsset};
use vfit_contracts::events::{EventLog, EventPayload};
use vfit_contracts::session::SessionState;
use vfit_contracts::styles::{FitStyle, ScenePreset, ScenePresetRegistry};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const REAUTH_USER_MESSAGE: &str =
    "Please select a valid API key with appropriate permissions.";

const RATE_LIMIT_MAX_ATTEMPTS: usize = 3;
const RATE_LIMIT_DEFAULT_WAIT_S: u64 = 30;
const TRANSPORT_RETRY_MAX: usize = 2;
const TRANSPORT_RETRY_BACKOFF_S: f64 = 1.2;
const REQUEST_TIMEOUT_S: u64 = 90;

/// Sentinel failure: the API credential is invalid or lacks the scope
/// for image generation. Detected through the anyhow chain rather than
/// by comparing user-facing text.
#[derive(Debug, Clone, Copy)]
pub struct ReauthRequired;

impl fmt::Display for ReauthRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("re-authentication required")
    }
}

impl std::error::Error for ReauthRequired {}

pub fn is_reauth_required(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<ReauthRequired>().is_some())
}

#[derive(Debug, Clone)]
pub struct FittingRequest {
    pub subject: ImageAsset,
    pub garment: ImageAsset,
    pub fit_style: FitStyle,
    pub preset: Option<ScenePreset>,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image_path: PathBuf,
    pub mime_type: String,
}

/// One fitting call against a generation backend. The countdown
/// callback is advisory: a provider that decides to wait out a rate
/// limit reports the whole-second wait before sleeping, and the caller
/// surfaces it however it likes.
pub trait FittingProvider {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &FittingRequest,
        countdown: &mut dyn FnMut(u64),
    ) -> Result<GeneratedImage>;
}

/// Environment-provided action that lets the user pick or fix an API
/// credential after a re-authentication abort.
pub trait CredentialPrompt {
    fn open_key_selection(&self) -> Result<()>;
}

/// Console stand-in for a host key picker: tells the user which
/// environment variables to set.
pub struct EnvCredentialPrompt;

impl CredentialPrompt for EnvCredentialPrompt {
    fn open_key_selection(&self) -> Result<()> {
        eprintln!(
            "Set GEMINI_API_KEY (or GOOGLE_API_KEY) to a key that allows image generation, then start a new run."
        );
        Ok(())
    }
}

pub struct GeminiProvider {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self::with_model(DEFAULT_GEMINI_MODEL)
    }

    pub fn with_model(model: &str) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: model.trim().to_string(),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn build_parts(request: &FittingRequest) -> Vec<Value> {
        vec![
            inline_image_part(&request.subject),
            inline_image_part(&request.garment),
            json!({ "text": compose_instruction(request.fit_style, request.preset.as_ref()) }),
        ]
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        for attempt in 0..=TRANSPORT_RETRY_MAX {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= TRANSPORT_RETRY_MAX {
                        return Err(err);
                    }
                    let delay_s = TRANSPORT_RETRY_BACKOFF_S * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        unreachable!("transport retry loop always returns a response or error")
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FittingProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        request: &FittingRequest,
        countdown: &mut dyn FnMut(u64),
    ) -> Result<GeneratedImage> {
        let Some(api_key) = Self::api_key() else {
            return Err(anyhow::Error::new(ReauthRequired)
                .context("GEMINI_API_KEY or GOOGLE_API_KEY not set"));
        };
        let endpoint = self.endpoint();
        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": Self::build_parts(request),
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        });

        for attempt in 0..RATE_LIMIT_MAX_ATTEMPTS {
            let response = self.post_with_transport_retries(&endpoint, &api_key, &payload)?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .context("Gemini response body read failed")?;

            if status == 401 || status == 403 || body_signals_reauth(&body) {
                return Err(anyhow::Error::new(ReauthRequired).context(format!(
                    "Gemini rejected the credential ({status}): {}",
                    truncate_text(&body, 256)
                )));
            }

            if status == 429 || body.contains("RESOURCE_EXHAUSTED") {
                if attempt + 1 >= RATE_LIMIT_MAX_ATTEMPTS {
                    bail!(
                        "Gemini rate limit persisted after {RATE_LIMIT_MAX_ATTEMPTS} attempts: {}",
                        truncate_text(&body, 256)
                    );
                }
                let wait_s = parse_retry_delay_seconds(&body).unwrap_or(RATE_LIMIT_DEFAULT_WAIT_S);
                countdown(wait_s);
                thread::sleep(Duration::from_secs(wait_s));
                continue;
            }

            if !(200..300).contains(&status) {
                bail!(
                    "Gemini request failed ({status}): {}",
                    truncate_text(&body, 512)
                );
            }

            let parsed: Value =
                serde_json::from_str(&body).context("Gemini returned invalid JSON payload")?;
            let (bytes, mime_type) = extract_inline_image(&parsed)?;
            let mime_type = mime_type.unwrap_or_else(|| "image/png".to_string());
            let image_path = request.out_dir.join(format!(
                "fitting-{}-{}.{}",
                timestamp_millis(),
                file_stem_slug(&request.garment.name),
                extension_for_mime(&mime_type)
            ));
            fs::write(&image_path, bytes)
                .with_context(|| format!("failed to write {}", image_path.display()))?;
            return Ok(GeneratedImage {
                image_path,
                mime_type,
            });
        }

        unreachable!("rate limit loop returns on its final attempt")
    }
}

/// Offline provider: renders a solid color derived from the garment
/// name. Lets the run loop and CLI be exercised without a credential.
pub struct DryrunProvider;

impl FittingProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        request: &FittingRequest,
        _countdown: &mut dyn FnMut(u64),
    ) -> Result<GeneratedImage> {
        let (r, g, b) = color_from_name(&request.garment.name);
        let mut canvas = RgbImage::new(512, 683);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let image_path = request.out_dir.join(format!(
            "fitting-{}-{}.png",
            timestamp_millis(),
            file_stem_slug(&request.garment.name)
        ));
        canvas
            .save(&image_path)
            .with_context(|| format!("failed to write {}", image_path.display()))?;
        Ok(GeneratedImage {
            image_path,
            mime_type: "image/png".to_string(),
        })
    }
}

/// Advisory rate-limit countdown. `set` stores the remaining seconds
/// and starts a ticker that decrements by one per tick, clearing the
/// value when it reaches zero. Replacing the value cancels the previous
/// ticker; dropping the countdown cancels outright.
#[derive(Debug)]
pub struct RetryCountdown {
    inner: Arc<CountdownInner>,
    tick: Duration,
}

#[derive(Debug)]
struct CountdownInner {
    remaining: Mutex<Option<u64>>,
    generation: AtomicU64,
}

impl RetryCountdown {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_secs(1))
    }

    /// Tick interval override for tests; production callers use the
    /// one-second wall clock.
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            inner: Arc::new(CountdownInner {
                remaining: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            tick,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        *lock_or_recover(&self.inner.remaining)
    }

    pub fn set(&self, seconds: u64) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut remaining = lock_or_recover(&self.inner.remaining);
            *remaining = if seconds == 0 { None } else { Some(seconds) };
        }
        if seconds == 0 {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let tick = self.tick;
        thread::spawn(move || loop {
            thread::sleep(tick);
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let mut remaining = lock_or_recover(&inner.remaining);
            match *remaining {
                Some(value) if value > 1 => *remaining = Some(value - 1),
                Some(_) => {
                    *remaining = None;
                    return;
                }
                None => return,
            }
        });
    }

    pub fn clear(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *lock_or_recover(&self.inner.remaining) = None;
    }
}

impl Default for RetryCountdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RetryCountdown {
    fn drop(&mut self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOutcome {
    pub started: bool,
    pub aborted_for_reauth: bool,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives one full generation run over the session's garment list.
///
/// Strictly sequential: one outstanding request at a time, each item
/// fully resolved before the next begins. Per-item failures are
/// isolated; the re-authentication sentinel aborts the remainder of
/// the loop and leaves later items pending.
pub fn run_fitting(
    session: &mut SessionState,
    provider: &dyn FittingProvider,
    out_dir: &Path,
    events: &EventLog,
    countdown: &RetryCountdown,
    credentials: &dyn CredentialPrompt,
) -> Result<RunOutcome> {
    if session.begin_run().is_err() {
        return Ok(RunOutcome::default());
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let subject = session
        .subject
        .clone()
        .context("subject image missing after run guard")?;
    let garments = session.garments.clone();
    let fit_style = session.fit_style;
    let preset = session.preset.clone();

    events.append(
        "run_started",
        map_object(json!({
            "provider": provider.name(),
            "garments": garments.len(),
            "fit_style": fit_style.as_str(),
            "preset": preset,
        })),
    )?;
    for (index, garment) in garments.iter().enumerate() {
        events.append(
            "item_queued",
            map_object(json!({ "index": index, "garment": garment.name })),
        )?;
    }

    // Before/after material: one decoded copy of the subject per run.
    let original_image = write_subject_copy(&subject, out_dir)?;

    let registry = ScenePresetRegistry::builtin();
    let preset_spec = preset.as_deref().and_then(|name| registry.get(name).cloned());

    let mut aborted_for_reauth = false;
    for (index, garment) in garments.iter().enumerate() {
        let request = FittingRequest {
            subject: subject.clone(),
            garment: garment.clone(),
            fit_style,
            preset: preset_spec.clone(),
            out_dir: out_dir.to_path_buf(),
        };

        let outcome = provider.generate(&request, &mut |seconds| {
            countdown.set(seconds);
            if let Err(err) = events.append(
                "retry_countdown",
                map_object(json!({ "index": index, "seconds": seconds })),
            ) {
                eprintln!("vfit: failed to record retry countdown: {err:#}");
            }
        });
        session.retry_countdown = countdown.remaining();

        match outcome {
            Ok(generated) => {
                session.mark_success(
                    index,
                    generated.image_path.display().to_string(),
                    Some(original_image.display().to_string()),
                );
                events.append(
                    "item_succeeded",
                    map_object(json!({
                        "index": index,
                        "garment": garment.name,
                        "image_path": generated.image_path.display().to_string(),
                    })),
                )?;
            }
            Err(err) if is_reauth_required(&err) => {
                session.set_error(REAUTH_USER_MESSAGE);
                events.append(
                    "reauth_required",
                    map_object(json!({
                        "index": index,
                        "garment": garment.name,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
                // The key flow's own failure is console-only.
                if let Err(prompt_err) = credentials.open_key_selection() {
                    eprintln!("vfit: failed to open key selection: {prompt_err:#}");
                }
                aborted_for_reauth = true;
                break;
            }
            Err(err) => {
                session.mark_error(index, error_chain_text(&err, 512));
                events.append(
                    "item_failed",
                    map_object(json!({
                        "index": index,
                        "garment": garment.name,
                        "error": error_chain_text(&err, 512),
                    })),
                )?;
            }
        }
    }

    session.finish_run();
    let (pending, succeeded, failed) = session.status_counts();
    events.append(
        "run_finished",
        map_object(json!({
            "pending": pending,
            "succeeded": succeeded,
            "failed": failed,
            "aborted_for_reauth": aborted_for_reauth,
        })),
    )?;

    Ok(RunOutcome {
        started: true,
        aborted_for_reauth,
        pending,
        succeeded,
        failed,
    })
}

pub fn compose_instruction(fit_style: FitStyle, preset: Option<&ScenePreset>) -> String {
    let mut instruction = format!(
        "Virtual fitting: dress the person from the first image in the garment from the second image. \
         Keep the person's identity, pose and body unchanged and render the garment with {}.",
        fit_style.drape_instruction()
    );
    if let Some(preset) = preset {
        instruction.push_str(&format!(" Set the scene in {}.", preset.scene_instruction));
    }
    instruction
}

fn inline_image_part(asset: &ImageAsset) -> Value {
    json!({
        "inlineData": {
            "mimeType": asset.mime_type,
            "data": asset.base64,
        }
    })
}

fn write_subject_copy(subject: &ImageAsset, out_dir: &Path) -> Result<PathBuf> {
    let path = out_dir.join(format!(
        "subject-{}.{}",
        timestamp_millis(),
        subject.extension()
    ));
    fs::write(&path, subject.decoded_bytes()?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn extract_inline_image(response_payload: &Value) -> Result<(Vec<u8>, Option<String>)> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.as_bytes())
                .context("Gemini image base64 decode failed")?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok((bytes, mime_type));
        }
    }

    bail!("Gemini returned no image part")
}

fn parse_retry_delay_seconds(body: &str) -> Option<u64> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let details = parsed.get("error")?.get("details")?.as_array()?.clone();
    for detail in details {
        let is_retry_info = detail
            .get("@type")
            .and_then(Value::as_str)
            .map(|kind| kind.ends_with("RetryInfo"))
            .unwrap_or(false);
        if !is_retry_info {
            continue;
        }
        let delay = detail.get("retryDelay").and_then(Value::as_str)?;
        let seconds: f64 = delay.trim().trim_end_matches('s').parse().ok()?;
        return Some(seconds.ceil().max(1.0) as u64);
    }
    None
}

fn body_signals_reauth(body: &str) -> bool {
    body.contains("UNAUTHENTICATED")
        || body.contains("PERMISSION_DENIED")
        || body.contains("API key not valid")
        || body.contains("API_KEY_INVALID")
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
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
    truncate_text(&parts.join(": "), max_chars)
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn file_stem_slug(name: &str) -> String {
    let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
    let slug: String = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = slug.trim_matches('-');
    if trimmed.is_empty() {
        "garment".to_string()
    } else {
        trimmed.to_string()
    }
}

fn color_from_name(name: &str) -> (u8, u8, u8) {
    let mut acc: u32 = 0x811c9dc5;
    for byte in name.bytes() {
        acc = acc.wrapping_mul(31).wrapping_add(byte as u32);
    }
    (
        (acc & 0xff) as u8,
        ((acc >> 8) & 0xff) as u8,
        ((acc >> 16) & 0xff) as u8,
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
