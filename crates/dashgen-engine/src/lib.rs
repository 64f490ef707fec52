use std::env;
use std::time::Duration;

use chrono::NaiveDateTime;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use thiserror::Error;

use dashgen_contracts::requests::{
    ImageEditRequest, TextToImageRequest, DEFAULT_EDIT_MODEL, DEFAULT_EXPAND_SCALE,
    DEFAULT_IMAGE_SIZE, DEFAULT_SEED, DEFAULT_TEXT_TO_IMAGE_MODEL, DEFAULT_UPSCALE_FACTOR,
};
use dashgen_contracts::tasks::{TaskState, TaskStatusReport, TaskSubmission};

pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/api/v1";

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// The closed set of failures a caller can see. Nothing is retried; every
/// boundary call surfaces exactly one of these.
#[derive(Debug, Error)]
pub enum DashError {
    #[error(
        "missing DashScope API key: pass --api-key, store one with `dashgen key set`, \
         or export DASHSCOPE_API_KEY"
    )]
    MissingApiKey,
    #[error("request validation failed: {}", .0.join("; "))]
    ValidationFailed(Vec<String>),
    #[error("DashScope request failed ({status}): {message}")]
    ApiRequestFailed { status: u16, message: String },
    #[error("task {task_id} failed")]
    TaskFailed { task_id: String },
    #[error("{0}")]
    Internal(String),
}

impl From<reqwest::Error> for DashError {
    fn from(err: reqwest::Error) -> Self {
        DashError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DashError>;

/// Blocking client over the DashScope image-synthesis and task endpoints.
///
/// Submission and polling are both single-shot: one POST yields an opaque
/// task id, one GET classifies it. Re-polling cadence is the caller's
/// business.
#[derive(Debug, Clone)]
pub struct DashScopeClient {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl DashScopeClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_base: env::var("DASHSCOPE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            http: HttpClient::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim().trim_end_matches('/').to_string();
        self
    }

    /// Submits an image-edit task. The key check and the validator both run
    /// before any network I/O.
    pub fn submit_edit(
        &self,
        request: &ImageEditRequest,
        api_key: Option<&str>,
    ) -> Result<TaskSubmission> {
        let key = self.resolve_key(api_key)?;
        let validation = request.validate();
        if !validation.valid {
            return Err(DashError::ValidationFailed(validation.errors));
        }
        self.submit("image2image", &edit_payload(request), &key)
    }

    /// Submits a text-to-image task. Same contract as [`Self::submit_edit`].
    pub fn submit_text_to_image(
        &self,
        request: &TextToImageRequest,
        api_key: Option<&str>,
    ) -> Result<TaskSubmission> {
        let key = self.resolve_key(api_key)?;
        let validation = request.validate();
        if !validation.valid {
            return Err(DashError::ValidationFailed(validation.errors));
        }
        self.submit("text2image", &text_to_image_payload(request), &key)
    }

    /// One GET against the task endpoint, classified into
    /// pending/completed/failed. Never re-polls on its own.
    pub fn task_status(&self, task_id: &str, api_key: Option<&str>) -> Result<TaskStatusReport> {
        let key = self.resolve_key(api_key)?;
        let endpoint = format!("{}/tasks/{}", self.api_base, task_id.trim());
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&key)
            .timeout(STATUS_TIMEOUT)
            .send()?;
        let payload = read_json(response)?;
        report_from_status_payload(&payload)
    }

    fn submit(&self, service: &str, payload: &Value, api_key: &str) -> Result<TaskSubmission> {
        let endpoint = format!("{}/services/aigc/{service}/image-synthesis", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("X-DashScope-Async", "enable")
            .json(payload)
            .timeout(SUBMIT_TIMEOUT)
            .send()?;
        let body = read_json(response)?;
        submission_from_payload(&body)
    }

    fn resolve_key(&self, override_key: Option<&str>) -> Result<String> {
        if let Some(key) = non_empty(override_key) {
            return Ok(key);
        }
        if let Some(key) = non_empty(self.api_key.as_deref()) {
            return Ok(key);
        }
        non_empty_env("DASHSCOPE_API_KEY").ok_or(DashError::MissingApiKey)
    }
}

fn edit_payload(request: &ImageEditRequest) -> Value {
    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_EDIT_MODEL);

    let mut input = map_object(json!({
        "function": request.function.as_str(),
        "prompt": request.prompt,
        "base_image_url": request.image_url,
    }));
    if let Some(mask) = request
        .mask_url
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        input.insert(
            "mask_image_url".to_string(),
            Value::String(mask.to_string()),
        );
    }

    let mut parameters = map_object(json!({
        "n": request.n.unwrap_or(1),
    }));
    if request.function.needs_expand() {
        parameters.insert(
            "top_scale".to_string(),
            json!(request.top_scale.unwrap_or(DEFAULT_EXPAND_SCALE)),
        );
        parameters.insert(
            "bottom_scale".to_string(),
            json!(request.bottom_scale.unwrap_or(DEFAULT_EXPAND_SCALE)),
        );
        parameters.insert(
            "left_scale".to_string(),
            json!(request.left_scale.unwrap_or(DEFAULT_EXPAND_SCALE)),
        );
        parameters.insert(
            "right_scale".to_string(),
            json!(request.right_scale.unwrap_or(DEFAULT_EXPAND_SCALE)),
        );
    }
    if request.function.needs_upscale() {
        parameters.insert(
            "upscale_factor".to_string(),
            json!(request.upscale_factor.unwrap_or(DEFAULT_UPSCALE_FACTOR)),
        );
    }

    json!({
        "model": model,
        "input": Value::Object(input),
        "parameters": Value::Object(parameters),
    })
}

fn text_to_image_payload(request: &TextToImageRequest) -> Value {
    let model = request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_TEXT_TO_IMAGE_MODEL);
    let size = request
        .size
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_IMAGE_SIZE);

    json!({
        "model": model,
        "input": {
            "prompt": request.prompt,
        },
        "parameters": {
            "size": size,
            "n": request.n.unwrap_or(1),
            "prompt_extend": false,
            "seed": request.seed.unwrap_or(DEFAULT_SEED),
        },
    })
}

fn submission_from_payload(payload: &Value) -> Result<TaskSubmission> {
    let output = payload
        .get("output")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            DashError::Internal("DashScope response is missing the output object".to_string())
        })?;
    let task_id = output
        .get("task_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            DashError::Internal("DashScope response is missing output.task_id".to_string())
        })?;
    let task_status = output
        .get("task_status")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("UNKNOWN");
    let request_id = payload
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(TaskSubmission {
        task_id: task_id.to_string(),
        task_status: task_status.to_string(),
        request_id: request_id.to_string(),
    })
}

fn report_from_status_payload(payload: &Value) -> Result<TaskStatusReport> {
    let output = payload
        .get("output")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            DashError::Internal(
                "DashScope status response is missing the output object".to_string(),
            )
        })?;
    let status = output
        .get("task_status")
        .and_then(Value::as_str)
        .map(|value| value.trim().to_ascii_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string());
    let submit_time = field_text(output, "submit_time");
    let end_time = field_text(output, "end_time");

    match status.as_str() {
        "SUCCEEDED" => {
            let images = result_urls(output.get("results"));
            let mut message = if images.is_empty() {
                "task completed but returned no images".to_string()
            } else {
                format!("task completed: {} image(s) generated", images.len())
            };
            if let Some(end) = &end_time {
                message.push_str(&format!(", finished at {end}"));
            }
            if let (Some(submitted), Some(ended)) = (&submit_time, &end_time) {
                if let Some(seconds) = elapsed_seconds(submitted, ended) {
                    message.push_str(&format!(", took {seconds}s"));
                }
            }
            Ok(TaskStatusReport {
                state: TaskState::Completed,
                message,
                images,
            })
        }
        "FAILED" => {
            let mut message = "task failed".to_string();
            if let Some(detail) = field_text(output, "message") {
                message.push_str(&format!(": {detail}"));
            }
            Ok(TaskStatusReport {
                state: TaskState::Failed,
                message,
                images: Vec::new(),
            })
        }
        // PENDING, RUNNING, CANCELED, UNKNOWN and anything the vendor adds
        // later all stay pending until a terminal status shows up.
        other => {
            let mut message = format!("task is still running (status: {other})");
            if let Some(submitted) = &submit_time {
                message.push_str(&format!(", submitted at {submitted}"));
            }
            Ok(TaskStatusReport {
                state: TaskState::Pending,
                message,
                images: Vec::new(),
            })
        }
    }
}

fn result_urls(results: Option<&Value>) -> Vec<String> {
    let Some(rows) = results.and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| row.get("url"))
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn field_text(output: &Map<String, Value>, key: &str) -> Option<String> {
    output
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Task timestamps come back as `YYYY-MM-DD HH:MM:SS[.fff]`.
fn parse_task_time(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

fn elapsed_seconds(submit_time: &str, end_time: &str) -> Option<i64> {
    let submitted = parse_task_time(submit_time)?;
    let ended = parse_task_time(end_time)?;
    Some((ended - submitted).num_seconds())
}

fn read_json(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| DashError::Internal(format!("failed reading DashScope response: {err}")))?;
    if !status.is_success() {
        return Err(DashError::ApiRequestFailed {
            status: code,
            message: vendor_message(&body),
        });
    }
    serde_json::from_str(&body)
        .map_err(|_| DashError::Internal("DashScope returned an invalid JSON payload".to_string()))
}

fn vendor_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(message) = parsed
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    truncate_text(trimmed, 512)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::env;

    use serde_json::json;

    use dashgen_contracts::requests::{EditFunction, ImageEditRequest, TextToImageRequest};
    use dashgen_contracts::tasks::TaskState;

    use super::{
        edit_payload, report_from_status_payload, submission_from_payload, text_to_image_payload,
        DashError, DashScopeClient,
    };

    fn edit_request() -> ImageEditRequest {
        ImageEditRequest {
            image_url: "https://example.com/cat.png".to_string(),
            prompt: "make it watercolor".to_string(),
            ..ImageEditRequest::default()
        }
    }

    #[test]
    fn edit_payload_uses_defaults_and_omits_optional_fields() {
        let payload = edit_payload(&edit_request());
        assert_eq!(payload["model"], json!("wanx2.1-imageedit"));
        assert_eq!(payload["input"]["function"], json!("stylization_all"));
        assert_eq!(
            payload["input"]["base_image_url"],
            json!("https://example.com/cat.png")
        );
        assert!(payload["input"].get("mask_image_url").is_none());
        assert_eq!(payload["parameters"]["n"], json!(1));
        assert!(payload["parameters"].get("top_scale").is_none());
        assert!(payload["parameters"].get("upscale_factor").is_none());
    }

    #[test]
    fn edit_payload_includes_mask_when_present() {
        let mut request = edit_request();
        request.function = EditFunction::Inpainting;
        request.mask_url = Some("https://example.com/mask.png".to_string());
        let payload = edit_payload(&request);
        assert_eq!(
            payload["input"]["mask_image_url"],
            json!("https://example.com/mask.png")
        );
    }

    #[test]
    fn edit_payload_expand_scales_default_and_pass_through() {
        let mut request = edit_request();
        request.function = EditFunction::Expand;
        request.left_scale = Some(2.0);
        let payload = edit_payload(&request);
        assert_eq!(payload["parameters"]["top_scale"], json!(1.5));
        assert_eq!(payload["parameters"]["bottom_scale"], json!(1.5));
        assert_eq!(payload["parameters"]["left_scale"], json!(2.0));
        assert_eq!(payload["parameters"]["right_scale"], json!(1.5));
        assert!(payload["parameters"].get("upscale_factor").is_none());
    }

    #[test]
    fn edit_payload_upscale_factor_defaults_to_two() {
        let mut request = edit_request();
        request.function = EditFunction::SuperResolution;
        let payload = edit_payload(&request);
        assert_eq!(payload["parameters"]["upscale_factor"], json!(2));
        assert!(payload["parameters"].get("top_scale").is_none());
    }

    #[test]
    fn text_to_image_payload_defaults() {
        let request = TextToImageRequest {
            prompt: "a boat at dusk".to_string(),
            ..TextToImageRequest::default()
        };
        let payload = text_to_image_payload(&request);
        assert_eq!(payload["model"], json!("wan2.2-t2i-plus"));
        assert_eq!(payload["input"]["prompt"], json!("a boat at dusk"));
        assert_eq!(payload["parameters"]["size"], json!("1024*1024"));
        assert_eq!(payload["parameters"]["n"], json!(1));
        assert_eq!(payload["parameters"]["prompt_extend"], json!(false));
        assert_eq!(payload["parameters"]["seed"], json!(171126));
    }

    #[test]
    fn text_to_image_payload_honors_overrides() {
        let request = TextToImageRequest {
            prompt: "a boat at dusk".to_string(),
            size: Some("1440*768".to_string()),
            n: Some(4),
            seed: Some(7),
            model: Some("wan2.2-t2i-flash".to_string()),
        };
        let payload = text_to_image_payload(&request);
        assert_eq!(payload["model"], json!("wan2.2-t2i-flash"));
        assert_eq!(payload["parameters"]["size"], json!("1440*768"));
        assert_eq!(payload["parameters"]["n"], json!(4));
        assert_eq!(payload["parameters"]["seed"], json!(7));
    }

    #[test]
    fn succeeded_with_results_maps_to_completed() {
        let payload = json!({
            "request_id": "req-1",
            "output": {
                "task_id": "task-1",
                "task_status": "SUCCEEDED",
                "submit_time": "2025-08-07 10:00:00.000",
                "end_time": "2025-08-07 10:00:15.000",
                "results": [
                    { "url": "https://example.com/a.png" },
                ],
                "task_metrics": { "TOTAL": 1, "SUCCEEDED": 1, "FAILED": 0 },
            },
            "usage": { "image_count": 1 },
        });
        let report = report_from_status_payload(&payload).unwrap();
        assert_eq!(report.state, TaskState::Completed);
        assert_eq!(report.images, vec!["https://example.com/a.png".to_string()]);
        assert!(report.message.contains("1 image(s) generated"));
        assert!(report.message.contains("took 15s"));
    }

    #[test]
    fn succeeded_without_results_is_completed_with_note() {
        let payload = json!({
            "output": {
                "task_id": "task-1",
                "task_status": "SUCCEEDED",
                "end_time": "2025-08-07 10:00:15",
                "results": [],
            },
        });
        let report = report_from_status_payload(&payload).unwrap();
        assert_eq!(report.state, TaskState::Completed);
        assert!(report.images.is_empty());
        assert!(report.message.contains("returned no images"));
    }

    #[test]
    fn failed_maps_to_failed_with_vendor_detail() {
        let payload = json!({
            "output": {
                "task_id": "task-1",
                "task_status": "FAILED",
                "message": "input image unreachable",
            },
        });
        let report = report_from_status_payload(&payload).unwrap();
        assert_eq!(report.state, TaskState::Failed);
        assert!(report.message.contains("input image unreachable"));
    }

    #[test]
    fn non_terminal_statuses_map_to_pending() {
        for status in ["PENDING", "RUNNING", "CANCELED", "UNKNOWN", "SOMETHING_NEW"] {
            let payload = json!({
                "output": {
                    "task_id": "task-1",
                    "task_status": status,
                    "submit_time": "2025-08-07 10:00:00",
                },
            });
            let report = report_from_status_payload(&payload).unwrap();
            assert_eq!(report.state, TaskState::Pending, "status {status}");
            assert!(report.message.contains(status));
        }
    }

    #[test]
    fn status_payload_without_output_is_internal_error() {
        let payload = json!({ "request_id": "req-1" });
        assert!(matches!(
            report_from_status_payload(&payload),
            Err(DashError::Internal(_))
        ));
    }

    #[test]
    fn submission_payload_round_trip() {
        let payload = json!({
            "output": { "task_id": "task-9", "task_status": "PENDING" },
            "request_id": "req-9",
        });
        let submission = submission_from_payload(&payload).unwrap();
        assert_eq!(submission.task_id, "task-9");
        assert_eq!(submission.task_status, "PENDING");
        assert_eq!(submission.request_id, "req-9");

        let missing = json!({ "output": { "task_status": "PENDING" } });
        assert!(matches!(
            submission_from_payload(&missing),
            Err(DashError::Internal(_))
        ));
    }

    #[test]
    fn invalid_request_fails_before_any_network_call() {
        let client = DashScopeClient::new(Some("test-key".to_string()))
            .with_api_base("http://127.0.0.1:1");
        let request = ImageEditRequest::default();
        match client.submit_edit(&request, None) {
            Err(DashError::ValidationFailed(errors)) => {
                assert!(!errors.is_empty());
            }
            other => panic!("expected ValidationFailed, got {other:?}"),
        }
    }

    // Everything touching DASHSCOPE_API_KEY lives in one test so parallel
    // test threads never race on the variable.
    #[test]
    fn api_key_resolution_order() {
        env::remove_var("DASHSCOPE_API_KEY");

        let bare = DashScopeClient::new(None).with_api_base("http://127.0.0.1:1");
        assert!(matches!(
            bare.submit_edit(&edit_request(), None),
            Err(DashError::MissingApiKey)
        ));
        assert!(matches!(
            bare.task_status("task-1", None),
            Err(DashError::MissingApiKey)
        ));

        assert_eq!(bare.resolve_key(Some("override")).unwrap(), "override");

        let keyed = DashScopeClient::new(Some("stored".to_string()));
        assert_eq!(keyed.resolve_key(None).unwrap(), "stored");
        assert_eq!(keyed.resolve_key(Some("override")).unwrap(), "override");

        env::set_var("DASHSCOPE_API_KEY", "from-env");
        assert_eq!(bare.resolve_key(None).unwrap(), "from-env");
        env::remove_var("DASHSCOPE_API_KEY");
    }
}
