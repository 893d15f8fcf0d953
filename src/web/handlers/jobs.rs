use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::audio::AudioFormat;
use crate::error::SchedulerError;
use crate::schedule::types::{JobOutcome, JobSnapshot, JobStatus, TranscriptionResult};
use crate::schedule::HealthReport;
use crate::utils::http::HttpResponse;
use crate::AppContext;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub fn jobs_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/upload", post(upload))
        .route("/transcribe/:job_id", post(transcribe))
        .route("/status/:job_id", get(status))
        .route("/result/:job_id", get(result))
        .route("/download/:job_id", get(download))
        .route("/job/:job_id", delete(delete_job))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(ctx)
}

/// Maps the scheduler taxonomy onto HTTP status codes.
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::InvalidInput(_) | SchedulerError::InvalidState { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = HttpResponse::<()>::error(self.0.code(), self.0.to_string());
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<HttpResponse<T>>, ApiError>;

fn invalid(message: impl Into<String>) -> ApiError {
    ApiError(SchedulerError::InvalidInput(message.into()))
}

#[derive(Debug, Serialize)]
pub struct FormatInfo {
    pub extension: String,
    pub description: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub supported_formats: Vec<FormatInfo>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub job_id: String,
    pub filename: String,
    pub format: AudioFormat,
    pub description: &'static str,
    pub file_size: u64,
}

#[derive(Debug, Serialize)]
pub struct JobAck {
    pub job_id: String,
    pub status: &'static str,
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<HttpResponse<HealthResponse>> {
    let supported_formats = AudioFormat::SUPPORTED
        .iter()
        .map(|format| FormatInfo {
            extension: format!(".{}", format.extension()),
            description: format.description(),
        })
        .collect();
    Json(HttpResponse::success(HealthResponse {
        report: ctx.scheduler.health().await,
        supported_formats,
    }))
}

// 只保留文件名部分，去掉客户端带上的目录
fn client_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

async fn upload(State(ctx): State<Arc<AppContext>>, mut multipart: Multipart) -> ApiResult<UploadResponse> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .and_then(client_filename)
            .ok_or_else(|| invalid("uploaded file has no filename"))?;
        let extension = FsPath::new(&filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        let format = AudioFormat::parse(extension)?;

        let data = field
            .bytes()
            .await
            .map_err(|e| invalid(format!("failed to read upload: {}", e)))?;
        if data.is_empty() {
            return Err(invalid("uploaded file is empty"));
        }

        let upload_dir = &ctx.settings.server.upload_dir;
        tokio::fs::create_dir_all(upload_dir).await.map_err(SchedulerError::from)?;
        let stored = upload_dir.join(format!("{}.{}", uuid::Uuid::new_v4(), format.extension()));
        tokio::fs::write(&stored, &data).await.map_err(SchedulerError::from)?;

        let file_size = data.len() as u64;
        let job_id = match ctx
            .scheduler
            .submit_upload(stored.clone(), filename.clone(), format.extension(), file_size)
        {
            Ok(job_id) => job_id,
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&stored).await {
                    warn!("Failed to remove rejected upload {}: {}", stored.display(), remove_err);
                }
                return Err(e.into());
            }
        };
        info!("Stored upload {} as {}", filename, stored.display());

        return Ok(Json(HttpResponse::success(UploadResponse {
            job_id,
            filename,
            format,
            description: format.description(),
            file_size,
        })));
    }

    Err(invalid("multipart body has no `file` field"))
}

async fn transcribe(State(ctx): State<Arc<AppContext>>, Path(job_id): Path<String>) -> ApiResult<JobAck> {
    ctx.scheduler.start(&job_id)?;
    Ok(Json(HttpResponse::success(JobAck {
        job_id,
        status: "processing",
    })))
}

async fn status(State(ctx): State<Arc<AppContext>>, Path(job_id): Path<String>) -> ApiResult<JobSnapshot> {
    Ok(Json(HttpResponse::success(ctx.scheduler.get_status(&job_id)?)))
}

async fn result(State(ctx): State<Arc<AppContext>>, Path(job_id): Path<String>) -> ApiResult<JobOutcome> {
    Ok(Json(HttpResponse::success(ctx.scheduler.get_result(&job_id)?)))
}

async fn download(State(ctx): State<Arc<AppContext>>, Path(job_id): Path<String>) -> Result<Response, ApiError> {
    let snapshot = ctx.scheduler.get_status(&job_id)?;
    let JobOutcome::Completed(result) = ctx.scheduler.get_result(&job_id)? else {
        return Err(SchedulerError::InvalidState {
            job_id,
            status: snapshot.status,
            expected: JobStatus::Completed,
        }
        .into());
    };

    let stem = FsPath::new(&snapshot.filename)
        .file_stem()
        .map(|stem| stem.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| job_id.clone());
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}_transcription.txt\"", stem),
        ),
    ];
    Ok((headers, transcript_document(&snapshot.filename, &result)).into_response())
}

async fn delete_job(State(ctx): State<Arc<AppContext>>, Path(job_id): Path<String>) -> ApiResult<JobAck> {
    ctx.scheduler.delete(&job_id).await?;
    Ok(Json(HttpResponse::success(JobAck {
        job_id,
        status: "deleted",
    })))
}

pub fn transcript_document(filename: &str, result: &TranscriptionResult) -> String {
    let device = match result.device_used {
        Some(id) => format!("GPU {}", id),
        None => "CPU".to_string(),
    };
    format!(
        "Transcription Report\n\
         ====================\n\
         File: {}\n\
         Generated: {}\n\
         Duration: {:.2} seconds\n\
         Confidence: {:.1}%\n\
         Model: {}\n\
         Device: {}\n\
         \n\
         Transcript\n\
         ----------\n\
         {}\n",
        filename,
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        result.duration_seconds,
        result.confidence * 100.0,
        result.model_name,
        device,
        result.text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::registry::tests::FakeEngine;
    use crate::asr::BackendRegistry;
    use crate::audio::tests::settings as audio_settings;
    use crate::audio::AudioNormalizer;
    use crate::config::{ResourceSettings, Settings};
    use crate::device::monitor::tests::StaticProbe;
    use crate::device::{DeviceInventory, PressureThresholds, ResourceMonitor};
    use crate::schedule::{CleanupPolicy, JobScheduler, TranscribeProcessor, WorkerPool};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hound::{SampleFormat, WavSpec, WavWriter};
    use serde_json::Value;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "asr-test-boundary";

    struct TestApp {
        router: Router,
        ctx: Arc<AppContext>,
        _uploads: TempDir,
        _work: TempDir,
    }

    fn app() -> TestApp {
        let uploads = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();

        let mut settings = Settings::default();
        settings.server.upload_dir = uploads.path().to_path_buf();
        settings.audio = audio_settings(work.path());

        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(DeviceInventory::default()),
            Arc::new(StaticProbe::healthy()),
            PressureThresholds::from(&ResourceSettings::default()),
        ));
        let processor = TranscribeProcessor::new(
            monitor,
            Arc::new(AudioNormalizer::new(&settings.audio)),
            Arc::new(BackendRegistry::new(vec![FakeEngine::healthy("primary")], WorkerPool::new(2))),
            CleanupPolicy::from(&settings.scheduler),
        );
        let ctx = Arc::new(AppContext {
            settings,
            scheduler: Arc::new(JobScheduler::new(Arc::new(processor))),
        });

        TestApp {
            router: jobs_router(ctx.clone()),
            ctx,
            _uploads: uploads,
            _work: work,
        }
    }

    fn silence_wav(seconds: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..16_000 * seconds {
                writer.write_sample(0i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn multipart_request(filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
            .body(Body::from(body))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(router, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn upload_transcribe_download_delete() {
        let app = app();

        let (status, json) = send_json(&app.router, multipart_request("meeting.wav", &silence_wav(2))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["filename"], "meeting.wav");
        assert_eq!(json["data"]["description"], "WAV Audio");
        let job_id = json["data"]["job_id"].as_str().unwrap().to_string();

        let (status, _) = send_json(&app.router, empty_request("POST", &format!("/transcribe/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);

        let mut completed = false;
        for _ in 0..250 {
            let (_, json) = send_json(&app.router, empty_request("GET", &format!("/status/{}", job_id))).await;
            if json["data"]["status"] == "completed" {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed, "job should complete");

        let (status, json) = send_json(&app.router, empty_request("GET", &format!("/result/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "completed");
        assert_eq!(json["data"]["data"]["model_name"], "primary");

        let (status, body) = send(&app.router, empty_request("GET", &format!("/download/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);
        let document = String::from_utf8(body).unwrap();
        assert!(document.contains("File: meeting.wav"));
        assert!(document.contains("Model: primary"));
        assert!(document.contains("transcript from primary"));

        let (status, _) = send_json(&app.router, empty_request("DELETE", &format!("/job/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, json) = send_json(&app.router, empty_request("GET", &format!("/status/{}", job_id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NotFound");
        assert!(app.ctx.scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected_without_storing() {
        let app = app();
        let (status, json) = send_json(&app.router, multipart_request("notes.txt", b"hello")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "InvalidInput");
        assert_eq!(std::fs::read_dir(&app.ctx.settings.server.upload_dir).unwrap().count(), 0);

        let (status, json) = send_json(&app.router, multipart_request("empty.wav", b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["message"], "uploaded file is empty");
    }

    #[tokio::test]
    async fn caller_errors_map_to_4xx() {
        let app = app();
        let (status, _) = send_json(&app.router, empty_request("POST", "/transcribe/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send_json(&app.router, empty_request("DELETE", "/job/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, json) = send_json(&app.router, multipart_request("clip.flac", b"fLaC....")).await;
        let job_id = json["data"]["job_id"].as_str().unwrap().to_string();

        // not transcribed yet
        let (status, json) = send_json(&app.router, empty_request("GET", &format!("/download/{}", job_id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "InvalidState");

        send_json(&app.router, empty_request("POST", &format!("/transcribe/{}", job_id))).await;
        let (status, json) = send_json(&app.router, empty_request("POST", &format!("/transcribe/{}", job_id))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "InvalidState");
    }

    #[tokio::test]
    async fn health_lists_supported_formats() {
        let app = app();
        let (status, json) = send_json(&app.router, empty_request("GET", "/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["status"], "healthy");
        assert_eq!(json["data"]["supported_formats"].as_array().unwrap().len(), 8);
        assert_eq!(json["data"]["backends"][0]["name"], "primary");
    }

    #[test]
    fn client_paths_are_stripped() {
        assert_eq!(client_filename("C:\\Users\\me\\talk.mp3").as_deref(), Some("talk.mp3"));
        assert_eq!(client_filename("../../etc/passwd.wav").as_deref(), Some("passwd.wav"));
        assert_eq!(client_filename("uploads/"), None);
    }
}
