use crate::command::classify_message;
use crate::config::ConverterConfig;
use crate::convert::{ConversionRequest, ConversionStatus, ImageConverter};
use crate::ProvisionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

type StatusTable = Arc<Mutex<HashMap<String, ConversionStatus>>>;

/// Conversion through `qemu-img convert -p`.
///
/// Each submit spawns one child; a reader task parses the `(NN.NN/100%)`
/// progress the tool prints and records the final status when it exits.
pub struct QemuImgConverter {
    config: ConverterConfig,
    jobs: StatusTable,
}

impl QemuImgConverter {
    pub fn new(config: ConverterConfig) -> Self {
        Self {
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn args(request: &ConversionRequest) -> Vec<String> {
        vec![
            "convert".to_owned(),
            "-p".to_owned(),
            "-f".to_owned(),
            request.source_format.qemu_name().to_owned(),
            "-O".to_owned(),
            request.target_format.qemu_name().to_owned(),
            request.source_path.display().to_string(),
            request.output_path.display().to_string(),
        ]
    }

    fn set_status(jobs: &StatusTable, handle: &str, status: ConversionStatus) {
        if let Ok(mut table) = jobs.lock() {
            table.insert(handle.to_owned(), status);
        }
    }
}

/// Last progress value in a chunk of `qemu-img -p` output.
pub fn parse_progress(chunk: &str) -> Option<u8> {
    chunk
        .rsplit('(')
        .find_map(|part| part.split_once("/100%"))
        .and_then(|(value, _)| value.trim().parse::<f32>().ok())
        .map(|v| v.clamp(0.0, 100.0) as u8)
}

/// Status of a failed run. A kill by signal counts as transient.
fn failure_status(
    code: Option<i32>,
    stderr: &str,
    progress: u8,
    transient_codes: &[i32],
) -> ConversionStatus {
    let stderr = stderr.trim();
    match code {
        Some(code) => {
            let transient = transient_codes.contains(&code)
                || classify_message(stderr, String::new()).is_transient();
            ConversionStatus::failed(
                progress,
                format!("qemu-img exited with code {code}: {stderr}"),
                transient,
            )
        }
        None => ConversionStatus::failed(
            progress,
            format!("qemu-img killed by signal: {stderr}"),
            true,
        ),
    }
}

#[async_trait]
impl ImageConverter for QemuImgConverter {
    fn name(&self) -> &'static str {
        "qemu-img"
    }

    async fn submit(&self, request: &ConversionRequest) -> Result<String, ProvisionError> {
        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let handle = uuid::Uuid::new_v4().to_string();
        info!(
            "converting {} ({} -> {}) as {handle}",
            request.image_id, request.source_format, request.target_format
        );

        let mut child = Command::new(&self.config.command)
            .args(Self::args(request))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        Self::set_status(&self.jobs, &handle, ConversionStatus::running(0));

        let jobs = Arc::clone(&self.jobs);
        let transient_codes = self.config.transient_exit_codes.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let stderr_task = child.stderr.take().map(|mut stderr| {
                tokio::spawn(async move {
                    let mut text = String::new();
                    let _ = stderr.read_to_string(&mut text).await;
                    text
                })
            });

            let mut last = 0u8;
            if let Some(mut stdout) = child.stdout.take() {
                let mut buf = [0u8; 512];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if let Some(p) = parse_progress(&String::from_utf8_lossy(&buf[..n])) {
                        if p > last {
                            last = p;
                            Self::set_status(&jobs, &task_handle, ConversionStatus::running(p));
                        }
                    }
                }
            }

            let stderr_text = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let status = match child.wait().await {
                Ok(status) if status.success() => ConversionStatus::succeeded(),
                Ok(status) => {
                    failure_status(status.code(), &stderr_text, last, &transient_codes)
                }
                Err(e) => {
                    ConversionStatus::failed(last, format!("waiting for qemu-img: {e}"), true)
                }
            };
            if let Some(ref err) = status.error {
                warn!("conversion {task_handle} failed: {err}");
            } else {
                debug!("conversion {task_handle} finished");
            }
            Self::set_status(&jobs, &task_handle, status);
        });

        Ok(handle)
    }

    /// A terminal status is handed out once; the handle is forgotten after.
    async fn poll(&self, handle: &str) -> Result<ConversionStatus, ProvisionError> {
        let mut table = self
            .jobs
            .lock()
            .map_err(|e| ProvisionError::Permanent(format!("status table poisoned: {e}")))?;
        let status = table
            .get(handle)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(format!("conversion {handle}")))?;
        if status.is_terminal() {
            table.remove(handle);
        }
        Ok(status)
    }
}
