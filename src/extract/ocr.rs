use std::process::Command;

use tokio::task;
use tracing::warn;

/// Runs a tesseract-compatible binary over downloaded images. OCR stays
/// disabled until a command path is configured, so deployments without the
/// binary simply skip image text.
#[derive(Debug, Clone, Default)]
pub struct OcrEngine {
    command: String,
    tessdata_dir: String,
    languages: String,
}

impl OcrEngine {
    pub fn new(command: &str, tessdata_dir: &str, languages: &str) -> Self {
        let languages = if languages.trim().is_empty() {
            "chi_sim+eng".to_string()
        } else {
            languages.to_string()
        };
        Self {
            command: command.to_string(),
            tessdata_dir: tessdata_dir.to_string(),
            languages,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.command.trim().is_empty()
    }

    /// Recognize text in one image, off the async runtime. Returns an empty
    /// string when OCR is disabled or the engine fails.
    pub async fn recognize(&self, image_bytes: Vec<u8>) -> String {
        if !self.enabled() || image_bytes.is_empty() {
            return String::new();
        }
        let engine = self.clone();
        task::spawn_blocking(move || engine.recognize_blocking(&image_bytes))
            .await
            .unwrap_or_default()
    }

    fn recognize_blocking(&self, image_bytes: &[u8]) -> String {
        let image_path =
            std::env::temp_dir().join(format!("harvester_ocr_{}.img", uuid::Uuid::new_v4()));
        if let Err(err) = std::fs::write(&image_path, image_bytes) {
            warn!(error = %err, "failed to stage image for OCR");
            return String::new();
        }

        let mut command = Command::new(&self.command);
        command
            .arg(&image_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages);
        if !self.tessdata_dir.trim().is_empty() {
            command.arg("--tessdata-dir").arg(&self.tessdata_dir);
        }

        let output = command.output();
        let _ = std::fs::remove_file(&image_path);

        match output {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(output) => {
                warn!(
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "OCR command failed"
                );
                String::new()
            }
            Err(err) => {
                warn!(error = %err, command = %self.command, "failed to run OCR command");
                String::new()
            }
        }
    }
}
