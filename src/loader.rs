//! HuggingFace model file fetching.
//!
//! Ensures the configured GGUF file exists at its deterministic local path
//! (`{model_root}/{hf_id}/{hf_file}`), downloading it from the HuggingFace
//! CDN when missing. Downloads go to a `.part` file first and are renamed
//! into place, so an interrupted fetch never leaves a truncated model.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::log_info;

const USER_AGENT: &str = concat!("llama-gateway/", env!("CARGO_PKG_VERSION"));

/// Deterministic location for a model file under `model_root`.
pub fn model_file_path(model_root: &str, hf_id: &str, hf_file: &str) -> PathBuf {
    Path::new(model_root).join(hf_id).join(hf_file)
}

fn download_url(hf_id: &str, hf_file: &str) -> String {
    format!("https://huggingface.co/{hf_id}/resolve/main/{hf_file}")
}

/// Make sure the configured model file is present locally; no-op when it
/// already exists. Returns the file's path.
pub fn ensure_model(config: &AppConfig) -> Result<PathBuf, GatewayError> {
    let mc = &config.model_config;
    let target = model_file_path(&config.model_root, &mc.hf_id, &mc.hf_file);

    if target.exists() {
        log_info!("Model file exists, skipping download: {}", target.display());
        return Ok(target);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let url = download_url(&mc.hf_id, &mc.hf_file);
    log_info!("Model file missing, downloading from {}", url);

    let part = target.with_extension("part");
    download_to(&url, &part)?;
    std::fs::rename(&part, &target)?;

    log_info!("Download complete: {}", target.display());
    Ok(target)
}

fn download_to(url: &str, part: &Path) -> Result<(), GatewayError> {
    let response = ureq::get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .map_err(|e| GatewayError::Config(format!("model download failed: {e}")))?;

    let mut reader = response.into_reader();
    let mut file = std::fs::File::create(part)?;

    let mut buffer = [0u8; 64 * 1024];
    let mut written: u64 = 0;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n])?;
        written += n as u64;
    }
    file.flush()?;

    log_info!("Fetched {} bytes", written);
    Ok(())
}
