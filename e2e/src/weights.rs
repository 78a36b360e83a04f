use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::TractResult;

pub fn is_url(weights: &str) -> bool {
    weights.starts_with("http:/") || weights.starts_with("https:/")
}

/// Local file name for a URL: its last path segment, query stripped.
pub fn url_to_file(url: &str) -> PathBuf {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.trim_end_matches('/').rsplit('/').next().unwrap_or(path);
    PathBuf::from(name)
}

/// Local path of a checkpoint, downloading it first when given a URL. An
/// already downloaded file is reused.
pub fn resolve(weights: &str) -> TractResult<PathBuf> {
    if !is_url(weights) {
        return Ok(PathBuf::from(weights));
    }
    let file = url_to_file(weights);
    if file.exists() {
        debug!("Reusing {}", file.display());
    } else {
        download(weights, &file)?;
    }
    Ok(file)
}

fn download(url: &str, to: &Path) -> TractResult<()> {
    info!("Downloading {url} to {}...", to.display());
    let bytes = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .with_context(|| format!("Downloading {url}"))?;
    fs_err::write(to, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls() {
        assert!(is_url("https://example.com/yolov8s-seg.onnx"));
        assert!(!is_url("yolov8s-seg.onnx"));
        assert_eq!(
            url_to_file("https://example.com/releases/v1/yolov8s-seg.onnx?raw=true"),
            PathBuf::from("yolov8s-seg.onnx")
        );
    }

    #[test]
    fn local_paths_are_untouched() {
        assert_eq!(resolve("models/best.onnx").unwrap(), PathBuf::from("models/best.onnx"));
    }
}
