use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::app_error::AppResult;
use crate::models::Upload;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "tif", "tiff",
];

/// Writes an attachment payload to a temp file that is removed on drop.
pub fn stage_payload(tmp_dir: &Path, file_id: i64, data: &[u8]) -> AppResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix(&format!("attach_{file_id}_"))
        .tempfile_in(tmp_dir)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}

/// Hidden files would be dropped by the upload pipeline, so they get a
/// 32 hex char prefix derived from the file id and name. The same attachment
/// always gets the same name.
pub fn safe_filename(file_id: i64, filename: &str) -> String {
    if filename.starts_with('.') {
        let digest = Sha256::new()
            .chain_update(file_id.to_le_bytes())
            .chain_update(filename.as_bytes())
            .finalize();
        format!("{}{filename}", hex::encode(&digest[..16]))
    } else {
        filename.to_string()
    }
}

pub fn is_image(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Markup appended to a post to show an upload.
pub fn upload_markup(upload: &Upload, filename: &str) -> String {
    if is_image(filename) {
        format!("![{filename}]({})", upload.url)
    } else {
        format!(
            "[{filename}|attachment]({}) ({})",
            upload.url,
            human_size(upload.filesize)
        )
    }
}

pub fn human_size(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b < KB {
        format!("{bytes} Bytes")
    } else if b < MB {
        format!("{:.1} KB", b / KB)
    } else if b < GB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{:.1} GB", b / GB)
    }
}
