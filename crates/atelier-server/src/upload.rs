//! Gallery image ingestion.
//!
//! Each submitted file is checked, written under a fresh unique name and,
//! for JPEG/PNG, downscaled to fit the gallery frame. Oversized GIFs are
//! refused outright since resampling would drop their animation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_WIDTH: u32 = 1200;
pub const MAX_HEIGHT: u32 = 800;
pub const JPEG_QUALITY: u8 = 85;
/// Public URL prefix, relative to the site root.
pub const GALLERY_URL_PREFIX: &str = "assets/images/gallery/";

const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
const ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRejection {
    #[error("upload transport error: {0}")]
    Transport(String),
    #[error("empty file")]
    Empty,
    #[error("file exceeds 10 MiB")]
    TooLarge,
    #[error("extension {0:?} not allowed")]
    Extension(String),
    #[error("mime type {0:?} not allowed")]
    MimeType(String),
    #[error("gif larger than 1200x800")]
    GifTooLarge,
    #[error("not a readable image")]
    Undecodable,
    #[error("could not store file")]
    Storage,
}

/// One file as received from the multipart body.
#[derive(Debug, Clone, Default)]
pub struct SubmittedFile {
    pub file_name: String,
    pub declared_type: Option<String>,
    pub data: Vec<u8>,
    /// Set when the body for this part could not be read.
    pub transport_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedAsset {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadPipeline {
    dir: PathBuf,
    resize: bool,
}

impl UploadPipeline {
    /// `dir` is where files land; its public URL is [`GALLERY_URL_PREFIX`].
    pub fn new(dir: impl Into<PathBuf>, resize: bool) -> Self {
        Self {
            dir: dir.into(),
            resize,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keep every file that passes; rejected files are logged and skipped.
    pub fn ingest_all(&self, files: Vec<SubmittedFile>) -> Vec<UploadedAsset> {
        files
            .into_iter()
            .filter_map(|file| {
                let name = file.file_name.clone();
                match self.ingest(file) {
                    Ok(asset) => Some(asset),
                    Err(reason) => {
                        warn!(file = %name, %reason, "upload rejected");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn ingest(&self, file: SubmittedFile) -> Result<UploadedAsset, UploadRejection> {
        if let Some(e) = file.transport_error {
            return Err(UploadRejection::Transport(e));
        }
        if file.data.is_empty() || file.file_name.trim().is_empty() {
            return Err(UploadRejection::Empty);
        }
        if file.data.len() > MAX_UPLOAD_BYTES {
            return Err(UploadRejection::TooLarge);
        }

        let (stem, ext) = split_name(&file.file_name);
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(UploadRejection::Extension(ext));
        }
        let mime = detect_mime(&file.data, file.declared_type.as_deref(), &ext);
        if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
            return Err(UploadRejection::MimeType(mime));
        }

        let (name, dest) = self.write_unique(&sanitize_stem(&stem), &ext, &file.data)?;

        let dims = ImageReader::open(&dest)
            .and_then(|r| r.with_guessed_format())
            .ok()
            .and_then(|r| r.into_dimensions().ok());
        let Some((w, h)) = dims.filter(|(w, h)| *w > 0 && *h > 0) else {
            discard(&dest);
            return Err(UploadRejection::Undecodable);
        };

        match mime.as_str() {
            "image/gif" if w > MAX_WIDTH || h > MAX_HEIGHT => {
                discard(&dest);
                return Err(UploadRejection::GifTooLarge);
            }
            "image/jpeg" | "image/png" if self.resize => {
                if let Some((nw, nh)) = fit_within(w, h) {
                    if let Err(e) = downscale(&dest, &mime, nw, nh) {
                        warn!(file = %name, error = %e, "resize failed, keeping original");
                    } else {
                        debug!(file = %name, from = ?(w, h), to = ?(nw, nh), "image downscaled");
                    }
                }
            }
            _ => {}
        }

        info!(file = %name, bytes = file.data.len(), "image uploaded");
        Ok(UploadedAsset {
            url: format!("{GALLERY_URL_PREFIX}{name}"),
            name,
        })
    }

    /// Create `{stem}-{timestamp}-{6 hex}.{ext}` without clobbering anything.
    fn write_unique(
        &self,
        stem: &str,
        ext: &str,
        data: &[u8],
    ) -> Result<(String, PathBuf), UploadRejection> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            warn!(dir = %self.dir.display(), error = %e, "could not create upload dir");
            UploadRejection::Storage
        })?;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        for _ in 0..8 {
            let mut suffix = [0u8; 3];
            rand::thread_rng().fill(&mut suffix);
            let name = format!("{stem}-{stamp}-{}.{ext}", hex::encode(suffix));
            let dest = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&dest) {
                Ok(mut f) => {
                    if let Err(e) = f.write_all(data) {
                        warn!(file = %name, error = %e, "write failed");
                        discard(&dest);
                        return Err(UploadRejection::Storage);
                    }
                    return Ok((name, dest));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    warn!(file = %name, error = %e, "could not create file");
                    return Err(UploadRejection::Storage);
                }
            }
        }
        Err(UploadRejection::Storage)
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove rejected upload");
    }
}

/// Lowercased extension and the stem before it.
fn split_name(file_name: &str) -> (String, String) {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_owned(), ext.to_ascii_lowercase()),
        None => (base.to_owned(), String::new()),
    }
}

/// Runs of anything outside `[A-Za-z0-9_-]` collapse to a single `-`.
fn sanitize_stem(stem: &str) -> String {
    let mut out = String::with_capacity(stem.len());
    let mut in_run = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    if out.trim_matches('-').is_empty() {
        "image".to_owned()
    } else {
        out
    }
}

/// Sniffed type first, then the client's declared type, then the extension.
fn detect_mime(data: &[u8], declared: Option<&str>, ext: &str) -> String {
    if let Ok(format) = image::guess_format(data) {
        return format.to_mime_type().to_owned();
    }
    if let Some(declared) = declared.map(str::trim).filter(|d| !d.is_empty()) {
        return declared.to_ascii_lowercase();
    }
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
    .to_owned()
}

/// Target size fitting `MAX_WIDTH`x`MAX_HEIGHT`, or `None` if already inside.
pub fn fit_within(w: u32, h: u32) -> Option<(u32, u32)> {
    let scale = (MAX_WIDTH as f64 / w as f64)
        .min(MAX_HEIGHT as f64 / h as f64)
        .min(1.0);
    if scale >= 1.0 {
        return None;
    }
    let nw = ((w as f64 * scale).floor() as u32).max(1);
    let nh = ((h as f64 * scale).floor() as u32).max(1);
    Some((nw, nh))
}

fn downscale(path: &Path, mime: &str, width: u32, height: u32) -> anyhow::Result<()> {
    let img = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let resized = img.resize_exact(width, height, FilterType::Triangle);

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        if mime == "image/jpeg" {
            let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?;
        } else {
            let keep = if resized.color().has_alpha() {
                DynamicImage::ImageRgba8(resized.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(resized.to_rgb8())
            };
            keep.write_with_encoder(PngEncoder::new_with_quality(
                &mut out,
                CompressionType::Default,
                PngFilter::Adaptive,
            ))?;
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}
