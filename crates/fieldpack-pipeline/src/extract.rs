//! MIME sniffing and best-effort text extraction.

use std::path::Path;

pub const OCTET_STREAM: &str = "application/octet-stream";

const TEXT_SUFFIXES: &[&str] = &[
  "md", "txt", "log", "json", "yaml", "yml", "py", "js", "ts", "html", "css", "csv", "xml", "toml",
];

/// MIME type guessed from the file extension.
pub fn detect_mime(path: &Path) -> &'static str {
  let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
  match ext.as_deref() {
    Some("txt" | "log") => "text/plain",
    Some("md") => "text/markdown",
    Some("csv") => "text/csv",
    Some("html" | "htm") => "text/html",
    Some("css") => "text/css",
    Some("xml") => "text/xml",
    Some("js") => "text/javascript",
    Some("py") => "text/x-python",
    Some("json") => "application/json",
    Some("yaml" | "yml") => "application/yaml",
    Some("toml") => "application/toml",
    Some("pdf") => "application/pdf",
    Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    Some("png") => "image/png",
    Some("jpg" | "jpeg") => "image/jpeg",
    Some("zip") => "application/zip",
    _ => OCTET_STREAM,
  }
}

/// Whether a file should be decoded as text.
pub fn is_text(path: &Path, mime: &str) -> bool {
  if mime.starts_with("text/") {
    return true;
  }
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| TEXT_SUFFIXES.contains(&e.to_ascii_lowercase().as_str()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
  pub text:     Option<String>,
  /// `utf8`, `latin1` or `none`.
  pub strategy: &'static str,
}

impl Extraction {
  pub fn none() -> Self { Self { text: None, strategy: "none" } }
}

/// Extract text from `bytes`. Never fails; unsupported content yields no
/// text with strategy `none`.
pub fn extract(path: &Path, mime: &str, bytes: &[u8]) -> Extraction {
  if !is_text(path, mime) {
    return Extraction::none();
  }
  match std::str::from_utf8(bytes) {
    Ok(text) => Extraction { text: Some(text.to_owned()), strategy: "utf8" },
    // Every byte is a valid Latin-1 code point.
    Err(_) => {
      Extraction { text: Some(bytes.iter().map(|&b| char::from(b)).collect()), strategy: "latin1" }
    }
  }
}
