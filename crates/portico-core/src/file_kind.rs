use serde::{Deserialize, Serialize};

/// Coarse file classification used by the search index and listings.
///
/// The numeric values are part of the wire/index format; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileKind {
    Unknown = 0,
    Folder = 1,
    Video = 2,
    Audio = 3,
    Text = 4,
    Image = 5,
    Office = 6,
    Document = 7,
}

impl FileKind {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Folder,
            2 => Self::Video,
            3 => Self::Audio,
            4 => Self::Text,
            5 => Self::Image,
            6 => Self::Office,
            7 => Self::Document,
            _ => Self::Unknown,
        }
    }

    /// Classify by file name extension.
    pub fn from_name(name: &str) -> Self {
        let ext = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
            _ => return Self::Unknown,
        };

        match ext.as_str() {
            "mp4" | "mkv" | "webm" | "mov" | "avi" | "flv" | "m4v" | "ts" => Self::Video,
            "mp3" | "flac" | "wav" | "ogg" | "aac" | "m4a" | "opus" => Self::Audio,
            "txt" | "md" | "log" | "json" | "yaml" | "yml" | "toml" | "xml" | "csv" | "ini"
            | "rs" | "js" | "py" | "go" | "c" | "h" | "sh" | "html" | "css" => Self::Text,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "svg" | "ico" | "avif" | "heic" => {
                Self::Image
            }
            "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "odt" | "ods" | "odp" => {
                Self::Office
            }
            "pdf" | "epub" | "mobi" => Self::Document,
            _ => Self::Unknown,
        }
    }
}
