//! MIME type guessing for remote files.

use crate::vfs::FileType;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
pub const SYMLINK_MIME_TYPE: &str = "x-special/symlink";

// sorted by extension, compared case-insensitively.
static BY_EXTENSION: &[(&str, &str)] = &[
    ("7z", "application/x-7z-compressed"),
    ("avi", "video/x-msvideo"),
    ("bmp", "image/bmp"),
    ("bz2", "application/x-bzip"),
    ("c", "text/x-csrc"),
    ("cpp", "text/x-c++src"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("deb", "application/vnd.debian.binary-package"),
    ("doc", "application/msword"),
    ("flac", "audio/flac"),
    ("gif", "image/gif"),
    ("gz", "application/x-gzip"),
    ("h", "text/x-chdr"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("iso", "application/x-cd-image"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("md", "text/markdown"),
    ("mkv", "video/x-matroska"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("ogg", "audio/ogg"),
    ("pdf", "application/pdf"),
    ("pl", "application/x-perl"),
    ("png", "image/png"),
    ("ps", "application/postscript"),
    ("py", "text/x-python"),
    ("rpm", "application/x-rpm"),
    ("rs", "text/rust"),
    ("sh", "application/x-shellscript"),
    ("svg", "image/svg+xml"),
    ("tar", "application/x-tar"),
    ("tex", "text/x-tex"),
    ("tgz", "application/x-compressed-tar"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("toml", "application/toml"),
    ("txt", "text/plain"),
    ("wav", "audio/x-wav"),
    ("webp", "image/webp"),
    ("xml", "application/xml"),
    ("xz", "application/x-xz"),
    ("zip", "application/zip"),
];

/// Guess a MIME type from a file name's extension.
pub fn from_name(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_ascii_lowercase(),
        _ => return DEFAULT_MIME_TYPE,
    };
    BY_EXTENSION
        .binary_search_by(|(e, _)| (*e).cmp(ext.as_str()))
        .map(|i| BY_EXTENSION[i].1)
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// The MIME type of something that is not a regular file.
pub fn from_file_type(typ: FileType) -> Option<&'static str> {
    match typ {
        FileType::Directory => Some("x-directory/normal"),
        FileType::CharacterDevice => Some("x-special/device-char"),
        FileType::BlockDevice => Some("x-special/device-block"),
        FileType::Fifo => Some("x-special/fifo"),
        FileType::Socket => Some("x-special/socket"),
        FileType::SymbolicLink => Some(SYMLINK_MIME_TYPE),
        FileType::Regular | FileType::Unknown => None,
    }
}
