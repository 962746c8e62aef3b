//! Body intake: length-limited decoding for json/form/text/raw content
//! types, and a streaming multipart parser with three persistence
//! strategies.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{ErrorKind, PortwayError};

/// Per-content-type byte caps.
#[derive(Debug, Clone)]
pub struct BodyLimits {
    pub json: usize,
    pub form: usize,
    pub text: usize,
    pub raw: usize,
    pub multipart: MultipartLimits,
}

impl Default for BodyLimits {
    fn default() -> Self {
        BodyLimits {
            json: 1024 * 1024,
            form: 1024 * 1024,
            text: 1024 * 1024,
            raw: 5 * 1024 * 1024,
            multipart: MultipartLimits::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipartLimits {
    pub max_file_size: usize,
    pub max_total_size: usize,
    pub max_files: usize,
    pub max_field_size: usize,
}

impl Default for MultipartLimits {
    fn default() -> Self {
        MultipartLimits {
            max_file_size: 10 * 1024 * 1024,
            max_total_size: 50 * 1024 * 1024,
            max_files: 20,
            max_field_size: 1024 * 1024,
        }
    }
}

/// The decoded form of a non-multipart body, normalized to JSON so the
/// validation gate has a single representation to validate against.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Json(serde_json::Value),
    Form(HashMap<String, Vec<String>>),
    Text(String),
    Raw(Bytes),
    Empty,
}

impl DecodedBody {
    /// Project this body into the JSON value the validation gate consumes.
    pub fn as_validatable_json(&self) -> serde_json::Value {
        match self {
            DecodedBody::Json(v) => v.clone(),
            DecodedBody::Form(map) => serde_json::to_value(map).unwrap_or(serde_json::Value::Null),
            DecodedBody::Text(s) => serde_json::Value::String(s.clone()),
            DecodedBody::Raw(bytes) => serde_json::Value::String(format!("{} bytes", bytes.len())),
            DecodedBody::Empty => serde_json::Value::Null,
        }
    }
}

/// Decode `bytes` according to `content_type`, enforcing `limits`.
pub fn decode_body(
    content_type: &str,
    bytes: Bytes,
    limits: &BodyLimits,
) -> Result<DecodedBody, PortwayError> {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

    match mime.as_str() {
        "" => Ok(DecodedBody::Empty),
        "application/json" => {
            enforce_limit(bytes.len(), limits.json)?;
            serde_json::from_slice(&bytes)
                .map(DecodedBody::Json)
                .map_err(|err| {
                    PortwayError::new(ErrorKind::UnprocessableEntity, format!("malformed JSON body: {err}"))
                })
        }
        "application/x-www-form-urlencoded" => {
            enforce_limit(bytes.len(), limits.form)?;
            let mut map: HashMap<String, Vec<String>> = HashMap::new();
            for (key, value) in form_urlencoded::parse(&bytes) {
                map.entry(key.into_owned()).or_default().push(value.into_owned());
            }
            Ok(DecodedBody::Form(map))
        }
        m if m.starts_with("text/") => {
            enforce_limit(bytes.len(), limits.text)?;
            String::from_utf8(bytes.to_vec())
                .map(DecodedBody::Text)
                .map_err(|err| {
                    PortwayError::new(ErrorKind::UnprocessableEntity, format!("body is not valid UTF-8: {err}"))
                })
        }
        m if m.starts_with("multipart/") => Err(PortwayError::internal(
            "multipart bodies must be decoded via parse_multipart, not decode_body",
        )),
        _ => {
            enforce_limit(bytes.len(), limits.raw)?;
            Ok(DecodedBody::Raw(bytes))
        }
    }
}

fn enforce_limit(len: usize, limit: usize) -> Result<(), PortwayError> {
    if len > limit {
        return Err(PortwayError::new(
            ErrorKind::PayloadTooLarge,
            format!("body of {len} bytes exceeds the {limit}-byte limit"),
        ));
    }
    Ok(())
}

// ── Multipart ────────────────────────────────────────────────────────────

/// How an uploaded file's bytes are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStrategy {
    /// Collect the whole file into memory, bounded by `maxFileSize`.
    Memory,
    /// Spool the bytes for consumption through [`UploadedFile::reader`]'s
    /// async-read interface instead of the `data` buffer.
    Stream,
    /// Write each file to a temp path chunk-by-chunk and register a
    /// cleanup task.
    Temp,
}

impl PersistStrategy {
    /// Parse a route's `options.multipart.strategy` value. Unknown names
    /// fall back to `Memory`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "stream" => PersistStrategy::Stream,
            "temp" => PersistStrategy::Temp,
            _ => PersistStrategy::Memory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub strategy: PersistStrategy,
    /// Empty under the `temp` strategy; the bytes live at `temp_path`.
    pub data: Bytes,
    pub temp_path: Option<PathBuf>,
    size: usize,
}

impl UploadedFile {
    /// An in-memory file, as the `memory` strategy would have produced it.
    pub fn in_memory(
        field_name: impl Into<String>,
        file_name: Option<String>,
        content_type: Option<String>,
        data: Bytes,
    ) -> Self {
        UploadedFile {
            field_name: field_name.into(),
            file_name,
            content_type,
            strategy: PersistStrategy::Memory,
            size: data.len(),
            data,
            temp_path: None,
        }
    }

    /// The file's size as received, regardless of persistence strategy.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The file's bytes as an async reader: temp-spooled files are opened
    /// from disk, in-memory files read from their buffer. This is the
    /// consumption surface for the `stream` strategy.
    pub async fn reader(&self) -> std::io::Result<Pin<Box<dyn AsyncRead + Send>>> {
        match &self.temp_path {
            Some(path) => Ok(Box::pin(tokio::fs::File::open(path).await?)),
            None => Ok(Box::pin(std::io::Cursor::new(self.data.clone()))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartFields {
    pub text: HashMap<String, Vec<String>>,
}

/// A queued cleanup action (temp file removal) executed in a best-effort
/// settled batch on completion or failure of the request.
#[derive(Debug)]
pub struct CleanupTask {
    path: PathBuf,
}

impl CleanupTask {
    pub fn run(&self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "multipart temp file cleanup failed");
        }
    }
}

/// Run every queued cleanup task, ignoring individual failures so one
/// missing file doesn't abort the rest of the batch.
pub fn run_cleanup_batch(tasks: Vec<CleanupTask>) {
    for task in tasks {
        task.run();
    }
}

/// The fully-parsed outcome of a multipart request: text fields, uploaded
/// files (each carrying its own persistence strategy), and any cleanup
/// tasks the `temp` strategy registered.
#[derive(Debug)]
pub struct ParsedMultipart {
    pub fields: MultipartFields,
    pub files: HashMap<String, Vec<UploadedFile>>,
    pub cleanup_tasks: Vec<CleanupTask>,
}

impl ParsedMultipart {
    /// Split into the handler-visible body and the cleanup batch the
    /// pipeline owes the request.
    pub fn into_parts(self) -> (MultipartBody, Vec<CleanupTask>) {
        (
            MultipartBody { fields: self.fields, files: self.files },
            self.cleanup_tasks,
        )
    }
}

/// What a handler sees of a multipart request, stashed in
/// [`crate::context::Context::state`] by the pipeline.
pub struct MultipartBody {
    pub fields: MultipartFields,
    pub files: HashMap<String, Vec<UploadedFile>>,
}

/// Extract the multipart boundary from a `Content-Type` header value.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    multer::parse_boundary(content_type).ok()
}

/// Parse a `multipart/form-data` body from its wire byte stream. Parts
/// are consumed chunk-by-chunk and every cap is enforced as bytes arrive,
/// so an oversized upload aborts without buffering its remainder.
/// `strategy` picks how uploaded files are persisted; `temp_dir` is only
/// consulted for [`PersistStrategy::Temp`]. Temp files spooled before a
/// failure are removed before the error is returned.
pub async fn parse_multipart<S, E>(
    stream: S,
    boundary: String,
    limits: &MultipartLimits,
    strategy: PersistStrategy,
    temp_dir: &std::path::Path,
) -> Result<ParsedMultipart, PortwayError>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut cleanup_tasks = Vec::new();
    match collect_parts(&mut multipart, limits, strategy, temp_dir, &mut cleanup_tasks).await {
        Ok((fields, files)) => Ok(ParsedMultipart { fields, files, cleanup_tasks }),
        Err(err) => {
            run_cleanup_batch(cleanup_tasks);
            Err(err)
        }
    }
}

async fn collect_parts(
    multipart: &mut multer::Multipart<'static>,
    limits: &MultipartLimits,
    strategy: PersistStrategy,
    temp_dir: &std::path::Path,
    cleanup_tasks: &mut Vec<CleanupTask>,
) -> Result<(MultipartFields, HashMap<String, Vec<UploadedFile>>), PortwayError> {
    let mut fields = MultipartFields::default();
    let mut files: HashMap<String, Vec<UploadedFile>> = HashMap::new();
    let mut total_size: usize = 0;
    let mut file_count: usize = 0;
    let mut saw_any_part = false;

    loop {
        let field = multipart.next_field().await.map_err(unprocessable)?;
        let Some(mut field) = field else { break };
        saw_any_part = true;

        let field_name = field.name().unwrap_or("").to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(|m| m.to_string());

        if file_name.is_some() {
            file_count += 1;
            if file_count > limits.max_files {
                return Err(too_large(format!(
                    "multipart request exceeds the {}-file limit",
                    limits.max_files
                )));
            }

            let mut collected = BytesMut::new();
            let mut spool = match strategy {
                PersistStrategy::Temp => {
                    let path = temp_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), field_name));
                    let file = tokio::fs::File::create(&path).await?;
                    cleanup_tasks.push(CleanupTask { path: path.clone() });
                    Some((file, path))
                }
                PersistStrategy::Memory | PersistStrategy::Stream => None,
            };

            let mut size: usize = 0;
            while let Some(chunk) = field.chunk().await.map_err(unprocessable)? {
                size += chunk.len();
                if size > limits.max_file_size {
                    return Err(too_large(format!(
                        "file '{field_name}' exceeds the {}-byte limit",
                        limits.max_file_size
                    )));
                }
                if total_size + size > limits.max_total_size {
                    return Err(too_large(format!(
                        "multipart request exceeds the {}-byte total limit",
                        limits.max_total_size
                    )));
                }
                match &mut spool {
                    Some((file, _)) => file.write_all(&chunk).await?,
                    None => collected.extend_from_slice(&chunk),
                }
            }
            total_size += size;

            let (data, temp_path) = match spool {
                Some((mut file, path)) => {
                    file.flush().await?;
                    (Bytes::new(), Some(path))
                }
                None => (collected.freeze(), None),
            };

            files.entry(field_name.clone()).or_default().push(UploadedFile {
                field_name,
                file_name,
                content_type,
                strategy,
                data,
                temp_path,
                size,
            });
        } else {
            let mut collected = BytesMut::new();
            while let Some(chunk) = field.chunk().await.map_err(unprocessable)? {
                if collected.len() + chunk.len() > limits.max_field_size {
                    return Err(too_large(format!(
                        "field '{field_name}' exceeds the {}-byte limit",
                        limits.max_field_size
                    )));
                }
                collected.extend_from_slice(&chunk);
            }
            let text = String::from_utf8(collected.to_vec()).map_err(|err| {
                PortwayError::new(ErrorKind::UnprocessableEntity, err.to_string())
            })?;
            fields.text.entry(field_name).or_default().push(text);
        }
    }

    if !saw_any_part {
        return Err(PortwayError::new(
            ErrorKind::UnprocessableEntity,
            "No valid multipart data found",
        ));
    }

    Ok((fields, files))
}

fn unprocessable(err: multer::Error) -> PortwayError {
    PortwayError::new(ErrorKind::UnprocessableEntity, err.to_string())
}

fn too_large(message: String) -> PortwayError {
    PortwayError::new(ErrorKind::PayloadTooLarge, message)
}
