//! Multipart form data.
//!
//! The whole body is collected first (the router buffers responses whole
//! anyway, and the configured max form size bounds the memory), then fed
//! to `multer` as a one-shot stream. Parsed values and files are cached on
//! the context so a form is parsed at most once per request.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use futures::future::ready;
use futures::stream::once;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ContextError;

/// The parsed content of a `multipart/form-data` body.
#[derive(Default)]
pub struct FormData {
    values: HashMap<String, Vec<String>>,
    files: HashMap<String, FormFile>,
}

impl FormData {
    /// Parses `body` using the boundary carried by `content_type`.
    pub(crate) async fn parse(content_type: &str, body: Bytes) -> Result<FormData, ContextError> {
        let boundary = multer::parse_boundary(content_type)?;
        let stream = once(ready(Ok::<Bytes, std::io::Error>(body)));
        let mut multipart = multer::Multipart::new(stream, boundary);

        let mut form = FormData::default();

        while let Some(field) = multipart.next_field().await? {
            let field_name = field.name().map(str::to_string);
            let file_name = field.file_name().map(str::to_string);
            let data = field.bytes().await?;

            let Some(field_name) = field_name else { continue };

            match file_name {
                Some(file_name) => {
                    form.files.insert(field_name, FormFile { name: file_name, data });
                }
                None => {
                    let value = String::from_utf8_lossy(&data).into_owned();
                    form.values.entry(field_name).or_default().push(value);
                }
            }
        }

        Ok(form)
    }

    /// The first value submitted under `key`, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    /// All values submitted under `key`.
    pub fn values(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// The file submitted under the field `key`, if any.
    pub fn file(&self, key: &str) -> Option<&FormFile> {
        self.files.get(key)
    }
}

/// One uploaded file of a multipart form.
pub struct FormFile {
    name: String,
    data: Bytes,
}

impl FormFile {
    /// The file name the client transmitted.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the file content in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// The raw file content.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Writes the file content into `writer`, returning the bytes written.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<u64, ContextError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.data).await?;
        Ok(self.data.len() as u64)
    }

    /// Saves the file content under `path`.
    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), ContextError> {
        let mut file = File::create(path).await?;
        self.write_to(&mut file).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "------------------------d74496d66958873e";

    fn multipart_body() -> (String, Bytes) {
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
             a plain value\r\n\
             --{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"f\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\n\
             file content here\r\n\
             --{BOUNDARY}--\r\n"
        );
        (content_type, Bytes::from(body))
    }

    #[tokio::test]
    async fn parses_values_and_files() {
        let (content_type, body) = multipart_body();
        let form = FormData::parse(&content_type, body).await.unwrap();

        assert_eq!(form.value("comment"), Some("a plain value"));

        let file = form.file("f").expect("file field should be present");
        assert_eq!(file.name(), "notes.txt");
        assert_eq!(file.size(), "file content here".len() as u64);
        assert_eq!(&file.bytes()[..], b"file content here");

        assert!(form.value("missing").is_none());
        assert!(form.file("missing").is_none());
    }

    #[tokio::test]
    async fn missing_boundary_is_an_error() {
        let result = FormData::parse("multipart/form-data", Bytes::new()).await;
        assert!(matches!(result, Err(ContextError::Form { .. })));
    }

    #[tokio::test]
    async fn file_writes_to_a_sink() {
        let (content_type, body) = multipart_body();
        let form = FormData::parse(&content_type, body).await.unwrap();
        let file = form.file("f").unwrap();

        let mut sink = Vec::new();
        let written = file.write_to(&mut sink).await.unwrap();

        assert_eq!(written, file.size());
        assert_eq!(sink, b"file content here");
    }
}
