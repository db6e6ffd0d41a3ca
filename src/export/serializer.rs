//! Row serializers for delimited text and markup output.

use crate::export::ExportError;
use crate::schema::{FileFormat, FormatOptions};
use crate::value::Value;
use csv_async::{AsyncWriter, AsyncWriterBuilder};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use regex::Regex;
use std::sync::OnceLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};

const DEFAULT_ROOT_ELEMENT: &str = "rows";
const DEFAULT_ROW_ELEMENT: &str = "row";

static INVALID_NAME_CHARS: OnceLock<Regex> = OnceLock::new();

fn invalid_name_chars() -> &'static Regex {
    INVALID_NAME_CHARS
        .get_or_init(|| Regex::new(r"[^A-Za-z0-9_.\-]").expect("Invalid element name regex"))
}

/// Turn an arbitrary column name into a valid element name.
///
/// Disallowed characters become `_`, and a name that does not start with a
/// letter or underscore gets a leading `_`: `"3rd Party!"` → `"_3rd_Party_"`.
pub fn sanitize_element_name(name: &str) -> String {
    let mut sanitized = invalid_name_chars().replace_all(name, "_").into_owned();
    let valid_start = sanitized
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start {
        sanitized.insert(0, '_');
    }
    sanitized
}

fn xml_error(err: impl std::fmt::Display) -> ExportError {
    ExportError::Serialize(err.to_string())
}

/// Streams markup rows; each row is rendered into a scratch buffer first.
pub struct MarkupSerializer<W> {
    sink: W,
    root: String,
    row: String,
    columns: Vec<String>,
    scratch: Vec<u8>,
}

impl<W> MarkupSerializer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(sink: W, columns: &[String], options: &FormatOptions) -> Self {
        let element = |configured: &Option<String>, default: &str| {
            sanitize_element_name(configured.as_deref().unwrap_or(default))
        };

        Self {
            sink,
            root: element(&options.root_element, DEFAULT_ROOT_ELEMENT),
            row: element(&options.row_element, DEFAULT_ROW_ELEMENT),
            columns: columns.iter().map(|c| sanitize_element_name(c)).collect(),
            scratch: Vec::with_capacity(1024),
        }
    }

    async fn flush_scratch(&mut self) -> Result<(), ExportError> {
        self.sink.write_all(&self.scratch).await?;
        self.scratch.clear();
        Ok(())
    }

    pub async fn begin(&mut self) -> Result<(), ExportError> {
        let mut writer = Writer::new(&mut self.scratch);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::Start(BytesStart::new(self.root.as_str())))
            .map_err(xml_error)?;
        self.scratch.push(b'\n');
        self.flush_scratch().await
    }

    /// Write one row. Every column gets an element, in column order; null
    /// values are written as empty elements.
    pub async fn write_row(&mut self, values: &[Value]) -> Result<(), ExportError> {
        let mut writer = Writer::new(&mut self.scratch);
        writer
            .write_event(Event::Start(BytesStart::new(self.row.as_str())))
            .map_err(xml_error)?;

        for (name, value) in self.columns.iter().zip(values) {
            let Some(text) = value.export_text() else {
                writer
                    .write_event(Event::Empty(BytesStart::new(name.as_str())))
                    .map_err(xml_error)?;
                continue;
            };
            writer
                .write_event(Event::Start(BytesStart::new(name.as_str())))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(&text)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesEnd::new(name.as_str())))
                .map_err(xml_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new(self.row.as_str())))
            .map_err(xml_error)?;
        self.scratch.push(b'\n');
        self.flush_scratch().await
    }

    pub async fn finish(mut self) -> Result<W, ExportError> {
        let mut writer = Writer::new(&mut self.scratch);
        writer
            .write_event(Event::End(BytesEnd::new(self.root.as_str())))
            .map_err(xml_error)?;
        self.scratch.push(b'\n');
        self.flush_scratch().await?;
        self.sink.flush().await?;
        Ok(self.sink)
    }
}

/// Format-independent serializer over an async sink.
pub enum RowSerializer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    Delimited {
        writer: AsyncWriter<W>,
        header: Option<Vec<String>>,
    },
    Markup(MarkupSerializer<W>),
}

impl<W> RowSerializer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        format: FileFormat,
        sink: W,
        columns: &[String],
        options: &FormatOptions,
    ) -> Result<Self, ExportError> {
        Ok(match format {
            FileFormat::Delimited => {
                let delimiter = options
                    .delimiter_byte()
                    .map_err(ExportError::InvalidRequest)?;
                let writer = AsyncWriterBuilder::new()
                    .delimiter(delimiter)
                    .has_headers(false)
                    .create_writer(sink);
                RowSerializer::Delimited {
                    writer,
                    header: options.has_header.then(|| columns.to_vec()),
                }
            }
            FileFormat::Markup => RowSerializer::Markup(MarkupSerializer::new(sink, columns, options)),
        })
    }

    pub async fn begin(&mut self) -> Result<(), ExportError> {
        match self {
            RowSerializer::Delimited { writer, header } => {
                if let Some(names) = header.take() {
                    writer.write_record(&names).await?;
                }
                Ok(())
            }
            RowSerializer::Markup(markup) => markup.begin().await,
        }
    }

    pub async fn write_row(&mut self, values: &[Value]) -> Result<(), ExportError> {
        match self {
            RowSerializer::Delimited { writer, .. } => {
                let fields: Vec<String> = values
                    .iter()
                    .map(|v| v.export_text().unwrap_or_default())
                    .collect();
                writer.write_record(&fields).await?;
                Ok(())
            }
            RowSerializer::Markup(markup) => markup.write_row(values).await,
        }
    }

    /// Flush everything and hand the sink back.
    pub async fn finish(self) -> Result<W, ExportError> {
        match self {
            RowSerializer::Delimited { writer, .. } => {
                let mut sink = writer
                    .into_inner()
                    .await
                    .map_err(|err| ExportError::Serialize(err.to_string()))?;
                sink.flush().await?;
                Ok(sink)
            }
            RowSerializer::Markup(markup) => markup.finish().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sample() -> Vec<Value> {
        vec![
            Value::Int(1),
            Value::Text("Ann, \"A\"".to_string()),
            Value::Null,
            Value::Date(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()),
            Value::Bool(true),
        ]
    }

    async fn render(format: FileFormat, options: FormatOptions, columns: &[&str]) -> String {
        let mut serializer =
            RowSerializer::new(format, Vec::new(), &names(columns), &options).unwrap();
        serializer.begin().await.unwrap();
        serializer.write_row(&sample()).await.unwrap();
        let bytes = serializer.finish().await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_sanitize_element_name() {
        assert_eq!(sanitize_element_name("3rd Party!"), "_3rd_Party_");
        assert_eq!(sanitize_element_name("first name"), "first_name");
        assert_eq!(sanitize_element_name("a.b-c_d"), "a.b-c_d");
        assert_eq!(sanitize_element_name(""), "_");
        assert_eq!(sanitize_element_name("-x"), "_-x");
    }

    #[tokio::test]
    async fn test_delimited_output() {
        let out = render(
            FileFormat::Delimited,
            FormatOptions::default(),
            &["id", "name", "note", "born", "active"],
        )
        .await;
        assert_eq!(
            out,
            "id,name,note,born,active\n1,\"Ann, \"\"A\"\"\",,2024-03-09 00:00:00,true\n"
        );
    }

    #[tokio::test]
    async fn test_delimited_without_header() {
        let options = FormatOptions {
            delimiter: ';',
            has_header: false,
            ..FormatOptions::default()
        };
        let out = render(FileFormat::Delimited, options, &["id", "name", "note", "born", "active"]).await;
        assert_eq!(out, "1;\"Ann, \"\"A\"\"\";;2024-03-09 00:00:00;true\n");
    }

    #[tokio::test]
    async fn test_markup_output_writes_nulls_as_empty_elements() {
        let out = render(
            FileFormat::Markup,
            FormatOptions::default(),
            &["id", "full name", "note", "born", "3rd Party!"],
        )
        .await;
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><rows>\n\
             <row><id>1</id><full_name>Ann, &quot;A&quot;</full_name><note/>\
             <born>2024-03-09 00:00:00</born><_3rd_Party_>true</_3rd_Party_></row>\n\
             </rows>\n"
        );
    }
}
