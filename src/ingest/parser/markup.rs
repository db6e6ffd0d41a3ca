//! Markup (XML) record reader.
//!
//! Expected shape: a root element holding repeated row elements, each
//! holding one element per column in schema order. Column element names are
//! not checked; position decides the column.

use crate::ingest::errors::ImportFailure;
use crate::ingest::parser::RawRecord;
use crate::schema::FormatOptions;
use quick_xml::Reader;
use quick_xml::events::Event;
use tokio::io::{AsyncRead, BufReader};

/// Owned view of the reader events the record walk cares about.
#[derive(Debug, PartialEq)]
enum Token {
    Open(String),
    Close,
    Leaf(String),
    Text(String),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    BeforeRoot,
    InRoot,
    Done,
}

pub struct MarkupReader<R> {
    reader: Reader<BufReader<R>>,
    buf: Vec<u8>,
    root_element: Option<String>,
    row_element: Option<String>,
    state: State,
    row_number: u64,
}

impl<R> MarkupReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(input: R, options: &FormatOptions) -> Self {
        let mut reader = Reader::from_reader(BufReader::new(input));
        reader.config_mut().trim_text(true);

        Self {
            reader,
            buf: Vec::new(),
            root_element: options.root_element.clone(),
            row_element: options.row_element.clone(),
            state: State::BeforeRoot,
            row_number: 0,
        }
    }

    fn structure_error(&self, message: impl Into<String>) -> ImportFailure {
        ImportFailure::ParseStructure {
            row: self.row_number + 1,
            message: message.into(),
        }
    }

    async fn next_token(&mut self) -> Result<Token, ImportFailure> {
        loop {
            self.buf.clear();
            let row = self.row_number + 1;
            let fail = |message: String| ImportFailure::ParseStructure { row, message };

            let event = self
                .reader
                .read_event_into_async(&mut self.buf)
                .await
                .map_err(|err| fail(err.to_string()))?;

            let token = match event {
                Event::Start(e) => Token::Open(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                Event::End(_) => Token::Close,
                Event::Empty(e) => Token::Leaf(String::from_utf8_lossy(e.name().as_ref()).into_owned()),
                Event::Text(e) => Token::Text(
                    e.unescape()
                        .map_err(|err| fail(err.to_string()))?
                        .into_owned(),
                ),
                Event::CData(e) => Token::Text(
                    String::from_utf8(e.into_inner().into_owned())
                        .map_err(|err| fail(err.to_string()))?,
                ),
                Event::Eof => Token::Eof,
                _ => continue,
            };
            return Ok(token);
        }
    }

    /// Consume tokens up to and including the close of an element already opened.
    async fn skip_element(&mut self) -> Result<(), ImportFailure> {
        let mut depth = 0usize;
        loop {
            match self.next_token().await? {
                Token::Open(_) => depth += 1,
                Token::Close if depth == 0 => return Ok(()),
                Token::Close => depth -= 1,
                Token::Eof => return Err(self.structure_error("unexpected end of document")),
                Token::Leaf(_) | Token::Text(_) => {}
            }
        }
    }

    /// Direct text of a column element; text of nested elements is ignored.
    async fn read_column(&mut self) -> Result<String, ImportFailure> {
        let mut text = String::new();
        let mut depth = 0usize;
        loop {
            match self.next_token().await? {
                Token::Text(t) if depth == 0 => text.push_str(&t),
                Token::Open(_) => depth += 1,
                Token::Close if depth == 0 => return Ok(text),
                Token::Close => depth -= 1,
                Token::Eof => return Err(self.structure_error("unexpected end of document")),
                Token::Leaf(_) | Token::Text(_) => {}
            }
        }
    }

    async fn read_row(&mut self) -> Result<RawRecord, ImportFailure> {
        let mut fields = Vec::new();
        loop {
            match self.next_token().await? {
                Token::Open(_) => {
                    let text = self.read_column().await?;
                    fields.push(Some(text));
                }
                Token::Leaf(_) => fields.push(Some(String::new())),
                Token::Text(_) => {}
                Token::Close => break,
                Token::Eof => return Err(self.structure_error("unexpected end of document")),
            }
        }

        self.row_number += 1;
        Ok(RawRecord {
            row_number: self.row_number,
            fields,
        })
    }

    async fn enter_root(&mut self) -> Result<(), ImportFailure> {
        loop {
            match self.next_token().await? {
                Token::Open(name) => {
                    if let Some(expected) = &self.root_element {
                        if *expected != name {
                            return Err(self.structure_error(format!(
                                "expected root element <{}>, found <{}>",
                                expected, name
                            )));
                        }
                    }
                    self.state = State::InRoot;
                    return Ok(());
                }
                Token::Leaf(_) | Token::Eof => {
                    self.state = State::Done;
                    return Ok(());
                }
                Token::Text(_) => {}
                Token::Close => return Err(self.structure_error("closing tag before root element")),
            }
        }
    }

    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, ImportFailure> {
        if self.state == State::BeforeRoot {
            self.enter_root().await?;
        }

        while self.state == State::InRoot {
            match self.next_token().await? {
                Token::Open(name) => {
                    let row_element = self.row_element.get_or_insert_with(|| name.clone());
                    if *row_element == name {
                        return self.read_row().await.map(Some);
                    }
                    self.skip_element().await?;
                }
                Token::Leaf(name) => {
                    // empty rows carry no data
                    self.row_element.get_or_insert(name);
                }
                Token::Text(_) => {}
                Token::Close => self.state = State::Done,
                Token::Eof => return Err(self.structure_error("unexpected end of document")),
            }
        }

        Ok(None)
    }
}
