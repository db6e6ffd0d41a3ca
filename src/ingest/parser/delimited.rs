use crate::ingest::errors::ImportFailure;
use crate::ingest::parser::RawRecord;
use crate::schema::FormatOptions;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord};
use tokio::io::AsyncRead;

/// Delimited text reader. Fields map to schema columns by position.
pub struct DelimitedReader<R> {
    reader: AsyncReader<R>,
    record: StringRecord,
    header_pending: bool,
    skip_remaining: usize,
    row_number: u64,
}

impl<R> DelimitedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(input: R, options: &FormatOptions) -> Result<Self, ImportFailure> {
        let delimiter = options
            .delimiter_byte()
            .map_err(ImportFailure::InvalidRequest)?;

        // header handled here so skip_rows counts data rows only
        let reader = AsyncReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .create_reader(input);

        Ok(Self {
            reader,
            record: StringRecord::new(),
            header_pending: options.has_header,
            skip_remaining: options.skip_rows,
            row_number: 0,
        })
    }

    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, ImportFailure> {
        loop {
            let more = self
                .reader
                .read_record(&mut self.record)
                .await
                .map_err(|err| ImportFailure::ParseStructure {
                    row: self.row_number + 1,
                    message: err.to_string(),
                })?;

            if !more {
                return Ok(None);
            }
            if self.header_pending {
                self.header_pending = false;
                continue;
            }
            if self.skip_remaining > 0 {
                self.skip_remaining -= 1;
                continue;
            }

            self.row_number += 1;
            return Ok(Some(RawRecord {
                row_number: self.row_number,
                fields: self.record.iter().map(|f| Some(f.to_string())).collect(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(input: &'static [u8], options: FormatOptions) -> Result<Vec<RawRecord>, ImportFailure> {
        let mut reader = DelimitedReader::new(input, &options)?;
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().await? {
            records.push(record);
        }
        Ok(records)
    }

    fn fields(record: &RawRecord) -> Vec<&str> {
        record
            .fields
            .iter()
            .map(|f| f.as_deref().unwrap_or("<none>"))
            .collect()
    }

    #[tokio::test]
    async fn test_header_and_skip_rows() {
        let options = FormatOptions {
            skip_rows: 1,
            ..FormatOptions::default()
        };
        let records = collect(b"id,name\n0,skipped\n1,alice\n2,\"b, ob\"\n", options)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].row_number, 1);
        assert_eq!(fields(&records[0]), vec!["1", "alice"]);
        assert_eq!(fields(&records[1]), vec!["2", "b, ob"]);
    }

    #[tokio::test]
    async fn test_custom_delimiter_without_header() {
        let options = FormatOptions {
            delimiter: ';',
            has_header: false,
            ..FormatOptions::default()
        };
        let records = collect(b"1;12,5\n2\n", options).await.unwrap();
        assert_eq!(fields(&records[0]), vec!["1", "12,5"]);
        assert_eq!(fields(&records[1]), vec!["2"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_fatal() {
        let err = collect(b"id\n1\n\xff\xfe\n", FormatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImportFailure::ParseStructure { row: 2, .. }));
    }

    #[test]
    fn test_non_ascii_delimiter_rejected() {
        let options = FormatOptions {
            delimiter: '¦',
            ..FormatOptions::default()
        };
        assert!(matches!(
            DelimitedReader::new(&b""[..], &options),
            Err(ImportFailure::InvalidRequest(_))
        ));
    }
}
