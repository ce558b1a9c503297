//! Projection of raw search results onto the fixed output table.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::NaiveDate;
use docpipe_core::FIELDS_TO_KEEP;
use regex::Regex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span};

static PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("page number pattern"));

/// Problems with a single raw item.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("raw item is not a JSON object")]
    NotAnObject,
    #[error("`{field}` has an unexpected shape: {value}")]
    UnexpectedShape { field: &'static str, value: String },
    #[error("`{field}` date parts {value} do not form a date")]
    DateParts { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("reading {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("creating {}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a JSON array", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("raw item {index}")]
    Record {
        index: usize,
        #[source]
        source: RecordError,
    },
    #[error("writing table")]
    Csv(#[from] csv::Error),
}

/// One output row. Pass-through columns keep the source JSON value so lists
/// and numbers render the same way they arrived.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedRecord {
    pub title: String,
    pub publisher: Option<JsonValue>,
    pub kind: Option<JsonValue>,
    pub doi: Option<JsonValue>,
    pub isbn: Option<JsonValue>,
    pub author: Vec<String>,
    pub page: Option<JsonValue>,
    pub page_count: i64,
    pub references_count: Option<JsonValue>,
    pub is_referenced_by_count: Option<JsonValue>,
    pub published_date: Option<NaiveDate>,
    pub journal_issue: Option<JsonValue>,
    pub indexed_date: Option<NaiveDate>,
    pub subject: Option<JsonValue>,
    pub editor: Option<JsonValue>,
    pub event_name: Option<JsonValue>,
    pub event_location: Option<JsonValue>,
    pub publisher_location: Option<JsonValue>,
}

impl NormalizedRecord {
    pub fn from_raw(item: &JsonValue) -> Result<Self, RecordError> {
        let flat = flatten_record(item)?;
        let take = |column: &str| flat.get(column).filter(|v| !v.is_null()).cloned();

        Ok(Self {
            title: derive_title(flat.get("title")),
            publisher: take("publisher"),
            kind: take("type"),
            doi: take("DOI"),
            isbn: take("ISBN"),
            author: derive_authors(flat.get("author"))?,
            page: take("page"),
            page_count: page_count(&page_text(flat.get("page"))?),
            references_count: take("references-count"),
            is_referenced_by_count: take("is-referenced-by-count"),
            published_date: derive_date("published.date-parts", flat.get("published.date-parts"))?,
            journal_issue: take("journal-issue.issue"),
            indexed_date: derive_date("indexed.date-parts", flat.get("indexed.date-parts"))?,
            subject: take("subject"),
            editor: take("editor"),
            event_name: take("event.name"),
            event_location: take("event.location"),
            publisher_location: take("publisher-location"),
        })
    }

    /// Cells in `FIELDS_TO_KEEP` order.
    pub fn cells(&self) -> Vec<String> {
        let date = |d: &Option<NaiveDate>| {
            d.map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        };
        vec![
            self.title.clone(),
            render_cell(self.publisher.as_ref()),
            render_cell(self.kind.as_ref()),
            render_cell(self.doi.as_ref()),
            render_cell(self.isbn.as_ref()),
            serde_json::to_string(&self.author).unwrap_or_default(),
            render_cell(self.page.as_ref()),
            self.page_count.to_string(),
            render_cell(self.references_count.as_ref()),
            render_cell(self.is_referenced_by_count.as_ref()),
            date(&self.published_date),
            render_cell(self.journal_issue.as_ref()),
            date(&self.indexed_date),
            render_cell(self.subject.as_ref()),
            render_cell(self.editor.as_ref()),
            render_cell(self.event_name.as_ref()),
            render_cell(self.event_location.as_ref()),
            render_cell(self.publisher_location.as_ref()),
        ]
    }
}

/// Flatten nested objects into dotted column names. Lists stay leaf values.
pub fn flatten_record(item: &JsonValue) -> Result<BTreeMap<String, JsonValue>, RecordError> {
    let JsonValue::Object(map) = item else {
        return Err(RecordError::NotAnObject);
    };
    let mut flat = BTreeMap::new();
    for (key, value) in map {
        flatten_into(key.clone(), value, &mut flat);
    }
    Ok(flat)
}

fn flatten_into(prefix: String, value: &JsonValue, out: &mut BTreeMap<String, JsonValue>) {
    match value {
        JsonValue::Object(map) => {
            for (key, nested) in map {
                flatten_into(format!("{prefix}.{key}"), nested, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

fn render_cell(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn derive_title(value: Option<&JsonValue>) -> String {
    match value {
        Some(JsonValue::Array(titles)) => match titles.first() {
            Some(first) if !first.is_null() => render_cell(Some(first)),
            _ => " ".to_string(),
        },
        None | Some(JsonValue::Null) => " ".to_string(),
        Some(other) => render_cell(Some(other)),
    }
}

/// `"<given> <family>"` for each author carrying a family name.
pub fn derive_authors(value: Option<&JsonValue>) -> Result<Vec<String>, RecordError> {
    let authors = match value {
        None | Some(JsonValue::Null) => return Ok(vec![String::new()]),
        Some(JsonValue::Array(authors)) => authors,
        Some(other) => {
            return Err(RecordError::UnexpectedShape {
                field: "author",
                value: other.to_string(),
            })
        }
    };

    Ok(authors
        .iter()
        .filter_map(|author| {
            let family = author.get("family")?;
            let family = render_cell(Some(family));
            Some(match author.get("given") {
                Some(given) => format!("{} {family}", render_cell(Some(given))),
                None => family,
            })
        })
        .collect())
}

fn page_text(value: Option<&JsonValue>) -> Result<String, RecordError> {
    match value {
        None | Some(JsonValue::Null) => Ok("0".to_string()),
        Some(JsonValue::String(s)) => Ok(s.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(RecordError::UnexpectedShape {
            field: "page",
            value: other.to_string(),
        }),
    }
}

/// Pages covered by a range such as `"123-133"`; 0 unless exactly two numbers appear.
pub fn page_count(page_range: &str) -> i64 {
    let numbers = PAGE_NUMBER
        .find_iter(page_range)
        .map(|m| m.as_str().parse::<i64>())
        .collect::<Result<Vec<_>, _>>();
    match numbers.as_deref() {
        Ok([start, end]) => end
            .checked_sub(*start)
            .and_then(|span| span.checked_add(1))
            .unwrap_or(0),
        _ => 0,
    }
}

fn derive_date(
    field: &'static str,
    value: Option<&JsonValue>,
) -> Result<Option<NaiveDate>, RecordError> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(parts) => date_from_parts(parts)
            .map(Some)
            .ok_or_else(|| RecordError::DateParts {
                field,
                value: parts.to_string(),
            }),
    }
}

/// `[[2023, 2, 1]]` -> 2023-02-01. Missing month or day default to 1.
pub fn date_from_parts(parts: &JsonValue) -> Option<NaiveDate> {
    let first = parts.as_array()?.first()?.as_array()?;
    let joined = first
        .iter()
        .map(|part| match part {
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::String(s) => Some(s.clone()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?
        .join("-");
    parse_mixed_date(&joined)
}

fn parse_mixed_date(text: &str) -> Option<NaiveDate> {
    let fields = text
        .split('-')
        .map(|f| f.trim().parse::<u32>().ok())
        .collect::<Option<Vec<_>>>()?;
    let (year, month, day) = match fields.as_slice() {
        [y] => (*y, 1, 1),
        [y, m] => (*y, *m, 1),
        [y, m, d] => (*y, *m, *d),
        _ => return None,
    };
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
}

pub fn normalize_items(items: &[JsonValue]) -> Result<Vec<NormalizedRecord>, TransformError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            NormalizedRecord::from_raw(item)
                .map_err(|source| TransformError::Record { index, source })
        })
        .collect()
}

/// Write records as CSV with a leading unnamed row-index column.
pub fn write_table<W: Write>(records: &[NormalizedRecord], out: W) -> Result<(), TransformError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(std::iter::once("").chain(FIELDS_TO_KEEP))?;
    for (index, record) in records.iter().enumerate() {
        writer.write_record(std::iter::once(index.to_string()).chain(record.cells()))?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

/// Read the raw store at `source`, normalize every item and write the table to `dest`.
/// Returns the number of rows written.
pub fn transform(source: &Path, dest: &Path) -> Result<usize, TransformError> {
    let span = info_span!("transform", source = %source.display(), dest = %dest.display());
    let _guard = span.enter();

    let bytes = fs::read(source).map_err(|err| TransformError::Read {
        path: source.to_path_buf(),
        source: err,
    })?;
    let items: Vec<JsonValue> = serde_json::from_slice(&bytes).map_err(|err| TransformError::Json {
        path: source.to_path_buf(),
        source: err,
    })?;
    debug!(items = items.len(), "loaded raw store");

    let records = normalize_items(&items)?;
    let file = fs::File::create(dest).map_err(|err| TransformError::Create {
        path: dest.to_path_buf(),
        source: err,
    })?;
    write_table(&records, file)?;

    info!(rows = records.len(), "wrote output table");
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_items(name: &str) -> Vec<JsonValue> {
        let path = workspace_root().join("fixtures").join("works").join(name);
        let text = fs::read_to_string(&path).expect("read fixture");
        let envelope: JsonValue = serde_json::from_str(&text).expect("parse fixture");
        envelope["message"]["items"]
            .as_array()
            .expect("items")
            .clone()
    }

    fn read_table(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = csv::Reader::from_path(path).expect("open csv");
        let headers = reader
            .headers()
            .expect("headers")
            .iter()
            .map(str::to_string)
            .collect();
        let rows = reader
            .records()
            .map(|r| r.expect("row").iter().map(str::to_string).collect())
            .collect();
        (headers, rows)
    }

    fn column(headers: &[String], name: &str) -> usize {
        headers.iter().position(|h| h == name).expect(name)
    }

    #[test]
    fn page_count_handles_ranges_and_noise() {
        assert_eq!(page_count("123-133"), 11);
        assert_eq!(page_count("e123-e133"), 11);
        assert_eq!(page_count("xyz"), 0);
        assert_eq!(page_count("0"), 0);
        assert_eq!(page_count("1-2-3"), 0);
        assert_eq!(page_count("99999999999999999999-1"), 0);
        assert_eq!(page_count("0-9223372036854775807"), 0);
    }

    #[test]
    fn oversized_page_range_counts_as_zero() {
        let record = NormalizedRecord::from_raw(&json!({"page": "0-9223372036854775807"})).unwrap();
        assert_eq!(record.page_count, 0);
    }

    #[test]
    fn authors_join_given_and_family() {
        assert_eq!(
            derive_authors(Some(&json!([{"family": "Test Author"}]))).unwrap(),
            vec!["Test Author"]
        );
        assert_eq!(
            derive_authors(Some(&json!([{"given": "Jane", "family": "Doe"}]))).unwrap(),
            vec!["Jane Doe"]
        );
        assert_eq!(
            derive_authors(Some(&json!([
                {"given": "No", "name": "Family"},
                {"family": "Kept"}
            ])))
            .unwrap(),
            vec!["Kept"]
        );
    }

    #[test]
    fn missing_authors_default_to_one_empty_name() {
        assert_eq!(derive_authors(None).unwrap(), vec![String::new()]);
        assert!(matches!(
            derive_authors(Some(&json!("Doe"))),
            Err(RecordError::UnexpectedShape { field: "author", .. })
        ));
    }

    #[test]
    fn title_takes_first_entry_or_a_space() {
        assert_eq!(derive_title(Some(&json!(["First", "Second"]))), "First");
        assert_eq!(derive_title(Some(&json!("Plain"))), "Plain");
        assert_eq!(derive_title(Some(&json!([]))), " ");
        assert_eq!(derive_title(None), " ");
    }

    #[test]
    fn date_parts_parse_with_partial_precision() {
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(date_from_parts(&json!([[2023, 2, 1]])), Some(d(2023, 2, 1)));
        assert_eq!(date_from_parts(&json!([[2023, 7]])), Some(d(2023, 7, 1)));
        assert_eq!(date_from_parts(&json!([[2023]])), Some(d(2023, 1, 1)));
        assert_eq!(date_from_parts(&json!([["2023", "11", "30"]])), Some(d(2023, 11, 30)));
        assert_eq!(date_from_parts(&json!([[null]])), None);
        assert_eq!(date_from_parts(&json!([])), None);
        assert_eq!(date_from_parts(&json!([[2023, 13, 1]])), None);
    }

    #[test]
    fn malformed_date_parts_fail_the_record() {
        let err = NormalizedRecord::from_raw(&json!({
            "indexed": {"date-parts": "2023-02-01"}
        }))
        .unwrap_err();
        assert!(matches!(
            err,
            RecordError::DateParts { field: "indexed.date-parts", .. }
        ));
    }

    #[test]
    fn nested_objects_flatten_to_dotted_columns() {
        let record = NormalizedRecord::from_raw(&json!({
            "title": ["Proceedings"],
            "journal-issue": {"issue": "4", "published-print": {"date-parts": [[2020]]}},
            "event": {"name": "RustConf", "location": "Portland"},
            "published": {"date-parts": [[2020, 9, 10]]},
            "indexed": {"date-parts": [[2024, 1, 5]], "timestamp": 1704412800}
        }))
        .unwrap();

        assert_eq!(record.journal_issue, Some(json!("4")));
        assert_eq!(record.event_name, Some(json!("RustConf")));
        assert_eq!(record.event_location, Some(json!("Portland")));
        assert_eq!(record.published_date, NaiveDate::from_ymd_opt(2020, 9, 10));
        assert_eq!(record.indexed_date, NaiveDate::from_ymd_opt(2024, 1, 5));
        assert_eq!(record.page_count, 0);
    }

    #[test]
    fn non_object_items_are_rejected_with_their_index() {
        let err = normalize_items(&[json!({"title": ["ok"]}), json!(42)]).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Record {
                index: 1,
                source: RecordError::NotAnObject
            }
        ));
    }

    #[test]
    fn single_item_page_yields_one_projected_row() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("raw.json");
        let dest = dir.path().join("out.csv");
        fs::write(
            &source,
            serde_json::to_vec(&fixture_items("single_page.json")).unwrap(),
        )
        .unwrap();

        let rows_written = transform(&source, &dest).expect("transform");

        assert_eq!(rows_written, 1);
        let (headers, rows) = read_table(&dest);
        let mut expected = vec![String::new()];
        expected.extend(FIELDS_TO_KEEP.iter().map(|f| f.to_string()));
        assert_eq!(headers, expected);
        assert!(!headers.iter().any(|h| h == "URL" || h == "issn"));
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row[0], "0");
        assert_eq!(row[column(&headers, "title")], "Test Title");
        assert_eq!(row[column(&headers, "author")], r#"["Test Author"]"#);
        assert_eq!(row[column(&headers, "page")], "123-133");
        assert_eq!(row[column(&headers, "page-count")], "11");
        assert_eq!(row[column(&headers, "ISBN")], r#"["978-1-2345678-9"]"#);
        assert_eq!(row[column(&headers, "publisher")], "Test Publisher");
        assert_eq!(row[column(&headers, "published-date")], "");
    }

    #[test]
    fn absent_columns_are_filled_with_empty_strings() {
        let mut out = Vec::new();
        let records = normalize_items(&[json!({"title": ["A"]}), json!({"title": ["B"]})]).unwrap();
        write_table(&records, &mut out).unwrap();

        let mut reader = csv::Reader::from_reader(out.as_slice());
        let headers = reader.headers().unwrap().clone();
        let idx = headers.iter().position(|h| h == "event.location").unwrap();
        let rows: Vec<_> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(&row[idx], "");
        }
    }

    #[test]
    fn empty_raw_store_writes_header_only() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("raw.json");
        let dest = dir.path().join("out.csv");
        fs::write(&source, "[]").unwrap();

        assert_eq!(transform(&source, &dest).unwrap(), 0);

        let (headers, rows) = read_table(&dest);
        assert_eq!(headers.len(), FIELDS_TO_KEEP.len() + 1);
        assert!(rows.is_empty());
    }

    #[test]
    fn malformed_raw_store_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let source = dir.path().join("raw.json");
        fs::write(&source, "[{").unwrap();

        let err = transform(&source, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, TransformError::Json { .. }));
    }
}
