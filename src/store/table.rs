//! Raw-row-preserving CSV table.
//!
//! Every line of the source text is kept. Comments, blank lines, and rows
//! that fail to parse are emitted verbatim on render; parsed records are
//! re-encoded only when a field was actually changed.

use crate::store::StoreError;

/// A row that could not be used, with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for RowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// One parsed CSV row.
#[derive(Debug, Clone)]
pub struct Record {
    line: usize,
    raw: String,
    fields: Vec<String>,
    dirty: bool,
}

impl Record {
    fn new(line: usize, fields: Vec<String>) -> Self {
        Self {
            line,
            raw: String::new(),
            fields,
            dirty: true,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    /// Field value, empty when the row is shorter than the header.
    pub fn get(&self, col: usize) -> &str {
        self.fields.get(col).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, col: usize, value: impl Into<String>) {
        let value = value.into();
        if self.get(col) == value {
            return;
        }
        if self.fields.len() <= col {
            self.fields.resize(col + 1, String::new());
        }
        self.fields[col] = value;
        self.dirty = true;
    }

    fn render(&self) -> Result<String, StoreError> {
        if !self.dirty {
            return Ok(self.raw.clone());
        }
        encode_fields(&self.fields)
    }
}

#[derive(Debug, Clone)]
enum Line {
    Raw(String),
    Header(Record),
    Record(Record),
}

/// In-memory image of a CSV file.
#[derive(Debug, Clone)]
pub struct Table {
    lines: Vec<Line>,
    columns: Vec<String>,
    trailing_newline: bool,
    issues: Vec<RowError>,
}

impl Table {
    /// A table holding only a header row.
    pub fn with_header(columns: &[&str]) -> Self {
        let fields: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        Self {
            lines: vec![Line::Header(Record::new(1, fields.clone()))],
            columns: fields,
            trailing_newline: true,
            issues: Vec::new(),
        }
    }

    /// Parse file text. Never fails; unusable rows are kept raw and reported in [`Table::issues`].
    pub fn parse(text: &str) -> Self {
        let trailing_newline = text.is_empty() || text.ends_with('\n');
        let body = text.strip_suffix('\n').unwrap_or(text);

        let mut table = Self {
            lines: Vec::new(),
            columns: Vec::new(),
            trailing_newline,
            issues: Vec::new(),
        };
        if text.is_empty() {
            return table;
        }

        let mut seen_header = false;
        for (idx, raw) in body.split('\n').enumerate() {
            let line_no = idx + 1;
            let content = raw.trim_end_matches('\r');
            let trimmed = content.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                table.lines.push(Line::Raw(raw.to_string()));
                continue;
            }

            match decode_fields(content) {
                Ok(fields) => {
                    let record = Record {
                        line: line_no,
                        raw: raw.to_string(),
                        fields,
                        dirty: false,
                    };
                    if seen_header {
                        table.lines.push(Line::Record(record));
                    } else {
                        seen_header = true;
                        table.columns = record
                            .fields
                            .iter()
                            .map(|c| c.trim().to_ascii_lowercase())
                            .collect();
                        table.lines.push(Line::Header(record));
                    }
                }
                Err(e) => {
                    table.issues.push(RowError {
                        line: line_no,
                        message: format!("unparseable row: {}", e),
                    });
                    table.lines.push(Line::Raw(raw.to_string()));
                }
            }
        }

        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_header(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of `name`, appending it to the header when missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column(name) {
            return idx;
        }
        if !self.has_header() {
            self.lines.insert(0, Line::Header(Record::new(1, Vec::new())));
        }
        let idx = self.columns.len();
        self.columns.push(name.to_string());
        for line in &mut self.lines {
            if let Line::Header(header) = line {
                header.set(idx, name);
                break;
            }
        }
        idx
    }

    /// Rows that could not be decoded at all.
    pub fn issues(&self) -> &[RowError] {
        &self.issues
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.lines.iter().filter_map(|l| match l {
            Line::Record(r) => Some(r),
            _ => None,
        })
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.lines.iter_mut().filter_map(|l| match l {
            Line::Record(r) => Some(r),
            _ => None,
        })
    }

    /// First record whose `col` equals `key`.
    pub fn find_mut(&mut self, col: usize, key: &str) -> Option<&mut Record> {
        self.lines.iter_mut().find_map(|l| match l {
            Line::Record(r) if r.get(col).trim() == key => Some(r),
            _ => None,
        })
    }

    pub fn push(&mut self, fields: Vec<String>) {
        let line = self.lines.len() + 1;
        self.lines.push(Line::Record(Record::new(line, fields)));
    }

    /// Whether rendering would differ from the parsed text.
    pub fn is_dirty(&self) -> bool {
        self.lines.iter().any(|l| match l {
            Line::Header(r) | Line::Record(r) => r.dirty,
            Line::Raw(_) => false,
        })
    }

    pub fn render(&self) -> Result<String, StoreError> {
        let mut out = String::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            match line {
                Line::Raw(raw) => out.push_str(raw),
                Line::Header(r) | Line::Record(r) => out.push_str(&r.render()?),
            }
        }
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        Ok(out)
    }
}

fn decode_fields(line: &str) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    match reader.records().next() {
        Some(record) => Ok(record?.iter().map(|f| f.trim().to_string()).collect()),
        None => Ok(Vec::new()),
    }
}

fn encode_fields(fields: &[String]) -> Result<String, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::Encode(e.to_string()))?;
    let mut text = String::from_utf8(bytes).map_err(|e| StoreError::Encode(e.to_string()))?;
    if text.ends_with('\n') {
        text.pop();
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# trailing stop rules
id,pair,volume,notes

btc_1,XXBTZUSD,0.01,\"first, careful\"
# parked
eth_1,XETHZUSD,0.5,
";

    #[test]
    fn test_untouched_table_renders_identically() {
        let table = Table::parse(SAMPLE);
        assert!(!table.is_dirty());
        assert_eq!(table.render().unwrap(), SAMPLE);
        assert_eq!(table.columns(), &["id", "pair", "volume", "notes"]);
        assert_eq!(table.records().count(), 2);
    }

    #[test]
    fn test_mutation_only_rewrites_target_row() {
        let mut table = Table::parse(SAMPLE);
        let vol = table.column("volume").unwrap();
        table.find_mut(0, "eth_1").unwrap().set(vol, "0.75");

        let rendered = table.render().unwrap();
        assert!(rendered.contains("btc_1,XXBTZUSD,0.01,\"first, careful\"\n"));
        assert!(rendered.contains("eth_1,XETHZUSD,0.75,\n"));
        assert!(rendered.starts_with("# trailing stop rules\n"));
        assert!(rendered.contains("\n# parked\n"));
    }

    #[test]
    fn test_setting_same_value_is_not_dirty() {
        let mut table = Table::parse(SAMPLE);
        table.find_mut(0, "btc_1").unwrap().set(1, "XXBTZUSD");
        assert!(!table.is_dirty());
    }

    #[test]
    fn test_ensure_column_extends_header() {
        let mut table = Table::parse("id,pair\na,XBTUSD\n");
        let idx = table.ensure_column("extra");
        assert_eq!(idx, 2);
        assert_eq!(table.render().unwrap(), "id,pair,extra\na,XBTUSD\n");
    }

    #[test]
    fn test_push_appends_record() {
        let mut table = Table::with_header(&["id", "pair"]);
        table.push(vec!["x".to_string(), "ETHUSD".to_string()]);
        assert_eq!(table.render().unwrap(), "id,pair\nx,ETHUSD\n");
    }
}
