//! Tabular rendering of an event stream.

use std::{
    collections::BTreeSet,
    io::{self, Write},
};

use serde::Serialize;

use crate::parser::EventStream;

/// Rows over the sorted union of event keys. Missing cells are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Write as CSV with a header row and `\n` record separators.
    ///
    /// # Errors
    /// Returns error if writing fails.
    pub fn write_csv<W: Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(self.to_csv().as_bytes())?;
        out.flush()
    }

    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        push_record(&mut csv, &self.columns);
        for row in &self.rows {
            push_record(&mut csv, row);
        }
        csv
    }
}

fn push_record(csv: &mut String, cells: &[String]) {
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            csv.push(',');
        }
        if cell.contains([',', '"', '\r', '\n']) {
            csv.push('"');
            csv.push_str(&cell.replace('"', "\"\""));
            csv.push('"');
        } else {
            csv.push_str(cell);
        }
    }
    csv.push('\n');
}

/// Flatten events into a table.
#[must_use]
pub fn export_tabular(stream: &EventStream) -> Table {
    let columns: Vec<String> = stream
        .iter()
        .flat_map(|e| e.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect();

    let rows = stream
        .iter()
        .map(|event| {
            columns
                .iter()
                .map(|col| event.get(col).map(ToString::to_string).unwrap_or_default())
                .collect()
        })
        .collect();

    Table { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_bytes;

    #[test]
    fn test_columns_are_sorted_union() {
        let stream = parse_bytes(
            br#"{"pid":1,"event":"open"}
{"comm":"sh","event":"exec","extra":null}
"#,
        );
        let table = export_tabular(&stream);
        assert_eq!(table.columns, vec!["comm", "event", "extra", "pid"]);
        assert_eq!(table.rows[0], vec!["", "open", "", "1"]);
        assert_eq!(table.rows[1], vec!["sh", "exec", "", ""]);
    }

    #[test]
    fn test_csv_quoting() {
        let stream = parse_bytes(br#"{"a":"x,y","b":"say \"hi\"","c":"l1\nl2","d":2.5}"#);
        let csv = export_tabular(&stream).to_csv();
        assert_eq!(csv, "a,b,c,d\n\"x,y\",\"say \"\"hi\"\"\",\"l1\nl2\",2.5\n");
    }

    #[test]
    fn test_export_is_byte_identical_across_runs() {
        let input = br#"{"event":"open","pid":1,"comm":"a","timestamp":100}
{"z":true,"event":"close"}
"#;
        let first = export_tabular(&parse_bytes(input)).to_csv();
        let second = export_tabular(&parse_bytes(input)).to_csv();
        assert_eq!(first, second);
    }

    #[test]
    fn test_write_csv_matches_to_csv() {
        let table = export_tabular(&parse_bytes(b"{\"a\":\"x,y\",\"b\":1}\n"));
        let mut out = Vec::new();
        table.write_csv(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), table.to_csv());
        assert_eq!(table.to_csv(), "a,b\n\"x,y\",1\n");
    }

    #[test]
    fn test_empty_stream() {
        let table = export_tabular(&EventStream::default());
        assert!(table.columns.is_empty());
        assert_eq!(table.to_csv(), "\n");
    }
}
