use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, decompressing `.gz` on the fly
///
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match Path::new(input_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing; `stdout` writes to the terminal and a
/// `.gz` extension compresses
///
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let file = File::create(output_file)?;
    match Path::new(output_file).extension().and_then(|x| x.to_str()) {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Numeric table: inputs in all columns but the last, target in the last
pub struct RegressionTable {
    pub inputs: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl RegressionTable {
    pub fn num_rows(&self) -> usize {
        self.targets.len()
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.first().map(|r| r.len()).unwrap_or(0)
    }
}

///
/// Read a whitespace or tab separated numeric table.
///
/// * Lines starting with `#` or `%` are skipped.
/// * A first line that does not parse is taken as a header.
/// * Every row needs the same number of columns, at least two.
///
pub fn read_regression_table(input_file: &str) -> anyhow::Result<RegressionTable> {
    let reader = open_buf_reader(input_file)?;

    let mut inputs = vec![];
    let mut targets = vec![];
    let mut ncol = None;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('%') {
            continue;
        }

        let parsed: Result<Vec<f64>, _> = line.split_whitespace().map(str::parse::<f64>).collect();
        let row = match parsed {
            Ok(row) => row,
            Err(_) if ncol.is_none() && targets.is_empty() => continue,
            Err(e) => anyhow::bail!("{}:{}: {}", input_file, line_no + 1, e),
        };

        if row.len() < 2 {
            anyhow::bail!("{}:{}: need at least one input and a target", input_file, line_no + 1);
        }
        match ncol {
            None => ncol = Some(row.len()),
            Some(k) if k != row.len() => {
                anyhow::bail!(
                    "{}:{}: {} columns, expected {}",
                    input_file,
                    line_no + 1,
                    row.len(),
                    k
                )
            }
            _ => {}
        }

        let (x, y) = row.split_at(row.len() - 1);
        inputs.push(x.to_vec());
        targets.push(y[0]);
    }

    if targets.is_empty() {
        anyhow::bail!("no data rows in {}", input_file);
    }

    Ok(RegressionTable { inputs, targets })
}

///
/// Write rows of numbers, tab separated
///
pub fn write_rows(rows: &[Vec<f64>], header: &[&str], output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    if !header.is_empty() {
        writeln!(buf, "{}", header.join("\t"))?;
    }
    for row in rows {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(buf, "{}", line.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_with_header_and_gzip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("table.tsv.gz").to_string_lossy().into_owned();
        write_rows(
            &[vec![0.5, 1.0, 2.0], vec![-0.5, 3.0, 4.0]],
            &["x1", "x2", "y"],
            &path,
        )?;

        let table = read_regression_table(&path)?;
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.num_inputs(), 2);
        assert_eq!(table.inputs[1], vec![-0.5, 3.0]);
        assert_eq!(table.targets, vec![2.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_ragged_rows_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ragged.tsv").to_string_lossy().into_owned();
        std::fs::write(&path, "# comment\n1 2\n3 4 5\n")?;
        assert!(read_regression_table(&path).is_err());
        Ok(())
    }
}
