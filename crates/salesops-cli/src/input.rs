use anyhow::{Context, Result};
use salesops_core::Observation;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::warn;

/// Parsed input plus the 1-based numbers of lines that were not observations.
#[derive(Debug, Default)]
pub struct ObservationBatch {
    pub observations: Vec<Observation>,
    pub rejected_lines: Vec<usize>,
}

/// Reads newline-delimited JSON observations. `-` reads stdin. Lines that do
/// not decode are logged and skipped.
pub fn read_observations(path: &Path) -> Result<ObservationBatch> {
    if path == Path::new("-") {
        let stdin = io::stdin();
        return parse_lines(stdin.lock()).context("Failed to read observations from stdin");
    }
    let file = File::open(path)
        .with_context(|| format!("Failed to open observations file {}", path.display()))?;
    parse_lines(BufReader::new(file))
        .with_context(|| format!("Failed to read observations from {}", path.display()))
}

fn parse_lines<R: BufRead>(reader: R) -> Result<ObservationBatch> {
    let mut batch = ObservationBatch::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<Observation>(trimmed) {
            Ok(observation) => batch.observations.push(observation),
            Err(err) => {
                warn!(event = "observation_rejected", line = index + 1, error = %err);
                batch.rejected_lines.push(index + 1);
            }
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn skips_blank_and_comment_lines() {
        let input = concat!(
            "# exported 2023-09-01\n",
            "{\"brand\":\"acme\",\"state\":\"CA\",\"period\":\"2023-01\",\"value\":120.5,\"source_batch\":\"b1\"}\n",
            "\n",
            "{\"brand\":\"acme\",\"state\":\"CA\",\"period\":\"2023-02\",\"value\":99.0}\n",
        );
        let observations = parse_lines(input.as_bytes()).expect("parse").observations;
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].source_batch, "b1");
        assert_eq!(observations[1].source_batch, "");
        assert_eq!(observations[1].period, "2023-02");
    }

    #[test]
    fn malformed_lines_are_skipped_and_counted() {
        let input = concat!(
            "{\"brand\":\"acme\",\"state\":\"CA\",\"period\":\"2023-01\",\"value\":1.0}\n",
            "{\"brand\":\"acme\"}\n",
            "not json at all\n",
            "{\"brand\":\"acme\",\"state\":\"CA\",\"period\":\"2023-02\",\"value\":2.0}\n",
        );
        let batch = parse_lines(input.as_bytes()).expect("parse");
        assert_eq!(batch.observations.len(), 2);
        assert_eq!(batch.observations[1].period, "2023-02");
        assert_eq!(batch.rejected_lines, vec![2, 3]);
    }

    #[test]
    fn reads_from_a_file_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "{{\"brand\":\"zeta\",\"state\":\"NY\",\"period\":\"202303\",\"value\":5.0}}"
        )
        .expect("write");
        let batch = read_observations(file.path()).expect("read");
        assert_eq!(batch.observations[0].brand, "zeta");
        assert!(batch.rejected_lines.is_empty());
    }
}
