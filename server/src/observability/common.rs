//! Shared formatting helpers for status tables

/// Progress with a possibly unknown total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

impl Progress {
    pub fn percentage(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f32 / self.total as f32) * 100.0
        }
    }

    /// "current/total (pct%)"
    pub fn format_progress(&self) -> String {
        format!("{}/{} ({:.0}%)", self.current, self.total, self.percentage())
    }
}

fn format_row(list: Vec<String>) -> String {
    format!("| {} |\n", list.join(" | "))
}

fn column_widths(headers: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    let num_cols = rows
        .iter()
        .map(|r| r.len())
        .max()
        .unwrap_or(0)
        .max(headers.len());

    (0..num_cols)
        .map(|i| {
            let header_width = headers.get(i).map(|h| h.len()).unwrap_or(0);
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.len())
                .max()
                .unwrap_or(0)
                .max(header_width)
        })
        .collect()
}

/// Markdown-ish table, empty when there are no rows
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let widths = column_widths(headers, rows);
    let mut output = String::new();

    let header_line: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    output.push_str(&format_row(header_line));
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    output.push_str(&format!("|-{}-|\n", separator.join("-|-")));

    for row in rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[i]))
            .collect();
        output.push_str(&format_row(cells));
    }

    output
}

/// "Xm Ys" or "Ys"
pub fn format_elapsed_secs(secs: u64) -> String {
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_table() {
        let rows = vec![
            vec!["alice@example.com".to_string(), "3".to_string()],
            vec!["bob".to_string(), "12".to_string()],
        ];
        let table = format_table(&["User", "Found"], &rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "| User              | Found |");
        assert_eq!(lines[1], "|-------------------|-------|");
        assert_eq!(lines[3], "| bob               | 12    |");
        assert_eq!(format_table(&["User"], &[]), "");
    }

    #[test]
    fn test_progress_and_elapsed() {
        let p = Progress { current: 25, total: 100 };
        assert_eq!(p.format_progress(), "25/100 (25%)");
        assert_eq!(Progress::default().percentage(), 0.0);
        assert_eq!(format_elapsed_secs(59), "59s");
        assert_eq!(format_elapsed_secs(125), "2m 5s");
    }
}
