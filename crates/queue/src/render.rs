use crate::entry::QueueRow;
use indexserver_protocol::format_branches;
use std::time::Duration;

const HEADERS: [&str; 6] = ["Position", "Name", "ID", "IsOnQueue", "Age", "Branches"];
const COLUMN_GAP: usize = 2;

/// Compact duration: `1h2m3s`, `4m0s`, `12s`. Sub-second ages render as `0s`.
pub fn format_age(age: Duration) -> String {
    let total = age.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Renders the queue introspection table with space-aligned columns.
pub fn render_queue_table(rows: &[QueueRow]) -> String {
    let mut cells: Vec<[String; 6]> = Vec::with_capacity(rows.len() + 1);
    cells.push(HEADERS.map(str::to_string));
    for row in rows {
        cells.push([
            row.position.to_string(),
            row.name.clone().unwrap_or_else(|| "-".to_string()),
            row.id.to_string(),
            row.is_on_queue.to_string(),
            row.age.map(format_age).unwrap_or_else(|| "-".to_string()),
            format_branches(&row.branches),
        ]);
    }

    let mut widths = [0usize; 6];
    for line in &cells {
        for (width, cell) in widths.iter_mut().zip(line.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    for line in &cells {
        let last = line.len() - 1;
        for (idx, cell) in line.iter().enumerate() {
            out.push_str(cell);
            if idx < last {
                let pad = widths[idx] - cell.chars().count() + COLUMN_GAP;
                out.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push('\n');
    }
    out
}
