use std::io::Write;

use crate::downloader::DownloadSnapshot;

/// In-place terminal progress rendering: rewrites its own lines on each
/// refresh instead of scrolling.
pub struct ProgressDisplay {
    last_line_count: usize,
    first_print: bool,
}

impl ProgressDisplay {
    pub fn new() -> Self {
        Self {
            last_line_count: 0,
            first_print: true,
        }
    }

    pub fn print(&mut self, snapshot: &DownloadSnapshot) {
        let percentage = if snapshot.total > 0 {
            (snapshot.completed * 100) / snapshot.total
        } else {
            100
        };

        let lines = vec![
            format!(
                "Pieces:   {}/{} ({}%) | {} requests in flight",
                snapshot.completed, snapshot.total, percentage, snapshot.live_requests
            ),
            format!("Peers:    {} connected", snapshot.peers),
            progress_bar(snapshot.completed, snapshot.total, 50),
        ];

        if !self.first_print {
            print!("\x1B[{}A", self.last_line_count);
        }
        for line in &lines {
            println!("\x1B[K{}", line);
        }
        let _ = std::io::stdout().flush();

        self.first_print = false;
        self.last_line_count = lines.len();
    }
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

fn progress_bar(current: usize, max: usize, segments: usize) -> String {
    let filled = if max == 0 {
        segments
    } else {
        (current * segments) / max
    };

    let mut bar = String::with_capacity(segments + 2);
    bar.push('[');
    for _ in 0..filled {
        bar.push('▓');
    }
    for _ in filled..segments {
        bar.push(' ');
    }
    bar.push(']');
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar_fill() {
        assert_eq!(progress_bar(0, 4, 4), "[    ]");
        assert_eq!(progress_bar(2, 4, 4), "[▓▓  ]");
        assert_eq!(progress_bar(4, 4, 4), "[▓▓▓▓]");
        assert_eq!(progress_bar(0, 0, 4), "[▓▓▓▓]");
    }
}
