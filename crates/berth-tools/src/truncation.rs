//! Byte-bounded shortening of logs and file contents that end up in tool
//! output, error messages and repair prompts.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationMode {
    /// Keep the opening 40% and the closing 60% of the budget.
    HeadTail,
    /// Keep only the end. Build failures are usually reported last.
    Tail,
}

/// Largest char boundary `<= at`.
fn boundary_before(text: &str, at: usize) -> usize {
    (0..=at.min(text.len()))
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0)
}

/// Smallest char boundary `>= at`.
fn boundary_after(text: &str, at: usize) -> usize {
    (at..=text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(text.len())
}

fn elided(bytes: usize, place: &str) -> String {
    format!("[... {bytes} bytes elided {place} ...]")
}

/// Shorten `text` so the kept content fits in `max_bytes`. The elision marker
/// is extra. Text already within budget is returned unchanged.
pub fn truncate_output(text: &str, max_bytes: usize, mode: TruncationMode) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }

    match mode {
        TruncationMode::HeadTail => {
            let head_budget = max_bytes * 2 / 5;
            let head = boundary_before(text, head_budget);
            let tail = boundary_after(text, text.len() - (max_bytes - head_budget));
            format!(
                "{}\n{}\n{}",
                &text[..head],
                elided(tail - head, "here"),
                &text[tail..]
            )
        }
        TruncationMode::Tail => {
            let tail = boundary_after(text, text.len() - max_bytes);
            format!("{}\n{}", elided(tail, "above"), &text[tail..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_log(lines: usize) -> String {
        (1..=lines).map(|n| format!("step {n:03}\n")).collect()
    }

    #[test]
    fn short_text_passes_through() {
        assert_eq!(truncate_output("FROM alpine", 64, TruncationMode::Tail), "FROM alpine");
        assert_eq!(truncate_output("", 0, TruncationMode::HeadTail), "");
    }

    #[test]
    fn tail_keeps_the_last_lines() {
        let log = build_log(50);
        assert_eq!(log.len(), 450);

        let out = truncate_output(&log, 90, TruncationMode::Tail);
        assert!(out.starts_with("[... 360 bytes elided above ...]\n"));
        assert!(out.ends_with("step 041\nstep 042\nstep 043\nstep 044\nstep 045\nstep 046\nstep 047\nstep 048\nstep 049\nstep 050\n"));
        assert!(!out.contains("step 040"));
    }

    #[test]
    fn head_tail_keeps_both_ends() {
        let log = build_log(50);
        let out = truncate_output(&log, 90, TruncationMode::HeadTail);

        // 36 bytes of head, 54 bytes of tail.
        assert!(out.starts_with(&log[..36]));
        assert!(out.ends_with(&log[log.len() - 54..]));
        assert!(out.contains("[... 360 bytes elided here ...]"));
    }

    #[test]
    fn cuts_respect_char_boundaries() {
        let text = "ü".repeat(40);
        for mode in [TruncationMode::Tail, TruncationMode::HeadTail] {
            let out = truncate_output(&text, 25, mode);
            assert!(out.contains("elided"));
            assert!(out.ends_with('ü'));
        }
    }
}
