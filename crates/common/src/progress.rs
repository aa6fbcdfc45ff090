//! Progress bars, hidden unless the user asked for them.

use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Result;

/// A bar of `len` steps labelled with `unit`; hidden when `visible` is false.
pub fn progress_bar(len: u64, unit: &str, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("[{{elapsed_precise}}] {{bar:40}} {{pos}}/{{len}} {unit} {{msg}}"))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_bar_still_counts() {
        let pb = progress_bar(5, "batches", false).unwrap();
        pb.inc(2);
        assert_eq!(pb.position(), 2);
        assert!(pb.is_hidden());
    }

    #[test]
    fn visible_bar_has_length() {
        let pb = progress_bar(7, "individuals", true).unwrap();
        assert_eq!(pb.length(), Some(7));
        pb.finish_and_clear();
    }
}
