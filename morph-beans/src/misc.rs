use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// A progress bar over `len` units, drawn only if `show` is set
pub fn new_progress_bar(len: usize, unit: &str, show: bool) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) = ProgressStyle::with_template(&format!(
        "{{bar:40}} {{pos}}/{{len}} {} ({{eta}})",
        unit
    )) {
        pb.set_style(style.progress_chars("##-"));
    }
    if !show {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb
}

/// Positional names `0, 1, ..., n-1`
pub fn positional_names(n: usize) -> Vec<Box<str>> {
    (0..n).map(|i| i.to_string().into_boxed_str()).collect()
}
