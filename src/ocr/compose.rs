/// Join per-line recognition results into a single markup string.
///
/// Empty lines are discarded after trimming. A single surviving line is
/// returned verbatim; several are wrapped in an `aligned` block so the
/// output round-trips to the same number of visually distinct lines.
pub fn aligned_from_lines<S: AsRef<str>>(lines: &[S]) -> String {
    let clean: Vec<&str> = lines
        .iter()
        .map(|line| line.as_ref().trim())
        .filter(|line| !line.is_empty())
        .collect();

    match clean.as_slice() {
        [] => String::new(),
        [only] => (*only).to_string(),
        many => format!(
            "\\begin{{aligned}}\n{}\n\\end{{aligned}}",
            many.join(" \\\\\n")
        ),
    }
}
