/// Human duration used by the status surface: largest units first,
/// seconds only when nothing bigger applies.
pub fn format_duration(seconds: u64) -> String {
    let mut s = seconds;
    let w = s / 604_800;
    s %= 604_800;
    let d = s / 86_400;
    s %= 86_400;
    let h = s / 3_600;
    s %= 3_600;
    let m = s / 60;
    s %= 60;

    let mut parts = vec![];
    if w > 0 {
        parts.push(format!("{} week{}", w, plural(w)));
    }
    if d > 0 {
        parts.push(format!("{} day{}", d, plural(d)));
    }
    if h > 0 {
        parts.push(format!("{} hour{}", h, plural(h)));
    }
    if m > 0 {
        parts.push(format!("{} min{}", m, plural(m)));
    }
    if parts.is_empty() {
        parts.push(format!("{} sec{}", s, plural(s)));
    }
    parts.join(" ")
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// First occurrence wins; order preserved.
pub fn dedup_preserving_order<T: PartialEq + Clone>(items: &[T]) -> Vec<T> {
    let mut out: Vec<T> = vec![];
    for item in items {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// Truncate a response body for log lines, newlines flattened.
pub fn snippet(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    flat.chars().take(max).collect()
}
