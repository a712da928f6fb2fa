//! Cursor-movement filtering for captured terminal output.
//!
//! Progress bars redraw themselves by emitting a line followed by a "cursor up"
//! sequence. Persisting every redraw would bloat the terminal log, so lines that
//! move the cursor up are dropped unless they mark a decile step (`0%`), carry a
//! log level marker, or are flushed during shutdown.

use std::sync::LazyLock;

use regex::bytes::Regex;

/// `[SOH] ESC [ <digits or ;> <A-D|a-d> [STX]`
static CURSOR_CSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x01?\x1b\[((?:\d|;)*)([a-dA-D])\x02?").expect("cursor csi pattern")
});

const DECILE_MARKER: &[u8] = b"0%";
const KEEP_MARKERS: [&[u8]; 2] = [b"[INFO]", b"[DEBUG]"];

/// Strip cursor-movement sequences from `line`.
///
/// A line containing a cursor-up sequence is emptied unless it holds a decile
/// marker or a log level marker, or `shutting_down` is set.
///
/// Stripping repeats until no sequence is left, since removing one can splice
/// its neighbours into a new one (`ESC [ ESC [ A A`).
pub fn filter_line(line: &[u8], shutting_down: bool) -> Vec<u8> {
    if is_progress_redraw(line, shutting_down) {
        return Vec::new();
    }
    let mut out = line.to_vec();
    while CURSOR_CSI_RE.is_match(&out) {
        out = CURSOR_CSI_RE.replace_all(&out, &b""[..]).into_owned();
    }
    out
}

fn is_progress_redraw(line: &[u8], shutting_down: bool) -> bool {
    if shutting_down || contains(line, DECILE_MARKER) {
        return false;
    }
    if KEEP_MARKERS.iter().any(|marker| contains(line, marker)) {
        return false;
    }
    CURSOR_CSI_RE
        .captures_iter(line)
        .any(|caps| caps.get(2).is_some_and(|cmd| cmd.as_bytes() == b"A"))
}

/// Keep only what a terminal would show after carriage-return overwrites.
pub fn overwrite_carriage_returns(line: &[u8]) -> &[u8] {
    match line.iter().rposition(|&b| b == b'\r') {
        Some(idx) => &line[idx + 1..],
        None => line,
    }
}

/// Render a drained capture chunk into log file bytes.
///
/// Splits on `\n` (dropping empty fragments), filters each line, and applies
/// carriage-return overwrites. Suppressed lines contribute nothing.
pub fn render_chunk(data: &[u8], shutting_down: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut line = Vec::new();
    for fragment in data.split(|&b| b == b'\n').filter(|f| !f.is_empty()) {
        line.clear();
        line.extend_from_slice(fragment);
        line.push(b'\n');
        let filtered = filter_line(&line, shutting_down);
        out.extend_from_slice(overwrite_carriage_returns(&filtered));
    }
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
