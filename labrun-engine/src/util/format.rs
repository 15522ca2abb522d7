use chrono::Utc;

/// Render one line of a service log for the step log: `[HH:MM:SS] [source] text`.
///
/// Terminal escape sequences are stripped since the build UI shows plain
/// text. Returns `None` for lines that are blank once cleaned.
pub fn relay_line(source: &str, raw: &str) -> Option<String> {
    let text = strip_ansi(raw.trim_end_matches(['\n', '\r']));
    if text.trim().is_empty() {
        return None;
    }
    let ts = Utc::now().format("%H:%M:%S");
    Some(format!("[{ts}] [{source}] {text}"))
}

/// Drop CSI sequences (`ESC [ ... final-byte`) and bare escapes.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // parameters and intermediates run until a byte in 0x40..=0x7e
            for c in chars.by_ref() {
                if ('\x40'..='\x7e').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}
