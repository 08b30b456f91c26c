//! Console output arrives straight from a booting guest: systemd colour codes,
//! cursor movement from getty, OSC title updates and the odd NUL. Everything that
//! ends up in a log line or an error message goes through here first.

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    // DCS/SOS/PM/APC: terminated by ST (ESC \).
    String,
    StringEsc,
}

/// Strip escape sequences and control characters from one console line.
///
/// Tabs become single spaces; CR/LF are dropped; output is capped at
/// `MAX_LINE_CHARS` with a truncation marker.
pub fn sanitize_console_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut count = 0usize;

    for c in text.chars() {
        if let Some(state) = escape {
            escape = step_escape(state, c);
            continue;
        }
        match c {
            '\x1b' => escape = Some(Escape::Start),
            '\r' | '\n' => {}
            '\t' => {
                out.push(' ');
                count += 1;
            }
            c if c.is_control() || is_bidi_control(c) => {}
            c => {
                out.push(c);
                count += 1;
            }
        }
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// The last `max_lines` non-empty lines of `raw`, sanitized, for error messages.
pub fn sanitized_tail(raw: &[u8], max_lines: usize) -> Vec<String> {
    let mut lines: Vec<String> = raw
        .split(|b| *b == b'\n' || *b == b'\r')
        .map(sanitize_console_line)
        .filter(|l| !l.trim().is_empty())
        .collect();
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    lines
}

fn step_escape(state: Escape, c: char) -> Option<Escape> {
    match state {
        Escape::Start => match c {
            '[' => Some(Escape::Csi),
            ']' => Some(Escape::Osc),
            'P' | 'X' | '^' | '_' => Some(Escape::String),
            _ => None,
        },
        Escape::Csi => (!('@'..='~').contains(&c)).then_some(Escape::Csi),
        Escape::Osc => match c {
            '\x07' => None,
            '\x1b' => Some(Escape::OscEsc),
            _ => Some(Escape::Osc),
        },
        Escape::OscEsc => match c {
            '\\' => None,
            '\x1b' => Some(Escape::OscEsc),
            _ => Some(Escape::Osc),
        },
        Escape::String => match c {
            '\x1b' => Some(Escape::StringEsc),
            _ => Some(Escape::String),
        },
        Escape::StringEsc => match c {
            '\\' => None,
            '\x1b' => Some(Escape::StringEsc),
            _ => Some(Escape::String),
        },
    }
}

fn is_bidi_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
