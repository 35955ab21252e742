const MAX_LOG_CHARS: usize = 4096;

/// Make one line of child-process output safe to print and store: ANSI
/// escape sequences, line breaks and control/bidi characters are removed,
/// tabs become spaces, and overly long lines are truncated.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters then a final byte in '@'..='~'.
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC, DCS, SOS, PM, APC: terminated by BEL or ESC '\'.
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        match c {
            '\t' => out.push(' '),
            c if c.is_control() || is_bidi_control(c) => continue,
            c => out.push(c),
        }
        count += 1;
        if count >= MAX_LOG_CHARS {
            if chars.peek().is_some() {
                out.push_str(" ...[truncated]");
            }
            break;
        }
    }

    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let got = sanitize_log_line("cc \u{1b}[1;32mkernel.o\u{1b}[0m \u{1b}]0;make\u{7}ok");
        assert_eq!(got, "cc kernel.o ok");
    }

    #[test]
    fn strips_string_terminated_sequences() {
        assert_eq!(sanitize_log_line("a\u{1b}Pignored\u{1b}\\b"), "ab");
    }

    #[test]
    fn drops_controls_and_expands_tabs() {
        assert_eq!(sanitize_log_line("ld\tboot.efi\r\n\u{202e}"), "ld boot.efi");
    }

    #[test]
    fn truncates_long_lines() {
        let long = "x".repeat(5000);
        let got = sanitize_log_line(&long);
        assert!(got.ends_with("...[truncated]"));
        assert_eq!(got.chars().filter(|c| *c == 'x').count(), 4096);
    }
}
