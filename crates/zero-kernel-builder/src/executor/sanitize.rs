//! Terminal-safety filter for subprocess output (make, git, patch).

const MAX_LINE_CHARS: usize = 4096;

#[derive(Clone, Copy)]
enum Escape {
    Start,
    Csi,
    // OSC/DCS style strings run until BEL or ESC '\'.
    Str { bel_ends: bool, saw_esc: bool },
}

/// Strips ANSI escape sequences and control characters, expands tabs to a single
/// space and caps the line length.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut esc: Option<Escape> = None;
    let mut kept = 0usize;

    for c in input.chars() {
        if let Some(state) = esc {
            esc = match state {
                Escape::Start => match c {
                    '[' => Some(Escape::Csi),
                    ']' => Some(Escape::Str {
                        bel_ends: true,
                        saw_esc: false,
                    }),
                    'P' | 'X' | '^' | '_' => Some(Escape::Str {
                        bel_ends: false,
                        saw_esc: false,
                    }),
                    _ => None,
                },
                Escape::Csi => (!('@'..='~').contains(&c)).then_some(Escape::Csi),
                Escape::Str { bel_ends, saw_esc } => {
                    if (bel_ends && c == '\x07') || (saw_esc && c == '\\') {
                        None
                    } else {
                        Some(Escape::Str {
                            bel_ends,
                            saw_esc: c == '\x1b',
                        })
                    }
                }
            };
            continue;
        }

        match c {
            '\x1b' => esc = Some(Escape::Start),
            '\t' => {
                out.push(' ');
                kept += 1;
            }
            c if c.is_control() => {}
            c => {
                out.push(c);
                kept += 1;
            }
        }
        if kept >= MAX_LINE_CHARS {
            out.push_str("...");
            break;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        assert_eq!(
            sanitize_line("\x1b[1;31merror:\x1b[0m implicit declaration"),
            "error: implicit declaration"
        );
    }

    #[test]
    fn strips_osc_titles_and_controls() {
        assert_eq!(sanitize_line("\x1b]0;make\x07  CC\tinit/main.o\r"), "  CC init/main.o");
    }

    #[test]
    fn caps_long_lines() {
        let long = "x".repeat(MAX_LINE_CHARS * 2);
        let out = sanitize_line(&long);
        assert_eq!(out.len(), MAX_LINE_CHARS + 3);
        assert!(out.ends_with("..."));
    }
}
