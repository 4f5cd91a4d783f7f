//! Standalone delete-and-type binary.
//!
//! Invocation: `injector <escaped_text> [--backspace N] [--humanize]
//! [--tab-as-spaces]`. The text uses the pinned escape alphabet
//! `\\ \n \r \t`; anything else is rejected. When direct keystroke
//! synthesis fails the text is copied to the clipboard and a paste chord
//! is synthesized instead.
//!
//! Exit codes: 0 success, 1 usage, 2 bad escape sequence, 3 injection and
//! clipboard fallback both failed.

use keyflow::inject::escape;
use keyflow::inject::typer::{TypeOptions, Typist};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Some(escaped_text) = args.first() else {
        eprintln!("usage: injector <escaped_text> [--backspace N] [--humanize] [--tab-as-spaces]");
        return 1;
    };

    let mut backspace_count = 0usize;
    let mut opts = TypeOptions::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--backspace" => {
                let Some(n) = args.get(i + 1).and_then(|v| v.parse().ok()) else {
                    eprintln!("--backspace requires a non-negative integer");
                    return 1;
                };
                backspace_count = n;
                i += 2;
            }
            "--humanize" => {
                opts.humanize = true;
                i += 1;
            }
            "--tab-as-spaces" => {
                opts.tab_as_spaces = true;
                i += 1;
            }
            other => {
                eprintln!("unknown flag: {}", other);
                return 1;
            }
        }
    }

    let text = match escape::unescape(escaped_text) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };

    match type_text(&text, backspace_count, opts) {
        Ok(()) => 0,
        Err(primary) => {
            eprintln!("direct injection failed: {}", primary);
            match paste_fallback(&text) {
                Ok(()) => 0,
                Err(fallback) => {
                    eprintln!("clipboard fallback failed: {}", fallback);
                    3
                }
            }
        }
    }
}

fn type_text(
    text: &str,
    backspace_count: usize,
    opts: TypeOptions,
) -> Result<(), keyflow::inject::InjectError> {
    let mut typist = Typist::new()?;
    typist.send_backspaces(backspace_count, opts)?;
    typist.send_text(text, opts)?;
    Ok(())
}

fn paste_fallback(text: &str) -> Result<(), keyflow::inject::InjectError> {
    use keyflow::inject::InjectError;

    let mut clipboard =
        arboard::Clipboard::new().map_err(|e| InjectError::Clipboard(e.to_string()))?;
    clipboard
        .set_text(text)
        .map_err(|e| InjectError::Clipboard(e.to_string()))?;

    let mut typist = Typist::new()?;
    typist.send_paste_chord()?;
    Ok(())
}
