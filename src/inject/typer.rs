//! Keystroke synthesis engine.
//!
//! Used by the `injector` binary. Planning (shift composition, typo
//! selection, delays) is pure and unit-tested; only the thin `Typist`
//! touches the OS.

use std::time::Duration;

use enigo::{
    Direction::{Click, Press, Release},
    Enigo, Key, Keyboard, Settings,
};
use rand::Rng;

use super::InjectError;

/// Symbols produced by holding shift over another key (US layout).
const SHIFT_CHARS: &[(char, char)] = &[
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    ('{', '['),
    ('}', ']'),
    ('|', '\\'),
    (':', ';'),
    ('"', '\''),
    ('<', ','),
    ('>', '.'),
    ('?', '/'),
    ('~', '`'),
];

/// Adjacent-key typos on QWERTY, for humanized typing.
const TYPO_MAP: &[(char, &[char])] = &[
    ('a', &['s', 'q', 'w']),
    ('b', &['v', 'n', 'g']),
    ('c', &['x', 'v', 'd']),
    ('d', &['s', 'f', 'e']),
    ('e', &['w', 'r', 'd']),
    ('f', &['d', 'g', 'r']),
    ('g', &['f', 'h', 't']),
    ('h', &['g', 'j', 'y']),
    ('i', &['u', 'o', 'k']),
    ('j', &['h', 'k', 'u']),
    ('k', &['j', 'l', 'i']),
    ('l', &['k', 'o', 'p']),
    ('m', &['n', 'j', 'k']),
    ('n', &['b', 'm', 'h']),
    ('o', &['i', 'p', 'l']),
    ('p', &['o', 'l']),
    ('q', &['w', 'a']),
    ('r', &['e', 't', 'f']),
    ('s', &['a', 'd', 'w']),
    ('t', &['r', 'y', 'g']),
    ('u', &['y', 'i', 'j']),
    ('v', &['c', 'b', 'f']),
    ('w', &['q', 'e', 's']),
    ('x', &['z', 'c', 's']),
    ('y', &['t', 'u', 'h']),
    ('z', &['x', 'a']),
];

/// Humanized typing: at most one typo-then-backspace run per this many
/// characters.
const TYPO_MIN_GAP_CHARS: usize = 40;
const TYPO_CHANCE: f64 = 0.02;

/// How one character is physically produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPlan {
    Enter,
    Tab,
    /// Shift held around the base key.
    Shifted(char),
    Plain(char),
}

/// Plan the key sequence for one character.
pub fn plan_char(ch: char) -> KeyPlan {
    match ch {
        '\n' | '\r' => KeyPlan::Enter,
        '\t' => KeyPlan::Tab,
        _ => {
            if let Some(&(_, base)) = SHIFT_CHARS.iter().find(|(sym, _)| *sym == ch) {
                KeyPlan::Shifted(base)
            } else if ch.is_ascii_uppercase() {
                KeyPlan::Shifted(ch.to_ascii_lowercase())
            } else {
                KeyPlan::Plain(ch)
            }
        }
    }
}

/// A plausible adjacent-key typo for `ch`, preserving case. `None` when the
/// key has no mapped neighbors.
pub fn typo_for(ch: char, rng: &mut impl Rng) -> Option<char> {
    let lower = ch.to_ascii_lowercase();
    let neighbors = TYPO_MAP
        .iter()
        .find(|(c, _)| *c == lower)
        .map(|(_, n)| *n)?;
    let typo = neighbors[rng.gen_range(0..neighbors.len())];
    Some(if ch.is_ascii_uppercase() {
        typo.to_ascii_uppercase()
    } else {
        typo
    })
}

/// Inter-keystroke delay: ~55 ms center with ±25 ms jitter when humanized,
/// near-instant otherwise.
pub fn keystroke_delay(humanize: bool, rng: &mut impl Rng) -> Duration {
    if humanize {
        Duration::from_millis(rng.gen_range(30..=80))
    } else {
        Duration::from_millis(1)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TypeOptions {
    pub humanize: bool,
    /// Emit tab as a run of four spaces instead of the Tab key.
    pub tab_as_spaces: bool,
}

impl Default for TypeOptions {
    fn default() -> Self {
        Self {
            humanize: false,
            tab_as_spaces: false,
        }
    }
}

pub struct Typist {
    enigo: Enigo,
}

impl Typist {
    pub fn new() -> Result<Self, InjectError> {
        let enigo = Enigo::new(&Settings::default())
            .map_err(|e| InjectError::Init(e.to_string()))?;
        Ok(Self { enigo })
    }

    /// Emit `count` backspaces. All of them complete before any replacement
    /// character is typed.
    pub fn send_backspaces(&mut self, count: usize, opts: TypeOptions) -> Result<(), InjectError> {
        if count == 0 {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            self.key_click(Key::Backspace)?;
            let delay = if opts.humanize {
                Duration::from_millis(rng.gen_range(20..=50))
            } else {
                Duration::from_millis(2)
            };
            std::thread::sleep(delay);
        }
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }

    /// Type `text` character by character.
    pub fn send_text(&mut self, text: &str, opts: TypeOptions) -> Result<(), InjectError> {
        std::thread::sleep(Duration::from_millis(50));
        let mut rng = rand::thread_rng();
        let mut chars_since_typo = 0usize;

        for ch in text.chars() {
            if opts.humanize
                && ch.is_ascii_alphabetic()
                && chars_since_typo >= TYPO_MIN_GAP_CHARS
                && rng.gen_bool(TYPO_CHANCE)
            {
                if let Some(typo) = typo_for(ch, &mut rng) {
                    self.send_char(typo, opts)?;
                    std::thread::sleep(keystroke_delay(true, &mut rng));
                    // Brief pause before noticing the mistake.
                    std::thread::sleep(Duration::from_millis(rng.gen_range(100..=250)));
                    self.key_click(Key::Backspace)?;
                    std::thread::sleep(Duration::from_millis(20));
                    chars_since_typo = 0;
                }
            }

            self.send_char(ch, opts)?;
            chars_since_typo += 1;
            std::thread::sleep(keystroke_delay(opts.humanize, &mut rng));
        }
        Ok(())
    }

    fn send_char(&mut self, ch: char, opts: TypeOptions) -> Result<(), InjectError> {
        match plan_char(ch) {
            KeyPlan::Enter => self.key_click(Key::Return),
            KeyPlan::Tab => {
                if opts.tab_as_spaces {
                    for _ in 0..4 {
                        self.key_click(Key::Unicode(' '))?;
                    }
                    Ok(())
                } else {
                    self.key_click(Key::Tab)
                }
            }
            KeyPlan::Shifted(base) => {
                self.key(Key::Shift, Press)?;
                let result = self.key_click(Key::Unicode(base));
                // Always release shift, even if the click failed.
                let release = self.key(Key::Shift, Release);
                result.and(release)
            }
            KeyPlan::Plain(c) => self.key_click(Key::Unicode(c)),
        }
    }

    /// Synthesize the platform paste chord (clipboard fallback path).
    pub fn send_paste_chord(&mut self) -> Result<(), InjectError> {
        #[cfg(target_os = "macos")]
        let modifier = Key::Meta;
        #[cfg(not(target_os = "macos"))]
        let modifier = Key::Control;

        self.key(modifier, Press)?;
        let result = self.key_click(Key::Unicode('v'));
        let release = self.key(modifier, Release);
        std::thread::sleep(Duration::from_millis(100));
        result.and(release)
    }

    fn key_click(&mut self, key: Key) -> Result<(), InjectError> {
        self.key(key, Click)
    }

    fn key(&mut self, key: Key, direction: enigo::Direction) -> Result<(), InjectError> {
        self.enigo
            .key(key, direction)
            .map_err(|e| InjectError::Keystroke(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn plan_handles_specials_and_shift() {
        assert_eq!(plan_char('\n'), KeyPlan::Enter);
        assert_eq!(plan_char('\r'), KeyPlan::Enter);
        assert_eq!(plan_char('\t'), KeyPlan::Tab);
        assert_eq!(plan_char('A'), KeyPlan::Shifted('a'));
        assert_eq!(plan_char('!'), KeyPlan::Shifted('1'));
        assert_eq!(plan_char('"'), KeyPlan::Shifted('\''));
        assert_eq!(plan_char('a'), KeyPlan::Plain('a'));
        assert_eq!(plan_char('3'), KeyPlan::Plain('3'));
    }

    #[test]
    fn typo_preserves_case_and_adjacency() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let typo = typo_for('T', &mut rng).unwrap();
            assert!(typo.is_ascii_uppercase());
            assert!(['R', 'Y', 'G'].contains(&typo));
        }
        assert!(typo_for('5', &mut rng).is_none());
    }

    #[test]
    fn humanized_delay_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = keystroke_delay(true, &mut rng).as_millis();
            assert!((30..=80).contains(&d), "delay {} out of band", d);
        }
        assert_eq!(keystroke_delay(false, &mut rng).as_millis(), 1);
    }
}
