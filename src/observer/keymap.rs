//! Raw evdev key decoding.
//!
//! Maps device key codes to the logical keys the buffer and recognizer
//! operate on. The shift table is the US layout, the same table the
//! injector uses in the opposite direction.

use evdev::Key;

/// What a key event means to the text pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalKey {
    /// A printable character (shift already applied).
    Char(char),
    Backspace,
    Enter,
    Tab,
    Escape,
    /// Arrows, Home/End, PgUp/PgDn, Delete, Insert: the caret moved, the
    /// buffer no longer reflects contiguous typed text.
    CaretMove,
    /// Shift/Ctrl/Alt/Meta. Tracked for chords, never buffered.
    Modifier,
    /// Anything else (function keys, media keys, ...).
    Other,
}

impl LogicalKey {
    pub fn is_printable(&self) -> bool {
        matches!(self, LogicalKey::Char(_))
    }
}

/// Decode a key code under the current shift state.
pub fn decode(key: Key, shift: bool) -> LogicalKey {
    if is_modifier(key) {
        return LogicalKey::Modifier;
    }

    match key {
        Key::KEY_BACKSPACE => LogicalKey::Backspace,
        Key::KEY_ENTER | Key::KEY_KPENTER => LogicalKey::Enter,
        Key::KEY_TAB => LogicalKey::Tab,
        Key::KEY_ESC => LogicalKey::Escape,
        Key::KEY_LEFT
        | Key::KEY_RIGHT
        | Key::KEY_UP
        | Key::KEY_DOWN
        | Key::KEY_HOME
        | Key::KEY_END
        | Key::KEY_PAGEUP
        | Key::KEY_PAGEDOWN
        | Key::KEY_DELETE
        | Key::KEY_INSERT => LogicalKey::CaretMove,
        Key::KEY_SPACE => LogicalKey::Char(' '),
        _ => match printable(key, shift) {
            Some(ch) => LogicalKey::Char(ch),
            None => LogicalKey::Other,
        },
    }
}

pub fn is_modifier(key: Key) -> bool {
    matches!(
        key,
        Key::KEY_LEFTCTRL
            | Key::KEY_RIGHTCTRL
            | Key::KEY_LEFTALT
            | Key::KEY_RIGHTALT
            | Key::KEY_LEFTSHIFT
            | Key::KEY_RIGHTSHIFT
            | Key::KEY_LEFTMETA
            | Key::KEY_RIGHTMETA
    )
}

/// US-layout printable decode. Returns None for non-printable keys.
fn printable(key: Key, shift: bool) -> Option<char> {
    let pair: (char, char) = match key {
        Key::KEY_A => ('a', 'A'),
        Key::KEY_B => ('b', 'B'),
        Key::KEY_C => ('c', 'C'),
        Key::KEY_D => ('d', 'D'),
        Key::KEY_E => ('e', 'E'),
        Key::KEY_F => ('f', 'F'),
        Key::KEY_G => ('g', 'G'),
        Key::KEY_H => ('h', 'H'),
        Key::KEY_I => ('i', 'I'),
        Key::KEY_J => ('j', 'J'),
        Key::KEY_K => ('k', 'K'),
        Key::KEY_L => ('l', 'L'),
        Key::KEY_M => ('m', 'M'),
        Key::KEY_N => ('n', 'N'),
        Key::KEY_O => ('o', 'O'),
        Key::KEY_P => ('p', 'P'),
        Key::KEY_Q => ('q', 'Q'),
        Key::KEY_R => ('r', 'R'),
        Key::KEY_S => ('s', 'S'),
        Key::KEY_T => ('t', 'T'),
        Key::KEY_U => ('u', 'U'),
        Key::KEY_V => ('v', 'V'),
        Key::KEY_W => ('w', 'W'),
        Key::KEY_X => ('x', 'X'),
        Key::KEY_Y => ('y', 'Y'),
        Key::KEY_Z => ('z', 'Z'),
        Key::KEY_1 => ('1', '!'),
        Key::KEY_2 => ('2', '@'),
        Key::KEY_3 => ('3', '#'),
        Key::KEY_4 => ('4', '$'),
        Key::KEY_5 => ('5', '%'),
        Key::KEY_6 => ('6', '^'),
        Key::KEY_7 => ('7', '&'),
        Key::KEY_8 => ('8', '*'),
        Key::KEY_9 => ('9', '('),
        Key::KEY_0 => ('0', ')'),
        Key::KEY_MINUS => ('-', '_'),
        Key::KEY_EQUAL => ('=', '+'),
        Key::KEY_LEFTBRACE => ('[', '{'),
        Key::KEY_RIGHTBRACE => (']', '}'),
        Key::KEY_BACKSLASH => ('\\', '|'),
        Key::KEY_SEMICOLON => (';', ':'),
        Key::KEY_APOSTROPHE => ('\'', '"'),
        Key::KEY_GRAVE => ('`', '~'),
        Key::KEY_COMMA => (',', '<'),
        Key::KEY_DOT => ('.', '>'),
        Key::KEY_SLASH => ('/', '?'),
        Key::KEY_KP0 => ('0', '0'),
        Key::KEY_KP1 => ('1', '1'),
        Key::KEY_KP2 => ('2', '2'),
        Key::KEY_KP3 => ('3', '3'),
        Key::KEY_KP4 => ('4', '4'),
        Key::KEY_KP5 => ('5', '5'),
        Key::KEY_KP6 => ('6', '6'),
        Key::KEY_KP7 => ('7', '7'),
        Key::KEY_KP8 => ('8', '8'),
        Key::KEY_KP9 => ('9', '9'),
        Key::KEY_KPDOT => ('.', '.'),
        Key::KEY_KPPLUS => ('+', '+'),
        Key::KEY_KPMINUS => ('-', '-'),
        Key::KEY_KPASTERISK => ('*', '*'),
        Key::KEY_KPSLASH => ('/', '/'),
        _ => return None,
    };
    Some(if shift { pair.1 } else { pair.0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_respect_shift() {
        assert_eq!(decode(Key::KEY_A, false), LogicalKey::Char('a'));
        assert_eq!(decode(Key::KEY_A, true), LogicalKey::Char('A'));
    }

    #[test]
    fn digit_row_shifts_to_symbols() {
        assert_eq!(decode(Key::KEY_1, true), LogicalKey::Char('!'));
        assert_eq!(decode(Key::KEY_9, true), LogicalKey::Char('('));
        assert_eq!(decode(Key::KEY_9, false), LogicalKey::Char('9'));
    }

    #[test]
    fn backtick_decodes_unshifted_grave() {
        assert_eq!(decode(Key::KEY_GRAVE, false), LogicalKey::Char('`'));
        assert_eq!(decode(Key::KEY_GRAVE, true), LogicalKey::Char('~'));
    }

    #[test]
    fn navigation_keys_are_caret_moves() {
        for key in [
            Key::KEY_LEFT,
            Key::KEY_HOME,
            Key::KEY_END,
            Key::KEY_PAGEUP,
            Key::KEY_DELETE,
        ] {
            assert_eq!(decode(key, false), LogicalKey::CaretMove);
        }
    }

    #[test]
    fn modifiers_never_decode_as_printable() {
        assert_eq!(decode(Key::KEY_LEFTSHIFT, false), LogicalKey::Modifier);
        assert_eq!(decode(Key::KEY_RIGHTMETA, true), LogicalKey::Modifier);
    }

    #[test]
    fn unknown_keys_are_other() {
        assert_eq!(decode(Key::KEY_F5, false), LogicalKey::Other);
        assert_eq!(decode(Key::KEY_MUTE, false), LogicalKey::Other);
    }
}
