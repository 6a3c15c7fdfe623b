//! Key-combo canonicalization for `RemoteBrowserPort::press` (spec.md §4.A:
//! "accepts case-insensitive names and `+`-delimited combinations;
//! canonicalization lives here").

/// One canonicalized key in a combo, ready to hand to the debugging
/// protocol's key-event dispatch (CDP `Input.dispatchKeyEvent` `key`/`code`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalKey {
    pub key: String,
    pub is_modifier: bool,
}

fn canonicalize_one(raw: &str) -> CanonicalKey {
    let lower = raw.trim().to_ascii_lowercase();
    let (key, is_modifier) = match lower.as_str() {
        "ctrl" | "control" => ("Control", true),
        "cmd" | "command" | "meta" | "super" | "win" | "windows" => ("Meta", true),
        "alt" | "option" => ("Alt", true),
        "shift" => ("Shift", true),
        "enter" | "return" => ("Enter", false),
        "esc" | "escape" => ("Escape", false),
        "tab" => ("Tab", false),
        "space" | "spacebar" => (" ", false),
        "backspace" => ("Backspace", false),
        "delete" | "del" => ("Delete", false),
        "up" | "arrowup" => ("ArrowUp", false),
        "down" | "arrowdown" => ("ArrowDown", false),
        "left" | "arrowleft" => ("ArrowLeft", false),
        "right" | "arrowright" => ("ArrowRight", false),
        "home" => ("Home", false),
        "end" => ("End", false),
        "pageup" => ("PageUp", false),
        "pagedown" => ("PageDown", false),
        other if other.len() == 1 => {
            return CanonicalKey { key: raw.trim().to_string(), is_modifier: false };
        }
        other => return CanonicalKey { key: other.to_string(), is_modifier: false },
    };
    CanonicalKey { key: key.to_string(), is_modifier }
}

/// Split a `"+"`-delimited combo like `"ctrl+shift+t"` into canonicalized
/// keys, modifiers first so callers can hold them down before the final key.
pub fn canonicalize_key_combo(combo: &str) -> Vec<CanonicalKey> {
    let mut keys: Vec<CanonicalKey> = combo.split('+').map(canonicalize_one).collect();
    keys.sort_by_key(|k| !k.is_modifier);
    keys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_normalize_case_insensitively() {
        let keys = canonicalize_key_combo("Ctrl+SHIFT+t");
        assert_eq!(keys[0].key, "Control");
        assert_eq!(keys[1].key, "Shift");
        assert_eq!(keys[2].key, "t");
    }

    #[test]
    fn cmd_and_meta_are_aliases() {
        assert_eq!(canonicalize_one("cmd").key, canonicalize_one("meta").key);
        assert_eq!(canonicalize_one("command").key, "Meta");
    }

    #[test]
    fn arrow_key_aliases() {
        assert_eq!(canonicalize_one("up").key, "ArrowUp");
        assert_eq!(canonicalize_one("ArrowUp").key, "ArrowUp");
    }

    #[test]
    fn enter_and_return_are_aliases() {
        assert_eq!(canonicalize_one("enter").key, "Enter");
        assert_eq!(canonicalize_one("Return").key, "Enter");
    }

    #[test]
    fn modifiers_sort_before_the_final_key() {
        let keys = canonicalize_key_combo("t+ctrl");
        assert!(keys[0].is_modifier);
        assert!(!keys[1].is_modifier);
    }
}
