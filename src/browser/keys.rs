//! Key names as written by planners → canonical names the automation
//! service understands.
//!
//! Examples:
//! - `"enter"` → `"Enter"`
//! - `"cmd+tab"` → `"Meta+Tab"`
//! - `"ctrl+shift+t"` → `"Control+Shift+t"`

/// Normalise a key or key combo (`+`-separated, modifiers first).
pub fn normalize_key_combo(combo: &str) -> Option<String> {
    let trimmed = combo.trim();
    let trimmed = trimmed
        .strip_prefix("press ")
        .or_else(|| trimmed.strip_prefix("Press "))
        .unwrap_or(trimmed)
        .trim();
    if trimmed.is_empty() {
        return None;
    }
    // A lone "+" is the plus key, not a separator.
    if trimmed == "+" {
        return Some("+".into());
    }

    let parts: Vec<&str> = trimmed.split('+').map(str::trim).collect();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let (modifiers, key) = parts.split_at(parts.len() - 1);
    let mut out: Vec<String> = modifiers
        .iter()
        .map(|m| map_key_name(m).to_string())
        .collect();
    out.push(map_key_name(key[0]).to_string());
    Some(out.join("+"))
}

/// Map a single key name onto its canonical spelling.
fn map_key_name(name: &str) -> &str {
    match name.to_lowercase().as_str() {
        "enter" | "return" => "Enter",
        "esc" | "escape" => "Escape",
        "cmd" | "command" | "meta" | "super" | "win" => "Meta",
        "ctrl" | "control" => "Control",
        "alt" | "option" | "opt" => "Alt",
        "shift" => "Shift",
        "tab" => "Tab",
        "space" | "spacebar" => "Space",
        "backspace" => "Backspace",
        "delete" | "del" | "fwd-delete" | "forward-delete" => "Delete",
        "up" | "arrow-up" | "arrowup" => "ArrowUp",
        "down" | "arrow-down" | "arrowdown" => "ArrowDown",
        "left" | "arrow-left" | "arrowleft" => "ArrowLeft",
        "right" | "arrow-right" | "arrowright" => "ArrowRight",
        "home" => "Home",
        "end" => "End",
        "pageup" | "page_up" | "page-up" => "PageUp",
        "pagedown" | "page_down" | "page-down" => "PageDown",
        "insert" => "Insert",
        "f1" => "F1",
        "f2" => "F2",
        "f3" => "F3",
        "f4" => "F4",
        "f5" => "F5",
        "f6" => "F6",
        "f7" => "F7",
        "f8" => "F8",
        "f9" => "F9",
        "f10" => "F10",
        "f11" => "F11",
        "f12" => "F12",
        // Single characters (a-z, 0-9, punctuation) pass through unchanged
        _ => name,
    }
}
