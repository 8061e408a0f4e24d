use std::collections::HashSet;

use tracing::warn;

/// Captured when neither whitelist nor blacklist is configured.
pub const DEFAULT_EVENT_TYPES: &[&str] = &[
    // Page lifecycle
    "load",
    "unload",
    "beforeunload",
    "DOMContentLoaded",
    // User interaction
    "click",
    "dblclick",
    "contextmenu",
    "mousedown",
    "mouseup",
    "mouseenter",
    "mouseleave",
    "scroll",
    "touchstart",
    "touchend",
    // Forms
    "submit",
    "change",
    "input",
    "focus",
    "blur",
    // Navigation
    "hashchange",
    "popstate",
    // Visibility and connectivity
    "visibilitychange",
    "online",
    "offline",
    // Performance and errors
    "loadstart",
    "progress",
    "error",
    "abort",
    "loadend",
    // Media
    "play",
    "pause",
    "ended",
];

/// Event types a page can reasonably ask for. Names outside this list are
/// still accepted, with a warning.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "click", "dblclick", "mousedown", "mouseup", "mousemove", "mouseover", "mouseout",
    "mouseenter", "mouseleave", "contextmenu", "keydown", "keyup", "keypress", "submit", "reset",
    "change", "input", "invalid", "select", "focus", "blur", "focusin", "focusout", "load",
    "unload", "beforeunload", "resize", "scroll", "hashchange", "popstate", "DOMContentLoaded",
    "readystatechange", "cut", "copy", "paste", "dragstart", "drag", "dragenter", "dragleave",
    "dragover", "drop", "dragend", "animationstart", "animationend", "animationiteration",
    "transitionend", "play", "pause", "ended", "volumechange", "timeupdate", "loadeddata",
    "canplay", "loadstart", "progress", "error", "abort", "loadend", "touchstart", "touchmove",
    "touchend", "touchcancel", "pointerdown", "pointermove", "pointerup", "pointercancel",
    "pointerover", "pointerout", "pointerenter", "pointerleave", "wheel", "storage", "message",
    "beforeprint", "afterprint", "fullscreenchange", "fullscreenerror", "visibilitychange",
    "deviceorientation", "devicemotion", "pageshow", "pagehide", "online", "offline",
];

pub fn is_known(event_type: &str) -> bool {
    KNOWN_EVENT_TYPES.contains(&event_type)
}

/// Whitelist, when present, replaces the default set; blacklist then
/// removes from whatever remains. Duplicates keep their first position.
pub fn resolve_enabled(whitelist: Option<&[String]>, blacklist: &[String]) -> Vec<String> {
    let base: Vec<&str> = match whitelist {
        Some(list) => list.iter().map(String::as_str).collect(),
        None => DEFAULT_EVENT_TYPES.to_vec(),
    };

    let blocked: HashSet<&str> = blacklist.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();

    base.into_iter()
        .map(str::trim)
        .filter(|t| !t.is_empty() && !blocked.contains(t) && seen.insert(*t))
        .inspect(|t| {
            if !is_known(t) {
                warn!(event_type = t, "enabling event type outside the known vocabulary");
            }
        })
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_configuration_uses_defaults_verbatim() {
        assert_eq!(resolve_enabled(None, &[]), strings(DEFAULT_EVENT_TYPES));
    }

    #[test]
    fn test_blacklist_removes_from_defaults() {
        let enabled = resolve_enabled(None, &strings(&["scroll", "progress"]));

        assert_eq!(enabled.len(), DEFAULT_EVENT_TYPES.len() - 2);
        assert!(!enabled.iter().any(|t| t == "scroll" || t == "progress"));
        assert_eq!(enabled[0], "load");
    }

    #[test]
    fn test_whitelist_replaces_defaults_then_blacklist_applies() {
        let whitelist = strings(&["keydown", "click", "keydown", "copy"]);
        let enabled = resolve_enabled(Some(whitelist.as_slice()), &strings(&["copy"]));

        assert_eq!(enabled, strings(&["keydown", "click"]));
    }

    #[test]
    fn test_empty_whitelist_enables_nothing() {
        let empty: Vec<String> = Vec::new();
        assert!(resolve_enabled(Some(empty.as_slice()), &[]).is_empty());
    }

    #[test]
    fn test_defaults_are_known() {
        assert!(DEFAULT_EVENT_TYPES.iter().all(|t| is_known(t)));
    }
}
