//! Parsing of `uiautomator dump` XML into UI elements.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::types::{Bounds, DeviceError, DeviceResult, UiElement};

static NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<node\b([^>]*?)/?>").expect("valid node regex"));

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)="([^"]*)""#).expect("valid attribute regex"));

static FOCUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"mCurrentFocus=Window\{\S+\s+\S+\s+([\w.]+)/([\w.$]+)\}").expect("valid focus regex")
});

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

fn is_editable_kind(kind: &str) -> bool {
    kind.ends_with("EditText") || kind == "AutoCompleteTextView"
}

/// Parse a uiautomator hierarchy dump.
///
/// Keeps nodes that are actionable or carry text, in document order.
/// Nodes with an empty rectangle are dropped.
pub fn parse_hierarchy(xml: &str) -> DeviceResult<Vec<UiElement>> {
    if !xml.contains("<hierarchy") {
        return Err(DeviceError::Enumeration("dump has no <hierarchy> root".to_string()));
    }

    let mut elements = Vec::new();
    let mut node_count = 0;
    for node in NODE_RE.captures_iter(xml) {
        node_count += 1;
        let attrs: HashMap<&str, String> = ATTR_RE
            .captures_iter(&node[1])
            .filter_map(|c| Some((c.get(1)?.as_str(), unescape(c.get(2)?.as_str()))))
            .collect();

        let flag = |name: &str| attrs.get(name).map(|v| v == "true").unwrap_or(false);
        let text = |name: &str| attrs.get(name).map(|v| v.trim().to_string()).unwrap_or_default();

        let Some(bounds) = attrs.get("bounds").and_then(|b| Bounds::parse(b)) else {
            continue;
        };
        if bounds.is_empty() {
            continue;
        }

        let class = text("class");
        let kind = class.rsplit('.').next().unwrap_or_default().to_string();
        let element = UiElement {
            editable: is_editable_kind(&kind),
            kind,
            bounds,
            text: text("text"),
            content_desc: text("content-desc"),
            hint: text("hint"),
            resource_id: text("resource-id"),
            package: text("package"),
            clickable: flag("clickable"),
            long_clickable: flag("long-clickable"),
            scrollable: flag("scrollable"),
            checked: flag("checked"),
            enabled: attrs.get("enabled").map(|v| v == "true").unwrap_or(true),
        };

        let has_content = !(element.text.is_empty() && element.content_desc.is_empty());
        if element.is_actionable() || element.editable || has_content {
            elements.push(element);
        }
    }

    if node_count == 0 {
        return Err(DeviceError::Enumeration("dump contains no nodes".to_string()));
    }
    Ok(elements)
}

/// Extract `(package, activity)` from `dumpsys window` output
pub fn parse_focus(dumpsys: &str) -> Option<(String, String)> {
    let caps = FOCUS_RE.captures(dumpsys)?;
    let package = caps.get(1)?.as_str().to_string();
    let activity = caps.get(2)?.as_str();
    let activity = match activity.strip_prefix('.') {
        Some(rest) => format!("{}.{}", package, rest),
        None => activity.to_string(),
    };
    Some((package, activity))
}

/// Extract a crash signature from `logcat -d AndroidRuntime:E *:S` output
pub fn parse_crash(logcat: &str) -> Option<String> {
    if !logcat.contains("FATAL EXCEPTION") {
        return None;
    }
    let exception = logcat
        .lines()
        .map(|line| line.split_once(": ").map(|(_, msg)| msg).unwrap_or(line).trim())
        .find(|msg| {
            msg.split(':')
                .next()
                .map(|head| head.ends_with("Exception") || head.ends_with("Error"))
                .unwrap_or(false)
        });
    Some(exception.unwrap_or("FATAL EXCEPTION").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example.notes" content-desc="" clickable="false" enabled="true" scrollable="false" long-clickable="false" bounds="[0,0][1080,2280]">
    <node index="0" text="Notes &amp; lists" resource-id="com.example.notes:id/title" class="android.widget.TextView" package="com.example.notes" content-desc="" clickable="false" enabled="true" bounds="[42,84][600,168]" />
    <node index="1" text="" resource-id="com.example.notes:id/search" class="android.widget.EditText" package="com.example.notes" content-desc="" hint="Search" clickable="true" enabled="true" bounds="[42,200][1038,300]" />
    <node index="2" text="Add" resource-id="com.example.notes:id/add" class="android.widget.Button" package="com.example.notes" content-desc="" clickable="true" long-clickable="true" enabled="false" bounds="[800,2000][1000,2100]" />
    <node index="3" text="" class="android.view.View" package="com.example.notes" clickable="true" bounds="[10,10][10,50]" />
  </node>
</hierarchy>"#;

    #[test]
    fn test_parse_hierarchy_keeps_meaningful_nodes() {
        let elements = parse_hierarchy(DUMP).unwrap();
        let kinds: Vec<&str> = elements.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["TextView", "EditText", "Button"]);

        assert_eq!(elements[0].text, "Notes & lists");
        assert!(elements[1].editable);
        assert_eq!(elements[1].hint, "Search");
        assert!(!elements[2].enabled);
        assert!(elements[2].long_clickable);
        assert_eq!(elements[2].bounds, Bounds::new(800, 2000, 1000, 2100));
    }

    #[test]
    fn test_parse_hierarchy_rejects_garbage() {
        assert!(matches!(parse_hierarchy("ERROR: null root node"), Err(DeviceError::Enumeration(_))));
        assert!(matches!(
            parse_hierarchy("<hierarchy rotation=\"0\"></hierarchy>"),
            Err(DeviceError::Enumeration(_))
        ));
    }

    #[test]
    fn test_parse_focus() {
        let out = "  mCurrentFocus=Window{a1b2c3 u0 com.example.notes/.ui.MainActivity}\n";
        assert_eq!(
            parse_focus(out),
            Some(("com.example.notes".to_string(), "com.example.notes.ui.MainActivity".to_string()))
        );
        assert_eq!(parse_focus("mCurrentFocus=null"), None);
    }

    #[test]
    fn test_parse_crash() {
        let log = "--------- beginning of crash\n\
            E AndroidRuntime: FATAL EXCEPTION: main\n\
            E AndroidRuntime: Process: com.example.notes, PID: 4242\n\
            E AndroidRuntime: java.lang.NullPointerException: Attempt to invoke virtual method\n";
        assert_eq!(
            parse_crash(log).as_deref(),
            Some("java.lang.NullPointerException: Attempt to invoke virtual method")
        );
        assert_eq!(parse_crash("--------- beginning of main\n"), None);
    }
}
