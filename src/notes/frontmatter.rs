//! Markdown notes with a YAML frontmatter block.
//!
//! The frontmatter is kept as an ordered [`Mapping`] so keys this crate does
//! not know about survive a read-modify-write unchanged and in place. A parsed
//! note also remembers its original YAML text: rendering copies every
//! top-level entry whose value did not change verbatim (comments and flow
//! style included) and only re-serializes the entries that did.

use std::sync::LazyLock;

use regex::Regex;
use serde_yaml::{Mapping, Value};

/// Frontmatter keys the daemon reads or writes.
pub const KNOWN_KEYS: &[&str] = &[
    "type",
    "status",
    "created",
    "quality_score",
    "ai_processed",
    "video_id",
    "url",
    "source",
    "ready_for_processing",
    "screenshot",
    "processed_date",
    "promoted_date",
    "archived_date",
    "status_reason",
];

pub fn is_known_key(key: &str) -> bool {
    KNOWN_KEYS.contains(&key)
}

static WIKILINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]|#]+)(?:[#|][^\]]*)?\]\]").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Note {
    pub frontmatter: Mapping,
    pub body: String,
    /// YAML text and mapping as read from disk.
    source: Option<(String, Mapping)>,
}

impl Note {
    pub fn new(frontmatter: Mapping, body: impl Into<String>) -> Self {
        Self {
            frontmatter,
            body: body.into(),
            source: None,
        }
    }

    /// Parse a note. A file without a leading `---` block has empty frontmatter.
    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        let Some((yaml, body)) = split_frontmatter(content) else {
            return Ok(Self::new(Mapping::new(), content));
        };

        let frontmatter = if yaml.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str::<Mapping>(yaml)?
        };
        Ok(Self {
            source: Some((yaml.to_string(), frontmatter.clone())),
            ..Self::new(frontmatter, body)
        })
    }

    pub fn render(&self) -> Result<String, serde_yaml::Error> {
        let mut out = String::from("---\n");
        let preserved = match &self.source {
            Some((text, original)) => self.render_preserving(text, original)?,
            None => None,
        };
        match preserved {
            Some(yaml) => out.push_str(&yaml),
            None if !self.frontmatter.is_empty() => {
                out.push_str(&serde_yaml::to_string(&self.frontmatter)?)
            }
            None => {}
        }
        out.push_str("---\n");
        out.push_str(&self.body);
        Ok(out)
    }

    /// Rewrite only the changed entries of `text`. `None` when the text
    /// cannot be split into one chunk per top-level key.
    fn render_preserving(
        &self,
        text: &str,
        original: &Mapping,
    ) -> Result<Option<String>, serde_yaml::Error> {
        let Some(chunks) = split_entries(text) else {
            return Ok(None);
        };
        let keyed = chunks.iter().filter(|c| c.key.is_some()).count();
        if keyed != original.len() {
            return Ok(None);
        }

        let mut out = String::with_capacity(text.len() + 64);
        for chunk in &chunks {
            let Some(key) = &chunk.key else {
                out.push_str(&chunk.text);
                continue;
            };
            match self.frontmatter.get(key) {
                Some(value) if original.get(key) == Some(value) => out.push_str(&chunk.text),
                Some(value) => out.push_str(&render_entry(key, value)?),
                // Removed
                None => {}
            }
        }
        for (key, value) in &self.frontmatter {
            if !original.contains_key(key) {
                out.push_str(&render_entry(key, value)?);
            }
        }
        Ok(Some(out))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.frontmatter.get(key)
    }

    /// String value of `key`. Numbers are rendered, empty strings are `None`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        let s = match self.get(key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!s.is_empty()).then_some(s)
    }

    /// Boolean value of `key`, accepting `true`/`"true"`/`yes`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
            _ => false,
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.frontmatter.insert(Value::from(key), value.into());
    }

    pub fn is_ai_processed(&self) -> bool {
        self.get_bool("ai_processed")
    }

    /// Append a `## heading` section to the body.
    pub fn append_section(&mut self, heading: &str, content: &str) {
        let trimmed = self.body.trim_end_matches('\n');
        let mut body = String::with_capacity(trimmed.len() + heading.len() + content.len() + 8);
        body.push_str(trimmed);
        if !trimmed.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str("## ");
        body.push_str(heading);
        body.push_str("\n\n");
        body.push_str(content.trim_end_matches('\n'));
        body.push('\n');
        self.body = body;
    }

    /// Targets of `[[wikilinks]]` in the body, without aliases or anchors.
    pub fn wikilinks(&self) -> Vec<String> {
        WIKILINK_RE
            .captures_iter(&self.body)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .collect()
    }
}

/// One top-level entry of a frontmatter block, or a comment/blank line
/// between entries (`key: None`). `text` always ends with a newline.
struct Chunk {
    key: Option<Value>,
    text: String,
}

/// Split YAML text into top-level chunks. Returns `None` for anything that
/// does not look like a plain block mapping.
fn split_entries(text: &str) -> Option<Vec<Chunk>> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut pending_blank = String::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            pending_blank.push_str(line);
            pending_blank.push('\n');
            continue;
        }

        // `- item` at column zero still belongs to the key above it
        let sequence_item = line == "-" || line.starts_with("- ");
        let continuation = line.starts_with(char::is_whitespace) || sequence_item;

        if continuation {
            let current = chunks.last_mut().filter(|c| c.key.is_some())?;
            current.text.push_str(&pending_blank);
            pending_blank.clear();
            current.text.push_str(line);
            current.text.push('\n');
            continue;
        }

        flush_standalone(&mut chunks, &mut pending_blank);
        // Real key filled in below, once the whole entry is known
        let key = (!line.starts_with('#')).then_some(Value::Null);
        chunks.push(Chunk {
            key,
            text: format!("{line}\n"),
        });
    }
    flush_standalone(&mut chunks, &mut pending_blank);

    // Every entry must parse on its own to a single key
    for chunk in &mut chunks {
        if chunk.key.is_some() {
            let parsed: Mapping = serde_yaml::from_str(&chunk.text).ok()?;
            let mut keys = parsed.keys();
            match (keys.next(), keys.next()) {
                (Some(key), None) => chunk.key = Some(key.clone()),
                _ => return None,
            }
        }
    }
    Some(chunks)
}

fn flush_standalone(chunks: &mut Vec<Chunk>, blank: &mut String) {
    if !blank.is_empty() {
        chunks.push(Chunk {
            key: None,
            text: std::mem::take(blank),
        });
    }
}

fn render_entry(key: &Value, value: &Value) -> Result<String, serde_yaml::Error> {
    let mut single = Mapping::new();
    single.insert(key.clone(), value.clone());
    serde_yaml::to_string(&single)
}

/// Split `content` into (yaml, body) if it starts with a frontmatter block.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;

    // Empty frontmatter
    if let Some(body) = rest.strip_prefix("---") {
        return Some(("", body.trim_start_matches(['\r', '\n'])));
    }

    let close = rest.find("\n---")?;
    let yaml = &rest[..close];
    let after = &rest[close + 4..];
    // The closing fence must end its line
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().is_empty() => &after[nl + 1..],
        None if after.trim().is_empty() => "",
        _ => return None,
    };
    Some((yaml, body))
}
