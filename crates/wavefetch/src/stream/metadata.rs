//! Stream metadata types and ICY parsing
//!
//! Pure data types and parsing functions for ICY (Icecast/Shoutcast) metadata.

use std::collections::BTreeMap;

use serde::Serialize;

/// Key/value pairs carried by one ICY metadata block.
///
/// ICY metadata format: `StreamTitle='Artist - Song';StreamUrl='...';`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetadataBlock {
    entries: BTreeMap<String, String>,
}

impl MetadataBlock {
    /// Parse a raw metadata block (with null padding).
    ///
    /// Raw ICY metadata blocks are null-padded to a multiple of 16 bytes.
    /// Returns `None` if no `key='value'` pair could be parsed.
    pub fn parse(raw_block: &[u8]) -> Option<Self> {
        let end = raw_block
            .iter()
            .rposition(|&b| b != 0)
            .map(|p| p + 1)
            .unwrap_or(0);
        if end == 0 {
            return None;
        }

        let text = String::from_utf8_lossy(&raw_block[..end]);
        let entries = parse_pairs(&text);
        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The `StreamTitle` value, if present and non-empty
    pub fn stream_title(&self) -> Option<&str> {
        self.get("StreamTitle")
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.stream_title().map(NowPlaying::from_icy_title)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for MetadataBlock {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Split `key='value';key2='value2'` into pairs.
///
/// Pairs are separated by `;`. A quoted value runs to the closing `'`
/// that is followed by `;` or the end of the text, so titles containing
/// `;` survive. Segments without `=` or with an empty key are skipped.
fn parse_pairs(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        // A `;` before the `=` means a segment with no value: drop it.
        if let Some(semi) = rest[..eq].find(';') {
            rest = &rest[semi + 1..];
            continue;
        }

        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('\'') {
            match quoted.find("';") {
                Some(close) => (&quoted[..close], &quoted[close + 2..]),
                None => (quoted.strip_suffix('\'').unwrap_or(quoted), ""),
            }
        } else {
            match after.find(';') {
                Some(semi) => (&after[..semi], &after[semi + 1..]),
                None => (after, ""),
            }
        };

        if !key.is_empty() {
            entries.insert(key.to_string(), value.trim().to_string());
        }
        rest = remaining;
    }

    entries
}

/// Artist/title split of an ICY `StreamTitle`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
}

impl NowPlaying {
    /// Splits on first ` - ` separator: "Artist - Title" → artist="Artist", title="Title".
    /// If no separator found, the whole string becomes the title.
    pub fn from_icy_title(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self {
                title: None,
                artist: None,
            };
        }

        match raw.find(" - ") {
            Some(pos) => {
                let artist = raw[..pos].trim();
                let title = raw[pos + 3..].trim();
                Self {
                    title: (!title.is_empty()).then(|| title.to_string()),
                    artist: (!artist.is_empty()).then(|| artist.to_string()),
                }
            }
            None => Self {
                title: Some(raw.to_string()),
                artist: None,
            },
        }
    }
}
