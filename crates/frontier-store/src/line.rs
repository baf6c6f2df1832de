// farcrawl is a polite, high-throughput web crawler.
// Copyright (C) 2024 The farcrawl Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The frontier file line codec (spec §6): `<url>|<depth>|<priority>|<added_at>\n`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// `url` is percent-encoded with this set so it can never contain the field
/// separator `|` or a newline.
const URL_FIELD: AsciiSet = CONTROLS.add(b'|').add(b'\n').add(b'\r');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlEntry {
    pub url: String,
    pub depth: u32,
    pub priority: i32,
    pub added_at: u64,
}

impl UrlEntry {
    pub fn encode(&self) -> String {
        let encoded_url = utf8_percent_encode(&self.url, &URL_FIELD);
        format!("{encoded_url}|{}|{}|{}\n", self.depth, self.priority, self.added_at)
    }

    /// Decodes one line, `line` excluding the trailing `\n`.
    pub fn decode(line: &str) -> Result<Self, String> {
        let mut parts = line.splitn(4, '|');
        let url = parts.next().ok_or("missing url field")?;
        let depth = parts.next().ok_or("missing depth field")?;
        let priority = parts.next().ok_or("missing priority field")?;
        let added_at = parts.next().ok_or("missing added_at field")?;

        let url = percent_decode_str(url)
            .decode_utf8()
            .map_err(|e| format!("invalid percent-encoding in url: {e}"))?
            .into_owned();
        let depth: u32 = depth.parse().map_err(|_| "depth is not a non-negative integer".to_string())?;
        let priority: i32 = priority.parse().map_err(|_| "priority is not an integer".to_string())?;
        let added_at: u64 = added_at
            .parse()
            .map_err(|_| "added_at is not a unix-seconds integer".to_string())?;

        Ok(Self {
            url,
            depth,
            priority,
            added_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let e = UrlEntry {
            url: "http://example.com/a b|c".to_string(),
            depth: 3,
            priority: 0,
            added_at: 1_700_000_000,
        };
        let line = e.encode();
        assert!(line.ends_with('\n'));
        let decoded = UrlEntry::decode(line.trim_end_matches('\n')).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn url_with_pipe_cannot_break_fields() {
        let e = UrlEntry {
            url: "http://example.com/a|b".to_string(),
            depth: 0,
            priority: 0,
            added_at: 0,
        };
        let line = e.encode();
        let fields: Vec<&str> = line.trim_end_matches('\n').split('|').collect();
        assert_eq!(fields.len(), 4);
    }

    #[test]
    fn rejects_missing_fields() {
        assert!(UrlEntry::decode("http://example.com/a|1|0").is_err());
    }

    #[test]
    fn rejects_non_numeric_depth() {
        assert!(UrlEntry::decode("http://example.com/a|x|0|1").is_err());
    }

    proptest::proptest! {
        #[test]
        fn round_trip_any_url_depth_priority_added_at(
            url in "[a-zA-Z0-9:/.?&=_%|-]{0,200}",
            depth in 0u32..10_000,
            priority in -1000i32..1000,
            added_at in 0u64..4_000_000_000,
        ) {
            let e = UrlEntry { url, depth, priority, added_at };
            let line = e.encode();
            let decoded = UrlEntry::decode(line.trim_end_matches('\n')).unwrap();
            proptest::prop_assert_eq!(decoded, e);
        }
    }
}
