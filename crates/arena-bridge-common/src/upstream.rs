/// The upstream wire format (spec §4.6, §6): tagged lines consumed from the
/// agent's raw stream fragments, plus the outer frame shape the agent sends
/// over the duplex channel. Parsing here is pure (no I/O, no channel types)
/// so it can be unit tested directly — the rolling-buffer concatenation and
/// dispatch to OpenAI chunks lives in `arena-bridge-server::stream_processor`.
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One tagged record extracted from the upstream text stream. `Unknown`
/// exists because spec §9 explicitly expects the upstream's private protocol
/// to grow new tags without notice — recognizing one later is a new match
/// arm, not a parser rewrite.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Text(String),
    Reasoning(String),
    Image(ImageDescriptor),
    End { metadata: Option<serde_json::Value> },
    Unknown { tag: String, raw: serde_json::Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageDescriptor {
    Url(String),
    Base64(String),
}

impl ImageDescriptor {
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => {
                if s.starts_with("data:") {
                    Some(ImageDescriptor::Base64(s.clone()))
                } else {
                    Some(ImageDescriptor::Url(s.clone()))
                }
            }
            serde_json::Value::Object(map) => {
                if let Some(serde_json::Value::String(url)) = map.get("url") {
                    return Some(ImageDescriptor::Url(url.clone()));
                }
                if let Some(serde_json::Value::String(b64)) = map.get("base64") {
                    return Some(ImageDescriptor::Base64(b64.clone()));
                }
                None
            }
            _ => None,
        }
    }
}

/// Extracts every fully-terminated `<tag>:<json>` record from `buffer`,
/// draining it down to whatever trailing partial line remains (spec §4.6:
/// "the rolling buffer MUST drain completed records greedily").
pub fn drain_records(buffer: &mut String) -> Vec<Record> {
    let mut records = Vec::new();
    loop {
        let Some(newline_idx) = buffer.find('\n') else {
            break;
        };
        let line = buffer[..newline_idx].to_string();
        buffer.drain(..=newline_idx);
        if let Some(record) = parse_line(&line) {
            records.push(record);
        }
    }
    records
}

fn parse_line(line: &str) -> Option<Record> {
    let line = line.trim_end_matches('\r');
    if line.is_empty() {
        return None;
    }
    let Some((tag, rest)) = line.split_once(':') else {
        warn!(line, "skipping upstream line with no tag separator");
        return None;
    };

    let value: serde_json::Value = match serde_json::from_str(rest) {
        Ok(v) => v,
        Err(e) => {
            warn!(tag, error = %e, "malformed escape sequence in upstream record, skipping");
            return None;
        }
    };

    match tag {
        "a0" | "b0" => value
            .as_str()
            .map(|s| Record::Text(s.to_string()))
            .or_else(|| {
                warn!(tag, "content record payload was not a string, skipping");
                None
            }),
        "ag" => value
            .as_str()
            .map(|s| Record::Reasoning(s.to_string()))
            .or_else(|| {
                warn!(tag, "reasoning record payload was not a string, skipping");
                None
            }),
        "a2" | "b2" => ImageDescriptor::from_value(&value).map(Record::Image).or_else(|| {
            warn!(tag, "image record payload unrecognized, skipping");
            None
        }),
        "ad" | "bd" => Some(Record::End {
            metadata: if value.is_null() { None } else { Some(value) },
        }),
        other => Some(Record::Unknown {
            tag: other.to_string(),
            raw: value,
        }),
    }
}

/// Detects the known Cloudflare/interstitial signatures embedded in the raw
/// stream (spec §4.6). Checked against the whole rolling buffer, not just
/// completed lines, since an interstitial page is raw HTML with no tag.
pub fn contains_interstitial_signature(buffer: &str) -> bool {
    const SIGNATURES: &[&str] = &[
        "Just a moment...",
        "Checking your browser before accessing",
        "cf-browser-verification",
        "cf_chl_opt",
        "__cf_chl_rt_tk",
        "Attention Required! | Cloudflare",
    ];
    SIGNATURES.iter().any(|sig| buffer.contains(sig))
}

/// Outer agent→server frame data (spec §6). One `data` value per `{request_id,
/// data}` JSON frame received on the Transport Channel.
///
/// This can't be a plain `#[serde(untagged)]` enum: the `"[DONE]"` sentinel
/// and a raw text `Chunk` are both JSON strings, and untagged enums try
/// variants in declaration order, so a generic `Chunk(String)` variant would
/// swallow the sentinel before it ever reached a `Done` variant. The sentinel
/// is checked explicitly instead.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    Chunk(String),
    Advisory(Advisory),
    Done(DoneMarker),
}

/// Marker for the literal string `"[DONE]"`.
#[derive(Debug, Clone, PartialEq)]
pub struct DoneMarker;

const DONE_SENTINEL: &str = "[DONE]";

impl Serialize for FrameData {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            FrameData::Chunk(text) => s.serialize_str(text),
            FrameData::Advisory(adv) => adv.serialize(s),
            FrameData::Done(DoneMarker) => s.serialize_str(DONE_SENTINEL),
        }
    }
}

impl<'de> Deserialize<'de> for FrameData {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(d)?;
        match &value {
            serde_json::Value::String(s) if s == DONE_SENTINEL => Ok(FrameData::Done(DoneMarker)),
            serde_json::Value::String(s) => Ok(FrameData::Chunk(s.clone())),
            serde_json::Value::Object(_) => serde_json::from_value(value)
                .map(FrameData::Advisory)
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "unexpected frame data shape: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Advisory {
    Retry(RetryAdvisory),
    Error(ErrorAdvisory),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryAdvisory {
    pub retry_info: RetryInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryInfo {
    pub attempt: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ErrorAdvisory {
    pub error: String,
    #[serde(default)]
    pub final_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_complete_lines_and_keeps_remainder() {
        let mut buf = String::from("a0:\"Hel\"\na0:\"lo\"\nag:\"partial");
        let records = drain_records(&mut buf);
        assert_eq!(
            records,
            vec![Record::Text("Hel".into()), Record::Text("lo".into())]
        );
        assert_eq!(buf, "ag:\"partial");
    }

    #[test]
    fn handles_records_split_across_fragments() {
        let mut buf = String::new();
        buf.push_str("a0:\"Hel");
        assert!(drain_records(&mut buf).is_empty());
        buf.push_str("lo\"\n");
        let records = drain_records(&mut buf);
        assert_eq!(records, vec![Record::Text("Hello".into())]);
        assert!(buf.is_empty());
    }

    #[test]
    fn unescapes_standard_json_escapes() {
        let mut buf = String::from("a0:\"line1\\nline2 \\\"quoted\\\"\"\n");
        let records = drain_records(&mut buf);
        assert_eq!(records, vec![Record::Text("line1\nline2 \"quoted\"".into())]);
    }

    #[test]
    fn round_trip_escape_law() {
        let original = "weird \"text\" with \\ backslashes and \n newlines";
        let escaped = serde_json::to_string(original).unwrap();
        let mut buf = format!("a0:{escaped}\n");
        let records = drain_records(&mut buf);
        assert_eq!(records, vec![Record::Text(original.to_string())]);
    }

    #[test]
    fn reasoning_then_content_then_end() {
        let mut buf = String::from("ag:\"Think\"\nag:\"ing\"\na0:\"Answer\"\nad:{}\n");
        let records = drain_records(&mut buf);
        assert_eq!(
            records,
            vec![
                Record::Reasoning("Think".into()),
                Record::Reasoning("ing".into()),
                Record::Text("Answer".into()),
                Record::End { metadata: Some(serde_json::json!({})) },
            ]
        );
    }

    #[test]
    fn image_record_accepts_url_and_base64() {
        let mut buf = String::from(
            "a2:\"https://example.com/a.png\"\nb2:\"data:image/png;base64,AAAA\"\n",
        );
        let records = drain_records(&mut buf);
        assert_eq!(
            records,
            vec![
                Record::Image(ImageDescriptor::Url("https://example.com/a.png".into())),
                Record::Image(ImageDescriptor::Base64("data:image/png;base64,AAAA".into())),
            ]
        );
    }

    #[test]
    fn unknown_tag_is_preserved_not_dropped() {
        let mut buf = String::from("zz:\"future\"\n");
        let records = drain_records(&mut buf);
        assert_eq!(
            records,
            vec![Record::Unknown {
                tag: "zz".into(),
                raw: serde_json::json!("future")
            }]
        );
    }

    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let mut buf = String::from("a0:not-json\na0:\"ok\"\n");
        let records = drain_records(&mut buf);
        assert_eq!(records, vec![Record::Text("ok".into())]);
    }

    #[test]
    fn done_sentinel_round_trips() {
        let data: FrameData = serde_json::from_str("\"[DONE]\"").unwrap();
        assert_eq!(data, FrameData::Done(DoneMarker));
    }

    #[test]
    fn error_advisory_round_trips() {
        let data: FrameData =
            serde_json::from_str(r#"{"error":"boom","final_error":true}"#).unwrap();
        assert_eq!(
            data,
            FrameData::Advisory(Advisory::Error(ErrorAdvisory {
                error: "boom".into(),
                final_error: true,
            }))
        );
    }

    #[test]
    fn retry_advisory_round_trips() {
        let data: FrameData =
            serde_json::from_str(r#"{"retry_info":{"attempt":1,"reason":"empty"}}"#).unwrap();
        assert_eq!(
            data,
            FrameData::Advisory(Advisory::Retry(RetryAdvisory {
                retry_info: RetryInfo {
                    attempt: 1,
                    reason: Some("empty".into()),
                }
            }))
        );
    }

    #[test]
    fn plain_chunk_round_trips() {
        let data: FrameData = serde_json::from_str("\"a0:\\\"hi\\\"\\n\"").unwrap();
        assert_eq!(data, FrameData::Chunk("a0:\"hi\"\n".into()));
    }

    #[test]
    fn interstitial_signature_detected() {
        assert!(contains_interstitial_signature(
            "<html>Just a moment... verifying you are human</html>"
        ));
        assert!(!contains_interstitial_signature("a0:\"hello world\""));
    }
}
