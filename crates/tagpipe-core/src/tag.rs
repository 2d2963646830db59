use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::sync::LazyLock;

pub type Tag = BTreeMap<String, String>;

// A literal quote inside a value is doubled on the wire.
static ATTR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z]+)='((?:''|[^'])*)'").expect("attribute pattern compiles"));

#[derive(Debug)]
pub enum FramingError {
    NotATag,
    UnexpectedEof,
    Io(io::Error),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotATag => write!(f, "expected start of tag"),
            Self::UnexpectedEof => write!(f, "stream ended before a complete tag"),
            Self::Io(err) => write!(f, "tag read failed: {err}"),
        }
    }
}

impl std::error::Error for FramingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::NotATag | Self::UnexpectedEof => None,
        }
    }
}

/// Reads one `<...>` tag off the stream and scans it for `name='value'`
/// attributes. Text inside the tag that does not fit the attribute shape
/// is ignored; hosts may prefix free-form text before the first attribute.
pub fn read_tag(reader: &mut impl BufRead) -> Result<Tag, FramingError> {
    match reader.fill_buf().map_err(FramingError::Io)?.first() {
        Some(&b'<') => {}
        Some(_) => return Err(FramingError::NotATag),
        None => return Err(FramingError::UnexpectedEof),
    }

    let mut raw = Vec::new();
    reader.read_until(b'>', &mut raw).map_err(FramingError::Io)?;
    if raw.last() != Some(&b'>') {
        return Err(FramingError::UnexpectedEof);
    }

    let text = String::from_utf8_lossy(&raw);
    let mut parsed = Tag::new();
    for caps in ATTR_PATTERN.captures_iter(&text) {
        parsed.insert(caps[1].to_string(), caps[2].replace("''", "'"));
    }
    Ok(parsed)
}

/// Emits `fields` as a single wire tag. Peers scan replies with the same
/// lenient attribute pattern and depend on the exact bytes, including the
/// bare quote preceding the final `>`.
pub fn write_tag(writer: &mut dyn Write, fields: &Tag) -> io::Result<()> {
    let mut msg = Vec::new();
    msg.push(b'<');
    for (name, value) in fields {
        msg.extend_from_slice(name.as_bytes());
        msg.extend_from_slice(b"='");
        msg.extend_from_slice(value.replace('\'', "''").as_bytes());
        msg.extend_from_slice(b"' ");
    }
    msg.extend_from_slice(b"'>");
    writer.write_all(&msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_tag_parses_consecutive_tags_from_one_stream() {
        let wire =
            b"<dpi cmd='open_url' url='test1'><dpi cmd='add_bookmark' url='test2' title='tit''l''''e1'>";
        let mut reader = Cursor::new(&wire[..]);

        let first = read_tag(&mut reader).expect("first tag");
        assert_eq!(first.get("cmd").map(String::as_str), Some("open_url"));
        assert_eq!(first.get("url").map(String::as_str), Some("test1"));

        let second = read_tag(&mut reader).expect("second tag");
        assert_eq!(second.get("cmd").map(String::as_str), Some("add_bookmark"));
        assert_eq!(second.get("url").map(String::as_str), Some("test2"));
        assert_eq!(second.get("title").map(String::as_str), Some("tit'l''e1"));

        assert!(matches!(
            read_tag(&mut reader),
            Err(FramingError::UnexpectedEof)
        ));
    }

    #[test]
    fn read_tag_rejects_stream_not_positioned_on_a_tag() {
        let mut reader = Cursor::new(&b"dpi cmd='open_url'>"[..]);
        assert!(matches!(read_tag(&mut reader), Err(FramingError::NotATag)));
    }

    #[test]
    fn read_tag_rejects_empty_stream() {
        let mut reader = Cursor::new(&b""[..]);
        assert!(matches!(
            read_tag(&mut reader),
            Err(FramingError::UnexpectedEof)
        ));
    }

    #[test]
    fn read_tag_rejects_unterminated_tag() {
        let mut reader = Cursor::new(&b"<dpi cmd='open_url'"[..]);
        assert!(matches!(
            read_tag(&mut reader),
            Err(FramingError::UnexpectedEof)
        ));
    }

    #[test]
    fn read_tag_ignores_text_that_is_not_an_attribute() {
        let mut reader = Cursor::new(&b"<welcome to the jungle cmd='ok'>"[..]);
        let parsed = read_tag(&mut reader).expect("tag");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get("cmd").map(String::as_str), Some("ok"));
    }

    #[test]
    fn read_tag_accepts_tag_without_attributes() {
        let mut reader = Cursor::new(&b"<>"[..]);
        assert!(read_tag(&mut reader).expect("tag").is_empty());
    }

    #[test]
    fn read_tag_accepts_empty_attribute_value() {
        let mut reader = Cursor::new(&b"<dpi cmd='auth' msg=''>"[..]);
        let parsed = read_tag(&mut reader).expect("tag");
        assert_eq!(parsed.get("msg").map(String::as_str), Some(""));
    }

    #[test]
    fn write_tag_closes_with_bare_quote_before_delimiter() {
        let fields = Tag::from([("cmd".to_string(), "open_url".to_string())]);
        let mut wire = Vec::new();
        write_tag(&mut wire, &fields).expect("write tag");
        assert_eq!(wire, b"<cmd='open_url' '>");
    }

    #[test]
    fn write_tag_doubles_quotes_in_values() {
        let fields = Tag::from([("title".to_string(), "tit'le".to_string())]);
        let mut wire = Vec::new();
        write_tag(&mut wire, &fields).expect("write tag");
        assert_eq!(wire, b"<title='tit''le' '>");
    }

    #[test]
    fn write_tag_emits_fields_in_deterministic_order() {
        let fields = Tag::from([
            ("url".to_string(), "test1".to_string()),
            ("cmd".to_string(), "start_send_page".to_string()),
        ]);
        let mut wire = Vec::new();
        write_tag(&mut wire, &fields).expect("write tag");
        assert_eq!(wire, b"<cmd='start_send_page' url='test1' '>");
    }

    #[test]
    fn encode_then_decode_recovers_quoted_value() {
        let fields = Tag::from([("msg".to_string(), "it's a 'test'".to_string())]);
        let mut wire = Vec::new();
        write_tag(&mut wire, &fields).expect("write tag");

        let mut reader = Cursor::new(wire);
        let parsed = read_tag(&mut reader).expect("decode");
        assert_eq!(parsed.get("msg").map(String::as_str), Some("it's a 'test'"));
    }
}
