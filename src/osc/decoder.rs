// ABOUTME: Streaming osmChange decoder built on quick-xml
// ABOUTME: Yields ChangeRecords lazily; decode_diff rejects a diff atomically on any error

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use super::model::{Action, ChangeRecord, Element, ElementType, Member};
use crate::error::DecodeError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const SUPPORTED_VERSION: &str = "0.6";

/// Decode a whole diff payload, gzip-compressed or plain XML.
///
/// Either every record is returned or the diff is rejected; partially decoded
/// diffs never escape this function.
pub fn decode_diff(payload: &[u8]) -> Result<Vec<ChangeRecord>, DecodeError> {
    OscReader::from_payload(payload).collect()
}

pub fn is_gzip(payload: &[u8]) -> bool {
    payload.starts_with(&GZIP_MAGIC)
}

/// Owned view of the XML event the decoder cares about.
enum Token {
    Open {
        name: String,
        attrs: Attrs,
        empty: bool,
    },
    Close,
    Text(String),
    Eof,
    Ignored,
}

/// Attribute list of one element, unescaped.
struct Attrs {
    element: String,
    values: Vec<(String, String)>,
}

impl Attrs {
    fn from_start(start: &BytesStart<'_>, position: usize) -> Result<Self, DecodeError> {
        let element = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut values = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| DecodeError::Xml {
                position,
                message: e.to_string(),
            })?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| DecodeError::Xml {
                    position,
                    message: e.to_string(),
                })?
                .into_owned();
            values.push((key, value));
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn required(&self, name: &str) -> Result<&str, DecodeError> {
        self.get(name).ok_or_else(|| DecodeError::MissingAttribute {
            element: self.element.clone(),
            attribute: name.to_string(),
        })
    }

    fn parse_value<T: FromStr>(&self, name: &str, value: &str) -> Result<T, DecodeError> {
        value.parse().map_err(|_| DecodeError::InvalidAttribute {
            element: self.element.clone(),
            attribute: name.to_string(),
            value: value.to_string(),
        })
    }

    fn parse_required<T: FromStr>(&self, name: &str) -> Result<T, DecodeError> {
        let value = self.required(name)?;
        self.parse_value(name, value)
    }

    fn parse_optional<T: FromStr>(&self, name: &str) -> Result<Option<T>, DecodeError> {
        match self.get(name) {
            Some(value) => self.parse_value(name, value).map(Some),
            None => Ok(None),
        }
    }

    fn timestamp(&self) -> Result<DateTime<Utc>, DecodeError> {
        let value = self.required("timestamp")?;
        DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|_| DecodeError::InvalidAttribute {
                element: self.element.clone(),
                attribute: "timestamp".to_string(),
                value: value.to_string(),
            })
    }
}

/// Lazy iterator over the change records of one osmChange document.
///
/// Records come out in document order. The first error ends the iteration.
pub struct OscReader<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    compressed: bool,
    root_open: bool,
    root_closed: bool,
    action: Option<Action>,
    current: Option<ChangeRecord>,
    child_open: bool,
    skip_depth: usize,
    finished: bool,
}

impl<'a> OscReader<Box<dyn BufRead + 'a>> {
    /// Reader over a raw payload, decompressing it when it starts with the gzip magic.
    pub fn from_payload(payload: &'a [u8]) -> Self {
        if is_gzip(payload) {
            let inner: Box<dyn BufRead + 'a> =
                Box::new(BufReader::new(MultiGzDecoder::new(payload)));
            Self::with_compression(inner, true)
        } else {
            Self::with_compression(Box::new(payload), false)
        }
    }
}

impl<R: BufRead> OscReader<R> {
    pub fn new(input: R) -> Self {
        Self::with_compression(input, false)
    }

    fn with_compression(input: R, compressed: bool) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.trim_text(true);
        Self {
            reader,
            buf: Vec::new(),
            compressed,
            root_open: false,
            root_closed: false,
            action: None,
            current: None,
            child_open: false,
            skip_depth: 0,
            finished: false,
        }
    }

    fn next_token(&mut self) -> Result<Token, DecodeError> {
        let position = self.reader.buffer_position();
        let token = match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(start)) => Token::Open {
                name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                attrs: Attrs::from_start(&start, position)?,
                empty: false,
            },
            Ok(Event::Empty(start)) => Token::Open {
                name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                attrs: Attrs::from_start(&start, position)?,
                empty: true,
            },
            Ok(Event::End(_)) => Token::Close,
            Ok(Event::Text(text)) => {
                let text = text.unescape().map_err(|e| DecodeError::Xml {
                    position,
                    message: e.to_string(),
                })?;
                Token::Text(text.trim().to_string())
            }
            Ok(Event::CData(data)) => {
                Token::Text(String::from_utf8_lossy(&data.into_inner()).trim().to_string())
            }
            Ok(Event::Eof) => Token::Eof,
            Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => {
                Token::Ignored
            }
            Err(quick_xml::Error::Io(e)) if self.compressed => {
                return Err(DecodeError::Compression(e.to_string()));
            }
            Err(e) => {
                return Err(DecodeError::Xml {
                    position: self.reader.buffer_position(),
                    message: e.to_string(),
                });
            }
        };
        self.buf.clear();
        Ok(token)
    }

    /// Advance until a record is complete, the document ends, or an error occurs.
    fn advance(&mut self) -> Result<Option<ChangeRecord>, DecodeError> {
        loop {
            match self.next_token()? {
                Token::Ignored => {}
                Token::Text(text) => {
                    if self.skip_depth == 0 && !text.is_empty() {
                        return Err(DecodeError::UnexpectedText(text));
                    }
                }
                Token::Open { name, attrs, empty } => {
                    if let Some(record) = self.open(name, attrs, empty)? {
                        return Ok(Some(record));
                    }
                }
                Token::Close => {
                    if let Some(record) = self.close() {
                        return Ok(Some(record));
                    }
                }
                Token::Eof => {
                    if !self.root_open && !self.root_closed {
                        return Err(DecodeError::Empty);
                    }
                    if self.root_open {
                        let innermost = match (&self.current, self.action) {
                            (Some(record), _) => record.element_type().as_str(),
                            (None, Some(action)) => action.as_str(),
                            (None, None) => "osmChange",
                        };
                        return Err(DecodeError::Truncated(innermost.to_string()));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn open(
        &mut self,
        name: String,
        attrs: Attrs,
        empty: bool,
    ) -> Result<Option<ChangeRecord>, DecodeError> {
        if self.skip_depth > 0 {
            if !empty {
                self.skip_depth += 1;
            }
            return Ok(None);
        }

        if !self.root_open {
            if self.root_closed {
                return Err(DecodeError::UnexpectedElement {
                    element: name,
                    context: "the document after </osmChange>".to_string(),
                });
            }
            if name != "osmChange" {
                return Err(DecodeError::UnexpectedRoot(name));
            }
            if let Some(version) = attrs.get("version") {
                if version != SUPPORTED_VERSION {
                    tracing::debug!("osmChange version {} (expected {})", version, SUPPORTED_VERSION);
                }
            }
            if empty {
                self.root_closed = true;
            } else {
                self.root_open = true;
            }
            return Ok(None);
        }

        if let Some(record) = self.current.as_mut() {
            if self.child_open {
                return Err(DecodeError::UnexpectedElement {
                    element: name,
                    context: "a child element".to_string(),
                });
            }
            add_child(record, &name, &attrs)?;
            if !empty {
                self.child_open = true;
            }
            return Ok(None);
        }

        if let Some(action) = self.action {
            let element = match ElementType::parse(&name) {
                Some(ElementType::Node) => Element::Node {
                    lat: attrs.parse_optional("lat")?,
                    lon: attrs.parse_optional("lon")?,
                },
                Some(ElementType::Way) => Element::Way {
                    node_refs: Vec::new(),
                },
                Some(ElementType::Relation) => Element::Relation {
                    members: Vec::new(),
                },
                None => {
                    return Err(DecodeError::UnexpectedElement {
                        element: name,
                        context: format!("<{}>", action),
                    })
                }
            };
            let record = ChangeRecord {
                action,
                id: attrs.parse_required("id")?,
                version: attrs.parse_required("version")?,
                timestamp: attrs.timestamp()?,
                changeset: attrs.parse_optional("changeset")?,
                user: attrs.get("user").map(str::to_string),
                uid: attrs.parse_optional("uid")?,
                tags: BTreeMap::new(),
                element,
            };
            if empty {
                return Ok(Some(record));
            }
            self.current = Some(record);
            return Ok(None);
        }

        if let Some(action) = Action::from_tag(name.as_bytes()) {
            if !empty {
                self.action = Some(action);
            }
            return Ok(None);
        }

        if ElementType::parse(&name).is_some() || matches!(name.as_str(), "tag" | "nd" | "member")
        {
            return Err(DecodeError::UnexpectedElement {
                element: name,
                context: "<osmChange> outside create/modify/delete".to_string(),
            });
        }

        tracing::debug!("Skipping unknown element <{}>", name);
        if !empty {
            self.skip_depth = 1;
        }
        Ok(None)
    }

    fn close(&mut self) -> Option<ChangeRecord> {
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
        } else if self.child_open {
            self.child_open = false;
        } else if self.current.is_some() {
            return self.current.take();
        } else if self.action.is_some() {
            self.action = None;
        } else if self.root_open {
            self.root_open = false;
            self.root_closed = true;
        }
        None
    }
}

fn add_child(record: &mut ChangeRecord, name: &str, attrs: &Attrs) -> Result<(), DecodeError> {
    match (name, &mut record.element) {
        ("tag", _) => {
            let key = attrs.required("k")?.to_string();
            let value = attrs.required("v")?.to_string();
            record.tags.insert(key, value);
        }
        ("nd", Element::Way { node_refs }) => {
            node_refs.push(attrs.parse_required("ref")?);
        }
        ("member", Element::Relation { members }) => {
            let raw_type = attrs.required("type")?;
            let member_type =
                ElementType::parse(raw_type).ok_or_else(|| DecodeError::InvalidAttribute {
                    element: "member".to_string(),
                    attribute: "type".to_string(),
                    value: raw_type.to_string(),
                })?;
            members.push(Member {
                member_type,
                id: attrs.parse_required("ref")?,
                role: attrs.required("role")?.to_string(),
            });
        }
        _ => {
            return Err(DecodeError::UnexpectedElement {
                element: name.to_string(),
                context: format!("<{}>", record.element_type()),
            })
        }
    }
    Ok(())
}

impl<R: BufRead> Iterator for OscReader<R> {
    type Item = Result<ChangeRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
