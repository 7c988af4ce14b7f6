//! Adaptive decoding of schema-variable payloads.
//!
//! The upstream changes its collection and error schemas between versions and sometimes
//! answers with markup instead of data. Every conversion here returns `None` rather than
//! failing when a payload does not match, and leaves the raw body on the
//! [`Response`](crate::Response) for inspection.
//!
//! Parsing itself goes through an injected [`Serializer`], so the decoding rules below do
//! not depend on any process-wide state.

use crate::models::{ApiError, Cursored, SearchResult, SearchStatus, TrendsResult};
use crate::query::Format;
use crate::rate_limit::RateLimitStatus;
use crate::response::Response;
use crate::transport::AttemptOutcome;
use crate::trends;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Keys that mark an out-of-band control message on a streaming connection.
const CONTROL_KEYS: [&str; 3] = ["delete", "limit", "scrub_geo"];

/// Why a payload could not be parsed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The payload was empty or whitespace.
    #[error("Empty payload")]
    Empty,

    /// The payload is markup (HTML or XML) rather than data.
    #[error("Payload is markup, not structured data")]
    Markup,

    /// The payload looked like data but did not parse.
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

/// Converts between wire text and a JSON value tree.
pub trait Serializer: Send + Sync {
    /// Parses wire text. The XML preamble has already been stripped.
    fn parse(&self, text: &str) -> Result<Value, ParseError>;

    /// Renders a value tree as wire text.
    fn render(&self, value: &Value) -> Result<String, ParseError>;
}

/// The default [`Serializer`], backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn parse(&self, text: &str) -> Result<Value, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        if text.starts_with('<') {
            return Err(ParseError::Markup);
        }
        serde_json::from_str(text).map_err(|e| ParseError::Malformed(e.to_string()))
    }

    fn render(&self, value: &Value) -> Result<String, ParseError> {
        serde_json::to_string(value).map_err(|e| ParseError::Malformed(e.to_string()))
    }
}

/// A [`Serializer`] for the upstream's XML format, backed by `quick-xml`.
///
/// The document element is unwrapped, so `<user><id>1</id></user>` parses to
/// `{"id": 1}`. Child elements become object properties and repeated children become
/// arrays. An element marked `type="array"` always parses to an array of its children.
/// Text that reads as a number or boolean is typed, except under `*_str` elements.
/// Other attributes are ignored.
///
/// # Examples
///
/// ```
/// use chirpwire::normalize::{Serializer, XmlSerializer};
///
/// let value = XmlSerializer
///     .parse("<hash><request>/1/statuses/show/1.xml</request><error>Not found</error></hash>")
///     .unwrap();
/// assert_eq!(value["error"], "Not found");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlSerializer;

/// Name given to the document element when rendering.
const XML_ROOT: &str = "hash";

/// An element whose end tag has not been read yet.
struct OpenElement {
    name: String,
    is_array: bool,
    children: Vec<(String, Value)>,
    text: String,
}

impl OpenElement {
    fn new(start: &BytesStart<'_>) -> Self {
        let is_array = start
            .attributes()
            .flatten()
            .any(|a| a.key.into_inner() == b"type" && &*a.value == b"array");
        Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            is_array,
            children: Vec::new(),
            text: String::new(),
        }
    }

    fn into_value(self) -> Value {
        if self.is_array {
            return Value::Array(self.children.into_iter().map(|(_, v)| v).collect());
        }
        if self.children.is_empty() {
            if self.text.is_empty() {
                return Value::Null;
            }
            return xml_scalar(&self.name, self.text);
        }

        let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
        for (name, value) in self.children {
            match groups.iter_mut().find(|(n, _)| *n == name) {
                Some((_, values)) => values.push(value),
                None => groups.push((name, vec![value])),
            }
        }
        Value::Object(
            groups
                .into_iter()
                .map(|(name, mut values)| {
                    let value = if values.len() == 1 {
                        values.remove(0)
                    } else {
                        Value::Array(values)
                    };
                    (name, value)
                })
                .collect(),
        )
    }
}

fn xml_scalar(name: &str, text: String) -> Value {
    if !name.ends_with("_str") {
        if let Ok(n) = text.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(n) = text.parse::<u64>() {
            return Value::from(n);
        }
        if text.contains('.') {
            if let Some(n) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                return Value::Number(n);
            }
        }
        match text.as_str() {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
    }
    Value::String(text)
}

/// Closes `element`. Returns the document value once the root element closes.
fn close_element(stack: &mut [OpenElement], element: OpenElement) -> Option<Value> {
    let name = element.name.clone();
    let value = element.into_value();
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push((name, value));
            None
        }
        None => Some(value),
    }
}

fn malformed(e: impl fmt::Display) -> ParseError {
    ParseError::Malformed(e.to_string())
}

impl Serializer for XmlSerializer {
    fn parse(&self, text: &str) -> Result<Value, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        if !text.starts_with('<') {
            return Err(malformed("Expected an XML element"));
        }

        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        let mut stack: Vec<OpenElement> = Vec::new();
        loop {
            match reader.read_event().map_err(malformed)? {
                Event::Start(start) => stack.push(OpenElement::new(&start)),
                Event::Empty(start) => {
                    if let Some(root) = close_element(&mut stack, OpenElement::new(&start)) {
                        return Ok(root);
                    }
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| malformed("Unbalanced end tag"))?;
                    if let Some(root) = close_element(&mut stack, element) {
                        return Ok(root);
                    }
                }
                Event::Text(content) => {
                    let content = content.unescape().map_err(malformed)?;
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&content);
                    }
                }
                Event::CData(content) => {
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&String::from_utf8_lossy(&content));
                    }
                }
                Event::Eof => return Err(malformed("Document ended before its root element")),
                _ => {}
            }
        }
    }

    fn render(&self, value: &Value) -> Result<String, ParseError> {
        let mut out = String::new();
        write_element(&mut out, XML_ROOT, value);
        Ok(out)
    }
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Null => {
            out.push('<');
            out.push_str(name);
            out.push_str("/>");
            return;
        }
        Value::Array(_) => {
            out.push('<');
            out.push_str(name);
            out.push_str(" type=\"array\">");
        }
        _ => {
            out.push('<');
            out.push_str(name);
            out.push('>');
        }
    }

    match value {
        Value::Object(fields) => {
            for (key, field) in fields {
                write_element(out, key, field);
            }
        }
        Value::Array(items) => {
            let item = name.strip_suffix('s').filter(|n| !n.is_empty()).unwrap_or("item");
            for element in items {
                write_element(out, item, element);
            }
        }
        Value::String(text) => out.push_str(&quick_xml::escape::escape(text.as_str())),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Null => {}
    }

    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Removes a byte order mark and any `<?xml ... ?>` declarations from the front of a body.
///
/// # Examples
///
/// ```
/// use chirpwire::normalize::strip_preamble;
///
/// let body = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<status/>";
/// assert_eq!(strip_preamble(body), "<status/>");
/// assert_eq!(strip_preamble("  {\"id\":1}"), "{\"id\":1}");
/// ```
pub fn strip_preamble(body: &str) -> &str {
    let mut rest = body.trim_start_matches('\u{feff}').trim_start();
    while rest.starts_with("<?xml") {
        match rest.find("?>") {
            Some(end) => rest = rest[end + 2..].trim_start(),
            None => return "",
        }
    }
    rest
}

/// Finds the first property named `name` (ASCII case-insensitive).
///
/// Each object's own keys are checked before descending into its values, and arrays are
/// searched element by element.
pub fn find_property<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .or_else(|| map.values().find_map(|v| find_property(v, name))),
        Value::Array(items) => items.iter().find_map(|v| find_property(v, name)),
        _ => None,
    }
}

/// Extracts an error from a parsed payload.
///
/// The current schema (`{"errors": [{"message": .., "code": ..}]}`) is tried first; the
/// legacy flat schema (`{"error"|"message": .., "request": ..}`) is the fallback.
pub fn error_from_value(value: &Value) -> Option<ApiError> {
    if let Some(errors) = find_property(value, "errors") {
        let first = match errors {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        let error = match first {
            Some(Value::Object(fields)) => error_from_fields(fields),
            Some(Value::String(message)) => ApiError {
                message: Some(message.clone()),
                ..ApiError::default()
            },
            _ => ApiError::default(),
        };
        if error != ApiError::default() {
            return Some(error);
        }
    }

    let Value::Object(fields) = value else {
        return None;
    };
    let legacy = ApiError {
        message: string_field(fields, "error").or_else(|| string_field(fields, "message")),
        code: None,
        request: string_field(fields, "request"),
    };
    if legacy.message.is_some() || legacy.request.is_some() {
        Some(legacy)
    } else {
        None
    }
}

fn error_from_fields(fields: &Map<String, Value>) -> ApiError {
    ApiError {
        message: string_field(fields, "message"),
        code: fields.get("code").and_then(integer),
        request: string_field(fields, "request"),
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_owned)
}

/// Reads an integer from a number or a numeric string.
fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_u64().map(|u| u as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decodes a single item, returning `None` on mismatch.
fn decode<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::debug!(
                error = %e,
                target_type = std::any::type_name::<T>(),
                "Payload did not match target shape"
            );
            None
        }
    }
}

/// Locates the array for a collection: a property named `name`, or the payload itself.
fn elements<'a>(root: &'a Value, name: &str) -> Option<&'a Vec<Value>> {
    if let Some(Value::Array(items)) = find_property(root, name) {
        return Some(items);
    }
    root.as_array()
}

/// Decodes every element independently, dropping the ones that fail.
fn decode_each<T: DeserializeOwned>(items: &[Value]) -> Vec<T> {
    let decoded: Vec<T> = items.iter().filter_map(decode).collect();
    if decoded.len() < items.len() {
        tracing::debug!(
            dropped = items.len() - decoded.len(),
            kept = decoded.len(),
            "Dropped malformed collection elements"
        );
    }
    decoded
}

/// Turns responses into typed values.
///
/// # Examples
///
/// ```
/// use chirpwire::normalize::Normalizer;
/// use chirpwire::models::List;
///
/// let normalizer = Normalizer::json();
/// let wrapped = normalizer.parse(r#"{"lists":[{"id":1},{"id":2}]}"#).unwrap();
/// let lists: Vec<List> = normalizer.collection_from_value(&wrapped, "lists").unwrap();
/// assert_eq!(lists.len(), 2);
/// ```
#[derive(Clone)]
pub struct Normalizer {
    json: Arc<dyn Serializer>,
    xml: Arc<dyn Serializer>,
    format: Format,
}

impl Normalizer {
    /// Creates a normalizer that parses JSON with `serializer`.
    ///
    /// XML bodies still go through [`XmlSerializer`].
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            json: serializer,
            xml: Arc::new(XmlSerializer),
            format: Format::Json,
        }
    }

    /// Creates a normalizer backed by [`JsonSerializer`].
    pub fn json() -> Self {
        Self::new(Arc::new(JsonSerializer))
    }

    /// Creates a normalizer that reads XML bodies.
    pub fn xml() -> Self {
        Self::json().for_format(Format::Xml)
    }

    /// Replaces the serializer used for [`Format::Xml`].
    pub fn with_xml_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.xml = serializer;
        self
    }

    /// The same serializers, reading bodies in `format`.
    pub fn for_format(&self, format: Format) -> Self {
        Self {
            format,
            ..self.clone()
        }
    }

    /// The wire format this normalizer reads.
    pub fn format(&self) -> Format {
        self.format
    }

    fn serializer(&self) -> &dyn Serializer {
        match self.format {
            Format::Json => self.json.as_ref(),
            Format::Xml => self.xml.as_ref(),
        }
    }

    /// Parses a raw body after stripping its preamble.
    pub fn parse(&self, body: &str) -> Result<Value, ParseError> {
        self.serializer().parse(strip_preamble(body))
    }

    /// Serializes a model to wire text.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be represented.
    pub fn encode<T: Serialize>(&self, model: &T) -> crate::Result<String> {
        let value = serde_json::to_value(model)
            .map_err(|e| crate::Error::SerializationFailed(e.to_string()))?;
        self.serializer()
            .render(&value)
            .map_err(|e| crate::Error::SerializationFailed(e.to_string()))
    }

    /// Extracts an error the upstream reported inside a raw body.
    pub fn body_error(&self, body: &str) -> Option<ApiError> {
        error_from_value(&self.parse(body).ok()?)
    }

    /// Records the body's error, if any, on the outcome so retry conditions can see it.
    pub fn inspect(&self, outcome: &mut AttemptOutcome) {
        outcome.body_error = self.body_error(&outcome.body);
    }

    /// The parsed payload of a response, or `None` for outage pages and unparseable bodies.
    pub fn payload(&self, response: &Response) -> Option<Value> {
        if response.is_outage_page {
            return None;
        }
        match self.parse(&response.body) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    status = ?response.status,
                    "Response body not parseable"
                );
                None
            }
        }
    }

    /// Decodes a single entity.
    pub fn single<T: DeserializeOwned>(&self, response: &Response) -> Option<T> {
        decode(&self.payload(response)?)
    }

    /// Decodes a collection that may be bare or wrapped in a property named `name`.
    pub fn collection<T: DeserializeOwned>(
        &self,
        response: &Response,
        name: &str,
    ) -> Option<Vec<T>> {
        self.collection_from_value(&self.payload(response)?, name)
    }

    /// [`collection`](Self::collection) over an already-parsed payload.
    pub fn collection_from_value<T: DeserializeOwned>(
        &self,
        root: &Value,
        name: &str,
    ) -> Option<Vec<T>> {
        elements(root, name).map(|items| decode_each(items))
    }

    /// Decodes an error in either the current or the legacy schema.
    pub fn error(&self, response: &Response) -> Option<ApiError> {
        error_from_value(&self.payload(response)?)
    }

    /// Reads a cursor property such as `next_cursor`.
    ///
    /// Returns `None` when the property is absent, never zero.
    pub fn cursor(&self, response: &Response, name: &str) -> Option<i64> {
        cursor_from_value(&self.payload(response)?, name)
    }

    /// Decodes one page of a cursor-paginated collection.
    pub fn cursored<T: DeserializeOwned>(
        &self,
        response: &Response,
        name: &str,
    ) -> Option<Cursored<T>> {
        let root = self.payload(response)?;
        Some(Cursored {
            items: self.collection_from_value(&root, name)?,
            next_cursor: cursor_from_value(&root, "next_cursor"),
            previous_cursor: cursor_from_value(&root, "previous_cursor"),
        })
    }

    /// Decodes a page of raw ids. Ids may be numbers or numeric strings.
    pub fn ids(&self, response: &Response) -> Option<Cursored<u64>> {
        let root = self.payload(response)?;
        let items = elements(&root, "ids")?
            .iter()
            .filter_map(|v| integer(v).and_then(|i| u64::try_from(i).ok()))
            .collect();
        Some(Cursored {
            items,
            next_cursor: cursor_from_value(&root, "next_cursor"),
            previous_cursor: cursor_from_value(&root, "previous_cursor"),
        })
    }

    /// Decodes a page of search results, dropping malformed results.
    pub fn search(&self, response: &Response) -> Option<SearchResult> {
        let Value::Object(mut root) = self.payload(response)? else {
            return None;
        };
        let results = root
            .remove("results")
            .or_else(|| root.remove("statuses"))
            .unwrap_or(Value::Array(Vec::new()));
        let mut page: SearchResult = decode(&Value::Object(root))?;
        page.results = match &results {
            Value::Array(items) => decode_each::<SearchStatus>(items),
            _ => Vec::new(),
        };
        Some(page)
    }

    /// Decodes trending topics, reshaping timestamp-keyed payloads first.
    pub fn trends(&self, response: &Response) -> Option<TrendsResult> {
        let shaped = trends::reshape(self.payload(response)?);
        let Value::Object(mut root) = shaped else {
            return None;
        };
        let items = root.remove("trends").unwrap_or(Value::Array(Vec::new()));
        let locations = root.remove("locations").unwrap_or(Value::Array(Vec::new()));
        let mut result: TrendsResult = decode(&Value::Object(root))?;
        if let Value::Array(items) = &items {
            result.trends = decode_each(items);
        }
        if let Value::Array(locations) = &locations {
            result.locations = decode_each(locations);
        }
        Some(result)
    }

    /// Decodes the account's rate limit status.
    pub fn rate_limit_status(&self, response: &Response) -> Option<RateLimitStatus> {
        self.single(response)
    }

    /// Decodes one line of a streaming connection.
    ///
    /// Blank keep-alive lines and control messages (deletion notices, limit notices,
    /// geo scrubs) yield `None`.
    pub fn stream_item<T: DeserializeOwned>(&self, line: &str) -> Option<T> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let value = self.parse(line).ok()?;
        if let Value::Object(fields) = &value {
            if let Some(key) = CONTROL_KEYS.iter().find(|k| fields.contains_key(**k)) {
                tracing::debug!(control = *key, "Discarding stream control message");
                return None;
            }
        }
        decode(&value)
    }

    /// Decodes every line of a line-delimited body through [`stream_item`](Self::stream_item).
    pub fn stream_collection<T: DeserializeOwned>(&self, body: &str) -> Vec<T> {
        body.lines().filter_map(|line| self.stream_item(line)).collect()
    }
}

fn cursor_from_value(root: &Value, name: &str) -> Option<i64> {
    find_property(root, name).and_then(integer)
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::json()
    }
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}
