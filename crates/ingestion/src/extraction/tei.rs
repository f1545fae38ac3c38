//! Streaming TEI reader
//!
//! Pulls the handful of fields the pipeline needs out of a GROBID TEI
//! document in a single pass. Elements are matched by local name against
//! the chain of open ancestors, so namespace prefixes don't matter.
//! Text inside a captured element (including nested markup such as
//! `<ref>`) is concatenated and whitespace-collapsed.

use super::ExtractionError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex_lite::Regex;
use std::sync::OnceLock;

/// `<idno>` from the source description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeiIdentifier {
    /// The `type` attribute (`DOI`, `ISSN`, `MD5`, ...)
    pub kind: Option<String>,
    pub value: String,
}

/// Body `<div>` with its heading and paragraphs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeiSection {
    pub heading: String,
    pub paragraphs: Vec<String>,
}

/// Raw fields read from a TEI document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeiDocument {
    pub title: String,
    pub identifiers: Vec<TeiIdentifier>,
    /// Publication date text, falling back to its `when` attribute
    pub date: String,
    pub abstract_paragraphs: Vec<String>,
    pub keyword_terms: Vec<String>,
    /// Verbatim `<keywords>` element, kept for the markup fallback
    pub keywords_markup: String,
    pub sections: Vec<TeiSection>,
    pub authors: Vec<String>,
}

/// Parse TEI XML
pub fn parse(xml: &str) -> Result<TeiDocument, ExtractionError> {
    TeiReader::new(xml).run().map_err(|e| match e {
        ReadError::Xml { position, source } => {
            ExtractionError::InvalidDocument(format!("{} at byte {}", source, position))
        }
        ReadError::NotTei => ExtractionError::InvalidDocument("no <TEI> root element".into()),
    })
}

/// Collapse runs of whitespace into single spaces and trim
pub fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop tags from a markup fragment and collapse the remaining text
pub fn strip_markup(markup: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));
    squash_whitespace(&tag.replace_all(markup, " "))
}

// ============================================================================
// Reader state
// ============================================================================

enum ReadError {
    Xml {
        position: u64,
        source: quick_xml::Error,
    },
    NotTei,
}

#[derive(Debug, Clone)]
enum Field {
    Title,
    Identifier(Option<String>),
    Date,
    ImprintDate,
    AbstractParagraph,
    KeywordTerm,
    Heading(usize),
    Paragraph(usize),
    Forename,
    Surname,
}

struct Capture {
    field: Field,
    depth: usize,
    text: String,
}

#[derive(Default)]
struct PendingAuthor {
    forenames: Vec<String>,
    surname: String,
}

struct TeiReader<'a> {
    input: &'a str,
    stack: Vec<String>,
    doc: TeiDocument,
    capture: Option<Capture>,
    open_divs: Vec<usize>,
    author: Option<PendingAuthor>,
    keywords_start: Option<usize>,
    date_when: Option<String>,
    imprint_date: Option<String>,
    saw_root: bool,
}

impl<'a> TeiReader<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            stack: Vec::new(),
            doc: TeiDocument::default(),
            capture: None,
            open_divs: Vec::new(),
            author: None,
            keywords_start: None,
            date_when: None,
            imprint_date: None,
            saw_root: false,
        }
    }

    fn run(mut self) -> Result<TeiDocument, ReadError> {
        let mut reader = Reader::from_str(self.input);

        loop {
            let before = reader.buffer_position();
            let event = reader.read_event().map_err(|source| ReadError::Xml {
                position: reader.buffer_position(),
                source,
            })?;
            let xml_err = |source: quick_xml::Error| ReadError::Xml {
                position: before,
                source,
            };

            match event {
                Event::Start(e) => self.open(&e, before as usize).map_err(xml_err)?,
                Event::Empty(e) => {
                    self.open(&e, before as usize).map_err(xml_err)?;
                    self.close(reader.buffer_position() as usize);
                }
                Event::End(_) => self.close(reader.buffer_position() as usize),
                Event::Text(e) => {
                    let text = e.unescape().map_err(xml_err)?;
                    self.push_text(&text);
                }
                Event::CData(e) => {
                    let bytes = e.into_inner();
                    self.push_text(&String::from_utf8_lossy(&bytes));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !self.saw_root {
            return Err(ReadError::NotTei);
        }
        if self.doc.date.is_empty() {
            self.doc.date = self
                .date_when
                .take()
                .or_else(|| self.imprint_date.take())
                .unwrap_or_default();
        }
        Ok(self.doc)
    }

    /// Whether `path` appears, in order, among the open elements
    fn under(&self, path: &[&str]) -> bool {
        let mut matched = 0;
        for name in &self.stack {
            if matched < path.len() && path[matched] == name.as_str() {
                matched += 1;
            }
        }
        matched == path.len()
    }

    fn parent(&self) -> Option<&str> {
        let len = self.stack.len();
        (len >= 2).then(|| self.stack[len - 2].as_str())
    }

    fn in_body(&self) -> bool {
        self.under(&["text", "body"])
    }

    fn open(&mut self, e: &BytesStart<'_>, before: usize) -> quick_xml::Result<()> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        self.stack.push(name.clone());

        match name.as_str() {
            "TEI" => self.saw_root = true,
            "div" if self.in_body() => {
                self.doc.sections.push(TeiSection::default());
                self.open_divs.push(self.doc.sections.len() - 1);
            }
            "author" if self.under(&["sourceDesc", "biblStruct", "analytic"]) => {
                self.author = Some(PendingAuthor::default());
            }
            "keywords" if self.under(&["profileDesc", "textClass"]) => {
                self.keywords_start = Some(before);
            }
            "date" if self.under(&["teiHeader", "publicationStmt"]) => {
                if self.date_when.is_none() {
                    self.date_when = attribute(e, "when")?;
                }
            }
            "date" if self.under(&["sourceDesc", "imprint"]) => {
                if self.imprint_date.is_none() {
                    self.imprint_date = attribute(e, "when")?;
                }
            }
            _ => {}
        }

        if self.capture.is_none() {
            if let Some(field) = self.field_for(&name, e)? {
                self.capture = Some(Capture {
                    field,
                    depth: self.stack.len(),
                    text: String::new(),
                });
            }
        }
        Ok(())
    }

    fn field_for(&self, name: &str, e: &BytesStart<'_>) -> quick_xml::Result<Option<Field>> {
        let field = match name {
            "title" if self.doc.title.is_empty() && self.under(&["teiHeader", "titleStmt"]) => {
                Field::Title
            }
            "idno" if self.under(&["teiHeader", "sourceDesc", "biblStruct"]) => {
                Field::Identifier(attribute(e, "type")?)
            }
            "date" if self.under(&["teiHeader", "publicationStmt"]) => Field::Date,
            "date" if self.under(&["sourceDesc", "imprint"]) => Field::ImprintDate,
            "p" if self.under(&["teiHeader", "profileDesc", "abstract"]) => {
                Field::AbstractParagraph
            }
            "term" if self.under(&["textClass", "keywords"]) => Field::KeywordTerm,
            "head" | "p" if self.parent() == Some("div") && self.in_body() => {
                match self.open_divs.last() {
                    Some(&idx) if name == "head" => Field::Heading(idx),
                    Some(&idx) => Field::Paragraph(idx),
                    None => return Ok(None),
                }
            }
            "forename" if self.author.is_some() => Field::Forename,
            "surname" if self.author.is_some() => Field::Surname,
            _ => return Ok(None),
        };
        Ok(Some(field))
    }

    fn push_text(&mut self, text: &str) {
        if let Some(capture) = self.capture.as_mut() {
            capture.text.push_str(text);
        }
    }

    fn close(&mut self, after: usize) {
        let depth = self.stack.len();
        if self.capture.as_ref().is_some_and(|c| c.depth == depth) {
            if let Some(capture) = self.capture.take() {
                self.finish(capture);
            }
        }

        let in_body = self.in_body();
        let Some(name) = self.stack.pop() else {
            return;
        };

        match name.as_str() {
            "div" if in_body => {
                self.open_divs.pop();
            }
            "author" => {
                if let Some(author) = self.author.take() {
                    let mut parts = author.forenames;
                    parts.push(author.surname);
                    let full = squash_whitespace(&parts.join(" "));
                    if !full.is_empty() {
                        self.doc.authors.push(full);
                    }
                }
            }
            "keywords" => {
                if let Some(start) = self.keywords_start.take() {
                    self.doc.keywords_markup =
                        self.input.get(start..after).unwrap_or_default().trim().to_string();
                }
            }
            _ => {}
        }
    }

    fn finish(&mut self, capture: Capture) {
        let text = squash_whitespace(&capture.text);

        match capture.field {
            Field::Title => self.doc.title = text,
            Field::Identifier(kind) => {
                if !text.is_empty() {
                    self.doc.identifiers.push(TeiIdentifier { kind, value: text });
                }
            }
            Field::Date => {
                if self.doc.date.is_empty() {
                    self.doc.date = text;
                }
            }
            Field::ImprintDate => {
                if !text.is_empty() {
                    self.imprint_date = Some(text);
                }
            }
            Field::AbstractParagraph => push_non_empty(&mut self.doc.abstract_paragraphs, text),
            Field::KeywordTerm => push_non_empty(&mut self.doc.keyword_terms, text),
            Field::Heading(idx) => {
                if let Some(section) = self.doc.sections.get_mut(idx) {
                    section.heading = text;
                }
            }
            Field::Paragraph(idx) => {
                if let Some(section) = self.doc.sections.get_mut(idx) {
                    push_non_empty(&mut section.paragraphs, text);
                }
            }
            Field::Forename => {
                if let Some(author) = self.author.as_mut() {
                    push_non_empty(&mut author.forenames, text);
                }
            }
            Field::Surname => {
                if let Some(author) = self.author.as_mut() {
                    author.surname = text;
                }
            }
        }
    }
}

fn push_non_empty(target: &mut Vec<String>, text: String) {
    if !text.is_empty() {
        target.push(text);
    }
}

fn attribute(e: &BytesStart<'_>, name: &str) -> quick_xml::Result<Option<String>> {
    match e.try_get_attribute(name)? {
        Some(attr) => Ok(Some(attr.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}
