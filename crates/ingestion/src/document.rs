//! Document normalization
//!
//! `ExtractedDocument` is the tidy form of a TEI document. `DocumentRecord`
//! is what gets persisted: the extracted document with enrichment merged
//! over it and DOI/abstract possibly backfilled from an earlier upload.

use crate::enrichment::EnrichedMetadata;
use crate::extraction::tei::{squash_whitespace, strip_markup, TeiDocument};
use paperintake_common::db::models::Paper;
use paperintake_common::NewPaper;
use regex_lite::Regex;
use std::sync::OnceLock;

/// Header of the synthetic first section
pub const ABSTRACT_HEADER: &str = "abstract";

fn doi_pattern() -> &'static Regex {
    static DOI: OnceLock<Regex> = OnceLock::new();
    DOI.get_or_init(|| {
        Regex::new(r"\b(10\.[0-9]{4,}(?:\.[0-9]+)*/\S+)\b").expect("valid DOI pattern")
    })
}

fn year_pattern() -> &'static Regex {
    static YEAR: OnceLock<Regex> = OnceLock::new();
    YEAR.get_or_init(|| Regex::new(r"[0-9]{4}").expect("valid year pattern"))
}

fn term_pattern() -> &'static Regex {
    static TERM: OnceLock<Regex> = OnceLock::new();
    TERM.get_or_init(|| Regex::new(r"(?is)<term>(.*?)</term>").expect("valid term pattern"))
}

/// First DOI-shaped substring of `text`
pub fn extract_doi(text: &str) -> Option<String> {
    doi_pattern()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// A typed DOI value too short for the registrant-code pattern (`10.1/x`)
fn bare_doi(value: &str) -> Option<String> {
    let value = value.trim();
    (value.starts_with("10.") && value.contains('/') && !value.contains(char::is_whitespace))
        .then(|| value.to_string())
}

/// Last four-digit run of a date string
pub fn extract_year(date: &str) -> Option<String> {
    year_pattern()
        .find_iter(date)
        .last()
        .map(|m| m.as_str().to_string())
}

/// Keywords recovered from the raw `<keywords>` markup
///
/// Uses `<term>` elements when present, otherwise the element's text. Both
/// are split on commas and semicolons.
pub fn keywords_from_markup(markup: &str) -> Vec<String> {
    let terms: Vec<String> = term_pattern()
        .captures_iter(markup)
        .filter_map(|c| c.get(1))
        .map(|m| strip_markup(m.as_str()))
        .collect();

    let candidates = if terms.is_empty() {
        vec![strip_markup(markup)]
    } else {
        terms
    };
    split_keywords(candidates)
}

fn split_keywords(candidates: Vec<String>) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for candidate in candidates {
        for part in candidate.split([',', ';']) {
            let keyword = squash_whitespace(part);
            if !keyword.is_empty() && !keywords.contains(&keyword) {
                keywords.push(keyword);
            }
        }
    }
    keywords
}

/// Title as stored: hyphens become spaces, whitespace collapsed
pub fn normalize_title(title: &str) -> String {
    squash_whitespace(&title.replace('-', " "))
}

// ============================================================================
// Extracted document
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSection {
    /// Lower-cased heading
    pub heading: String,
    pub paragraphs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub title: String,
    pub doi: String,
    pub issn: String,
    pub abstract_text: String,
    pub date: String,
    pub year: String,
    pub keywords: Vec<String>,
    pub sections: Vec<DocumentSection>,
    pub authors: Vec<String>,
}

impl ExtractedDocument {
    pub fn from_tei(tei: TeiDocument) -> Self {
        let doi = Self::pick_doi(&tei);
        let issn = tei
            .identifiers
            .iter()
            .find(|i| {
                i.kind
                    .as_deref()
                    .is_some_and(|k| k.eq_ignore_ascii_case("issn") || k.eq_ignore_ascii_case("eissn"))
            })
            .map(|i| i.value.clone())
            .unwrap_or_default();

        let keywords = if tei.keyword_terms.is_empty() {
            keywords_from_markup(&tei.keywords_markup)
        } else {
            split_keywords(tei.keyword_terms)
        };

        let sections = tei
            .sections
            .into_iter()
            .filter(|s| !s.paragraphs.is_empty())
            .map(|s| DocumentSection {
                heading: squash_whitespace(&s.heading).to_lowercase(),
                paragraphs: s.paragraphs,
            })
            .collect();

        Self {
            title: squash_whitespace(&tei.title),
            doi,
            issn,
            abstract_text: squash_whitespace(&tei.abstract_paragraphs.join(" ")),
            year: extract_year(&tei.date).unwrap_or_default(),
            date: tei.date,
            keywords,
            sections,
            authors: tei.authors,
        }
    }

    /// The identifier typed `DOI`; otherwise the second identifier when
    /// there are several, else the first; otherwise any DOI-shaped one
    fn pick_doi(tei: &TeiDocument) -> String {
        let ids = &tei.identifiers;
        let typed = ids
            .iter()
            .find(|i| i.kind.as_deref().is_some_and(|k| k.eq_ignore_ascii_case("doi")));

        if let Some(doi) = typed.and_then(|i| extract_doi(&i.value).or_else(|| bare_doi(&i.value))) {
            return doi;
        }

        let positional = if ids.len() > 1 { ids.get(1) } else { ids.first() };
        positional
            .and_then(|i| extract_doi(&i.value))
            .or_else(|| ids.iter().find_map(|i| extract_doi(&i.value)))
            .unwrap_or_default()
    }
}

// ============================================================================
// Document record
// ============================================================================

/// Section ready for persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDraft {
    pub header: String,
    pub text: String,
}

/// Merged metadata and sections of one upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRecord {
    pub title: String,
    pub doi: String,
    pub issn: String,
    pub abstract_text: String,
    pub year: String,
    pub keywords: Vec<String>,
    pub authors: Vec<String>,
    pub sections: Vec<DocumentSection>,
}

fn prefer(enriched: &str, extracted: String) -> String {
    if enriched.trim().is_empty() {
        extracted
    } else {
        enriched.trim().to_string()
    }
}

impl DocumentRecord {
    /// Non-empty enrichment fields win over extracted ones
    pub fn merge(extracted: ExtractedDocument, enriched: Option<&EnrichedMetadata>) -> Self {
        let empty = EnrichedMetadata::default();
        let enriched = enriched.unwrap_or(&empty);

        Self {
            title: normalize_title(&prefer(&enriched.title, extracted.title)),
            doi: prefer(&enriched.doi, extracted.doi),
            issn: prefer(&enriched.issn, extracted.issn),
            abstract_text: squash_whitespace(&prefer(
                &enriched.abstract_text,
                extracted.abstract_text,
            )),
            year: prefer(&enriched.year, extracted.year),
            keywords: extracted.keywords,
            authors: extracted.authors,
            sections: extracted.sections,
        }
    }

    /// Fill a missing DOI and abstract from a paper already in the screen
    pub fn backfill_from(&mut self, paper: &Paper) -> bool {
        let mut changed = false;
        if self.doi.is_empty() {
            if let Some(doi) = paper.doi() {
                self.doi = doi.to_string();
                changed = true;
            }
        }
        if self.abstract_text.is_empty() && !paper.abstract_text.is_empty() {
            self.abstract_text = paper.abstract_text.clone();
            changed = true;
        }
        changed
    }

    /// Synthetic abstract section, then one section per paragraph
    pub fn section_drafts(&self) -> Vec<SectionDraft> {
        let mut drafts = vec![SectionDraft {
            header: ABSTRACT_HEADER.to_string(),
            text: self.abstract_text.clone(),
        }];
        for section in &self.sections {
            for paragraph in &section.paragraphs {
                drafts.push(SectionDraft {
                    header: section.heading.clone(),
                    text: paragraph.clone(),
                });
            }
        }
        drafts
    }

    pub fn to_new_paper(&self, user_id: i64, screen_id: i64, pubmed_id: Option<i64>) -> NewPaper {
        let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());
        NewPaper {
            user_id,
            screen_id,
            title: self.title.clone(),
            abstract_text: self.abstract_text.clone(),
            doi: non_empty(&self.doi),
            issn: non_empty(&self.issn),
            year: non_empty(&self.year),
            pubmed_id,
        }
    }
}
