//! SRA catalog access through NCBI E-utilities
//!
//! `esearch` turns a query window into UIDs plus the total hit count;
//! `efetch ... rettype=runinfo` turns a batch of UIDs into per-run rows.
//! Both responses are XML and parsed with quick-xml.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use sraline_core::{CatalogError, get_text};

use crate::state::{Candidate, ItemDescriptor, is_safe_identifier};

/// One window of search results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub candidates: Vec<Candidate>,
    pub total_available: usize,
}

/// Catalog seam: search + batched resolve. No retries here; the controller owns them.
pub trait Catalog: Send + Sync {
    fn search(&self, query: &str, window: usize, offset: usize)
    -> Result<SearchPage, CatalogError>;

    fn resolve(&self, candidates: &[Candidate]) -> Result<Vec<ItemDescriptor>, CatalogError>;
}

/// NCBI E-utilities client for the `sra` database
#[derive(Debug, Clone)]
pub struct EutilsCatalog {
    base_url: String,
    trace_base: String,
    api_key: Option<String>,
    email: Option<String>,
}

impl EutilsCatalog {
    pub fn new(base_url: &str, trace_base: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            trace_base: trace_base.to_string(),
            api_key: None,
            email: None,
        }
    }

    pub fn with_credentials(mut self, api_key: Option<String>, email: Option<String>) -> Self {
        self.api_key = api_key;
        self.email = email;
        self
    }

    fn endpoint(&self, tool: &str) -> String {
        format!("{}/{tool}.fcgi", self.base_url.trim_end_matches('/'))
    }

    /// Query-string suffix carrying credentials, if any
    fn credentials(&self) -> String {
        let mut suffix = String::new();
        if let Some(key) = &self.api_key {
            suffix.push_str("&api_key=");
            suffix.push_str(&urlencoding::encode(key));
        }
        if let Some(email) = &self.email {
            suffix.push_str("&email=");
            suffix.push_str(&urlencoding::encode(email));
        }
        suffix
    }

    fn search_url(&self, query: &str, window: usize, offset: usize) -> String {
        format!(
            "{}?db=sra&term={}&retmax={window}&retstart={offset}{}",
            self.endpoint("esearch"),
            urlencoding::encode(query),
            self.credentials()
        )
    }

    fn resolve_url(&self, candidates: &[Candidate]) -> String {
        let ids: Vec<&str> = candidates.iter().map(|c| c.uid.as_str()).collect();
        format!(
            "{}?db=sra&id={}&rettype=runinfo&retmode=xml{}",
            self.endpoint("efetch"),
            ids.join(","),
            self.credentials()
        )
    }
}

impl Catalog for EutilsCatalog {
    fn search(
        &self,
        query: &str,
        window: usize,
        offset: usize,
    ) -> Result<SearchPage, CatalogError> {
        let body = get_text(&self.search_url(query, window, offset))?;
        parse_esearch(&body).map_err(|e| CatalogError::Malformed(format!("{e:#}")))
    }

    fn resolve(&self, candidates: &[Candidate]) -> Result<Vec<ItemDescriptor>, CatalogError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let body = get_text(&self.resolve_url(candidates))?;
        let rows = parse_runinfo(&body).map_err(|e| CatalogError::Malformed(format!("{e:#}")))?;
        log::debug!("runinfo: {} rows for {} UIDs", rows.len(), candidates.len());
        Ok(rows
            .into_iter()
            .filter_map(|row| descriptor_from_row(row, &self.trace_base))
            .collect())
    }
}

/// Build a descriptor from one runinfo row; rows without a `run` are skipped.
fn descriptor_from_row(
    attributes: BTreeMap<String, String>,
    trace_base: &str,
) -> Option<ItemDescriptor> {
    let Some(run) = attributes.get("run").filter(|r| !r.is_empty()).cloned() else {
        log::warn!("runinfo row without Run accession, skipping");
        return None;
    };
    if !is_safe_identifier(&run) {
        log::warn!("runinfo row with unusable Run accession {run:?}, skipping");
        return None;
    }
    let declared_size = attributes
        .get("size_mb")
        .and_then(|s| s.parse::<u64>().ok())
        .map(|mb| mb * 1024 * 1024);
    Some(ItemDescriptor {
        locator: format!("{trace_base}{run}"),
        identifier: run,
        declared_size,
        attributes,
    })
}

/// Parse an `<eSearchResult>` document.
///
/// ```xml
/// <eSearchResult><Count>1186478</Count>...<IdList><Id>37400425</Id>...</IdList></eSearchResult>
/// ```
pub fn parse_esearch(xml: &str) -> Result<SearchPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut count: Option<usize> = None;
    let mut candidates = Vec::new();
    let mut in_id_list = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("XML parse error")? {
            Event::Start(e) => match e.name().as_ref() {
                b"IdList" => in_id_list = true,
                b"Id" if in_id_list => {
                    let uid = read_text(&mut reader)?;
                    if !uid.is_empty() {
                        candidates.push(Candidate { uid });
                    }
                }
                // The top-level Count comes first; translation stacks carry their own
                b"Count" if count.is_none() => {
                    let text = read_text(&mut reader)?;
                    count = Some(
                        text.parse()
                            .with_context(|| format!("invalid <Count> value {text:?}"))?,
                    );
                }
                b"ERROR" => {
                    let msg = read_text(&mut reader)?;
                    anyhow::bail!("esearch error: {msg}");
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"IdList" => in_id_list = false,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let total_available = count.context("esearch response has no <Count>")?;
    Ok(SearchPage {
        candidates,
        total_available,
    })
}

/// Parse a `<SraRunInfo>` document into one attribute map per `<Row>`.
///
/// Keys are lower-cased tag names (`run`, `size_mb`, `download_path`, …).
pub fn parse_runinfo(xml: &str) -> Result<Vec<BTreeMap<String, String>>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut rows = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("XML parse error")? {
            Event::Start(e) if e.name().as_ref() == b"Row" => rows.push(parse_row(&mut reader)?),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(rows)
}

fn parse_row(reader: &mut Reader<&[u8]>) -> Result<BTreeMap<String, String>> {
    let mut row = BTreeMap::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                let key = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                let value = read_text(reader)?;
                row.insert(key, value);
            }
            Event::End(e) if e.name().as_ref() == b"Row" => break,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(row)
}

/// Text content up to the matching end tag
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(e) => text.push_str(&e.unescape()?),
            Event::End(_) => break,
            Event::Start(_) => text.push_str(&read_text(reader)?),
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(text.trim().to_string())
}
