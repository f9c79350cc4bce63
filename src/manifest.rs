//! Product manifests, used to fetch a subset of the files inside a product.
//!
//! Sentinel-1 and Sentinel-2 products list their files in a SAFE `manifest.safe`,
//! Sentinel-3 products in a SIP `manifest.xml`.
use regex::Regex;
use roxmltree::Node;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Safe,
    Sip,
}

impl ManifestKind {
    pub fn for_collection(collection: &str) -> Option<Self> {
        match collection {
            "SENTINEL-1" | "SENTINEL-2" => Some(Self::Safe),
            "SENTINEL-3" => Some(Self::Sip),
            _ => None,
        }
    }

    pub fn filename(self) -> &'static str {
        match self {
            Self::Safe => "manifest.safe",
            Self::Sip => "manifest.xml",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DataObject {
    pub id: Option<String>,
    pub filesize: Option<u64>,
    /// Path of the file inside the product directory.
    pub relative_href: String,
}

impl DataObject {
    fn from_safe(data_object: Node) -> Option<Self> {
        let byte_stream = data_object
            .children()
            .find(|n| n.has_tag_name("byteStream"))?;
        let file_location = byte_stream
            .descendants()
            .find(|n| n.has_tag_name("fileLocation"))?;
        let href = file_location.attribute("href")?;
        let relative_href = href.strip_prefix("./").unwrap_or(href).to_string();

        Some(Self {
            id: data_object.attribute("ID").map(str::to_string),
            filesize: byte_stream.attribute("size").and_then(|s| s.parse().ok()),
            relative_href,
        })
    }

    fn from_sip(data_object: Node) -> Option<Self> {
        let path = data_object
            .children()
            .find(|n| n.has_tag_name("path"))?
            .text()?
            .trim();
        // Some SIP paths carry a prefix; the file lives at the product root
        let name = path.rsplit('/').next().filter(|s| !s.is_empty())?;

        let filesize = data_object
            .children()
            .find(|n| n.has_tag_name("size"))
            .and_then(|n| n.text())
            .and_then(|s| s.trim().parse().ok());

        Some(Self {
            id: data_object.attribute("ID").map(str::to_string),
            filesize,
            relative_href: name.to_string(),
        })
    }
}

pub struct Manifest {
    kind: ManifestKind,
    content: String,
}

impl Manifest {
    pub fn new(kind: ManifestKind, content: String) -> Self {
        Self { kind, content }
    }

    pub fn parse(&self) -> Result<Vec<DataObject>> {
        let doc = roxmltree::Document::parse(&self.content)?;
        let (section, build): (&str, fn(Node) -> Option<DataObject>) = match self.kind {
            ManifestKind::Safe => ("dataObjectSection", DataObject::from_safe),
            ManifestKind::Sip => ("dataSection", DataObject::from_sip),
        };

        let section_node = doc
            .descendants()
            .find(|n| n.has_tag_name(section))
            .ok_or_else(|| {
                Error::DownloadFailed(format!(
                    "Unable to locate '{}' in {}",
                    section,
                    self.kind.filename()
                ))
            })?;

        Ok(section_node
            .children()
            .filter(|n| n.has_tag_name("dataObject"))
            .filter_map(build)
            .collect())
    }

    /// Paths of the files matching a shell glob.
    pub fn filter(&self, pattern: &str) -> Result<Vec<String>> {
        let glob = Glob::new(pattern)?;
        Ok(self
            .parse()?
            .into_iter()
            .map(|d| d.relative_href)
            .filter(|href| glob.matches(href))
            .collect())
    }
}

/// Shell-style pattern where `*` also crosses `/`.
pub struct Glob(Regex);

impl Glob {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut expr = String::from("^");
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '[' => {
                    let mut lookahead = chars.clone();
                    let negated = lookahead.peek() == Some(&'!');
                    if negated {
                        lookahead.next();
                    }
                    let mut members = String::new();
                    let mut closed = false;
                    for inner in lookahead.by_ref() {
                        // A leading ']' is a member, not the end of the class
                        if inner == ']' && !members.is_empty() {
                            closed = true;
                            break;
                        }
                        members.push(inner);
                    }
                    if !closed {
                        // Unbalanced bracket matches itself
                        expr.push_str(r"\[");
                        continue;
                    }
                    chars = lookahead;
                    expr.push('[');
                    if negated {
                        expr.push('^');
                    }
                    for member in members.chars() {
                        if matches!(member, '\\' | '[' | ']' | '&' | '~' | '^') {
                            expr.push('\\');
                        }
                        expr.push(member);
                    }
                    expr.push(']');
                }
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let re = Regex::new(&expr).map_err(|e| {
            Error::InvalidSearchTerms(format!("Invalid filter pattern {}: {}", pattern, e))
        })?;
        Ok(Self(re))
    }

    pub fn matches(&self, path: &str) -> bool {
        self.0.is_match(path)
    }
}

/// OData URL of one file inside a product.
pub fn node_url(odata: &Url, product_id: &str, product_title: &str, href: &str) -> Result<Url> {
    let nodes: Vec<String> = href
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(|part| format!("Nodes({})", part))
        .collect();
    let path = format!(
        "Products({})/Nodes({})/{}/$value",
        product_id,
        product_title,
        nodes.join("/")
    );
    Ok(odata.join(&path)?)
}
