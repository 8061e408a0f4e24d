use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

/// Structural decomposition of an absolute URL, shaped like the fields of
/// a WHATWG `URL` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlDescriptor {
    pub protocol: String,
    pub hostname: String,
    pub port: String,
    pub pathname: String,
    pub search: String,
    pub hash: String,
    pub origin: String,
    pub host: String,
    /// Last occurrence wins on duplicate names; keys iterate in sorted order.
    pub search_params: BTreeMap<String, String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// No input or empty input. Not an error.
    Empty,
    Invalid,
    Url(UrlDescriptor),
}

impl Parsed {
    pub fn into_descriptor(self) -> Option<UrlDescriptor> {
        match self {
            Parsed::Url(descriptor) => Some(descriptor),
            Parsed::Empty | Parsed::Invalid => None,
        }
    }
}

pub fn parse(raw: Option<&str>) -> Parsed {
    let Some(raw) = raw.filter(|r| !r.is_empty()) else {
        return Parsed::Empty;
    };

    match Url::parse(raw) {
        Ok(url) => Parsed::Url(describe(&url)),
        Err(e) => {
            warn!(referrer = raw, error = %e, "invalid referrer URL");
            Parsed::Invalid
        }
    }
}

pub fn describe(url: &Url) -> UrlDescriptor {
    let hostname = url.host_str().unwrap_or_default().to_owned();
    let port = url.port().map(|p| p.to_string()).unwrap_or_default();
    let host = if port.is_empty() {
        hostname.clone()
    } else {
        format!("{hostname}:{port}")
    };

    let search_params = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<BTreeMap<_, _>>();

    UrlDescriptor {
        protocol: format!("{}:", url.scheme()),
        hostname,
        port,
        pathname: url.path().to_owned(),
        search: prefixed('?', url.query()),
        hash: prefixed('#', url.fragment()),
        origin: url.origin().ascii_serialization(),
        host,
        search_params,
        username: url.username().to_owned(),
        password: url.password().unwrap_or_default().to_owned(),
    }
}

// `?` and `#` alone serialize as empty, matching `URL.search` / `URL.hash`.
fn prefixed(sigil: char, part: Option<&str>) -> String {
    match part {
        Some(p) if !p.is_empty() => format!("{sigil}{p}"),
        _ => String::new(),
    }
}
