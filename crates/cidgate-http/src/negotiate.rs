//! Response format negotiation.
//!
//! An explicit `format` query parameter wins; otherwise the first `Accept`
//! item naming one of the gateway's vendor media types picks the format.
//! Anything else gets the default web representation.

use std::collections::HashMap;
use std::fmt;

use cidgate_core::GatewayError;
use cidgate_core::cids::{CBOR, DAG_CBOR, DAG_JSON, JSON};

/// Accept items with these prefixes are treated as explicit format requests.
const NEGOTIATED_PREFIXES: [&str; 5] = [
    "application/vnd.ipld.",
    "application/x-tar",
    "application/json",
    "application/cbor",
    "application/vnd.ipfs.",
];

/// A representation the gateway can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseFormat {
    /// Web representation chosen from the content itself.
    Default,
    /// The terminal block verbatim.
    Raw,
    /// A CARv1 export of the DAG.
    Car,
    /// A tar archive of a UnixFS tree.
    Tar,
    /// Plain JSON.
    Json,
    /// Plain CBOR.
    Cbor,
    /// DAG-JSON.
    DagJson,
    /// DAG-CBOR.
    DagCbor,
    /// A signed naming record.
    NamingRecord,
}

impl ResponseFormat {
    /// Parse a `format` query parameter value.
    #[must_use]
    pub fn from_query(value: &str) -> Option<Self> {
        Some(match value {
            "raw" => Self::Raw,
            "car" => Self::Car,
            "tar" => Self::Tar,
            "json" => Self::Json,
            "cbor" => Self::Cbor,
            "dag-json" => Self::DagJson,
            "dag-cbor" => Self::DagCbor,
            "naming-record" | "ipns-record" => Self::NamingRecord,
            _ => return None,
        })
    }

    /// Map a media type without parameters to a format.
    #[must_use]
    pub fn from_media_type(essence: &str) -> Option<Self> {
        Some(match essence {
            "application/vnd.ipld.raw" => Self::Raw,
            "application/vnd.ipld.car" => Self::Car,
            "application/x-tar" => Self::Tar,
            "application/json" => Self::Json,
            "application/cbor" => Self::Cbor,
            "application/vnd.ipld.dag-json" => Self::DagJson,
            "application/vnd.ipld.dag-cbor" => Self::DagCbor,
            "application/vnd.ipfs.ipns-record" => Self::NamingRecord,
            _ => return None,
        })
    }

    /// Media type of the representation, `None` for the default one.
    #[must_use]
    pub fn media_type(self) -> Option<&'static str> {
        Some(match self {
            Self::Default => return None,
            Self::Raw => "application/vnd.ipld.raw",
            Self::Car => "application/vnd.ipld.car",
            Self::Tar => "application/x-tar",
            Self::Json => "application/json",
            Self::Cbor => "application/cbor",
            Self::DagJson => "application/vnd.ipld.dag-json",
            Self::DagCbor => "application/vnd.ipld.dag-cbor",
            Self::NamingRecord => "application/vnd.ipfs.ipns-record",
        })
    }

    /// Suffix appended to the ETag: the media type after its last `/` or `.`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cidgate_http::negotiate::ResponseFormat;
    ///
    /// assert_eq!(ResponseFormat::Car.etag_suffix(), Some("car"));
    /// assert_eq!(ResponseFormat::Tar.etag_suffix(), Some("x-tar"));
    /// assert_eq!(ResponseFormat::Default.etag_suffix(), None);
    /// ```
    #[must_use]
    pub fn etag_suffix(self) -> Option<&'static str> {
        self.media_type()
            .and_then(|media| media.rsplit(['/', '.']).next())
    }

    /// The multicodec a structured-data format converts into.
    #[must_use]
    pub fn codec(self) -> Option<u64> {
        match self {
            Self::Json => Some(JSON),
            Self::Cbor => Some(CBOR),
            Self::DagJson => Some(DAG_JSON),
            Self::DagCbor => Some(DAG_CBOR),
            _ => None,
        }
    }

    /// The structured-data format matching a multicodec.
    #[must_use]
    pub fn for_codec(codec: u64) -> Option<Self> {
        match codec {
            JSON => Some(Self::Json),
            CBOR => Some(Self::Cbor),
            DAG_JSON => Some(Self::DagJson),
            DAG_CBOR => Some(Self::DagCbor),
            _ => None,
        }
    }

    /// Whether responses in this format are not byte-for-byte reproducible.
    #[must_use]
    pub fn is_weak(self) -> bool {
        matches!(self, Self::Car | Self::Tar)
    }
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.media_type().unwrap_or("default"))
    }
}

/// Outcome of negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Chosen representation.
    pub format: ResponseFormat,
    /// Media type parameters from the matching `Accept` item, keys lowercased.
    pub params: HashMap<String, String>,
    /// Whether the format was asked for explicitly.
    pub explicit: bool,
}

impl Negotiated {
    fn default_format() -> Self {
        Self {
            format: ResponseFormat::Default,
            params: HashMap::new(),
            explicit: false,
        }
    }
}

/// Pick a response format from the `format` parameter and `Accept` values.
///
/// # Errors
///
/// Returns [`GatewayError::BadRequest`] for an unknown `format` value or an
/// unparseable/unknown vendor media type.
///
/// # Examples
///
/// ```
/// use cidgate_http::negotiate::{ResponseFormat, negotiate};
///
/// let n = negotiate(None, ["text/html, application/vnd.ipld.car; version=1"]).unwrap();
/// assert_eq!(n.format, ResponseFormat::Car);
/// assert_eq!(n.params["version"], "1");
///
/// let n = negotiate(Some("raw"), ["application/vnd.ipld.car"]).unwrap();
/// assert_eq!(n.format, ResponseFormat::Raw);
/// ```
pub fn negotiate<'a, I>(format: Option<&str>, accept: I) -> Result<Negotiated, GatewayError>
where
    I: IntoIterator<Item = &'a str>,
{
    if let Some(value) = format.filter(|v| !v.is_empty()) {
        let format = ResponseFormat::from_query(value)
            .ok_or_else(|| GatewayError::BadRequest(format!("unsupported format {value:?}")))?;
        return Ok(Negotiated {
            format,
            params: HashMap::new(),
            explicit: true,
        });
    }

    for header in accept {
        for item in header.split(',').map(str::trim) {
            if !NEGOTIATED_PREFIXES.iter().any(|p| item.starts_with(p)) {
                continue;
            }
            let media: mime::Mime = item.parse().map_err(|e| {
                GatewayError::BadRequest(format!("invalid Accept item {item:?}: {e}"))
            })?;
            let format = ResponseFormat::from_media_type(media.essence_str()).ok_or_else(|| {
                GatewayError::BadRequest(format!(
                    "unsupported media type {:?}",
                    media.essence_str()
                ))
            })?;
            let params = media
                .params()
                .map(|(name, value)| (name.as_str().to_ascii_lowercase(), value.to_string()))
                .collect();
            return Ok(Negotiated {
                format,
                params,
                explicit: true,
            });
        }
    }

    Ok(Negotiated::default_format())
}

/// Whether the `Accept` values admit an HTML response.
#[must_use]
pub fn accepts_html<'a, I>(accept: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    accept.into_iter().any(|header| {
        header.split(',').any(|item| {
            let essence = item.split(';').next().unwrap_or_default().trim();
            matches!(essence, "text/html" | "text/*" | "*/*")
        })
    })
}
