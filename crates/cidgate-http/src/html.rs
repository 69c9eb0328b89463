//! Generated HTML pages: directory listings, structured-data summaries, and
//! the superfluous-namespace notice.

use std::fmt::Write as _;

use cidgate_core::{Cid, DirEntry};
use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Characters escaped when a directory entry name becomes a link.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

const STYLE: &str = "body{font-family:sans-serif;margin:2em}\
table{border-collapse:collapse}td{padding:.2em 1em .2em 0}\
.cid{font-family:monospace;color:#666}.size{text-align:right}";

/// A directory listing to render.
#[derive(Debug)]
pub struct DirectoryPage<'a> {
    /// Content path shown as the title.
    pub content_path: &'a str,
    /// URL path of the listing itself, ending in `/`.
    pub base_href: &'a str,
    /// CID of the directory.
    pub cid: &'a Cid,
    /// Cumulative size, if known.
    pub dag_size: Option<u64>,
    /// Entries in listing order.
    pub entries: &'a [DirEntry],
    /// Whether to offer a link to the parent directory.
    pub back_link: bool,
}

/// Render a directory listing.
#[must_use]
pub fn directory_listing(page: &DirectoryPage<'_>) -> String {
    let mut out = String::new();
    page_head(&mut out, page.content_path);

    write!(
        out,
        "<h1>Index of {}</h1><p class=\"cid\">{}",
        text(page.content_path),
        page.cid
    ).ok();
    if let Some(size) = page.dag_size {
        write!(out, " &middot; {}", format_size(size)).ok();
    }
    out.push_str("</p><table>");

    if page.back_link {
        write!(
            out,
            "<tr><td><a href=\"{}..\">..</a></td><td></td><td></td></tr>",
            attr(page.base_href)
        ).ok();
    }
    for entry in page.entries {
        let href = format!(
            "{}{}",
            page.base_href,
            utf8_percent_encode(&entry.name, PATH_SEGMENT)
        );
        write!(
            out,
            "<tr><td><a href=\"{}\">{}</a></td><td class=\"cid\">{}</td><td class=\"size\">{}</td></tr>",
            attr(&href),
            text(&entry.name),
            entry.cid,
            entry.size.map(format_size).unwrap_or_default(),
        ).ok();
    }

    out.push_str("</table></body></html>\n");
    out
}

/// Render a summary of a structured-data block, with download links for
/// its serializations.
#[must_use]
pub fn dag_index(content_path: &str, cid: &Cid, codec: &str, preview: &str) -> String {
    let mut out = String::new();
    page_head(&mut out, content_path);
    write!(
        out,
        "<h1>{}</h1><p class=\"cid\">{cid} ({})</p>\
         <p>Download as <a href=\"?format=dag-json\">DAG-JSON</a> \
         or <a href=\"?format=dag-cbor\">DAG-CBOR</a>.</p><pre>{}</pre>",
        text(content_path),
        text(codec),
        text(preview),
    ).ok();
    out.push_str("</body></html>\n");
    out
}

/// Render the notice for paths that repeat their namespace, pointing at the
/// corrected location.
#[must_use]
pub fn superfluous_namespace(corrected: &str) -> String {
    let mut out = String::new();
    write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <link rel=\"canonical\" href=\"{0}\">\
         <meta http-equiv=\"refresh\" content=\"10;url={0}\">\
         <title>Invalid path</title></head><body>\
         <p>The request path repeats its namespace. Did you mean \
         <a href=\"{0}\">{1}</a>?</p></body></html>\n",
        attr(corrected),
        text(corrected),
    ).ok();
    out
}

fn page_head(out: &mut String, title: &str) {
    write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{}</title><style>{STYLE}</style></head><body>",
        text(title)
    ).ok();
}

/// Human-readable size using SI units.
///
/// # Examples
///
/// ```
/// use cidgate_http::html::format_size;
///
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1_500), "1.5 kB");
/// assert_eq!(format_size(2_000_000), "2.0 MB");
/// ```
#[must_use]
pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 6] = ["kB", "MB", "GB", "TB", "PB", "EB"];
    if size < 1000 {
        return format!("{size} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = size as f64 / 1000.0;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use cidgate_core::cids::{RAW, sha256_cid};

    use super::*;

    fn entry(name: &str, size: u64) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            cid: sha256_cid(RAW, name.as_bytes()),
            size: Some(size),
        }
    }

    #[test]
    fn test_should_escape_entry_names() {
        let cid = sha256_cid(RAW, b"dir");
        let entries = vec![entry("<script>.txt", 10), entry("a b", 2048)];
        let html = directory_listing(&DirectoryPage {
            content_path: "/object/x/",
            base_href: "/object/x/",
            cid: &cid,
            dag_size: Some(4096),
            entries: &entries,
            back_link: false,
        });
        assert!(html.contains("&lt;script&gt;.txt"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("href=\"/object/x/a%20b\""));
        assert!(html.contains("2.0 kB"));
        assert!(!html.contains(">..<"));
    }

    #[test]
    fn test_should_offer_back_link_below_root() {
        let cid = sha256_cid(RAW, b"dir");
        let html = directory_listing(&DirectoryPage {
            content_path: "/object/x/sub/",
            base_href: "/object/x/sub/",
            cid: &cid,
            dag_size: None,
            entries: &[],
            back_link: true,
        });
        assert!(html.contains("href=\"/object/x/sub/..\""));
    }

    #[test]
    fn test_should_point_superfluous_namespace_page_at_correction() {
        let html = superfluous_namespace("/object/bafy?x=1&y=2");
        assert!(html.contains("rel=\"canonical\" href=\"/object/bafy?x=1&amp;y=2\""));
    }

    #[test]
    fn test_should_format_large_sizes() {
        assert_eq!(format_size(999), "999 B");
        assert_eq!(format_size(3_200_000_000), "3.2 GB");
    }
}
