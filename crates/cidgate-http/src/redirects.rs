//! `_redirects` rules and the not-found fallbacks for website content.
//!
//! A site published under an isolated origin can ship a `_redirects` file at
//! its root. When a default-format request misses, the first rule whose
//! `from` pattern matches the path below the root decides what happens:
//! a `200` rewrites the request, a `3xx` redirects the client, and a `4xx`
//! serves a custom page with that status. Sites without a matching rule
//! still get the legacy `object-404.html` lookup.
//!
//! # File format
//!
//! ```text
//! # comment
//! /old-path      /new-path           301
//! /posts/:year/* /archive/:year/:splat
//! /app/*         /index.html         200
//! /gone          /410.html           410
//! ```

use std::fmt;

use cidgate_core::{Cid, ContentPath, FileContent, GatewayError, GetResponse, ImmutablePath};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use tracing::debug;

use crate::body::GatewayBody;
use crate::caching::set_cache_headers;
use crate::handlers::{RequestContext, etag_for, read_to_bytes};
use crate::metrics::REDIRECT_RULES_APPLIED;
use crate::negotiate::{ResponseFormat, accepts_html};
use crate::response::redirect_response;

/// Name of the rules file at a site root.
pub const REDIRECTS_FILE: &str = "_redirects";

/// Name of the legacy not-found page.
pub const LEGACY_NOT_FOUND_FILE: &str = "object-404.html";

const ALLOWED_STATUSES: [u16; 9] = [200, 301, 302, 303, 307, 308, 404, 410, 451];

/// A `_redirects` line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} on line {line}")]
pub struct RuleError {
    /// One-based line number.
    pub line: usize,
    /// What is wrong with the line.
    pub reason: String,
}

/// One redirect rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    /// Pattern matched against the path below the site root.
    pub from: String,
    /// Target path or absolute URL, possibly with placeholders.
    pub to: String,
    /// What to do on a match.
    pub status: StatusCode,
}

impl RedirectRule {
    /// Match `path` and return the expanded target.
    ///
    /// `:name` segments capture one path segment. A trailing `*` captures
    /// the rest of the path as `:splat`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cidgate_http::redirects::Redirects;
    ///
    /// let rules = Redirects::parse("/posts/:year/* /archive/:year/:splat").unwrap();
    /// let rule = &rules.rules()[0];
    /// assert_eq!(rule.matches("/posts/2024/a/b").as_deref(), Some("/archive/2024/a/b"));
    /// assert_eq!(rule.matches("/pages/2024"), None);
    /// ```
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<String> {
        let pattern = self.from.trim_end_matches('/');
        let path = path.trim_end_matches('/');
        let pattern: Vec<&str> = pattern.split('/').collect();
        let segments: Vec<&str> = path.split('/').collect();

        let mut captures: Vec<(&str, String)> = Vec::new();
        for (i, part) in pattern.iter().enumerate() {
            if i == pattern.len() - 1 {
                if let Some(prefix) = part.strip_suffix('*') {
                    let rest = segments.get(i..).map(|s| s.join("/")).unwrap_or_default();
                    let splat = rest.strip_prefix(prefix)?;
                    captures.push(("splat", splat.to_owned()));
                    return Some(expand(&self.to, captures));
                }
            }
            let segment = segments.get(i)?;
            if let Some(name) = part.strip_prefix(':') {
                captures.push((name, (*segment).to_owned()));
            } else if part != segment {
                return None;
            }
        }
        (pattern.len() == segments.len()).then(|| expand(&self.to, captures))
    }
}

impl fmt::Display for RedirectRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.from, self.to, self.status.as_u16())
    }
}

fn expand(to: &str, mut captures: Vec<(&str, String)>) -> String {
    // Longer names first so `:a` never clobbers part of `:ab`.
    captures.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    captures
        .into_iter()
        .fold(to.to_owned(), |acc, (name, value)| {
            acc.replace(&format!(":{name}"), &value)
        })
}

/// A parsed `_redirects` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Redirects {
    rules: Vec<RedirectRule>,
}

impl Redirects {
    /// Parse a `_redirects` file.
    ///
    /// # Errors
    ///
    /// Returns the first malformed line.
    pub fn parse(input: &str) -> Result<Self, RuleError> {
        let mut rules = Vec::new();
        for (idx, line) in input.lines().enumerate() {
            let line_no = idx + 1;
            let fail = |reason: &str| RuleError {
                line: line_no,
                reason: reason.to_owned(),
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.len() {
                0 | 1 => return Err(fail("missing 'to' path")),
                2 | 3 => {}
                _ => return Err(fail("too many fields")),
            }

            let from = fields[0];
            if !from.starts_with('/') {
                return Err(fail("'from' path must begin with '/'"));
            }
            if from.contains('*') && !from.ends_with('*') {
                return Err(fail("'from' path can only end with splat (*)"));
            }

            let to = fields[1];
            let is_path = to.starts_with('/');
            if !is_path && url::Url::parse(to).is_err() {
                return Err(fail(
                    "'to' path must begin with '/' or be a fully-qualified URL",
                ));
            }

            let status = match fields.get(2) {
                None => StatusCode::MOVED_PERMANENTLY,
                Some(raw) if raw.ends_with('!') => {
                    return Err(fail("forced redirects (or shadowing) are not supported"));
                }
                Some(raw) => {
                    let code: u16 = raw
                        .parse()
                        .map_err(|_| fail(&format!("invalid status {raw:?}")))?;
                    if !ALLOWED_STATUSES.contains(&code) {
                        return Err(fail(&format!("status code {code} is not supported")));
                    }
                    StatusCode::from_u16(code)
                        .map_err(|_| fail(&format!("invalid status {raw:?}")))?
                }
            };
            if status == StatusCode::OK && !is_path {
                return Err(fail("rewrites (status 200) must target a path"));
            }

            rules.push(RedirectRule {
                from: from.to_owned(),
                to: to.to_owned(),
                status,
            });
        }
        Ok(Self { rules })
    }

    /// Rules in file order.
    #[must_use]
    pub fn rules(&self) -> &[RedirectRule] {
        &self.rules
    }

    /// The first rule matching `path`, with its expanded target.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<(&RedirectRule, String)> {
        self.rules
            .iter()
            .find_map(|rule| rule.matches(path).map(|to| (rule, to)))
    }
}

/// What to do after a default-format request missed.
pub(crate) enum Fallback {
    /// Fetch this path instead.
    Rewrite(ImmutablePath),
    /// Send this response.
    Respond(Response<GatewayBody>),
}

/// Apply `_redirects` rules and the legacy not-found page to a failed
/// default-format request. Hands `err` back when nothing applies.
pub(crate) async fn handle_not_found(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
    err: GatewayError,
) -> Result<Fallback, GatewayError> {
    if ctx.format != ResponseFormat::Default || !err.is_not_found() {
        return Err(err);
    }

    if ctx.origin_isolated {
        debug!(path = %path, "applying redirects");
        if let Some(fallback) = apply_redirects(ctx, path).await.map_err(|e| {
            GatewayError::Internal(format!(
                "trouble processing {REDIRECTS_FILE} file at {}: {e}",
                ctx.content_path.root_path().join(REDIRECTS_FILE)
            ))
        })? {
            return Ok(fallback);
        }
    }

    if accepts_html(ctx.accept()) {
        if let Some(response) = legacy_not_found(ctx, path).await {
            debug!(path = %path, "served legacy not-found page");
            return Ok(Fallback::Respond(response));
        }
    }
    Err(err)
}

/// Match `path` against the rules of the site the request's root names.
///
/// A name may point below a CID root, so the site root is the resolved
/// request root rather than the CID alone.
async fn apply_redirects(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Result<Option<Fallback>, GatewayError> {
    let site = ctx
        .backend
        .resolve_mutable(&ctx.content_path.root_path())
        .await?;
    let relative = match path.rest().strip_prefix(site.rest()) {
        Some(rest) if path.root_cid() == site.root_cid() && !rest.is_empty() => {
            format!("/{}", rest.join("/"))
        }
        _ => return Ok(None),
    };
    let Some(rules) = load_rules(ctx, &site).await? else {
        return Ok(None);
    };

    let Some((rule, to)) = rules.find(&relative) else {
        return Ok(None);
    };
    debug!(rule = %rule, path = %relative, to = %to, "matched redirect rule");
    REDIRECT_RULES_APPLIED
        .with_label_values(&[rule.status.as_str()])
        .inc();

    let fallback = match rule.status.as_u16() {
        200 => Fallback::Rewrite(site_path(&site, &to)?),
        404 | 410 | 451 => {
            Fallback::Respond(custom_page(ctx, &site_path(&site, &to)?, rule.status).await?)
        }
        _ => Fallback::Respond(redirect_response(rule.status, &to)),
    };
    Ok(Some(fallback))
}

async fn load_rules(
    ctx: &RequestContext<'_>,
    site: &ImmutablePath,
) -> Result<Option<Redirects>, GatewayError> {
    let rules_path = site.join(REDIRECTS_FILE);
    let file = match ctx.backend.get(&rules_path, &[]).await {
        Ok((_, GetResponse::File(file))) => file,
        Ok((_, GetResponse::Directory(_))) => {
            return Err(GatewayError::Internal(format!(
                "{REDIRECTS_FILE} must be a file"
            )));
        }
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };

    let limit = ctx.config.max_redirects_file_size;
    if file.size > limit {
        return Err(GatewayError::Internal(format!(
            "{REDIRECTS_FILE} file size cannot exceed {limit} bytes"
        )));
    }
    let data = read_to_bytes(file, limit).await?;
    let text = std::str::from_utf8(&data)
        .map_err(|e| GatewayError::Internal(format!("{REDIRECTS_FILE} is not UTF-8: {e}")))?;
    Redirects::parse(text)
        .map(Some)
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Resolve a rule target against the site root, dropping any query.
fn site_path(site: &ImmutablePath, to: &str) -> Result<ImmutablePath, GatewayError> {
    let target = to.split(['?', '#']).next().unwrap_or_default();
    let full = format!("{site}{target}");
    ImmutablePath::try_from(ContentPath::parse(&full)?)
}

async fn custom_page(
    ctx: &RequestContext<'_>,
    page: &ImmutablePath,
    status: StatusCode,
) -> Result<Response<GatewayBody>, GatewayError> {
    let (md, file) = match ctx.backend.get(page, &[]).await? {
        (md, GetResponse::File(file)) => (md, file),
        (_, GetResponse::Directory(_)) => {
            return Err(GatewayError::Internal(format!(
                "could not serve {page} as a {status} page: not a file"
            )));
        }
    };
    html_page(ctx, page.as_content_path(), &md.last_segment.cid, status, file)
}

/// Search from the deepest ancestor of `path` up to its root for the legacy
/// not-found page.
async fn legacy_not_found(
    ctx: &RequestContext<'_>,
    path: &ImmutablePath,
) -> Option<Response<GatewayBody>> {
    let rest = path.rest();
    for depth in (0..=rest.len()).rev() {
        let mut candidate = path.root_path();
        for segment in &rest[..depth] {
            candidate = candidate.join(segment);
        }
        let candidate = candidate.join(LEGACY_NOT_FOUND_FILE);
        if let Ok((md, GetResponse::File(file))) = ctx.backend.get(&candidate, &[]).await {
            return html_page(
                ctx,
                candidate.as_content_path(),
                &md.last_segment.cid,
                StatusCode::NOT_FOUND,
                file,
            )
            .ok();
        }
    }
    None
}

fn html_page(
    ctx: &RequestContext<'_>,
    path: &ContentPath,
    cid: &Cid,
    status: StatusCode,
    file: FileContent,
) -> Result<Response<GatewayBody>, GatewayError> {
    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/html")
        .header(CONTENT_LENGTH, file.size)
        .body(if ctx.is_head {
            GatewayBody::empty()
        } else {
            GatewayBody::from_reader(file.reader)
        })
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    set_cache_headers(
        response.headers_mut(),
        path,
        &etag_for(cid, ResponseFormat::Default),
    );
    Ok(response)
}
